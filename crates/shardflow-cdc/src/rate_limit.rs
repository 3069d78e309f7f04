//! Write throttling for dispatched batches.
//!
//! The importer calls [`RateLimiter::intercept`] with
//! [`JobOperationType::Select`] before reading from its channels and with
//! [`JobOperationType::Insert`] before every sink write. Limiters decide per
//! operation type whether to throttle: a TPS limiter only slows down writes,
//! a QPS limiter only slows down reads.

// Token accounting uses f64 for fractional refill; precision loss on
// usize -> f64 is irrelevant at these magnitudes.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

// Slowest refill accepted; keeps the wait between attempts finite.
const MIN_RATE: f64 = 1e-3;

// Upper bound on one wait for a token.
const MAX_WAIT: Duration = Duration::from_secs(1);

/// Kind of operation being throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobOperationType {
    /// Row insert.
    Insert,
    /// Row update.
    Update,
    /// Row delete.
    Delete,
    /// Read query.
    Select,
}

impl JobOperationType {
    /// Returns `true` for operations that modify data.
    #[must_use]
    pub fn is_write(self) -> bool {
        !matches!(self, JobOperationType::Select)
    }
}

impl fmt::Display for JobOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOperationType::Insert => write!(f, "INSERT"),
            JobOperationType::Update => write!(f, "UPDATE"),
            JobOperationType::Delete => write!(f, "DELETE"),
            JobOperationType::Select => write!(f, "SELECT"),
        }
    }
}

/// Throttles operations, possibly by waiting.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Waits until `permits` operations of the given type may proceed.
    async fn intercept(&self, operation: JobOperationType, permits: usize);
}

/// Token bucket shared by the concrete limiters.
///
/// Tokens are added at a fixed rate up to a maximum capacity. Clones share
/// the same bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    capacity: usize,
    state: Arc<Mutex<TokenBucketState>>,
}

#[derive(Debug)]
struct TokenBucketState {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// Creates a bucket refilled at `rate` tokens per second, holding at most
    /// `capacity` tokens. Rates below one token per thousand seconds
    /// (including zero and NaN) are raised to that minimum.
    #[must_use]
    pub fn new(rate: f64, capacity: usize) -> Self {
        Self {
            rate: rate.max(MIN_RATE),
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(TokenBucketState {
                tokens: capacity.max(1) as f64,
                last_update: Instant::now(),
            })),
        }
    }

    /// Creates a bucket whose burst is one second worth of tokens.
    #[must_use]
    pub fn per_second(rate_per_second: usize) -> Self {
        let rate = rate_per_second.max(1);
        Self::new(rate as f64, rate)
    }

    fn refill(&self, state: &mut TokenBucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity as f64);
        state.last_update = now;
    }

    /// Takes one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Waits until one token is available and takes it.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let wait = Duration::from_secs_f64(1.0 / self.rate).min(MAX_WAIT);
            tokio::time::sleep(wait).await;
        }
    }

    /// Returns the current number of whole tokens.
    #[must_use]
    pub fn available(&self) -> usize {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens as usize
    }
}

/// Throttles write operations to a maximum number of transactions per second.
#[derive(Debug, Clone)]
pub struct TpsRateLimiter {
    bucket: TokenBucket,
}

impl TpsRateLimiter {
    /// Creates a limiter allowing `tps` write permits per second.
    #[must_use]
    pub fn new(tps: usize) -> Self {
        Self {
            bucket: TokenBucket::per_second(tps),
        }
    }
}

#[async_trait]
impl RateLimiter for TpsRateLimiter {
    async fn intercept(&self, operation: JobOperationType, permits: usize) {
        if !operation.is_write() {
            return;
        }
        for _ in 0..permits {
            self.bucket.acquire().await;
        }
    }
}

/// Throttles read operations to a maximum number of queries per second.
#[derive(Debug, Clone)]
pub struct QpsRateLimiter {
    bucket: TokenBucket,
}

impl QpsRateLimiter {
    /// Creates a limiter allowing `qps` read permits per second.
    #[must_use]
    pub fn new(qps: usize) -> Self {
        Self {
            bucket: TokenBucket::per_second(qps),
        }
    }
}

#[async_trait]
impl RateLimiter for QpsRateLimiter {
    async fn intercept(&self, operation: JobOperationType, permits: usize) {
        if operation.is_write() {
            return;
        }
        for _ in 0..permits {
            self.bucket.acquire().await;
        }
    }
}
