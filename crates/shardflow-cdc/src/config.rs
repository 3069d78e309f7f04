//! Importer configuration.
//!
//! - [`JobConfig`]: raw string key/value properties of one import job, as
//!   loaded from a job file or handed over by a scheduler
//! - [`ImporterConfig`]: typed importer settings parsed from a [`JobConfig`]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::ack::{DEFAULT_ACK_CACHE_CAPACITY, DEFAULT_ACK_CACHE_TTL};
use crate::error::{ImporterError, Result};
use crate::rate_limit::{QpsRateLimiter, RateLimiter, TpsRateLimiter};

/// Raw configuration of one import job.
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    job_name: String,
    properties: HashMap<String, String>,
}

impl JobConfig {
    /// Creates an empty config for the named job.
    #[must_use]
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            properties: HashMap::new(),
        }
    }

    /// Creates a config from existing properties.
    #[must_use]
    pub fn with_properties(job_name: impl Into<String>, properties: HashMap<String, String>) -> Self {
        Self {
            job_name: job_name.into(),
            properties,
        }
    }

    /// Returns the job name.
    #[must_use]
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Sets a property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Gets a property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Gets a property parsed as the given type.
    ///
    /// # Errors
    ///
    /// Returns `ImporterError::ConfigurationError` if the value cannot be parsed.
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>>
    where
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(v) => v.trim().parse::<T>().map(Some).map_err(|e| {
                ImporterError::ConfigurationError(format!("invalid value for '{key}': {e}"))
            }),
            None => Ok(None),
        }
    }

    /// Returns all properties.
    #[must_use]
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }
}

/// Typed importer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImporterConfig {
    /// Records fetched per channel and round in independent mode.
    pub batch_size: usize,

    /// Idle sleep between empty rounds; also the fetch timeout in
    /// independent mode.
    pub poll_timeout: Duration,

    /// Maximum number of unacknowledged batches kept for ack matching.
    pub ack_cache_capacity: usize,

    /// Idle time after which an unacknowledged batch is forgotten.
    pub ack_cache_ttl: Duration,

    /// Reconstruct global commit order across channels.
    pub needs_ordering: bool,

    /// Maximum sink writes per second.
    pub rate_limit_tps: Option<usize>,

    /// Maximum channel reads (merge rounds or fetches) per second.
    pub rate_limit_qps: Option<usize>,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            poll_timeout: Duration::from_millis(100),
            ack_cache_capacity: DEFAULT_ACK_CACHE_CAPACITY,
            ack_cache_ttl: DEFAULT_ACK_CACHE_TTL,
            needs_ordering: true,
            rate_limit_tps: None,
            rate_limit_qps: None,
        }
    }
}

impl ImporterConfig {
    /// Parses importer settings from job properties.
    ///
    /// Recognized keys: `batch.size`, `poll.timeout.ms`,
    /// `ack.cache.capacity`, `ack.cache.ttl.ms`, `needs.ordering`,
    /// `rate.limit.tps`, `rate.limit.qps`. Unset keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ImporterError::ConfigurationError` for unparsable or
    /// out-of-range values.
    pub fn from_config(config: &JobConfig) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(size) = config.get_parsed::<usize>("batch.size")? {
            cfg.batch_size = size;
        }
        if let Some(timeout) = config.get_parsed::<u64>("poll.timeout.ms")? {
            cfg.poll_timeout = Duration::from_millis(timeout);
        }
        if let Some(capacity) = config.get_parsed::<usize>("ack.cache.capacity")? {
            cfg.ack_cache_capacity = capacity;
        }
        if let Some(ttl) = config.get_parsed::<u64>("ack.cache.ttl.ms")? {
            cfg.ack_cache_ttl = Duration::from_millis(ttl);
        }
        if let Some(ordering) = config.get_parsed::<bool>("needs.ordering")? {
            cfg.needs_ordering = ordering;
        }
        cfg.rate_limit_tps = config.get_parsed::<usize>("rate.limit.tps")?;
        cfg.rate_limit_qps = config.get_parsed::<usize>("rate.limit.qps")?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ImporterError::ConfigurationError` if a value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ImporterError::ConfigurationError(
                "batch.size must be > 0".to_string(),
            ));
        }
        if self.ack_cache_capacity == 0 {
            return Err(ImporterError::ConfigurationError(
                "ack.cache.capacity must be > 0".to_string(),
            ));
        }
        if self.ack_cache_ttl.is_zero() {
            return Err(ImporterError::ConfigurationError(
                "ack.cache.ttl.ms must be > 0".to_string(),
            ));
        }
        if self.rate_limit_tps == Some(0) || self.rate_limit_qps == Some(0) {
            return Err(ImporterError::ConfigurationError(
                "rate limits must be > 0 when set".to_string(),
            ));
        }
        if self.rate_limit_tps.is_some() && self.rate_limit_qps.is_some() {
            return Err(ImporterError::ConfigurationError(
                "rate.limit.tps and rate.limit.qps are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the configured rate limiter, if any.
    #[must_use]
    pub fn rate_limiter(&self) -> Option<Arc<dyn RateLimiter>> {
        if let Some(tps) = self.rate_limit_tps {
            return Some(Arc::new(TpsRateLimiter::new(tps)));
        }
        self.rate_limit_qps
            .map(|qps| Arc::new(QpsRateLimiter::new(qps)) as Arc<dyn RateLimiter>)
    }
}
