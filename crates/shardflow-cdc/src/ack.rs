//! Acknowledgment tracking for in-flight sink batches.
//!
//! Every dispatched batch is recorded in the [`AckCache`] under its
//! [`AckId`] before it is handed to the sink. When the ack arrives the
//! importer takes the entry out and acknowledges each contributing channel
//! up to the batch's last record.
//!
//! The cache is bounded twice: by capacity (least recently used entries are
//! evicted first) and by idle time. Both bounds only exist to keep memory
//! flat when acks are lost; an evicted batch is simply never acknowledged
//! and the channel resumes from its last acknowledged position on restart.

use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::member::ChannelMember;
use crate::record::Record;
use crate::sink::AckId;

/// Default maximum number of in-flight batches.
pub const DEFAULT_ACK_CACHE_CAPACITY: usize = 10_000;

/// Default idle expiry of an unacknowledged batch.
pub const DEFAULT_ACK_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// One channel's contribution to a dispatched batch.
#[derive(Debug, Clone)]
pub struct AckEntry {
    /// Channel member that produced the records.
    pub member: ChannelMember,
    /// Last record taken from the channel for this batch. May be a control
    /// record when the batch ended with one.
    pub last_record: Record,
    /// Number of data records the member contributed.
    pub data_record_count: usize,
}

impl AckEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(member: ChannelMember, last_record: Record, data_record_count: usize) -> Self {
        Self {
            member,
            last_record,
            data_record_count,
        }
    }
}

struct CachedBatch {
    entries: Vec<AckEntry>,
    last_access: Instant,
}

/// Capacity- and idle-time-bounded map from ack id to batch entries.
///
/// All operations take `&self`; the cache is safe to share between the
/// dispatch loop and the tasks delivering acks.
pub struct AckCache {
    ttl: Duration,
    batches: Mutex<LruCache<AckId, CachedBatch>>,
    evictions: AtomicU64,
    // Members that had at least one batch dropped unacknowledged.
    lossy_members: Mutex<HashSet<String>>,
}

impl AckCache {
    /// Creates a cache holding at most `capacity` batches, each expiring
    /// after `ttl` without access. A zero capacity is treated as one.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            batches: Mutex::new(LruCache::new(capacity)),
            evictions: AtomicU64::new(0),
            lossy_members: Mutex::new(HashSet::new()),
        }
    }

    /// Records a dispatched batch.
    ///
    /// Inserting beyond capacity evicts the least recently used batch.
    pub fn put(&self, ack_id: AckId, entries: Vec<AckEntry>) {
        let now = Instant::now();
        let mut batches = self.batches.lock();
        self.purge_expired(&mut batches, now);
        let evicted = batches.push(
            ack_id.clone(),
            CachedBatch {
                entries,
                last_access: now,
            },
        );
        if let Some((evicted_id, evicted_batch)) = evicted {
            if evicted_id != ack_id {
                self.record_eviction(&evicted_batch);
                debug!(ack_id = %evicted_id, "ack cache full, evicted unacknowledged batch");
            }
        }
    }

    /// Returns a copy of the entries for `ack_id` and refreshes its idle timer.
    #[must_use]
    pub fn get(&self, ack_id: &AckId) -> Option<Vec<AckEntry>> {
        let now = Instant::now();
        let mut batches = self.batches.lock();
        self.purge_expired(&mut batches, now);
        batches.get_mut(ack_id).map(|batch| {
            batch.last_access = now;
            batch.entries.clone()
        })
    }

    /// Removes and returns the entries for `ack_id`.
    ///
    /// Of several concurrent callers for the same id, at most one gets the
    /// entries.
    #[must_use]
    pub fn take(&self, ack_id: &AckId) -> Option<Vec<AckEntry>> {
        let now = Instant::now();
        let mut batches = self.batches.lock();
        self.purge_expired(&mut batches, now);
        batches.pop(ack_id).map(|batch| batch.entries)
    }

    /// Drops the entry for `ack_id`. Returns `true` if it was present.
    pub fn invalidate(&self, ack_id: &AckId) -> bool {
        self.batches.lock().pop(ack_id).is_some()
    }

    /// Returns `true` if a live batch has records from `member`.
    #[must_use]
    pub fn references(&self, member: &ChannelMember) -> bool {
        let mut batches = self.batches.lock();
        self.purge_expired(&mut batches, Instant::now());
        batches
            .iter()
            .any(|(_, batch)| batch.entries.iter().any(|e| e.member == *member))
    }

    /// Returns `true` if a batch with records from `member` was ever dropped
    /// by expiry or capacity eviction.
    #[must_use]
    pub fn has_evicted(&self, member: &ChannelMember) -> bool {
        self.lossy_members.lock().contains(member.name())
    }

    /// Number of live (unexpired) batches.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut batches = self.batches.lock();
        self.purge_expired(&mut batches, Instant::now());
        batches.len()
    }

    /// Returns `true` if no batch is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.batches.lock().cap().get()
    }

    /// Number of batches dropped by expiry or capacity eviction.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    // LRU order equals last-access order, so expired batches are always at
    // the cold end.
    fn purge_expired(&self, batches: &mut LruCache<AckId, CachedBatch>, now: Instant) {
        while let Some((_, batch)) = batches.peek_lru() {
            if now.duration_since(batch.last_access) < self.ttl {
                break;
            }
            if let Some((ack_id, batch)) = batches.pop_lru() {
                self.record_eviction(&batch);
                debug!(%ack_id, "ack cache entry expired");
            }
        }
    }

    fn record_eviction(&self, batch: &CachedBatch) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.lossy_members
            .lock()
            .extend(batch.entries.iter().map(|e| e.member.name().to_string()));
    }
}

impl Default for AckCache {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_CACHE_CAPACITY, DEFAULT_ACK_CACHE_TTL)
    }
}

impl fmt::Debug for AckCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckCache")
            .field("ttl", &self.ttl)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("evictions", &self.evictions())
            .finish()
    }
}
