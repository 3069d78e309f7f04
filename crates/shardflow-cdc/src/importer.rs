//! Importer orchestration.
//!
//! An [`Importer`] owns a fixed set of channel members and drives them to
//! completion: each loop iteration runs either one CSN merge round (ordered
//! mode) or one fetch per member (independent mode), hands the resulting
//! batches to the sink and waits for acks to advance the channels.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──run()──▶ Running ──all members retired / stop()──▶ Stopped
//!                       │
//!                       └──── write error / invariant violation ──▶ Failed
//! ```
//!
//! While running, the importer is registered in its [`ImporterRegistry`]
//! under [`Importer::id`], so acks arriving on other tasks can reach it. It
//! is deregistered when `run` returns or its future is dropped.
//!
//! A member whose stream ended is not polled again, but it is only retired
//! once none of its batches is waiting for an ack. Its end-of-stream record
//! is acknowledged at that point, unless one of its batches expired
//! unacknowledged: then the checkpoint stays where the last ack left it.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::ack::AckCache;
use crate::config::ImporterConfig;
use crate::error::{ImporterError, Result};
use crate::independent::{FetchedBatch, IndependentDispatcher};
use crate::member::ChannelMember;
use crate::metrics::{ImporterMetrics, ImporterMetricsSnapshot};
use crate::ordering::{ControlBatch, DispatchBatch, OrderingEngine};
use crate::rate_limit::{JobOperationType, RateLimiter};
use crate::record::Record;
use crate::registry::ImporterRegistry;
use crate::sink::{AckId, ImporterSink};

/// Lifecycle state of an importer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImporterState {
    /// Created but not yet running.
    Created,

    /// Dispatch loop is running.
    Running,

    /// Loop ended normally: every channel finished, stop was requested or
    /// the run was cancelled.
    Stopped,

    /// Loop ended with an error.
    Failed,
}

impl fmt::Display for ImporterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImporterState::Created => write!(f, "Created"),
            ImporterState::Running => write!(f, "Running"),
            ImporterState::Stopped => write!(f, "Stopped"),
            ImporterState::Failed => write!(f, "Failed"),
        }
    }
}

// A member that reached its end of stream, waiting for its in-flight
// batches to be acknowledged.
struct Finishing {
    member: ChannelMember,
    end: Option<Record>,
}

/// Dispatches records from a set of channels to one sink.
pub struct Importer {
    id: String,
    config: ImporterConfig,
    members: Mutex<Vec<ChannelMember>>,
    finishing: Mutex<Vec<Finishing>>,
    sink: Arc<dyn ImporterSink>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    registry: ImporterRegistry,
    ack_cache: AckCache,
    state: RwLock<ImporterState>,
    stop_requested: AtomicBool,
    wakeup: Notify,
    metrics: ImporterMetrics,
}

impl Importer {
    /// Creates an importer over `members`.
    ///
    /// Without an explicit `rate_limiter`, the one described by `config`
    /// (if any) is used.
    ///
    /// # Errors
    ///
    /// Returns `ImporterError::ConfigurationError` if two members share a
    /// name.
    pub fn new(
        config: ImporterConfig,
        members: Vec<ChannelMember>,
        sink: Arc<dyn ImporterSink>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
        registry: ImporterRegistry,
    ) -> Result<Arc<Self>> {
        {
            let mut names = HashSet::with_capacity(members.len());
            if let Some(duplicate) = members.iter().find(|m| !names.insert(m.name())) {
                return Err(ImporterError::ConfigurationError(format!(
                    "duplicate channel member '{}'",
                    duplicate.name()
                )));
            }
        }
        let rate_limiter = rate_limiter.or_else(|| config.rate_limiter());
        let ack_cache = AckCache::new(config.ack_cache_capacity, config.ack_cache_ttl);
        Ok(Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            members: Mutex::new(members),
            finishing: Mutex::new(Vec::new()),
            sink,
            rate_limiter,
            registry,
            ack_cache,
            state: RwLock::new(ImporterState::Created),
            stop_requested: AtomicBool::new(false),
            wakeup: Notify::new(),
            metrics: ImporterMetrics::new(),
        }))
    }

    /// Random id the importer registers under.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Importer settings.
    #[must_use]
    pub fn config(&self) -> &ImporterConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ImporterState {
        *self.state.read()
    }

    /// Number of members not retired yet, including those whose stream
    /// ended but still have batches in flight.
    #[must_use]
    pub fn live_member_count(&self) -> usize {
        let members = self.members.lock();
        members.len() + self.finishing.lock().len()
    }

    /// Number of dispatched batches still waiting for an ack.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.ack_cache.len()
    }

    /// Returns a snapshot of the importer's metrics.
    #[must_use]
    pub fn metrics(&self) -> ImporterMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Runs the dispatch loop until every member is retired or
    /// [`stop`](Self::stop) is called.
    ///
    /// Dropping the returned future deregisters the importer and leaves it
    /// `Stopped`.
    ///
    /// # Errors
    ///
    /// Returns `ImporterError::InvalidState` if the importer was already
    /// started, `ImporterError::WriteError` if the sink rejected a batch, or
    /// `ImporterError::MissingDataRecord` if the merge hit a batch without
    /// data.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != ImporterState::Created {
                return Err(ImporterError::InvalidState {
                    expected: ImporterState::Created.to_string(),
                    actual: state.to_string(),
                });
            }
            *state = ImporterState::Running;
        }
        self.registry.put(self.id.clone(), Arc::clone(self));
        let guard = RunGuard { importer: self };
        info!(
            importer_id = %self.id,
            members = self.live_member_count(),
            ordered = self.config.needs_ordering,
            "importer started"
        );

        let result = self.dispatch_loop().await;
        guard.complete(&result);
        result
    }

    /// Requests the dispatch loop to stop after the current iteration.
    ///
    /// Wakes an idle loop immediately. Calling it again has no effect.
    pub fn stop(&self) {
        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            info!(importer_id = %self.id, "importer stop requested");
        }
        self.wakeup.notify_one();
    }

    /// Acknowledges a dispatched batch.
    ///
    /// Acks each contributing channel up to the batch's last record and
    /// reports progress. Members whose stream ended are retired once nothing
    /// of theirs is in flight. Unknown, expired or already acknowledged ids
    /// are logged and ignored.
    pub fn ack(&self, ack_id: &AckId) {
        let Some(entries) = self.ack_cache.take(ack_id) else {
            self.metrics.record_unknown_ack();
            warn!(importer_id = %self.id, %ack_id, "ack for unknown or expired batch");
            return;
        };
        self.metrics.record_ack();
        debug!(importer_id = %self.id, %ack_id, channels = entries.len(), "batch acknowledged");
        for entry in entries {
            entry
                .member
                .channel()
                .ack(std::slice::from_ref(&entry.last_record));
            entry
                .member
                .listener()
                .on_progress_updated(entry.data_record_count);
            if entry.last_record.is_finished() {
                self.finish(&entry.member, None);
            }
        }
        self.settle();
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn live_members(&self) -> Vec<ChannelMember> {
        self.members.lock().clone()
    }

    fn is_drained(&self) -> bool {
        let members = self.members.lock();
        members.is_empty() && self.finishing.lock().is_empty()
    }

    /// Stops polling `member`. `end` is acknowledged when the member retires.
    fn finish(&self, member: &ChannelMember, end: Option<Record>) {
        {
            let mut members = self.members.lock();
            let before = members.len();
            members.retain(|m| m != member);
            if members.len() == before {
                return;
            }
            // Pushed under the members lock so `is_drained` never sees the
            // member in neither list.
            self.finishing.lock().push(Finishing {
                member: member.clone(),
                end,
            });
        }
        debug!(importer_id = %self.id, member = member.name(), "channel reached end of stream");
        self.settle();
    }

    /// Retires finishing members that have nothing left in flight.
    fn settle(&self) {
        let retired: Vec<String> = {
            let mut finishing = self.finishing.lock();
            let mut retired = Vec::new();
            finishing.retain(|f| {
                if self.ack_cache.references(&f.member) {
                    return true;
                }
                if let Some(end) = &f.end {
                    if self.ack_cache.has_evicted(&f.member) {
                        warn!(
                            importer_id = %self.id,
                            member = f.member.name(),
                            "channel finished with unacknowledged batches, end not acknowledged"
                        );
                    } else {
                        f.member.channel().ack(std::slice::from_ref(end));
                    }
                }
                retired.push(f.member.name().to_string());
                false
            });
            retired
        };
        if retired.is_empty() {
            return;
        }
        for member in &retired {
            info!(importer_id = %self.id, member = member.as_str(), "channel finished");
        }
        self.wakeup.notify_one();
    }

    async fn dispatch_loop(&self) -> Result<()> {
        let mut engine = OrderingEngine::new();
        let independent =
            IndependentDispatcher::new(self.config.batch_size, self.config.poll_timeout);
        loop {
            if self.is_stop_requested() {
                return Ok(());
            }
            // Expired batches release finishing members here.
            self.settle();
            if self.is_drained() {
                return Ok(());
            }
            let members = self.live_members();
            if members.is_empty() {
                self.idle().await;
                continue;
            }
            if self.config.needs_ordering {
                if !self.ordered_round(&mut engine, &members).await? {
                    self.idle().await;
                }
            } else {
                self.independent_round(&independent, &members).await?;
            }
        }
    }

    async fn intercept(&self, operation: JobOperationType) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.intercept(operation, 1).await;
        }
    }

    /// Returns `false` if the round found nothing to do.
    async fn ordered_round(
        &self,
        engine: &mut OrderingEngine,
        members: &[ChannelMember],
    ) -> Result<bool> {
        self.intercept(JobOperationType::Select).await;
        let round = engine.next_round(members)?;
        let mut active = !round.control.is_empty();
        for control in round.control {
            self.handle_control_batch(control);
        }
        if let Some(batch) = DispatchBatch::from_groups(round.groups) {
            self.dispatch(batch).await?;
            active = true;
        }
        Ok(active)
    }

    async fn independent_round(
        &self,
        dispatcher: &IndependentDispatcher,
        members: &[ChannelMember],
    ) -> Result<()> {
        for member in members {
            self.intercept(JobOperationType::Select).await;
            match dispatcher.fetch(member).await? {
                FetchedBatch::Empty => {}
                FetchedBatch::Control(control) => self.handle_control_batch(control),
                FetchedBatch::Data(batch) => self.dispatch(batch).await?,
            }
        }
        Ok(())
    }

    fn handle_control_batch(&self, control: ControlBatch) {
        self.metrics.record_control_batch();
        control.member.listener().on_progress_updated(0);
        if let Some(end) = control.finished {
            self.finish(&control.member, Some(end));
        }
    }

    async fn dispatch(&self, batch: DispatchBatch) -> Result<()> {
        self.intercept(JobOperationType::Insert).await;
        let ack_id = AckId::generate();
        let record_count = batch.records.len();
        debug!(
            importer_id = %self.id,
            %ack_id,
            csn = batch.csn,
            channels = batch.entries.len(),
            records = record_count,
            "dispatching batch"
        );
        // Cached before the write so an ack racing the write finds it.
        self.ack_cache.put(ack_id.clone(), batch.entries);
        match self.sink.write(&ack_id, batch.records).await {
            Ok(_) => {
                self.metrics.record_dispatch(record_count as u64);
                Ok(())
            }
            Err(e) => {
                self.ack_cache.invalidate(&ack_id);
                self.metrics.record_write_error();
                error!(importer_id = %self.id, %ack_id, error = %e, "sink write failed");
                Err(e)
            }
        }
    }

    async fn idle(&self) {
        tokio::select! {
            () = tokio::time::sleep(self.config.poll_timeout) => {}
            () = self.wakeup.notified() => {}
        }
    }
}

impl fmt::Debug for Importer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Importer")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("live_members", &self.live_member_count())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Deregisters a running importer when `run` returns or is cancelled.
struct RunGuard<'a> {
    importer: &'a Importer,
}

impl RunGuard<'_> {
    fn complete(self, result: &Result<()>) {
        let importer = self.importer;
        match result {
            Ok(()) => {
                *importer.state.write() = ImporterState::Stopped;
                info!(importer_id = %importer.id, "importer stopped");
            }
            Err(e) => {
                *importer.state.write() = ImporterState::Failed;
                error!(importer_id = %importer.id, error = %e, "importer failed");
            }
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let importer = self.importer;
        importer.registry.remove(&importer.id);
        let mut state = importer.state.write();
        if *state == ImporterState::Running {
            *state = ImporterState::Stopped;
            warn!(importer_id = %importer.id, "importer run cancelled");
        }
    }
}
