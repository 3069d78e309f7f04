use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shardflow_cdc::testing::{data_batch, member_with_channel, wait_until, RecordingSink};
use shardflow_cdc::{
    AckId, DataRecord, Importer, ImporterConfig, ImporterRegistry, ImporterSink, ImporterState,
    JobOperationType, RateLimiter, Record, WriteResult,
};
use tokio::sync::Notify;

const WAIT: Duration = Duration::from_secs(5);

fn config(needs_ordering: bool) -> ImporterConfig {
    ImporterConfig {
        poll_timeout: Duration::from_millis(5),
        needs_ordering,
        ..ImporterConfig::default()
    }
}

fn with_finish(mut records: Vec<Record>, position: &str) -> Vec<Record> {
    records.push(Record::finished(position));
    records
}

#[tokio::test]
async fn test_equal_csns_dispatch_together_then_drain() {
    let registry = ImporterRegistry::new();
    let (a, a_channel, a_progress) = member_with_channel("ds_a");
    let (b, b_channel, b_progress) = member_with_channel("ds_b");
    a_channel.try_push(data_batch(&[5])).unwrap();
    a_channel
        .try_push(with_finish(data_batch(&[7]), "a-end"))
        .unwrap();
    b_channel
        .try_push(with_finish(data_batch(&[5]), "b-end"))
        .unwrap();

    let sink = Arc::new(RecordingSink::new());
    let importer = Importer::new(config(true), vec![a, b], sink.clone(), None, registry.clone()).unwrap();
    let task = tokio::spawn({
        let importer = Arc::clone(&importer);
        async move { importer.run().await }
    });

    assert!(wait_until(WAIT, || sink.write_count() == 2).await);
    assert_eq!(sink.csns(), vec![vec![5, 5], vec![7]]);
    assert_eq!(importer.in_flight(), 2);

    // Acks arrive out of band, routed by importer id.
    let writes = sink.writes();
    let first = writes[0].ack_id.clone();
    let importer_id = importer.id().to_string();
    let acker = registry.clone();
    tokio::spawn(async move { acker.ack(&importer_id, &first) })
        .await
        .unwrap();

    assert_eq!(a_channel.acked_position().unwrap().as_str(), "csn-5");
    assert_eq!(b_channel.acked_position().unwrap().as_str(), "b-end");
    assert_eq!(importer.live_member_count(), 1);
    assert_eq!(b_progress.processed_records(), 1);

    assert!(registry.ack(importer.id(), &writes[1].ack_id));
    task.await.unwrap().unwrap();

    assert_eq!(a_channel.acked_position().unwrap().as_str(), "a-end");
    assert_eq!(a_progress.processed_records(), 2);
    assert_eq!(importer.state(), ImporterState::Stopped);
    assert_eq!(importer.live_member_count(), 0);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_ordered_dispatch_is_non_decreasing() {
    let registry = ImporterRegistry::new();
    let streams: [(&str, &[i64]); 3] = [
        ("ds_0", &[1, 4, 4, 9, 12]),
        ("ds_1", &[2, 4, 8, 8]),
        ("ds_2", &[3, 3, 10, 11, 13]),
    ];
    let mut members = Vec::new();
    let mut channels = Vec::new();
    let mut total = 0;
    for (name, csns) in streams {
        let (member, channel, _) = member_with_channel(name);
        for &csn in csns {
            channel.try_push(data_batch(&[csn])).unwrap();
        }
        channel.try_push(vec![Record::finished(format!("{name}-end"))]).unwrap();
        total += csns.len();
        members.push(member);
        channels.push((name, channel));
    }

    let sink = Arc::new(RecordingSink::new());
    let importer = Importer::new(config(true), members, sink.clone(), None, registry.clone()).unwrap();
    sink.auto_ack(registry.clone(), importer.id());

    tokio::time::timeout(WAIT, importer.run())
        .await
        .unwrap()
        .unwrap();

    let dispatched: Vec<i64> = sink.csns().into_iter().flatten().collect();
    assert_eq!(dispatched.len(), total);
    assert!(dispatched.windows(2).all(|w| w[0] <= w[1]), "{dispatched:?}");
    for write in sink.csns() {
        assert!(write.iter().all(|&csn| csn == write[0]));
    }
    for (name, channel) in channels {
        assert_eq!(
            channel.acked_position().unwrap().as_str(),
            format!("{name}-end")
        );
    }
    assert_eq!(importer.in_flight(), 0);
    assert_eq!(importer.metrics().control_batches_total, 3);
}

#[tokio::test]
async fn test_independent_finished_only_channel_skips_sink() {
    let (c, c_channel, c_progress) = member_with_channel("ds_c");
    c_channel.try_push(vec![Record::finished("c-end")]).unwrap();

    let sink = Arc::new(RecordingSink::new());
    let importer = Importer::new(
        config(false),
        vec![c],
        sink.clone(),
        None,
        ImporterRegistry::new(),
    )
    .unwrap();
    tokio::time::timeout(WAIT, importer.run())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(sink.write_count(), 0);
    assert_eq!(c_channel.acked_position().unwrap().as_str(), "c-end");
    assert_eq!(c_progress.updates(), 1);
    assert_eq!(c_progress.processed_records(), 0);
    assert_eq!(importer.live_member_count(), 0);
}

#[tokio::test]
async fn test_independent_drain_waits_for_acks() {
    let (a, a_channel, _) = member_with_channel("ds_a");
    let (b, b_channel, _) = member_with_channel("ds_b");
    a_channel
        .try_push(with_finish(data_batch(&[1, 2]), "a-end"))
        .unwrap();
    b_channel
        .try_push(with_finish(data_batch(&[1]), "b-end"))
        .unwrap();

    let sink = Arc::new(RecordingSink::new());
    let importer = Importer::new(
        config(false),
        vec![a, b],
        sink.clone(),
        None,
        ImporterRegistry::new(),
    )
    .unwrap();
    let task = tokio::spawn({
        let importer = Arc::clone(&importer);
        async move { importer.run().await }
    });

    assert!(wait_until(WAIT, || sink.write_count() == 2).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(importer.state(), ImporterState::Running);
    assert_eq!(importer.live_member_count(), 2);

    for write in sink.writes() {
        importer.ack(&write.ack_id);
    }
    task.await.unwrap().unwrap();
    assert_eq!(importer.state(), ImporterState::Stopped);
    assert_eq!(a_channel.acked_position().unwrap().as_str(), "a-end");
    assert_eq!(b_channel.acked_position().unwrap().as_str(), "b-end");
}

#[tokio::test]
async fn test_ack_cache_stays_bounded_without_acks() {
    let (member, channel, _) = member_with_channel("ds_0");
    for csn in 0..10 {
        channel.try_push(data_batch(&[csn])).unwrap();
    }
    let sink = Arc::new(RecordingSink::new());
    let importer = Importer::new(
        ImporterConfig {
            ack_cache_capacity: 4,
            ..config(true)
        },
        vec![member],
        sink.clone(),
        None,
        ImporterRegistry::new(),
    )
    .unwrap();
    let task = tokio::spawn({
        let importer = Arc::clone(&importer);
        async move { importer.run().await }
    });

    assert!(wait_until(WAIT, || sink.write_count() == 10).await);
    assert_eq!(importer.in_flight(), 4);

    // The oldest batches were evicted; their late acks are no-ops.
    let writes = sink.writes();
    importer.ack(&writes[0].ack_id);
    assert!(channel.acked_position().is_none());
    importer.ack(&writes[9].ack_id);
    assert_eq!(channel.acked_position().unwrap().as_str(), "csn-9");

    let metrics = importer.metrics();
    assert_eq!(metrics.unknown_acks_total, 1);
    assert_eq!(metrics.acks_total, 1);

    importer.stop();
    task.await.unwrap().unwrap();
}

#[derive(Default)]
struct CountingLimiter {
    calls: Mutex<Vec<(JobOperationType, usize)>>,
}

#[async_trait]
impl RateLimiter for CountingLimiter {
    async fn intercept(&self, operation: JobOperationType, permits: usize) {
        self.calls.lock().push((operation, permits));
    }
}

#[tokio::test]
async fn test_rate_limiter_intercepts_reads_and_writes() {
    let registry = ImporterRegistry::new();
    let (member, channel, _) = member_with_channel("ds_0");
    channel.try_push(data_batch(&[1])).unwrap();
    channel.try_push(data_batch(&[2])).unwrap();
    channel.try_push(vec![Record::finished("end")]).unwrap();

    let limiter = Arc::new(CountingLimiter::default());
    let sink = Arc::new(RecordingSink::new());
    let importer = Importer::new(
        config(true),
        vec![member],
        sink.clone(),
        Some(limiter.clone() as Arc<dyn RateLimiter>),
        registry.clone(),
    )
    .unwrap();
    sink.auto_ack(registry, importer.id());
    tokio::time::timeout(WAIT, importer.run())
        .await
        .unwrap()
        .unwrap();

    let calls = limiter.calls.lock().clone();
    let writes: Vec<_> = calls.iter().filter(|(op, _)| op.is_write()).collect();
    assert_eq!(
        writes,
        vec![&(JobOperationType::Insert, 1), &(JobOperationType::Insert, 1)]
    );
    // Every round reads before it writes.
    assert_eq!(calls[0], (JobOperationType::Select, 1));
    assert!(calls.iter().filter(|(op, _)| !op.is_write()).count() >= 3);
}

/// Sink whose writes block until released.
#[derive(Default)]
struct GatedSink {
    pending: Mutex<Option<AckId>>,
    release: Notify,
}

#[async_trait]
impl ImporterSink for GatedSink {
    async fn write(
        &self,
        ack_id: &AckId,
        records: Vec<DataRecord>,
    ) -> shardflow_cdc::Result<WriteResult> {
        *self.pending.lock() = Some(ack_id.clone());
        self.release.notified().await;
        Ok(WriteResult::new(records.len()))
    }
}

#[tokio::test]
async fn test_ack_after_stop_is_applied_until_deregistered() {
    let registry = ImporterRegistry::new();
    let (member, channel, progress) = member_with_channel("ds_0");
    channel.try_push(data_batch(&[1, 2])).unwrap();

    let sink = Arc::new(GatedSink::default());
    let importer = Importer::new(config(true), vec![member], sink.clone(), None, registry.clone())
        .unwrap();
    let task = tokio::spawn({
        let importer = Arc::clone(&importer);
        async move { importer.run().await }
    });

    assert!(wait_until(WAIT, || sink.pending.lock().is_some()).await);
    importer.stop();
    let ack_id = sink.pending.lock().clone().unwrap();
    assert!(registry.ack(importer.id(), &ack_id));
    assert_eq!(channel.acked_position().unwrap().as_str(), "csn-2");
    assert_eq!(progress.processed_records(), 2);

    sink.release.notify_one();
    task.await.unwrap().unwrap();
    assert_eq!(importer.state(), ImporterState::Stopped);
    assert!(registry.is_empty());
    assert!(!registry.ack(importer.id(), &ack_id));
}
