//! CSN merge across channels.
//!
//! Each channel delivers batches in its own commit order, but the channels
//! are independent: shard A may be far ahead of shard B. The
//! [`OrderingEngine`] rebuilds one global order by repeatedly selecting the
//! batches that share the smallest commit sequence number (CSN) currently
//! known, without a central sequencer.
//!
//! # Algorithm
//!
//! The engine keeps a min-heap of [`CsnGroup`]s, at most one per channel,
//! carried over between rounds. Each round:
//!
//! 1. **Refill.** With an empty heap, poll every channel's head batch. With a
//!    non-empty heap, peek the head of every channel that has no group on the
//!    heap and admit it only if its CSN is not greater than the heap minimum.
//!    A channel may hold an older commit than anything seen so far, so it has
//!    to be admitted before the minimum is dispatched.
//! 2. **Select.** Pop the minimum, then keep popping while the next minimum
//!    has the same CSN.
//!
//! CSNs are not guaranteed unique per transaction for every upstream, so
//! equal CSNs from different channels are dispatched together as one unit
//! rather than in an arbitrary total order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use tracing::{debug, trace};

use crate::ack::AckEntry;
use crate::error::{ImporterError, Result};
use crate::member::ChannelMember;
use crate::record::{self, Csn, DataRecord, Record};

/// Batch of one channel's records keyed by the CSN of its first data record.
pub struct CsnGroup {
    /// CSN of the first data record.
    pub csn: Csn,
    /// Channel member the records came from.
    pub member: ChannelMember,
    /// Records in channel order, control records included.
    pub records: Vec<Record>,
    seq: u64,
}

impl CsnGroup {
    fn new(member: ChannelMember, records: Vec<Record>, seq: u64) -> Result<Self> {
        let csn = record::first_data_record(&records)
            .map(|r| r.csn)
            .ok_or_else(|| ImporterError::MissingDataRecord {
                member: member.name().to_string(),
            })?;
        Ok(Self {
            csn,
            member,
            records,
            seq,
        })
    }

    /// Number of data records in the group.
    #[must_use]
    pub fn data_record_count(&self) -> usize {
        record::count_data_records(&self.records)
    }
}

impl PartialEq for CsnGroup {
    fn eq(&self, other: &Self) -> bool {
        self.csn == other.csn && self.seq == other.seq
    }
}

impl Eq for CsnGroup {}

impl Ord for CsnGroup {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior; ties go to the earlier insertion.
        other
            .csn
            .cmp(&self.csn)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for CsnGroup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for CsnGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsnGroup")
            .field("csn", &self.csn)
            .field("member", &self.member.name())
            .field("records", &self.records.len())
            .finish()
    }
}

/// Batch without data records.
///
/// Batches that do not end the stream are acknowledged on their channel when
/// built. The end-of-stream record is handed back unacknowledged: the
/// importer acks it once the member has no batch left in flight.
#[derive(Debug, Clone)]
pub struct ControlBatch {
    /// Member the batch came from.
    pub member: ChannelMember,
    /// End-of-stream record, if the batch ended the member's stream.
    pub finished: Option<Record>,
}

impl ControlBatch {
    pub(crate) fn new(member: &ChannelMember, mut records: Vec<Record>) -> Self {
        let finished = if records.last().is_some_and(Record::is_finished) {
            debug!(member = member.name(), "channel finished without trailing data");
            records.pop()
        } else {
            member.channel().ack(&records);
            None
        };
        Self {
            member: member.clone(),
            finished,
        }
    }
}

/// Outcome of one merge round.
#[derive(Debug, Default)]
pub struct MergeRound {
    /// Groups sharing the round's minimal CSN, in heap order.
    pub groups: Vec<CsnGroup>,
    /// Control-only batches met while refilling.
    pub control: Vec<ControlBatch>,
}

impl MergeRound {
    /// Returns `true` if the round produced nothing to dispatch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Records and ack entries of one atomic sink write.
#[derive(Debug)]
pub struct DispatchBatch {
    /// CSN shared by every group of the batch.
    pub csn: Csn,
    /// One entry per contributing channel.
    pub entries: Vec<AckEntry>,
    /// Data records of all groups, each group in channel order.
    pub records: Vec<DataRecord>,
}

impl DispatchBatch {
    /// Builds the sink batch for one member's records.
    ///
    /// # Errors
    ///
    /// Returns `ImporterError::MissingDataRecord` if `records` holds no data
    /// record.
    pub fn from_member(member: ChannelMember, records: Vec<Record>) -> Result<Self> {
        let group = CsnGroup::new(member, records, 0)?;
        let name = group.member.name().to_string();
        Self::from_groups(vec![group])
            .ok_or_else(|| ImporterError::MissingDataRecord { member: name })
    }

    /// Builds the sink batch for a round's groups.
    ///
    /// Returns `None` for an empty round.
    #[must_use]
    pub fn from_groups(groups: Vec<CsnGroup>) -> Option<Self> {
        let csn = groups.first()?.csn;
        let mut entries = Vec::with_capacity(groups.len());
        let mut records = Vec::new();
        for group in groups {
            let data_record_count = group.data_record_count();
            let CsnGroup {
                member,
                records: group_records,
                ..
            } = group;
            let Some(last_record) = group_records.last().cloned() else {
                continue;
            };
            entries.push(AckEntry::new(member, last_record, data_record_count));
            records.extend(record::into_data_records(group_records));
        }
        Some(Self {
            csn,
            entries,
            records,
        })
    }
}

/// Stateful CSN merge. Owned by a single dispatch loop.
#[derive(Default)]
pub struct OrderingEngine {
    heap: BinaryHeap<CsnGroup>,
    next_seq: u64,
}

impl OrderingEngine {
    /// Creates an engine with an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups carried over between rounds.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.heap.len()
    }

    /// Smallest CSN currently pending.
    #[must_use]
    pub fn oldest_csn(&self) -> Option<Csn> {
        self.heap.peek().map(|g| g.csn)
    }

    /// Runs one merge round over the live members.
    ///
    /// # Errors
    ///
    /// Returns `ImporterError::MissingDataRecord` if a batch admitted to the
    /// heap has no data record.
    pub fn next_round(&mut self, members: &[ChannelMember]) -> Result<MergeRound> {
        let mut round = MergeRound::default();
        self.refill(members, &mut round.control)?;

        let Some(first) = self.heap.pop() else {
            return Ok(round);
        };
        let target = first.csn;
        round.groups.push(first);
        for _ in 1..members.len() {
            match self.heap.peek() {
                Some(group) if group.csn == target => {
                    if let Some(group) = self.heap.pop() {
                        round.groups.push(group);
                    }
                }
                _ => break,
            }
        }
        trace!(
            csn = target,
            groups = round.groups.len(),
            pending = self.heap.len(),
            "merge round selected"
        );
        Ok(round)
    }

    fn refill(
        &mut self,
        members: &[ChannelMember],
        control: &mut Vec<ControlBatch>,
    ) -> Result<()> {
        let Some(oldest_csn) = self.oldest_csn() else {
            for member in members {
                let records = member.channel().poll();
                if records.is_empty() {
                    continue;
                }
                if record::first_data_record(&records).is_none() {
                    control.push(ControlBatch::new(member, records));
                    continue;
                }
                self.push(member.clone(), records)?;
            }
            return Ok(());
        };

        for member in members {
            if self.is_pending(member) {
                continue;
            }
            let peeked = member.channel().peek();
            if peeked.is_empty() {
                continue;
            }
            match record::first_data_record(&peeked) {
                None => {
                    let records = member.channel().poll();
                    control.push(ControlBatch::new(member, records));
                }
                Some(head) if head.csn <= oldest_csn => {
                    let records = member.channel().poll();
                    self.push(member.clone(), records)?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn push(&mut self, member: ChannelMember, records: Vec<Record>) -> Result<()> {
        let group = CsnGroup::new(member, records, self.next_seq)?;
        self.next_seq += 1;
        self.heap.push(group);
        Ok(())
    }

    fn is_pending(&self, member: &ChannelMember) -> bool {
        self.heap.iter().any(|g| g.member == *member)
    }
}

impl fmt::Debug for OrderingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderingEngine")
            .field("pending", &self.heap.len())
            .field("oldest_csn", &self.oldest_csn())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::channel::{MemoryPipelineChannel, PipelineChannel};
    use crate::progress::IncrementalProgress;
    use crate::record::RowOperation;

    fn member(name: &str, channel: &Arc<MemoryPipelineChannel>) -> ChannelMember {
        let channel: Arc<dyn PipelineChannel> = Arc::clone(channel) as Arc<dyn PipelineChannel>;
        ChannelMember::new(name, channel, Arc::new(IncrementalProgress::new()))
    }

    fn data(csn: Csn) -> Record {
        Record::data(csn, "t_order", RowOperation::Insert)
    }

    fn channel_with(batches: Vec<Vec<Record>>) -> Arc<MemoryPipelineChannel> {
        let channel = Arc::new(MemoryPipelineChannel::new(16));
        for batch in batches {
            channel.try_push(batch).unwrap();
        }
        channel
    }

    fn csns(round: &MergeRound) -> Vec<Csn> {
        round.groups.iter().map(|g| g.csn).collect()
    }

    #[test]
    fn test_equal_csns_are_grouped() {
        let a = channel_with(vec![vec![data(5)], vec![data(7)]]);
        let b = channel_with(vec![vec![data(5)]]);
        let members = vec![member("a", &a), member("b", &b)];
        let mut engine = OrderingEngine::new();

        let round = engine.next_round(&members).unwrap();
        assert_eq!(csns(&round), vec![5, 5]);
        assert_eq!(engine.pending(), 0);

        let round = engine.next_round(&members).unwrap();
        assert_eq!(csns(&round), vec![7]);
        assert_eq!(round.groups[0].member.name(), "a");

        assert!(engine.next_round(&members).unwrap().is_empty());
    }

    #[test]
    fn test_lagging_channel_is_admitted_before_dispatch() {
        // a's head is 10; c only shows up with 3 after the heap is seeded.
        let a = channel_with(vec![vec![data(10)]]);
        let b = channel_with(vec![vec![data(20)]]);
        let c = Arc::new(MemoryPipelineChannel::new(16));
        let members = vec![member("a", &a), member("b", &b), member("c", &c)];
        let mut engine = OrderingEngine::new();

        assert_eq!(csns(&engine.next_round(&members).unwrap()), vec![10]);
        assert_eq!(engine.oldest_csn(), Some(20));

        c.try_push(vec![data(3)]).unwrap();
        a.try_push(vec![data(25)]).unwrap();

        assert_eq!(csns(&engine.next_round(&members).unwrap()), vec![3]);
        assert_eq!(csns(&engine.next_round(&members).unwrap()), vec![20]);
        assert_eq!(csns(&engine.next_round(&members).unwrap()), vec![25]);
    }

    #[test]
    fn test_newer_heads_wait_while_heap_has_older_groups() {
        let a = channel_with(vec![vec![data(1)], vec![data(2)]]);
        let b = channel_with(vec![vec![data(4)]]);
        let members = vec![member("a", &a), member("b", &b)];
        let mut engine = OrderingEngine::new();

        assert_eq!(csns(&engine.next_round(&members).unwrap()), vec![1]);
        // b (4) stays pending, a's next head (2) is admitted.
        assert_eq!(csns(&engine.next_round(&members).unwrap()), vec![2]);
        assert_eq!(csns(&engine.next_round(&members).unwrap()), vec![4]);
    }

    #[test]
    fn test_peeked_head_greater_than_minimum_is_left_in_channel() {
        let a = channel_with(vec![vec![data(1)], vec![data(2)]]);
        let b = channel_with(vec![vec![data(3)], vec![data(9)]]);
        let members = vec![member("a", &a), member("b", &b)];
        let mut engine = OrderingEngine::new();

        engine.next_round(&members).unwrap();
        engine.next_round(&members).unwrap();
        // b's 3 is on the heap, its 9 batch must still be in the channel.
        assert_eq!(b.buffered_batches(), 1);
        assert_eq!(b.peek().len(), 1);
    }

    #[test]
    fn test_control_batch_is_acked_and_skipped() {
        let a = channel_with(vec![vec![Record::placeholder("p1")], vec![data(4)]]);
        let members = vec![member("a", &a)];
        let mut engine = OrderingEngine::new();

        let round = engine.next_round(&members).unwrap();
        assert!(round.is_empty());
        assert_eq!(round.control.len(), 1);
        assert!(round.control[0].finished.is_none());
        assert_eq!(a.acked_records(), 1);

        assert_eq!(csns(&engine.next_round(&members).unwrap()), vec![4]);
    }

    #[test]
    fn test_finished_only_batch_reports_member() {
        let a = channel_with(vec![vec![data(1)]]);
        let b = channel_with(vec![vec![Record::finished("end")]]);
        let members = vec![member("a", &a), member("b", &b)];
        let mut engine = OrderingEngine::new();

        let round = engine.next_round(&members).unwrap();
        assert_eq!(csns(&round), vec![1]);
        assert_eq!(round.control.len(), 1);
        let end = round.control[0].finished.as_ref().unwrap();
        assert_eq!(end.position().as_str(), "end");
        assert_eq!(round.control[0].member.name(), "b");
        // Acked by the importer once b has nothing in flight.
        assert!(b.acked_position().is_none());
    }

    #[test]
    fn test_duplicate_csn_on_one_channel_dispatches_in_arrival_order() {
        let a = channel_with(vec![vec![data(5)], vec![data(5)]]);
        let members = vec![member("a", &a)];
        let mut engine = OrderingEngine::new();

        assert_eq!(csns(&engine.next_round(&members).unwrap()), vec![5]);
        assert_eq!(csns(&engine.next_round(&members).unwrap()), vec![5]);
        assert!(engine.next_round(&members).unwrap().is_empty());
    }

    #[test]
    fn test_dispatch_batch_concatenates_groups() {
        let a = channel_with(vec![vec![data(5), data(5), Record::placeholder("pa")]]);
        let b = channel_with(vec![vec![data(5), Record::finished("fb")]]);
        let members = vec![member("a", &a), member("b", &b)];
        let mut engine = OrderingEngine::new();

        let round = engine.next_round(&members).unwrap();
        let batch = DispatchBatch::from_groups(round.groups).unwrap();
        assert_eq!(batch.csn, 5);
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.entries.len(), 2);

        let a_entry = batch.entries.iter().find(|e| e.member.name() == "a").unwrap();
        assert_eq!(a_entry.data_record_count, 2);
        assert_eq!(a_entry.last_record.position().as_str(), "pa");

        let b_entry = batch.entries.iter().find(|e| e.member.name() == "b").unwrap();
        assert_eq!(b_entry.data_record_count, 1);
        assert!(b_entry.last_record.is_finished());
    }

    #[test]
    fn test_empty_round_has_no_batch() {
        assert!(DispatchBatch::from_groups(Vec::new()).is_none());
    }

    #[test]
    fn test_member_batch_requires_data() {
        let channel = channel_with(vec![]);
        let batch =
            DispatchBatch::from_member(member("x", &channel), vec![data(8), data(9)]).unwrap();
        assert_eq!(batch.csn, 8);
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].data_record_count, 2);

        let err = DispatchBatch::from_member(member("x", &channel), vec![Record::finished("f")])
            .unwrap_err();
        assert!(matches!(err, ImporterError::MissingDataRecord { .. }));
    }

    #[test]
    fn test_heap_orders_by_csn_then_insertion() {
        let channel = channel_with(vec![]);
        let mut heap = BinaryHeap::new();
        heap.push(CsnGroup::new(member("x", &channel), vec![data(9)], 0).unwrap());
        heap.push(CsnGroup::new(member("y", &channel), vec![data(2)], 1).unwrap());
        heap.push(CsnGroup::new(member("z", &channel), vec![data(2)], 2).unwrap());

        let order: Vec<&str> = std::iter::from_fn(|| heap.pop())
            .map(|g| if g.seq == 1 { "y" } else if g.seq == 2 { "z" } else { "x" })
            .collect();
        assert_eq!(order, vec!["y", "z", "x"]);
    }

    #[test]
    fn test_group_without_data_record_is_rejected() {
        let channel = channel_with(vec![]);
        let err = CsnGroup::new(member("x", &channel), vec![Record::placeholder("p")], 0)
            .unwrap_err();
        assert!(matches!(err, ImporterError::MissingDataRecord { .. }));
    }
}
