//! Update records and the per-replica update log.
//!
//! Every mutation of the sequence store is expressed as an [`Operation`]
//! named by an [`OpId`]. An [`UpdateRecord`] is a batch of operations; it is
//! what travels between replicas and what is persisted. The [`UpdateLog`]
//! remembers which operations have been integrated, maintains the state
//! vector and answers "what is this peer missing".

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::clock::{ItemId, OpId, ReplicaId, Stamp, StateVector};
use super::sequence::{BlockAttr, BlockId, Mark, MarkSet};

/// A single replicated mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert {
        id: OpId,
        lamport: u64,
        origin: Option<ItemId>,
        ch: char,
        marks: MarkSet,
    },
    Delete {
        id: OpId,
        lamport: u64,
        target: ItemId,
    },
    Mark {
        id: OpId,
        lamport: u64,
        start: ItemId,
        end: ItemId,
        mark: Mark,
        on: bool,
    },
    BlockAttr {
        id: OpId,
        lamport: u64,
        block: BlockId,
        attr: BlockAttr,
    },
}

impl Operation {
    pub fn id(&self) -> OpId {
        match self {
            Operation::Insert { id, .. }
            | Operation::Delete { id, .. }
            | Operation::Mark { id, .. }
            | Operation::BlockAttr { id, .. } => *id,
        }
    }

    pub fn lamport(&self) -> u64 {
        match self {
            Operation::Insert { lamport, .. }
            | Operation::Delete { lamport, .. }
            | Operation::Mark { lamport, .. }
            | Operation::BlockAttr { lamport, .. } => *lamport,
        }
    }

    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.lamport(), self.id().replica)
    }

    /// Structural sanity checks a decoded operation must pass.
    pub fn is_well_formed(&self) -> bool {
        let id = self.id();
        if id.clock == 0 || self.lamport() == 0 {
            return false;
        }
        match self {
            Operation::Insert { origin: Some(origin), .. } => {
                *origin != id && !(origin.replica == id.replica && origin.clock >= id.clock)
            }
            Operation::Delete { target, .. } => *target != id,
            Operation::BlockAttr {
                attr: BlockAttr::Heading(Some(level)),
                ..
            } => (1..=6).contains(level),
            _ => true,
        }
    }
}

/// An immutable batch of operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub ops: Vec<Operation>,
}

impl UpdateRecord {
    pub fn new(ops: Vec<Operation>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Split into records whose encoded size stays within `max_bytes`.
    /// An operation larger than the budget travels alone. Always yields at
    /// least one record, which may be empty.
    pub fn split(self, max_bytes: u64) -> Result<Vec<UpdateRecord>, bincode::Error> {
        // Length prefix of the encoded op list.
        const OVERHEAD: u64 = 8;

        let mut chunks = Vec::new();
        let mut current = Vec::new();
        let mut size = OVERHEAD;
        for op in self.ops {
            let op_size = bincode::serialized_size(&op)?;
            if !current.is_empty() && size + op_size > max_bytes {
                chunks.push(UpdateRecord::new(std::mem::take(&mut current)));
                size = OVERHEAD;
            }
            size += op_size;
            current.push(op);
        }
        chunks.push(UpdateRecord::new(current));
        Ok(chunks)
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Reconciliation payload: the operations a peer is missing plus the
/// sender's state vector.
///
/// Compaction leaves gaps in the history a sender can replay, so the record
/// alone cannot advance the receiver's contiguous vector. The receiver adopts
/// `vector` once the record is merged; it is empty on all but the last chunk
/// of a split delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDelta {
    pub vector: StateVector,
    pub record: UpdateRecord,
}

impl SyncDelta {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// History of integrated operations, indexed by originating replica.
#[derive(Debug, Default)]
pub struct UpdateLog {
    ops: BTreeMap<ReplicaId, BTreeMap<u64, Operation>>,
    /// Highest contiguous clock integrated per replica.
    vector: StateVector,
    /// Clocks integrated beyond the contiguous prefix.
    ahead: BTreeMap<ReplicaId, BTreeSet<u64>>,
}

impl UpdateLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.vector
    }

    /// Whether `id` has already been integrated (even if later compacted away).
    pub fn contains(&self, id: OpId) -> bool {
        self.vector.covers(id)
            || self
                .ahead
                .get(&id.replica)
                .is_some_and(|clocks| clocks.contains(&id.clock))
    }

    /// Append an operation. Returns false for a duplicate.
    pub fn record(&mut self, op: Operation) -> bool {
        let id = op.id();
        if self.contains(id) {
            return false;
        }
        self.ops.entry(id.replica).or_default().insert(id.clock, op);

        let mut next = self.vector.get(id.replica);
        if id.clock == next + 1 {
            next = id.clock;
            if let Some(ahead) = self.ahead.get_mut(&id.replica) {
                while ahead.remove(&(next + 1)) {
                    next += 1;
                }
                if ahead.is_empty() {
                    self.ahead.remove(&id.replica);
                }
            }
            self.vector.set(id.replica, next);
        } else {
            self.ahead.entry(id.replica).or_default().insert(id.clock);
        }
        true
    }

    /// Every stored operation the holder of `since` has not seen, in
    /// per-replica clock order.
    pub fn delta_since(&self, since: &StateVector) -> UpdateRecord {
        let mut ops = Vec::new();
        for (replica, history) in &self.ops {
            let known = since.get(*replica);
            ops.extend(history.range(known + 1..).map(|(_, op)| op.clone()));
        }
        UpdateRecord::new(ops)
    }

    /// Stored operations, oldest first per replica.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.values().flat_map(|history| history.values())
    }

    /// Physically drop an operation during compaction. Its clock stays
    /// accounted for in the state vector so it is never re-integrated.
    pub fn remove(&mut self, id: OpId) -> Option<Operation> {
        let history = self.ops.get_mut(&id.replica)?;
        let op = history.remove(&id.clock);
        if history.is_empty() {
            self.ops.remove(&id.replica);
        }
        op
    }

    /// Raise the contiguous vector to at least `vector`, e.g. after loading a
    /// compacted history whose gaps would otherwise look like missing updates.
    pub fn restore_vector(&mut self, vector: &StateVector) {
        for (replica, clock) in vector.iter() {
            if clock <= self.vector.get(replica) {
                continue;
            }
            let mut next = clock;
            if let Some(ahead) = self.ahead.get_mut(&replica) {
                ahead.retain(|c| *c > clock);
                while ahead.remove(&(next + 1)) {
                    next += 1;
                }
                if ahead.is_empty() {
                    self.ahead.remove(&replica);
                }
            }
            self.vector.set(replica, next);
        }
    }

    pub fn len(&self) -> usize {
        self.ops.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delete(replica: u64, clock: u64) -> Operation {
        Operation::Delete {
            id: OpId::new(ReplicaId(replica), clock),
            lamport: clock,
            target: OpId::new(ReplicaId(99), 1),
        }
    }

    #[test]
    fn test_record_rejects_duplicates() {
        let mut log = UpdateLog::new();
        assert!(log.record(delete(1, 1)));
        assert!(!log.record(delete(1, 1)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_vector_tracks_contiguous_prefix() {
        let mut log = UpdateLog::new();
        log.record(delete(1, 1));
        log.record(delete(1, 3));
        log.record(delete(1, 4));
        assert_eq!(log.state_vector().get(ReplicaId(1)), 1);
        assert!(log.contains(OpId::new(ReplicaId(1), 3)));
        assert!(!log.contains(OpId::new(ReplicaId(1), 2)));

        log.record(delete(1, 2));
        assert_eq!(log.state_vector().get(ReplicaId(1)), 4);
    }

    #[test]
    fn test_delta_since_returns_missing_suffix() {
        let mut log = UpdateLog::new();
        for clock in 1..=5 {
            log.record(delete(1, clock));
        }
        for clock in 1..=2 {
            log.record(delete(2, clock));
        }

        let since: StateVector = [(ReplicaId(1), 3)].into_iter().collect();
        let delta = log.delta_since(&since);
        let ids: Vec<OpId> = delta.ops.iter().map(Operation::id).collect();
        assert_eq!(
            ids,
            vec![
                OpId::new(ReplicaId(1), 4),
                OpId::new(ReplicaId(1), 5),
                OpId::new(ReplicaId(2), 1),
                OpId::new(ReplicaId(2), 2),
            ]
        );

        assert!(log.delta_since(log.state_vector()).is_empty());
    }

    #[test]
    fn test_removed_ops_stay_accounted() {
        let mut log = UpdateLog::new();
        log.record(delete(1, 1));
        log.record(delete(1, 2));
        assert!(log.remove(OpId::new(ReplicaId(1), 1)).is_some());

        assert!(!log.record(delete(1, 1)));
        assert_eq!(log.state_vector().get(ReplicaId(1)), 2);
        assert_eq!(log.delta_since(&StateVector::new()).len(), 1);
    }

    #[test]
    fn test_restore_vector_closes_gaps() {
        let mut log = UpdateLog::new();
        log.record(delete(1, 3));
        log.record(delete(1, 5));

        let persisted: StateVector = [(ReplicaId(1), 4)].into_iter().collect();
        log.restore_vector(&persisted);
        assert_eq!(log.state_vector().get(ReplicaId(1)), 5);
    }

    #[test]
    fn test_malformed_operations_are_detected() {
        let self_origin = Operation::Insert {
            id: OpId::new(ReplicaId(1), 2),
            lamport: 2,
            origin: Some(OpId::new(ReplicaId(1), 2)),
            ch: 'a',
            marks: MarkSet::default(),
        };
        let zero_clock = delete(1, 0);
        let bad_heading = Operation::BlockAttr {
            id: OpId::new(ReplicaId(1), 1),
            lamport: 1,
            block: None,
            attr: BlockAttr::Heading(Some(9)),
        };

        assert!(!self_origin.is_well_formed());
        assert!(!zero_clock.is_well_formed());
        assert!(!bad_heading.is_well_formed());
        assert!(delete(1, 1).is_well_formed());
    }

    #[test]
    fn test_split_respects_budget() {
        let record = UpdateRecord::new((1..=50).map(|clock| delete(4, clock)).collect());
        let op_size = bincode::serialized_size(&record.ops[0]).unwrap();
        let budget = 8 + op_size * 10;

        let chunks = record.clone().split(budget).unwrap();
        assert_eq!(chunks.len(), 5);
        for chunk in &chunks {
            assert!(chunk.encode().unwrap().len() as u64 <= budget);
        }
        let rejoined: Vec<Operation> = chunks.into_iter().flat_map(|c| c.ops).collect();
        assert_eq!(rejoined, record.ops);

        // Nothing to send still yields one (empty) chunk.
        assert_eq!(UpdateRecord::default().split(budget).unwrap().len(), 1);
        // An oversized operation is not dropped.
        assert_eq!(record.split(1).unwrap().len(), 50);
    }

    #[test]
    fn test_record_encoding() {
        let record = UpdateRecord::new(vec![delete(3, 1), delete(3, 2)]);
        let decoded = UpdateRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert!(UpdateRecord::decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
    }
}
