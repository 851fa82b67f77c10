//! Collaborative document replica.
//!
//! A [`CollabDocument`] is one replica of a shared text: the sequence store,
//! the update log that feeds reconciliation, and the clock that names new
//! operations. Local edit intents are offset based and return the
//! [`UpdateRecord`] to broadcast; remote records are merged with
//! [`CollabDocument::apply_remote`], which is idempotent and commutative.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;
use tracing::{debug, warn};

use super::clock::{ItemId, OpId, ReplicaClock, ReplicaId, StateVector};
use super::sequence::{
    Block, BlockAttr, Item, Mark, MarkRange, Materialize, SequenceStore,
};
use super::update::{Operation, SyncDelta, UpdateLog, UpdateRecord};

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Encoding error: {0}")]
    Encode(#[from] bincode::Error),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// What merging a remote record did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Operations integrated for the first time.
    pub applied: usize,
    /// Operations already present.
    pub duplicates: usize,
    /// Operations that failed structural checks and were dropped.
    pub rejected: usize,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        self.applied > 0
    }
}

/// Position anchored to content rather than to an offset, so it survives
/// concurrent edits elsewhere in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableCursor {
    /// The cursor sits right after this item; `None` is the document start.
    pub after: Option<ItemId>,
}

/// Durable form of a replica: the full history plus the state vector, which
/// may cover operations removed by compaction.
#[derive(Serialize, Deserialize)]
struct PersistedLog {
    vector: StateVector,
    record: UpdateRecord,
}

/// Collaborative document replica
#[derive(Debug)]
pub struct CollabDocument {
    clock: ReplicaClock,
    store: SequenceStore,
    log: UpdateLog,
}

impl Default for CollabDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl CollabDocument {
    /// Create an empty replica with a fresh random replica id
    pub fn new() -> Self {
        Self::with_replica(ReplicaId::random())
    }

    /// Create an empty replica with a specific replica id
    pub fn with_replica(replica: ReplicaId) -> Self {
        Self {
            clock: ReplicaClock::new(replica),
            store: SequenceStore::new(),
            log: UpdateLog::new(),
        }
    }

    /// Rebuild a replica from a blob produced by [`CollabDocument::save`].
    pub fn load(replica: ReplicaId, data: &[u8]) -> DocumentResult<Self> {
        let persisted: PersistedLog = bincode::deserialize(data)
            .map_err(|e| DocumentError::MalformedRecord(e.to_string()))?;

        let mut doc = Self::with_replica(replica);
        let outcome = doc.apply_remote(&persisted.record);
        doc.log.restore_vector(&persisted.vector);
        debug!(
            "Loaded document replica {} with {} operations",
            replica, outcome.applied
        );
        Ok(doc)
    }

    /// Serialize the complete update log
    pub fn save(&self) -> DocumentResult<Vec<u8>> {
        let persisted = PersistedLog {
            vector: self.log.state_vector().clone(),
            record: self.log.delta_since(&StateVector::new()),
        };
        Ok(bincode::serialize(&persisted)?)
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.clock.replica()
    }

    pub fn state_vector(&self) -> &StateVector {
        self.log.state_vector()
    }

    pub fn store(&self) -> &SequenceStore {
        &self.store
    }

    /// Number of operations retained in the update log
    pub fn history_len(&self) -> usize {
        self.log.len()
    }

    pub fn text(&self) -> String {
        self.store.text()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn materialize(&self) -> Materialize<'_> {
        self.store.materialize()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.store.blocks()
    }

    // =========================================================================
    // Local edit intents
    // =========================================================================

    /// Insert `text` before the visible character at `offset`.
    ///
    /// New characters inherit the marks of their left neighbour.
    pub fn insert_text(&mut self, offset: usize, text: &str) -> UpdateRecord {
        let offset = offset.min(self.len());
        let left = offset.checked_sub(1).and_then(|i| self.store.char_at(i));
        let marks = left.as_ref().map(|c| c.marks).unwrap_or_default();
        let mut origin = left.map(|c| c.id);

        let mut ops = Vec::with_capacity(text.len());
        for ch in text.chars() {
            let op = self.next_op(|id, lamport| Operation::Insert {
                id,
                lamport,
                origin,
                ch,
                marks,
            });
            origin = Some(op.id());
            ops.push(op);
        }
        UpdateRecord::new(ops)
    }

    /// Delete the visible characters in `range`.
    pub fn delete_range(&mut self, range: Range<usize>) -> UpdateRecord {
        let Some((start, count)) = self.clamp(range) else {
            return UpdateRecord::default();
        };
        let targets = self.store.visible_ids(start, count);
        let ops = targets
            .into_iter()
            .map(|target| self.next_op(|id, lamport| Operation::Delete { id, lamport, target }))
            .collect();
        UpdateRecord::new(ops)
    }

    /// Turn `mark` on or off over the visible characters in `range`.
    pub fn set_mark(&mut self, range: Range<usize>, mark: Mark, on: bool) -> UpdateRecord {
        let Some((start, count)) = self.clamp(range) else {
            return UpdateRecord::default();
        };
        let covered = self.store.visible_ids(start, count);
        let (Some(&first), Some(&last)) = (covered.first(), covered.last()) else {
            return UpdateRecord::default();
        };
        let op = self.next_op(|id, lamport| Operation::Mark {
            id,
            lamport,
            start: first,
            end: last,
            mark,
            on,
        });
        UpdateRecord::new(vec![op])
    }

    /// Set an attribute on the block containing `offset`.
    pub fn set_block_attr(&mut self, offset: usize, attr: BlockAttr) -> UpdateRecord {
        if let BlockAttr::Heading(Some(level)) = attr {
            if !(1..=6).contains(&level) {
                warn!("Ignoring heading level {} outside 1-6", level);
                return UpdateRecord::default();
            }
        }
        let block = self.store.block_at(offset.min(self.len()));
        let op = self.next_op(|id, lamport| Operation::BlockAttr {
            id,
            lamport,
            block,
            attr,
        });
        UpdateRecord::new(vec![op])
    }

    /// Anchor a cursor at a visible offset.
    pub fn stable_cursor(&self, offset: usize) -> StableCursor {
        let after = offset.checked_sub(1).and_then(|i| self.store.char_at(i)).map(|c| c.id);
        StableCursor { after }
    }

    /// Current visible offset of a stable cursor. Anchors that were deleted
    /// resolve to the position where their content used to be.
    pub fn resolve_cursor(&self, cursor: &StableCursor) -> Option<usize> {
        let Some(anchor) = cursor.after else {
            return Some(0);
        };
        let mut visible = 0;
        for item in self.store.walk() {
            if !item.deleted {
                visible += 1;
            }
            if item.id == anchor {
                return Some(visible);
            }
        }
        None
    }

    fn clamp(&self, range: Range<usize>) -> Option<(usize, usize)> {
        let len = self.len();
        let start = range.start.min(len);
        let end = range.end.min(len);
        (start < end).then_some((start, end - start))
    }

    fn next_op(&mut self, make: impl FnOnce(OpId, u64) -> Operation) -> Operation {
        let (id, stamp) = self.clock.next_id();
        let op = make(id, stamp.lamport);
        self.integrate(op.clone());
        op
    }

    // =========================================================================
    // Merge engine
    // =========================================================================

    /// Merge a remote record. Duplicate delivery is a no-op and the result
    /// does not depend on the order in which records arrive.
    pub fn apply_remote(&mut self, record: &UpdateRecord) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        for op in &record.ops {
            if !op.is_well_formed() {
                warn!("Discarding malformed operation {}", op.id());
                outcome.rejected += 1;
            } else if self.integrate(op.clone()) {
                outcome.applied += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        if outcome.duplicates > 0 {
            debug!(
                "Skipped {} already integrated operations on replica {}",
                outcome.duplicates,
                self.replica_id()
            );
        }
        outcome
    }

    fn integrate(&mut self, op: Operation) -> bool {
        if !self.log.record(op.clone()) {
            return false;
        }
        self.clock.observe(op.id(), op.lamport());

        let stamp = op.stamp();
        match op {
            Operation::Insert {
                id, origin, ch, marks, ..
            } => {
                self.store.insert(Item {
                    id,
                    origin,
                    stamp,
                    ch,
                    marks,
                    deleted: false,
                });
            }
            Operation::Delete { target, .. } => {
                self.store.delete(target);
            }
            Operation::Mark {
                id,
                start,
                end,
                mark,
                on,
                ..
            } => {
                self.store.add_mark(MarkRange {
                    id,
                    stamp,
                    start,
                    end,
                    mark,
                    on,
                });
            }
            Operation::BlockAttr { block, attr, .. } => {
                self.store.set_block_attr(block, stamp, attr);
            }
        }
        true
    }

    /// Everything the holder of `since` is missing.
    pub fn delta_since(&self, since: &StateVector) -> UpdateRecord {
        self.log.delta_since(since)
    }

    /// Reclaim tombstones every replica is known to have observed.
    ///
    /// `observed` should be the meet of the state vectors of all known
    /// replicas. An item is removed only when its insert and a deletion of it
    /// are covered by that bound and by this replica, it anchors no other
    /// item, and no formatting overlay refers to it. Every deletion of a
    /// reclaimed item leaves the log with it. Returns the number of items
    /// reclaimed.
    pub fn compact(&mut self, observed: &StateVector) -> usize {
        let bound = observed.meet(self.log.state_vector());
        let anchors = self.store.anchors();

        // Every delete per target, and whether one of them is observed by all.
        let mut deletions: HashMap<ItemId, (bool, Vec<OpId>)> = HashMap::new();
        for op in self.log.iter() {
            if let Operation::Delete { id, target, .. } = op {
                let entry = deletions.entry(*target).or_default();
                entry.0 |= bound.covers(*id);
                entry.1.push(*id);
            }
        }
        deletions.retain(|target, (seen, _)| {
            *seen && bound.covers(*target) && !anchors.contains(target)
        });

        let mut reclaimed = 0;
        loop {
            let mut progress = false;
            let targets: Vec<ItemId> = deletions.keys().copied().collect();
            for target in targets {
                // Already reclaimed earlier; only stale deletions are left.
                let gone = !self.store.contains(target);
                if !gone && !self.store.reclaim(target) {
                    continue;
                }
                if gone {
                    self.store.forget_pending_delete(target);
                } else {
                    reclaimed += 1;
                }
                self.log.remove(target);
                let (_, ids) = deletions.remove(&target).unwrap_or_default();
                for id in ids {
                    self.log.remove(id);
                }
                progress = true;
            }
            if !progress {
                break;
            }
        }

        if reclaimed > 0 {
            debug!("Compacted {} tombstones on replica {}", reclaimed, self.replica_id());
        }
        reclaimed
    }

    // =========================================================================
    // Transport encoding
    // =========================================================================

    pub fn serialize_state_vector(&self) -> DocumentResult<Vec<u8>> {
        Ok(self.log.state_vector().encode()?)
    }

    /// Encode the [`SyncDelta`] a peer with the given serialized state vector
    /// is missing.
    pub fn serialize_delta(&self, since: &[u8]) -> DocumentResult<Vec<u8>> {
        let since = StateVector::decode(since)
            .map_err(|e| DocumentError::MalformedRecord(e.to_string()))?;
        let delta = SyncDelta {
            vector: self.state_vector().clone(),
            record: self.delta_since(&since),
        };
        Ok(delta.encode()?)
    }

    /// Encode what the holder of `since` is missing as a sequence of
    /// [`SyncDelta`] chunks, each record within `max_bytes`. Only the last
    /// chunk carries this replica's vector, so chunks must be applied in order.
    pub fn delta_chunks(&self, since: &StateVector, max_bytes: u64) -> DocumentResult<Vec<Vec<u8>>> {
        let records = self.delta_since(since).split(max_bytes)?;
        let last = records.len().saturating_sub(1);
        records
            .into_iter()
            .enumerate()
            .map(|(i, record)| {
                let vector = if i == last {
                    self.state_vector().clone()
                } else {
                    StateVector::new()
                };
                Ok(SyncDelta { vector, record }.encode()?)
            })
            .collect()
    }

    /// Decode and merge a reconciliation delta.
    pub fn apply_delta(&mut self, data: &[u8]) -> DocumentResult<ApplyOutcome> {
        let delta = SyncDelta::decode(data)
            .map_err(|e| DocumentError::MalformedRecord(e.to_string()))?;
        Ok(self.apply_sync(&delta))
    }

    /// Merge a reconciliation delta and adopt the sender's vector.
    ///
    /// The delta holds everything the sender has between the two vectors, so
    /// any clock it covers that is still missing here was compacted away. A
    /// delta with rejected operations does not move the vector.
    pub fn apply_sync(&mut self, delta: &SyncDelta) -> ApplyOutcome {
        let outcome = self.apply_remote(&delta.record);
        if outcome.rejected == 0 {
            self.log.restore_vector(&delta.vector);
        }
        outcome
    }

    /// Decode and merge a live update record.
    pub fn apply_update(&mut self, data: &[u8]) -> DocumentResult<ApplyOutcome> {
        let record = UpdateRecord::decode(data)
            .map_err(|e| DocumentError::MalformedRecord(e.to_string()))?;
        Ok(self.apply_remote(&record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::sequence::{Alignment, MarkSet};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn replica(id: u64) -> CollabDocument {
        CollabDocument::with_replica(ReplicaId(id))
    }

    /// Two-phase state vector exchange through the byte-level interface.
    fn reconcile(a: &mut CollabDocument, b: &mut CollabDocument) {
        let sv_a = a.serialize_state_vector().unwrap();
        let sv_b = b.serialize_state_vector().unwrap();
        let for_b = a.serialize_delta(&sv_b).unwrap();
        let for_a = b.serialize_delta(&sv_a).unwrap();
        a.apply_delta(&for_a).unwrap();
        b.apply_delta(&for_b).unwrap();
    }

    fn marks_of(doc: &CollabDocument) -> Vec<MarkSet> {
        doc.materialize().map(|c| c.marks).collect()
    }

    #[test]
    fn test_local_editing() {
        let mut doc = replica(1);
        doc.insert_text(0, "Hello");
        doc.insert_text(5, " World");
        doc.insert_text(0, "Say ");
        assert_eq!(doc.text(), "Say Hello World");

        doc.delete_range(3..9);
        assert_eq!(doc.text(), "Say World");
    }

    #[test]
    fn test_out_of_range_edits_clamp() {
        let mut doc = replica(1);
        doc.insert_text(100, "abc");
        assert_eq!(doc.text(), "abc");
        assert!(doc.delete_range(5..9).is_empty());
        assert!(doc.set_mark(2..2, Mark::Bold, true).is_empty());
        assert_eq!(doc.delete_range(1..50).len(), 2);
        assert_eq!(doc.text(), "a");
    }

    #[test]
    fn test_idempotent_apply() {
        let mut source = replica(1);
        let record = source.insert_text(0, "abc");

        let mut target = replica(2);
        let first = target.apply_remote(&record);
        let text = target.text();
        let second = target.apply_remote(&record);

        assert_eq!(first.applied, 3);
        assert_eq!(second.applied, 0);
        assert_eq!(second.duplicates, 3);
        assert_eq!(target.text(), text);
        assert_eq!(target.history_len(), 3);
    }

    #[test]
    fn test_commutative_apply() {
        let mut base = replica(1);
        let seed = base.insert_text(0, "hello");

        let mut a = replica(2);
        a.apply_remote(&seed);
        let ra = a.insert_text(5, " world");

        let mut b = replica(3);
        b.apply_remote(&seed);
        let rb = b.delete_range(0..1);

        let mut left = replica(4);
        left.apply_remote(&seed);
        left.apply_remote(&ra);
        left.apply_remote(&rb);

        let mut right = replica(5);
        right.apply_remote(&rb);
        right.apply_remote(&ra);
        right.apply_remote(&seed);

        assert_eq!(left.text(), "ello world");
        assert_eq!(left.text(), right.text());
        assert_eq!(left.state_vector(), right.state_vector());
    }

    #[test]
    fn test_concurrent_insert_same_position() {
        let mut a = replica(1);
        let mut b = replica(2);
        let seed = a.insert_text(0, "ab");
        b.apply_remote(&seed);

        let ra = a.insert_text(1, "X");
        let rb = b.insert_text(1, "Y");
        a.apply_remote(&rb);
        b.apply_remote(&ra);

        assert_eq!(a.text(), b.text());
        assert!(a.text() == "aXYb" || a.text() == "aYXb");
    }

    #[test]
    fn test_concurrent_runs_do_not_interleave() {
        let mut a = replica(1);
        let mut b = replica(2);
        let ra = a.insert_text(0, "alpha");
        let rb = b.insert_text(0, "beta");
        a.apply_remote(&rb);
        b.apply_remote(&ra);

        assert_eq!(a.text(), b.text());
        assert!(a.text() == "alphabeta" || a.text() == "betaalpha");
    }

    #[test]
    fn test_insert_after_seen_content_respects_intent() {
        let mut a = replica(9);
        let mut b = replica(1);
        b.apply_remote(&a.insert_text(0, "world"));

        // B saw "world" and types at the start.
        a.apply_remote(&b.insert_text(0, "hello "));
        assert_eq!(a.text(), "hello world");
        assert_eq!(b.text(), "hello world");
    }

    #[test]
    fn test_tombstone_stability() {
        let mut a = replica(1);
        a.insert_text(0, "abcdef");
        let before: Vec<ItemId> = a.store().walk().map(|i| i.id).collect();

        let del = a.delete_range(2..4);
        assert_eq!(a.text(), "abef");
        let after: Vec<ItemId> = a.store().walk().map(|i| i.id).collect();
        assert_eq!(before, after);

        let outcome = a.apply_remote(&del);
        assert_eq!(outcome.duplicates, 2);
        assert_eq!(a.text(), "abef");
    }

    #[test]
    fn test_concurrent_delete_and_insert_inside() {
        let mut a = replica(1);
        let mut b = replica(2);
        b.apply_remote(&a.insert_text(0, "abc"));

        let ra = a.delete_range(1..2);
        let rb = b.insert_text(2, "Z");
        a.apply_remote(&rb);
        b.apply_remote(&ra);

        assert_eq!(a.text(), "aZc");
        assert_eq!(b.text(), "aZc");
    }

    #[test]
    fn test_out_of_order_delivery_converges() {
        let mut a = replica(1);
        let r1 = a.insert_text(0, "abc");
        let r2 = a.insert_text(3, "def");
        let r3 = a.delete_range(1..4);

        let mut b = replica(2);
        b.apply_remote(&r3);
        b.apply_remote(&r2);
        assert_eq!(b.state_vector().get(ReplicaId(1)), 0);
        b.apply_remote(&r1);

        assert_eq!(b.text(), a.text());
        assert_eq!(b.state_vector(), a.state_vector());
    }

    #[test]
    fn test_convergence_under_permutation_and_duplication() {
        let mut a = replica(1);
        let mut b = replica(2);
        let mut c = replica(3);
        let mut records = Vec::new();

        let seed = a.insert_text(0, "The quick fox\njumps");
        b.apply_remote(&seed);
        c.apply_remote(&seed);
        records.push(seed);

        records.push(a.insert_text(4, "very "));
        records.push(a.set_mark(0..3, Mark::Bold, true));
        records.push(b.delete_range(4..10));
        records.push(b.insert_text(4, "slow "));
        records.push(c.set_block_attr(15, BlockAttr::Heading(Some(2))));
        records.push(c.set_mark(2..8, Mark::Italic, true));
        records.push(c.insert_text(19, "!"));

        // An edit that causally depends on B's work.
        for r in &records[3..5] {
            a.apply_remote(r);
        }
        records.push(a.insert_text(0, ">> "));

        let mut reference: Option<(String, Vec<Block>)> = None;
        for seed in 0..25u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut delivery = records.clone();
            for r in &records {
                if rng.gen_bool(0.3) {
                    delivery.push(r.clone());
                }
            }
            delivery.shuffle(&mut rng);

            let mut doc = replica(100 + seed);
            for r in &delivery {
                doc.apply_remote(r);
            }

            let observed = (doc.text(), doc.blocks());
            match &reference {
                Some(expected) => assert_eq!(&observed, expected, "seed {}", seed),
                None => reference = Some(observed),
            }
        }
    }

    #[test]
    fn test_reconciliation_after_divergence() {
        let mut a = replica(1);
        let mut b = replica(2);
        b.apply_remote(&a.insert_text(0, "shared "));

        // Long partition with edits on both sides.
        for i in 0..20 {
            a.insert_text(a.len(), &format!("a{}", i));
            b.insert_text(0, &format!("b{}", i));
        }
        b.delete_range(0..4);

        reconcile(&mut a, &mut b);
        assert_eq!(a.text(), b.text());
        assert_eq!(a.state_vector(), b.state_vector());

        // Nothing left to exchange.
        let sv = b.serialize_state_vector().unwrap();
        let delta = a.serialize_delta(&sv).unwrap();
        assert!(SyncDelta::decode(&delta).unwrap().record.is_empty());
    }

    #[test]
    fn test_reconciliation_from_first_join() {
        let mut a = replica(1);
        a.insert_text(0, "existing document");
        a.set_mark(0..8, Mark::Underline, true);
        a.delete_range(8..9);

        let mut fresh = replica(2);
        reconcile(&mut fresh, &mut a);
        assert_eq!(fresh.text(), "existingdocument");
        assert_eq!(marks_of(&fresh), marks_of(&a));
    }

    #[test]
    fn test_mark_overlay_scenario() {
        let mut a = replica(1);
        let mut b = replica(2);
        b.apply_remote(&a.insert_text(0, "abcdefgh"));

        let ra = a.set_mark(2..5, Mark::Bold, true);
        let rb = b.set_mark(3..6, Mark::Italic, true);
        a.apply_remote(&rb);
        b.apply_remote(&ra);

        let marks = marks_of(&a);
        assert_eq!(marks, marks_of(&b));
        let bold = MarkSet::default().with(Mark::Bold, true);
        let italic = MarkSet::default().with(Mark::Italic, true);
        assert_eq!(marks[1], MarkSet::default());
        assert_eq!(marks[2], bold);
        assert_eq!(marks[3], bold.with(Mark::Italic, true));
        assert_eq!(marks[4], bold.with(Mark::Italic, true));
        assert_eq!(marks[5], italic);
        assert_eq!(marks[6], MarkSet::default());
    }

    #[test]
    fn test_typing_inside_bold_inherits_mark() {
        let mut doc = replica(1);
        doc.insert_text(0, "abcd");
        doc.set_mark(1..3, Mark::Bold, true);
        doc.insert_text(2, "X");

        let marks = marks_of(&doc);
        assert_eq!(doc.text(), "abXcd");
        assert!(marks[2].contains(Mark::Bold));
        assert!(!marks[0].contains(Mark::Bold));
    }

    #[test]
    fn test_concurrent_block_attrs() {
        let mut a = replica(1);
        let mut b = replica(2);
        b.apply_remote(&a.insert_text(0, "Title\nBody"));

        let ra = a.set_block_attr(0, BlockAttr::Heading(Some(1)));
        let rb1 = b.set_block_attr(2, BlockAttr::Align(Alignment::Center));
        let rb2 = b.set_block_attr(7, BlockAttr::Heading(Some(3)));
        a.apply_remote(&rb1);
        a.apply_remote(&rb2);
        b.apply_remote(&ra);

        let blocks = a.blocks();
        assert_eq!(blocks, b.blocks());
        assert_eq!(blocks[0].text(), "Title");
        assert_eq!(blocks[0].style.heading, Some(1));
        assert_eq!(blocks[0].style.align, Alignment::Center);
        assert_eq!(blocks[1].style.heading, Some(3));
        assert!(a.set_block_attr(0, BlockAttr::Heading(Some(7))).is_empty());
    }

    #[test]
    fn test_malformed_delta_is_reported_and_state_untouched() {
        let mut doc = replica(1);
        doc.insert_text(0, "keep");
        let result = doc.apply_delta(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(result, Err(DocumentError::MalformedRecord(_))));
        let result = doc.apply_update(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(result, Err(DocumentError::MalformedRecord(_))));
        assert_eq!(doc.text(), "keep");
    }

    #[test]
    fn test_delta_with_rejected_ops_keeps_vector() {
        let mut doc = replica(1);
        let bogus = Operation::Delete {
            id: OpId::new(ReplicaId(2), 0),
            lamport: 1,
            target: OpId::new(ReplicaId(2), 1),
        };
        let delta = SyncDelta {
            vector: [(ReplicaId(2), 5)].into_iter().collect(),
            record: UpdateRecord::new(vec![bogus]),
        };
        assert_eq!(doc.apply_sync(&delta).rejected, 1);
        assert!(doc.state_vector().is_empty());
    }

    #[test]
    fn test_live_update_applies_plain_record() {
        let mut a = replica(1);
        let mut b = replica(2);
        let record = a.insert_text(0, "live");
        assert_eq!(b.apply_update(&record.encode().unwrap()).unwrap().applied, 4);
        assert_eq!(b.text(), "live");
    }

    #[test]
    fn test_save_load_resumes_counter() {
        let mut doc = replica(7);
        doc.insert_text(0, "persist me");
        doc.delete_range(0..8);
        let saved = doc.save().unwrap();

        let mut loaded = CollabDocument::load(ReplicaId(7), &saved).unwrap();
        assert_eq!(loaded.text(), "me");
        assert_eq!(loaded.state_vector(), doc.state_vector());

        let record = loaded.insert_text(0, "!");
        assert_eq!(record.ops[0].id().clock, 19);
    }

    #[test]
    fn test_compaction_requires_all_replicas() {
        let mut a = replica(1);
        let mut b = replica(2);
        b.apply_remote(&a.insert_text(0, "abcdef"));
        let del = a.delete_range(3..6);
        let text = a.text();

        // B has not seen the deletion yet.
        let bound = a.state_vector().meet(b.state_vector());
        assert_eq!(a.compact(&bound), 0);

        b.apply_remote(&del);
        let bound = a.state_vector().meet(b.state_vector());
        assert_eq!(a.compact(&bound), 3);
        assert_eq!(a.text(), text);
        assert_eq!(a.store().item_count(), 3);

        // Late duplicates of reclaimed operations stay ignored.
        assert_eq!(a.apply_remote(&del).applied, 0);
        assert_eq!(a.text(), "abc");

        // Survivors still converge with the uncompacted replica.
        let ra = a.insert_text(3, "!");
        b.apply_remote(&ra);
        assert_eq!(a.text(), b.text());
    }

    #[test]
    fn test_compaction_keeps_anchors_and_interior_tombstones() {
        let mut a = replica(1);
        a.insert_text(0, "abcde");
        a.set_mark(1..2, Mark::Bold, true);
        a.delete_range(1..2);
        a.delete_range(1..2);

        // 'b' anchors a mark, 'c' anchors 'd'.
        let bound = a.state_vector().clone();
        assert_eq!(a.compact(&bound), 0);
        assert_eq!(a.text(), "ade");
    }

    #[test]
    fn test_compacted_replica_persists_vector() {
        let mut a = replica(1);
        a.insert_text(0, "xyz");
        a.delete_range(2..3);
        let bound = a.state_vector().clone();
        assert_eq!(a.compact(&bound), 1);

        let loaded = CollabDocument::load(ReplicaId(1), &a.save().unwrap()).unwrap();
        assert_eq!(loaded.state_vector(), a.state_vector());
        assert_eq!(loaded.text(), "xy");
    }

    #[test]
    fn test_join_after_compaction_adopts_sender_vector() {
        let mut a = replica(1);
        a.insert_text(0, "abcdef");
        a.delete_range(3..6);
        let bound = a.state_vector().clone();
        assert_eq!(a.compact(&bound), 3);
        a.insert_text(3, "X");

        let mut fresh = replica(2);
        let delta = a.serialize_delta(&fresh.serialize_state_vector().unwrap()).unwrap();
        fresh.apply_delta(&delta).unwrap();
        assert_eq!(fresh.text(), "abcX");
        assert_eq!(fresh.state_vector(), a.state_vector());

        // The next reconciliation only carries the missing suffix: nothing.
        let again = a.serialize_delta(&fresh.serialize_state_vector().unwrap()).unwrap();
        assert!(SyncDelta::decode(&again).unwrap().record.is_empty());

        // And later edits still flow both ways.
        a.apply_remote(&fresh.insert_text(0, ">"));
        assert_eq!(a.text(), ">abcX");
    }

    #[test]
    fn test_chunked_delta_converges() {
        let mut a = replica(1);
        a.insert_text(0, &"chunked history ".repeat(40));
        a.delete_range(0..8);
        a.set_mark(0..10, Mark::Bold, true);
        let bound = a.state_vector().clone();
        a.compact(&bound);

        let mut fresh = replica(2);
        let chunks = a.delta_chunks(fresh.state_vector(), 512).unwrap();
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            let delta = SyncDelta::decode(chunk).unwrap();
            assert!(delta.record.encode().unwrap().len() <= 512);
            assert_eq!(delta.vector.is_empty(), i + 1 < chunks.len());
            fresh.apply_delta(chunk).unwrap();
        }
        assert_eq!(fresh.text(), a.text());
        assert_eq!(marks_of(&fresh), marks_of(&a));
        assert_eq!(fresh.state_vector(), a.state_vector());
    }

    #[test]
    fn test_compaction_drops_every_delete_of_reclaimed_item() {
        let mut a = replica(1);
        let mut b = replica(2);
        b.apply_remote(&a.insert_text(0, "abc"));

        // Both delete 'c'; only A's deletion is known to everyone.
        let rb = b.delete_range(2..3);
        a.delete_range(2..3);
        a.apply_remote(&rb);

        let observed: StateVector = [(ReplicaId(1), 4)].into_iter().collect();
        assert_eq!(a.compact(&observed), 1);
        assert_eq!(a.history_len(), 2);
        assert!(!a
            .delta_since(&StateVector::new())
            .ops
            .iter()
            .any(|op| matches!(op, Operation::Delete { .. })));

        // A late joiner ends up with exactly the same live state.
        let mut fresh = replica(3);
        fresh.apply_delta(&a.serialize_delta(&fresh.serialize_state_vector().unwrap()).unwrap()).unwrap();
        assert_eq!(fresh.text(), "ab");
        assert_eq!(fresh.state_vector(), a.state_vector());
    }

    #[test]
    fn test_stable_cursor_survives_remote_edits() {
        let mut a = replica(1);
        let mut b = replica(2);
        b.apply_remote(&a.insert_text(0, "Hello World"));

        let cursor = a.stable_cursor(6);
        a.apply_remote(&b.insert_text(0, "Say "));
        assert_eq!(a.resolve_cursor(&cursor), Some(10));

        a.apply_remote(&b.delete_range(8..10));
        assert_eq!(a.text(), "Say HellWorld");
        assert_eq!(a.resolve_cursor(&cursor), Some(8));
        assert_eq!(a.resolve_cursor(&StableCursor { after: None }), Some(0));
    }
}
