//! Identifier and clock model for the replicated document.
//!
//! Every operation a replica produces is named by an [`OpId`]: the replica's
//! random identifier plus a contiguous per-replica counter. Operations also
//! carry a Lamport timestamp so that concurrent edits can be ordered by a
//! content-independent [`Stamp`] that every replica computes identically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier of a replica (one editing session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Pick a fresh high-entropy replica identifier.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifier of a single operation, immutable and never reissued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub clock: u64,
}

impl OpId {
    pub fn new(replica: ReplicaId, clock: u64) -> Self {
        Self { replica, clock }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.replica)
    }
}

/// Content items are named by the id of the insert that created them.
pub type ItemId = OpId;

/// Total order over concurrent operations: Lamport time first, replica second.
///
/// Stamps are unique because a replica never issues the same Lamport value
/// twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub lamport: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(lamport: u64, replica: ReplicaId) -> Self {
        Self { lamport, replica }
    }
}

/// Per-replica generator for operation ids and Lamport timestamps.
#[derive(Debug, Clone)]
pub struct ReplicaClock {
    replica: ReplicaId,
    issued: u64,
    lamport: u64,
}

impl ReplicaClock {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            issued: 0,
            lamport: 0,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Issue the next operation id together with its timestamp.
    pub fn next_id(&mut self) -> (OpId, Stamp) {
        self.issued += 1;
        self.lamport += 1;
        (
            OpId::new(self.replica, self.issued),
            Stamp::new(self.lamport, self.replica),
        )
    }

    /// Account for an operation seen in the update history.
    ///
    /// Operations carrying our own replica id (history reloaded after a
    /// reconnect) push the counter forward so ids are never reissued.
    pub fn observe(&mut self, id: OpId, lamport: u64) {
        if id.replica == self.replica {
            self.issued = self.issued.max(id.clock);
        }
        self.lamport = self.lamport.max(lamport);
    }
}

/// Compact summary of "what I have": highest contiguous clock per replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest clock observed from `replica`; zero when never heard from.
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.0.get(&replica).copied().unwrap_or(0)
    }

    pub fn set(&mut self, replica: ReplicaId, clock: u64) {
        if clock == 0 {
            self.0.remove(&replica);
        } else {
            self.0.insert(replica, clock);
        }
    }

    /// Whether the operation `id` is covered by this vector.
    pub fn covers(&self, id: OpId) -> bool {
        id.clock <= self.get(id.replica)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.0.iter().map(|(r, c)| (*r, *c))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pointwise minimum; replicas missing on either side drop out.
    pub fn meet(&self, other: &StateVector) -> StateVector {
        let mut out = StateVector::new();
        for (replica, clock) in self.iter() {
            out.set(replica, clock.min(other.get(replica)));
        }
        out
    }

    /// Pointwise maximum.
    pub fn join(&self, other: &StateVector) -> StateVector {
        let mut out = self.clone();
        for (replica, clock) in other.iter() {
            out.set(replica, clock.max(self.get(replica)));
        }
        out
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ReplicaId, u64)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (replica, clock) in iter {
            sv.set(replica, clock);
        }
        sv
    }
}
