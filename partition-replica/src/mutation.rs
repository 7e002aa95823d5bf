//! Mutations: the unit of replicated work.
//!
//! A mutation is assigned a `(ballot, decree)` pair by the primary and then
//! never changes payload under that pair. A decree can only be reassigned a
//! different payload by a strictly higher ballot (ballot precedence), which
//! happens when a new primary re-prepares an uncommitted tail.
//!
//! ```text
//!   client write
//!        │
//!        ▼
//!   Pending ──(logged + sent)──> Preparing ──(quorum acked)──> Committed
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{Ballot, Decree};

/// Lifecycle of a mutation inside the prepare list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MutationStatus {
    /// Created, not yet replicated.
    #[default]
    Pending,
    /// Sent to the membership, waiting for acknowledgments.
    Preparing,
    /// Committed and handed to the application.
    Committed,
}

/// A single ordered, ballot-stamped unit of replicated work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// Position in the partition's order.
    pub decree: Decree,
    /// Ballot under which this decree was (re)assigned.
    pub ballot: Ballot,
    /// Lifecycle state. Local bookkeeping, reset on receipt.
    pub status: MutationStatus,
    /// Opaque client batch. Empty for reconciliation writes.
    pub payload: Vec<u8>,
    /// Whether the mutation reached the local durable log.
    pub logged: bool,
    /// Sender's commit point when this mutation was sent.
    pub last_committed_decree: Decree,
}

impl Mutation {
    /// Create a pending mutation.
    pub fn new(decree: Decree, ballot: Ballot, payload: Vec<u8>) -> Self {
        Self {
            decree,
            ballot,
            status: MutationStatus::Pending,
            payload,
            logged: false,
            last_committed_decree: Decree::ZERO,
        }
    }

    /// An empty write issued by a new primary to establish its commit point.
    pub fn reconciliation(decree: Decree, ballot: Ballot) -> Self {
        Self::new(decree, ballot, Vec::new())
    }

    /// Whether this mutation carries no client data.
    pub fn is_reconciliation(&self) -> bool {
        self.payload.is_empty()
    }

    /// Whether this mutation is the same `(ballot, decree, payload)` as `other`.
    pub fn same_proposal(&self, other: &Mutation) -> bool {
        self.decree == other.decree && self.ballot == other.ballot && self.payload == other.payload
    }

    /// Copy of this mutation as it travels on the wire.
    ///
    /// Local lifecycle flags are cleared; the receiver tracks its own.
    pub fn for_wire(&self, last_committed: Decree) -> Mutation {
        Mutation {
            decree: self.decree,
            ballot: self.ballot,
            status: MutationStatus::Pending,
            payload: self.payload.clone(),
            logged: false,
            last_committed_decree: last_committed,
        }
    }
}

impl std::fmt::Display for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mutation({}.{}, {} bytes)",
            self.ballot.0,
            self.decree.0,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_mutation_is_pending() {
        let m = Mutation::new(Decree::new(1), Ballot::new(1), b"k=v".to_vec());
        assert_eq!(m.status, MutationStatus::Pending);
        assert!(!m.logged);
        assert!(!m.is_reconciliation());
        assert_eq!(m.to_string(), "mutation(1.1, 3 bytes)");
    }

    #[test]
    fn test_reconciliation_is_empty() {
        let m = Mutation::reconciliation(Decree::new(11), Ballot::new(4));
        assert!(m.is_reconciliation());
    }

    #[test]
    fn test_same_proposal_ignores_local_flags() {
        let mut a = Mutation::new(Decree::new(3), Ballot::new(2), b"x".to_vec());
        let b = a.for_wire(Decree::new(2));
        a.logged = true;
        a.status = MutationStatus::Preparing;
        assert!(a.same_proposal(&b));

        let c = Mutation::new(Decree::new(3), Ballot::new(2), b"y".to_vec());
        assert!(!a.same_proposal(&c));
    }

    #[test]
    fn test_for_wire_carries_commit_point() {
        let mut m = Mutation::new(Decree::new(5), Ballot::new(1), b"x".to_vec());
        m.logged = true;
        let wire = m.for_wire(Decree::new(4));
        assert_eq!(wire.last_committed_decree, Decree::new(4));
        assert!(!wire.logged);
    }
}
