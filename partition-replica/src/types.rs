//! Core types shared by every part of the replica.
//!
//! - [`Ballot`]: Monotonically increasing configuration epoch
//! - [`Decree`]: Position of a mutation in the partition's replication order
//! - [`PartitionId`]: Which table/partition a replica serves
//! - [`PartitionStatus`]: The role a replica currently plays
//! - [`ReplicaConfiguration`] / [`PartitionConfiguration`]: local and
//!   authoritative membership views
//! - [`ReplicaError`], [`ErrorCode`], [`ErrorClass`]: error handling

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Configuration epoch of a partition.
///
/// Every reconfiguration ordered by the meta server produces a strictly
/// higher ballot. A higher ballot always wins: any message stamped with a
/// ballot lower than the receiver's current one is rejected.
///
/// # Invariants
///
/// - A replica's ballot never decreases over its lifetime.
/// - A (ballot, decree) pair identifies a mutation payload uniquely.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Ballot(pub u64);

impl Ballot {
    /// Ballot of a replica that has never seen a configuration.
    pub const ZERO: Self = Self(0);

    /// Create a new ballot.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The ballot immediately after this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Ballot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ballot({})", self.0)
    }
}

/// Sequence number of a mutation within a partition.
///
/// Decree 0 means "nothing": a fresh replica has committed decree 0 and
/// the first client write is assigned decree 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Decree(pub u64);

impl Decree {
    /// The empty decree, before any mutation.
    pub const ZERO: Self = Self(0);

    /// Create a new decree.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The next sequential decree.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The previous decree, saturating at [`Decree::ZERO`].
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Number of decrees from `other` up to `self` (0 if `other >= self`).
    pub const fn distance_from(self, other: Decree) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl std::fmt::Display for Decree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decree({})", self.0)
    }
}

/// Identity of one partition of one table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PartitionId {
    /// The table this partition belongs to.
    pub table_id: u32,
    /// Index of the partition inside its table.
    pub partition_index: u32,
}

impl PartitionId {
    /// Create a new partition id.
    pub const fn new(table_id: u32, partition_index: u32) -> Self {
        Self {
            table_id,
            partition_index,
        }
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.table_id, self.partition_index)
    }
}

/// Network address of a replica node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress(pub SocketAddr);

impl NodeAddress {
    /// Wrap a socket address.
    pub const fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token identifying one learning session.
///
/// Issued by the primary when it adds a learner. Replies and notifications
/// carrying any other signature belong to an abandoned session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LearnSignature(pub u64);

impl std::fmt::Display for LearnSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sig({:016x})", self.0)
    }
}

/// The role a replica plays in its partition.
///
/// A learner is a `PotentialSecondary` with an active learn session; it is
/// not a distinct status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PartitionStatus {
    /// Not serving; waiting for the meta server to assign a role.
    #[default]
    Inactive,
    /// Unrecoverable local failure. Terminal: the replica must be rebuilt.
    Error,
    /// Drives replication and serves client writes.
    Primary,
    /// Voting member that acknowledges every prepare.
    Secondary,
    /// Catching up through the learning protocol before becoming secondary.
    PotentialSecondary,
}

impl PartitionStatus {
    /// Whether the status counts toward the commit quorum.
    pub fn is_voting_member(self) -> bool {
        matches!(self, PartitionStatus::Primary | PartitionStatus::Secondary)
    }
}

impl std::fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PartitionStatus::Inactive => "inactive",
            PartitionStatus::Error => "error",
            PartitionStatus::Primary => "primary",
            PartitionStatus::Secondary => "secondary",
            PartitionStatus::PotentialSecondary => "potential_secondary",
        };
        f.write_str(name)
    }
}

/// A replica's local view of its configuration.
///
/// Updated only through `update_local_configuration`. Peer messages carry
/// a `ReplicaConfiguration` describing the *receiver's* expected status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfiguration {
    /// The partition this configuration belongs to.
    pub pid: PartitionId,
    /// Configuration epoch.
    pub ballot: Ballot,
    /// Status of the replica this configuration describes.
    pub status: PartitionStatus,
    /// Current primary, if any.
    pub primary: Option<NodeAddress>,
    /// Current voting secondaries.
    pub secondaries: Vec<NodeAddress>,
}

impl ReplicaConfiguration {
    /// Configuration of a replica that has not joined any membership yet.
    pub fn inactive(pid: PartitionId) -> Self {
        Self {
            pid,
            ballot: Ballot::ZERO,
            status: PartitionStatus::Inactive,
            primary: None,
            secondaries: Vec::new(),
        }
    }
}

/// The authoritative membership of a partition, as held by the meta server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfiguration {
    /// The partition.
    pub pid: PartitionId,
    /// Configuration epoch.
    pub ballot: Ballot,
    /// The primary, if one is assigned.
    pub primary: Option<NodeAddress>,
    /// The voting secondaries.
    pub secondaries: Vec<NodeAddress>,
    /// Last decree the meta server knows to be committed.
    pub last_committed_decree: Decree,
}

impl PartitionConfiguration {
    /// The status `node` holds under this configuration.
    ///
    /// Nodes that are neither primary nor secondary are reported as
    /// inactive; potential secondaries are never recorded by the meta server.
    pub fn status_of(&self, node: &NodeAddress) -> PartitionStatus {
        if self.primary.as_ref() == Some(node) {
            PartitionStatus::Primary
        } else if self.secondaries.contains(node) {
            PartitionStatus::Secondary
        } else {
            PartitionStatus::Inactive
        }
    }

    /// Build a local view with the given status under this configuration.
    pub fn replica_view(&self, status: PartitionStatus) -> ReplicaConfiguration {
        ReplicaConfiguration {
            pid: self.pid,
            ballot: self.ballot,
            status,
            primary: self.primary,
            secondaries: self.secondaries.clone(),
        }
    }

    /// Remove `node` from the secondaries list. Returns whether it was present.
    pub fn remove_secondary(&mut self, node: &NodeAddress) -> bool {
        let before = self.secondaries.len();
        self.secondaries.retain(|s| s != node);
        self.secondaries.len() != before
    }
}

/// Wire error code carried in peer replies and meta responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Success.
    #[default]
    Ok,
    /// The sender's ballot is lower than the receiver's.
    StaleBallot,
    /// The receiver's status does not allow the operation.
    InvalidState,
    /// The receiver is not the primary.
    NotPrimary,
    /// A prepare arrived beyond the end of the prepare window.
    OutOfOrderDecree,
    /// A conflicting payload was proposed for an existing (ballot, decree).
    ConflictingMutation,
    /// The prepare window is full.
    Throttled,
    /// The receiver does not know the referenced learner or session.
    ObjectNotFound,
    /// A learning round could not be served or applied.
    LearnFailed,
    /// The operation timed out.
    Timeout,
    /// The receiver hit a local durability failure.
    LocalIo,
}

impl ErrorCode {
    /// Whether this code reports success.
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error taxonomy used to decide how far an error propagates.
///
/// | Class | Handling |
/// |-------|----------|
/// | `Stale` | Ignored by the receiving component |
/// | `Liveness` | Escalated as a reconfiguration request |
/// | `LocalIo` | Replica transitions to `error` |
/// | `Protocol` | Rejected with an explicit [`ErrorCode`] |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Ballot or decree below the current one.
    Stale,
    /// Missed acknowledgment or timeout.
    Liveness,
    /// Log or application failure.
    LocalIo,
    /// Malformed or out-of-window request.
    Protocol,
}

/// Errors produced by replica operations.
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    /// A message or configuration carries a ballot below the current one.
    #[error("stale ballot: current {current}, seen {seen}")]
    StaleBallot {
        /// The receiver's ballot.
        current: Ballot,
        /// The (lower) ballot that was presented.
        seen: Ballot,
    },

    /// A decree at or below the commit point was presented for preparing.
    #[error("stale {decree}: already committed up to {last_committed}")]
    StaleDecree {
        /// The presented decree.
        decree: Decree,
        /// The receiver's commit point.
        last_committed: Decree,
    },

    /// This replica is not the primary.
    #[error("not the primary")]
    NotPrimary,

    /// The replica's status does not allow the operation.
    #[error("invalid state {status} for {operation}")]
    InvalidState {
        /// Current status.
        status: PartitionStatus,
        /// The rejected operation.
        operation: &'static str,
    },

    /// A configuration change outside the transition table.
    #[error("invalid transition {from} -> {to} (same ballot: {same_ballot})")]
    InvalidTransition {
        /// Current status.
        from: PartitionStatus,
        /// Requested status.
        to: PartitionStatus,
        /// Whether the ballot was unchanged.
        same_ballot: bool,
    },

    /// A prepare did not land at `max_decree + 1`.
    #[error("out-of-order decree: expected {expected}, got {got}")]
    OutOfOrderDecree {
        /// The next decree the prepare list accepts.
        expected: Decree,
        /// The presented decree.
        got: Decree,
    },

    /// A commit would skip an unprepared decree.
    #[error("gap in commit sequence at {missing}")]
    GapInCommitSequence {
        /// The first decree that is not prepared.
        missing: Decree,
    },

    /// A different payload was proposed for an existing (ballot, decree).
    #[error("conflicting mutation at {decree} under {ballot}")]
    ConflictingMutation {
        /// The decree.
        decree: Decree,
        /// The ballot both payloads carry.
        ballot: Ballot,
    },

    /// The prepare window is full.
    #[error("prepare list full (capacity {capacity})")]
    PrepareListFull {
        /// Window capacity.
        capacity: usize,
    },

    /// A learn message does not belong to the current session.
    #[error("learn signature mismatch: expected {expected:?}, got {got}")]
    SignatureMismatch {
        /// The active session's signature, if any.
        expected: Option<LearnSignature>,
        /// The presented signature.
        got: LearnSignature,
    },

    /// The referenced learner, node or session is unknown.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// An operation exceeded its timeout.
    #[error("operation timed out")]
    Timeout,

    /// A peer answered with an error code.
    #[error("remote error: {0}")]
    Remote(ErrorCode),

    /// Durable log failure.
    #[error("log error: {0}")]
    Log(String),

    /// Application failure.
    #[error("application error: {0}")]
    Application(String),

    /// Serialization or deserialization failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// The replica exhausted its recovery budget.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl ReplicaError {
    /// Taxonomy class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ReplicaError::StaleBallot { .. } | ReplicaError::StaleDecree { .. } => {
                ErrorClass::Stale
            }
            ReplicaError::Timeout | ReplicaError::Remote(_) => ErrorClass::Liveness,
            ReplicaError::Log(_)
            | ReplicaError::Application(_)
            | ReplicaError::Codec(_)
            | ReplicaError::Unrecoverable(_) => ErrorClass::LocalIo,
            ReplicaError::NotPrimary
            | ReplicaError::InvalidState { .. }
            | ReplicaError::InvalidTransition { .. }
            | ReplicaError::OutOfOrderDecree { .. }
            | ReplicaError::GapInCommitSequence { .. }
            | ReplicaError::ConflictingMutation { .. }
            | ReplicaError::PrepareListFull { .. }
            | ReplicaError::SignatureMismatch { .. }
            | ReplicaError::ObjectNotFound(_) => ErrorClass::Protocol,
        }
    }

    /// Wire code reported to the peer that caused this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ReplicaError::StaleBallot { .. } | ReplicaError::StaleDecree { .. } => {
                ErrorCode::StaleBallot
            }
            ReplicaError::NotPrimary => ErrorCode::NotPrimary,
            ReplicaError::InvalidState { .. } | ReplicaError::InvalidTransition { .. } => {
                ErrorCode::InvalidState
            }
            ReplicaError::OutOfOrderDecree { .. } | ReplicaError::GapInCommitSequence { .. } => {
                ErrorCode::OutOfOrderDecree
            }
            ReplicaError::ConflictingMutation { .. } => ErrorCode::ConflictingMutation,
            ReplicaError::PrepareListFull { .. } => ErrorCode::Throttled,
            ReplicaError::SignatureMismatch { .. } | ReplicaError::ObjectNotFound(_) => {
                ErrorCode::ObjectNotFound
            }
            ReplicaError::Timeout => ErrorCode::Timeout,
            ReplicaError::Remote(code) => *code,
            ReplicaError::Log(_)
            | ReplicaError::Application(_)
            | ReplicaError::Codec(_)
            | ReplicaError::Unrecoverable(_) => ErrorCode::LocalIo,
        }
    }
}

impl From<serde_json::Error> for ReplicaError {
    fn from(err: serde_json::Error) -> Self {
        ReplicaError::Codec(err.to_string())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_ballot_ordering() {
        let b0 = Ballot::ZERO;
        let b1 = Ballot::new(1);
        let b2 = Ballot::new(2);

        assert!(b0 < b1);
        assert!(b1 < b2);
        assert_eq!(b0.next(), b1);
        assert_eq!(b1.to_string(), "ballot(1)");
    }

    #[test]
    fn test_decree_arithmetic() {
        assert_eq!(Decree::ZERO.next(), Decree::new(1));
        assert_eq!(Decree::ZERO.prev(), Decree::ZERO);
        assert_eq!(Decree::new(10).distance_from(Decree::new(4)), 6);
        assert_eq!(Decree::new(4).distance_from(Decree::new(10)), 0);
        assert_eq!(Decree::new(7).to_string(), "decree(7)");
    }

    #[test]
    fn test_partition_status_voting() {
        assert!(PartitionStatus::Primary.is_voting_member());
        assert!(PartitionStatus::Secondary.is_voting_member());
        assert!(!PartitionStatus::PotentialSecondary.is_voting_member());
        assert!(!PartitionStatus::Inactive.is_voting_member());
        assert!(!PartitionStatus::Error.is_voting_member());
    }

    #[test]
    fn test_partition_configuration_status_of() {
        let config = PartitionConfiguration {
            pid: make_pid(),
            ballot: Ballot::new(3),
            primary: Some(make_addr(5001)),
            secondaries: vec![make_addr(5002), make_addr(5003)],
            last_committed_decree: Decree::new(10),
        };

        assert_eq!(config.status_of(&make_addr(5001)), PartitionStatus::Primary);
        assert_eq!(config.status_of(&make_addr(5003)), PartitionStatus::Secondary);
        assert_eq!(config.status_of(&make_addr(5009)), PartitionStatus::Inactive);
    }

    #[test]
    fn test_remove_secondary() {
        let mut config = PartitionConfiguration {
            pid: make_pid(),
            ballot: Ballot::new(3),
            primary: Some(make_addr(5001)),
            secondaries: vec![make_addr(5002), make_addr(5003)],
            last_committed_decree: Decree::ZERO,
        };

        assert!(config.remove_secondary(&make_addr(5002)));
        assert!(!config.remove_secondary(&make_addr(5002)));
        assert_eq!(config.secondaries, vec![make_addr(5003)]);
    }

    #[test]
    fn test_error_classification() {
        let stale = ReplicaError::StaleBallot {
            current: Ballot::new(3),
            seen: Ballot::new(2),
        };
        assert_eq!(stale.class(), ErrorClass::Stale);
        assert_eq!(stale.code(), ErrorCode::StaleBallot);
        assert!(stale.to_string().contains("stale ballot"));

        assert_eq!(ReplicaError::Timeout.class(), ErrorClass::Liveness);
        assert_eq!(
            ReplicaError::Log("disk full".into()).class(),
            ErrorClass::LocalIo
        );
        assert_eq!(
            ReplicaError::PrepareListFull { capacity: 4 }.code(),
            ErrorCode::Throttled
        );
        assert_eq!(
            ReplicaError::GapInCommitSequence {
                missing: Decree::new(3)
            }
            .class(),
            ErrorClass::Protocol
        );
    }

    #[test]
    fn test_replica_configuration_serde_roundtrip() {
        let config = ReplicaConfiguration {
            pid: make_pid(),
            ballot: Ballot::new(4),
            status: PartitionStatus::Secondary,
            primary: Some(make_addr(5001)),
            secondaries: vec![make_addr(5002)],
        };

        let json = serde_json::to_string(&config).expect("serialize");
        let decoded: ReplicaConfiguration = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(config, decoded);
    }
}
