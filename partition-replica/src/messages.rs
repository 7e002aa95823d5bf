//! Messages exchanged with clients, peer replicas and the meta server.
//!
//! Every peer message carries the partition id and a ballot (directly or in
//! the embedded configuration). Receivers reject anything below their
//! current ballot.
//!
//! ## Peer protocols
//!
//! ```text
//! Primary                         Secondary / Learner
//!   │── Prepare(config, mutation) ──>│   2-phase replication
//!   │<── PrepareAck(err, ballot) ────│
//!   │                                │
//!   │── GroupCheck(config, lcd) ────>│   liveness + commit point
//!   │<── GroupCheckReply ────────────│
//!   │                                │
//!   │── AddLearner(sig) ────────────>│   learning
//!   │<── Learn(sig, app decree) ─────│
//!   │── LearnReply(state) ──────────>│
//!   │<── LearnCompleted(sig) ────────│
//!   │── LearnCompletedReply ────────>│   learner becomes secondary
//!   │                                │
//!   │── Remove(config) ─────────────>│   back to inactive
//!   │                                │
//!   │<── CopyCheckpoint(durable) ────│   secondary adopts the
//!   │── CopyCheckpointReply ────────>│   primary's checkpoint
//! ```

use serde::{Deserialize, Serialize};

use crate::app::Checkpoint;
use crate::mutation::Mutation;
use crate::types::{
    Ballot, Decree, ErrorCode, LearnSignature, NodeAddress, PartitionConfiguration, PartitionId,
    PartitionStatus, ReplicaConfiguration,
};

// ============================================================================
// Client-facing
// ============================================================================

/// Identifier a client attaches to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req({})", self.0)
    }
}

/// Result reported to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientOutcome {
    /// Committed (writes) or served (reads).
    Success,
    /// This replica cannot serve the request; retry on the primary.
    NotPrimary,
    /// The replica's view is stale.
    StaleBallot,
    /// The prepare window is full; retry later.
    Throttled,
    /// No result within the client timeout.
    Timeout,
}

/// Reply to a client write or read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    /// The request this answers.
    pub request_id: RequestId,
    /// What happened.
    pub outcome: ClientOutcome,
    /// Decree assigned to a successful write.
    pub decree: Option<Decree>,
    /// Value returned by a successful read.
    pub value: Option<Vec<u8>>,
}

impl ClientResponse {
    /// A failure reply with no payload.
    pub fn failure(request_id: RequestId, outcome: ClientOutcome) -> Self {
        Self {
            request_id,
            outcome,
            decree: None,
            value: None,
        }
    }

    /// A committed write.
    pub fn committed(request_id: RequestId, decree: Decree) -> Self {
        Self {
            request_id,
            outcome: ClientOutcome::Success,
            decree: Some(decree),
            value: None,
        }
    }

    /// A served read.
    pub fn read(request_id: RequestId, value: Option<Vec<u8>>) -> Self {
        Self {
            request_id,
            outcome: ClientOutcome::Success,
            decree: None,
            value,
        }
    }
}

// ============================================================================
// Replication
// ============================================================================

/// Primary → secondary/learner: replicate one mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// Partition.
    pub pid: PartitionId,
    /// The configuration the receiver should hold, with its expected status.
    pub config: ReplicaConfiguration,
    /// The mutation; `last_committed_decree` carries the primary's commit point.
    pub mutation: Mutation,
}

/// Secondary/learner → primary: prepare acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareAck {
    /// Partition.
    pub pid: PartitionId,
    /// Outcome on the receiver.
    pub err: ErrorCode,
    /// The receiver's ballot after processing.
    pub ballot: Ballot,
    /// The acknowledged decree.
    pub decree: Decree,
    /// Ballot of the acknowledged prepare.
    pub request_ballot: Ballot,
    /// The receiver's status after processing.
    pub status: PartitionStatus,
    /// The receiver's commit point.
    pub last_committed_decree: Decree,
}

// ============================================================================
// Learning
// ============================================================================

/// Phase of a learning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LearnPhase {
    /// Catching up on committed state; live prepares are not accepted yet.
    WithoutPrepare,
    /// State installed; live prepares are accepted.
    WithPrepare,
    /// Caught up with the primary's commit point.
    Succeeded,
}

impl std::fmt::Display for LearnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LearnPhase::WithoutPrepare => "without_prepare",
            LearnPhase::WithPrepare => "with_prepare",
            LearnPhase::Succeeded => "succeeded",
        };
        f.write_str(name)
    }
}

/// Where the primary sourced the learned state from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LearnSource {
    /// Committed entries still in the prepare list.
    Cache,
    /// Records read from the durable log.
    Log,
    /// An application checkpoint plus the entries after it.
    App,
}

/// Learner → primary: request state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnRequest {
    /// Partition.
    pub pid: PartitionId,
    /// The learner.
    pub learner: NodeAddress,
    /// Session signature issued by the primary.
    pub signature: LearnSignature,
    /// Last decree the learner's application applied.
    pub last_committed_decree_in_app: Decree,
    /// The learner's log GC boundary.
    pub max_gced_decree: Decree,
}

/// State shipped to a learner.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LearnState {
    /// Decrees at or below this are not covered.
    pub from_decree_excluded: Decree,
    /// Highest decree covered.
    pub to_decree_included: Decree,
    /// Checkpoint to restore first, for `LearnSource::App`.
    pub checkpoint: Option<Checkpoint>,
    /// Committed mutations to replay, in decree order.
    pub mutations: Vec<Mutation>,
}

/// Primary → learner: learned state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnResponse {
    /// Partition.
    pub pid: PartitionId,
    /// Outcome on the primary.
    pub err: ErrorCode,
    /// The learner's expected configuration.
    pub config: ReplicaConfiguration,
    /// The session this answers.
    pub signature: LearnSignature,
    /// Where the state came from.
    pub source: LearnSource,
    /// The primary's commit point when the response was built.
    pub last_committed_decree: Decree,
    /// First decree the primary forwards as live prepares.
    pub prepare_start_decree: Option<Decree>,
    /// Highest decree the primary had prepared; everything above the commit
    /// point follows as forwarded prepares.
    pub max_prepared_decree: Decree,
    /// The shipped state.
    pub state: LearnState,
}

/// Learner → primary: caught up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnNotifyRequest {
    /// Partition.
    pub pid: PartitionId,
    /// The learner.
    pub learner: NodeAddress,
    /// Session signature.
    pub signature: LearnSignature,
    /// The learner's ballot.
    pub ballot: Ballot,
    /// The learner's applied decree.
    pub last_committed_decree: Decree,
    /// The learner's highest prepared decree.
    pub max_prepared_decree: Decree,
}

/// Primary → learner: completion acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnNotifyResponse {
    /// Partition.
    pub pid: PartitionId,
    /// Outcome on the primary.
    pub err: ErrorCode,
    /// Session signature.
    pub signature: LearnSignature,
    /// The learner's new configuration, with status secondary.
    pub config: ReplicaConfiguration,
}

// ============================================================================
// Group check
// ============================================================================

/// Primary → member: liveness check. Also used to add a learner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCheckRequest {
    /// Partition.
    pub pid: PartitionId,
    /// The receiver's expected configuration.
    pub config: ReplicaConfiguration,
    /// The primary's commit point.
    pub last_committed_decree: Decree,
    /// Learn session signature, for learners.
    pub learner_signature: Option<LearnSignature>,
}

/// Member → primary: group check answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCheckResponse {
    /// Partition.
    pub pid: PartitionId,
    /// Outcome on the member.
    pub err: ErrorCode,
    /// The member.
    pub node: NodeAddress,
    /// The member's ballot.
    pub ballot: Ballot,
    /// The member's status.
    pub status: PartitionStatus,
    /// The member's applied decree.
    pub last_committed_decree_in_app: Decree,
    /// The member's prepare list commit point.
    pub last_committed_decree_in_prepare_list: Decree,
    /// The learner's session phase, if learning.
    pub learner_phase: Option<LearnPhase>,
    /// The learner's session signature, if learning.
    pub learner_signature: Option<LearnSignature>,
}

/// Primary → member: leave the membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveReplicaRequest {
    /// Partition.
    pub pid: PartitionId,
    /// The receiver's new configuration (status inactive).
    pub config: ReplicaConfiguration,
}

// ============================================================================
// Checkpoint copy
// ============================================================================

/// Secondary → primary: send me your latest checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyCheckpointRequest {
    /// Partition.
    pub pid: PartitionId,
    /// The secondary's ballot.
    pub ballot: Ballot,
    /// The secondary's durable decree; older checkpoints are not worth sending.
    pub last_durable_decree: Decree,
}

/// Primary → secondary: the primary's latest checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyCheckpointResponse {
    /// Partition.
    pub pid: PartitionId,
    /// Outcome on the primary.
    pub err: ErrorCode,
    /// The primary's ballot.
    pub ballot: Ballot,
    /// The checkpoint, if the primary holds a newer one.
    pub checkpoint: Option<Checkpoint>,
}

// ============================================================================
// Envelope
// ============================================================================

/// Any message one replica sends another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Replicate a mutation.
    Prepare(PrepareRequest),
    /// Acknowledge a prepare.
    PrepareAck(PrepareAck),
    /// Request learned state.
    Learn(LearnRequest),
    /// Learned state.
    LearnReply(LearnResponse),
    /// Liveness check.
    GroupCheck(GroupCheckRequest),
    /// Group check answer.
    GroupCheckReply(GroupCheckResponse),
    /// Start learning with a new signature.
    AddLearner(GroupCheckRequest),
    /// Learner caught up.
    LearnCompleted(LearnNotifyRequest),
    /// Completion acknowledged.
    LearnCompletedReply(LearnNotifyResponse),
    /// Leave the membership.
    Remove(RemoveReplicaRequest),
    /// Ask the primary for its checkpoint.
    CopyCheckpoint(CopyCheckpointRequest),
    /// The primary's checkpoint.
    CopyCheckpointReply(CopyCheckpointResponse),
}

impl PeerMessage {
    /// Partition the message belongs to.
    pub fn pid(&self) -> PartitionId {
        match self {
            PeerMessage::Prepare(m) => m.pid,
            PeerMessage::PrepareAck(m) => m.pid,
            PeerMessage::Learn(m) => m.pid,
            PeerMessage::LearnReply(m) => m.pid,
            PeerMessage::GroupCheck(m) | PeerMessage::AddLearner(m) => m.pid,
            PeerMessage::GroupCheckReply(m) => m.pid,
            PeerMessage::LearnCompleted(m) => m.pid,
            PeerMessage::LearnCompletedReply(m) => m.pid,
            PeerMessage::Remove(m) => m.pid,
            PeerMessage::CopyCheckpoint(m) => m.pid,
            PeerMessage::CopyCheckpointReply(m) => m.pid,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::Prepare(_) => "prepare",
            PeerMessage::PrepareAck(_) => "prepare_ack",
            PeerMessage::Learn(_) => "learn",
            PeerMessage::LearnReply(_) => "learn_reply",
            PeerMessage::GroupCheck(_) => "group_check",
            PeerMessage::GroupCheckReply(_) => "group_check_reply",
            PeerMessage::AddLearner(_) => "add_learner",
            PeerMessage::LearnCompleted(_) => "learn_completed",
            PeerMessage::LearnCompletedReply(_) => "learn_completed_reply",
            PeerMessage::Remove(_) => "remove",
            PeerMessage::CopyCheckpoint(_) => "copy_checkpoint",
            PeerMessage::CopyCheckpointReply(_) => "copy_checkpoint_reply",
        }
    }
}

/// A peer message with its route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender.
    pub from: NodeAddress,
    /// Receiver.
    pub to: NodeAddress,
    /// Payload.
    pub message: PeerMessage,
}

// ============================================================================
// Meta server
// ============================================================================

/// Kind of configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigType {
    /// Make `node` primary of an unserved partition.
    AssignPrimary,
    /// Promote secondary `node` to primary.
    UpgradeToPrimary,
    /// Add `node` as a learner; sent to the primary.
    AddSecondary,
    /// Promote learner `node` to secondary.
    UpgradeToSecondary,
    /// The primary steps down to secondary.
    DowngradeToSecondary,
    /// Demote `node` to inactive.
    DowngradeToInactive,
    /// Remove `node` from the partition.
    Remove,
}

impl std::fmt::Display for ConfigType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A configuration change, proposed by the meta server or requested from it.
///
/// As a proposal, `config` is the current authoritative configuration. As a
/// request, `config` is the proposed new configuration at the next ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationUpdateRequest {
    /// Configuration (see type docs).
    pub config: PartitionConfiguration,
    /// What changes.
    pub kind: ConfigType,
    /// The node the change is about.
    pub node: NodeAddress,
}

/// Meta server answer to a [`ConfigurationUpdateRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationUpdateResponse {
    /// Outcome.
    pub err: ErrorCode,
    /// The authoritative configuration after processing.
    pub config: PartitionConfiguration,
}
