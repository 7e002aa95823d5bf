//! The replica state machine.
//!
//! A [`Replica`] owns one partition on one node. It is a plain state machine:
//! every input (peer message, client request, meta server proposal, timer)
//! goes through a `&mut self` entry point that runs to completion and returns
//! a [`ReplicaOutput`] listing what to send. It performs no I/O of its own
//! apart from calls into the injected [`Application`] and [`MutationLog`].
//!
//! ## Normal operation
//!
//! ```text
//! Client ──write──► Primary
//!                     │ log.append
//!                     ├──Prepare──► Secondary₁ ── log.append
//!                     ├──Prepare──► Secondary₂ ── log.append
//!                     │◄─PrepareAck─┤
//!                     │◄─PrepareAck─┘
//!                     │ commit (every live member acked)
//!                     │ app.apply
//! Client ◄──success───┘
//!                     └─ commit point piggybacked on the next
//!                        Prepare / GroupCheck
//! ```
//!
//! ## Modules
//!
//! | Module | Entry points |
//! |--------|--------------|
//! | `prepare` | client write/read, prepare, prepare ack |
//! | `learn` | add learner, learn, learn reply, completion notification |
//! | `check` | group check broadcast and replies |
//! | `config_update` | meta proposals, config sync, remove, disconnect |
//! | `failure` | local and remote failure handling |
//! | `checkpoint` | checkpoint timer and log GC |

mod check;
mod checkpoint;
mod config_update;
mod failure;
mod learn;
mod prepare;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::app::Application;
use crate::configuration::ConfigurationState;
use crate::group_check::{GroupCheckRecord, GroupCheckTracker};
use crate::log::MutationLog;
use crate::messages::{
    ClientResponse, ConfigurationUpdateRequest, Envelope, LearnPhase, PeerMessage, RequestId,
};
use crate::options::ReplicationOptions;
use crate::prepare_list::PrepareList;
use crate::types::{
    Ballot, Decree, LearnSignature, NodeAddress, PartitionId, PartitionStatus,
    ReplicaConfiguration, ReplicaError,
};

// ============================================================================
// Replica Output
// ============================================================================

/// Everything a replica wants done after processing one input.
///
/// The caller routes `messages` to peers, `meta_requests` to the meta server
/// and `client_replies` to waiting clients.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplicaOutput {
    /// Messages to peer replicas.
    pub messages: Vec<Envelope>,
    /// Configuration update requests for the meta server.
    pub meta_requests: Vec<ConfigurationUpdateRequest>,
    /// Replies to client requests.
    pub client_replies: Vec<ClientResponse>,
}

impl ReplicaOutput {
    /// An output with nothing to do.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.meta_requests.is_empty() && self.client_replies.is_empty()
    }

    /// Append another output to this one.
    pub fn merge(&mut self, other: ReplicaOutput) {
        self.messages.extend(other.messages);
        self.meta_requests.extend(other.meta_requests);
        self.client_replies.extend(other.client_replies);
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time view of a replica for observers and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSnapshot {
    /// Partition.
    pub pid: PartitionId,
    /// This node.
    pub node: NodeAddress,
    /// Current ballot.
    pub ballot: Ballot,
    /// Current status.
    pub status: PartitionStatus,
    /// Current primary.
    pub primary: Option<NodeAddress>,
    /// Current secondaries.
    pub secondaries: Vec<NodeAddress>,
    /// Prepare list commit point.
    pub last_committed_decree: Decree,
    /// Highest prepared decree.
    pub max_prepared_decree: Decree,
    /// Highest decree the application applied.
    pub app_last_committed_decree: Decree,
    /// Highest decree covered by an application checkpoint.
    pub app_last_durable_decree: Decree,
    /// Highest durably logged decree.
    pub log_durable_point: Decree,
    /// Log garbage collection boundary.
    pub log_max_gced_decree: Decree,
    /// Phase of this node's learn session, if learning.
    pub learner_phase: Option<LearnPhase>,
    /// Learners this primary is feeding.
    pub learners: Vec<NodeAddress>,
    /// Secondaries this primary treats as unreachable.
    pub unreachable: Vec<NodeAddress>,
    /// Group check records held by this primary.
    pub group_check: Vec<(NodeAddress, GroupCheckRecord)>,
}

// ============================================================================
// Primary bookkeeping
// ============================================================================

/// A prepare waiting for acknowledgments.
#[derive(Debug, Clone)]
pub(crate) struct PendingPrepare {
    pub(crate) ballot: Ballot,
    pub(crate) waiting: BTreeSet<NodeAddress>,
    pub(crate) sent_at: Duration,
}

/// A learner as seen by the primary.
#[derive(Debug, Clone)]
pub(crate) struct RemoteLearner {
    pub(crate) signature: LearnSignature,
    pub(crate) prepare_start_decree: Option<Decree>,
    pub(crate) prepare_end_decree: Decree,
}

/// State only a primary holds. Reset whenever the role or ballot changes.
#[derive(Debug)]
pub(crate) struct PrimaryContext {
    pub(crate) pending: BTreeMap<Decree, PendingPrepare>,
    pub(crate) clients: BTreeMap<Decree, Vec<RequestId>>,
    pub(crate) learners: BTreeMap<NodeAddress, RemoteLearner>,
    pub(crate) group_check: GroupCheckTracker,
    pub(crate) unreachable: BTreeSet<NodeAddress>,
    pub(crate) meta_requests: VecDeque<ConfigurationUpdateRequest>,
}

impl PrimaryContext {
    fn new(max_missed_periods: u32) -> Self {
        Self {
            pending: BTreeMap::new(),
            clients: BTreeMap::new(),
            learners: BTreeMap::new(),
            group_check: GroupCheckTracker::new(max_missed_periods),
            unreachable: BTreeSet::new(),
            meta_requests: VecDeque::new(),
        }
    }
}

// ============================================================================
// Learner bookkeeping
// ============================================================================

/// A learn session on the learner side.
#[derive(Debug, Clone)]
pub(crate) struct LearnSession {
    pub(crate) signature: LearnSignature,
    pub(crate) primary: NodeAddress,
    pub(crate) phase: LearnPhase,
    pub(crate) target_decree: Decree,
    pub(crate) prepare_start_decree: Option<Decree>,
    pub(crate) prepare_end_decree: Decree,
    pub(crate) awaiting_tail: bool,
    pub(crate) local_retries: u32,
    pub(crate) remote_retries: u32,
    pub(crate) request_outstanding: bool,
    pub(crate) deadline: Duration,
    pub(crate) retry_at: Option<Duration>,
}

// ============================================================================
// Replica
// ============================================================================

/// One partition replica on one node.
pub struct Replica<A: Application, L: MutationLog> {
    pid: PartitionId,
    node: NodeAddress,
    options: ReplicationOptions,
    config: ConfigurationState,
    prepare_list: PrepareList,
    app: A,
    log: L,
    primary: PrimaryContext,
    learner: Option<LearnSession>,
    rng: StdRng,
    now: Duration,
    next_group_check: Duration,
    next_checkpoint: Duration,
    closed: bool,
    out: ReplicaOutput,
}

impl<A: Application, L: MutationLog> Replica<A, L> {
    /// Create an inactive replica over a fresh or already restored application.
    pub fn new(
        pid: PartitionId,
        node: NodeAddress,
        options: ReplicationOptions,
        app: A,
        log: L,
    ) -> Self {
        let rng = match options.signature_seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ u64::from(node.0.port())),
            None => StdRng::from_os_rng(),
        };
        let prepare_list = PrepareList::new(
            app.last_committed_decree(),
            options.max_mutation_count_in_prepare_list,
        );
        Self {
            pid,
            node,
            config: ConfigurationState::new(node, pid),
            prepare_list,
            primary: PrimaryContext::new(options.group_check_max_missed_periods),
            learner: None,
            rng,
            now: Duration::ZERO,
            next_group_check: options.group_check_interval,
            next_checkpoint: options.checkpoint_interval,
            closed: false,
            out: ReplicaOutput::empty(),
            options,
            app,
            log,
        }
    }

    /// Open a replica from existing durable state.
    ///
    /// Log records above the application's commit point are replayed into the
    /// prepare list. Those known committed (from the commit points piggybacked
    /// on later records) are applied; the rest stay prepared. The replica
    /// starts inactive at the highest ballot found in the log.
    pub fn load(
        pid: PartitionId,
        node: NodeAddress,
        options: ReplicationOptions,
        app: A,
        log: L,
    ) -> Result<Self, ReplicaError> {
        let mut replica = Self::new(pid, node, options, app, log);
        let start = replica.app.last_committed_decree().next();
        let records: Vec<_> = replica.log.read_from(start)?.collect();

        let mut max_ballot = Ballot::ZERO;
        let mut known_committed = replica.app.last_committed_decree();
        let mut replayed = 0usize;
        for record in records {
            max_ballot = max_ballot.max(record.ballot);
            known_committed = known_committed.max(record.last_committed_decree);
            if replica.replay_mutation(record)? {
                replayed += 1;
            }
        }
        replica.reset_prepare_list_after_replay(known_committed)?;

        if max_ballot > Ballot::ZERO {
            let mut view = replica.config.current().clone();
            view.ballot = max_ballot;
            replica.config.apply(view)?;
        }

        info!(
            pid = %pid,
            node = %node,
            ballot = %replica.current_ballot(),
            replayed = replayed,
            last_committed = %replica.prepare_list.last_committed_decree(),
            max_prepared = %replica.prepare_list.max_decree(),
            "replica loaded"
        );
        Ok(replica)
    }

    /// Put one log record back into the prepare list. Returns whether it was kept.
    fn replay_mutation(
        &mut self,
        mut record: crate::mutation::Mutation,
    ) -> Result<bool, ReplicaError> {
        if record.decree <= self.prepare_list.last_committed_decree() {
            return Ok(false);
        }
        record.logged = true;
        match self.prepare_list.prepare(record) {
            Ok(_) => Ok(true),
            Err(ReplicaError::OutOfOrderDecree { expected, got }) => {
                warn!(
                    pid = %self.pid,
                    expected = %expected,
                    got = %got,
                    "log replay stopped at hole"
                );
                Ok(false)
            }
            Err(err) if err.class() == crate::types::ErrorClass::Stale => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Apply replayed entries up to `known_committed` and keep the rest prepared.
    fn reset_prepare_list_after_replay(
        &mut self,
        known_committed: Decree,
    ) -> Result<(), ReplicaError> {
        let target = known_committed.min(self.prepare_list.max_decree());
        let app = &mut self.app;
        self.prepare_list.commit(target, |m| app.apply(m))?;
        let boundary = self.log.max_gced_decree().next();
        self.prepare_list.truncate_before(boundary);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Partition this replica serves.
    pub fn pid(&self) -> PartitionId {
        self.pid
    }

    /// This node's address.
    pub fn node(&self) -> NodeAddress {
        self.node
    }

    /// Current ballot.
    pub fn current_ballot(&self) -> Ballot {
        self.config.current_ballot()
    }

    /// Current status.
    pub fn current_status(&self) -> PartitionStatus {
        self.config.current_status()
    }

    /// Current local configuration.
    pub fn configuration(&self) -> &ReplicaConfiguration {
        self.config.current()
    }

    /// Prepare list commit point.
    pub fn last_committed_decree(&self) -> Decree {
        self.prepare_list.last_committed_decree()
    }

    /// Highest prepared decree.
    pub fn max_prepared_decree(&self) -> Decree {
        self.prepare_list.max_decree()
    }

    /// Options in effect.
    pub fn options(&self) -> &ReplicationOptions {
        &self.options
    }

    /// The application.
    pub fn app(&self) -> &A {
        &self.app
    }

    /// The durable log.
    pub fn log(&self) -> &L {
        &self.log
    }

    /// Mutable access to the durable log, for failure injection.
    pub fn log_mut(&mut self) -> &mut L {
        &mut self.log
    }

    /// Mutable access to the application, for failure injection.
    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    /// Current logical time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Whether [`Replica::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Observer view of the replica.
    pub fn snapshot(&self) -> ReplicaSnapshot {
        let current = self.config.current();
        let is_primary = self.is_primary();
        ReplicaSnapshot {
            pid: self.pid,
            node: self.node,
            ballot: current.ballot,
            status: current.status,
            primary: current.primary,
            secondaries: current.secondaries.clone(),
            last_committed_decree: self.prepare_list.last_committed_decree(),
            max_prepared_decree: self.prepare_list.max_decree(),
            app_last_committed_decree: self.app.last_committed_decree(),
            app_last_durable_decree: self.app.last_durable_decree(),
            log_durable_point: self.log.durable_point(),
            log_max_gced_decree: self.log.max_gced_decree(),
            learner_phase: self.learner.as_ref().map(|s| s.phase),
            learners: if is_primary {
                self.primary.learners.keys().copied().collect()
            } else {
                Vec::new()
            },
            unreachable: if is_primary {
                self.primary.unreachable.iter().copied().collect()
            } else {
                Vec::new()
            },
            group_check: if is_primary {
                self.primary
                    .group_check
                    .records()
                    .map(|(n, r)| (*n, *r))
                    .collect()
            } else {
                Vec::new()
            },
        }
    }

    // ------------------------------------------------------------------------
    // Timers and lifecycle
    // ------------------------------------------------------------------------

    /// Advance logical time to `now` and run every due timer.
    pub fn on_tick(&mut self, now: Duration) -> ReplicaOutput {
        if now > self.now {
            self.now = now;
        }
        if self.closed {
            return self.take_output();
        }

        if self.is_primary() {
            self.check_prepare_timeouts();
        }
        if self.now >= self.next_group_check {
            self.next_group_check = self.now + self.options.group_check_interval;
            if self.is_primary() {
                self.broadcast_group_check();
            }
        }
        if self.learner.is_some() {
            self.check_learn_timers();
        }
        if self.now >= self.next_checkpoint {
            self.next_checkpoint = self.now + self.options.checkpoint_interval;
            self.checkpoint_if_due();
        }
        self.take_output()
    }

    /// Stop serving: fail pending writes and move to inactive.
    pub fn close(&mut self) -> ReplicaOutput {
        if self.closed {
            return self.take_output();
        }
        info!(
            pid = %self.pid,
            node = %self.node,
            status = %self.current_status(),
            "closing replica"
        );
        self.fail_pending_clients(crate::messages::ClientOutcome::NotPrimary);
        if self.current_status() != PartitionStatus::Error {
            let mut view = self.config.current().clone();
            view.status = PartitionStatus::Inactive;
            if let Err(err) = self.update_local_configuration(view) {
                warn!(pid = %self.pid, error = %err, "close could not deactivate replica");
            }
        }
        self.closed = true;
        self.take_output()
    }

    // ------------------------------------------------------------------------
    // Helpers shared by the submodules
    // ------------------------------------------------------------------------

    pub(crate) fn take_output(&mut self) -> ReplicaOutput {
        std::mem::take(&mut self.out)
    }

    pub(crate) fn is_primary(&self) -> bool {
        self.current_status() == PartitionStatus::Primary
    }

    pub(crate) fn send(&mut self, to: NodeAddress, message: PeerMessage) {
        debug!(pid = %self.pid, from = %self.node, to = %to, kind = message.name(), "send");
        self.out.messages.push(Envelope {
            from: self.node,
            to,
            message,
        });
    }

    pub(crate) fn reply_client(&mut self, response: ClientResponse) {
        self.out.client_replies.push(response);
    }

    /// Current configuration as the receiver with `status` should hold it.
    pub(crate) fn view_for(&self, status: PartitionStatus) -> ReplicaConfiguration {
        let mut view = self.config.current().clone();
        view.status = status;
        view
    }

    /// Secondaries that currently count toward the commit quorum.
    pub(crate) fn live_secondaries(&self) -> BTreeSet<NodeAddress> {
        self.config
            .current()
            .secondaries
            .iter()
            .filter(|s| !self.primary.unreachable.contains(s) && **s != self.node)
            .copied()
            .collect()
    }

    /// Commit the prepare list up to `decree`, applying through the application.
    ///
    /// Returns `false` if a local failure moved the replica to `error`.
    pub(crate) fn commit_to(&mut self, decree: Decree) -> bool {
        let app = &mut self.app;
        match self.prepare_list.commit(decree, |m| app.apply(m)) {
            Ok(_) => true,
            Err(err @ ReplicaError::GapInCommitSequence { .. }) => {
                debug!(pid = %self.pid, error = %err, "commit deferred");
                true
            }
            Err(err) => {
                self.handle_local_failure(err);
                false
            }
        }
    }

    /// Commit up to a commit point received from the primary.
    pub(crate) fn commit_soft(&mut self, point: Decree) -> bool {
        let target = point.min(self.prepare_list.max_decree());
        self.commit_to(target)
    }

    pub(crate) fn next_signature(&mut self) -> LearnSignature {
        use rand::Rng;
        LearnSignature(self.rng.random::<u64>())
    }

    pub(crate) fn fail_pending_clients(&mut self, outcome: crate::messages::ClientOutcome) {
        let clients = std::mem::take(&mut self.primary.clients);
        for request_id in clients.into_values().flatten() {
            self.reply_client(ClientResponse::failure(request_id, outcome));
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers to drive replicas by hand in unit tests.

    use super::*;
    use crate::app::InMemoryApplication;
    use crate::log::InMemoryMutationLog;
    use crate::types::test_support::{make_addr, make_pid};
    use crate::types::PartitionConfiguration;

    pub type TestReplica = Replica<InMemoryApplication, InMemoryMutationLog>;

    pub fn make_replica(port: u16) -> TestReplica {
        Replica::new(
            make_pid(),
            make_addr(port),
            ReplicationOptions::for_simulation(),
            InMemoryApplication::new(),
            InMemoryMutationLog::new(),
        )
    }

    pub fn partition_config(
        ballot: u64,
        primary: u16,
        secondaries: &[u16],
    ) -> PartitionConfiguration {
        PartitionConfiguration {
            pid: make_pid(),
            ballot: Ballot::new(ballot),
            primary: Some(make_addr(primary)),
            secondaries: secondaries.iter().map(|p| make_addr(*p)).collect(),
            last_committed_decree: Decree::ZERO,
        }
    }

    /// Install `config` directly through a config sync.
    pub fn install(replica: &mut TestReplica, config: &PartitionConfiguration) -> ReplicaOutput {
        replica.on_config_sync(config.clone())
    }

    /// Messages addressed to `to`.
    pub fn messages_to(output: &ReplicaOutput, to: NodeAddress) -> Vec<PeerMessage> {
        output
            .messages
            .iter()
            .filter(|e| e.to == to)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Deliver every message in `output` among `replicas` until quiet.
    /// Client replies and meta requests are collected and returned.
    pub fn pump(replicas: &mut [&mut TestReplica], output: ReplicaOutput) -> ReplicaOutput {
        let mut pending: VecDeque<Envelope> = output.messages.into();
        let mut collected = ReplicaOutput {
            messages: Vec::new(),
            meta_requests: output.meta_requests,
            client_replies: output.client_replies,
        };
        while let Some(envelope) = pending.pop_front() {
            if let Some(target) = replicas.iter_mut().find(|r| r.node() == envelope.to) {
                let out = crate::node::dispatch(&mut **target, envelope);
                pending.extend(out.messages);
                collected.meta_requests.extend(out.meta_requests);
                collected.client_replies.extend(out.client_replies);
            }
        }
        collected
    }
}
