//! Two-phase replication: client writes, prepares, acknowledgments, commits.
//!
//! A write is committed once the primary logged it and every secondary that
//! is still a live member acknowledged it. Members marked unreachable (by a
//! prepare timeout, an error ack, or missed group checks) stop counting as
//! soon as they are marked, which unblocks decrees waiting only on them.
//!
//! Commits happen strictly in decree order. Secondaries commit up to the
//! commit point piggybacked on each prepare.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use super::{PendingPrepare, Replica, ReplicaOutput};
use crate::app::Application;
use crate::log::MutationLog;
use crate::messages::{
    ClientOutcome, ClientResponse, LearnPhase, PeerMessage, PrepareAck, PrepareRequest, RequestId,
};
use crate::mutation::Mutation;
use crate::prepare_list::PrepareOutcome;
use crate::types::{Ballot, Decree, ErrorCode, NodeAddress, PartitionStatus, ReplicaError};

impl<A: Application, L: MutationLog> Replica<A, L> {
    // ========================================================================
    // Client path
    // ========================================================================

    /// Submit a client write. Only the primary accepts writes.
    pub fn on_client_write(&mut self, request_id: RequestId, payload: Vec<u8>) -> ReplicaOutput {
        if !self.is_primary() {
            debug!(
                pid = %self.pid,
                request = %request_id,
                status = %self.current_status(),
                "write rejected"
            );
            self.reply_client(ClientResponse::failure(request_id, ClientOutcome::NotPrimary));
            return self.take_output();
        }
        if self.prepare_list.is_full() {
            debug!(
                pid = %self.pid,
                request = %request_id,
                uncommitted = self.prepare_list.uncommitted_count(),
                "write throttled"
            );
            self.reply_client(ClientResponse::failure(request_id, ClientOutcome::Throttled));
            return self.take_output();
        }

        let decree = self.prepare_list.max_decree().next();
        let mutation = Mutation::new(decree, self.current_ballot(), payload);
        self.primary.clients.entry(decree).or_default().push(request_id);
        self.init_prepare(mutation);
        self.take_output()
    }

    /// Serve a client read from the application.
    ///
    /// Secondaries serve reads only when `allow_secondary_reads` is set.
    pub fn on_client_read(&mut self, request_id: RequestId, request: Vec<u8>) -> ReplicaOutput {
        let allowed = match self.current_status() {
            PartitionStatus::Primary => true,
            PartitionStatus::Secondary => self.options.allow_secondary_reads,
            _ => false,
        };
        if !allowed {
            self.reply_client(ClientResponse::failure(request_id, ClientOutcome::NotPrimary));
            return self.take_output();
        }

        match self.app.read(&request) {
            Ok(value) => self.reply_client(ClientResponse::read(request_id, value)),
            Err(err) => {
                self.reply_client(ClientResponse::failure(request_id, ClientOutcome::NotPrimary));
                self.handle_local_failure(err);
            }
        }
        self.take_output()
    }

    // ========================================================================
    // Primary
    // ========================================================================

    /// Put a new mutation in the prepare list and replicate it.
    pub(crate) fn init_prepare(&mut self, mutation: Mutation) {
        let decree = mutation.decree;
        match self.prepare_list.prepare(mutation.clone()) {
            Ok(_) => self.replicate(mutation),
            Err(err) => {
                let outcome = match err {
                    ReplicaError::PrepareListFull { .. } => ClientOutcome::Throttled,
                    _ => ClientOutcome::NotPrimary,
                };
                warn!(pid = %self.pid, decree = %decree, error = %err, "prepare rejected locally");
                if let Some(clients) = self.primary.clients.remove(&decree) {
                    for request_id in clients {
                        self.reply_client(ClientResponse::failure(request_id, outcome));
                    }
                }
            }
        }
    }

    /// Log a prepared mutation and send it to every live member.
    pub(crate) fn replicate(&mut self, mutation: Mutation) {
        let decree = mutation.decree;
        let last_committed = self.prepare_list.last_committed_decree();
        let mut record = mutation;
        record.last_committed_decree = last_committed;

        if let Err(err) = self.log.append(&record) {
            self.handle_local_failure(err);
            return;
        }
        self.prepare_list.mark_logged(decree);

        let waiting = self.live_secondaries();
        self.primary.pending.insert(
            decree,
            PendingPrepare {
                ballot: record.ballot,
                waiting: waiting.clone(),
                sent_at: self.now,
            },
        );

        let secondary_view = self.view_for(PartitionStatus::Secondary);
        for node in waiting {
            self.send(
                node,
                PeerMessage::Prepare(PrepareRequest {
                    pid: self.pid,
                    config: secondary_view.clone(),
                    mutation: record.for_wire(last_committed),
                }),
            );
        }

        let learners: Vec<NodeAddress> = self
            .primary
            .learners
            .iter()
            .filter(|(_, l)| l.prepare_start_decree.is_some_and(|start| decree >= start))
            .map(|(n, _)| *n)
            .collect();
        if !learners.is_empty() {
            let learner_view = self.view_for(PartitionStatus::PotentialSecondary);
            for node in learners {
                self.send(
                    node,
                    PeerMessage::Prepare(PrepareRequest {
                        pid: self.pid,
                        config: learner_view.clone(),
                        mutation: record.for_wire(last_committed),
                    }),
                );
            }
        }

        self.do_possible_commit_on_primary();
    }

    /// Commit every leading pending decree whose quorum is complete.
    pub(crate) fn do_possible_commit_on_primary(&mut self) {
        if !self.is_primary() {
            return;
        }
        let live = self.live_secondaries();
        loop {
            let (decree, ready) = match self.primary.pending.iter().next() {
                Some((decree, pending)) => (*decree, pending.waiting.is_disjoint(&live)),
                None => return,
            };
            let logged = self.prepare_list.get(decree).is_some_and(|m| m.logged);
            if !ready || !logged {
                return;
            }
            if !self.commit_to(decree) {
                return;
            }
            if self.prepare_list.last_committed_decree() < decree {
                return;
            }
            self.primary.pending.remove(&decree);
            debug!(pid = %self.pid, decree = %decree, ballot = %self.current_ballot(), "committed");
            if let Some(clients) = self.primary.clients.remove(&decree) {
                for request_id in clients {
                    self.reply_client(ClientResponse::committed(request_id, decree));
                }
            }
        }
    }

    /// Handle a prepare acknowledgment.
    pub fn on_prepare_reply(&mut self, from: NodeAddress, ack: PrepareAck) -> ReplicaOutput {
        if !self.is_primary() {
            debug!(pid = %self.pid, from = %from, "ack ignored, not primary");
            return self.take_output();
        }
        if ack.request_ballot != self.current_ballot() {
            debug!(
                pid = %self.pid,
                from = %from,
                ballot = %self.current_ballot(),
                ack_ballot = %ack.request_ballot,
                "stale ack ignored"
            );
            return self.take_output();
        }
        if self.primary.learners.contains_key(&from) {
            return self.take_output();
        }

        let matches = self
            .primary
            .pending
            .get(&ack.decree)
            .is_some_and(|p| p.ballot == ack.request_ballot);
        if !matches {
            debug!(pid = %self.pid, from = %from, decree = %ack.decree, "ack for settled decree");
            return self.take_output();
        }

        if ack.err.is_ok() {
            if let Some(pending) = self.primary.pending.get_mut(&ack.decree) {
                pending.waiting.remove(&from);
            }
            self.do_possible_commit_on_primary();
        } else {
            warn!(
                pid = %self.pid,
                from = %from,
                decree = %ack.decree,
                err = %ack.err,
                remote_ballot = %ack.ballot,
                remote_status = %ack.status,
                "prepare failed on secondary"
            );
            self.handle_remote_failure(from, "prepare error");
        }
        self.take_output()
    }

    /// Treat members that did not acknowledge an old enough prepare as failed.
    pub(crate) fn check_prepare_timeouts(&mut self) {
        let timeout = self.options.prepare_timeout;
        let now = self.now;
        let live = self.live_secondaries();
        let mut expired = BTreeSet::new();
        for pending in self.primary.pending.values() {
            if now.saturating_sub(pending.sent_at) >= timeout {
                expired.extend(pending.waiting.intersection(&live).copied());
            }
        }
        for node in expired {
            warn!(pid = %self.pid, node = %node, "prepare timed out");
            self.handle_remote_failure(node, "prepare timeout");
        }
    }

    // ========================================================================
    // Secondary / learner
    // ========================================================================

    /// Handle a prepare from the primary.
    pub fn on_prepare(&mut self, from: NodeAddress, request: PrepareRequest) -> ReplicaOutput {
        let mutation = request.mutation;
        let decree = mutation.decree;
        let request_ballot = mutation.ballot;

        if request.config.ballot < self.current_ballot() {
            debug!(
                pid = %self.pid,
                from = %from,
                ballot = %self.current_ballot(),
                seen = %request.config.ballot,
                decree = %decree,
                "stale prepare rejected"
            );
            self.send_prepare_ack(from, ErrorCode::StaleBallot, decree, request_ballot);
            return self.take_output();
        }

        let view_changed = request.config.ballot > self.current_ballot()
            || request.config.status != self.current_status();
        if view_changed {
            if let Err(err) = self.update_local_configuration(request.config) {
                debug!(pid = %self.pid, from = %from, error = %err, "prepare view rejected");
                self.send_prepare_ack(from, ErrorCode::InvalidState, decree, request_ballot);
                return self.take_output();
            }
        }

        let accept = match self.current_status() {
            PartitionStatus::Secondary => true,
            PartitionStatus::PotentialSecondary => self.learner.as_ref().is_some_and(|s| {
                s.phase != LearnPhase::WithoutPrepare
                    && s.prepare_start_decree.is_some_and(|start| decree >= start)
            }),
            _ => false,
        };
        if !accept {
            debug!(
                pid = %self.pid,
                from = %from,
                decree = %decree,
                status = %self.current_status(),
                "prepare not accepted"
            );
            self.send_prepare_ack(from, ErrorCode::InvalidState, decree, request_ballot);
            return self.take_output();
        }

        let piggybacked = mutation.last_committed_decree;
        if decree > self.prepare_list.last_committed_decree() {
            match self.prepare_list.prepare(mutation.clone()) {
                Ok(PrepareOutcome::Duplicate) => {}
                Ok(_) => {
                    if let Err(err) = self.log.append(&mutation) {
                        self.handle_local_failure(err);
                        self.send_prepare_ack(from, ErrorCode::LocalIo, decree, request_ballot);
                        return self.take_output();
                    }
                    self.prepare_list.mark_logged(decree);
                }
                Err(err) => {
                    warn!(
                        pid = %self.pid,
                        from = %from,
                        decree = %decree,
                        error = %err,
                        "prepare rejected"
                    );
                    self.send_prepare_ack(from, err.code(), decree, request_ballot);
                    return self.take_output();
                }
            }
        }

        if !self.commit_soft(piggybacked) {
            self.send_prepare_ack(from, ErrorCode::LocalIo, decree, request_ballot);
            return self.take_output();
        }
        self.send_prepare_ack(from, ErrorCode::Ok, decree, request_ballot);
        self.try_complete_learning();
        self.take_output()
    }

    fn send_prepare_ack(
        &mut self,
        to: NodeAddress,
        err: ErrorCode,
        decree: Decree,
        request_ballot: Ballot,
    ) {
        let ack = PrepareAck {
            pid: self.pid,
            err,
            ballot: self.current_ballot(),
            decree,
            request_ballot,
            status: self.current_status(),
            last_committed_decree: self.prepare_list.last_committed_decree(),
        };
        self.send(to, PeerMessage::PrepareAck(ack));
    }
}
