//! Learning: how a potential secondary catches up with the primary.
//!
//! ```text
//! Learner                                   Primary
//!    │<──────── AddLearner(sig) ──────────────│  add_potential_secondary
//!    │── Learn(sig, app decree) ─────────────>│
//!    │                                        │  pick source:
//!    │                                        │    cache → log → checkpoint
//!    │<──────── LearnReply(state) ────────────│  prepare_start = lcd + 1
//!    │<──────── Prepare(d ≥ prepare_start) ───│  forwarded live
//!    │  apply state, accept prepares          │
//!    │── LearnCompleted(sig) ────────────────>│  count learner in quorum,
//!    │<──────── LearnCompletedReply ──────────│  ask meta server to upgrade
//!    │  potential_secondary → secondary       │
//! ```
//!
//! Every session is identified by a signature the primary draws at random.
//! Messages carrying another signature are ignored, so replies to an
//! abandoned session can never be mixed into a new one.

use tracing::{debug, info, warn};

use super::{LearnSession, Replica, ReplicaOutput};
use crate::app::Application;
use crate::log::MutationLog;
use crate::messages::{
    GroupCheckRequest, LearnNotifyRequest, LearnNotifyResponse, LearnPhase, LearnRequest,
    LearnResponse, LearnSource, LearnState, PeerMessage, PrepareRequest,
};
use crate::mutation::Mutation;
use crate::types::{
    Decree, ErrorCode, LearnSignature, NodeAddress, PartitionStatus, ReplicaError,
};

impl<A: Application, L: MutationLog> Replica<A, L> {
    // ========================================================================
    // Learner side
    // ========================================================================

    /// Handle an invitation to learn from the primary.
    pub fn on_add_learner(
        &mut self,
        from: NodeAddress,
        request: GroupCheckRequest,
    ) -> ReplicaOutput {
        if request.config.ballot < self.current_ballot() {
            debug!(
                pid = %self.pid,
                from = %from,
                ballot = %self.current_ballot(),
                seen = %request.config.ballot,
                "stale learner invitation"
            );
            return self.take_output();
        }
        self.join_as_learner(from, &request);
        self.take_output()
    }

    /// Become a potential secondary learning from `from`.
    ///
    /// Returns whether a session with the request's signature is running.
    pub(crate) fn join_as_learner(
        &mut self,
        from: NodeAddress,
        request: &GroupCheckRequest,
    ) -> bool {
        let Some(signature) = request.learner_signature else {
            warn!(pid = %self.pid, from = %from, "learner invitation without signature");
            return false;
        };
        if request.config.ballot < self.current_ballot() {
            return false;
        }
        if self.is_primary() {
            warn!(pid = %self.pid, from = %from, "primary invited to learn");
            return false;
        }
        if request.config.status != PartitionStatus::PotentialSecondary {
            warn!(
                pid = %self.pid,
                from = %from,
                status = %request.config.status,
                "invitation with wrong status"
            );
            return false;
        }
        if self.learner.as_ref().is_some_and(|s| s.signature == signature) {
            return true;
        }

        let adopt = self.current_status() != PartitionStatus::PotentialSecondary
            || request.config.ballot > self.current_ballot();
        if adopt {
            if let Err(err) = self.update_local_configuration(request.config.clone()) {
                warn!(pid = %self.pid, from = %from, error = %err, "cannot become learner");
                return false;
            }
        }
        self.start_learning(from, signature, request.last_committed_decree);
        true
    }

    fn start_learning(&mut self, primary: NodeAddress, signature: LearnSignature, target: Decree) {
        info!(
            pid = %self.pid,
            node = %self.node,
            primary = %primary,
            signature = %signature,
            app_decree = %self.app.last_committed_decree(),
            target = %target,
            "learning started"
        );
        self.learner = Some(LearnSession {
            signature,
            primary,
            phase: LearnPhase::WithoutPrepare,
            target_decree: target,
            prepare_start_decree: None,
            prepare_end_decree: Decree::ZERO,
            awaiting_tail: false,
            local_retries: 0,
            remote_retries: 0,
            request_outstanding: false,
            deadline: self.now,
            retry_at: None,
        });
        self.init_learn();
    }

    fn init_learn(&mut self) {
        let deadline = self.now + self.options.learn_timeout;
        let Some(session) = self.learner.as_mut() else {
            return;
        };
        session.request_outstanding = true;
        session.awaiting_tail = false;
        session.deadline = deadline;
        session.retry_at = None;
        let primary = session.primary;
        let request = LearnRequest {
            pid: self.pid,
            learner: self.node,
            signature: session.signature,
            last_committed_decree_in_app: self.app.last_committed_decree(),
            max_gced_decree: self.log.max_gced_decree(),
        };
        debug!(
            pid = %self.pid,
            primary = %primary,
            signature = %request.signature,
            app_decree = %request.last_committed_decree_in_app,
            "learn request"
        );
        self.send(primary, PeerMessage::Learn(request));
    }

    /// Handle the primary's learn response.
    pub fn on_learn_reply(&mut self, from: NodeAddress, response: LearnResponse) -> ReplicaOutput {
        let current = self.learner.as_ref().map(|s| s.signature);
        if current != Some(response.signature)
            || self.current_status() != PartitionStatus::PotentialSecondary
        {
            debug!(
                pid = %self.pid,
                from = %from,
                signature = %response.signature,
                "learn reply for another session"
            );
            return self.take_output();
        }
        if let Some(session) = self.learner.as_mut() {
            session.request_outstanding = false;
        }

        if !response.err.is_ok() {
            self.handle_learning_error(false, ReplicaError::Remote(response.err));
            return self.take_output();
        }
        if response.config.ballot != self.current_ballot() {
            self.handle_learning_error(
                false,
                ReplicaError::StaleBallot {
                    current: self.current_ballot(),
                    seen: response.config.ballot,
                },
            );
            return self.take_output();
        }

        if let Err(err) = self.apply_learn_state(&response) {
            self.handle_learning_error(true, err);
            return self.take_output();
        }

        let app_decree = self.app.last_committed_decree();
        self.rebase_prepare_list(app_decree);
        let caught_up = app_decree >= response.last_committed_decree;
        let deadline = self.now + self.options.learn_timeout;
        if let Some(session) = self.learner.as_mut() {
            session.phase = LearnPhase::WithPrepare;
            session.prepare_start_decree = Some(
                response
                    .prepare_start_decree
                    .unwrap_or_else(|| response.last_committed_decree.next()),
            );
            session.prepare_end_decree = response.max_prepared_decree;
            session.target_decree = response.last_committed_decree;
            session.remote_retries = 0;
            if caught_up {
                session.awaiting_tail = true;
                session.request_outstanding = true;
                session.deadline = deadline;
            }
        }
        info!(
            pid = %self.pid,
            node = %self.node,
            source = ?response.source,
            from_excluded = %response.state.from_decree_excluded,
            to_included = %response.state.to_decree_included,
            app_decree = %app_decree,
            caught_up = caught_up,
            "learned state applied"
        );

        if caught_up {
            self.try_complete_learning();
        } else {
            self.init_learn();
        }
        self.take_output()
    }

    /// Install the shipped state: an optional checkpoint, then mutations.
    fn apply_learn_state(&mut self, response: &LearnResponse) -> Result<(), ReplicaError> {
        let state = &response.state;
        let diverged = self.app.last_committed_decree() > response.last_committed_decree;
        match &state.checkpoint {
            Some(checkpoint) => {
                if diverged || checkpoint.decree > self.app.last_committed_decree() {
                    self.app.restore(checkpoint)?;
                    debug!(pid = %self.pid, decree = %checkpoint.decree, "checkpoint restored");
                }
            }
            None if diverged => {
                return Err(ReplicaError::InvalidState {
                    status: self.current_status(),
                    operation: "apply learned state ahead of primary",
                });
            }
            None => {}
        }

        for mutation in &state.mutations {
            let applied = self.app.last_committed_decree();
            if mutation.decree <= applied {
                continue;
            }
            if mutation.decree != applied.next() {
                return Err(ReplicaError::GapInCommitSequence {
                    missing: applied.next(),
                });
            }
            self.log.append(mutation)?;
            self.app.apply(mutation)?;
        }
        Ok(())
    }

    /// Restart the prepare list at `decree`, keeping entries above it that
    /// were prepared under the current ballot.
    ///
    /// Anything older was never confirmed by this primary and could commit
    /// with a different payload under its ballot.
    fn rebase_prepare_list(&mut self, decree: Decree) {
        let ballot = self.current_ballot();
        let kept: Vec<Mutation> = self
            .prepare_list
            .uncommitted()
            .filter(|m| m.decree > decree && m.ballot >= ballot)
            .cloned()
            .collect();
        self.prepare_list.reset(decree);
        for mutation in kept {
            if self.prepare_list.prepare(mutation).is_err() {
                break;
            }
        }
    }

    /// Report completion once every forwarded prepare arrived.
    ///
    /// Until then the session waits under the learn timeout; a lost forward
    /// makes it time out and learn again.
    pub(crate) fn try_complete_learning(&mut self) {
        let max_prepared = self.prepare_list.max_decree();
        let Some(session) = self.learner.as_mut() else {
            return;
        };
        if !session.awaiting_tail {
            return;
        }
        let expected = session.prepare_end_decree;
        if max_prepared < expected {
            debug!(
                pid = %self.pid,
                max_prepared = %max_prepared,
                expected = %expected,
                "waiting for forwarded prepares"
            );
            return;
        }
        session.awaiting_tail = false;
        session.phase = LearnPhase::Succeeded;
        self.notify_learn_completion();
    }

    fn notify_learn_completion(&mut self) {
        let deadline = self.now + self.options.learn_timeout;
        let Some(session) = self.learner.as_mut() else {
            return;
        };
        session.request_outstanding = true;
        session.deadline = deadline;
        session.retry_at = None;
        let primary = session.primary;
        let request = LearnNotifyRequest {
            pid: self.pid,
            learner: self.node,
            signature: session.signature,
            ballot: self.config.current_ballot(),
            last_committed_decree: self.app.last_committed_decree(),
            max_prepared_decree: self.prepare_list.max_decree(),
        };
        self.send(primary, PeerMessage::LearnCompleted(request));
    }

    /// Handle the primary's answer to a completion notification.
    pub fn on_learn_completion_notification_reply(
        &mut self,
        from: NodeAddress,
        response: LearnNotifyResponse,
    ) -> ReplicaOutput {
        if self.learner.as_ref().map(|s| s.signature) != Some(response.signature) {
            debug!(pid = %self.pid, from = %from, "completion reply for another session");
            return self.take_output();
        }
        if let Some(session) = self.learner.as_mut() {
            session.request_outstanding = false;
        }

        if !response.err.is_ok() {
            self.handle_learning_error(false, ReplicaError::Remote(response.err));
            return self.take_output();
        }

        let mut view = response.config;
        view.status = PartitionStatus::Secondary;
        if let Err(err) = self.update_local_configuration(view) {
            warn!(pid = %self.pid, from = %from, error = %err, "could not become secondary");
            self.handle_learning_error(false, err);
        }
        self.take_output()
    }

    fn handle_learning_error(&mut self, local: bool, err: ReplicaError) {
        let now = self.now;
        let backoff = self.options.learn_retry_backoff;
        let max_local = self.options.learn_max_local_retries;
        let Some(session) = self.learner.as_mut() else {
            return;
        };
        session.request_outstanding = false;
        session.awaiting_tail = false;
        session.phase = LearnPhase::WithoutPrepare;
        let target = session.target_decree;

        if local {
            session.local_retries += 1;
            let retries = session.local_retries;
            if retries > max_local {
                self.handle_local_failure(ReplicaError::Unrecoverable(format!(
                    "learning failed {retries} times: {err}"
                )));
                return;
            }
            session.retry_at = Some(now + backoff);
            warn!(
                pid = %self.pid,
                node = %self.node,
                target = %target,
                retries = retries,
                error = %err,
                "local learn error"
            );
        } else {
            session.remote_retries += 1;
            let retries = session.remote_retries;
            session.retry_at = Some(now + backoff * retries);
            warn!(
                pid = %self.pid,
                node = %self.node,
                target = %target,
                retries = retries,
                error = %err,
                "remote learn error"
            );
        }
    }

    pub(crate) fn check_learn_timers(&mut self) {
        let Some(session) = self.learner.as_ref() else {
            return;
        };
        if session.request_outstanding {
            if self.now >= session.deadline {
                self.handle_learning_error(false, ReplicaError::Timeout);
            }
            return;
        }
        if session.retry_at.is_some_and(|at| self.now >= at) {
            self.init_learn();
        }
    }

    // ========================================================================
    // Primary side
    // ========================================================================

    /// Serve a learn request.
    pub fn on_learn(&mut self, from: NodeAddress, request: LearnRequest) -> ReplicaOutput {
        if !self.is_primary() {
            self.send_learn_error(from, request.signature, ErrorCode::InvalidState);
            return self.take_output();
        }
        let known = self
            .primary
            .learners
            .get(&request.learner)
            .is_some_and(|l| l.signature == request.signature);
        if !known {
            debug!(
                pid = %self.pid,
                learner = %request.learner,
                signature = %request.signature,
                "unknown learn session"
            );
            self.send_learn_error(from, request.signature, ErrorCode::ObjectNotFound);
            return self.take_output();
        }

        let (source, state) = match self.build_learn_state(request.last_committed_decree_in_app) {
            Ok(built) => built,
            Err(err) => {
                self.send_learn_error(from, request.signature, ErrorCode::LocalIo);
                self.handle_local_failure(err);
                return self.take_output();
            }
        };

        let last_committed = self.last_committed_decree();
        let prepare_start = last_committed.next();
        let max_prepared = self.prepare_list.max_decree();
        if let Some(learner) = self.primary.learners.get_mut(&request.learner) {
            learner.prepare_start_decree = Some(prepare_start);
            learner.prepare_end_decree = max_prepared;
        }
        info!(
            pid = %self.pid,
            learner = %request.learner,
            source = ?source,
            learner_decree = %request.last_committed_decree_in_app,
            to = %state.to_decree_included,
            prepare_start = %prepare_start,
            "serving learner"
        );

        let learner_view = self.view_for(PartitionStatus::PotentialSecondary);
        self.send(
            from,
            PeerMessage::LearnReply(LearnResponse {
                pid: self.pid,
                err: ErrorCode::Ok,
                config: learner_view.clone(),
                signature: request.signature,
                source,
                last_committed_decree: last_committed,
                prepare_start_decree: Some(prepare_start),
                max_prepared_decree: max_prepared,
                state,
            }),
        );

        let forwarded: Vec<Mutation> = self
            .prepare_list
            .uncommitted()
            .map(|m| m.for_wire(last_committed))
            .collect();
        for mutation in forwarded {
            self.send(
                from,
                PeerMessage::Prepare(PrepareRequest {
                    pid: self.pid,
                    config: learner_view.clone(),
                    mutation,
                }),
            );
        }
        self.take_output()
    }

    fn send_learn_error(&mut self, to: NodeAddress, signature: LearnSignature, err: ErrorCode) {
        let response = LearnResponse {
            pid: self.pid,
            err,
            config: self.view_for(PartitionStatus::PotentialSecondary),
            signature,
            source: LearnSource::Cache,
            last_committed_decree: self.last_committed_decree(),
            prepare_start_decree: None,
            max_prepared_decree: self.prepare_list.max_decree(),
            state: LearnState::default(),
        };
        self.send(to, PeerMessage::LearnReply(response));
    }

    /// Pick the cheapest source covering everything after `learner_decree`.
    fn build_learn_state(
        &mut self,
        learner_decree: Decree,
    ) -> Result<(LearnSource, LearnState), ReplicaError> {
        let last_committed = self.last_committed_decree();

        if learner_decree <= last_committed {
            let start = learner_decree.next();
            if let Some(mutations) = self.prepare_list.range(start, last_committed) {
                return Ok((
                    LearnSource::Cache,
                    LearnState {
                        from_decree_excluded: learner_decree,
                        to_decree_included: last_committed,
                        checkpoint: None,
                        mutations: committed_copies(mutations),
                    },
                ));
            }
            if let Some(mutations) = self.committed_from_log(start, last_committed)? {
                return Ok((
                    LearnSource::Log,
                    LearnState {
                        from_decree_excluded: learner_decree,
                        to_decree_included: last_committed,
                        checkpoint: None,
                        mutations: committed_copies(mutations),
                    },
                ));
            }
        }

        let mut reused = None;
        if let Some(checkpoint) = self.app.last_checkpoint() {
            let tail_start = checkpoint.decree.next();
            let tail = match self.prepare_list.range(tail_start, last_committed) {
                Some(tail) => Some(tail),
                None => self.committed_from_log(tail_start, last_committed)?,
            };
            if let Some(tail) = tail {
                reused = Some((checkpoint, tail));
            }
        }
        let (checkpoint, tail) = match reused {
            Some(found) => found,
            None => (self.app.checkpoint()?, Vec::new()),
        };
        Ok((
            LearnSource::App,
            LearnState {
                from_decree_excluded: Decree::ZERO,
                to_decree_included: last_committed,
                checkpoint: Some(checkpoint),
                mutations: committed_copies(tail),
            },
        ))
    }

    /// Contiguous log records for `[from, to]`, if the log still has them.
    pub(crate) fn committed_from_log(
        &self,
        from: Decree,
        to: Decree,
    ) -> Result<Option<Vec<Mutation>>, ReplicaError> {
        if from > to {
            return Ok(Some(Vec::new()));
        }
        if from <= self.log.max_gced_decree() {
            return Ok(None);
        }
        let records: Vec<Mutation> = self
            .log
            .read_from(from)?
            .take_while(|m| m.decree <= to)
            .collect();
        let contiguous = records.len() as u64 == to.0 - from.0 + 1
            && records
                .iter()
                .zip(from.0..)
                .all(|(m, d)| m.decree.0 == d);
        Ok(contiguous.then_some(records))
    }

    /// Handle a learner's report that it caught up.
    pub fn on_learn_completion_notification(
        &mut self,
        from: NodeAddress,
        request: LearnNotifyRequest,
    ) -> ReplicaOutput {
        let err = if !self.is_primary() {
            ErrorCode::InvalidState
        } else if request.ballot != self.current_ballot() {
            ErrorCode::StaleBallot
        } else {
            let session = self
                .primary
                .learners
                .get(&request.learner)
                .map(|l| (l.signature, l.prepare_start_decree, l.prepare_end_decree));
            match session {
                Some((signature, prepare_start, prepare_end)) if signature == request.signature => {
                    if prepare_start.is_none() || request.max_prepared_decree < prepare_end {
                        ErrorCode::InvalidState
                    } else {
                        self.upgrade_to_secondary_on_primary(request.learner);
                        if self.configuration().secondaries.contains(&request.learner) {
                            ErrorCode::Ok
                        } else {
                            ErrorCode::InvalidState
                        }
                    }
                }
                _ if self.configuration().secondaries.contains(&request.learner) => ErrorCode::Ok,
                _ => ErrorCode::ObjectNotFound,
            }
        };

        if !err.is_ok() {
            debug!(pid = %self.pid, learner = %request.learner, err = %err, "completion rejected");
        }
        let response = LearnNotifyResponse {
            pid: self.pid,
            err,
            signature: request.signature,
            config: self.view_for(PartitionStatus::Secondary),
        };
        self.send(from, PeerMessage::LearnCompletedReply(response));
        self.take_output()
    }
}

fn committed_copies(mutations: Vec<Mutation>) -> Vec<Mutation> {
    mutations
        .into_iter()
        .map(|m| {
            let decree = m.decree;
            m.for_wire(decree)
        })
        .collect()
}
