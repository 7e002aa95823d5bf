//! Group check: the primary's periodic liveness round over every member.
//!
//! Each round carries the primary's configuration and commit point, so a
//! secondary that missed prepares still learns the newest ballot and commits
//! what it holds. A member that misses `group_check_max_missed_periods`
//! rounds in a row is treated as failed. Learners are checked too; a round
//! carrying a signature the learner does not know restarts its session.

use tracing::{debug, warn};

use super::{Replica, ReplicaOutput};
use crate::app::Application;
use crate::log::MutationLog;
use crate::messages::{GroupCheckRequest, GroupCheckResponse, PeerMessage};
use crate::types::{ErrorCode, LearnSignature, NodeAddress, PartitionStatus};

impl<A: Application, L: MutationLog> Replica<A, L> {
    pub(crate) fn broadcast_group_check(&mut self) {
        let failed = self.primary.group_check.begin_round();
        for node in failed {
            warn!(
                pid = %self.pid,
                node = %node,
                max_missed = self.options.group_check_max_missed_periods,
                "group check missed"
            );
            self.handle_remote_failure(node, "group check missed");
        }
        if !self.is_primary() {
            return;
        }

        let last_committed = self.last_committed_decree();
        let secondary_view = self.view_for(PartitionStatus::Secondary);
        for node in self.live_secondaries() {
            self.send(
                node,
                PeerMessage::GroupCheck(GroupCheckRequest {
                    pid: self.pid,
                    config: secondary_view.clone(),
                    last_committed_decree: last_committed,
                    learner_signature: None,
                }),
            );
        }

        let learners: Vec<(NodeAddress, LearnSignature)> = self
            .primary
            .learners
            .iter()
            .map(|(n, l)| (*n, l.signature))
            .collect();
        for (node, signature) in learners {
            self.send(
                node,
                PeerMessage::GroupCheck(GroupCheckRequest {
                    pid: self.pid,
                    config: self.view_for(PartitionStatus::PotentialSecondary),
                    last_committed_decree: last_committed,
                    learner_signature: Some(signature),
                }),
            );
        }
    }

    /// Handle a group check from the primary.
    pub fn on_group_check(
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
                "stale group check"
            );
            self.send_group_check_reply(from, ErrorCode::StaleBallot);
            return self.take_output();
        }

        if request.learner_signature.is_some() {
            let known = self.learner.as_ref().map(|s| s.signature) == request.learner_signature;
            let err = if known || self.join_as_learner(from, &request) {
                ErrorCode::Ok
            } else {
                ErrorCode::InvalidState
            };
            self.send_group_check_reply(from, err);
            return self.take_output();
        }

        let view_changed = request.config.ballot > self.current_ballot()
            || request.config.status != self.current_status();
        if view_changed {
            if let Err(err) = self.update_local_configuration(request.config) {
                warn!(pid = %self.pid, from = %from, error = %err, "group check view rejected");
                self.send_group_check_reply(from, ErrorCode::InvalidState);
                return self.take_output();
            }
        }

        if !self.commit_soft(request.last_committed_decree) {
            self.send_group_check_reply(from, ErrorCode::LocalIo);
            return self.take_output();
        }
        self.send_group_check_reply(from, ErrorCode::Ok);
        self.take_output()
    }

    fn send_group_check_reply(&mut self, to: NodeAddress, err: ErrorCode) {
        let response = GroupCheckResponse {
            pid: self.pid,
            err,
            node: self.node,
            ballot: self.current_ballot(),
            status: self.current_status(),
            last_committed_decree_in_app: self.app.last_committed_decree(),
            last_committed_decree_in_prepare_list: self.prepare_list.last_committed_decree(),
            learner_phase: self.learner.as_ref().map(|s| s.phase),
            learner_signature: self.learner.as_ref().map(|s| s.signature),
        };
        self.send(to, PeerMessage::GroupCheckReply(response));
    }

    /// Handle a member's answer to a group check.
    pub fn on_group_check_reply(
        &mut self,
        from: NodeAddress,
        response: GroupCheckResponse,
    ) -> ReplicaOutput {
        if !self.is_primary() {
            return self.take_output();
        }
        if response.ballot < self.current_ballot() {
            debug!(
                pid = %self.pid,
                from = %from,
                ballot = %self.current_ballot(),
                remote_ballot = %response.ballot,
                "stale group check reply ignored"
            );
            return self.take_output();
        }

        let healthy = response.err.is_ok()
            && !matches!(
                response.status,
                PartitionStatus::Error | PartitionStatus::Inactive
            );
        if !healthy {
            warn!(
                pid = %self.pid,
                node = %from,
                err = %response.err,
                status = %response.status,
                remote_ballot = %response.ballot,
                "group check failed"
            );
            self.handle_remote_failure(from, "group check error");
            return self.take_output();
        }

        self.primary.group_check.record_ack(&from, self.now);

        let expected = self.primary.learners.get(&from).map(|l| l.signature);
        if let Some(signature) = expected {
            if response.learner_signature != Some(signature) {
                debug!(pid = %self.pid, learner = %from, "learner lost its session, re-inviting");
                self.send_add_learner(from, signature);
            }
        }
        self.take_output()
    }
}
