//! Failure handling.
//!
//! A local failure (log, application or learn exhaustion) is fatal for the
//! replica: it moves to `error` and stops serving. A remote failure seen by
//! the primary takes the peer out of the commit quorum immediately and asks
//! the meta server to remove it.

use tracing::{debug, error, info, warn};

use super::{Replica, ReplicaOutput};
use crate::app::Application;
use crate::log::MutationLog;
use crate::messages::{ClientOutcome, ConfigType};
use crate::types::{NodeAddress, PartitionStatus, ReplicaError};

impl<A: Application, L: MutationLog> Replica<A, L> {
    /// Force the replica into `error`, as if a local component had failed.
    pub fn inject_error(&mut self, err: ReplicaError) -> ReplicaOutput {
        self.handle_local_failure(err);
        self.take_output()
    }

    pub(crate) fn handle_local_failure(&mut self, err: ReplicaError) {
        error!(
            pid = %self.pid,
            node = %self.node,
            status = %self.current_status(),
            error = %err,
            "local failure"
        );
        if self.current_status() == PartitionStatus::Error {
            return;
        }
        self.fail_pending_clients(ClientOutcome::NotPrimary);
        let view = self.view_for(PartitionStatus::Error);
        if let Err(err) = self.update_local_configuration(view) {
            error!(pid = %self.pid, error = %err, "could not enter error state");
        }
    }

    /// Stop counting `node` toward the quorum.
    pub(crate) fn handle_remote_failure(&mut self, node: NodeAddress, reason: &'static str) {
        if !self.is_primary() {
            return;
        }

        if self.primary.learners.contains_key(&node) {
            info!(pid = %self.pid, learner = %node, reason = reason, "dropping learner");
            self.downgrade_to_inactive_on_primary(node, ConfigType::Remove);
            return;
        }

        if !self.configuration().secondaries.contains(&node) {
            debug!(pid = %self.pid, node = %node, reason = reason, "failure of non-member ignored");
            return;
        }

        if self.primary.unreachable.insert(node) {
            warn!(
                pid = %self.pid,
                node = %node,
                ballot = %self.current_ballot(),
                reason = reason,
                "secondary unreachable"
            );
            self.primary.group_check.remove_member(&node);
            for pending in self.primary.pending.values_mut() {
                pending.waiting.remove(&node);
            }
            let queued = self
                .primary
                .meta_requests
                .iter()
                .any(|r| r.node == node && r.kind == ConfigType::DowngradeToInactive);
            if !queued {
                self.downgrade_to_inactive_on_primary(node, ConfigType::DowngradeToInactive);
            }
        }

        self.do_possible_commit_on_primary();
    }
}
