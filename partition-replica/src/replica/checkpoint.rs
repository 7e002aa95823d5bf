//! Periodic checkpoint and log garbage collection.
//!
//! The log keeps `log_retain_decrees` decrees below the application's durable
//! point so learners that are only slightly behind can still be served from
//! it. Everything older is collected, and the committed part of the prepare
//! list below the collection boundary is dropped with it.
//!
//! With `copy_checkpoint_from_primary` a secondary does not checkpoint on its
//! own. It fetches the primary's latest checkpoint, restores it and re-applies
//! the committed decrees above it from its prepare list or log.

use tracing::{debug, info};

use super::{Replica, ReplicaOutput};
use crate::app::{Application, Checkpoint};
use crate::log::MutationLog;
use crate::messages::{CopyCheckpointRequest, CopyCheckpointResponse, PeerMessage};
use crate::types::{Decree, ErrorCode, NodeAddress, PartitionStatus, ReplicaError};

impl<A: Application, L: MutationLog> Replica<A, L> {
    /// Run the checkpoint timer now.
    pub fn on_checkpoint_timer(&mut self) -> ReplicaOutput {
        if !self.closed {
            self.checkpoint_if_due();
        }
        self.take_output()
    }

    pub(crate) fn checkpoint_if_due(&mut self) {
        let status = self.current_status();
        if !matches!(status, PartitionStatus::Primary | PartitionStatus::Secondary) {
            return;
        }

        if self.app.last_committed_decree() > self.app.last_durable_decree() {
            if status == PartitionStatus::Secondary && self.options.copy_checkpoint_from_primary {
                self.request_primary_checkpoint();
            } else {
                match self.app.checkpoint() {
                    Ok(checkpoint) => {
                        info!(
                            pid = %self.pid,
                            node = %self.node,
                            decree = %checkpoint.decree,
                            "checkpoint taken"
                        );
                    }
                    Err(err) => {
                        self.handle_local_failure(err);
                        return;
                    }
                }
            }
        }
        self.collect_log_garbage();
    }

    fn request_primary_checkpoint(&mut self) {
        let Some(primary) = self.configuration().primary else {
            return;
        };
        let request = CopyCheckpointRequest {
            pid: self.pid,
            ballot: self.current_ballot(),
            last_durable_decree: self.app.last_durable_decree(),
        };
        debug!(
            pid = %self.pid,
            primary = %primary,
            durable = %request.last_durable_decree,
            "requesting primary checkpoint"
        );
        self.send(primary, PeerMessage::CopyCheckpoint(request));
    }

    fn collect_log_garbage(&mut self) {
        let durable = self.app.last_durable_decree();
        let boundary = Decree::new(durable.0.saturating_sub(self.options.log_retain_decrees));
        if boundary.prev() > self.log.max_gced_decree() {
            match self.log.garbage_collect(boundary) {
                Ok(removed) => {
                    debug!(
                        pid = %self.pid,
                        before = %boundary,
                        removed = removed,
                        "log garbage collected"
                    );
                }
                Err(err) => {
                    self.handle_local_failure(err);
                    return;
                }
            }
        }
        let gced = self.log.max_gced_decree();
        self.prepare_list.truncate_before(gced.next());
    }

    /// Serve a secondary's request for the latest checkpoint.
    pub fn on_copy_checkpoint(
        &mut self,
        from: NodeAddress,
        request: CopyCheckpointRequest,
    ) -> ReplicaOutput {
        let (err, checkpoint) = if !self.is_primary() {
            (ErrorCode::InvalidState, None)
        } else if request.ballot != self.current_ballot() {
            (ErrorCode::StaleBallot, None)
        } else {
            let newer = self
                .app
                .last_checkpoint()
                .filter(|c| c.decree > request.last_durable_decree);
            (ErrorCode::Ok, newer)
        };
        let response = CopyCheckpointResponse {
            pid: self.pid,
            err,
            ballot: self.current_ballot(),
            checkpoint,
        };
        self.send(from, PeerMessage::CopyCheckpointReply(response));
        self.take_output()
    }

    /// Adopt the primary's checkpoint if it is newer than ours.
    pub fn on_copy_checkpoint_reply(
        &mut self,
        from: NodeAddress,
        response: CopyCheckpointResponse,
    ) -> ReplicaOutput {
        let usable = response.err.is_ok()
            && response.ballot == self.current_ballot()
            && self.current_status() == PartitionStatus::Secondary;
        if !usable {
            debug!(
                pid = %self.pid,
                from = %from,
                err = %response.err,
                remote_ballot = %response.ballot,
                "checkpoint copy ignored"
            );
            return self.take_output();
        }
        let Some(checkpoint) = response.checkpoint else {
            return self.take_output();
        };

        let applied = self.app.last_committed_decree();
        if checkpoint.decree <= self.app.last_durable_decree() || checkpoint.decree > applied {
            debug!(
                pid = %self.pid,
                decree = %checkpoint.decree,
                applied = %applied,
                "copied checkpoint not usable"
            );
            return self.take_output();
        }

        match self.adopt_checkpoint(&checkpoint, applied) {
            Ok(true) => {
                info!(
                    pid = %self.pid,
                    node = %self.node,
                    decree = %checkpoint.decree,
                    "primary checkpoint adopted"
                );
                self.collect_log_garbage();
            }
            Ok(false) => {
                debug!(
                    pid = %self.pid,
                    decree = %checkpoint.decree,
                    "decrees above copied checkpoint are gone"
                );
            }
            Err(err) => self.handle_local_failure(err),
        }
        self.take_output()
    }

    /// Restore `checkpoint`, then re-apply the committed decrees up to `applied`.
    ///
    /// Returns `false` without touching the application if those decrees are
    /// no longer held locally.
    fn adopt_checkpoint(
        &mut self,
        checkpoint: &Checkpoint,
        applied: Decree,
    ) -> Result<bool, ReplicaError> {
        let from = checkpoint.decree.next();
        let tail = match self.prepare_list.range(from, applied) {
            Some(tail) => tail,
            None => match self.committed_from_log(from, applied)? {
                Some(tail) => tail,
                None => return Ok(false),
            },
        };
        self.app.restore(checkpoint)?;
        for mutation in &tail {
            self.app.apply(mutation)?;
        }
        Ok(true)
    }
}
