//! Configuration changes: meta server proposals and replies, config syncs,
//! removal by the primary, and meta server disconnects.
//!
//! Every change goes through [`Replica::update_local_configuration`], which
//! validates it against the transition table and then runs the side effects:
//!
//! - leaving `primary` fails pending client writes and drops primary state;
//! - entering `primary`, or a ballot increase while primary, re-prepares the
//!   uncommitted tail under the current ballot (or issues an empty
//!   reconciliation write) and re-signs every learner;
//! - a ballot increase, or leaving `potential_secondary`, ends the learn
//!   session.

use tracing::{debug, info, warn};

use super::{PrimaryContext, Replica, ReplicaOutput};
use crate::app::Application;
use crate::configuration::Transition;
use crate::log::MutationLog;
use crate::messages::{
    ClientOutcome, ConfigType, ConfigurationUpdateRequest, ConfigurationUpdateResponse,
    GroupCheckRequest, PeerMessage, RemoveReplicaRequest,
};
use crate::mutation::Mutation;
use crate::types::{
    Decree, LearnSignature, NodeAddress, PartitionConfiguration, PartitionStatus,
    ReplicaConfiguration, ReplicaError,
};

impl<A: Application, L: MutationLog> Replica<A, L> {
    // ========================================================================
    // Entry points
    // ========================================================================

    /// Handle a configuration proposal from the meta server.
    pub fn on_config_proposal(&mut self, request: ConfigurationUpdateRequest) -> ReplicaOutput {
        if request.config.pid != self.pid {
            warn!(pid = %self.pid, got = %request.config.pid, "proposal for another partition");
            return self.take_output();
        }
        if request.config.ballot < self.current_ballot() {
            debug!(
                pid = %self.pid,
                ballot = %self.current_ballot(),
                proposal = %request.config.ballot,
                "ignoring stale proposal"
            );
            return self.take_output();
        }
        if self.current_status() == PartitionStatus::Error {
            warn!(pid = %self.pid, kind = %request.kind, "replica in error, ignoring proposal");
            return self.take_output();
        }

        info!(
            pid = %self.pid,
            node = %self.node,
            kind = %request.kind,
            target = %request.node,
            ballot = %request.config.ballot,
            "configuration proposal"
        );

        match request.kind {
            ConfigType::AssignPrimary | ConfigType::UpgradeToPrimary => {
                self.assign_primary(&request);
            }
            kind => {
                if !self.is_primary() {
                    warn!(
                        pid = %self.pid,
                        kind = %kind,
                        status = %self.current_status(),
                        "proposal needs a primary"
                    );
                    return self.take_output();
                }
                match kind {
                    ConfigType::AddSecondary => self.add_potential_secondary(request.node),
                    ConfigType::UpgradeToSecondary => {
                        if self.configuration().secondaries.contains(&request.node) {
                            let proposal = self.next_partition_config();
                            self.request_meta(
                                ConfigType::UpgradeToSecondary,
                                request.node,
                                proposal,
                            );
                        } else {
                            warn!(
                                pid = %self.pid,
                                node = %request.node,
                                "learner has not caught up yet"
                            );
                        }
                    }
                    ConfigType::DowngradeToSecondary => {
                        if request.node == self.node {
                            self.downgrade_to_secondary_on_primary();
                        } else {
                            warn!(
                                pid = %self.pid,
                                node = %request.node,
                                "downgrade to secondary targets another node"
                            );
                        }
                    }
                    ConfigType::DowngradeToInactive => {
                        self.downgrade_to_inactive_on_primary(
                            request.node,
                            ConfigType::DowngradeToInactive,
                        );
                    }
                    ConfigType::Remove => {
                        self.downgrade_to_inactive_on_primary(request.node, ConfigType::Remove);
                    }
                    ConfigType::AssignPrimary | ConfigType::UpgradeToPrimary => {}
                }
            }
        }
        self.take_output()
    }

    /// Apply an authoritative configuration pushed by the meta server.
    pub fn on_config_sync(&mut self, config: PartitionConfiguration) -> ReplicaOutput {
        self.apply_partition_config(&config);
        self.take_output()
    }

    /// Handle the meta server's answer to a configuration update request.
    pub fn on_update_configuration_reply(
        &mut self,
        response: ConfigurationUpdateResponse,
    ) -> ReplicaOutput {
        let request = self.primary.meta_requests.pop_front();

        if !response.err.is_ok() {
            warn!(
                pid = %self.pid,
                err = %response.err,
                kind = ?request.as_ref().map(|r| r.kind),
                meta_ballot = %response.config.ballot,
                "configuration update rejected"
            );
            if response.config.ballot > self.current_ballot() {
                self.apply_partition_config(&response.config);
            }
            if let Some(request) = request {
                if request.kind == ConfigType::UpgradeToSecondary && self.is_primary() {
                    self.retry_upgrade(request.node);
                }
            }
        } else {
            self.apply_partition_config(&response.config);
            if let Some(request) = request {
                let removal = matches!(
                    request.kind,
                    ConfigType::DowngradeToInactive | ConfigType::Remove
                );
                if removal && request.node != self.node {
                    let view = ReplicaConfiguration {
                        pid: self.pid,
                        ballot: response.config.ballot,
                        status: PartitionStatus::Inactive,
                        primary: response.config.primary,
                        secondaries: response.config.secondaries.clone(),
                    };
                    self.send(
                        request.node,
                        PeerMessage::Remove(RemoveReplicaRequest {
                            pid: self.pid,
                            config: view,
                        }),
                    );
                }
            }
        }

        if self.is_primary() {
            self.reissue_downgrades();
        }
        self.take_output()
    }

    /// Handle a removal ordered by the primary.
    pub fn on_remove(&mut self, from: NodeAddress, request: RemoveReplicaRequest) -> ReplicaOutput {
        if request.config.ballot < self.current_ballot() {
            debug!(
                pid = %self.pid,
                from = %from,
                ballot = %self.current_ballot(),
                seen = %request.config.ballot,
                "ignoring stale remove"
            );
            return self.take_output();
        }
        if self.is_primary() {
            warn!(pid = %self.pid, from = %from, "primary cannot be removed by a peer");
            return self.take_output();
        }

        let mut view = request.config;
        view.status = PartitionStatus::Inactive;
        match self.update_local_configuration(view) {
            Ok(_) => {
                info!(
                    pid = %self.pid,
                    node = %self.node,
                    from = %from,
                    "removed from partition"
                );
            }
            Err(err) => warn!(pid = %self.pid, error = %err, "remove rejected"),
        }
        self.take_output()
    }

    /// The meta server became unreachable.
    ///
    /// Primaries and secondaries become inactive at the same ballot and may
    /// later resume their role without a ballot change.
    pub fn on_meta_server_disconnected(&mut self) -> ReplicaOutput {
        let status = self.current_status();
        if matches!(status, PartitionStatus::Primary | PartitionStatus::Secondary) {
            let view = self.view_for(PartitionStatus::Inactive);
            match self.update_local_configuration(view) {
                Ok(_) => {
                    self.config.mark_inactive_transient();
                    warn!(
                        pid = %self.pid,
                        node = %self.node,
                        was = %status,
                        "meta server disconnected"
                    );
                }
                Err(err) => {
                    warn!(
                        pid = %self.pid,
                        error = %err,
                        "could not enter transient inactive"
                    );
                }
            }
        }
        self.take_output()
    }

    // ========================================================================
    // The single place configuration changes
    // ========================================================================

    /// Install `new` and run the side effects of the transition.
    pub(crate) fn update_local_configuration(
        &mut self,
        new: ReplicaConfiguration,
    ) -> Result<Transition, ReplicaError> {
        let transition = self.config.apply(new)?;
        let from = transition.from;
        let to = transition.to;

        if from == PartitionStatus::Primary && to != PartitionStatus::Primary {
            // A new ballot may commit other mutations at the pending decrees.
            let outcome = if transition.ballot_changed() {
                ClientOutcome::StaleBallot
            } else {
                ClientOutcome::NotPrimary
            };
            self.fail_pending_clients(outcome);
            self.primary = PrimaryContext::new(self.options.group_check_max_missed_periods);
        }

        if self.learner.is_some() {
            let keep = to == PartitionStatus::PotentialSecondary && !transition.ballot_changed();
            if !keep {
                if to == PartitionStatus::Secondary {
                    info!(pid = %self.pid, node = %self.node, "learner promoted to secondary");
                } else {
                    debug!(pid = %self.pid, node = %self.node, to = %to, "learn session reset");
                }
                self.learner = None;
            }
        }

        if to == PartitionStatus::Primary {
            if from != PartitionStatus::Primary || transition.ballot_changed() {
                self.reset_primary_membership(transition.ballot_changed());
                self.reprepare_uncommitted();
            } else {
                self.sync_group_check_members();
            }
        }
        Ok(transition)
    }

    /// Apply a meta server configuration, skipping what does not concern us.
    fn apply_partition_config(&mut self, config: &PartitionConfiguration) {
        if config.pid != self.pid {
            warn!(pid = %self.pid, got = %config.pid, "config for another partition");
            return;
        }
        let current = self.current_ballot();
        let status = self.current_status();
        if status == PartitionStatus::Error {
            debug!(pid = %self.pid, "replica in error, ignoring config");
            return;
        }
        if config.ballot < current {
            debug!(
                pid = %self.pid,
                ballot = %current,
                seen = %config.ballot,
                "ignoring stale config"
            );
            return;
        }

        let new_status = config.status_of(&self.node);
        if config.ballot == current && new_status == status {
            debug!(pid = %self.pid, ballot = %current, "config already applied");
            return;
        }
        if status == PartitionStatus::PotentialSecondary
            && new_status == PartitionStatus::Inactive
        {
            debug!(
                pid = %self.pid,
                ballot = %config.ballot,
                "learner not yet known to meta server"
            );
            return;
        }

        if let Err(err) = self.update_local_configuration(config.replica_view(new_status)) {
            warn!(
                pid = %self.pid,
                node = %self.node,
                error = %err,
                ballot = %config.ballot,
                "config rejected"
            );
        }
    }

    // ========================================================================
    // Primary-side membership operations
    // ========================================================================

    /// Ask the meta server to make this node primary.
    fn assign_primary(&mut self, request: &ConfigurationUpdateRequest) {
        if request.node != self.node {
            warn!(pid = %self.pid, target = %request.node, "primary assignment for another node");
            return;
        }
        if self.is_primary() {
            debug!(pid = %self.pid, "already primary");
            return;
        }

        let mut proposal = request.config.clone();
        proposal.ballot = request.config.ballot.max(self.current_ballot()).next();
        proposal.primary = Some(self.node);
        proposal.secondaries.retain(|s| *s != self.node);
        proposal.last_committed_decree = self.last_committed_decree();
        self.request_meta(request.kind, self.node, proposal);
    }

    /// Start feeding `node` as a learner.
    pub(crate) fn add_potential_secondary(&mut self, node: NodeAddress) {
        if node == self.node || self.configuration().secondaries.contains(&node) {
            warn!(pid = %self.pid, node = %node, "node is already a member");
            return;
        }
        let signature = self.next_signature();
        self.primary.learners.insert(
            node,
            super::RemoteLearner {
                signature,
                prepare_start_decree: None,
                prepare_end_decree: Decree::ZERO,
            },
        );
        self.primary.group_check.add_member(node, self.now);
        info!(pid = %self.pid, learner = %node, signature = %signature, "adding learner");
        self.send_add_learner(node, signature);
    }

    pub(crate) fn send_add_learner(&mut self, node: NodeAddress, signature: LearnSignature) {
        let request = GroupCheckRequest {
            pid: self.pid,
            config: self.view_for(PartitionStatus::PotentialSecondary),
            last_committed_decree: self.last_committed_decree(),
            learner_signature: Some(signature),
        };
        self.send(node, PeerMessage::AddLearner(request));
    }

    /// Count a caught-up learner in the quorum and ask the meta server to
    /// record it as a secondary.
    pub(crate) fn upgrade_to_secondary_on_primary(&mut self, node: NodeAddress) {
        if self.primary.learners.remove(&node).is_none() {
            warn!(pid = %self.pid, node = %node, "upgrade for unknown learner");
            return;
        }
        let mut view = self.configuration().clone();
        if !view.secondaries.contains(&node) {
            view.secondaries.push(node);
        }
        if let Err(err) = self.update_local_configuration(view) {
            warn!(pid = %self.pid, node = %node, error = %err, "could not add secondary locally");
            return;
        }
        let proposal = self.next_partition_config();
        info!(
            pid = %self.pid,
            node = %node,
            ballot = %proposal.ballot,
            "upgrading learner to secondary"
        );
        self.request_meta(ConfigType::UpgradeToSecondary, node, proposal);
    }

    fn retry_upgrade(&mut self, node: NodeAddress) {
        let mut view = self.configuration().clone();
        if !view.secondaries.contains(&node) {
            view.secondaries.push(node);
            if let Err(err) = self.update_local_configuration(view) {
                warn!(pid = %self.pid, node = %node, error = %err, "could not re-add secondary");
                return;
            }
        }
        let proposal = self.next_partition_config();
        self.request_meta(ConfigType::UpgradeToSecondary, node, proposal);
    }

    fn downgrade_to_secondary_on_primary(&mut self) {
        let mut proposal = self.next_partition_config();
        proposal.primary = None;
        if !proposal.secondaries.contains(&self.node) {
            proposal.secondaries.push(self.node);
        }
        self.request_meta(ConfigType::DowngradeToSecondary, self.node, proposal);
    }

    /// Take `node` out of the membership. Learners are dropped at once;
    /// members go through the meta server first.
    pub(crate) fn downgrade_to_inactive_on_primary(&mut self, node: NodeAddress, kind: ConfigType) {
        if self.primary.learners.remove(&node).is_some() {
            self.primary.group_check.remove_member(&node);
            info!(pid = %self.pid, learner = %node, "removing learner");
            let view = self.view_for(PartitionStatus::Inactive);
            self.send(
                node,
                PeerMessage::Remove(RemoveReplicaRequest {
                    pid: self.pid,
                    config: view,
                }),
            );
            return;
        }

        let mut proposal = self.next_partition_config();
        if node == self.node {
            proposal.primary = None;
        } else if !proposal.secondaries.contains(&node) {
            debug!(pid = %self.pid, node = %node, "node is not a member");
            return;
        }
        proposal.secondaries.retain(|s| *s != node);
        self.request_meta(kind, node, proposal);
    }

    /// Re-request removal of secondaries still marked unreachable.
    fn reissue_downgrades(&mut self) {
        let stuck: Vec<NodeAddress> = self
            .primary
            .unreachable
            .iter()
            .filter(|n| self.configuration().secondaries.contains(n))
            .copied()
            .collect();
        for node in stuck {
            let queued = self
                .primary
                .meta_requests
                .iter()
                .any(|r| r.node == node && r.kind == ConfigType::DowngradeToInactive);
            if !queued {
                self.downgrade_to_inactive_on_primary(node, ConfigType::DowngradeToInactive);
            }
        }
    }

    pub(crate) fn request_meta(
        &mut self,
        kind: ConfigType,
        node: NodeAddress,
        config: PartitionConfiguration,
    ) {
        let request = ConfigurationUpdateRequest { config, kind, node };
        debug!(
            pid = %self.pid,
            kind = %kind,
            node = %node,
            ballot = %request.config.ballot,
            "configuration update request"
        );
        self.primary.meta_requests.push_back(request.clone());
        self.out.meta_requests.push(request);
    }

    /// Current local configuration at the next ballot.
    pub(crate) fn next_partition_config(&self) -> PartitionConfiguration {
        let current = self.configuration();
        PartitionConfiguration {
            pid: self.pid,
            ballot: current.ballot.next(),
            primary: current.primary,
            secondaries: current.secondaries.clone(),
            last_committed_decree: self.last_committed_decree(),
        }
    }

    // ========================================================================
    // Becoming primary
    // ========================================================================

    fn reset_primary_membership(&mut self, ballot_changed: bool) {
        let secondaries = self.configuration().secondaries.clone();
        self.primary.pending.clear();
        self.primary.unreachable.retain(|n| secondaries.contains(n));
        self.sync_group_check_members();

        if ballot_changed {
            let learners: Vec<NodeAddress> = self.primary.learners.keys().copied().collect();
            for node in learners {
                let signature = self.next_signature();
                if let Some(learner) = self.primary.learners.get_mut(&node) {
                    learner.signature = signature;
                    learner.prepare_start_decree = None;
                    learner.prepare_end_decree = Decree::ZERO;
                }
                debug!(
                    pid = %self.pid,
                    learner = %node,
                    signature = %signature,
                    "re-signing learner"
                );
                self.send_add_learner(node, signature);
            }
        }
    }

    fn sync_group_check_members(&mut self) {
        let now = self.now;
        let mut members = self.live_secondaries();
        members.extend(self.primary.learners.keys().copied());

        let tracked: Vec<NodeAddress> = self
            .primary
            .group_check
            .records()
            .map(|(n, _)| *n)
            .collect();
        for node in tracked {
            if !members.contains(&node) {
                self.primary.group_check.remove_member(&node);
            }
        }
        for node in members {
            if !self.primary.group_check.contains(&node) {
                self.primary.group_check.add_member(node, now);
            }
        }
    }

    /// Re-prepare the uncommitted tail under the current ballot, or write an
    /// empty mutation to establish this ballot's commit point.
    fn reprepare_uncommitted(&mut self) {
        let ballot = self.current_ballot();
        let tail = self.prepare_list.restamp_uncommitted(ballot);
        if tail.is_empty() {
            let decree = self.prepare_list.max_decree().next();
            debug!(pid = %self.pid, ballot = %ballot, decree = %decree, "reconciliation write");
            self.init_prepare(Mutation::reconciliation(decree, ballot));
        } else {
            info!(
                pid = %self.pid,
                ballot = %ballot,
                count = tail.len(),
                "re-preparing uncommitted mutations"
            );
            for mutation in tail {
                self.replicate(mutation);
                if !self.is_primary() {
                    return;
                }
            }
        }
    }
}
