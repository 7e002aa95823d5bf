//! Membership authority: the meta server's view of a partition.
//!
//! The meta server owns the authoritative [`PartitionConfiguration`] of every
//! partition. Replicas never change membership on their own: the primary
//! sends a [`ConfigurationUpdateRequest`] carrying the proposed configuration
//! at the next ballot, and the meta server either installs it or answers with
//! the configuration it currently holds.
//!
//! ```text
//! Meta server                       Primary
//!   │── proposal(AddSecondary X) ──>│   on_config_proposal
//!   │                               │   ... X learns ...
//!   │<── update(UpgradeToSecondary)─│   config at ballot + 1
//!   │── reply(ok, config) ─────────>│   on_update_configuration_reply
//! ```
//!
//! Placement policy (which node to add, when to move a primary) is not part
//! of this crate. [`InMemoryMetaServer`] only enforces ballot succession and
//! that each request describes the change it names.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::messages::{ConfigType, ConfigurationUpdateRequest, ConfigurationUpdateResponse};
use crate::types::{
    Ballot, Decree, ErrorCode, NodeAddress, PartitionConfiguration, PartitionId, ReplicaError,
};

/// In-memory authoritative configuration store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMetaServer {
    partitions: BTreeMap<PartitionId, PartitionConfiguration>,
}

impl InMemoryMetaServer {
    /// Create a meta server that knows no partition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a partition with no members at ballot zero.
    pub fn create_partition(&mut self, pid: PartitionId) -> PartitionConfiguration {
        let config = PartitionConfiguration {
            pid,
            ballot: Ballot::ZERO,
            primary: None,
            secondaries: Vec::new(),
            last_committed_decree: Decree::ZERO,
        };
        self.partitions.insert(pid, config.clone());
        config
    }

    /// Current configuration of `pid`.
    pub fn config(&self, pid: PartitionId) -> Option<&PartitionConfiguration> {
        self.partitions.get(&pid)
    }

    /// Build a proposal to send to a replica.
    pub fn propose(
        &self,
        pid: PartitionId,
        kind: ConfigType,
        node: NodeAddress,
    ) -> Result<ConfigurationUpdateRequest, ReplicaError> {
        let config = self
            .partitions
            .get(&pid)
            .cloned()
            .ok_or_else(|| ReplicaError::ObjectNotFound(format!("partition {pid}")))?;
        Ok(ConfigurationUpdateRequest { config, kind, node })
    }

    /// Process a configuration update request from a primary.
    pub fn update_configuration(
        &mut self,
        request: &ConfigurationUpdateRequest,
    ) -> ConfigurationUpdateResponse {
        let pid = request.config.pid;
        let current = match self.partitions.get(&pid) {
            Some(c) => c.clone(),
            None => {
                warn!(pid = %pid, "update for unknown partition");
                return ConfigurationUpdateResponse {
                    err: ErrorCode::ObjectNotFound,
                    config: request.config.clone(),
                };
            }
        };

        if request.config.ballot != current.ballot.next() {
            debug!(
                pid = %pid,
                kind = %request.kind,
                current = %current.ballot,
                proposed = %request.config.ballot,
                "rejecting update with wrong ballot"
            );
            return ConfigurationUpdateResponse {
                err: ErrorCode::StaleBallot,
                config: current,
            };
        }

        if !Self::describes(request) {
            warn!(
                pid = %pid,
                kind = %request.kind,
                node = %request.node,
                "rejecting update that does not match its kind"
            );
            return ConfigurationUpdateResponse {
                err: ErrorCode::InvalidState,
                config: current,
            };
        }

        let mut installed = request.config.clone();
        installed.last_committed_decree = installed
            .last_committed_decree
            .max(current.last_committed_decree);
        self.partitions.insert(pid, installed.clone());
        ConfigurationUpdateResponse {
            err: ErrorCode::Ok,
            config: installed,
        }
    }

    fn describes(request: &ConfigurationUpdateRequest) -> bool {
        let config = &request.config;
        let node = request.node;
        match request.kind {
            ConfigType::AssignPrimary | ConfigType::UpgradeToPrimary => {
                config.primary == Some(node) && !config.secondaries.contains(&node)
            }
            ConfigType::UpgradeToSecondary | ConfigType::AddSecondary => {
                config.secondaries.contains(&node) && config.primary != Some(node)
            }
            ConfigType::DowngradeToSecondary => {
                config.primary.is_none() && config.secondaries.contains(&node)
            }
            ConfigType::DowngradeToInactive | ConfigType::Remove => {
                config.primary != Some(node) && !config.secondaries.contains(&node)
            }
        }
    }
}
