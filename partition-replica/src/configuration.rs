//! Configuration / ballot state machine.
//!
//! A replica's role is governed by its ballot and status. A new configuration
//! is accepted only if its ballot is at least the current one, and only if the
//! status change is in the allowed table below.
//!
//! ```text
//!   inactive ──> potential_secondary ──> secondary ──> primary
//!      ▲                │                    │            │
//!      └────────────────┴────────────────────┴────────────┘
//!                    failure / downgrade
//!
//!   any ──> error   (terminal)
//! ```
//!
//! ## Higher ballot
//!
//! | from \ to            | primary | secondary | potential_secondary | inactive | error |
//! |----------------------|---------|-----------|---------------------|----------|-------|
//! | primary              | yes     | yes       | no                  | yes      | yes   |
//! | secondary            | named   | yes       | no                  | yes      | yes   |
//! | potential_secondary  | no      | yes       | yes                 | yes      | yes   |
//! | inactive             | t/named | t/listed  | yes                 | yes      | yes   |
//! | error                | no      | no        | no                  | no       | yes   |
//!
//! `named`: the configuration names this node as primary. `t`: the inactive
//! state is transient (meta server disconnect). `listed`: the configuration
//! lists this node as a secondary.
//!
//! ## Equal ballot
//!
//! Only `x -> x`, `inactive -> potential_secondary`,
//! `potential_secondary -> secondary`, `inactive -> primary|secondary` while
//! transient, `any -> inactive` and `any -> error`.

use tracing::info;

use crate::types::{
    Ballot, NodeAddress, PartitionId, PartitionStatus, ReplicaConfiguration, ReplicaError,
};

/// An accepted configuration change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Status before the change.
    pub from: PartitionStatus,
    /// Status after the change.
    pub to: PartitionStatus,
    /// Ballot before the change.
    pub old_ballot: Ballot,
    /// Ballot after the change.
    pub new_ballot: Ballot,
}

impl Transition {
    /// Whether the ballot increased.
    pub fn ballot_changed(&self) -> bool {
        self.new_ballot > self.old_ballot
    }

    /// Whether the status changed.
    pub fn status_changed(&self) -> bool {
        self.from != self.to
    }
}

/// Whether a status change under a strictly higher ballot is allowed.
pub fn is_transition_allowed(
    from: PartitionStatus,
    to: PartitionStatus,
    named_primary: bool,
    listed_secondary: bool,
    inactive_is_transient: bool,
) -> bool {
    use PartitionStatus::*;
    match (from, to) {
        (_, Error) => true,
        (Error, _) => false,
        (_, Inactive) => true,
        (Primary, Primary) | (Primary, Secondary) => true,
        (Primary, PotentialSecondary) => false,
        (Secondary, Primary) => named_primary,
        (Secondary, Secondary) => true,
        (Secondary, PotentialSecondary) => false,
        (PotentialSecondary, Primary) => false,
        (PotentialSecondary, Secondary) | (PotentialSecondary, PotentialSecondary) => true,
        (Inactive, Primary) => inactive_is_transient || named_primary,
        (Inactive, Secondary) => inactive_is_transient || listed_secondary,
        (Inactive, PotentialSecondary) => true,
    }
}

/// Whether a status change without a ballot change is allowed.
pub fn is_same_ballot_status_change_allowed(
    from: PartitionStatus,
    to: PartitionStatus,
    inactive_is_transient: bool,
) -> bool {
    use PartitionStatus::*;
    if from == Error {
        return to == Error;
    }
    match (from, to) {
        (a, b) if a == b => true,
        (_, Inactive) | (_, Error) => true,
        (Inactive, PotentialSecondary) => true,
        (PotentialSecondary, Secondary) => true,
        (Inactive, Primary) | (Inactive, Secondary) => inactive_is_transient,
        _ => false,
    }
}

/// A replica's current configuration plus the rules for changing it.
#[derive(Debug, Clone)]
pub struct ConfigurationState {
    node: NodeAddress,
    config: ReplicaConfiguration,
    inactive_is_transient: bool,
}

impl ConfigurationState {
    /// Fresh state: inactive at ballot zero.
    pub fn new(node: NodeAddress, pid: PartitionId) -> Self {
        Self {
            node,
            config: ReplicaConfiguration::inactive(pid),
            inactive_is_transient: false,
        }
    }

    /// The current configuration.
    pub fn current(&self) -> &ReplicaConfiguration {
        &self.config
    }

    /// Current ballot.
    pub fn current_ballot(&self) -> Ballot {
        self.config.ballot
    }

    /// Current status.
    pub fn current_status(&self) -> PartitionStatus {
        self.config.status
    }

    /// Whether the current inactive status was entered because the meta
    /// server became unreachable.
    pub fn inactive_is_transient(&self) -> bool {
        self.inactive_is_transient
    }

    /// Validate `new` against the current configuration without applying it.
    pub fn check(&self, new: &ReplicaConfiguration) -> Result<Transition, ReplicaError> {
        let current = &self.config;
        if new.ballot < current.ballot {
            return Err(ReplicaError::StaleBallot {
                current: current.ballot,
                seen: new.ballot,
            });
        }

        let from = current.status;
        let to = new.status;
        let allowed = if new.ballot > current.ballot {
            is_transition_allowed(
                from,
                to,
                new.primary == Some(self.node),
                new.secondaries.contains(&self.node),
                self.inactive_is_transient,
            )
        } else {
            is_same_ballot_status_change_allowed(from, to, self.inactive_is_transient)
        };
        if !allowed {
            return Err(ReplicaError::InvalidTransition {
                from,
                to,
                same_ballot: new.ballot == current.ballot,
            });
        }

        Ok(Transition {
            from,
            to,
            old_ballot: current.ballot,
            new_ballot: new.ballot,
        })
    }

    /// Validate and install `new`. Nothing changes on rejection.
    pub fn apply(&mut self, new: ReplicaConfiguration) -> Result<Transition, ReplicaError> {
        let transition = self.check(&new)?;
        if transition.ballot_changed() || transition.status_changed() {
            info!(
                pid = %new.pid,
                from = %transition.from,
                to = %transition.to,
                old_ballot = %transition.old_ballot,
                new_ballot = %transition.new_ballot,
                "configuration changed"
            );
        }
        self.config = new;
        self.inactive_is_transient = false;
        Ok(transition)
    }

    /// Remember that the current inactive status was caused by losing the
    /// meta server. Returns `false` if the replica is not inactive.
    pub fn mark_inactive_transient(&mut self) -> bool {
        if self.config.status != PartitionStatus::Inactive {
            return false;
        }
        self.inactive_is_transient = true;
        true
    }
}
