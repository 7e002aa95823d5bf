//! Safety properties checked against a [`Cluster`] after each scenario.
//!
//! - **Commit order**: every application applied decrees strictly one after
//!   the other.
//! - **Agreement**: replicas that applied up to the same decree hold
//!   identical state.
//! - **Single primary per ballot**: no two replicas act as primary under the
//!   same ballot.
//! - **Durability of acknowledged writes**: a decree reported committed to a
//!   client is applied on the current primary.

use std::collections::BTreeMap;

use partition_replica::messages::ClientOutcome;
use partition_replica::{Application, Ballot, Decree, NodeAddress, PartitionStatus};

use super::workloads::Cluster;

/// Panic unless every replica applied decrees in unbroken order.
pub fn check_commit_order(cluster: &Cluster) {
    for replica in cluster.replicas() {
        let applied = replica.app().applied_decrees();
        for pair in applied.windows(2) {
            assert_eq!(
                pair[1],
                pair[0].next(),
                "{} applied {} after {}",
                replica.node(),
                pair[1],
                pair[0]
            );
        }
    }
}

/// Panic if two replicas at the same commit point disagree on state.
pub fn check_agreement(cluster: &Cluster) {
    let mut by_decree: BTreeMap<Decree, (NodeAddress, Vec<u8>)> = BTreeMap::new();
    for replica in cluster.replicas() {
        let decree = replica.app().last_committed_decree();
        if decree == Decree::ZERO {
            continue;
        }
        let bytes = replica.app().state_bytes().expect("state encodes");
        match by_decree.get(&decree) {
            Some((other, expected)) => assert_eq!(
                &bytes,
                expected,
                "{} and {} diverge at decree {}",
                replica.node(),
                other,
                decree
            ),
            None => {
                by_decree.insert(decree, (replica.node(), bytes));
            }
        }
    }
}

/// Panic if two replicas are primary under the same ballot.
pub fn check_single_primary(cluster: &Cluster) {
    let mut primaries: BTreeMap<Ballot, NodeAddress> = BTreeMap::new();
    for replica in cluster.replicas() {
        if replica.current_status() != PartitionStatus::Primary {
            continue;
        }
        if let Some(other) = primaries.insert(replica.current_ballot(), replica.node()) {
            panic!(
                "{} and {} are both primary at ballot {}",
                other,
                replica.node(),
                replica.current_ballot()
            );
        }
    }
}

/// Panic if a write acknowledged as committed is missing on the primary.
pub fn check_acknowledged_writes(cluster: &Cluster) {
    let Some(primary) = cluster.primary() else {
        return;
    };
    let applied = cluster
        .replica(primary.0.port())
        .app()
        .last_committed_decree();
    for reply in cluster.replies() {
        if reply.outcome != ClientOutcome::Success {
            continue;
        }
        let decree = reply.decree.expect("committed reply carries a decree");
        assert!(
            decree <= applied,
            "write {} acknowledged at {} but primary applied only {}",
            reply.request_id,
            decree,
            applied
        );
    }
}

/// Run every check.
pub fn check_all(cluster: &Cluster) {
    check_commit_order(cluster);
    check_agreement(cluster);
    check_single_primary(cluster);
    check_acknowledged_writes(cluster);
}
