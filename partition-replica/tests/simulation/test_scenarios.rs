//! Cluster scenarios for partition replication.
//!
//! ## Test Organization
//!
//! - Membership: group check and prepare timeouts removing members
//! - Learning: catching up from the log, a checkpoint, or from scratch
//! - Failover: a secondary taking over from an isolated primary
//! - Chaos: random message loss across several seeds
//!
//! A freshly assigned primary opens its ballot with a reconciliation write,
//! and so does every ballot change with nothing left to re-prepare. A
//! three-node bootstrap therefore ends at ballot 3 with decree 3 committed.

use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use partition_replica::messages::{
    ClientOutcome, ConfigType, Envelope, PeerMessage, PrepareRequest,
};
use partition_replica::mutation::Mutation;
use partition_replica::types::ReplicaConfiguration;
use partition_replica::{
    Application, Ballot, Decree, ErrorCode, MutationLog, PartitionStatus, ReplicationOptions,
};

use super::invariants::check_all;
use super::workloads::{addr, pid, run_write_workload, settle, Cluster};

// ============================================================================
// Test Utilities
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

fn write_ok(cluster: &mut Cluster, port: u16, payload: &str) -> Decree {
    let response = cluster
        .write(port, payload)
        .unwrap_or_else(|| panic!("no reply to {payload}"));
    assert_eq!(response.outcome, ClientOutcome::Success, "write {payload}");
    response.decree.expect("committed reply carries a decree")
}

fn meta_secondaries(cluster: &Cluster) -> Vec<u16> {
    cluster
        .meta
        .config(pid())
        .expect("partition exists")
        .secondaries
        .iter()
        .map(|s| s.0.port())
        .collect()
}

fn meta_ballot(cluster: &Cluster) -> Ballot {
    cluster.meta.config(pid()).expect("partition exists").ballot
}

/// Three nodes, 5001 primary, ballot 3, decrees 1..=10 committed.
fn three_nodes_at_decree_ten(seed: u64, options: ReplicationOptions) -> Cluster {
    let mut cluster = Cluster::with_options(seed, &[5001, 5002, 5003], options);
    cluster.bootstrap(5001, &[5002, 5003]);
    assert_eq!(meta_ballot(&cluster), Ballot::new(3));
    assert_eq!(cluster.replica(5001).last_committed_decree(), Decree::new(3));

    for i in 4..=10 {
        let decree = write_ok(&mut cluster, 5001, &format!("k{i}=v{i}"));
        assert_eq!(decree, Decree::new(i));
    }
    cluster
}

// ============================================================================
// Replication
// ============================================================================

#[test]
fn test_writes_reach_every_member() {
    init_tracing();
    let mut cluster = three_nodes_at_decree_ten(1, ReplicationOptions::for_simulation());
    settle(&mut cluster, 1);

    for port in [5002, 5003] {
        let replica = cluster.replica(port);
        assert_eq!(replica.current_status(), PartitionStatus::Secondary);
        assert_eq!(replica.current_ballot(), Ballot::new(3));
        assert_eq!(replica.app().last_committed_decree(), Decree::new(10));
        assert_eq!(replica.app().read(b"k7").expect("read"), Some(b"v7".to_vec()));
    }
    check_all(&cluster);
}

#[test]
fn test_non_primary_rejects_writes() {
    init_tracing();
    let mut cluster = three_nodes_at_decree_ten(2, ReplicationOptions::for_simulation());
    let response = cluster.write(5002, "x=1").expect("immediate reply");
    assert_eq!(response.outcome, ClientOutcome::NotPrimary);
    assert_eq!(cluster.replica(5002).max_prepared_decree(), Decree::new(10));
}

#[test]
fn test_stale_prepare_rejected() {
    init_tracing();
    let mut cluster = three_nodes_at_decree_ten(3, ReplicationOptions::for_simulation());

    let stale = Envelope {
        from: addr(5001),
        to: addr(5003),
        message: PeerMessage::Prepare(PrepareRequest {
            pid: pid(),
            config: ReplicaConfiguration {
                pid: pid(),
                ballot: Ballot::new(2),
                status: PartitionStatus::Secondary,
                primary: Some(addr(5001)),
                secondaries: vec![addr(5002), addr(5003)],
            },
            mutation: Mutation::new(Decree::new(11), Ballot::new(2), b"x=stale".to_vec()),
        }),
    };
    let output = cluster.deliver(stale);

    let ack = output
        .messages
        .iter()
        .find_map(|e| match &e.message {
            PeerMessage::PrepareAck(ack) if e.to == addr(5001) => Some(ack.clone()),
            _ => None,
        })
        .expect("stale prepare is acknowledged");
    assert_eq!(ack.err, ErrorCode::StaleBallot);
    assert_eq!(ack.ballot, Ballot::new(3));

    let replica = cluster.replica(5003);
    assert_eq!(replica.current_ballot(), Ballot::new(3));
    assert_eq!(replica.max_prepared_decree(), Decree::new(10));
    assert_eq!(replica.log().durable_point(), Decree::new(10));
}

// ============================================================================
// Membership
// ============================================================================

#[test]
fn test_missed_group_checks_remove_secondary() {
    init_tracing();
    let mut options = ReplicationOptions::for_simulation();
    // Only the group check may detect the failure.
    options.prepare_timeout = Duration::from_secs(60);
    let mut cluster = three_nodes_at_decree_ten(4, options);
    let interval = cluster.replica(5001).options().group_check_interval;

    cluster.isolate(5002);
    let request = cluster.submit(5001, "k11=v11");
    cluster.run_until_quiet();
    assert!(cluster.reply(request).is_none(), "blocked on the isolated member");
    assert_eq!(cluster.replica(5003).max_prepared_decree(), Decree::new(11));

    cluster.advance(interval);
    cluster.advance(interval);
    assert!(cluster.reply(request).is_none());
    assert_eq!(meta_secondaries(&cluster), vec![5002, 5003]);

    for _ in 0..3 {
        cluster.advance(interval);
    }
    let response = cluster.reply(request).expect("commit after removal");
    assert_eq!(response.outcome, ClientOutcome::Success);
    assert_eq!(response.decree, Some(Decree::new(11)));

    assert_eq!(meta_secondaries(&cluster), vec![5003]);
    assert_eq!(meta_ballot(&cluster), Ballot::new(4));
    assert_eq!(cluster.replica(5001).current_ballot(), Ballot::new(4));
    assert_eq!(cluster.replica(5001).configuration().secondaries, vec![addr(5003)]);

    // The remaining pair keeps committing.
    let decree = write_ok(&mut cluster, 5001, "k13=v13");
    assert!(decree > Decree::new(11));
    check_all(&cluster);
}

#[test]
fn test_prepare_timeout_unblocks_pending_writes() {
    init_tracing();
    let mut cluster = Cluster::new(5, &[5001, 5002, 5003]);
    cluster.bootstrap(5001, &[5002, 5003]);

    cluster.isolate(5003);
    let request = cluster.submit(5001, "a=1");
    cluster.run_until_quiet();
    assert!(cluster.reply(request).is_none());

    cluster.advance_by(Duration::from_millis(300), Duration::from_millis(50));
    let response = cluster.reply(request).expect("unblocked");
    assert_eq!(response.outcome, ClientOutcome::Success);
    assert_eq!(meta_secondaries(&cluster), vec![5002]);

    write_ok(&mut cluster, 5001, "b=2");
    check_all(&cluster);
}

#[test]
fn test_isolated_node_rejoins_after_removal() {
    init_tracing();
    let mut cluster = Cluster::new(6, &[5001, 5002, 5003]);
    cluster.bootstrap(5001, &[5002, 5003]);

    cluster.isolate(5003);
    cluster.submit(5001, "a=1");
    cluster.advance_by(Duration::from_millis(300), Duration::from_millis(50));
    assert_eq!(meta_secondaries(&cluster), vec![5002]);

    for i in 0..5 {
        write_ok(&mut cluster, 5001, &format!("k{i}=v{i}"));
    }

    cluster.heal(5003);
    cluster.sync_all();
    assert_eq!(cluster.replica(5003).current_status(), PartitionStatus::Inactive);

    cluster.propose(ConfigType::AddSecondary, 5003);
    settle(&mut cluster, 1);
    assert_eq!(meta_secondaries(&cluster), vec![5002, 5003]);
    assert_eq!(cluster.replica(5003).current_status(), PartitionStatus::Secondary);
    assert_eq!(
        cluster.replica(5003).app().read(b"k4").expect("read"),
        Some(b"v4".to_vec())
    );
    check_all(&cluster);
}

// ============================================================================
// Learning
// ============================================================================

#[test]
fn test_learner_applies_checkpoint_then_log_tail() {
    init_tracing();
    let mut options = ReplicationOptions::for_simulation();
    options.max_mutation_count_in_prepare_list = 8;
    options.log_retain_decrees = 0;
    let mut cluster = Cluster::with_options(7, &[5001, 5002], options);
    cluster.propose(ConfigType::AssignPrimary, 5001);

    for i in 2..=100 {
        write_ok(&mut cluster, 5001, &format!("k{}=v{i}", i % 10));
    }
    cluster.replica_mut(5001).on_checkpoint_timer();
    let snapshot = cluster.replica(5001).snapshot();
    assert_eq!(snapshot.app_last_durable_decree, Decree::new(100));
    assert_eq!(snapshot.log_max_gced_decree, Decree::new(99));

    for i in 101..=120 {
        write_ok(&mut cluster, 5001, &format!("k{}=v{i}", i % 10));
    }
    assert_eq!(cluster.replica(5001).last_committed_decree(), Decree::new(120));

    cluster.propose(ConfigType::AddSecondary, 5002);

    let learner = cluster.replica(5002);
    assert_eq!(learner.current_status(), PartitionStatus::Secondary);
    let expected: Vec<Decree> = (101..=120).map(Decree::new).collect();
    assert_eq!(&learner.app().applied_decrees()[..20], expected.as_slice());

    settle(&mut cluster, 1);
    assert_eq!(
        cluster.replica(5002).app().state_bytes().expect("state"),
        cluster.replica(5001).app().state_bytes().expect("state")
    );
    check_all(&cluster);
}

#[test]
fn test_learning_from_empty_is_bit_identical() {
    init_tracing();
    let mut cluster = Cluster::new(11, &[5001, 5002, 5003]);
    cluster.bootstrap(5001, &[5002, 5003]);
    for i in 0..50 {
        write_ok(&mut cluster, 5001, &format!("k{}=v{i}", i % 7));
    }

    cluster.add_node(5004);
    cluster.propose(ConfigType::AddSecondary, 5004);
    settle(&mut cluster, 2);

    assert_eq!(meta_secondaries(&cluster), vec![5002, 5003, 5004]);
    let reference = cluster.replica(5001).app().state_bytes().expect("state");
    let decree = cluster.replica(5001).app().last_committed_decree();
    for port in [5002, 5003, 5004] {
        let replica = cluster.replica(port);
        assert_eq!(replica.app().last_committed_decree(), decree, "node {port}");
        assert_eq!(replica.app().state_bytes().expect("state"), reference, "node {port}");
    }
    check_all(&cluster);
}

#[test]
fn test_replayed_learn_reply_is_idempotent() {
    init_tracing();
    let mut cluster = Cluster::new(12, &[5001, 5002]);
    cluster.propose(ConfigType::AssignPrimary, 5001);
    for i in 0..5 {
        write_ok(&mut cluster, 5001, &format!("k{i}=v{i}"));
    }

    cluster.send_proposal(ConfigType::AddSecondary, 5002);
    let reply = loop {
        let envelope = cluster.step().expect("learn reply never sent");
        if matches!(envelope.message, PeerMessage::LearnReply(_)) {
            break envelope;
        }
    };

    let applied = cluster.replica(5002).app().applied_decrees().to_vec();
    let state = cluster.replica(5002).app().state_bytes().expect("state");
    assert_eq!(applied.len(), 6);

    cluster.inject(reply);
    assert_eq!(cluster.replica(5002).app().applied_decrees(), applied.as_slice());
    assert_eq!(cluster.replica(5002).app().state_bytes().expect("state"), state);

    cluster.run_until_quiet();
    assert_eq!(cluster.replica(5002).current_status(), PartitionStatus::Secondary);
    assert_eq!(&cluster.replica(5002).app().applied_decrees()[..6], applied.as_slice());
    check_all(&cluster);
}

// ============================================================================
// Failover
// ============================================================================

#[test]
fn test_secondary_takes_over_from_isolated_primary() {
    init_tracing();
    let mut cluster = three_nodes_at_decree_ten(9, ReplicationOptions::for_simulation());

    cluster.isolate(5001);
    cluster.propose(ConfigType::UpgradeToPrimary, 5002);

    assert_eq!(cluster.primary(), Some(addr(5002)));
    assert_eq!(meta_ballot(&cluster), Ballot::new(4));
    assert_eq!(meta_secondaries(&cluster), vec![5003]);
    assert_eq!(cluster.replica(5002).current_status(), PartitionStatus::Primary);
    // The last write is re-prepared and committed under the new ballot.
    assert_eq!(cluster.replica(5002).last_committed_decree(), Decree::new(10));

    let decree = write_ok(&mut cluster, 5002, "after=failover");
    assert_eq!(decree, Decree::new(11));
    for i in 4..=10 {
        let key = format!("k{i}");
        let value = format!("v{i}");
        assert_eq!(
            cluster.replica(5002).app().read(key.as_bytes()).expect("read"),
            Some(value.into_bytes())
        );
    }

    cluster.heal(5001);
    cluster.sync_all();
    assert_eq!(cluster.replica(5001).current_status(), PartitionStatus::Inactive);
    assert_eq!(cluster.replica(5001).current_ballot(), Ballot::new(4));
    check_all(&cluster);
}

#[test]
fn test_primary_resumes_after_meta_reconnect() {
    init_tracing();
    let mut cluster = three_nodes_at_decree_ten(10, ReplicationOptions::for_simulation());

    cluster.meta_disconnected(5001);
    assert_eq!(cluster.replica(5001).current_status(), PartitionStatus::Inactive);
    let response = cluster.write(5001, "x=1").expect("immediate reply");
    assert_eq!(response.outcome, ClientOutcome::NotPrimary);

    cluster.sync_all();
    assert_eq!(cluster.replica(5001).current_status(), PartitionStatus::Primary);
    assert_eq!(cluster.replica(5001).current_ballot(), Ballot::new(3));

    let decree = write_ok(&mut cluster, 5001, "y=2");
    assert!(decree > Decree::new(10));
    check_all(&cluster);
}

// ============================================================================
// Chaos
// ============================================================================

#[test]
fn test_random_message_loss_preserves_safety() {
    init_tracing();
    for seed in [1u64, 2, 3, 17, 42] {
        let mut cluster = Cluster::new(seed, &[5001, 5002, 5003]);
        cluster.bootstrap(5001, &[5002, 5003]);

        cluster.set_drop_probability(0.05);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let stats = run_write_workload(&mut cluster, &mut rng, 60, Duration::from_millis(30));
        cluster.set_drop_probability(0.0);
        settle(&mut cluster, 5);

        let (delivered, dropped) = cluster.traffic();
        tracing::info!(
            seed,
            delivered,
            dropped,
            committed = stats.committed.len(),
            failed = stats.failed,
            "chaos run"
        );

        assert!(!stats.committed.is_empty(), "seed {seed}: nothing committed");
        assert_eq!(cluster.primary(), Some(addr(5001)), "seed {seed}");
        assert_eq!(cluster.replica(5001).current_status(), PartitionStatus::Primary);
        for replica in cluster.replicas() {
            assert_ne!(
                replica.current_status(),
                PartitionStatus::Error,
                "seed {seed}: {} failed",
                replica.node()
            );
        }
        check_all(&cluster);
    }
}
