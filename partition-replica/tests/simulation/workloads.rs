//! Deterministic in-process cluster and the workloads that drive it.
//!
//! [`Cluster`] owns every replica of one partition plus the meta server. It
//! plays the network: envelopes are queued in FIFO order and delivered one at
//! a time through [`dispatch`]. A seeded [`ChaCha8Rng`] decides which
//! messages are lost, and isolated nodes neither send nor receive. Time is a
//! logical clock advanced explicitly with [`Cluster::advance`].
//!
//! Meta server requests are answered synchronously and the reply is fed back
//! to the requesting replica before any further message is delivered.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use partition_replica::messages::{ClientResponse, ConfigType, Envelope, RequestId};
use partition_replica::{
    dispatch, InMemoryApplication, InMemoryMetaServer, InMemoryMutationLog, NodeAddress,
    PartitionId, Replica, ReplicaOutput, ReplicationOptions,
};

/// Replica type used throughout the simulation.
pub type SimReplica = Replica<InMemoryApplication, InMemoryMutationLog>;

/// Upper bound on deliveries per [`Cluster::run_until_quiet`] call.
const MAX_DELIVERIES: usize = 100_000;

/// Address of the simulated node listening on `port`.
pub fn addr(port: u16) -> NodeAddress {
    NodeAddress::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port))
}

/// The partition every simulation serves.
pub fn pid() -> PartitionId {
    PartitionId::new(1, 0)
}

// ============================================================================
// Cluster
// ============================================================================

/// One partition, its replicas, the meta server and the network between them.
pub struct Cluster {
    /// The membership authority.
    pub meta: InMemoryMetaServer,
    replicas: BTreeMap<NodeAddress, SimReplica>,
    network: VecDeque<Envelope>,
    rng: ChaCha8Rng,
    drop_probability: f64,
    isolated: BTreeSet<NodeAddress>,
    now: Duration,
    replies: BTreeMap<RequestId, ClientResponse>,
    next_request: u64,
    delivered: usize,
    dropped: usize,
}

impl Cluster {
    /// A cluster with simulation options on `ports`.
    pub fn new(seed: u64, ports: &[u16]) -> Self {
        Self::with_options(seed, ports, ReplicationOptions::for_simulation())
    }

    /// A cluster whose replicas all use `options`.
    pub fn with_options(seed: u64, ports: &[u16], options: ReplicationOptions) -> Self {
        let mut meta = InMemoryMetaServer::new();
        meta.create_partition(pid());
        let replicas = ports
            .iter()
            .map(|port| {
                let replica = Replica::new(
                    pid(),
                    addr(*port),
                    options.clone(),
                    InMemoryApplication::new(),
                    InMemoryMutationLog::new(),
                );
                (addr(*port), replica)
            })
            .collect();
        Self {
            meta,
            replicas,
            network: VecDeque::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            drop_probability: 0.0,
            isolated: BTreeSet::new(),
            now: Duration::ZERO,
            replies: BTreeMap::new(),
            next_request: 0,
            delivered: 0,
            dropped: 0,
        }
    }

    /// Lose each message with probability `p`.
    pub fn set_drop_probability(&mut self, p: f64) {
        self.drop_probability = p;
    }

    /// Current logical time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Messages delivered and dropped so far.
    pub fn traffic(&self) -> (usize, usize) {
        (self.delivered, self.dropped)
    }

    /// The replica on `port`.
    pub fn replica(&self, port: u16) -> &SimReplica {
        &self.replicas[&addr(port)]
    }

    /// Mutable access to the replica on `port`.
    pub fn replica_mut(&mut self, port: u16) -> &mut SimReplica {
        self.replicas
            .get_mut(&addr(port))
            .expect("unknown replica")
    }

    /// Every replica, ordered by address.
    pub fn replicas(&self) -> impl Iterator<Item = &SimReplica> + '_ {
        self.replicas.values()
    }

    /// Add a fresh replica on `port`.
    pub fn add_node(&mut self, port: u16) {
        let options = self
            .replicas
            .values()
            .next()
            .map(|r| r.options().clone())
            .unwrap_or_else(ReplicationOptions::for_simulation);
        let replica = Replica::new(
            pid(),
            addr(port),
            options,
            InMemoryApplication::new(),
            InMemoryMutationLog::new(),
        );
        self.replicas.insert(addr(port), replica);
    }

    /// Current primary according to the meta server.
    pub fn primary(&self) -> Option<NodeAddress> {
        self.meta.config(pid()).and_then(|c| c.primary)
    }

    /// Cut `port` off the network.
    pub fn isolate(&mut self, port: u16) {
        self.isolated.insert(addr(port));
    }

    /// Reconnect `port`.
    pub fn heal(&mut self, port: u16) {
        self.isolated.remove(&addr(port));
    }

    // ------------------------------------------------------------------------
    // Meta server
    // ------------------------------------------------------------------------

    /// Have the meta server propose `kind` for `port`, and run until quiet.
    ///
    /// Primary assignments go to the node itself, everything else to the
    /// current primary.
    pub fn propose(&mut self, kind: ConfigType, port: u16) {
        self.send_proposal(kind, port);
        self.run_until_quiet();
    }

    /// Hand a proposal to its target without delivering the resulting traffic.
    pub fn send_proposal(&mut self, kind: ConfigType, port: u16) {
        let request = self
            .meta
            .propose(pid(), kind, addr(port))
            .expect("partition exists");
        let target = match kind {
            ConfigType::AssignPrimary | ConfigType::UpgradeToPrimary => addr(port),
            _ => self.primary().expect("partition has a primary"),
        };
        let output = self.replica_at(target).on_config_proposal(request);
        self.absorb(target, output);
    }

    /// Push the meta server's configuration to every reachable replica.
    pub fn sync_all(&mut self) {
        let config = self.meta.config(pid()).cloned().expect("partition exists");
        let nodes: Vec<NodeAddress> = self.replicas.keys().copied().collect();
        for node in nodes {
            if self.isolated.contains(&node) {
                continue;
            }
            let output = self.replica_at(node).on_config_sync(config.clone());
            self.absorb(node, output);
        }
        self.run_until_quiet();
    }

    /// Tell `port` it lost its meta server session.
    pub fn meta_disconnected(&mut self, port: u16) {
        let node = addr(port);
        let output = self.replica_at(node).on_meta_server_disconnected();
        self.absorb(node, output);
        self.run_until_quiet();
    }

    /// Make `primary` the primary and grow the group with `secondaries`,
    /// one learner at a time.
    pub fn bootstrap(&mut self, primary: u16, secondaries: &[u16]) {
        self.propose(ConfigType::AssignPrimary, primary);
        for port in secondaries {
            self.propose(ConfigType::AddSecondary, *port);
        }
        self.sync_all();
    }

    // ------------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------------

    /// Submit a write to `port` without waiting.
    pub fn submit(&mut self, port: u16, payload: &str) -> RequestId {
        self.next_request += 1;
        let request_id = RequestId(self.next_request);
        let node = addr(port);
        let output = self
            .replica_at(node)
            .on_client_write(request_id, payload.as_bytes().to_vec());
        self.absorb(node, output);
        request_id
    }

    /// Submit a write to `port` and deliver traffic until quiet.
    pub fn write(&mut self, port: u16, payload: &str) -> Option<ClientResponse> {
        let request_id = self.submit(port, payload);
        self.run_until_quiet();
        self.reply(request_id).cloned()
    }

    /// The reply to `request_id`, once received.
    pub fn reply(&self, request_id: RequestId) -> Option<&ClientResponse> {
        self.replies.get(&request_id)
    }

    /// Every reply received so far.
    pub fn replies(&self) -> impl Iterator<Item = &ClientResponse> + '_ {
        self.replies.values()
    }

    // ------------------------------------------------------------------------
    // Network and time
    // ------------------------------------------------------------------------

    /// Hand an envelope straight to its destination, bypassing loss.
    pub fn deliver(&mut self, envelope: Envelope) -> ReplicaOutput {
        let to = envelope.to;
        dispatch(self.replica_at(to), envelope)
    }

    /// Deliver `envelope` and route everything it produces.
    pub fn inject(&mut self, envelope: Envelope) {
        let to = envelope.to;
        let output = dispatch(self.replica_at(to), envelope);
        self.absorb(to, output);
    }

    /// Take the next queued message and deliver it unless it is lost.
    ///
    /// Returns the message either way, or `None` once the network is empty.
    pub fn step(&mut self) -> Option<Envelope> {
        let envelope = self.network.pop_front()?;
        let lost = self.isolated.contains(&envelope.from)
            || self.isolated.contains(&envelope.to)
            || !self.replicas.contains_key(&envelope.to)
            || (self.drop_probability > 0.0 && self.rng.random_bool(self.drop_probability));
        if lost {
            debug!(
                from = %envelope.from,
                to = %envelope.to,
                kind = envelope.message.name(),
                "message lost"
            );
            self.dropped += 1;
        } else {
            self.delivered += 1;
            self.inject(envelope.clone());
        }
        Some(envelope)
    }

    /// Deliver queued messages until the network is empty.
    pub fn run_until_quiet(&mut self) {
        let mut budget = MAX_DELIVERIES;
        while self.step().is_some() {
            budget -= 1;
            assert!(budget > 0, "network never went quiet");
        }
    }

    /// Advance the clock by `step` and tick every reachable replica.
    ///
    /// Isolated replicas tick too; only their traffic is lost.
    pub fn advance(&mut self, step: Duration) {
        self.now += step;
        let now = self.now;
        let nodes: Vec<NodeAddress> = self.replicas.keys().copied().collect();
        for node in nodes {
            let output = self.replica_at(node).on_tick(now);
            self.absorb(node, output);
        }
        self.run_until_quiet();
    }

    /// Advance in `step` increments until `total` elapsed.
    pub fn advance_by(&mut self, total: Duration, step: Duration) {
        let end = self.now + total;
        while self.now + step <= end {
            self.advance(step);
        }
    }

    fn replica_at(&mut self, node: NodeAddress) -> &mut SimReplica {
        self.replicas.get_mut(&node).expect("unknown replica")
    }

    /// Queue messages, answer meta requests and record client replies.
    ///
    /// An isolated node cannot reach the meta server either.
    fn absorb(&mut self, from: NodeAddress, output: ReplicaOutput) {
        let mut work = VecDeque::from([(from, output)]);
        while let Some((node, output)) = work.pop_front() {
            self.network.extend(output.messages);
            for reply in output.client_replies {
                self.replies.insert(reply.request_id, reply);
            }
            for request in output.meta_requests {
                let next = if self.isolated.contains(&node) {
                    self.replica_at(node).on_meta_server_disconnected()
                } else {
                    let response = self.meta.update_configuration(&request);
                    self.replica_at(node).on_update_configuration_reply(response)
                };
                work.push_back((node, next));
            }
        }
    }
}

// ============================================================================
// Workloads
// ============================================================================

/// Outcome of a write workload.
#[derive(Debug, Default)]
pub struct WriteStats {
    /// Writes acknowledged as committed, by key.
    pub committed: BTreeMap<String, String>,
    /// Writes that failed or got no answer.
    pub failed: usize,
}

/// Submit `count` writes to whichever node the meta server names primary,
/// ticking the clock by `tick` after each one.
pub fn run_write_workload(
    cluster: &mut Cluster,
    rng: &mut ChaCha8Rng,
    count: usize,
    tick: Duration,
) -> WriteStats {
    let mut stats = WriteStats::default();
    for i in 0..count {
        let Some(primary) = cluster.primary() else {
            stats.failed += 1;
            continue;
        };
        let key = format!("k{}", rng.random_range(0..16u32));
        let value = format!("v{i}");
        let response = cluster.write(primary.0.port(), &format!("{key}={value}"));
        match response {
            Some(r) if r.outcome == partition_replica::messages::ClientOutcome::Success => {
                stats.committed.insert(key, value);
            }
            _ => stats.failed += 1,
        }
        cluster.advance(tick);
    }
    stats
}

/// Run timers for `rounds` group check periods so commit points settle.
pub fn settle(cluster: &mut Cluster, rounds: u32) {
    let interval = cluster
        .replicas()
        .next()
        .map(|r| r.options().group_check_interval)
        .unwrap_or(Duration::from_millis(100));
    for _ in 0..rounds {
        cluster.advance(interval);
    }
}
