//! Message dispatch and the async node that drives a replica.
//!
//! [`dispatch`] is the table mapping each [`PeerMessage`] to its handler on
//! [`Replica`]. [`ReplicaNode`] is an actor owning one replica: a single inbox
//! serializes peer messages, client requests and meta server events, a ticker
//! drives timers, and every [`ReplicaOutput`] is routed to the transport, the
//! meta server or the waiting client.
//!
//! ```text
//!  NodeHandle ──┐
//!  Transport ───┼──> inbox ──> dispatch ──> Replica ──> ReplicaOutput
//!  ticker ──────┘                                         │
//!                      Transport <── messages ────────────┤
//!                      MetaClient <── meta_requests ──────┤  (reply fed back)
//!                      oneshot <── client_replies ────────┘
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::app::Application;
use crate::log::MutationLog;
use crate::messages::{
    ClientOutcome, ClientResponse, ConfigurationUpdateRequest, ConfigurationUpdateResponse,
    Envelope, PeerMessage, RequestId,
};
use crate::meta::InMemoryMetaServer;
use crate::replica::{Replica, ReplicaOutput};
use crate::transport::Transport;
use crate::types::{NodeAddress, PartitionConfiguration, ReplicaError};

/// Default period of the node's timer tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Default time a client waits for a reply.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Route one peer message to its handler.
///
/// Messages for another partition, or for a closed replica, are dropped.
pub fn dispatch<A: Application, L: MutationLog>(
    replica: &mut Replica<A, L>,
    envelope: Envelope,
) -> ReplicaOutput {
    if replica.is_closed() {
        return ReplicaOutput::empty();
    }
    if envelope.message.pid() != replica.pid() {
        debug!(
            pid = %replica.pid(),
            got = %envelope.message.pid(),
            kind = envelope.message.name(),
            "message for another partition"
        );
        return ReplicaOutput::empty();
    }

    let from = envelope.from;
    match envelope.message {
        PeerMessage::Prepare(request) => replica.on_prepare(from, request),
        PeerMessage::PrepareAck(ack) => replica.on_prepare_reply(from, ack),
        PeerMessage::Learn(request) => replica.on_learn(from, request),
        PeerMessage::LearnReply(response) => replica.on_learn_reply(from, response),
        PeerMessage::GroupCheck(request) => replica.on_group_check(from, request),
        PeerMessage::GroupCheckReply(response) => replica.on_group_check_reply(from, response),
        PeerMessage::AddLearner(request) => replica.on_add_learner(from, request),
        PeerMessage::LearnCompleted(request) => {
            replica.on_learn_completion_notification(from, request)
        }
        PeerMessage::LearnCompletedReply(response) => {
            replica.on_learn_completion_notification_reply(from, response)
        }
        PeerMessage::Remove(request) => replica.on_remove(from, request),
        PeerMessage::CopyCheckpoint(request) => replica.on_copy_checkpoint(from, request),
        PeerMessage::CopyCheckpointReply(response) => {
            replica.on_copy_checkpoint_reply(from, response)
        }
    }
}

// ============================================================================
// Meta server seam
// ============================================================================

/// Connection to the meta server.
#[async_trait(?Send)]
pub trait MetaClient {
    /// Submit a configuration update. `Err` means the meta server is unreachable.
    async fn update_configuration(
        &self,
        request: ConfigurationUpdateRequest,
    ) -> Result<ConfigurationUpdateResponse, ReplicaError>;
}

/// A meta server shared by every node of an in-process cluster.
pub type SharedMetaServer = Rc<RefCell<InMemoryMetaServer>>;

#[async_trait(?Send)]
impl MetaClient for SharedMetaServer {
    async fn update_configuration(
        &self,
        request: ConfigurationUpdateRequest,
    ) -> Result<ConfigurationUpdateResponse, ReplicaError> {
        Ok(self.borrow_mut().update_configuration(&request))
    }
}

// ============================================================================
// Inbox
// ============================================================================

/// Everything a node reacts to, in arrival order.
#[derive(Debug)]
pub enum NodeEvent {
    /// A message from a peer replica.
    Peer(Envelope),
    /// A client write.
    ClientWrite {
        /// Request id.
        request_id: RequestId,
        /// Opaque payload.
        payload: Vec<u8>,
        /// Where to send the result.
        reply: oneshot::Sender<ClientResponse>,
    },
    /// A client read.
    ClientRead {
        /// Request id.
        request_id: RequestId,
        /// Opaque request.
        request: Vec<u8>,
        /// Where to send the result.
        reply: oneshot::Sender<ClientResponse>,
    },
    /// A proposal from the meta server.
    Proposal(ConfigurationUpdateRequest),
    /// An authoritative configuration from the meta server.
    ConfigSync(PartitionConfiguration),
    /// The meta server became unreachable.
    MetaDisconnected,
    /// Stop the node.
    Close,
}

/// Cloneable handle to a running [`ReplicaNode`].
#[derive(Debug, Clone)]
pub struct NodeHandle {
    node: NodeAddress,
    inbox: mpsc::UnboundedSender<NodeEvent>,
    next_request: Rc<Cell<u64>>,
    client_timeout: Duration,
}

impl NodeHandle {
    /// Address of the node.
    pub fn node(&self) -> NodeAddress {
        self.node
    }

    /// Wait at most `timeout` for client replies.
    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    /// Sender side of the node's inbox, for registering with a transport.
    pub fn inbox(&self) -> mpsc::UnboundedSender<NodeEvent> {
        self.inbox.clone()
    }

    fn next_request_id(&self) -> RequestId {
        let id = self.next_request.get() + 1;
        self.next_request.set(id);
        RequestId(id)
    }

    /// Submit a write and wait for its outcome.
    pub async fn write(&self, payload: Vec<u8>) -> ClientResponse {
        let request_id = self.next_request_id();
        let (reply, rx) = oneshot::channel();
        let event = NodeEvent::ClientWrite {
            request_id,
            payload,
            reply,
        };
        self.call(request_id, event, rx).await
    }

    /// Submit a read and wait for its outcome.
    pub async fn read(&self, request: Vec<u8>) -> ClientResponse {
        let request_id = self.next_request_id();
        let (reply, rx) = oneshot::channel();
        let event = NodeEvent::ClientRead {
            request_id,
            request,
            reply,
        };
        self.call(request_id, event, rx).await
    }

    async fn call(
        &self,
        request_id: RequestId,
        event: NodeEvent,
        rx: oneshot::Receiver<ClientResponse>,
    ) -> ClientResponse {
        if self.inbox.send(event).is_err() {
            return ClientResponse::failure(request_id, ClientOutcome::NotPrimary);
        }
        match tokio::time::timeout(self.client_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => ClientResponse::failure(request_id, ClientOutcome::NotPrimary),
            Err(_) => ClientResponse::failure(request_id, ClientOutcome::Timeout),
        }
    }

    /// Deliver a meta server proposal.
    pub fn propose(&self, request: ConfigurationUpdateRequest) -> bool {
        self.inbox.send(NodeEvent::Proposal(request)).is_ok()
    }

    /// Deliver an authoritative configuration.
    pub fn sync(&self, config: PartitionConfiguration) -> bool {
        self.inbox.send(NodeEvent::ConfigSync(config)).is_ok()
    }

    /// Report that the meta server is unreachable.
    pub fn meta_disconnected(&self) -> bool {
        self.inbox.send(NodeEvent::MetaDisconnected).is_ok()
    }

    /// Ask the node to stop.
    pub fn close(&self) -> bool {
        self.inbox.send(NodeEvent::Close).is_ok()
    }
}

// ============================================================================
// Node
// ============================================================================

/// Actor owning one [`Replica`].
pub struct ReplicaNode<A: Application, L: MutationLog, T: Transport, M: MetaClient> {
    replica: Replica<A, L>,
    transport: T,
    meta: M,
    inbox: mpsc::UnboundedReceiver<NodeEvent>,
    clients: BTreeMap<RequestId, oneshot::Sender<ClientResponse>>,
    tick_interval: Duration,
}

impl<A: Application, L: MutationLog, T: Transport, M: MetaClient> ReplicaNode<A, L, T, M> {
    /// Wrap `replica`. Returns the node and a handle to reach it.
    pub fn new(replica: Replica<A, L>, transport: T, meta: M) -> (Self, NodeHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = NodeHandle {
            node: replica.node(),
            inbox: tx,
            next_request: Rc::new(Cell::new(0)),
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
        };
        let node = Self {
            replica,
            transport,
            meta,
            inbox: rx,
            clients: BTreeMap::new(),
            tick_interval: DEFAULT_TICK_INTERVAL,
        };
        (node, handle)
    }

    /// Use a different timer period.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Read-only access to the replica.
    pub fn replica(&self) -> &Replica<A, L> {
        &self.replica
    }

    /// Process events until [`NodeEvent::Close`] or until every handle is
    /// dropped. Returns the closed replica.
    pub async fn run(mut self) -> Replica<A, L> {
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(self.tick_interval);
        info!(pid = %self.replica.pid(), node = %self.replica.node(), "node started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let output = self.replica.on_tick(started.elapsed());
                    self.route(output).await;
                }
                event = self.inbox.recv() => {
                    match event {
                        None | Some(NodeEvent::Close) => break,
                        Some(event) => {
                            let output = self.handle_event(event);
                            self.route(output).await;
                        }
                    }
                }
            }
        }

        let output = self.replica.close();
        self.route(output).await;
        for (request_id, reply) in std::mem::take(&mut self.clients) {
            let _ = reply.send(ClientResponse::failure(request_id, ClientOutcome::NotPrimary));
        }
        info!(pid = %self.replica.pid(), node = %self.replica.node(), "node stopped");
        self.replica
    }

    fn handle_event(&mut self, event: NodeEvent) -> ReplicaOutput {
        match event {
            NodeEvent::Peer(envelope) => dispatch(&mut self.replica, envelope),
            NodeEvent::ClientWrite {
                request_id,
                payload,
                reply,
            } => {
                self.clients.insert(request_id, reply);
                self.replica.on_client_write(request_id, payload)
            }
            NodeEvent::ClientRead {
                request_id,
                request,
                reply,
            } => {
                self.clients.insert(request_id, reply);
                self.replica.on_client_read(request_id, request)
            }
            NodeEvent::Proposal(request) => self.replica.on_config_proposal(request),
            NodeEvent::ConfigSync(config) => self.replica.on_config_sync(config),
            NodeEvent::MetaDisconnected => self.replica.on_meta_server_disconnected(),
            NodeEvent::Close => ReplicaOutput::empty(),
        }
    }

    /// Send everything in `output`, feeding meta server replies back in.
    async fn route(&mut self, output: ReplicaOutput) {
        let mut queue = VecDeque::from([output]);
        while let Some(output) = queue.pop_front() {
            for envelope in output.messages {
                let (to, kind) = (envelope.to, envelope.message.name());
                if let Err(err) = self.transport.send(envelope).await {
                    debug!(
                        node = %self.replica.node(),
                        to = %to,
                        kind = kind,
                        error = %err,
                        "send failed"
                    );
                }
            }

            for response in output.client_replies {
                if let Some(reply) = self.clients.remove(&response.request_id) {
                    let _ = reply.send(response);
                }
            }

            for request in output.meta_requests {
                match self.meta.update_configuration(request).await {
                    Ok(response) => {
                        queue.push_back(self.replica.on_update_configuration_reply(response));
                    }
                    Err(err) => {
                        warn!(node = %self.replica.node(), error = %err, "meta server unreachable");
                        queue.push_back(self.replica.on_meta_server_disconnected());
                    }
                }
            }
        }
    }
}
