//! Peer message delivery.
//!
//! [`Transport`] is the seam between a [`ReplicaNode`](crate::node::ReplicaNode)
//! and the network. Delivery is best effort: a failed send is logged by the
//! caller and otherwise treated like a lost message, which the protocols
//! already tolerate through timeouts and group checks.
//!
//! [`ChannelTransport`] connects nodes living in the same process through
//! their inboxes. It can isolate a node to simulate a partition.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::messages::Envelope;
use crate::node::NodeEvent;
use crate::types::NodeAddress;

/// Errors from sending a peer message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No node registered at this address.
    #[error("unknown peer {0}")]
    UnknownPeer(NodeAddress),

    /// The peer's inbox is closed.
    #[error("peer {0} closed")]
    PeerClosed(NodeAddress),

    /// One side of the link is isolated.
    #[error("link {from} -> {to} is down")]
    LinkDown {
        /// Sender.
        from: NodeAddress,
        /// Receiver.
        to: NodeAddress,
    },
}

/// Sends peer messages. Single-threaded, no `Send` bound.
#[async_trait(?Send)]
pub trait Transport {
    /// Deliver `envelope` to `envelope.to`.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// In-process transport over node inboxes.
#[derive(Debug, Clone, Default)]
pub struct ChannelTransport {
    inboxes: Rc<RefCell<BTreeMap<NodeAddress, mpsc::UnboundedSender<NodeEvent>>>>,
    isolated: Rc<RefCell<BTreeSet<NodeAddress>>>,
}

impl ChannelTransport {
    /// Create a transport with no node registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages for `node` into `inbox`.
    pub fn register(&self, node: NodeAddress, inbox: mpsc::UnboundedSender<NodeEvent>) {
        self.inboxes.borrow_mut().insert(node, inbox);
    }

    /// Drop every message from or to `node` until [`ChannelTransport::heal`].
    pub fn isolate(&self, node: NodeAddress) {
        self.isolated.borrow_mut().insert(node);
    }

    /// Reconnect an isolated node.
    pub fn heal(&self, node: NodeAddress) {
        self.isolated.borrow_mut().remove(&node);
    }
}

#[async_trait(?Send)]
impl Transport for ChannelTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let (from, to) = (envelope.from, envelope.to);
        {
            let isolated = self.isolated.borrow();
            if isolated.contains(&from) || isolated.contains(&to) {
                return Err(TransportError::LinkDown { from, to });
            }
        }
        let inboxes = self.inboxes.borrow();
        let inbox = inboxes.get(&to).ok_or(TransportError::UnknownPeer(to))?;
        inbox
            .send(NodeEvent::Peer(envelope))
            .map_err(|_| TransportError::PeerClosed(to))
    }
}
