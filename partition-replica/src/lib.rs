//! # Partition Replica: Primary-Backup Replication
//!
//! This crate implements the replica side of a partitioned key/value storage
//! system. Each partition is served by one primary and a set of secondaries.
//! The primary orders client writes into a sequence of decrees and commits a
//! decree once every live secondary has durably logged it. Membership is owned
//! by an external meta server; replicas only ask it for changes.
//!
//! ## Concepts
//!
//! | Concept | Meaning |
//! |---|---|
//! | **Ballot** | Configuration epoch. Any message below a replica's ballot is rejected |
//! | **Decree** | Position of a mutation in the partition's sequence |
//! | **Prepare** | Phase 1 of replication: log the mutation on every member |
//! | **Commit** | Apply the mutation once every live member logged it |
//! | **Learner** | A potential secondary catching up before it joins the quorum |
//! | **Group check** | The primary's periodic liveness round over every member |
//! | **Meta server** | External membership authority, ballot + primary + secondaries |
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Meta server                          │
//! │   Owns PartitionConfiguration, accepts ballot + 1 only    │
//! └───────────▲──────────────────────────────┬───────────────┘
//!             │ ConfigurationUpdateRequest    │ proposals, syncs
//!             │                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                    Primary replica                        │
//! │   prepare list, pending acks, learners, group check       │
//! └───────────┬──────────────────────────────┬───────────────┘
//!             │ Prepare / GroupCheck         │ AddLearner / LearnReply
//!             ▼                              ▼
//! ┌───────────────────┐          ┌───────────────────────────┐
//! │    Secondaries     │          │  Potential secondaries    │
//! │  log, ack, commit  │          │  learn, then join quorum  │
//! └───────────────────┘          └───────────────────────────┘
//! ```
//!
//! Every replica is a plain state machine ([`Replica`]): inputs go through
//! `&mut self` entry points that return a [`ReplicaOutput`]. [`node`] wraps it
//! in an async actor with a [`Transport`] and a [`MetaClient`].
//!
//! ## Crate Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | `Ballot`, `Decree`, `PartitionStatus`, configurations, `ReplicaError` |
//! | [`options`] | `ReplicationOptions` |
//! | [`mutation`] | `Mutation` |
//! | [`prepare_list`] | Ordered window of prepared and committed mutations |
//! | [`log`] | `MutationLog` trait and `InMemoryMutationLog` |
//! | [`app`] | `Application` trait and `InMemoryApplication` |
//! | [`configuration`] | Ballot / status transition rules |
//! | [`group_check`] | Member liveness bookkeeping |
//! | [`messages`] | Client, peer and meta server messages |
//! | [`meta`] | `InMemoryMetaServer` |
//! | [`replica`] | The replica state machine |
//! | [`node`] | Dispatch table and async `ReplicaNode` |
//! | [`transport`] | `Transport` trait and `ChannelTransport` |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod app;
pub mod configuration;
pub mod group_check;
pub mod log;
pub mod messages;
pub mod meta;
pub mod mutation;
pub mod node;
pub mod options;
pub mod prepare_list;
pub mod replica;
pub mod transport;
pub mod types;

// Re-export key types at crate root for convenience
pub use app::{Application, Checkpoint, InMemoryApplication};
pub use log::{InMemoryMutationLog, MutationLog};
pub use meta::InMemoryMetaServer;
pub use node::{dispatch, MetaClient, NodeHandle, ReplicaNode, SharedMetaServer};
pub use options::ReplicationOptions;
pub use replica::{Replica, ReplicaOutput, ReplicaSnapshot};
pub use transport::{ChannelTransport, Transport};
pub use types::{Ballot, Decree, ErrorCode, NodeAddress, PartitionId, PartitionStatus, ReplicaError};
