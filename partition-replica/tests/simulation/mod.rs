//! Simulation test infrastructure for partition replication.
//!
//! Runs whole partitions (a primary, its secondaries, learners and the meta
//! server) inside one deterministic harness:
//! - FIFO links with seeded message loss
//! - Node isolation and healing
//! - A logical clock driving every timer
//!
//! ## Test Architecture
//!
//! ```text
//! ┌───────────┐   Prepare / GroupCheck   ┌─────────────┐
//! │  Primary  │ ───────────────────────> │ Secondaries │
//! │           │ <─────────────────────── │  Learners   │
//! └─────┬─────┘      acks / learn        └─────────────┘
//!       │ configuration updates
//!       ▼
//! ┌───────────┐
//! │   Meta    │   ← shared in-memory, answers synchronously
//! └───────────┘
//! ```
//!
//! Every scenario ends by running the checks in [`invariants`].

#![allow(dead_code)]

pub mod invariants;
#[cfg(test)]
pub mod test_scenarios;
pub mod workloads;
