//! Cluster-level replication tests.

mod simulation;
