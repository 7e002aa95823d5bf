//! Tunables for a replica.
//!
//! Every timer and bound the replication engine uses lives in
//! [`ReplicationOptions`]. Durations are (de)serialized as integer
//! milliseconds so options can be loaded from a JSON file:
//!
//! ```text
//! {
//!   "prepare_timeout_ms": 1000,
//!   "group_check_interval_ms": 10000,
//!   "max_mutation_count_in_prepare_list": 110
//! }
//! ```
//!
//! Missing fields fall back to [`ReplicationOptions::default`].
//!
//! ## Tuning Guidelines
//!
//! - `group_check_interval * group_check_max_missed_periods` is the time a
//!   silent secondary keeps blocking commits before it is escalated.
//! - `learn_timeout` should exceed the time to ship a full checkpoint.
//! - In simulation these values can be much smaller since time is logical.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ReplicaError;

/// Configuration for a single replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationOptions {
    /// How long the primary waits for every prepare acknowledgment before
    /// treating the silent member as failed.
    #[serde(rename = "prepare_timeout_ms", with = "duration_ms")]
    pub prepare_timeout: Duration,

    /// Period of the primary's group check broadcast.
    #[serde(rename = "group_check_interval_ms", with = "duration_ms")]
    pub group_check_interval: Duration,

    /// Consecutive unanswered group checks before a member is escalated.
    pub group_check_max_missed_periods: u32,

    /// How long a learner waits for a learn response before retrying.
    #[serde(rename = "learn_timeout_ms", with = "duration_ms")]
    pub learn_timeout: Duration,

    /// Base delay between learn retries. Grows linearly with the attempt.
    #[serde(rename = "learn_retry_backoff_ms", with = "duration_ms")]
    pub learn_retry_backoff: Duration,

    /// Local I/O failures tolerated while learning before the replica
    /// gives up and enters `error`.
    pub learn_max_local_retries: u32,

    /// Capacity of the prepare window.
    pub max_mutation_count_in_prepare_list: usize,

    /// Period of the checkpoint / log GC timer.
    #[serde(rename = "checkpoint_interval_ms", with = "duration_ms")]
    pub checkpoint_interval: Duration,

    /// Decrees kept in the log below the application's durable point, so
    /// learners can still be served from the log.
    pub log_retain_decrees: u64,

    /// Whether secondaries may serve client reads.
    pub allow_secondary_reads: bool,

    /// Whether secondaries adopt the primary's checkpoint instead of taking
    /// their own.
    pub copy_checkpoint_from_primary: bool,

    /// Seed for learn signatures. `None` draws from the OS.
    pub signature_seed: Option<u64>,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(1),
            group_check_interval: Duration::from_secs(10),
            group_check_max_missed_periods: 3,
            learn_timeout: Duration::from_secs(30),
            learn_retry_backoff: Duration::from_secs(1),
            learn_max_local_retries: 3,
            max_mutation_count_in_prepare_list: 110,
            checkpoint_interval: Duration::from_secs(60),
            log_retain_decrees: 1000,
            allow_secondary_reads: false,
            copy_checkpoint_from_primary: false,
            signature_seed: None,
        }
    }
}

impl ReplicationOptions {
    /// Options suitable for simulation testing.
    ///
    /// Short timers, a small prepare window and a fixed signature seed.
    pub fn for_simulation() -> Self {
        Self {
            prepare_timeout: Duration::from_millis(200),
            group_check_interval: Duration::from_millis(100),
            group_check_max_missed_periods: 3,
            learn_timeout: Duration::from_millis(500),
            learn_retry_backoff: Duration::from_millis(50),
            learn_max_local_retries: 3,
            max_mutation_count_in_prepare_list: 32,
            checkpoint_interval: Duration::from_millis(1000),
            log_retain_decrees: 16,
            allow_secondary_reads: false,
            copy_checkpoint_from_primary: false,
            signature_seed: Some(42),
        }
    }

    /// Parse options from JSON. Missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self, ReplicaError> {
        Ok(serde_json::from_str(json)?)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
