//! Durable mutation log trait and in-memory implementation.
//!
//! The [`MutationLog`] trait abstracts the write-ahead log a replica appends
//! every prepared mutation to before acknowledging it. The on-disk format is
//! owned by the implementation; the replica only needs ordered appends, lazy
//! reads from a decree, and garbage collection below a boundary.
//!
//! Appends are synchronous from the replica's point of view: when `append`
//! returns `Ok`, the mutation is durable. Any append failure is fatal to the
//! replica instance.
//!
//! [`InMemoryMutationLog`] keeps records in a `BTreeMap` and supports failure
//! injection for tests.

use std::collections::BTreeMap;

use crate::mutation::Mutation;
use crate::types::{Decree, ReplicaError};

/// Durable append-only store of mutations.
pub trait MutationLog {
    /// Durably append a mutation. Returns the number of bytes written.
    ///
    /// A later append for the same decree with a higher ballot supersedes
    /// the earlier record.
    fn append(&mut self, mutation: &Mutation) -> Result<usize, ReplicaError>;

    /// Records with decree `>= decree`, in decree order, one per decree.
    fn read_from(
        &self,
        decree: Decree,
    ) -> Result<Box<dyn Iterator<Item = Mutation> + '_>, ReplicaError>;

    /// Highest decree durably appended.
    fn durable_point(&self) -> Decree;

    /// Highest decree removed by garbage collection.
    ///
    /// Records at or below this decree can no longer be read.
    fn max_gced_decree(&self) -> Decree;

    /// Remove every record with decree `< before`. Returns how many were removed.
    fn garbage_collect(&mut self, before: Decree) -> Result<usize, ReplicaError>;
}

/// In-memory implementation of [`MutationLog`].
///
/// All records are lost on drop. [`InMemoryMutationLog::fail_appends`] makes
/// every subsequent append fail, to exercise local failure handling.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMutationLog {
    records: BTreeMap<Decree, Mutation>,
    max_gced: Decree,
    bytes: usize,
    fail_appends: bool,
}

impl InMemoryMutationLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail (`true`) or succeed (`false`).
    pub fn fail_appends(&mut self, fail: bool) {
        self.fail_appends = fail;
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total bytes appended since creation.
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }
}

impl MutationLog for InMemoryMutationLog {
    fn append(&mut self, mutation: &Mutation) -> Result<usize, ReplicaError> {
        if self.fail_appends {
            return Err(ReplicaError::Log(format!(
                "injected append failure at {}",
                mutation.decree
            )));
        }
        if mutation.decree <= self.max_gced {
            return Err(ReplicaError::Log(format!(
                "append at {} below gc boundary {}",
                mutation.decree, self.max_gced
            )));
        }

        let mut record = mutation.clone();
        record.logged = true;
        let size = serde_json::to_vec(&record)?.len();

        match self.records.get(&mutation.decree) {
            Some(existing) if existing.ballot > mutation.ballot => {}
            _ => {
                self.records.insert(mutation.decree, record);
            }
        }
        self.bytes += size;
        Ok(size)
    }

    fn read_from(
        &self,
        decree: Decree,
    ) -> Result<Box<dyn Iterator<Item = Mutation> + '_>, ReplicaError> {
        if decree <= self.max_gced && self.max_gced > Decree::ZERO {
            return Err(ReplicaError::ObjectNotFound(format!(
                "{} already garbage collected (boundary {})",
                decree, self.max_gced
            )));
        }
        Ok(Box::new(
            self.records.range(decree..).map(|(_, m)| m.clone()),
        ))
    }

    fn durable_point(&self) -> Decree {
        self.records
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.max_gced)
    }

    fn max_gced_decree(&self) -> Decree {
        self.max_gced
    }

    fn garbage_collect(&mut self, before: Decree) -> Result<usize, ReplicaError> {
        let evict: Vec<Decree> = self.records.range(..before).map(|(d, _)| *d).collect();
        for d in &evict {
            self.records.remove(d);
        }
        if before.prev() > self.max_gced {
            self.max_gced = before.prev();
        }
        Ok(evict.len())
    }
}
