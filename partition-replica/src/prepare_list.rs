//! The prepare list: a bounded sliding window of mutations.
//!
//! The window spans from the oldest retained decree to `max_decree`.
//! Entries at or below `last_committed_decree` are committed and kept as
//! a cache for retransmission and learning; entries above it are prepared
//! but not yet committed.
//!
//! ```text
//!        committed cache           uncommitted
//!   ┌──────────────────────┬─────────────────────────┐
//!   │ 96  97  98  99  100  │ 101  102  103           │
//!   └──────────────────────┴─────────────────────────┘
//!   min_decree      last_committed              max_decree
//! ```
//!
//! ## Rules
//!
//! - `prepare` appends at `max_decree + 1`. Re-preparing an existing
//!   uncommitted decree needs a strictly higher ballot (the tail after it is
//!   dropped) or an identical `(ballot, payload)` (idempotent).
//! - `commit` applies entries through the committer strictly in order and
//!   fails before applying anything if the range has a hole.
//! - The window holds at most `capacity` entries. The oldest committed entry
//!   is evicted to make room; if every entry is uncommitted the list is full.

use std::collections::BTreeMap;

use crate::mutation::{Mutation, MutationStatus};
use crate::types::{Ballot, Decree, ReplicaError};

/// Result of a successful [`PrepareList::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Stored at `max_decree + 1`.
    Appended,
    /// Replaced a lower-ballot entry; `dropped` later entries were discarded.
    Superseded {
        /// Number of tail entries removed.
        dropped: usize,
    },
    /// Identical proposal already present.
    Duplicate,
}

/// Bounded ordered window of mutations.
#[derive(Debug, Clone)]
pub struct PrepareList {
    mutations: BTreeMap<Decree, Mutation>,
    last_committed: Decree,
    capacity: usize,
}

impl PrepareList {
    /// Create an empty list whose commit point is `last_committed`.
    pub fn new(last_committed: Decree, capacity: usize) -> Self {
        Self {
            mutations: BTreeMap::new(),
            last_committed,
            capacity: capacity.max(1),
        }
    }

    /// Highest committed decree.
    pub fn last_committed_decree(&self) -> Decree {
        self.last_committed
    }

    /// Highest prepared decree, or the commit point if nothing is held.
    pub fn max_decree(&self) -> Decree {
        self.mutations
            .keys()
            .next_back()
            .copied()
            .map_or(self.last_committed, |d| d.max(self.last_committed))
    }

    /// Lowest retained decree, if any.
    pub fn min_decree(&self) -> Option<Decree> {
        self.mutations.keys().next().copied()
    }

    /// Number of retained entries, committed and uncommitted.
    pub fn count(&self) -> usize {
        self.mutations.len()
    }

    /// Maximum number of retained entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of prepared but uncommitted entries.
    pub fn uncommitted_count(&self) -> usize {
        self.max_decree().distance_from(self.last_committed) as usize
    }

    /// Whether a new decree can no longer be appended.
    pub fn is_full(&self) -> bool {
        self.uncommitted_count() >= self.capacity
    }

    /// Look up a retained mutation.
    pub fn get(&self, decree: Decree) -> Option<&Mutation> {
        self.mutations.get(&decree)
    }

    /// Mutable access to a retained mutation.
    pub fn get_mut(&mut self, decree: Decree) -> Option<&mut Mutation> {
        self.mutations.get_mut(&decree)
    }

    /// Record that `decree` reached the durable log.
    pub fn mark_logged(&mut self, decree: Decree) {
        if let Some(m) = self.mutations.get_mut(&decree) {
            m.logged = true;
        }
    }

    /// Uncommitted entries in decree order.
    pub fn uncommitted(&self) -> impl Iterator<Item = &Mutation> + '_ {
        let start = self.last_committed.next();
        self.mutations.range(start..).map(|(_, m)| m)
    }

    /// Cached entries covering `[from, to]` without a hole, if retained.
    pub fn range(&self, from: Decree, to: Decree) -> Option<Vec<Mutation>> {
        if from > to {
            return Some(Vec::new());
        }
        let entries: Vec<Mutation> = self
            .mutations
            .range(from..=to)
            .map(|(_, m)| m.clone())
            .collect();
        if entries.len() as u64 == to.0 - from.0 + 1 {
            Some(entries)
        } else {
            None
        }
    }

    /// Insert a mutation into the window.
    pub fn prepare(&mut self, mut mutation: Mutation) -> Result<PrepareOutcome, ReplicaError> {
        let decree = mutation.decree;
        if decree <= self.last_committed {
            return Err(ReplicaError::StaleDecree {
                decree,
                last_committed: self.last_committed,
            });
        }

        let max = self.max_decree();
        if decree > max.next() {
            return Err(ReplicaError::OutOfOrderDecree {
                expected: max.next(),
                got: decree,
            });
        }

        if let Some(existing) = self.mutations.get(&decree) {
            if mutation.ballot < existing.ballot {
                return Err(ReplicaError::StaleBallot {
                    current: existing.ballot,
                    seen: mutation.ballot,
                });
            }
            if mutation.ballot == existing.ballot {
                if existing.payload == mutation.payload {
                    return Ok(PrepareOutcome::Duplicate);
                }
                return Err(ReplicaError::ConflictingMutation {
                    decree,
                    ballot: mutation.ballot,
                });
            }

            let tail: Vec<Decree> = self
                .mutations
                .range(decree.next()..)
                .map(|(d, _)| *d)
                .collect();
            for d in &tail {
                self.mutations.remove(d);
            }
            mutation.status = MutationStatus::Preparing;
            self.mutations.insert(decree, mutation);
            return Ok(PrepareOutcome::Superseded {
                dropped: tail.len(),
            });
        }

        if let Some((_, last)) = self.mutations.iter().next_back() {
            if mutation.ballot < last.ballot {
                return Err(ReplicaError::StaleBallot {
                    current: last.ballot,
                    seen: mutation.ballot,
                });
            }
        }

        if self.is_full() {
            return Err(ReplicaError::PrepareListFull {
                capacity: self.capacity,
            });
        }
        while self.mutations.len() >= self.capacity {
            match self.mutations.keys().next().copied() {
                Some(oldest) if oldest <= self.last_committed => {
                    self.mutations.remove(&oldest);
                }
                _ => break,
            }
        }

        mutation.status = MutationStatus::Preparing;
        self.mutations.insert(decree, mutation);
        Ok(PrepareOutcome::Appended)
    }

    /// Commit every entry up to `decree`, applying each through `committer`
    /// in decree order. Returns the number of newly committed entries.
    ///
    /// Nothing is applied if a decree in the range is missing. If the
    /// committer fails, entries committed before the failure stay committed.
    pub fn commit<F>(&mut self, decree: Decree, mut committer: F) -> Result<usize, ReplicaError>
    where
        F: FnMut(&Mutation) -> Result<(), ReplicaError>,
    {
        if decree <= self.last_committed {
            return Ok(0);
        }

        let mut expected = self.last_committed.next();
        while expected <= decree {
            if !self.mutations.contains_key(&expected) {
                return Err(ReplicaError::GapInCommitSequence { missing: expected });
            }
            expected = expected.next();
        }

        let mut committed = 0;
        let mut next = self.last_committed.next();
        while next <= decree {
            if let Some(m) = self.mutations.get_mut(&next) {
                committer(m)?;
                m.status = MutationStatus::Committed;
                self.last_committed = next;
                committed += 1;
            }
            next = next.next();
        }
        Ok(committed)
    }

    /// Evict committed entries below `decree`. Uncommitted entries are kept.
    pub fn truncate_before(&mut self, decree: Decree) -> usize {
        let bound = decree.min(self.last_committed.next());
        let evict: Vec<Decree> = self.mutations.range(..bound).map(|(d, _)| *d).collect();
        for d in &evict {
            self.mutations.remove(d);
        }
        evict.len()
    }

    /// Drop every entry and restart the window at `last_committed`.
    pub fn reset(&mut self, last_committed: Decree) {
        self.mutations.clear();
        self.last_committed = last_committed;
    }

    /// Re-stamp every uncommitted entry with `ballot` for re-preparing.
    ///
    /// Returns copies of the re-stamped entries in decree order.
    pub fn restamp_uncommitted(&mut self, ballot: Ballot) -> Vec<Mutation> {
        let start = self.last_committed.next();
        self.mutations
            .range_mut(start..)
            .map(|(_, m)| {
                if m.ballot < ballot {
                    m.ballot = ballot;
                    m.logged = false;
                }
                m.status = MutationStatus::Pending;
                m.clone()
            })
            .collect()
    }
}
