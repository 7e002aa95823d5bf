//! The application state machine a replica drives.
//!
//! The replica never interprets payloads. It hands every committed mutation
//! to an [`Application`] strictly in decree order, asks it for checkpoints to
//! serve learners and bound the log, and restores a checkpoint when it learns
//! from a peer.
//!
//! [`InMemoryApplication`] is a small key/value store used by tests and the
//! simulation harness. Payloads are `key=value` assignments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::mutation::Mutation;
use crate::types::{Decree, ReplicaError};

/// A durable image of the application state at `decree`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last decree included in the snapshot.
    pub decree: Decree,
    /// Opaque encoded state.
    pub snapshot: Vec<u8>,
}

/// Pluggable state machine fed by committed mutations.
pub trait Application {
    /// Apply one committed mutation. Called exactly once per decree, in order.
    fn apply(&mut self, mutation: &Mutation) -> Result<(), ReplicaError>;

    /// Highest decree applied.
    fn last_committed_decree(&self) -> Decree;

    /// Highest decree covered by a durable checkpoint.
    fn last_durable_decree(&self) -> Decree;

    /// Take a durable checkpoint at the current commit point.
    fn checkpoint(&mut self) -> Result<Checkpoint, ReplicaError>;

    /// The latest durable checkpoint, if one was taken.
    fn last_checkpoint(&self) -> Option<Checkpoint>;

    /// Replace the whole state with `checkpoint`.
    fn restore(&mut self, checkpoint: &Checkpoint) -> Result<(), ReplicaError>;

    /// Serve a read request against the current state.
    fn read(&self, request: &[u8]) -> Result<Option<Vec<u8>>, ReplicaError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct KvImage {
    decree: Decree,
    entries: BTreeMap<String, String>,
}

/// In-memory key/value [`Application`].
#[derive(Debug, Default, Clone)]
pub struct InMemoryApplication {
    entries: BTreeMap<String, String>,
    last_committed: Decree,
    checkpoint: Option<Checkpoint>,
    applied: Vec<Decree>,
    fail_applies: bool,
}

impl InMemoryApplication {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent applies fail (`true`) or succeed (`false`).
    pub fn fail_applies(&mut self, fail: bool) {
        self.fail_applies = fail;
    }

    /// Decrees applied through [`Application::apply`], in call order.
    pub fn applied_decrees(&self) -> &[Decree] {
        &self.applied
    }

    /// Current key/value contents.
    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Canonical encoding of the state, equal across replicas that applied
    /// the same decrees.
    pub fn state_bytes(&self) -> Result<Vec<u8>, ReplicaError> {
        let image = KvImage {
            decree: self.last_committed,
            entries: self.entries.clone(),
        };
        Ok(serde_json::to_vec(&image)?)
    }
}

impl Application for InMemoryApplication {
    fn apply(&mut self, mutation: &Mutation) -> Result<(), ReplicaError> {
        if self.fail_applies {
            return Err(ReplicaError::Application(format!(
                "injected apply failure at {}",
                mutation.decree
            )));
        }
        if mutation.decree != self.last_committed.next() {
            return Err(ReplicaError::Application(format!(
                "apply out of order: expected {}, got {}",
                self.last_committed.next(),
                mutation.decree
            )));
        }

        if !mutation.payload.is_empty() {
            let text = String::from_utf8_lossy(&mutation.payload);
            let (key, value) = text.split_once('=').unwrap_or((text.as_ref(), ""));
            self.entries.insert(key.to_string(), value.to_string());
        }
        self.last_committed = mutation.decree;
        self.applied.push(mutation.decree);
        Ok(())
    }

    fn last_committed_decree(&self) -> Decree {
        self.last_committed
    }

    fn last_durable_decree(&self) -> Decree {
        self.checkpoint
            .as_ref()
            .map_or(Decree::ZERO, |c| c.decree)
    }

    fn checkpoint(&mut self) -> Result<Checkpoint, ReplicaError> {
        let checkpoint = Checkpoint {
            decree: self.last_committed,
            snapshot: self.state_bytes()?,
        };
        self.checkpoint = Some(checkpoint.clone());
        Ok(checkpoint)
    }

    fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoint.clone()
    }

    fn restore(&mut self, checkpoint: &Checkpoint) -> Result<(), ReplicaError> {
        let image: KvImage = serde_json::from_slice(&checkpoint.snapshot)?;
        if image.decree != checkpoint.decree {
            return Err(ReplicaError::Application(format!(
                "checkpoint header {} does not match image {}",
                checkpoint.decree, image.decree
            )));
        }
        self.entries = image.entries;
        self.last_committed = checkpoint.decree;
        self.checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    fn read(&self, request: &[u8]) -> Result<Option<Vec<u8>>, ReplicaError> {
        let key = String::from_utf8_lossy(request);
        Ok(self
            .entries
            .get(key.as_ref())
            .map(|v| v.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ballot;

    fn put(decree: u64, kv: &str) -> Mutation {
        Mutation::new(Decree::new(decree), Ballot::new(1), kv.as_bytes().to_vec())
    }

    #[test]
    fn test_apply_in_order() {
        let mut app = InMemoryApplication::new();
        app.apply(&put(1, "a=1")).expect("apply");
        app.apply(&put(2, "b=2")).expect("apply");
        app.apply(&Mutation::reconciliation(Decree::new(3), Ballot::new(2)))
            .expect("apply empty");

        assert_eq!(app.last_committed_decree(), Decree::new(3));
        assert_eq!(app.read(b"a").expect("read"), Some(b"1".to_vec()));
        assert_eq!(app.read(b"zz").expect("read"), None);
        assert_eq!(app.entries().len(), 2);
    }

    #[test]
    fn test_apply_rejects_gap_and_repeat() {
        let mut app = InMemoryApplication::new();
        app.apply(&put(1, "a=1")).expect("apply");
        assert!(app.apply(&put(1, "a=1")).is_err());
        assert!(app.apply(&put(3, "a=1")).is_err());
        assert_eq!(app.applied_decrees(), &[Decree::new(1)]);
    }

    #[test]
    fn test_checkpoint_restore() {
        let mut primary = InMemoryApplication::new();
        for d in 1..=4 {
            primary.apply(&put(d, &format!("k{d}=v{d}"))).expect("apply");
        }
        let checkpoint = primary.checkpoint().expect("checkpoint");
        assert_eq!(checkpoint.decree, Decree::new(4));
        assert_eq!(primary.last_durable_decree(), Decree::new(4));

        let mut learner = InMemoryApplication::new();
        learner.restore(&checkpoint).expect("restore");
        assert_eq!(learner.last_committed_decree(), Decree::new(4));
        assert_eq!(
            learner.state_bytes().expect("state"),
            primary.state_bytes().expect("state")
        );
        learner.apply(&put(5, "k5=v5")).expect("apply after restore");
    }

    #[test]
    fn test_restore_rejects_garbage() {
        let mut app = InMemoryApplication::new();
        let err = app
            .restore(&Checkpoint {
                decree: Decree::new(1),
                snapshot: b"nope".to_vec(),
            })
            .expect_err("garbage");
        assert!(matches!(err, ReplicaError::Codec(_)));
    }
}
