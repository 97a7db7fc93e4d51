//! Durable operator checkpoints and the recovery coordinator consulted when a
//! container is rebuilt.
//!
//! A checkpoint is framed as a one-byte operator-kind tag, a big-endian window
//! id, and the opaque state blob. The kind tag lets a worker pick the right
//! factory before deserializing any state.

use std::collections::BTreeMap;
use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

use skein_plan::physical::OperatorKind;

/// Selects a checkpoint window: a concrete window id, or the most recent one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointWindow {
    /// The most recent durable checkpoint.
    Latest,
    /// A specific logical window.
    Id(u64),
}

/// A durable snapshot of one operator's state at one logical window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    /// The physical operator this state belongs to.
    pub operator_id: u32,
    /// The logical window the state was taken at.
    pub window: u64,
    /// Operator kind tag, readable without touching `state`.
    pub kind: OperatorKind,
    /// The opaque operator state blob.
    pub state: Vec<u8>,
}

/// Errors raised by checkpoint storage and recovery.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckpointError {
    /// No checkpoint exists for the requested operator and window.
    #[error("no checkpoint for operator {operator} at {window:?}")]
    Missing {
        /// The operator looked up.
        operator: u32,
        /// The window requested.
        window: CheckpointWindow,
    },
    /// The store could not be reached; retryable.
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
    /// Stored bytes do not parse as a checkpoint frame.
    #[error("corrupt checkpoint for operator {0}")]
    Corrupt(u32),
}

/// The persisted checkpoint store contract.
///
/// Keys are `(operator id, window id or latest)`; values are framed state blobs
/// with an embedded kind tag.
pub trait CheckpointStore {
    /// Persists a checkpoint.
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
    /// Loads a checkpoint by operator and window selector.
    fn load(&self, operator: u32, window: CheckpointWindow) -> Result<Checkpoint, CheckpointError>;
    /// Window ids with durable state for `operator`, ascending.
    fn windows(&self, operator: u32) -> Result<Vec<u64>, CheckpointError>;
}

/// Frames a checkpoint as kind tag, window id, state.
pub fn frame(checkpoint: &Checkpoint) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(9 + checkpoint.state.len());
    bytes.push(kind_tag(checkpoint.kind));
    bytes.extend_from_slice(&checkpoint.window.to_be_bytes());
    bytes.extend_from_slice(&checkpoint.state);
    bytes
}

/// Reads the operator kind tag from a framed checkpoint without deserializing
/// the state blob.
pub fn node_type(bytes: &[u8], operator: u32) -> Result<OperatorKind, CheckpointError> {
    match bytes.first() {
        Some(0) => Ok(OperatorKind::Input),
        Some(1) => Ok(OperatorKind::Generic),
        Some(2) => Ok(OperatorKind::Unifier),
        _ => Err(CheckpointError::Corrupt(operator)),
    }
}

/// Parses a full checkpoint frame.
pub fn unframe(bytes: &[u8], operator: u32) -> Result<Checkpoint, CheckpointError> {
    let kind = node_type(bytes, operator)?;
    let mut rest = &bytes[1..];
    let window = rest
        .read_u64::<BigEndian>()
        .map_err(|_| CheckpointError::Corrupt(operator))?;
    let mut state = Vec::new();
    rest.read_to_end(&mut state)
        .map_err(|_| CheckpointError::Corrupt(operator))?;
    Ok(Checkpoint {
        operator_id: operator,
        window,
        kind,
        state,
    })
}

fn kind_tag(kind: OperatorKind) -> u8 {
    match kind {
        OperatorKind::Input => 0,
        OperatorKind::Generic => 1,
        OperatorKind::Unifier => 2,
    }
}

/// A `BTreeMap`-backed store for tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    frames: BTreeMap<(u32, u64), Vec<u8>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryStore {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.frames
            .insert((checkpoint.operator_id, checkpoint.window), frame(checkpoint));
        Ok(())
    }

    fn load(&self, operator: u32, window: CheckpointWindow) -> Result<Checkpoint, CheckpointError> {
        let key = match window {
            CheckpointWindow::Id(id) => (operator, id),
            CheckpointWindow::Latest => self
                .frames
                .range((operator, 0)..=(operator, u64::MAX))
                .next_back()
                .map(|(key, _)| *key)
                .ok_or(CheckpointError::Missing { operator, window })?,
        };
        let bytes = self
            .frames
            .get(&key)
            .ok_or(CheckpointError::Missing { operator, window })?;
        unframe(bytes, operator)
    }

    fn windows(&self, operator: u32) -> Result<Vec<u64>, CheckpointError> {
        Ok(self
            .frames
            .range((operator, 0)..=(operator, u64::MAX))
            .map(|((_, window), _)| *window)
            .collect())
    }
}

/// Consults persisted state so a rebuilt container resumes rather than restarts
/// from empty state.
pub struct RecoveryCoordinator<S> {
    store: S,
}

impl<S: CheckpointStore> RecoveryCoordinator<S> {
    /// Wraps a store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Shared access to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable access to the underlying store.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Loads the checkpoint an operator should resume from.
    pub fn load(
        &self,
        operator: u32,
        window: CheckpointWindow,
    ) -> Result<Checkpoint, CheckpointError> {
        self.store.load(operator, window)
    }

    /// The window a rebuilt operator resumes from.
    ///
    /// Missing state for an operator that has completed a checkpoint before is
    /// fatal: recovery cannot proceed by guessing state, and the caller must
    /// abort recovery of that operator's container. Missing state for a
    /// brand-new operator simply means start fresh.
    pub fn recovery_window(
        &self,
        operator: u32,
        has_run_before: bool,
    ) -> Result<Option<u64>, CheckpointError> {
        match self.store.load(operator, CheckpointWindow::Latest) {
            Ok(checkpoint) => Ok(Some(checkpoint.window)),
            Err(CheckpointError::Missing { .. }) if !has_run_before => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(operator: u32, window: u64, kind: OperatorKind) -> Checkpoint {
        Checkpoint {
            operator_id: operator,
            window,
            kind,
            state: vec![0xab; 16],
        }
    }

    #[test]
    fn frame_roundtrip() {
        let original = checkpoint(7, 42, OperatorKind::Unifier);
        let bytes = frame(&original);
        assert_eq!(node_type(&bytes, 7).unwrap(), OperatorKind::Unifier);
        assert_eq!(unframe(&bytes, 7).unwrap(), original);
    }

    #[test]
    fn kind_tag_is_readable_standalone() {
        let bytes = frame(&checkpoint(1, 9, OperatorKind::Input));
        // Only the first byte is needed for dispatch.
        assert_eq!(node_type(&bytes[..1], 1).unwrap(), OperatorKind::Input);
        assert_eq!(node_type(&[], 1).unwrap_err(), CheckpointError::Corrupt(1));
    }

    #[test]
    fn latest_selects_highest_window() {
        let mut store = InMemoryStore::new();
        for window in [3, 9, 6] {
            store.save(&checkpoint(5, window, OperatorKind::Generic)).unwrap();
        }
        store.save(&checkpoint(6, 100, OperatorKind::Generic)).unwrap();

        let latest = store.load(5, CheckpointWindow::Latest).unwrap();
        assert_eq!(latest.window, 9);
        assert_eq!(store.load(5, CheckpointWindow::Id(6)).unwrap().window, 6);
        assert_eq!(store.windows(5).unwrap(), vec![3, 6, 9]);
    }

    #[test]
    fn recovery_window_semantics() {
        let mut store = InMemoryStore::new();
        store.save(&checkpoint(5, 17, OperatorKind::Generic)).unwrap();
        let coordinator = RecoveryCoordinator::new(store);

        assert_eq!(coordinator.recovery_window(5, true).unwrap(), Some(17));
        // A brand-new operator with no checkpoint starts fresh.
        assert_eq!(coordinator.recovery_window(99, false).unwrap(), None);
        // An operator known to have run but with no durable state is fatal.
        assert!(matches!(
            coordinator.recovery_window(99, true).unwrap_err(),
            CheckpointError::Missing { operator: 99, .. }
        ));
    }
}
