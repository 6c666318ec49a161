//! Change sets — per-context accumulation of entity mutations.
//!
//! A change set is keyed by `(kind, id)`: a later op on the same entity
//! replaces the earlier one in place, so the flush order is the order in
//! which each entity was first touched.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use wsengine_core::{EngineError, EngineResult, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One recorded mutation. `payload` is the entity's JSON form for inserts
/// and updates and `None` for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub kind: EntityKind,
    pub id: String,
    pub op: ChangeOp,
    pub payload: Option<serde_json::Value>,
}

/// Bulk reader and transactional writer the engine persists through.
pub trait PersistenceSink: Send + Sync {
    /// Read every stored record of one kind for a workspace.
    fn load_kind(&self, workspace_id: &str, kind: EntityKind)
    -> EngineResult<Vec<serde_json::Value>>;

    /// Apply all changes in a single transaction, in slice order.
    fn apply_changes(&self, workspace_id: &str, changes: &[Change]) -> EngineResult<()>;
}

#[derive(Default)]
struct Inner {
    changes: Vec<Change>,
    index: HashMap<(EntityKind, String), usize>,
}

#[derive(Default)]
pub struct ChangeSet {
    inner: Mutex<Inner>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutation. An update following an insert of the same entity
    /// stays an insert carrying the newer payload.
    pub fn record(
        &self,
        kind: EntityKind,
        id: impl Into<String>,
        op: ChangeOp,
        payload: Option<serde_json::Value>,
    ) {
        let id = id.into();
        let mut inner = self.inner.lock();
        match inner.index.get(&(kind, id.clone())).copied() {
            Some(pos) => {
                let existing = &mut inner.changes[pos];
                existing.op = match (existing.op, op) {
                    (ChangeOp::Insert, ChangeOp::Update) => ChangeOp::Insert,
                    (_, op) => op,
                };
                existing.payload = payload;
            }
            None => {
                let pos = inner.changes.len();
                inner.changes.push(Change {
                    kind,
                    id: id.clone(),
                    op,
                    payload,
                });
                inner.index.insert((kind, id), pos);
            }
        }
    }

    /// Record an insert (`existed == false`) or update of a serializable entity.
    pub fn record_upsert<T: Serialize>(
        &self,
        kind: EntityKind,
        id: impl Into<String>,
        existed: bool,
        entity: &T,
    ) -> EngineResult<()> {
        let payload = serde_json::to_value(entity)
            .map_err(|e| EngineError::Persistence(format!("serialize {kind}: {e}")))?;
        let op = if existed {
            ChangeOp::Update
        } else {
            ChangeOp::Insert
        };
        self.record(kind, id, op, Some(payload));
        Ok(())
    }

    pub fn record_delete(&self, kind: EntityKind, id: impl Into<String>) {
        self.record(kind, id, ChangeOp::Delete, None);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the pending changes, in flush order.
    pub fn snapshot(&self) -> Vec<Change> {
        self.inner.lock().changes.clone()
    }

    /// Remove and return all pending changes.
    pub fn drain(&self) -> Vec<Change> {
        let mut inner = self.inner.lock();
        inner.index.clear();
        std::mem::take(&mut inner.changes)
    }

    /// Drop all pending changes (handler failure path).
    pub fn discard(&self) {
        let dropped = self.drain().len();
        if dropped > 0 {
            debug!(dropped, "change set discarded");
        }
    }

    /// Replay the pending changes against `sink` in one transaction and
    /// clear them. The mutex is held for the whole flush so no append can
    /// interleave. On failure the changes are dropped.
    pub fn commit(&self, workspace_id: &str, sink: &dyn PersistenceSink) -> EngineResult<usize> {
        let mut inner = self.inner.lock();
        inner.index.clear();
        let changes = std::mem::take(&mut inner.changes);
        if changes.is_empty() {
            return Ok(0);
        }
        sink.apply_changes(workspace_id, &changes)?;
        debug!(%workspace_id, changes = changes.len(), "change set committed");
        Ok(changes.len())
    }
}
