//! RedbSink — redb-backed persistence for workspace change sets.
//!
//! Each entity kind lives in its own table keyed by
//! `{workspace_id}/{entity_id}` with JSON values. A change set is applied in
//! one write transaction: inserts and updates are upserts, deleting a
//! release also deletes its jobs, and release variables are written once
//! per `(workspace, key, value)` into `variable_value_snapshots`.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use wsengine_core::{EngineResult, EntityKind, LiteralValue, Release};
use wsengine_store::{Change, ChangeOp, PersistenceSink, WorkspaceSnapshot};

use crate::error::{PersistError, PersistResult};
use crate::tables::*;

macro_rules! map_err {
    ($variant:ident) => {
        |e| PersistError::$variant(e.to_string())
    };
}

/// One deduplicated variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableValueSnapshot {
    pub workspace_id: String,
    pub key: String,
    pub value: LiteralValue,
}

/// Content digest identifying a `(workspace, key, value)` triple.
pub fn snapshot_digest(workspace_id: &str, key: &str, value: &LiteralValue) -> String {
    let mut hasher = Sha256::new();
    for part in [workspace_id, key, value.canonical().as_str()] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct RedbSink {
    db: Arc<Database>,
}

impl RedbSink {
    /// Open (or create) a sink at the given path.
    pub fn open(path: &Path) -> PersistResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let sink = Self { db: Arc::new(db) };
        sink.ensure_tables()?;
        debug!(?path, "redb sink opened");
        Ok(sink)
    }

    /// Ephemeral in-memory sink.
    pub fn open_in_memory() -> PersistResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let sink = Self { db: Arc::new(db) };
        sink.ensure_tables()?;
        debug!("in-memory redb sink opened");
        Ok(sink)
    }

    fn ensure_tables(&self) -> PersistResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for kind in EntityKind::ALL {
            txn.open_table(table_for(kind)).map_err(map_err!(Table))?;
        }
        txn.open_table(RELEASE_JOBS).map_err(map_err!(Table))?;
        txn.open_table(VARIABLE_VALUE_SNAPSHOTS)
            .map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Every stored record of `kind` for a workspace.
    pub fn read_kind(&self, workspace_id: &str, kind: EntityKind) -> PersistResult<Vec<Value>> {
        let (start, end) = prefix_range(workspace_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_for(kind)).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: Value =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Read every kind sequentially.
    pub fn load_snapshot(&self, workspace_id: &str) -> PersistResult<WorkspaceSnapshot> {
        let mut snapshot = WorkspaceSnapshot::new();
        for kind in EntityKind::ALL {
            let records = self.read_kind(workspace_id, kind)?;
            if !records.is_empty() {
                snapshot.insert(kind, records);
            }
        }
        Ok(snapshot)
    }

    /// Apply a change set in one write transaction.
    pub fn write_changes(&self, workspace_id: &str, changes: &[Change]) -> PersistResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for change in changes {
            apply_change(&txn, workspace_id, change)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%workspace_id, changes = changes.len(), "change set written");
        Ok(())
    }

    pub fn variable_value_snapshots(
        &self,
        workspace_id: &str,
    ) -> PersistResult<Vec<VariableValueSnapshot>> {
        let (start, end) = prefix_range(workspace_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(VARIABLE_VALUE_SNAPSHOTS)
            .map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    /// Job ids linked to a release through the join table.
    pub fn jobs_for_release(&self, workspace_id: &str, release_id: &str) -> PersistResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASE_JOBS).map_err(map_err!(Table))?;
        let (start, end) = prefix_range(&entity_key(workspace_id, release_id));
        let mut ids = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            ids.push(String::from_utf8_lossy(value.value()).into_owned());
        }
        Ok(ids)
    }
}

impl PersistenceSink for RedbSink {
    fn load_kind(&self, workspace_id: &str, kind: EntityKind) -> EngineResult<Vec<Value>> {
        Ok(self.read_kind(workspace_id, kind)?)
    }

    fn apply_changes(&self, workspace_id: &str, changes: &[Change]) -> EngineResult<()> {
        Ok(self.write_changes(workspace_id, changes)?)
    }
}

fn apply_change(txn: &WriteTransaction, workspace_id: &str, change: &Change) -> PersistResult<()> {
    let key = entity_key(workspace_id, &change.id);
    match change.op {
        ChangeOp::Insert | ChangeOp::Update => {
            let payload = change.payload.as_ref().ok_or_else(|| {
                PersistError::Write(format!("{} {} upsert without payload", change.kind, change.id))
            })?;
            let stored = match change.kind {
                EntityKind::Release => write_release_extras(txn, workspace_id, payload)?,
                EntityKind::Job => {
                    link_job(txn, workspace_id, &change.id, payload)?;
                    payload.clone()
                }
                _ => payload.clone(),
            };
            let bytes = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            let mut table = txn
                .open_table(table_for(change.kind))
                .map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        ChangeOp::Delete => {
            match change.kind {
                EntityKind::Release => delete_release_jobs(txn, workspace_id, &change.id)?,
                EntityKind::Job => unlink_job(txn, workspace_id, &change.id)?,
                _ => {}
            }
            let mut table = txn
                .open_table(table_for(change.kind))
                .map_err(map_err!(Table))?;
            table.remove(key.as_str()).map_err(map_err!(Write))?;
        }
    }
    Ok(())
}

/// Adds the split release ids to the stored record and writes the
/// variable value snapshots.
fn write_release_extras(
    txn: &WriteTransaction,
    workspace_id: &str,
    payload: &Value,
) -> PersistResult<Value> {
    let release: Release =
        serde_json::from_value(payload.clone()).map_err(map_err!(Deserialize))?;

    {
        let mut table = txn
            .open_table(VARIABLE_VALUE_SNAPSHOTS)
            .map_err(map_err!(Table))?;
        for (name, value) in &release.variables {
            let key = entity_key(workspace_id, &snapshot_digest(workspace_id, name, value));
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                continue;
            }
            let snapshot = VariableValueSnapshot {
                workspace_id: workspace_id.to_string(),
                key: name.clone(),
                value: value.clone(),
            };
            let bytes = serde_json::to_vec(&snapshot).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
    }

    let mut stored = payload.clone();
    if let Value::Object(map) = &mut stored {
        map.insert(
            "versionReleaseId".to_string(),
            Value::String(release.version_release_id()),
        );
        map.insert(
            "variableReleaseId".to_string(),
            Value::String(release.variable_release_id()),
        );
    }
    Ok(stored)
}

fn link_job(txn: &WriteTransaction, workspace_id: &str, job_id: &str, payload: &Value) -> PersistResult<()> {
    let release_id = payload
        .get("releaseId")
        .and_then(Value::as_str)
        .ok_or_else(|| PersistError::Write(format!("job {job_id} without releaseId")))?;
    let join_key = format!("{}/{job_id}", entity_key(workspace_id, release_id));
    let mut table = txn.open_table(RELEASE_JOBS).map_err(map_err!(Table))?;
    table
        .insert(join_key.as_str(), job_id.as_bytes())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn unlink_job(txn: &WriteTransaction, workspace_id: &str, job_id: &str) -> PersistResult<()> {
    let release_id = {
        let jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let key = entity_key(workspace_id, job_id);
        let stored = jobs.get(key.as_str()).map_err(map_err!(Read))?;
        match stored {
            Some(guard) => {
                let record: Value =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                record
                    .get("releaseId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }
            None => None,
        }
    };
    if let Some(release_id) = release_id {
        let join_key = format!("{}/{job_id}", entity_key(workspace_id, &release_id));
        let mut table = txn.open_table(RELEASE_JOBS).map_err(map_err!(Table))?;
        table.remove(join_key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(())
}

fn delete_release_jobs(txn: &WriteTransaction, workspace_id: &str, release_id: &str) -> PersistResult<()> {
    let (start, end) = prefix_range(&entity_key(workspace_id, release_id));
    // Collect join rows before mutating.
    let links: Vec<(String, String)> = {
        let table = txn.open_table(RELEASE_JOBS).map_err(map_err!(Table))?;
        let mut links = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (key, value) = entry.map_err(map_err!(Read))?;
            links.push((
                key.value().to_string(),
                String::from_utf8_lossy(value.value()).into_owned(),
            ));
        }
        links
    };
    if links.is_empty() {
        return Ok(());
    }
    {
        let mut jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
        for (_, job_id) in &links {
            jobs.remove(entity_key(workspace_id, job_id).as_str())
                .map_err(map_err!(Write))?;
        }
    }
    let mut table = txn.open_table(RELEASE_JOBS).map_err(map_err!(Table))?;
    for (join_key, _) in &links {
        table.remove(join_key.as_str()).map_err(map_err!(Write))?;
    }
    debug!(%release_id, jobs = links.len(), "release jobs cascaded");
    Ok(())
}
