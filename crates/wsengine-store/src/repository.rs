//! Typed concurrent containers.
//!
//! Every container keeps its items and its foreign-key index behind one
//! `RwLock`. No method holds the lock while calling into another container
//! or the change set.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use wsengine_core::{
    Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion, EngineError,
    EngineResult, EntityKind, Environment, GithubEntity, Job, JobAgent, Policy, PolicySkip,
    RelationshipRule, Release, Resource, ResourceVariable, System, UserApprovalRecord, Workflow,
};

use crate::context::Context;

/// A record a container can hold.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    fn key(&self) -> String;

    /// Foreign id this entity is indexed under, if any.
    fn parent_key(&self) -> Option<String> {
        None
    }
}

struct Inner<T> {
    items: HashMap<String, T>,
    by_parent: HashMap<String, BTreeSet<String>>,
}

impl<T: Entity> Inner<T> {
    fn index(&mut self, key: &str, entity: &T) {
        if let Some(parent) = entity.parent_key() {
            self.by_parent
                .entry(parent)
                .or_default()
                .insert(key.to_string());
        }
    }

    fn unindex(&mut self, key: &str, entity: &T) {
        let Some(parent) = entity.parent_key() else {
            return;
        };
        if let Some(keys) = self.by_parent.get_mut(&parent) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
    }
}

pub struct Repository<T: Entity> {
    inner: RwLock<Inner<T>>,
    invalidates: Option<Arc<AtomicBool>>,
}

impl<T: Entity> Default for Repository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Repository<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: HashMap::new(),
                by_parent: HashMap::new(),
            }),
            invalidates: None,
        }
    }

    /// A container whose mutations mark a derived view dirty.
    pub fn with_invalidation(flag: Arc<AtomicBool>) -> Self {
        Self {
            invalidates: Some(flag),
            ..Self::new()
        }
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.inner.read().items.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot copy of `{id -> entity}`.
    pub fn items(&self) -> HashMap<String, T> {
        self.inner.read().items.clone()
    }

    pub fn values(&self) -> Vec<T> {
        self.inner.read().items.values().cloned().collect()
    }

    /// Entities indexed under `parent`, in key order.
    pub fn by_parent(&self, parent: &str) -> Vec<T> {
        let inner = self.inner.read();
        inner
            .by_parent
            .get(parent)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| inner.items.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Insert or replace, returning the previous value.
    pub fn upsert(&self, ctx: &Context, entity: T) -> EngineResult<Option<T>> {
        let key = entity.key();
        if key.is_empty() {
            return Err(EngineError::invalid_reference(T::KIND, key, "empty id"));
        }
        let payload = entity.clone();
        let previous = {
            let mut inner = self.inner.write();
            let previous = inner.items.insert(key.clone(), entity);
            if let Some(old) = &previous {
                inner.unindex(&key, old);
            }
            inner.index(&key, &payload);
            previous
        };
        self.invalidate();
        ctx.changes()
            .record_upsert(T::KIND, key.as_str(), previous.is_some(), &payload)?;
        debug!(kind = %T::KIND, id = %key, update = previous.is_some(), "upsert");
        Ok(previous)
    }

    /// Remove by id, returning the removed value. Removing an absent id is
    /// not an error and records nothing.
    pub fn remove(&self, ctx: &Context, id: &str) -> EngineResult<Option<T>> {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.items.remove(id);
            if let Some(old) = &removed {
                inner.unindex(id, old);
            }
            removed
        };
        if removed.is_some() {
            self.invalidate();
            ctx.changes().record_delete(T::KIND, id);
            debug!(kind = %T::KIND, %id, "remove");
        }
        Ok(removed)
    }

    /// Bulk load without recording changes (snapshot restore).
    pub fn load(&self, entities: impl IntoIterator<Item = T>) {
        {
            let mut inner = self.inner.write();
            for entity in entities {
                let key = entity.key();
                if let Some(old) = inner.items.insert(key.clone(), entity.clone()) {
                    inner.unindex(&key, &old);
                }
                inner.index(&key, &entity);
            }
        }
        self.invalidate();
    }

    /// Record an update for every item (full-snapshot save).
    pub fn record_all(&self, ctx: &Context) -> EngineResult<usize> {
        let items = self.items();
        for (key, entity) in &items {
            ctx.changes()
                .record_upsert(T::KIND, key.as_str(), true, entity)?;
        }
        Ok(items.len())
    }

    fn invalidate(&self) {
        if let Some(flag) = &self.invalidates {
            flag.store(true, Ordering::Release);
        }
    }
}

macro_rules! entity {
    ($ty:ty, $kind:expr) => {
        impl Entity for $ty {
            const KIND: EntityKind = $kind;
            fn key(&self) -> String {
                self.id.clone()
            }
        }
    };
    ($ty:ty, $kind:expr, |$e:ident| $parent:expr) => {
        impl Entity for $ty {
            const KIND: EntityKind = $kind;
            fn key(&self) -> String {
                self.id.clone()
            }
            fn parent_key(&self) -> Option<String> {
                let $e = self;
                Some($parent)
            }
        }
    };
}

entity!(System, EntityKind::System);
entity!(Resource, EntityKind::Resource);
entity!(ResourceVariable, EntityKind::ResourceVariable, |v| v.resource_id.clone());
entity!(Deployment, EntityKind::Deployment, |d| d.system_id.clone());
entity!(DeploymentVersion, EntityKind::DeploymentVersion, |v| v.deployment_id.clone());
entity!(DeploymentVariable, EntityKind::DeploymentVariable, |v| v.deployment_id.clone());
entity!(DeploymentVariableValue, EntityKind::DeploymentVariableValue, |v| {
    v.deployment_variable_id.clone()
});
entity!(Environment, EntityKind::Environment, |e| e.system_id.clone());
entity!(Policy, EntityKind::Policy);
entity!(PolicySkip, EntityKind::PolicySkip, |s| s.version_id.clone());
entity!(RelationshipRule, EntityKind::RelationshipRule);
entity!(Release, EntityKind::Release, |r| r.release_target.key());
entity!(Job, EntityKind::Job, |j| j.release_id.clone());
entity!(JobAgent, EntityKind::JobAgent);
entity!(GithubEntity, EntityKind::GithubEntity);
entity!(Workflow, EntityKind::Workflow);

impl Entity for UserApprovalRecord {
    const KIND: EntityKind = EntityKind::UserApprovalRecord;

    fn key(&self) -> String {
        UserApprovalRecord::key(self)
    }

    fn parent_key(&self) -> Option<String> {
        Some(self.version_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangeOp;
    use chrono::Utc;

    fn env(id: &str, system: &str) -> Environment {
        Environment {
            id: id.into(),
            system_id: system.into(),
            name: id.into(),
            description: None,
            resource_selector: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_reindexes_parent() {
        let ctx = Context::new("ws");
        let repo: Repository<Environment> = Repository::new();
        repo.upsert(&ctx, env("e1", "s1")).unwrap();
        repo.upsert(&ctx, env("e2", "s1")).unwrap();
        assert_eq!(repo.by_parent("s1").len(), 2);

        repo.upsert(&ctx, env("e1", "s2")).unwrap();
        assert_eq!(repo.by_parent("s1").len(), 1);
        assert_eq!(repo.by_parent("s2")[0].id, "e1");
        assert!(repo.by_parent("s3").is_empty());
    }

    #[test]
    fn mutations_are_recorded_and_invalidate() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = Context::new("ws");
        let repo: Repository<Environment> = Repository::with_invalidation(flag.clone());

        repo.upsert(&ctx, env("e1", "s1")).unwrap();
        assert!(flag.swap(false, Ordering::AcqRel));
        repo.upsert(&ctx, env("e1", "s1")).unwrap();
        repo.remove(&ctx, "missing").unwrap();
        assert!(flag.load(Ordering::Acquire));

        let changes = ctx.changes().snapshot();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].op, ChangeOp::Insert);

        repo.remove(&ctx, "e1").unwrap();
        assert_eq!(ctx.changes().snapshot()[0].op, ChangeOp::Delete);
        assert!(repo.is_empty());
        assert!(repo.by_parent("s1").is_empty());
    }

    #[test]
    fn load_records_nothing() {
        let ctx = Context::new("ws");
        let repo: Repository<Environment> = Repository::new();
        repo.load([env("e1", "s1"), env("e2", "s2")]);
        assert_eq!(repo.len(), 2);
        assert!(ctx.changes().is_empty());

        assert_eq!(repo.record_all(&ctx).unwrap(), 2);
        assert!(
            ctx.changes()
                .snapshot()
                .iter()
                .all(|c| c.op == ChangeOp::Update)
        );
    }
}
