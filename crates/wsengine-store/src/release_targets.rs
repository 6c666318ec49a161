//! The derived release-target view.
//!
//! Membership is recomputed from the resource, environment and deployment
//! containers whenever one of them was mutated since the last read. Each
//! recompute diffs against the previous snapshot and queues the added and
//! removed targets for the release manager to drain.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::debug;

use wsengine_core::{
    Deployment, EngineResult, Environment, ReleaseTarget, Resource, SelectorEngine, SelectorEntity,
};

/// Targets that appeared or disappeared since the last drain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReleaseTargetChanges {
    pub added: Vec<ReleaseTarget>,
    pub removed: Vec<ReleaseTarget>,
}

impl ReleaseTargetChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Default)]
struct View {
    targets: BTreeMap<String, ReleaseTarget>,
    by_environment: HashMap<String, BTreeSet<String>>,
    by_deployment: HashMap<String, BTreeSet<String>>,
    by_resource: HashMap<String, BTreeSet<String>>,
}

impl View {
    fn build(targets: BTreeMap<String, ReleaseTarget>) -> Self {
        let mut view = View::default();
        for (key, target) in &targets {
            view.by_environment
                .entry(target.environment_id.clone())
                .or_default()
                .insert(key.clone());
            view.by_deployment
                .entry(target.deployment_id.clone())
                .or_default()
                .insert(key.clone());
            view.by_resource
                .entry(target.resource_id.clone())
                .or_default()
                .insert(key.clone());
        }
        view.targets = targets;
        view
    }

    fn lookup(&self, index: &HashMap<String, BTreeSet<String>>, id: &str) -> Vec<ReleaseTarget> {
        index
            .get(id)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| self.targets.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct ReleaseTargets {
    dirty: Arc<AtomicBool>,
    refresh: Mutex<()>,
    view: RwLock<View>,
    pending: Mutex<ReleaseTargetChanges>,
}

impl Default for ReleaseTargets {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseTargets {
    pub fn new() -> Self {
        Self {
            dirty: Arc::new(AtomicBool::new(false)),
            refresh: Mutex::new(()),
            view: RwLock::new(View::default()),
            pending: Mutex::new(ReleaseTargetChanges::default()),
        }
    }

    /// The flag input containers set on mutation.
    pub fn dirty_flag(&self) -> Arc<AtomicBool> {
        self.dirty.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Serializes recomputes. Returns `None` when the view is clean.
    pub(crate) fn begin_refresh(&self) -> Option<MutexGuard<'_, ()>> {
        let guard = self.refresh.lock();
        if self.dirty.swap(false, Ordering::AcqRel) {
            Some(guard)
        } else {
            None
        }
    }

    /// Re-mark the view dirty after a failed recompute.
    pub(crate) fn abort_refresh(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Swap in a freshly computed membership and queue the diff.
    pub(crate) fn replace(&self, next: BTreeMap<String, ReleaseTarget>) {
        let mut diff = ReleaseTargetChanges::default();
        {
            let mut view = self.view.write();
            for (key, target) in &next {
                if !view.targets.contains_key(key) {
                    diff.added.push(target.clone());
                }
            }
            for (key, target) in &view.targets {
                if !next.contains_key(key) {
                    diff.removed.push(target.clone());
                }
            }
            *view = View::build(next);
        }
        if diff.is_empty() {
            return;
        }
        debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            "release targets recomputed"
        );

        let mut pending = self.pending.lock();
        // A target removed then re-added (or the reverse) before a drain
        // cancels out.
        for target in diff.added {
            if let Some(pos) = pending.removed.iter().position(|t| *t == target) {
                pending.removed.remove(pos);
            } else {
                pending.added.push(target);
            }
        }
        for target in diff.removed {
            if let Some(pos) = pending.added.iter().position(|t| *t == target) {
                pending.added.remove(pos);
            } else {
                pending.removed.push(target);
            }
        }
    }

    pub(crate) fn take_changes(&self) -> ReleaseTargetChanges {
        std::mem::take(&mut *self.pending.lock())
    }

    pub(crate) fn all(&self) -> Vec<ReleaseTarget> {
        self.view.read().targets.values().cloned().collect()
    }

    pub(crate) fn get(&self, key: &str) -> Option<ReleaseTarget> {
        self.view.read().targets.get(key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.view.read().targets.len()
    }

    pub(crate) fn for_environment(&self, environment_id: &str) -> Vec<ReleaseTarget> {
        let view = self.view.read();
        view.lookup(&view.by_environment, environment_id)
    }

    pub(crate) fn for_deployment(&self, deployment_id: &str) -> Vec<ReleaseTarget> {
        let view = self.view.read();
        view.lookup(&view.by_deployment, deployment_id)
    }

    pub(crate) fn for_resource(&self, resource_id: &str) -> Vec<ReleaseTarget> {
        let view = self.view.read();
        view.lookup(&view.by_resource, resource_id)
    }
}

/// Compute membership from container snapshots.
///
/// A `(resource, environment, deployment)` triple is a target when the
/// environment and deployment share a system, the resource is live, and the
/// resource matches both resource selectors.
pub fn compute_release_targets(
    resources: &HashMap<String, Resource>,
    environments: &HashMap<String, Environment>,
    deployments: &HashMap<String, Deployment>,
    selectors: &dyn SelectorEngine,
) -> EngineResult<BTreeMap<String, ReleaseTarget>> {
    let live: Vec<&Resource> = resources.values().filter(|r| !r.is_deleted()).collect();

    let mut deployments_by_system: HashMap<&str, Vec<&Deployment>> = HashMap::new();
    for deployment in deployments.values() {
        deployments_by_system
            .entry(deployment.system_id.as_str())
            .or_default()
            .push(deployment);
    }

    // Selector matches are computed once per (selector owner, resource).
    let mut deployment_matches: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for deployment in deployments.values() {
        let mut matched = BTreeSet::new();
        for resource in &live {
            if selectors.matches_opt(
                deployment.resource_selector.as_ref(),
                &SelectorEntity::Resource(resource),
            )? {
                matched.insert(resource.id.as_str());
            }
        }
        deployment_matches.insert(deployment.id.as_str(), matched);
    }

    let mut targets = BTreeMap::new();
    for environment in environments.values() {
        let Some(system_deployments) = deployments_by_system.get(environment.system_id.as_str())
        else {
            continue;
        };
        for resource in &live {
            if !selectors.matches_opt(
                environment.resource_selector.as_ref(),
                &SelectorEntity::Resource(resource),
            )? {
                continue;
            }
            for deployment in system_deployments {
                let in_deployment = deployment_matches
                    .get(deployment.id.as_str())
                    .is_some_and(|m| m.contains(resource.id.as_str()));
                if in_deployment {
                    let target = ReleaseTarget::new(&resource.id, &environment.id, &deployment.id);
                    targets.insert(target.key(), target);
                }
            }
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(r: &str, e: &str, d: &str) -> ReleaseTarget {
        ReleaseTarget::new(r, e, d)
    }

    fn membership(targets: &[ReleaseTarget]) -> BTreeMap<String, ReleaseTarget> {
        targets.iter().map(|t| (t.key(), t.clone())).collect()
    }

    #[test]
    fn replace_queues_diff_and_indexes() {
        let view = ReleaseTargets::new();
        view.replace(membership(&[target("r1", "e1", "d1"), target("r2", "e1", "d1")]));
        assert_eq!(view.for_environment("e1").len(), 2);
        assert_eq!(view.for_resource("r2").len(), 1);

        let changes = view.take_changes();
        assert_eq!(changes.added.len(), 2);
        assert!(changes.removed.is_empty());
        assert!(view.take_changes().is_empty());

        view.replace(membership(&[target("r2", "e1", "d1")]));
        let changes = view.take_changes();
        assert_eq!(changes.removed, vec![target("r1", "e1", "d1")]);
        assert!(view.for_resource("r1").is_empty());
    }

    #[test]
    fn remove_then_readd_cancels_out() {
        let view = ReleaseTargets::new();
        view.replace(membership(&[target("r1", "e1", "d1")]));
        view.take_changes();

        view.replace(BTreeMap::new());
        view.replace(membership(&[target("r1", "e1", "d1")]));
        assert!(view.take_changes().is_empty());
    }

    #[test]
    fn refresh_only_when_dirty() {
        let view = ReleaseTargets::new();
        assert!(view.begin_refresh().is_none());
        view.dirty_flag().store(true, Ordering::Release);
        assert!(view.begin_refresh().is_some());
        assert!(!view.is_dirty());
        view.abort_refresh();
        assert!(view.is_dirty());
    }
}
