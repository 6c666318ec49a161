//! The per-workspace store: one container per entity kind plus the derived
//! release-target view.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use wsengine_core::{
    Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion, EngineError,
    EngineResult, EntityKind, Environment, GithubEntity, Job, JobAgent, Policy, PolicySkip,
    RelationshipRule, Release, ReleaseTarget, Resource, ResourceVariable, SelectorEngine, System,
    UserApprovalRecord, Workflow,
};

use crate::context::Context;
use crate::relationships::related_resources;
use crate::release_targets::{ReleaseTargetChanges, ReleaseTargets, compute_release_targets};
use crate::repository::{Entity, Repository};

/// Raw per-kind records as read from a persistence sink.
pub type WorkspaceSnapshot = HashMap<EntityKind, Vec<Value>>;

pub struct Store {
    workspace_id: String,
    selectors: Arc<dyn SelectorEngine>,

    pub systems: Repository<System>,
    pub resources: Repository<Resource>,
    pub resource_variables: Repository<ResourceVariable>,
    pub deployments: Repository<Deployment>,
    pub deployment_versions: Repository<DeploymentVersion>,
    pub deployment_variables: Repository<DeploymentVariable>,
    pub deployment_variable_values: Repository<DeploymentVariableValue>,
    pub environments: Repository<Environment>,
    pub policies: Repository<Policy>,
    pub policy_skips: Repository<PolicySkip>,
    pub relationship_rules: Repository<RelationshipRule>,
    pub releases: Repository<Release>,
    pub jobs: Repository<Job>,
    pub job_agents: Repository<JobAgent>,
    pub user_approval_records: Repository<UserApprovalRecord>,
    pub github_entities: Repository<GithubEntity>,
    pub workflows: Repository<Workflow>,

    release_targets: ReleaseTargets,
}

impl Store {
    pub fn new(workspace_id: impl Into<String>, selectors: Arc<dyn SelectorEngine>) -> Self {
        let release_targets = ReleaseTargets::new();
        let dirty = release_targets.dirty_flag();
        Self {
            workspace_id: workspace_id.into(),
            selectors,
            systems: Repository::new(),
            resources: Repository::with_invalidation(dirty.clone()),
            resource_variables: Repository::new(),
            deployments: Repository::with_invalidation(dirty.clone()),
            deployment_versions: Repository::new(),
            deployment_variables: Repository::new(),
            deployment_variable_values: Repository::new(),
            environments: Repository::with_invalidation(dirty.clone()),
            policies: Repository::new(),
            policy_skips: Repository::new(),
            relationship_rules: Repository::with_invalidation(dirty),
            releases: Repository::new(),
            jobs: Repository::new(),
            job_agents: Repository::new(),
            user_approval_records: Repository::new(),
            github_entities: Repository::new(),
            workflows: Repository::new(),
            release_targets,
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn selectors(&self) -> &dyn SelectorEngine {
        self.selectors.as_ref()
    }

    // ── Snapshot restore / save ──────────────────────────────────

    /// Populate the containers from a loaded snapshot. Records no changes.
    /// Stored release targets are ignored; membership is recomputed.
    pub fn restore(&self, snapshot: &WorkspaceSnapshot) -> EngineResult<()> {
        fn fill<T: Entity>(repo: &Repository<T>, snapshot: &WorkspaceSnapshot) -> EngineResult<()> {
            let Some(values) = snapshot.get(&T::KIND) else {
                return Ok(());
            };
            let mut entities = Vec::with_capacity(values.len());
            for value in values {
                let entity: T = serde_json::from_value(value.clone()).map_err(|e| {
                    EngineError::Persistence(format!("decode {}: {e}", T::KIND))
                })?;
                entities.push(entity);
            }
            repo.load(entities);
            Ok(())
        }

        fill(&self.systems, snapshot)?;
        fill(&self.resources, snapshot)?;
        fill(&self.resource_variables, snapshot)?;
        fill(&self.deployments, snapshot)?;
        fill(&self.deployment_versions, snapshot)?;
        fill(&self.deployment_variables, snapshot)?;
        fill(&self.deployment_variable_values, snapshot)?;
        fill(&self.environments, snapshot)?;
        fill(&self.policies, snapshot)?;
        fill(&self.policy_skips, snapshot)?;
        fill(&self.relationship_rules, snapshot)?;
        fill(&self.releases, snapshot)?;
        fill(&self.jobs, snapshot)?;
        fill(&self.job_agents, snapshot)?;
        fill(&self.user_approval_records, snapshot)?;
        fill(&self.github_entities, snapshot)?;
        fill(&self.workflows, snapshot)?;

        self.refresh_release_targets()?;
        info!(
            workspace_id = %self.workspace_id,
            resources = self.resources.len(),
            release_targets = self.release_targets.len(),
            jobs = self.jobs.len(),
            "store restored"
        );
        Ok(())
    }

    /// Record an update for every entity so a sink receives a complete copy.
    pub fn record_full_snapshot(&self, ctx: &Context) -> EngineResult<usize> {
        let mut total = 0;
        total += self.systems.record_all(ctx)?;
        total += self.resources.record_all(ctx)?;
        total += self.resource_variables.record_all(ctx)?;
        total += self.deployments.record_all(ctx)?;
        total += self.deployment_versions.record_all(ctx)?;
        total += self.deployment_variables.record_all(ctx)?;
        total += self.deployment_variable_values.record_all(ctx)?;
        total += self.environments.record_all(ctx)?;
        total += self.policies.record_all(ctx)?;
        total += self.policy_skips.record_all(ctx)?;
        total += self.relationship_rules.record_all(ctx)?;
        total += self.releases.record_all(ctx)?;
        total += self.jobs.record_all(ctx)?;
        total += self.job_agents.record_all(ctx)?;
        total += self.user_approval_records.record_all(ctx)?;
        total += self.github_entities.record_all(ctx)?;
        total += self.workflows.record_all(ctx)?;
        for target in self.release_targets()? {
            ctx.changes()
                .record_upsert(EntityKind::ReleaseTarget, target.key(), true, &target)?;
            total += 1;
        }
        debug!(workspace_id = %self.workspace_id, total, "full snapshot recorded");
        Ok(total)
    }

    // ── Resources ────────────────────────────────────────────────

    /// A resource that is not soft-deleted.
    pub fn resource(&self, id: &str) -> Option<Resource> {
        self.resources.get(id).filter(|r| !r.is_deleted())
    }

    pub fn active_resources(&self) -> Vec<Resource> {
        let mut resources: Vec<Resource> = self
            .resources
            .values()
            .into_iter()
            .filter(|r| !r.is_deleted())
            .collect();
        resources.sort_by(|a, b| a.id.cmp(&b.id));
        resources
    }

    /// Resources related to `resource_id` through relationship rules, keyed
    /// by rule reference.
    pub fn related_resources(&self, resource_id: &str) -> EngineResult<BTreeMap<String, Resource>> {
        let Some(from) = self.resource(resource_id) else {
            return Ok(BTreeMap::new());
        };
        let rules = self.relationship_rules.values();
        if rules.is_empty() {
            return Ok(BTreeMap::new());
        }
        related_resources(&rules, &from, &self.active_resources(), self.selectors())
    }

    // ── Release targets ──────────────────────────────────────────

    /// Recompute the derived view if any input container changed.
    pub fn refresh_release_targets(&self) -> EngineResult<()> {
        let Some(_guard) = self.release_targets.begin_refresh() else {
            return Ok(());
        };
        let resources = self.resources.items();
        let environments = self.environments.items();
        let deployments = self.deployments.items();
        match compute_release_targets(&resources, &environments, &deployments, self.selectors()) {
            Ok(next) => {
                self.release_targets.replace(next);
                Ok(())
            }
            Err(e) => {
                self.release_targets.abort_refresh();
                Err(e)
            }
        }
    }

    pub fn release_targets(&self) -> EngineResult<Vec<ReleaseTarget>> {
        self.refresh_release_targets()?;
        Ok(self.release_targets.all())
    }

    pub fn release_target(&self, key: &str) -> EngineResult<Option<ReleaseTarget>> {
        self.refresh_release_targets()?;
        Ok(self.release_targets.get(key))
    }

    pub fn release_targets_for_environment(
        &self,
        environment_id: &str,
    ) -> EngineResult<Vec<ReleaseTarget>> {
        self.refresh_release_targets()?;
        Ok(self.release_targets.for_environment(environment_id))
    }

    pub fn release_targets_for_deployment(
        &self,
        deployment_id: &str,
    ) -> EngineResult<Vec<ReleaseTarget>> {
        self.refresh_release_targets()?;
        Ok(self.release_targets.for_deployment(deployment_id))
    }

    pub fn release_targets_for_resource(
        &self,
        resource_id: &str,
    ) -> EngineResult<Vec<ReleaseTarget>> {
        self.refresh_release_targets()?;
        Ok(self.release_targets.for_resource(resource_id))
    }

    /// Drain the added/removed targets since the last drain and record
    /// them in `ctx`'s change set.
    pub fn take_release_target_changes(&self, ctx: &Context) -> EngineResult<ReleaseTargetChanges> {
        self.refresh_release_targets()?;
        let changes = self.release_targets.take_changes();
        for target in &changes.added {
            ctx.changes()
                .record_upsert(EntityKind::ReleaseTarget, target.key(), false, target)?;
        }
        for target in &changes.removed {
            ctx.changes()
                .record_delete(EntityKind::ReleaseTarget, target.key());
        }
        Ok(changes)
    }

    // ── Navigation helpers ───────────────────────────────────────

    pub fn deployments_for_system(&self, system_id: &str) -> Vec<Deployment> {
        self.deployments.by_parent(system_id)
    }

    pub fn environments_for_system(&self, system_id: &str) -> Vec<Environment> {
        self.environments.by_parent(system_id)
    }

    pub fn versions_for_deployment(&self, deployment_id: &str) -> Vec<DeploymentVersion> {
        self.deployment_versions.by_parent(deployment_id)
    }

    pub fn variables_for_deployment(&self, deployment_id: &str) -> Vec<DeploymentVariable> {
        self.deployment_variables.by_parent(deployment_id)
    }

    pub fn values_for_variable(&self, variable_id: &str) -> Vec<DeploymentVariableValue> {
        self.deployment_variable_values.by_parent(variable_id)
    }

    pub fn resource_variables_for(&self, resource_id: &str) -> Vec<ResourceVariable> {
        self.resource_variables.by_parent(resource_id)
    }

    pub fn approvals_for(&self, version_id: &str, environment_id: &str) -> Vec<UserApprovalRecord> {
        self.user_approval_records
            .by_parent(version_id)
            .into_iter()
            .filter(|a| a.environment_id == environment_id)
            .collect()
    }

    pub fn skips_for_version(&self, version_id: &str) -> Vec<PolicySkip> {
        self.policy_skips.by_parent(version_id)
    }

    pub fn releases_for_target(&self, target_key: &str) -> Vec<Release> {
        self.releases.by_parent(target_key)
    }

    pub fn jobs_for_release(&self, release_id: &str) -> Vec<Job> {
        self.jobs.by_parent(release_id)
    }

    pub fn jobs_for_target(&self, target_key: &str) -> Vec<Job> {
        self.releases_for_target(target_key)
            .iter()
            .flat_map(|release| self.jobs_for_release(&release.id))
            .collect()
    }

    /// The most recently created job on a target. Its release is the
    /// target's current release.
    pub fn latest_job_for_target(&self, target_key: &str) -> Option<Job> {
        self.jobs_for_target(target_key)
            .into_iter()
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
    }

    pub fn current_release(&self, target_key: &str) -> Option<Release> {
        self.latest_job_for_target(target_key)
            .and_then(|job| self.releases.get(&job.release_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use wsengine_core::{ConditionSelectorEngine, JobStatus, Selector};

    use crate::changeset::ChangeOp;

    fn store() -> Store {
        Store::new("ws", Arc::new(ConditionSelectorEngine::new()))
    }

    fn resource(id: &str, env: &str) -> Resource {
        Resource {
            id: id.into(),
            workspace_id: "ws".into(),
            name: id.into(),
            kind: "Cluster".into(),
            version: "v1".into(),
            identifier: id.into(),
            config: json!({}),
            metadata: [("env".to_string(), env.to_string())].into(),
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
        }
    }

    fn environment(id: &str, system: &str, env: &str) -> Environment {
        Environment {
            id: id.into(),
            system_id: system.into(),
            name: id.into(),
            description: None,
            resource_selector: Some(Selector::metadata_equals("env", env)),
            created_at: Utc::now(),
        }
    }

    fn deployment(id: &str, system: &str) -> Deployment {
        Deployment {
            id: id.into(),
            system_id: system.into(),
            name: id.into(),
            slug: id.into(),
            description: None,
            job_agent_id: None,
            job_agent_config: json!({}),
            resource_selector: None,
        }
    }

    #[test]
    fn release_targets_follow_inputs() {
        let store = store();
        let ctx = Context::new("ws");
        store.resources.upsert(&ctx, resource("r1", "prod")).unwrap();
        store.resources.upsert(&ctx, resource("r2", "qa")).unwrap();
        store.environments.upsert(&ctx, environment("prod", "s1", "prod")).unwrap();
        store.deployments.upsert(&ctx, deployment("api", "s1")).unwrap();
        store.deployments.upsert(&ctx, deployment("other", "s2")).unwrap();

        let targets = store.release_targets().unwrap();
        assert_eq!(targets, vec![ReleaseTarget::new("r1", "prod", "api")]);

        let changes = store.take_release_target_changes(&ctx).unwrap();
        assert_eq!(changes.added.len(), 1);

        let mut deleted = resource("r1", "prod");
        deleted.deleted_at = Some(Utc::now());
        store.resources.upsert(&ctx, deleted).unwrap();
        assert!(store.release_targets().unwrap().is_empty());
        assert!(store.resource("r1").is_none());

        let changes = store.take_release_target_changes(&ctx).unwrap();
        assert_eq!(changes.removed.len(), 1);
        let rt_changes: Vec<_> = ctx
            .changes()
            .snapshot()
            .into_iter()
            .filter(|c| c.kind == EntityKind::ReleaseTarget)
            .collect();
        assert_eq!(rt_changes.len(), 1);
        assert_eq!(rt_changes[0].op, ChangeOp::Delete);
    }

    #[test]
    fn latest_job_defines_current_release() {
        let store = store();
        let ctx = Context::new("ws");
        let target = ReleaseTarget::new("r1", "prod", "api");
        let now = Utc::now();
        let version = |id: &str| DeploymentVersion {
            id: id.into(),
            deployment_id: "api".into(),
            name: id.into(),
            tag: id.into(),
            status: Default::default(),
            config: json!({}),
            job_agent_config: json!({}),
            created_at: now,
            message: None,
        };
        let r1 = Release::new(target.clone(), version("v1"), BTreeMap::new(), now);
        let r2 = Release::new(target.clone(), version("v2"), BTreeMap::new(), now);
        for (i, release) in [&r1, &r2].into_iter().enumerate() {
            store.releases.upsert(&ctx, release.clone()).unwrap();
            store
                .jobs
                .upsert(
                    &ctx,
                    Job {
                        id: format!("job-{i}"),
                        release_id: release.id.clone(),
                        job_agent_id: None,
                        job_agent_config: json!({}),
                        status: JobStatus::Pending,
                        external_id: None,
                        message: None,
                        created_at: now + Duration::seconds(i as i64),
                        updated_at: now,
                        started_at: None,
                        completed_at: None,
                    },
                )
                .unwrap();
        }
        assert_eq!(store.jobs_for_target(&target.key()).len(), 2);
        assert_eq!(store.current_release(&target.key()).unwrap().id, r2.id);
    }

    #[test]
    fn restore_and_record_full_snapshot() {
        let source = store();
        let ctx = Context::new("ws");
        source.resources.upsert(&ctx, resource("r1", "prod")).unwrap();
        source.environments.upsert(&ctx, environment("prod", "s1", "prod")).unwrap();
        source.deployments.upsert(&ctx, deployment("api", "s1")).unwrap();

        let mut snapshot = WorkspaceSnapshot::new();
        for change in ctx.changes().drain() {
            snapshot
                .entry(change.kind)
                .or_default()
                .extend(change.payload);
        }

        let restored = store();
        restored.restore(&snapshot).unwrap();
        assert_eq!(restored.release_targets().unwrap().len(), 1);

        let save = Context::new("ws");
        // three entities plus one derived target
        assert_eq!(restored.record_full_snapshot(&save).unwrap(), 4);
        assert!(save.changes().snapshot().iter().all(|c| c.op == ChangeOp::Update));
    }

    #[test]
    fn restore_rejects_malformed_records() {
        let mut snapshot = WorkspaceSnapshot::new();
        snapshot.insert(EntityKind::Resource, vec![json!({"id": 7})]);
        assert!(matches!(
            store().restore(&snapshot),
            Err(EngineError::Persistence(_))
        ));
    }
}
