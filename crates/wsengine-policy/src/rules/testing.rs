//! Shared fixture for rule tests: one system with `staging` and `prod`
//! environments, deployment `api`, version `v1`, and prod resource `r1`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use wsengine_core::{
    ApprovalStatus, ConditionSelectorEngine, Deployment, DeploymentVersion,
    DeploymentVersionStatus, Environment, Job, JobStatus, Release, ReleaseTarget, Resource,
    Selector, System, UserApprovalRecord,
};
use wsengine_store::{Context, Store};

use crate::evaluation::RuleEvaluation;
use crate::evaluator::{EvalContext, Evaluator, EvaluatorScope};

pub(crate) struct Fixture {
    pub store: Store,
    pub ctx: Context,
    pub t0: DateTime<Utc>,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Store::new("ws", Arc::new(ConditionSelectorEngine::new()));
        let ctx = Context::new("ws");
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let fx = Self { store, ctx, t0 };

        fx.store
            .systems
            .upsert(
                &fx.ctx,
                System {
                    id: "s1".into(),
                    workspace_id: "ws".into(),
                    name: "core".into(),
                    description: None,
                },
            )
            .unwrap();
        for env in ["staging", "prod"] {
            fx.store
                .environments
                .upsert(
                    &fx.ctx,
                    Environment {
                        id: env.into(),
                        system_id: "s1".into(),
                        name: env.into(),
                        description: None,
                        resource_selector: Some(Selector::metadata_equals("env", env)),
                        created_at: t0,
                    },
                )
                .unwrap();
        }
        fx.store
            .deployments
            .upsert(
                &fx.ctx,
                Deployment {
                    id: "api".into(),
                    system_id: "s1".into(),
                    name: "api".into(),
                    slug: "api".into(),
                    description: None,
                    job_agent_id: None,
                    job_agent_config: json!({}),
                    resource_selector: None,
                },
            )
            .unwrap();
        fx.store
            .deployment_versions
            .upsert(&fx.ctx, fx.version())
            .unwrap();
        fx.add_resource("r1", "prod");
        fx
    }

    pub fn version(&self) -> DeploymentVersion {
        DeploymentVersion {
            id: "v1".into(),
            deployment_id: "api".into(),
            name: "v1".into(),
            tag: "v1".into(),
            status: DeploymentVersionStatus::Ready,
            config: json!({}),
            job_agent_config: json!({}),
            created_at: self.t0,
            message: None,
        }
    }

    pub fn add_resource(&self, id: &str, env: &str) {
        self.store
            .resources
            .upsert(
                &self.ctx,
                Resource {
                    id: id.into(),
                    workspace_id: "ws".into(),
                    name: id.into(),
                    kind: "Cluster".into(),
                    version: "v1".into(),
                    identifier: id.into(),
                    config: json!({}),
                    metadata: [("env".to_string(), env.to_string())].into(),
                    created_at: self.t0,
                    updated_at: None,
                    deleted_at: None,
                },
            )
            .unwrap();
    }

    pub fn approve(&self, user: &str, status: ApprovalStatus, minutes: i64) {
        self.store
            .user_approval_records
            .upsert(
                &self.ctx,
                UserApprovalRecord {
                    user_id: user.into(),
                    version_id: "v1".into(),
                    environment_id: "prod".into(),
                    status,
                    reason: None,
                    created_at: self.t0 + Duration::minutes(minutes),
                },
            )
            .unwrap();
    }

    /// Record a job for `v1` on `(resource, env, api)`.
    pub fn job(&self, resource: &str, env: &str, status: JobStatus, completed: DateTime<Utc>) {
        let target = ReleaseTarget::new(resource, env, "api");
        let release = Release::new(target, self.version(), BTreeMap::new(), self.t0);
        self.store.releases.upsert(&self.ctx, release.clone()).unwrap();
        let id = format!("job-{resource}-{env}-{}", self.store.jobs.len());
        self.store
            .jobs
            .upsert(
                &self.ctx,
                Job {
                    id,
                    release_id: release.id,
                    job_agent_id: None,
                    job_agent_config: json!({}),
                    status,
                    external_id: None,
                    message: None,
                    created_at: self.t0,
                    updated_at: completed,
                    started_at: Some(self.t0),
                    completed_at: status.is_terminal().then_some(completed),
                },
            )
            .unwrap();
    }

    pub fn evaluate(&self, evaluator: &dyn Evaluator) -> RuleEvaluation {
        self.evaluate_at(evaluator, self.t0 + Duration::days(1))
    }

    pub fn evaluate_at(&self, evaluator: &dyn Evaluator, now: DateTime<Utc>) -> RuleEvaluation {
        let target = ReleaseTarget::new("r1", "prod", "api");
        let environment = self.store.environments.get("prod").unwrap();
        let resource = self.store.resources.get("r1").unwrap();
        let deployment = self.store.deployments.get("api").unwrap();
        let version = self.version();
        let scope = EvaluatorScope {
            release_target: &target,
            environment: &environment,
            resource: &resource,
            deployment: &deployment,
            version: &version,
        };
        evaluator
            .evaluate(&EvalContext::new(&self.store, now), &scope)
            .unwrap()
    }
}
