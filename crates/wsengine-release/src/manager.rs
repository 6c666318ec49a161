//! The release manager: version selection, release materialization and
//! job scheduling per release target.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use wsengine_core::{
    Clock, DeploymentVersion, DeploymentVersionStatus, EngineError, EngineResult, EntityKind,
    JobStatus, Release, ReleaseTarget,
};
use wsengine_policy::{
    Decision, EvalContext, PolicyPipeline, PolicyVerdict, policies_depending_on, policy_targets,
};
use wsengine_store::{Context, ReleaseTargetChanges, Store};

use crate::jobs::{JobTransition, JobUpdate, apply_job_update, awaiting_new_agent, new_job};
use crate::variables::resolve_variables;

/// The outcome of the last policy pass over a target.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetEvaluation {
    pub evaluated_at: DateTime<Utc>,
    /// `None` when the deployment has no ready versions.
    pub decision: Option<Decision>,
    pub version_id: Option<String>,
    pub policies: Vec<PolicyVerdict>,
    pub next_evaluation_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Per-target reconciliation record, queryable after every pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTargetState {
    pub release_target: ReleaseTarget,
    pub desired_release_id: Option<String>,
    /// Job emitted by the last pass, if any.
    pub job_id: Option<String>,
    pub evaluation: TargetEvaluation,
}

impl ReleaseTargetState {
    fn failed(target: &ReleaseTarget, now: DateTime<Utc>, err: &EngineError) -> Self {
        Self {
            release_target: target.clone(),
            desired_release_id: None,
            job_id: None,
            evaluation: TargetEvaluation {
                evaluated_at: now,
                decision: None,
                version_id: None,
                policies: Vec::new(),
                next_evaluation_time: None,
                error: Some(err.to_string()),
            },
        }
    }

    /// Waiting on a time-based rule whose hint has passed.
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.evaluation
            .next_evaluation_time
            .is_some_and(|next| next <= now)
    }
}

pub struct ReleaseManager {
    clock: Arc<dyn Clock>,
    states: RwLock<HashMap<String, ReleaseTargetState>>,
}

impl ReleaseManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn state(&self, target_key: &str) -> Option<ReleaseTargetState> {
        self.states.read().get(target_key).cloned()
    }

    /// Every recorded target state, ordered by target key.
    pub fn states(&self) -> Vec<ReleaseTargetState> {
        let states = self.states.read();
        let mut all: Vec<ReleaseTargetState> = states.values().cloned().collect();
        all.sort_by(|a, b| a.release_target.cmp(&b.release_target));
        all
    }

    fn forget(&self, target_key: &str) {
        self.states.write().remove(target_key);
    }

    /// Reconcile one target. `force` emits a job even when the chosen
    /// release is already current.
    pub fn reconcile_target(
        &self,
        ctx: &Context,
        store: &Store,
        target: &ReleaseTarget,
        force: bool,
    ) -> EngineResult<ReleaseTargetState> {
        let mut states = self.reconcile_targets(ctx, store, std::slice::from_ref(target), force)?;
        states
            .pop()
            .ok_or_else(|| EngineError::not_found(EntityKind::ReleaseTarget, target.key()))
    }

    /// Reconcile `targets` under one policy pass. A failure on one target
    /// is recorded on its state and does not stop the others; only
    /// cancellation aborts the pass.
    pub fn reconcile_targets(
        &self,
        ctx: &Context,
        store: &Store,
        targets: &[ReleaseTarget],
        force: bool,
    ) -> EngineResult<Vec<ReleaseTargetState>> {
        let now = self.now();
        let pipeline = PolicyPipeline::prepare(store);
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            ctx.check_cancelled()?;
            let state = match self.reconcile_one(ctx, store, &pipeline, target, force, now) {
                Ok(state) => state,
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) => {
                    warn!(
                        release_target = %target,
                        error = %err,
                        code = err.code(),
                        "release target evaluation failed"
                    );
                    ReleaseTargetState::failed(target, now, &err)
                }
            };
            self.states.write().insert(target.key(), state.clone());
            results.push(state);
        }
        debug!(
            targets = targets.len(),
            policies = pipeline.len(),
            "reconciliation pass complete"
        );
        Ok(results)
    }

    /// Reconcile every current release target.
    pub fn reconcile_all(&self, ctx: &Context, store: &Store) -> EngineResult<Vec<ReleaseTargetState>> {
        let targets = store.release_targets()?;
        self.reconcile_targets(ctx, store, &targets, false)
    }

    pub fn reconcile_deployment(
        &self,
        ctx: &Context,
        store: &Store,
        deployment_id: &str,
    ) -> EngineResult<Vec<ReleaseTargetState>> {
        let targets = store.release_targets_for_deployment(deployment_id)?;
        self.reconcile_targets(ctx, store, &targets, false)
    }

    pub fn reconcile_environment(
        &self,
        ctx: &Context,
        store: &Store,
        environment_id: &str,
    ) -> EngineResult<Vec<ReleaseTargetState>> {
        let targets = store.release_targets_for_environment(environment_id)?;
        self.reconcile_targets(ctx, store, &targets, false)
    }

    /// Re-evaluate targets whose last pending verdict asked to be re-asked
    /// at or before now, plus targets whose job was rejected for a job
    /// agent that has since appeared.
    pub fn reconcile_due(&self, ctx: &Context, store: &Store) -> EngineResult<Vec<ReleaseTargetState>> {
        let now = self.now();
        let due: BTreeSet<String> = self
            .states
            .read()
            .iter()
            .filter(|(_, state)| state.is_due(now))
            .map(|(key, _)| key.clone())
            .collect();
        let mut targets: BTreeMap<String, ReleaseTarget> = BTreeMap::new();
        for key in due {
            match store.release_target(&key)? {
                Some(target) => {
                    targets.insert(key, target);
                }
                None => self.forget(&key),
            }
        }
        for target in store.release_targets()? {
            if awaiting_new_agent(store, &target) {
                targets.insert(target.key(), target);
            }
        }
        let targets: Vec<ReleaseTarget> = targets.into_values().collect();
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        info!(targets = targets.len(), "re-evaluating due release targets");
        self.reconcile_targets(ctx, store, &targets, false)
    }

    /// Drain release-target membership changes: removed targets lose their
    /// pending jobs, added targets are reconciled.
    pub fn sync_release_targets(
        &self,
        ctx: &Context,
        store: &Store,
    ) -> EngineResult<ReleaseTargetChanges> {
        let changes = store.take_release_target_changes(ctx)?;
        for target in &changes.removed {
            let key = target.key();
            for job in store.jobs_for_target(&key) {
                if job.status.is_pending() {
                    store.jobs.remove(ctx, &job.id)?;
                    info!(release_target = %key, job_id = %job.id, "deleted pending job of removed target");
                }
            }
            self.forget(&key);
        }
        if !changes.added.is_empty() {
            self.reconcile_targets(ctx, store, &changes.added, false)?;
        }
        Ok(changes)
    }

    /// Apply an agent status update, then run the progression hook when the
    /// job just succeeded.
    pub fn apply_job_update(
        &self,
        ctx: &Context,
        store: &Store,
        update: &JobUpdate,
    ) -> EngineResult<JobTransition> {
        let transition = apply_job_update(ctx, store, update, self.now())?;
        if transition.succeeded() {
            self.on_job_succeeded(ctx, store, &transition)?;
        }
        Ok(transition)
    }

    /// Reconcile every target governed by a policy whose progression rule
    /// depends on the environment the job succeeded in.
    pub fn on_job_succeeded(
        &self,
        ctx: &Context,
        store: &Store,
        transition: &JobTransition,
    ) -> EngineResult<Vec<ReleaseTargetState>> {
        let Some(release) = store.releases.get(&transition.job.release_id) else {
            return Ok(Vec::new());
        };
        let Some(environment) = store
            .environments
            .get(&release.release_target.environment_id)
        else {
            return Ok(Vec::new());
        };

        let mut targets: BTreeMap<String, ReleaseTarget> = BTreeMap::new();
        for policy in policies_depending_on(store, &environment)? {
            for target in policy_targets(store, &policy)? {
                targets.insert(target.key(), target);
            }
        }
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        info!(
            environment = %environment.id,
            job_id = %transition.job.id,
            targets = targets.len(),
            "environment progression triggered"
        );
        let targets: Vec<ReleaseTarget> = targets.into_values().collect();
        self.reconcile_targets(ctx, store, &targets, false)
    }

    fn reconcile_one(
        &self,
        ctx: &Context,
        store: &Store,
        pipeline: &PolicyPipeline,
        target: &ReleaseTarget,
        force: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<ReleaseTargetState> {
        let key = target.key();
        let environment = store
            .environments
            .get(&target.environment_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Environment, &target.environment_id))?;
        let resource = store
            .resource(&target.resource_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Resource, &target.resource_id))?;
        let deployment = store
            .deployments
            .get(&target.deployment_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Deployment, &target.deployment_id))?;

        let candidates = ready_versions(store, &deployment.id);
        let eval_ctx = EvalContext::new(store, now);

        let mut evaluation = TargetEvaluation {
            evaluated_at: now,
            decision: None,
            version_id: None,
            policies: Vec::new(),
            next_evaluation_time: None,
            error: None,
        };
        let mut chosen: Option<DeploymentVersion> = None;
        for version in candidates {
            let verdict = pipeline.evaluate(&eval_ctx, target, &version)?;
            let decision = verdict.decision();
            match decision {
                Decision::Allowed => {
                    evaluation.decision = Some(Decision::Allowed);
                    evaluation.version_id = Some(version.id.clone());
                    evaluation.policies = verdict.policies;
                    evaluation.next_evaluation_time = None;
                    chosen = Some(version);
                    break;
                }
                Decision::Pending => {
                    evaluation.next_evaluation_time = earliest(
                        evaluation.next_evaluation_time,
                        verdict.evaluation.next_evaluation_time,
                    );
                }
                Decision::Denied => {}
            }
            // Report the newest blocked candidate.
            if evaluation.version_id.is_none() {
                evaluation.version_id = Some(version.id.clone());
                evaluation.policies = verdict.policies;
            }
            if evaluation.decision != Some(Decision::Pending) {
                evaluation.decision = Some(decision);
            }
        }

        let Some(version) = chosen else {
            debug!(
                release_target = %key,
                decision = ?evaluation.decision,
                next_evaluation_time = ?evaluation.next_evaluation_time,
                "no eligible version"
            );
            return Ok(ReleaseTargetState {
                release_target: target.clone(),
                desired_release_id: None,
                job_id: None,
                evaluation,
            });
        };

        let variables = resolve_variables(store, &deployment.id, &resource, &environment)?;
        let release = Release::new(target.clone(), version, variables, now);
        let current = store.current_release(&key);
        let retry = awaiting_new_agent(store, target);
        if !force && !retry && current.as_ref().is_some_and(|c| c.id == release.id) {
            debug!(release_target = %key, release_id = %release.id, "release unchanged");
            return Ok(ReleaseTargetState {
                release_target: target.clone(),
                desired_release_id: Some(release.id),
                job_id: None,
                evaluation,
            });
        }

        ctx.check_cancelled()?;
        if !store.releases.contains(&release.id) {
            store.releases.upsert(ctx, release.clone())?;
            info!(
                release_target = %key,
                release_id = %release.id,
                version = %release.version.tag,
                "release created"
            );
        }

        for mut job in store.jobs_for_target(&key) {
            if job.status.is_pending() && job.release_id != release.id {
                job.status = JobStatus::Skipped;
                job.updated_at = now;
                job.completed_at = Some(now);
                job.message = Some(format!("superseded by release {}", release.id));
                info!(release_target = %key, job_id = %job.id, "skipped superseded job");
                store.jobs.upsert(ctx, job)?;
            }
        }

        // The newest job names the current release, so creation order per
        // target must be strict even when the clock stands still.
        let created_at = match store.latest_job_for_target(&key) {
            Some(latest) if latest.created_at >= now => latest.created_at + Duration::microseconds(1),
            _ => now,
        };
        let job = new_job(store, &deployment, &release, created_at);
        info!(
            release_target = %key,
            release_id = %release.id,
            job_id = %job.id,
            status = %job.status,
            forced = force,
            retry,
            "job scheduled"
        );
        let job_id = job.id.clone();
        store.jobs.upsert(ctx, job)?;

        Ok(ReleaseTargetState {
            release_target: target.clone(),
            desired_release_id: Some(release.id),
            job_id: Some(job_id),
            evaluation,
        })
    }
}

/// Ready versions of a deployment, newest first.
fn ready_versions(store: &Store, deployment_id: &str) -> Vec<DeploymentVersion> {
    let mut versions: Vec<DeploymentVersion> = store
        .versions_for_deployment(deployment_id)
        .into_iter()
        .filter(|v| v.status == DeploymentVersionStatus::Ready)
        .collect();
    versions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    versions
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
