//! Job creation and status updates reported by agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use wsengine_core::{
    Deployment, EngineError, EngineResult, EntityKind, Job, JobStatus, Release, ReleaseTarget,
};
use wsengine_store::{Context, Store};

/// Deep merge of JSON objects. `overlay` wins on conflicting leaves; a
/// non-object on either side is replaced by `overlay`.
pub fn merge_json(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                let next = match merged.get(key) {
                    Some(existing) => merge_json(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}

/// The deployment's job agent, if it names one that exists.
pub fn resolve_job_agent<'a>(store: &Store, deployment: &'a Deployment) -> Option<&'a str> {
    deployment
        .job_agent_id
        .as_deref()
        .filter(|id| store.job_agents.contains(id))
}

/// The target's newest job was rejected for a missing job agent that the
/// deployment can now resolve.
pub fn awaiting_new_agent(store: &Store, target: &ReleaseTarget) -> bool {
    let Some(job) = store.latest_job_for_target(&target.key()) else {
        return false;
    };
    job.status == JobStatus::InvalidJobAgent
        && store
            .deployments
            .get(&target.deployment_id)
            .is_some_and(|deployment| resolve_job_agent(store, &deployment).is_some())
}

/// Build the job realizing `release`. Without a resolvable job agent the
/// job is created terminal as `invalid_job_agent`.
pub fn new_job(store: &Store, deployment: &Deployment, release: &Release, now: DateTime<Utc>) -> Job {
    let agent = resolve_job_agent(store, deployment);
    let (status, message, completed_at) = match (agent, deployment.job_agent_id.as_deref()) {
        (Some(_), _) => (JobStatus::Pending, None, None),
        (None, Some(missing)) => (
            JobStatus::InvalidJobAgent,
            Some(format!("job agent {missing} not found")),
            Some(now),
        ),
        (None, None) => (
            JobStatus::InvalidJobAgent,
            Some(format!("deployment {} has no job agent", deployment.id)),
            Some(now),
        ),
    };

    Job {
        id: Uuid::new_v4().to_string(),
        release_id: release.id.clone(),
        job_agent_id: agent.map(str::to_string),
        job_agent_config: merge_json(
            &deployment.job_agent_config,
            &release.version.job_agent_config,
        ),
        status,
        external_id: None,
        message,
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at,
    }
}

/// Payload of `job.updated`. Only the mutable fields of a job; anything
/// else an agent sends, such as a message, is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct JobTransition {
    pub previous: JobStatus,
    pub job: Job,
}

impl JobTransition {
    /// The job entered `successful` with this update.
    pub fn succeeded(&self) -> bool {
        self.job.status == JobStatus::Successful && self.previous != JobStatus::Successful
    }
}

/// Apply an agent-reported update. Transitions outside the job state
/// machine fail with `InvalidStateTransition` and leave the job untouched.
pub fn apply_job_update(
    ctx: &Context,
    store: &Store,
    update: &JobUpdate,
    now: DateTime<Utc>,
) -> EngineResult<JobTransition> {
    let mut job = store
        .jobs
        .get(&update.id)
        .ok_or_else(|| EngineError::not_found(EntityKind::Job, &update.id))?;
    let previous = job.status;
    if !previous.can_transition_to(update.status) {
        warn!(
            job_id = %job.id,
            from = %previous,
            to = %update.status,
            "rejected job transition"
        );
        return Err(EngineError::InvalidStateTransition {
            job_id: job.id,
            from: previous,
            to: update.status,
        });
    }

    if let Some(external_id) = &update.external_id {
        job.external_id = Some(external_id.clone());
    }
    job.status = update.status;
    job.updated_at = now;
    if update.started_at.is_some() {
        job.started_at = update.started_at;
    } else if job.status == JobStatus::InProgress && job.started_at.is_none() {
        job.started_at = Some(now);
    }
    if update.completed_at.is_some() {
        job.completed_at = update.completed_at;
    } else if job.status.is_terminal() && job.completed_at.is_none() {
        job.completed_at = Some(now);
    }

    store.jobs.upsert(ctx, job.clone())?;
    if previous != job.status {
        info!(job_id = %job.id, from = %previous, to = %job.status, "job transitioned");
    }
    Ok(JobTransition { previous, job })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::Duration;
    use serde_json::json;
    use wsengine_core::{
        ConditionSelectorEngine, DeploymentVersion, DeploymentVersionStatus, JobAgent,
        ReleaseTarget,
    };

    fn deployment(agent: Option<&str>) -> Deployment {
        Deployment {
            id: "api".into(),
            system_id: "s1".into(),
            name: "api".into(),
            slug: "api".into(),
            description: None,
            job_agent_id: agent.map(str::to_string),
            job_agent_config: json!({"image": {"repo": "api", "tag": "latest"}, "replicas": 2}),
            resource_selector: None,
        }
    }

    fn release(now: DateTime<Utc>) -> Release {
        let version = DeploymentVersion {
            id: "v1".into(),
            deployment_id: "api".into(),
            name: "v1".into(),
            tag: "1.2.3".into(),
            status: DeploymentVersionStatus::Ready,
            config: json!({}),
            job_agent_config: json!({"image": {"tag": "1.2.3"}}),
            created_at: now,
            message: None,
        };
        Release::new(ReleaseTarget::new("r1", "prod", "api"), version, BTreeMap::new(), now)
    }

    fn store() -> (Store, Context) {
        (
            Store::new("ws", Arc::new(ConditionSelectorEngine::new())),
            Context::new("ws"),
        )
    }

    #[test]
    fn merge_prefers_overlay_leaves() {
        let merged = merge_json(
            &json!({"a": {"b": 1, "c": 2}, "d": [1]}),
            &json!({"a": {"c": 3}, "d": [2], "e": null}),
        );
        assert_eq!(merged, json!({"a": {"b": 1, "c": 3}, "d": [2], "e": null}));
        assert_eq!(merge_json(&json!({"x": 1}), &Value::Null), json!({"x": 1}));
    }

    #[test]
    fn new_job_merges_agent_config() {
        let (store, ctx) = store();
        store
            .job_agents
            .upsert(
                &ctx,
                JobAgent {
                    id: "argo".into(),
                    workspace_id: "ws".into(),
                    name: "argo".into(),
                    agent_type: "argo-cd".into(),
                    config: json!({}),
                },
            )
            .unwrap();
        let now = Utc::now();
        let job = new_job(&store, &deployment(Some("argo")), &release(now), now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.job_agent_id.as_deref(), Some("argo"));
        assert_eq!(
            job.job_agent_config,
            json!({"image": {"repo": "api", "tag": "1.2.3"}, "replicas": 2})
        );
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn missing_agent_is_invalid() {
        let (store, _) = store();
        let now = Utc::now();
        let job = new_job(&store, &deployment(Some("ghost")), &release(now), now);
        assert_eq!(job.status, JobStatus::InvalidJobAgent);
        assert!(job.job_agent_id.is_none());
        assert_eq!(job.completed_at, Some(now));

        let job = new_job(&store, &deployment(None), &release(now), now);
        assert_eq!(job.status, JobStatus::InvalidJobAgent);
    }

    #[test]
    fn updates_stamp_timestamps() {
        let (store, ctx) = store();
        let t0 = Utc::now();
        let mut job = new_job(&store, &deployment(None), &release(t0), t0);
        job.status = JobStatus::Pending;
        job.completed_at = None;
        store.jobs.upsert(&ctx, job.clone()).unwrap();

        let update = |status, external_id: Option<&str>| JobUpdate {
            id: job.id.clone(),
            status,
            external_id: external_id.map(str::to_string),
            started_at: None,
            completed_at: None,
        };

        let t1 = t0 + Duration::minutes(1);
        let moved = apply_job_update(&ctx, &store, &update(JobStatus::InProgress, None), t1).unwrap();
        assert_eq!(moved.job.started_at, Some(t1));
        assert!(!moved.succeeded());

        // Same non-terminal status carries metadata only.
        let t2 = t0 + Duration::minutes(2);
        let meta =
            apply_job_update(&ctx, &store, &update(JobStatus::InProgress, Some("run-42")), t2)
                .unwrap();
        assert_eq!(meta.job.external_id.as_deref(), Some("run-42"));
        assert_eq!(meta.job.started_at, Some(t1));

        let t3 = t0 + Duration::minutes(3);
        let done = apply_job_update(&ctx, &store, &update(JobStatus::Successful, None), t3).unwrap();
        assert!(done.succeeded());
        assert_eq!(done.job.completed_at, Some(t3));
        assert_eq!(store.jobs.get(&job.id).unwrap().status, JobStatus::Successful);
    }

    #[test]
    fn agent_message_does_not_overwrite_job() {
        let (store, ctx) = store();
        let now = Utc::now();
        let mut job = new_job(&store, &deployment(None), &release(now), now);
        job.status = JobStatus::Pending;
        job.completed_at = None;
        store.jobs.upsert(&ctx, job.clone()).unwrap();

        let update: JobUpdate = serde_json::from_value(serde_json::json!({
            "id": job.id,
            "status": "in_progress",
            "message": "picked up by runner-7",
        }))
        .unwrap();
        let moved = apply_job_update(&ctx, &store, &update, now).unwrap();
        assert_eq!(moved.job.status, JobStatus::InProgress);
        assert_eq!(moved.job.message, job.message);
    }

    #[test]
    fn invalid_transition_leaves_job_untouched() {
        let (store, ctx) = store();
        let now = Utc::now();
        let mut job = new_job(&store, &deployment(None), &release(now), now);
        job.status = JobStatus::Successful;
        store.jobs.upsert(&ctx, job.clone()).unwrap();

        let err = apply_job_update(
            &ctx,
            &store,
            &JobUpdate {
                id: job.id.clone(),
                status: JobStatus::Pending,
                external_id: Some("late".into()),
                started_at: None,
                completed_at: None,
            },
            now,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
        assert_eq!(store.jobs.get(&job.id).unwrap(), job);
    }

    #[test]
    fn unknown_job_is_not_found() {
        let (store, ctx) = store();
        let err = apply_job_update(
            &ctx,
            &store,
            &JobUpdate {
                id: "nope".into(),
                status: JobStatus::InProgress,
                external_id: None,
                started_at: None,
                completed_at: None,
            },
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: EntityKind::Job, .. }));
    }
}
