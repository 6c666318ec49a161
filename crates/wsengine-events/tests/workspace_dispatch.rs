//! End-to-end batches against a redb-backed workspace.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Value, json};

use wsengine_core::{
    ConditionSelectorEngine, EngineError, EntityKind, JobStatus, ManualClock, ReleaseTarget,
};
use wsengine_events::{EventType, RawEvent, Workspace, WorkspaceOptions};
use wsengine_persist::RedbSink;
use wsengine_policy::Decision;
use wsengine_store::PersistenceSink;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap()
}

fn ev(name: &str, payload: Value) -> RawEvent {
    RawEvent::new(EventType::parse(name), "ws", payload)
}

fn options(clock: Arc<ManualClock>) -> WorkspaceOptions {
    WorkspaceOptions {
        selectors: Arc::new(ConditionSelectorEngine::new()),
        clock,
        parallelism: 4,
    }
}

fn resource(id: &str, env: &str) -> RawEvent {
    ev(
        "resource.created",
        json!({
            "id": id,
            "workspaceId": "ws",
            "name": id,
            "kind": "Cluster",
            "identifier": id,
            "metadata": {"env": env},
            "createdAt": t0(),
        }),
    )
}

fn environment(id: &str) -> RawEvent {
    ev(
        "environment.created",
        json!({
            "id": id,
            "systemId": "sys",
            "name": id,
            "resourceSelector": {"json": {"type": "metadata", "key": "env", "operator": "equals", "value": id}},
            "createdAt": t0(),
        }),
    )
}

/// System, agent, staging + prod, one cluster each, deployment `api`.
fn topology() -> Vec<RawEvent> {
    vec![
        ev("system.created", json!({"id": "sys", "workspaceId": "ws", "name": "shop"})),
        ev(
            "job-agent.created",
            json!({"id": "agent", "workspaceId": "ws", "name": "runner", "type": "github"}),
        ),
        environment("staging"),
        environment("prod"),
        resource("staging-1", "staging"),
        resource("prod-1", "prod"),
        ev(
            "deployment.created",
            json!({
                "id": "api",
                "systemId": "sys",
                "name": "api",
                "slug": "api",
                "jobAgentId": "agent",
                "jobAgentConfig": {"workflow": "deploy.yml"},
            }),
        ),
    ]
}

fn version(id: &str, tag: &str, created_at: DateTime<Utc>) -> RawEvent {
    ev(
        "deployment-version.created",
        json!({
            "id": id,
            "deploymentId": "api",
            "name": id,
            "tag": tag,
            "status": "ready",
            "createdAt": created_at,
        }),
    )
}

fn job_update(id: &str, status: &str) -> RawEvent {
    ev("job.updated", json!({"id": id, "status": status}))
}

fn staging() -> ReleaseTarget {
    ReleaseTarget::new("staging-1", "staging", "api")
}

fn prod() -> ReleaseTarget {
    ReleaseTarget::new("prod-1", "prod", "api")
}

async fn seeded(sink: &Arc<RedbSink>, clock: &Arc<ManualClock>) -> Workspace {
    let workspace = Workspace::load(sink.clone(), "ws", options(clock.clone()))
        .await
        .unwrap();
    let mut batch = topology();
    batch.push(version("v1", "1.0.0", t0()));
    workspace.dispatch(batch).await.unwrap();
    workspace
}

fn job_for(workspace: &Workspace, target: &ReleaseTarget) -> wsengine_core::Job {
    workspace
        .store()
        .latest_job_for_target(&target.key())
        .unwrap()
}

#[tokio::test]
async fn ready_version_becomes_persisted_jobs() {
    let sink = Arc::new(RedbSink::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let workspace = seeded(&sink, &clock).await;

    for target in [staging(), prod()] {
        let job = job_for(&workspace, &target);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.job_agent_id.as_deref(), Some("agent"));
        assert_eq!(job.job_agent_config, json!({"workflow": "deploy.yml"}));
    }
    assert_eq!(sink.load_kind("ws", EntityKind::Job).unwrap().len(), 2);
    assert_eq!(sink.load_kind("ws", EntityKind::Release).unwrap().len(), 2);
    assert_eq!(sink.load_kind("ws", EntityKind::ReleaseTarget).unwrap().len(), 2);

    // Reloading reconciles every target but finds nothing new to release.
    let reloaded = Workspace::load(sink.clone(), "ws", options(clock.clone()))
        .await
        .unwrap();
    assert_eq!(reloaded.store().jobs.len(), 2);
    assert_eq!(reloaded.releases().states().len(), 2);
    assert_eq!(sink.load_kind("ws", EntityKind::Job).unwrap().len(), 2);
}

#[tokio::test]
async fn newer_version_supersedes_pending_job() {
    let sink = Arc::new(RedbSink::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let workspace = seeded(&sink, &clock).await;
    let first = job_for(&workspace, &prod());

    clock.advance(Duration::minutes(5));
    workspace
        .dispatch(vec![version("v2", "1.1.0", t0() + Duration::hours(1))])
        .await
        .unwrap();

    let second = job_for(&workspace, &prod());
    assert_ne!(first.id, second.id);
    assert_eq!(
        workspace.store().jobs.get(&first.id).unwrap().status,
        JobStatus::Skipped
    );
    let current = workspace.store().current_release(&prod().key()).unwrap();
    assert_eq!(current.version.id, "v2");
}

#[tokio::test]
async fn rejected_transition_aborts_the_batch() {
    let sink = Arc::new(RedbSink::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let workspace = seeded(&sink, &clock).await;
    let job = job_for(&workspace, &staging());

    workspace
        .dispatch(vec![
            job_update(&job.id, "in_progress"),
            job_update(&job.id, "successful"),
        ])
        .await
        .unwrap();
    assert_eq!(
        workspace.store().jobs.get(&job.id).unwrap().status,
        JobStatus::Successful
    );

    let err = workspace
        .dispatch(vec![job_update(&job.id, "pending")])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    assert_eq!(
        workspace.store().jobs.get(&job.id).unwrap().status,
        JobStatus::Successful
    );
}

#[tokio::test]
async fn dangling_reference_is_rejected_before_mutation() {
    let sink = Arc::new(RedbSink::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let workspace = Workspace::load(sink.clone(), "ws", options(clock)).await.unwrap();

    let err = workspace
        .dispatch(vec![ev(
            "deployment.created",
            json!({"id": "api", "systemId": "ghost", "name": "api"}),
        )])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidReference { kind: EntityKind::System, .. }
    ));
    assert!(workspace.store().deployments.is_empty());
    assert!(sink.load_kind("ws", EntityKind::Deployment).unwrap().is_empty());
}

#[tokio::test]
async fn foreign_and_malformed_events_are_invalid_payloads() {
    let sink = Arc::new(RedbSink::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let workspace = Workspace::load(sink, "ws", options(clock)).await.unwrap();

    let foreign = RawEvent::new(
        EventType::SystemCreated,
        "other",
        json!({"id": "sys", "workspaceId": "other", "name": "shop"}),
    );
    let err = workspace.dispatch(vec![foreign]).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidPayload { .. }));

    let malformed = ev("system.created", json!({"id": 7}));
    let err = workspace.dispatch(vec![malformed]).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidPayload { .. }));
    assert!(workspace.store().systems.is_empty());
}

#[tokio::test]
async fn deploy_command_forces_redeploy() {
    let sink = Arc::new(RedbSink::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let workspace = seeded(&sink, &clock).await;
    let before = workspace.store().jobs_for_target(&prod().key()).len();

    workspace
        .dispatch(vec![ev(
            "release-target.deploy",
            json!({"releaseTargetKey": prod().key(), "force": true}),
        )])
        .await
        .unwrap();
    assert_eq!(
        workspace.store().jobs_for_target(&prod().key()).len(),
        before + 1
    );

    let err = workspace
        .dispatch(vec![ev(
            "release-target.deploy",
            json!({"releaseTargetKey": "nope-nope-nope"}),
        )])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::NotFound { kind: EntityKind::ReleaseTarget, .. }
    ));
}

#[tokio::test]
async fn tick_releases_prod_after_soak() {
    let sink = Arc::new(RedbSink::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let workspace = Workspace::load(sink.clone(), "ws", options(clock.clone()))
        .await
        .unwrap();

    let mut batch = topology();
    batch.push(ev(
        "policy.created",
        json!({
            "id": "soak-prod",
            "workspaceId": "ws",
            "name": "soak before prod",
            "selectors": [{"environmentSelector": {"json": {"type": "name", "operator": "equals", "value": "prod"}}}],
            "rules": [{
                "id": "soak",
                "policyId": "soak-prod",
                "environmentProgression": {
                    "dependsOnEnvironmentSelector": {"json": {"type": "name", "operator": "equals", "value": "staging"}},
                    "minimumSoakTimeMinutes": 30
                }
            }],
            "createdAt": t0(),
        }),
    ));
    batch.push(version("v1", "1.0.0", t0()));
    workspace.dispatch(batch).await.unwrap();

    assert!(workspace.store().latest_job_for_target(&prod().key()).is_none());
    let staging_job = job_for(&workspace, &staging());
    workspace
        .dispatch(vec![
            job_update(&staging_job.id, "in_progress"),
            job_update(&staging_job.id, "successful"),
        ])
        .await
        .unwrap();

    let state = workspace.releases().state(&prod().key()).unwrap();
    assert_eq!(state.evaluation.decision, Some(Decision::Pending));
    assert_eq!(
        state.evaluation.next_evaluation_time,
        Some(t0() + Duration::minutes(30))
    );

    clock.advance(Duration::minutes(31));
    workspace
        .dispatch(vec![ev("workspace.tick", json!({}))])
        .await
        .unwrap();
    let prod_job = job_for(&workspace, &prod());
    assert_eq!(prod_job.status, JobStatus::Pending);
    assert_eq!(
        workspace.releases().state(&prod().key()).unwrap().evaluation.decision,
        Some(Decision::Allowed)
    );
}

#[tokio::test]
async fn system_delete_cascades_and_removes_targets() {
    let sink = Arc::new(RedbSink::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let workspace = seeded(&sink, &clock).await;

    workspace
        .dispatch(vec![ev("system.deleted", json!({"id": "sys"}))])
        .await
        .unwrap();

    let store = workspace.store();
    assert!(store.deployments.is_empty());
    assert!(store.environments.is_empty());
    assert!(store.release_targets().unwrap().is_empty());
    // Pending jobs of removed targets are dropped.
    assert!(store.jobs.is_empty());
    assert!(sink.load_kind("ws", EntityKind::ReleaseTarget).unwrap().is_empty());
}

#[tokio::test]
async fn save_writes_a_full_copy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.redb");
    let clock = Arc::new(ManualClock::new(t0()));
    {
        let sink = Arc::new(RedbSink::open(&path).unwrap());
        let workspace = seeded(&sink, &clock).await;
        workspace
            .dispatch(vec![ev("workspace.save", json!({}))])
            .await
            .unwrap();
    }

    let sink = Arc::new(RedbSink::open(&path).unwrap());
    let workspace = Workspace::load(sink, "ws", options(clock)).await.unwrap();
    let store = workspace.store();
    assert!(store.systems.contains("sys"));
    assert_eq!(store.resources.len(), 2);
    assert_eq!(store.jobs.len(), 2);
    assert_eq!(store.release_targets().unwrap().len(), 2);
}

#[tokio::test]
async fn late_job_agent_is_picked_up_on_tick() {
    for agent_first in [true, false] {
        let sink = Arc::new(RedbSink::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let workspace = Workspace::load(sink.clone(), "ws", options(clock.clone()))
            .await
            .unwrap();

        let mut batch = topology();
        let agent = batch.remove(1);
        assert_eq!(agent.event_type, EventType::JobAgentCreated);
        batch.push(version("v1", "1.0.0", t0()));
        if agent_first {
            batch.insert(0, agent);
            workspace.dispatch(batch).await.unwrap();
        } else {
            workspace.dispatch(batch).await.unwrap();
            for target in [staging(), prod()] {
                assert_eq!(job_for(&workspace, &target).status, JobStatus::InvalidJobAgent);
            }
            workspace.dispatch(vec![agent]).await.unwrap();
            assert_eq!(workspace.store().jobs.len(), 2, "agent alone schedules nothing");
        }

        clock.advance(Duration::minutes(1));
        workspace
            .dispatch(vec![ev("workspace.tick", json!({}))])
            .await
            .unwrap();

        for target in [staging(), prod()] {
            let job = job_for(&workspace, &target);
            assert_eq!(job.status, JobStatus::Pending, "agent_first={agent_first}");
            assert_eq!(job.job_agent_id.as_deref(), Some("agent"));
            let current = workspace.store().current_release(&target.key()).unwrap();
            assert_eq!(current.version.id, "v1");
        }
        let expected_jobs = if agent_first { 2 } else { 4 };
        assert_eq!(workspace.store().jobs.len(), expected_jobs);
        assert_eq!(workspace.store().releases.len(), 2);
        assert_eq!(
            sink.load_kind("ws", EntityKind::Job).unwrap().len(),
            expected_jobs
        );
    }
}

#[tokio::test]
async fn deployment_update_retries_once_agent_exists() {
    let sink = Arc::new(RedbSink::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let workspace = Workspace::load(sink, "ws", options(clock.clone()))
        .await
        .unwrap();

    let mut batch = topology();
    let agent = batch.remove(1);
    batch.push(version("v1", "1.0.0", t0()));
    workspace.dispatch(batch).await.unwrap();
    assert_eq!(job_for(&workspace, &prod()).status, JobStatus::InvalidJobAgent);

    clock.advance(Duration::minutes(1));
    workspace
        .dispatch(vec![
            agent,
            ev(
                "deployment.updated",
                json!({
                    "id": "api",
                    "systemId": "sys",
                    "name": "api",
                    "slug": "api",
                    "jobAgentId": "agent",
                    "jobAgentConfig": {"workflow": "deploy.yml"},
                }),
            ),
        ])
        .await
        .unwrap();
    assert_eq!(job_for(&workspace, &prod()).status, JobStatus::Pending);
    assert_eq!(workspace.store().jobs.len(), 4);
}

#[tokio::test]
async fn resource_delete_drops_its_variables() {
    let sink = Arc::new(RedbSink::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let workspace = seeded(&sink, &clock).await;

    workspace
        .dispatch(vec![ev(
            "resource-variable.created",
            json!({"id": "rv", "resourceId": "prod-1", "key": "replicas", "value": 5}),
        )])
        .await
        .unwrap();
    assert_eq!(workspace.store().resource_variables_for("prod-1").len(), 1);

    workspace
        .dispatch(vec![ev("resource.deleted", json!({"id": "prod-1"}))])
        .await
        .unwrap();
    assert!(workspace.store().resource_variables.is_empty());
    assert!(
        sink.load_kind("ws", EntityKind::ResourceVariable)
            .unwrap()
            .is_empty()
    );

    workspace
        .dispatch(vec![resource("prod-1", "prod")])
        .await
        .unwrap();
    assert!(workspace.store().resource_variables_for("prod-1").is_empty());
}

#[tokio::test]
async fn approval_delete_needs_only_its_key() {
    let sink = Arc::new(RedbSink::open_in_memory().unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let workspace = seeded(&sink, &clock).await;

    workspace
        .dispatch(vec![ev(
            "user-approval-record.created",
            json!({
                "userId": "alice",
                "versionId": "v1",
                "environmentId": "prod",
                "status": "approved",
                "createdAt": t0(),
            }),
        )])
        .await
        .unwrap();
    assert_eq!(workspace.store().user_approval_records.len(), 1);

    let key = json!({"userId": "alice", "versionId": "v1", "environmentId": "prod"});
    workspace
        .dispatch(vec![ev("user-approval-record.deleted", key.clone())])
        .await
        .unwrap();
    assert!(workspace.store().user_approval_records.is_empty());
    assert!(
        sink.load_kind("ws", EntityKind::UserApprovalRecord)
            .unwrap()
            .is_empty()
    );

    // Deleting again is a no-op.
    workspace
        .dispatch(vec![ev("user-approval-record.deleted", key)])
        .await
        .unwrap();
}
