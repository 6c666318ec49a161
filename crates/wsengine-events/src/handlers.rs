//! Typed event handlers.
//!
//! Every handler decodes and validates its payload before touching the
//! store, so a rejected event leaves no partial mutation behind.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use wsengine_core::{
    Deployment, DeploymentVariable, DeploymentVariableValue, DeploymentVersion, EngineError,
    EngineResult, EntityKind, Environment, GithubEntity, JobAgent, Policy, PolicySkip,
    RelationshipRule, Resource, ResourceVariable, System, UserApprovalRecord, Workflow,
    approval_key,
};
use wsengine_release::JobUpdate;
use wsengine_store::{Context, Entity, Repository, Store};

use crate::engine::Engine;
use crate::event::{EventType, RawEvent};

pub type Handler = fn(&Engine, &Context, &RawEvent) -> EngineResult<()>;

/// The handler registered for an event type.
pub fn handler_for(event_type: &EventType) -> Handler {
    use EventType as E;

    match event_type {
        E::ResourceCreated | E::ResourceUpdated => upsert_resource,
        E::ResourceDeleted => delete_resource,
        E::ResourceVariableCreated | E::ResourceVariableUpdated => upsert_resource_variable,
        E::ResourceVariableDeleted => delete_resource_variable,
        E::DeploymentCreated | E::DeploymentUpdated => upsert_deployment,
        E::DeploymentDeleted => delete_deployment,
        E::DeploymentVersionCreated | E::DeploymentVersionUpdated => upsert_version,
        E::DeploymentVersionDeleted => delete_version,
        E::DeploymentVariableCreated | E::DeploymentVariableUpdated => upsert_variable,
        E::DeploymentVariableDeleted => delete_variable,
        E::DeploymentVariableValueCreated | E::DeploymentVariableValueUpdated => {
            upsert_variable_value
        }
        E::DeploymentVariableValueDeleted => delete_variable_value,
        E::EnvironmentCreated | E::EnvironmentUpdated => upsert_environment,
        E::EnvironmentDeleted => delete_environment,
        E::SystemCreated | E::SystemUpdated => upsert_system,
        E::SystemDeleted => delete_system,
        E::JobAgentCreated | E::JobAgentUpdated => upsert_job_agent,
        E::JobAgentDeleted => delete_job_agent,
        E::JobUpdated => update_job,
        E::PolicyCreated | E::PolicyUpdated => upsert_policy,
        E::PolicyDeleted => delete_policy,
        E::PolicySkipCreated => create_policy_skip,
        E::PolicySkipDeleted => delete_policy_skip,
        E::UserApprovalRecordCreated | E::UserApprovalRecordUpdated => upsert_approval,
        E::UserApprovalRecordDeleted => delete_approval,
        E::RelationshipRuleCreated | E::RelationshipRuleUpdated => upsert_relationship_rule,
        E::RelationshipRuleDeleted => delete_relationship_rule,
        E::GithubEntityCreated | E::GithubEntityUpdated => upsert_github_entity,
        E::GithubEntityDeleted => delete_github_entity,
        E::WorkflowCreated | E::WorkflowUpdated => upsert_workflow,
        E::WorkflowDeleted => delete_workflow,
        E::ReleaseTargetDeploy => deploy_release_target,
        E::WorkspaceTick => tick,
        E::WorkspaceSave => save,
        E::Unknown(_) => unsupported,
    }
}

// ── Payload helpers ───────────────────────────────────────────────

fn decode<T: DeserializeOwned>(event: &RawEvent) -> EngineResult<T> {
    serde_json::from_value(event.payload.clone())
        .map_err(|e| EngineError::invalid_payload(event.event_type.as_str(), e.to_string()))
}

/// Payloads that carry a `workspaceId` must name the engine's workspace.
fn check_workspace(engine: &Engine, event: &RawEvent) -> EngineResult<()> {
    let Some(id) = event.payload.get("workspaceId").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    if id != engine.workspace_id() {
        return Err(EngineError::invalid_payload(
            event.event_type.as_str(),
            format!("payload workspace {id} does not match {}", engine.workspace_id()),
        ));
    }
    Ok(())
}

fn require<T: Entity>(repo: &Repository<T>, id: &str, referrer: &str) -> EngineResult<T> {
    repo.get(id)
        .ok_or_else(|| EngineError::invalid_reference(T::KIND, id, format!("referenced by {referrer}")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdPayload {
    id: String,
}

fn remove_by_id<T: Entity>(
    repo: &Repository<T>,
    ctx: &Context,
    event: &RawEvent,
) -> EngineResult<Option<T>> {
    let IdPayload { id } = decode(event)?;
    let removed = repo.remove(ctx, &id)?;
    if removed.is_none() {
        debug!(kind = %T::KIND, id = %id, "delete of absent entity ignored");
    }
    Ok(removed)
}

// ── Resources ────────────────────────────────────────────────────

fn upsert_resource(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    check_workspace(engine, event)?;
    let resource: Resource = decode(event)?;
    let id = resource.id.clone();
    engine.store().resources.upsert(ctx, resource)?;
    engine.sync_targets(ctx)?;
    engine.reconcile_resource(ctx, &id)
}

fn delete_resource(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    let store = engine.store();
    let Some(resource) = remove_by_id(&store.resources, ctx, event)? else {
        return Ok(());
    };
    for variable in store.resource_variables_for(&resource.id) {
        store.resource_variables.remove(ctx, &variable.id)?;
    }
    engine.sync_targets(ctx)
}

fn upsert_resource_variable(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    let variable: ResourceVariable = decode(event)?;
    require(&engine.store().resources, &variable.resource_id, &variable.id)?;
    let resource_id = variable.resource_id.clone();
    engine.store().resource_variables.upsert(ctx, variable)?;
    engine.reconcile_resource(ctx, &resource_id)
}

fn delete_resource_variable(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    if let Some(variable) = remove_by_id(&engine.store().resource_variables, ctx, event)? {
        engine.reconcile_resource(ctx, &variable.resource_id)?;
    }
    Ok(())
}

// ── Deployments, versions, variables ─────────────────────────────

fn upsert_deployment(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    let deployment: Deployment = decode(event)?;
    require(&engine.store().systems, &deployment.system_id, &deployment.id)?;
    let id = deployment.id.clone();
    engine.store().deployments.upsert(ctx, deployment)?;
    engine.sync_targets(ctx)?;
    engine.reconcile_deployment(ctx, &id)
}

fn delete_deployment(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    remove_by_id(&engine.store().deployments, ctx, event)?;
    engine.sync_targets(ctx)
}

fn upsert_version(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    let version: DeploymentVersion = decode(event)?;
    require(&engine.store().deployments, &version.deployment_id, &version.id)?;
    let deployment_id = version.deployment_id.clone();
    info!(version = %version.id, tag = %version.tag, status = ?version.status, "deployment version received");
    engine.store().deployment_versions.upsert(ctx, version)?;
    engine.reconcile_deployment(ctx, &deployment_id)
}

fn delete_version(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    if let Some(version) = remove_by_id(&engine.store().deployment_versions, ctx, event)? {
        engine.reconcile_deployment(ctx, &version.deployment_id)?;
    }
    Ok(())
}

fn upsert_variable(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    let variable: DeploymentVariable = decode(event)?;
    require(&engine.store().deployments, &variable.deployment_id, &variable.id)?;
    let duplicate = engine
        .store()
        .variables_for_deployment(&variable.deployment_id)
        .into_iter()
        .any(|v| v.key == variable.key && v.id != variable.id);
    if duplicate {
        return Err(EngineError::invalid_payload(
            event.event_type.as_str(),
            format!(
                "variable {} already declared on deployment {}",
                variable.key, variable.deployment_id
            ),
        ));
    }
    let deployment_id = variable.deployment_id.clone();
    engine.store().deployment_variables.upsert(ctx, variable)?;
    engine.reconcile_deployment(ctx, &deployment_id)
}

fn delete_variable(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    if let Some(variable) = remove_by_id(&engine.store().deployment_variables, ctx, event)? {
        engine.reconcile_deployment(ctx, &variable.deployment_id)?;
    }
    Ok(())
}

fn upsert_variable_value(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    let value: DeploymentVariableValue = decode(event)?;
    let variable = require(
        &engine.store().deployment_variables,
        &value.deployment_variable_id,
        &value.id,
    )?;
    engine.store().deployment_variable_values.upsert(ctx, value)?;
    engine.reconcile_deployment(ctx, &variable.deployment_id)
}

fn delete_variable_value(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    let Some(value) = remove_by_id(&engine.store().deployment_variable_values, ctx, event)? else {
        return Ok(());
    };
    match engine.store().deployment_variables.get(&value.deployment_variable_id) {
        Some(variable) => engine.reconcile_deployment(ctx, &variable.deployment_id),
        None => Ok(()),
    }
}

// ── Environments, systems ────────────────────────────────────────

fn upsert_environment(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    let environment: Environment = decode(event)?;
    require(&engine.store().systems, &environment.system_id, &environment.id)?;
    let id = environment.id.clone();
    engine.store().environments.upsert(ctx, environment)?;
    engine.sync_targets(ctx)?;
    engine.reconcile_environment(ctx, &id)
}

fn delete_environment(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    remove_by_id(&engine.store().environments, ctx, event)?;
    engine.sync_targets(ctx)
}

fn upsert_system(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    check_workspace(engine, event)?;
    let system: System = decode(event)?;
    engine.store().systems.upsert(ctx, system)?;
    Ok(())
}

/// Removes the system with its deployments and environments.
fn delete_system(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    let Some(system) = remove_by_id(&engine.store().systems, ctx, event)? else {
        return Ok(());
    };
    let store = engine.store();
    for deployment in store.deployments_for_system(&system.id) {
        store.deployments.remove(ctx, &deployment.id)?;
    }
    for environment in store.environments_for_system(&system.id) {
        store.environments.remove(ctx, &environment.id)?;
    }
    info!(system = %system.id, "system deleted");
    engine.sync_targets(ctx)
}

// ── Jobs and agents ──────────────────────────────────────────────

fn upsert_job_agent(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    check_workspace(engine, event)?;
    let agent: JobAgent = decode(event)?;
    engine.store().job_agents.upsert(ctx, agent)?;
    Ok(())
}

fn delete_job_agent(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    remove_by_id(&engine.store().job_agents, ctx, event)?;
    Ok(())
}

fn update_job(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    let update: JobUpdate = decode(event)?;
    engine.releases().apply_job_update(ctx, engine.store(), &update)?;
    Ok(())
}

// ── Policies ─────────────────────────────────────────────────────

fn upsert_policy(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    check_workspace(engine, event)?;
    let policy: Policy = decode(event)?;
    if let Some(rule) = policy.rules.iter().find(|r| r.policy_id != policy.id) {
        return Err(EngineError::invalid_payload(
            event.event_type.as_str(),
            format!("rule {} belongs to policy {}", rule.id, rule.policy_id),
        ));
    }
    engine.store().policies.upsert(ctx, policy)?;
    engine.reconcile_all(ctx)
}

fn delete_policy(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    if remove_by_id(&engine.store().policies, ctx, event)?.is_some() {
        engine.reconcile_all(ctx)?;
    }
    Ok(())
}

fn create_policy_skip(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    check_workspace(engine, event)?;
    let skip: PolicySkip = decode(event)?;
    let version = require(&engine.store().deployment_versions, &skip.version_id, &skip.id)?;
    engine.store().policy_skips.upsert(ctx, skip)?;
    engine.reconcile_deployment(ctx, &version.deployment_id)
}

fn delete_policy_skip(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    remove_by_id(&engine.store().policy_skips, ctx, event)?;
    Ok(())
}

fn upsert_approval(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    let record: UserApprovalRecord = decode(event)?;
    let version = require(&engine.store().deployment_versions, &record.version_id, &record.key())?;
    require(&engine.store().environments, &record.environment_id, &record.key())?;
    let environment_id = record.environment_id.clone();
    engine.store().user_approval_records.upsert(ctx, record)?;
    engine.reconcile_scope(ctx, &environment_id, &version.deployment_id)
}

/// Names an approval by its natural key.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalKeyPayload {
    user_id: String,
    version_id: String,
    environment_id: String,
}

fn delete_approval(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    let target: ApprovalKeyPayload = decode(event)?;
    let key = approval_key(&target.version_id, &target.environment_id, &target.user_id);
    if engine.store().user_approval_records.remove(ctx, &key)?.is_none() {
        debug!(approval = %key, "delete of absent approval ignored");
        return Ok(());
    }
    if let Some(version) = engine.store().deployment_versions.get(&target.version_id) {
        engine.reconcile_scope(ctx, &target.environment_id, &version.deployment_id)?;
    }
    Ok(())
}

// ── Relationships ────────────────────────────────────────────────

fn upsert_relationship_rule(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    check_workspace(engine, event)?;
    let rule: RelationshipRule = decode(event)?;
    engine.store().relationship_rules.upsert(ctx, rule)?;
    engine.sync_targets(ctx)?;
    engine.reconcile_all(ctx)
}

fn delete_relationship_rule(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    remove_by_id(&engine.store().relationship_rules, ctx, event)?;
    engine.sync_targets(ctx)?;
    engine.reconcile_all(ctx)
}

// ── Metadata and workflows ───────────────────────────────────────

fn upsert_github_entity(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    check_workspace(engine, event)?;
    let entity: GithubEntity = decode(event)?;
    engine.store().github_entities.upsert(ctx, entity)?;
    Ok(())
}

fn delete_github_entity(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    remove_by_id(&engine.store().github_entities, ctx, event)?;
    Ok(())
}

fn upsert_workflow(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    check_workspace(engine, event)?;
    let workflow: Workflow = decode(event)?;
    engine.store().workflows.upsert(ctx, workflow)?;
    Ok(())
}

fn delete_workflow(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    remove_by_id(&engine.store().workflows, ctx, event)?;
    Ok(())
}

// ── Commands ─────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployPayload {
    release_target_key: String,
    #[serde(default)]
    force: bool,
}

fn deploy_release_target(engine: &Engine, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    let DeployPayload {
        release_target_key,
        force,
    } = decode(event)?;
    let store: &Store = engine.store();
    let target = store
        .release_target(&release_target_key)?
        .ok_or_else(|| EngineError::not_found(EntityKind::ReleaseTarget, &release_target_key))?;
    engine.releases().reconcile_target(ctx, store, &target, force)?;
    Ok(())
}

fn tick(engine: &Engine, ctx: &Context, _event: &RawEvent) -> EngineResult<()> {
    engine.releases().reconcile_due(ctx, engine.store())?;
    Ok(())
}

fn save(engine: &Engine, ctx: &Context, _event: &RawEvent) -> EngineResult<()> {
    let recorded = engine.store().record_full_snapshot(ctx)?;
    info!(workspace_id = %engine.workspace_id(), recorded, "workspace save recorded");
    Ok(())
}

fn unsupported(_engine: &Engine, _ctx: &Context, event: &RawEvent) -> EngineResult<()> {
    Err(EngineError::UnsupportedEvent(event.event_type.to_string()))
}
