//! redb table definitions for the persistence sink.
//!
//! Every table uses `&str` keys and `&[u8]` values (JSON). Entity keys are
//! `{workspace_id}/{entity_id}`; join keys append a third segment.

use redb::TableDefinition;

use wsengine_core::EntityKind;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

pub const SYSTEMS: Table = TableDefinition::new("systems");
pub const RESOURCES: Table = TableDefinition::new("resources");
pub const RESOURCE_VARIABLES: Table = TableDefinition::new("resource_variables");
pub const DEPLOYMENTS: Table = TableDefinition::new("deployments");
pub const DEPLOYMENT_VERSIONS: Table = TableDefinition::new("deployment_versions");
pub const DEPLOYMENT_VARIABLES: Table = TableDefinition::new("deployment_variables");
pub const DEPLOYMENT_VARIABLE_VALUES: Table = TableDefinition::new("deployment_variable_values");
pub const ENVIRONMENTS: Table = TableDefinition::new("environments");
pub const POLICIES: Table = TableDefinition::new("policies");
pub const POLICY_SKIPS: Table = TableDefinition::new("policy_skips");
pub const RELATIONSHIP_RULES: Table = TableDefinition::new("relationship_rules");
/// Natural-key triples keyed by `{workspace_id}/{resource}-{environment}-{deployment}`.
pub const RELEASE_TARGETS: Table = TableDefinition::new("release_targets");
pub const RELEASES: Table = TableDefinition::new("releases");
pub const JOBS: Table = TableDefinition::new("jobs");
pub const JOB_AGENTS: Table = TableDefinition::new("job_agents");
/// Keyed by `{workspace_id}/{version}:{environment}:{user}`.
pub const USER_APPROVAL_RECORDS: Table = TableDefinition::new("user_approval_records");
pub const GITHUB_ENTITIES: Table = TableDefinition::new("github_entities");
pub const WORKFLOWS: Table = TableDefinition::new("workflows");

/// Release → job join keyed by `{workspace_id}/{release_id}/{job_id}`.
pub const RELEASE_JOBS: Table = TableDefinition::new("release_jobs");

/// Deduplicated variable values keyed by `{workspace_id}/{digest}`.
pub const VARIABLE_VALUE_SNAPSHOTS: Table = TableDefinition::new("variable_value_snapshots");

pub fn table_for(kind: EntityKind) -> Table {
    match kind {
        EntityKind::System => SYSTEMS,
        EntityKind::Resource => RESOURCES,
        EntityKind::ResourceVariable => RESOURCE_VARIABLES,
        EntityKind::Deployment => DEPLOYMENTS,
        EntityKind::DeploymentVersion => DEPLOYMENT_VERSIONS,
        EntityKind::DeploymentVariable => DEPLOYMENT_VARIABLES,
        EntityKind::DeploymentVariableValue => DEPLOYMENT_VARIABLE_VALUES,
        EntityKind::Environment => ENVIRONMENTS,
        EntityKind::Policy => POLICIES,
        EntityKind::PolicySkip => POLICY_SKIPS,
        EntityKind::RelationshipRule => RELATIONSHIP_RULES,
        EntityKind::ReleaseTarget => RELEASE_TARGETS,
        EntityKind::Release => RELEASES,
        EntityKind::Job => JOBS,
        EntityKind::JobAgent => JOB_AGENTS,
        EntityKind::UserApprovalRecord => USER_APPROVAL_RECORDS,
        EntityKind::GithubEntity => GITHUB_ENTITIES,
        EntityKind::Workflow => WORKFLOWS,
    }
}

pub fn entity_key(workspace_id: &str, id: &str) -> String {
    format!("{workspace_id}/{id}")
}

/// Half-open key range covering every key under `{prefix}/`.
pub fn prefix_range(prefix: &str) -> (String, String) {
    // '0' sorts directly after '/'.
    (format!("{prefix}/"), format!("{prefix}0"))
}
