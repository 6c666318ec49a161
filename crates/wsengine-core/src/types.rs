//! Domain types owned by a workspace store.
//!
//! All types are serde-serializable (camelCase on the wire) so they can
//! travel in event payloads and be persisted as JSON values by the sink.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobStatus;
use crate::release::{LiteralValue, ReleaseTarget};
use crate::selector::Selector;

/// Metadata labels attached to resources.
pub type Metadata = BTreeMap<String, String>;

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_true() -> bool {
    true
}

// ── Entity kinds ──────────────────────────────────────────────────

/// Every kind of record the store keeps and the sink persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    System,
    Resource,
    ResourceVariable,
    Deployment,
    DeploymentVersion,
    DeploymentVariable,
    DeploymentVariableValue,
    Environment,
    Policy,
    PolicySkip,
    RelationshipRule,
    ReleaseTarget,
    Release,
    Job,
    JobAgent,
    UserApprovalRecord,
    GithubEntity,
    Workflow,
}

impl EntityKind {
    pub const ALL: [EntityKind; 18] = [
        EntityKind::System,
        EntityKind::Resource,
        EntityKind::ResourceVariable,
        EntityKind::Deployment,
        EntityKind::DeploymentVersion,
        EntityKind::DeploymentVariable,
        EntityKind::DeploymentVariableValue,
        EntityKind::Environment,
        EntityKind::Policy,
        EntityKind::PolicySkip,
        EntityKind::RelationshipRule,
        EntityKind::ReleaseTarget,
        EntityKind::Release,
        EntityKind::Job,
        EntityKind::JobAgent,
        EntityKind::UserApprovalRecord,
        EntityKind::GithubEntity,
        EntityKind::Workflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::System => "system",
            EntityKind::Resource => "resource",
            EntityKind::ResourceVariable => "resource_variable",
            EntityKind::Deployment => "deployment",
            EntityKind::DeploymentVersion => "deployment_version",
            EntityKind::DeploymentVariable => "deployment_variable",
            EntityKind::DeploymentVariableValue => "deployment_variable_value",
            EntityKind::Environment => "environment",
            EntityKind::Policy => "policy",
            EntityKind::PolicySkip => "policy_skip",
            EntityKind::RelationshipRule => "relationship_rule",
            EntityKind::ReleaseTarget => "release_target",
            EntityKind::Release => "release",
            EntityKind::Job => "job",
            EntityKind::JobAgent => "job_agent",
            EntityKind::UserApprovalRecord => "user_approval_record",
            EntityKind::GithubEntity => "github_entity",
            EntityKind::Workflow => "workflow",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── System ────────────────────────────────────────────────────────

/// Groups deployments and environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct System {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

// ── Deployment ────────────────────────────────────────────────────

/// The thing being deployed. Belongs to exactly one system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub system_id: String,
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub job_agent_id: Option<String>,
    #[serde(default = "empty_object")]
    pub job_agent_config: serde_json::Value,
    /// Resources this deployment applies to. `None` matches every resource.
    #[serde(default)]
    pub resource_selector: Option<Selector>,
}

/// Build status of a deployment version. Only `Ready` versions are
/// release candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentVersionStatus {
    #[default]
    Unspecified,
    Building,
    Ready,
    Failed,
    Rejected,
}

/// One build of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVersion {
    pub id: String,
    pub deployment_id: String,
    #[serde(default)]
    pub name: String,
    pub tag: String,
    #[serde(default)]
    pub status: DeploymentVersionStatus,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
    #[serde(default = "empty_object")]
    pub job_agent_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A variable declared by a deployment. Unique per `(deployment_id, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVariable {
    pub id: String,
    pub deployment_id: String,
    pub key: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_value: Option<LiteralValue>,
}

/// A scoped candidate value for a deployment variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVariableValue {
    pub id: String,
    pub deployment_variable_id: String,
    /// Higher priority wins when several values match.
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub resource_selector: Option<Selector>,
    #[serde(default)]
    pub environment_selector: Option<Selector>,
    pub value: VariableValue,
}

/// Either a literal or a pointer into a related resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VariableValue {
    Literal { value: LiteralValue },
    /// Read `path` from the resource related through the relationship
    /// rule whose `reference` matches.
    Reference { reference: String, path: Vec<String> },
}

// ── Environment ───────────────────────────────────────────────────

/// A scoping group of resources within a system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: String,
    pub system_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub resource_selector: Option<Selector>,
    pub created_at: DateTime<Utc>,
}

// ── Resource ──────────────────────────────────────────────────────

/// A deploy target (cluster, VM, namespace, ...). Soft-deleted via `deleted_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub version: String,
    pub identifier: String,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Resource-scoped variable override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceVariable {
    pub id: String,
    pub resource_id: String,
    pub key: String,
    pub value: LiteralValue,
}

// ── Relationship rules ────────────────────────────────────────────

/// Defines resource-to-resource links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipRule {
    pub id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub name: String,
    /// Name under which the related resource is addressed by variables.
    pub reference: String,
    pub relationship_type: String,
    #[serde(default)]
    pub from_selector: Option<Selector>,
    #[serde(default)]
    pub to_selector: Option<Selector>,
    #[serde(default)]
    pub property_matchers: Vec<PropertyMatcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyMatcher {
    pub from_property: Vec<String>,
    pub to_property: Vec<String>,
    #[serde(default)]
    pub operator: PropertyOperator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyOperator {
    #[default]
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    EndsWith,
}

// ── Jobs ──────────────────────────────────────────────────────────

/// An external execution realizing a release on its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub release_id: String,
    #[serde(default)]
    pub job_agent_id: Option<String>,
    #[serde(default = "empty_object")]
    pub job_agent_config: serde_json::Value,
    pub status: JobStatus,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The instant this job reached its current status, used as the
    /// success time by progression rules.
    pub fn completion_time(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.updated_at)
    }
}

/// Identifies an external executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAgent {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

// ── Policies ──────────────────────────────────────────────────────

/// A set of rules that gate the release targets matched by `selectors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// A target is governed when any entry matches it.
    #[serde(default)]
    pub selectors: Vec<PolicyTargetSelector>,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    pub created_at: DateTime<Utc>,
}

/// All present selectors must match for the entry to match a target.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTargetSelector {
    #[serde(default)]
    pub deployment_selector: Option<Selector>,
    #[serde(default)]
    pub environment_selector: Option<Selector>,
    #[serde(default)]
    pub resource_selector: Option<Selector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub id: String,
    pub policy_id: String,
    #[serde(flatten)]
    pub kind: RuleKind,
}

/// The rule variants a policy can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleKind {
    AnyApproval(AnyApprovalRule),
    UserApproval(UserApprovalRule),
    EnvironmentProgression(EnvironmentProgressionRule),
}

impl RuleKind {
    pub fn rule_type(&self) -> RuleType {
        match self {
            RuleKind::AnyApproval(_) => RuleType::AnyApproval,
            RuleKind::UserApproval(_) => RuleType::UserApproval,
            RuleKind::EnvironmentProgression(_) => RuleType::EnvironmentProgression,
        }
    }
}

/// Evaluator family, used for bypass and skip matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleType {
    AnyApproval,
    UserApproval,
    EnvironmentProgression,
    PassRate,
    SoakTime,
    MaxAge,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleType::AnyApproval => "anyApproval",
            RuleType::UserApproval => "userApproval",
            RuleType::EnvironmentProgression => "environmentProgression",
            RuleType::PassRate => "passRate",
            RuleType::SoakTime => "soakTime",
            RuleType::MaxAge => "maxAge",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyApprovalRule {
    pub min_approvals: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserApprovalRule {
    pub user_id: String,
}

/// Gate a target on the state of the same version in upstream environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentProgressionRule {
    pub depends_on_environment_selector: Selector,
    /// Percentage (0–100) of upstream targets that must have succeeded.
    #[serde(default)]
    pub minimum_success_percentage: Option<f64>,
    #[serde(default)]
    pub minimum_soak_time_minutes: Option<i64>,
    #[serde(default)]
    pub maximum_age_hours: Option<i64>,
    #[serde(default)]
    pub success_statuses: Option<Vec<JobStatus>>,
}

impl EnvironmentProgressionRule {
    pub fn success_statuses(&self) -> Vec<JobStatus> {
        match &self.success_statuses {
            Some(statuses) if !statuses.is_empty() => statuses.clone(),
            _ => vec![JobStatus::Successful],
        }
    }
}

/// Bypasses one rule for one version, optionally narrowed to an
/// environment and/or resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySkip {
    pub id: String,
    pub workspace_id: String,
    pub rule_id: String,
    pub version_id: String,
    #[serde(default)]
    pub environment_id: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PolicySkip {
    pub fn applies_to(
        &self,
        rule_id: &str,
        version_id: &str,
        target: &ReleaseTarget,
        now: DateTime<Utc>,
    ) -> bool {
        if self.rule_id != rule_id || self.version_id != version_id {
            return false;
        }
        if self.expires_at.is_some_and(|expires| expires <= now) {
            return false;
        }
        let env_ok = self
            .environment_id
            .as_deref()
            .is_none_or(|env| env == target.environment_id);
        let res_ok = self
            .resource_id
            .as_deref()
            .is_none_or(|res| res == target.resource_id);
        env_ok && res_ok
    }
}

// ── Approvals ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    Rejected,
}

/// One user's verdict on a version for an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserApprovalRecord {
    pub user_id: String,
    pub version_id: String,
    pub environment_id: String,
    pub status: ApprovalStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserApprovalRecord {
    /// Natural key `{version_id}:{environment_id}:{user_id}`.
    pub fn key(&self) -> String {
        approval_key(&self.version_id, &self.environment_id, &self.user_id)
    }
}

pub fn approval_key(version_id: &str, environment_id: &str, user_id: &str) -> String {
    format!("{version_id}:{environment_id}:{user_id}")
}

// ── Metadata / workflow domains ───────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubEntity {
    pub id: String,
    pub workspace_id: String,
    pub slug: String,
    pub installation_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default = "empty_object")]
    pub inputs: serde_json::Value,
}
