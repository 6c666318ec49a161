//! The raw event envelope and the closed set of event types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

macro_rules! event_types {
    ($($variant:ident => $wire:literal,)+) => {
        /// Every event the engine understands. Anything else parses to
        /// [`EventType::Unknown`].
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum EventType {
            $($variant,)+
            Unknown(String),
        }

        impl EventType {
            pub const KNOWN: &'static [EventType] = &[$(EventType::$variant,)+];

            pub fn as_str(&self) -> &str {
                match self {
                    $(EventType::$variant => $wire,)+
                    EventType::Unknown(name) => name,
                }
            }

            pub fn parse(name: &str) -> Self {
                match name {
                    $($wire => EventType::$variant,)+
                    other => EventType::Unknown(other.to_string()),
                }
            }
        }
    };
}

event_types! {
    ResourceCreated => "resource.created",
    ResourceUpdated => "resource.updated",
    ResourceDeleted => "resource.deleted",
    ResourceVariableCreated => "resource-variable.created",
    ResourceVariableUpdated => "resource-variable.updated",
    ResourceVariableDeleted => "resource-variable.deleted",
    DeploymentCreated => "deployment.created",
    DeploymentUpdated => "deployment.updated",
    DeploymentDeleted => "deployment.deleted",
    DeploymentVersionCreated => "deployment-version.created",
    DeploymentVersionUpdated => "deployment-version.updated",
    DeploymentVersionDeleted => "deployment-version.deleted",
    DeploymentVariableCreated => "deployment-variable.created",
    DeploymentVariableUpdated => "deployment-variable.updated",
    DeploymentVariableDeleted => "deployment-variable.deleted",
    DeploymentVariableValueCreated => "deployment-variable-value.created",
    DeploymentVariableValueUpdated => "deployment-variable-value.updated",
    DeploymentVariableValueDeleted => "deployment-variable-value.deleted",
    EnvironmentCreated => "environment.created",
    EnvironmentUpdated => "environment.updated",
    EnvironmentDeleted => "environment.deleted",
    SystemCreated => "system.created",
    SystemUpdated => "system.updated",
    SystemDeleted => "system.deleted",
    JobAgentCreated => "job-agent.created",
    JobAgentUpdated => "job-agent.updated",
    JobAgentDeleted => "job-agent.deleted",
    JobUpdated => "job.updated",
    PolicyCreated => "policy.created",
    PolicyUpdated => "policy.updated",
    PolicyDeleted => "policy.deleted",
    PolicySkipCreated => "policy-skip.created",
    PolicySkipDeleted => "policy-skip.deleted",
    UserApprovalRecordCreated => "user-approval-record.created",
    UserApprovalRecordUpdated => "user-approval-record.updated",
    UserApprovalRecordDeleted => "user-approval-record.deleted",
    RelationshipRuleCreated => "relationship-rule.created",
    RelationshipRuleUpdated => "relationship-rule.updated",
    RelationshipRuleDeleted => "relationship-rule.deleted",
    GithubEntityCreated => "github-entity.created",
    GithubEntityUpdated => "github-entity.updated",
    GithubEntityDeleted => "github-entity.deleted",
    WorkflowCreated => "workflow.created",
    WorkflowUpdated => "workflow.updated",
    WorkflowDeleted => "workflow.deleted",
    ReleaseTargetDeploy => "release-target.deploy",
    WorkspaceTick => "workspace.tick",
    WorkspaceSave => "workspace.save",
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        EventType::parse(&name)
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event as received at the intake boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub event_type: EventType,
    pub workspace_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl RawEvent {
    pub fn new(event_type: EventType, workspace_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type,
            workspace_id: workspace_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}
