//! State domains and the static read/write profile of every event type.

use std::fmt;
use std::ops::BitOr;

use crate::event::EventType;

use StateDomain::*;

/// Abstract buckets of workspace state used to decide event conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateDomain {
    Resources,
    Deployments,
    Environments,
    Systems,
    Versions,
    Variables,
    Policies,
    Jobs,
    JobAgents,
    Approvals,
    Relationships,
    ReleaseTargets,
    Metadata,
    Workflows,
    Releases,
}

impl StateDomain {
    pub const ALL: [StateDomain; 15] = [
        StateDomain::Resources,
        StateDomain::Deployments,
        StateDomain::Environments,
        StateDomain::Systems,
        StateDomain::Versions,
        StateDomain::Variables,
        StateDomain::Policies,
        StateDomain::Jobs,
        StateDomain::JobAgents,
        StateDomain::Approvals,
        StateDomain::Relationships,
        StateDomain::ReleaseTargets,
        StateDomain::Metadata,
        StateDomain::Workflows,
        StateDomain::Releases,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateDomain::Resources => "resources",
            StateDomain::Deployments => "deployments",
            StateDomain::Environments => "environments",
            StateDomain::Systems => "systems",
            StateDomain::Versions => "versions",
            StateDomain::Variables => "variables",
            StateDomain::Policies => "policies",
            StateDomain::Jobs => "jobs",
            StateDomain::JobAgents => "job_agents",
            StateDomain::Approvals => "approvals",
            StateDomain::Relationships => "relationships",
            StateDomain::ReleaseTargets => "release_targets",
            StateDomain::Metadata => "metadata",
            StateDomain::Workflows => "workflows",
            StateDomain::Releases => "releases",
        }
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// A set of [`StateDomain`]s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DomainSet(u16);

impl DomainSet {
    pub const EMPTY: DomainSet = DomainSet(0);
    pub const ALL: DomainSet = DomainSet((1 << 15) - 1);

    pub fn of(domains: &[StateDomain]) -> Self {
        domains
            .iter()
            .fold(DomainSet::EMPTY, |set, domain| set | DomainSet(domain.bit()))
    }

    pub fn contains(self, domain: StateDomain) -> bool {
        self.0 & domain.bit() != 0
    }

    pub fn intersects(self, other: DomainSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = StateDomain> {
        StateDomain::ALL.into_iter().filter(move |d| self.contains(*d))
    }
}

impl BitOr for DomainSet {
    type Output = DomainSet;

    fn bitor(self, rhs: DomainSet) -> DomainSet {
        DomainSet(self.0 | rhs.0)
    }
}

impl fmt::Debug for DomainSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|d| d.as_str())).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventProfile {
    pub reads: DomainSet,
    pub writes: DomainSet,
}

impl EventProfile {
    pub const fn new(reads: DomainSet, writes: DomainSet) -> Self {
        Self { reads, writes }
    }

    /// Two profiles conflict when either writes what the other touches.
    /// Read-read overlap is allowed.
    pub fn conflicts_with(&self, other: &EventProfile) -> bool {
        self.writes.intersects(other.reads)
            || self.writes.intersects(other.writes)
            || self.reads.intersects(other.writes)
    }

    pub fn merge(&mut self, other: &EventProfile) {
        self.reads = self.reads | other.reads;
        self.writes = self.writes | other.writes;
    }
}

/// What a release-manager pass reads.
fn reconcile_reads() -> DomainSet {
    DomainSet::of(&[
        Resources,
        Deployments,
        Environments,
        Systems,
        Versions,
        Variables,
        Policies,
        Jobs,
        JobAgents,
        Approvals,
        Relationships,
        ReleaseTargets,
        Releases,
    ])
}

/// What a release-manager pass writes.
fn reconcile_writes() -> DomainSet {
    DomainSet::of(&[ReleaseTargets, Releases, Jobs])
}

/// Mutates `domain`, then reconciles.
fn reconciling(domain: StateDomain) -> EventProfile {
    EventProfile::new(
        reconcile_reads(),
        DomainSet::of(&[domain]) | reconcile_writes(),
    )
}

fn isolated(domain: StateDomain) -> EventProfile {
    let set = DomainSet::of(&[domain]);
    EventProfile::new(set, set)
}

/// The static profile of an event type. Unknown types touch everything.
pub fn profile(event_type: &EventType) -> EventProfile {
    use EventType as E;

    match event_type {
        E::ResourceCreated | E::ResourceUpdated => reconciling(Resources),
        // Deleting a resource drops its variables too.
        E::ResourceDeleted => EventProfile::new(
            reconcile_reads(),
            DomainSet::of(&[Resources, Variables]) | reconcile_writes(),
        ),
        E::ResourceVariableCreated | E::ResourceVariableUpdated | E::ResourceVariableDeleted => {
            reconciling(Variables)
        }
        E::DeploymentCreated | E::DeploymentUpdated | E::DeploymentDeleted => {
            reconciling(Deployments)
        }
        E::DeploymentVersionCreated | E::DeploymentVersionUpdated | E::DeploymentVersionDeleted => {
            reconciling(Versions)
        }
        E::DeploymentVariableCreated
        | E::DeploymentVariableUpdated
        | E::DeploymentVariableDeleted
        | E::DeploymentVariableValueCreated
        | E::DeploymentVariableValueUpdated
        | E::DeploymentVariableValueDeleted => reconciling(Variables),
        E::EnvironmentCreated | E::EnvironmentUpdated | E::EnvironmentDeleted => {
            reconciling(Environments)
        }
        E::SystemCreated | E::SystemUpdated => isolated(Systems),
        E::SystemDeleted => EventProfile::new(
            reconcile_reads(),
            DomainSet::of(&[Systems, Deployments, Environments]) | reconcile_writes(),
        ),
        E::JobAgentCreated | E::JobAgentUpdated | E::JobAgentDeleted => isolated(JobAgents),
        E::JobUpdated => EventProfile::new(
            reconcile_reads(),
            DomainSet::of(&[Jobs, Releases, ReleaseTargets]),
        ),
        E::PolicyCreated | E::PolicyUpdated | E::PolicyDeleted | E::PolicySkipCreated => {
            reconciling(Policies)
        }
        // Removing a skip only narrows eligibility; nothing is released.
        E::PolicySkipDeleted => isolated(Policies),
        E::UserApprovalRecordCreated
        | E::UserApprovalRecordUpdated
        | E::UserApprovalRecordDeleted => reconciling(Approvals),
        E::RelationshipRuleCreated | E::RelationshipRuleUpdated | E::RelationshipRuleDeleted => {
            reconciling(Relationships)
        }
        E::GithubEntityCreated | E::GithubEntityUpdated | E::GithubEntityDeleted => {
            isolated(Metadata)
        }
        E::WorkflowCreated | E::WorkflowUpdated | E::WorkflowDeleted => isolated(Workflows),
        E::ReleaseTargetDeploy | E::WorkspaceTick => {
            EventProfile::new(reconcile_reads(), reconcile_writes())
        }
        E::WorkspaceSave | E::Unknown(_) => EventProfile::new(DomainSet::ALL, DomainSet::ALL),
    }
}
