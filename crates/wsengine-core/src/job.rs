//! Job status state machine.
//!
//! ```text
//!  pending ──► in_progress ──► successful | failure | cancelled
//!     │             └────────► action_required ──► in_progress | failure
//!     └─► skipped | invalid_job_agent | invalid_integration | external_run_not_found
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    ActionRequired,
    Successful,
    Failure,
    Cancelled,
    Skipped,
    InvalidJobAgent,
    InvalidIntegration,
    ExternalRunNotFound,
}

impl JobStatus {
    pub const ALL: [JobStatus; 10] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::ActionRequired,
        JobStatus::Successful,
        JobStatus::Failure,
        JobStatus::Cancelled,
        JobStatus::Skipped,
        JobStatus::InvalidJobAgent,
        JobStatus::InvalidIntegration,
        JobStatus::ExternalRunNotFound,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::ActionRequired => "action_required",
            JobStatus::Successful => "successful",
            JobStatus::Failure => "failure",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Skipped => "skipped",
            JobStatus::InvalidJobAgent => "invalid_job_agent",
            JobStatus::InvalidIntegration => "invalid_integration",
            JobStatus::ExternalRunNotFound => "external_run_not_found",
        }
    }

    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            JobStatus::Pending | JobStatus::InProgress | JobStatus::ActionRequired
        )
    }

    /// Whether a job in this status is still waiting to be picked up.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Pending)
    }

    /// Whether `self -> next` is allowed.
    ///
    /// Repeating a non-terminal status is accepted so agents can report
    /// metadata (external id, timestamps) without moving the job.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        if *self == next {
            return !self.is_terminal();
        }
        match self {
            Pending => matches!(
                next,
                InProgress | Skipped | InvalidJobAgent | InvalidIntegration | ExternalRunNotFound
            ),
            InProgress => matches!(next, Successful | Failure | Cancelled | ActionRequired),
            ActionRequired => matches!(next, InProgress | Failure),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
