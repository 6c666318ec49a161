//! wsengine-release — turns policy verdicts into releases and jobs.
//!
//! # Reconciliation
//!
//! ```text
//! for target in requested targets:
//!     candidates = ready versions of target.deployment, newest first
//!     chosen     = first candidate whose policy verdict is allowed
//!     if none: record decision + earliest nextEvaluationTime, stop
//!     release    = Release(target, chosen, resolve_variables(target))
//!     if release.id == current release of target and not forced: stop
//!     upsert release
//!     skip pending jobs of older releases on target
//!     create job (pending, or invalid_job_agent when no agent resolves)
//! ```
//!
//! The current release of a target is the release of its newest job. A
//! successful job re-reconciles every target governed by a policy whose
//! progression rule depends on the job's environment.

pub mod jobs;
pub mod manager;
pub mod variables;

pub use jobs::{JobTransition, JobUpdate, apply_job_update, merge_json, new_job};
pub use manager::{ReleaseManager, ReleaseTargetState, TargetEvaluation};
pub use variables::resolve_variables;
