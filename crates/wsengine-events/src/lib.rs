//! wsengine-events — event intake for one workspace.
//!
//! A batch of raw events is partitioned into groups of mutually
//! non-conflicting events. Groups run in order; the events of a group run
//! concurrently and commit one change set together.
//!
//! # Grouping
//!
//! ```text
//! groups = []
//! for event in batch order:
//!     p    = profile(event.type)            // static reads / writes
//!     last = index of the last group conflicting with p, or -1
//!     put event in the first group after `last` not conflicting with p,
//!     else open a new group at the end
//! ```
//!
//! Two profiles conflict when either one writes a domain the other reads
//! or writes. Because nothing is placed at or before `last`, conflicting
//! events keep their batch order across groups.

pub mod dispatcher;
pub mod domain;
pub mod engine;
pub mod event;
pub mod grouping;
pub mod handlers;
pub mod workspace;

pub use dispatcher::{DispatchSummary, Dispatcher};
pub use domain::{DomainSet, EventProfile, StateDomain, profile};
pub use engine::Engine;
pub use event::{EventType, RawEvent};
pub use grouping::{EventGroup, group_events, group_profiles};
pub use workspace::{Workspace, WorkspaceOptions};
