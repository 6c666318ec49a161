//! wsengine-store — the in-memory source of truth for one workspace.
//!
//! Typed containers guarded by reader-writer locks, foreign-key indices,
//! the derived release-target view, the resource relationship graph, and
//! the per-request change set flushed to a [`PersistenceSink`].

pub mod changeset;
pub mod context;
pub mod relationships;
pub mod release_targets;
pub mod repository;
pub mod store;

pub use changeset::{Change, ChangeOp, ChangeSet, PersistenceSink};
pub use context::Context;
pub use release_targets::{ReleaseTargetChanges, compute_release_targets};
pub use repository::{Entity, Repository};
pub use store::{Store, WorkspaceSnapshot};
