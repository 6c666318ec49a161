//! wsengine-core — shared types for the workspace engine.
//!
//! Everything here is plain data plus pure functions: the domain entities a
//! workspace owns, the selector match contract, content-addressed release
//! identity, the job status state machine, the error taxonomy, the clock
//! abstraction and the TOML configuration.

pub mod clock;
pub mod config;
pub mod error;
pub mod job;
pub mod release;
pub mod selector;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use job::JobStatus;
pub use release::{LiteralValue, Release, ReleaseTarget, release_id};
pub use selector::{
    ComparisonSelector, ConditionSelectorEngine, LogicalOperator, Selector, SelectorEngine,
    SelectorEntity,
};
pub use types::*;
