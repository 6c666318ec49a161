//! wsengine-persist — redb-backed persistence sink.
//!
//! Implements the bulk per-kind reader and the transactional change-set
//! writer the engine persists through.

pub mod error;
pub mod sink;
pub mod tables;

pub use error::{PersistError, PersistResult};
pub use sink::{RedbSink, VariableValueSnapshot, snapshot_digest};
