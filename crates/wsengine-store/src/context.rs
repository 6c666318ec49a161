//! Request-scoped context shared by the handlers of one group.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use wsengine_core::{EngineError, EngineResult};

use crate::changeset::ChangeSet;

#[derive(Clone)]
pub struct Context {
    workspace_id: Arc<str>,
    changes: Arc<ChangeSet>,
    cancel: CancellationToken,
}

impl Context {
    pub fn new(workspace_id: impl Into<Arc<str>>) -> Self {
        Self::with_cancel(workspace_id, CancellationToken::new())
    }

    pub fn with_cancel(workspace_id: impl Into<Arc<str>>, cancel: CancellationToken) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            changes: Arc::new(ChangeSet::new()),
            cancel,
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Observation point for cooperative cancellation.
    pub fn check_cancelled(&self) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("workspace_id", &self.workspace_id)
            .field("pending_changes", &self.changes.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
