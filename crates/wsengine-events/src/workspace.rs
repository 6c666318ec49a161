//! A live workspace: the engine, its persistence sink and the dispatcher.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use wsengine_core::{
    Clock, ConditionSelectorEngine, EngineError, EngineResult, EntityKind, SelectorEngine,
    SystemClock,
};
use wsengine_release::ReleaseManager;
use wsengine_store::{Context, PersistenceSink, Store, WorkspaceSnapshot};

use crate::dispatcher::{DispatchSummary, Dispatcher};
use crate::engine::Engine;
use crate::event::RawEvent;

pub struct WorkspaceOptions {
    pub selectors: Arc<dyn SelectorEngine>,
    pub clock: Arc<dyn Clock>,
    pub parallelism: usize,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        Self {
            selectors: Arc::new(ConditionSelectorEngine::new()),
            clock: Arc::new(SystemClock),
            parallelism: 8,
        }
    }
}

pub struct Workspace {
    engine: Arc<Engine>,
    sink: Arc<dyn PersistenceSink>,
    dispatcher: Dispatcher,
}

impl Workspace {
    /// An empty workspace backed by `sink`. Nothing is read from it.
    pub fn new(
        sink: Arc<dyn PersistenceSink>,
        workspace_id: impl Into<String>,
        options: WorkspaceOptions,
    ) -> Self {
        let store = Store::new(workspace_id, options.selectors);
        Self {
            engine: Arc::new(Engine::new(store, options.clock)),
            sink,
            dispatcher: Dispatcher::new(options.parallelism),
        }
    }

    /// Load every entity kind in parallel, rebuild the store and reconcile
    /// all release targets before the workspace goes live.
    pub async fn load(
        sink: Arc<dyn PersistenceSink>,
        workspace_id: impl Into<String>,
        options: WorkspaceOptions,
    ) -> EngineResult<Self> {
        let workspace_id = workspace_id.into();
        let snapshot = read_snapshot(&sink, &workspace_id).await?;
        let records: usize = snapshot.values().map(Vec::len).sum();

        let workspace = Self::new(sink, workspace_id, options);
        let engine = Arc::clone(&workspace.engine);
        let sink = Arc::clone(&workspace.sink);
        let targets = tokio::task::spawn_blocking(move || -> EngineResult<usize> {
            let store = engine.store();
            store.restore(&snapshot)?;
            let ctx = Context::new(engine.workspace_id());
            // Restored membership drains as additions, which reconciles it.
            let changes = engine.releases().sync_release_targets(&ctx, store)?;
            ctx.changes().commit(engine.workspace_id(), sink.as_ref())?;
            Ok(changes.added.len())
        })
        .await
        .map_err(|e| EngineError::Persistence(format!("load worker failed: {e}")))??;

        info!(
            workspace_id = %workspace.workspace_id(),
            records,
            release_targets = targets,
            "workspace loaded"
        );
        Ok(workspace)
    }

    pub fn workspace_id(&self) -> &str {
        self.engine.workspace_id()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn store(&self) -> &Store {
        self.engine.store()
    }

    pub fn releases(&self) -> &ReleaseManager {
        self.engine.releases()
    }

    pub async fn dispatch(&self, events: Vec<RawEvent>) -> EngineResult<DispatchSummary> {
        self.dispatch_with_cancel(events, &CancellationToken::new())
            .await
    }

    pub async fn dispatch_with_cancel(
        &self,
        events: Vec<RawEvent>,
        cancel: &CancellationToken,
    ) -> EngineResult<DispatchSummary> {
        self.dispatcher
            .dispatch(&self.engine, &self.sink, events, cancel)
            .await
    }
}

/// One blocking reader per entity kind; the first failure fails the load.
async fn read_snapshot(
    sink: &Arc<dyn PersistenceSink>,
    workspace_id: &str,
) -> EngineResult<WorkspaceSnapshot> {
    let mut readers = JoinSet::new();
    for kind in EntityKind::ALL {
        let sink = Arc::clone(sink);
        let workspace_id = workspace_id.to_string();
        readers.spawn_blocking(move || {
            sink.load_kind(&workspace_id, kind)
                .map(|records| (kind, records))
        });
    }

    let mut snapshot = WorkspaceSnapshot::new();
    while let Some(joined) = readers.join_next().await {
        let (kind, records) = joined
            .map_err(|e| EngineError::Persistence(format!("load worker failed: {e}")))?
            .map_err(|e| match e {
                EngineError::Persistence(_) => e,
                other => EngineError::Persistence(other.to_string()),
            })?;
        if !records.is_empty() {
            snapshot.insert(kind, records);
        }
    }
    Ok(snapshot)
}
