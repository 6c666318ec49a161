//! The engine: one workspace's store plus its release manager, and the
//! entry point that routes a single event to its handler.

use std::sync::Arc;

use tracing::{debug, warn};

use wsengine_core::{Clock, EngineError, EngineResult};
use wsengine_release::ReleaseManager;
use wsengine_store::{Context, Store};

use crate::event::RawEvent;
use crate::handlers::handler_for;

pub struct Engine {
    store: Store,
    releases: ReleaseManager,
}

impl Engine {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            releases: ReleaseManager::new(clock),
        }
    }

    pub fn workspace_id(&self) -> &str {
        self.store.workspace_id()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn releases(&self) -> &ReleaseManager {
        &self.releases
    }

    /// Apply one event. Mutations land in the store and are recorded on
    /// `ctx`; persisting them is the caller's business.
    pub fn handle(&self, ctx: &Context, event: &RawEvent) -> EngineResult<()> {
        ctx.check_cancelled()?;
        if event.workspace_id != self.workspace_id() {
            return Err(EngineError::invalid_payload(
                event.event_type.as_str(),
                format!(
                    "event for workspace {} delivered to {}",
                    event.workspace_id,
                    self.workspace_id()
                ),
            ));
        }

        let handler = handler_for(&event.event_type);
        match handler(self, ctx, event) {
            Ok(()) => {
                debug!(event_type = %event.event_type, "event handled");
                Ok(())
            }
            Err(err) => {
                warn!(
                    event_type = %event.event_type,
                    error = %err,
                    code = err.code(),
                    "event rejected"
                );
                Err(err)
            }
        }
    }

    /// Drain target membership changes and reconcile the additions.
    pub(crate) fn sync_targets(&self, ctx: &Context) -> EngineResult<()> {
        self.releases.sync_release_targets(ctx, &self.store)?;
        Ok(())
    }

    pub(crate) fn reconcile_all(&self, ctx: &Context) -> EngineResult<()> {
        self.releases.reconcile_all(ctx, &self.store)?;
        Ok(())
    }

    pub(crate) fn reconcile_deployment(&self, ctx: &Context, deployment_id: &str) -> EngineResult<()> {
        self.releases
            .reconcile_deployment(ctx, &self.store, deployment_id)?;
        Ok(())
    }

    pub(crate) fn reconcile_environment(&self, ctx: &Context, environment_id: &str) -> EngineResult<()> {
        self.releases
            .reconcile_environment(ctx, &self.store, environment_id)?;
        Ok(())
    }

    pub(crate) fn reconcile_resource(&self, ctx: &Context, resource_id: &str) -> EngineResult<()> {
        let targets = self.store.release_targets_for_resource(resource_id)?;
        self.releases
            .reconcile_targets(ctx, &self.store, &targets, false)?;
        Ok(())
    }

    /// Targets of `deployment_id` inside `environment_id`.
    pub(crate) fn reconcile_scope(
        &self,
        ctx: &Context,
        environment_id: &str,
        deployment_id: &str,
    ) -> EngineResult<()> {
        let targets: Vec<_> = self
            .store
            .release_targets_for_environment(environment_id)?
            .into_iter()
            .filter(|t| t.deployment_id == deployment_id)
            .collect();
        self.releases
            .reconcile_targets(ctx, &self.store, &targets, false)?;
        Ok(())
    }
}
