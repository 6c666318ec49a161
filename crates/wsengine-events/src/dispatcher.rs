//! Concurrent group execution.
//!
//! Groups run one after another. Inside a group every handler gets a
//! worker from a bounded pool and all of them append to one change set,
//! which is committed once the whole group has succeeded.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use wsengine_core::{EngineError, EngineResult};
use wsengine_store::{Context, PersistenceSink};

use crate::engine::Engine;
use crate::event::RawEvent;
use crate::grouping::{EventGroup, group_events};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub groups: usize,
    pub events: usize,
}

pub struct Dispatcher {
    permits: Arc<Semaphore>,
    parallelism: usize,
}

impl Dispatcher {
    pub fn new(parallelism: usize) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            permits: Arc::new(Semaphore::new(parallelism)),
            parallelism,
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Group `events` and run the groups in order. The first handler error
    /// cancels its siblings, discards the group's change set and stops the
    /// batch; earlier groups stay committed.
    pub async fn dispatch(
        &self,
        engine: &Arc<Engine>,
        sink: &Arc<dyn PersistenceSink>,
        events: Vec<RawEvent>,
        cancel: &CancellationToken,
    ) -> EngineResult<DispatchSummary> {
        let groups = group_events(&events);
        let events: Arc<[RawEvent]> = Arc::from(events);
        let mut summary = DispatchSummary::default();

        for (index, group) in groups.iter().enumerate() {
            if cancel.is_cancelled() {
                error!(group = index, "batch cancelled before group start");
                return Err(EngineError::Cancelled);
            }
            let ctx = Context::with_cancel(engine.workspace_id(), cancel.child_token());
            if let Err(err) = self.run_group(engine, &ctx, &events, group).await {
                ctx.changes().discard();
                error!(
                    group = index,
                    events = group.len(),
                    error = %err,
                    code = err.code(),
                    "group failed, batch aborted"
                );
                return Err(err);
            }

            let changes = commit(&ctx, sink).await?;
            debug!(group = index, events = group.len(), changes, "group committed");
            summary.groups += 1;
            summary.events += group.len();
        }

        if summary.events > 0 {
            info!(
                groups = summary.groups,
                events = summary.events,
                "batch dispatched"
            );
        }
        Ok(summary)
    }

    async fn run_group(
        &self,
        engine: &Arc<Engine>,
        ctx: &Context,
        events: &Arc<[RawEvent]>,
        group: &EventGroup,
    ) -> EngineResult<()> {
        let mut workers = JoinSet::new();
        for &index in &group.indices {
            workers.spawn(run_event(
                Arc::clone(engine),
                ctx.clone(),
                Arc::clone(events),
                index,
                Arc::clone(&self.permits),
            ));
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined
                .map_err(|e| EngineError::Evaluator(format!("handler worker failed: {e}")))
                .and_then(|r| r);
            let Err(err) = result else {
                continue;
            };
            if first_error.is_none() {
                ctx.cancellation().cancel();
                first_error = Some(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn run_event(
    engine: Arc<Engine>,
    ctx: Context,
    events: Arc<[RawEvent]>,
    index: usize,
    permits: Arc<Semaphore>,
) -> EngineResult<()> {
    let _permit = tokio::select! {
        permit = permits.acquire_owned() => permit.map_err(|_| EngineError::Cancelled)?,
        _ = ctx.cancellation().cancelled() => return Err(EngineError::Cancelled),
    };
    tokio::task::spawn_blocking(move || engine.handle(&ctx, &events[index]))
        .await
        .map_err(|e| EngineError::Evaluator(format!("handler worker failed: {e}")))?
}

async fn commit(ctx: &Context, sink: &Arc<dyn PersistenceSink>) -> EngineResult<usize> {
    let ctx = ctx.clone();
    let sink = Arc::clone(sink);
    tokio::task::spawn_blocking(move || ctx.changes().commit(ctx.workspace_id(), sink.as_ref()))
        .await
        .map_err(|e| EngineError::Persistence(format!("commit worker failed: {e}")))?
}
