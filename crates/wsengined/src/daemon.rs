//! The `run` loop: stdin intake, the tick loop and a single dispatch task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wsengine_core::EngineConfig;
use wsengine_events::{EventType, RawEvent, Workspace};

use crate::batch::parse_line;

enum Stop {
    EndOfInput,
    Signal,
}

pub async fn run(workspace: Arc<Workspace>, config: &EngineConfig) -> anyhow::Result<()> {
    let workspace_id = workspace.workspace_id().to_string();
    info!(%workspace_id, "workspace engine running");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (batch_tx, mut batch_rx) = mpsc::channel::<Vec<RawEvent>>(64);

    // ── Background tasks ───────────────────────────────────────

    let mut intake = tokio::spawn(read_batches(
        BufReader::new(tokio::io::stdin()),
        workspace_id.clone(),
        batch_tx.clone(),
    ));

    let tick_interval = Duration::from_secs(config.engine.tick_interval_secs.max(1));
    let ticker = tokio::spawn(tick_loop(
        tick_interval,
        workspace_id,
        batch_tx,
        shutdown_rx,
    ));

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal.cancel();
        }
    });

    // ── Dispatch loop ──────────────────────────────────────────

    let stop = loop {
        tokio::select! {
            Some(events) = batch_rx.recv() => dispatch(&workspace, events, &cancel).await,
            _ = &mut intake => break Stop::EndOfInput,
            _ = cancel.cancelled() => break Stop::Signal,
        }
    };

    let _ = shutdown_tx.send(true);
    batch_rx.close();
    if let Stop::EndOfInput = stop {
        info!("input closed, draining queued batches");
        while let Some(events) = batch_rx.recv().await {
            dispatch(&workspace, events, &cancel).await;
        }
    } else {
        intake.abort();
    }
    let _ = ticker.await;

    info!("workspace engine stopped");
    Ok(())
}

async fn dispatch(workspace: &Workspace, events: Vec<RawEvent>, cancel: &CancellationToken) {
    let count = events.len();
    if let Err(e) = workspace.dispatch_with_cancel(events, cancel).await {
        error!(events = count, error = %e, code = e.code(), "batch failed");
    }
}

/// Forward every parsed line as a batch. Returns the number of batches
/// read when the input ends.
async fn read_batches<R>(reader: R, workspace_id: String, tx: mpsc::Sender<Vec<RawEvent>>) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut batches = 0;
    let mut line_no = 0usize;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "reading input failed");
                break;
            }
        };
        line_no += 1;
        match parse_line(&line, &workspace_id) {
            Ok(Some(events)) => {
                if tx.send(events).await.is_err() {
                    break;
                }
                batches += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(line = line_no, error = %e, "malformed batch skipped"),
        }
    }
    batches
}

async fn tick_loop(
    interval: Duration,
    workspace_id: String,
    tx: mpsc::Sender<Vec<RawEvent>>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "tick loop started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let tick = RawEvent::new(EventType::WorkspaceTick, workspace_id.as_str(), json!({}));
                if tx.send(vec![tick]).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                info!("tick loop shutting down");
                break;
            }
        }
    }
}
