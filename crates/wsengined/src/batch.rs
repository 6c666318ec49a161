//! Newline-delimited batch intake.
//!
//! Each non-blank line is one batch: a JSON array of raw events, or a
//! single event object. `workspaceId` and `timestamp` may be omitted and
//! default to the daemon's workspace and the receive time.

use std::path::Path;

use anyhow::{Context, bail};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use wsengine_events::{RawEvent, group_events};

pub fn parse_line(line: &str, workspace_id: &str) -> anyhow::Result<Option<Vec<RawEvent>>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(line)?;
    let items = match value {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => bail!("expected an event or an array of events, got {other}"),
    };

    let now = Utc::now();
    let mut events = Vec::with_capacity(items.len());
    for (index, mut item) in items.into_iter().enumerate() {
        let Some(fields) = item.as_object_mut() else {
            bail!("event {index} is not an object");
        };
        fields
            .entry("workspaceId")
            .or_insert_with(|| Value::String(workspace_id.to_string()));
        fields
            .entry("timestamp")
            .or_insert_with(|| Value::String(now.to_rfc3339()));
        let event: RawEvent =
            serde_json::from_value(item).with_context(|| format!("event {index}"))?;
        events.push(event);
    }
    Ok(Some(events))
}

/// Every batch in a file, with its 1-based line number.
pub fn read_file(path: &Path, workspace_id: &str) -> anyhow::Result<Vec<(usize, Vec<RawEvent>)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut batches = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let parsed = parse_line(line, workspace_id)
            .with_context(|| format!("{}:{}", path.display(), n + 1))?;
        if let Some(events) = parsed {
            batches.push((n + 1, events));
        }
    }
    Ok(batches)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedEvent {
    pub index: usize,
    pub event_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPlan {
    pub line: usize,
    pub groups: Vec<Vec<PlannedEvent>>,
}

/// The conflict groups a batch would execute as.
pub fn plan(line: usize, events: &[RawEvent]) -> BatchPlan {
    let groups = group_events(events)
        .into_iter()
        .map(|group| {
            group
                .indices
                .into_iter()
                .map(|index| PlannedEvent {
                    index,
                    event_type: events[index].event_type.to_string(),
                })
                .collect()
        })
        .collect();
    BatchPlan { line, groups }
}
