//! At most one variable value snapshot exists per (workspace, key, value)
//! after any sequence of release writes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;

use wsengine_core::{DeploymentVersion, EntityKind, LiteralValue, Release, ReleaseTarget};
use wsengine_persist::RedbSink;
use wsengine_store::{Change, ChangeOp};

fn release(version: u8, vars: &BTreeMap<String, i64>) -> Release {
    let version = DeploymentVersion {
        id: format!("v{version}"),
        deployment_id: "api".into(),
        name: format!("v{version}"),
        tag: format!("v{version}"),
        status: Default::default(),
        config: json!({}),
        job_agent_config: json!({}),
        created_at: Utc::now(),
        message: None,
    };
    let variables = vars
        .iter()
        .map(|(k, v)| (k.clone(), LiteralValue::Integer(*v)))
        .collect();
    Release::new(ReleaseTarget::new("r1", "prod", "api"), version, variables, Utc::now())
}

fn vars() -> impl Strategy<Value = BTreeMap<String, i64>> {
    proptest::collection::btree_map(
        prop_oneof![Just("replicas".to_string()), Just("port".to_string())],
        0i64..3,
        0..3,
    )
}

proptest! {
    #[test]
    fn snapshots_are_unique(batches in proptest::collection::vec(
        proptest::collection::vec((0u8..3, vars()), 1..4),
        1..5,
    )) {
        let sink = RedbSink::open_in_memory().unwrap();
        let mut written: BTreeSet<(String, i64)> = BTreeSet::new();

        for batch in &batches {
            let changes: Vec<Change> = batch
                .iter()
                .map(|(version, vars)| {
                    written.extend(vars.iter().map(|(k, v)| (k.clone(), *v)));
                    let release = release(*version, vars);
                    Change {
                        kind: EntityKind::Release,
                        id: release.id.clone(),
                        op: ChangeOp::Insert,
                        payload: Some(serde_json::to_value(&release).unwrap()),
                    }
                })
                .collect();
            sink.write_changes("ws", &changes).unwrap();
        }

        let snapshots = sink.variable_value_snapshots("ws").unwrap();
        let distinct: BTreeSet<(String, String)> = snapshots
            .iter()
            .map(|s| (s.key.clone(), s.value.canonical()))
            .collect();
        prop_assert_eq!(distinct.len(), snapshots.len());
        prop_assert_eq!(snapshots.len(), written.len());
    }
}
