//! Release targets, releases, and content-addressed release identity.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::DeploymentVersion;

/// A resolved variable value. Integers are tried before floats so that
/// `3` stays an integer through a serialize/deserialize cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiteralValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Object(serde_json::Map<String, serde_json::Value>),
}

impl LiteralValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            LiteralValue::Bool(b) => serde_json::Value::Bool(*b),
            LiteralValue::Integer(i) => serde_json::Value::from(*i),
            LiteralValue::Number(n) => serde_json::Value::from(*n),
            LiteralValue::String(s) => serde_json::Value::String(s.clone()),
            LiteralValue::Object(map) => serde_json::Value::Object(map.clone()),
        }
    }

    /// Convert an arbitrary JSON value; `null` and arrays have no literal form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(LiteralValue::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(LiteralValue::Integer(i)),
                None => n.as_f64().map(LiteralValue::Number),
            },
            serde_json::Value::String(s) => Some(LiteralValue::String(s.clone())),
            serde_json::Value::Object(map) => Some(LiteralValue::Object(map.clone())),
            serde_json::Value::Null | serde_json::Value::Array(_) => None,
        }
    }

    /// Canonical JSON text (object keys sorted).
    pub fn canonical(&self) -> String {
        self.to_json().to_string()
    }
}

impl From<&str> for LiteralValue {
    fn from(value: &str) -> Self {
        LiteralValue::String(value.to_string())
    }
}

impl From<i64> for LiteralValue {
    fn from(value: i64) -> Self {
        LiteralValue::Integer(value)
    }
}

impl From<bool> for LiteralValue {
    fn from(value: bool) -> Self {
        LiteralValue::Bool(value)
    }
}

/// One place a deployment can be delivered: `(resource, environment, deployment)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTarget {
    pub resource_id: String,
    pub environment_id: String,
    pub deployment_id: String,
}

impl ReleaseTarget {
    pub fn new(
        resource_id: impl Into<String>,
        environment_id: impl Into<String>,
        deployment_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            environment_id: environment_id.into(),
            deployment_id: deployment_id.into(),
        }
    }

    /// Natural key `{resource}-{environment}-{deployment}`.
    pub fn key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.resource_id, self.environment_id, self.deployment_id
        )
    }
}

impl fmt::Display for ReleaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// An immutable materialization of a version plus resolved variables for
/// one release target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub id: String,
    pub release_target: ReleaseTarget,
    pub version: DeploymentVersion,
    #[serde(default)]
    pub variables: BTreeMap<String, LiteralValue>,
    pub created_at: DateTime<Utc>,
}

impl Release {
    /// Build a release whose id is derived from its content.
    pub fn new(
        release_target: ReleaseTarget,
        version: DeploymentVersion,
        variables: BTreeMap<String, LiteralValue>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let id = release_id(&release_target, &version.id, &variables);
        Self {
            id,
            release_target,
            version,
            variables,
            created_at,
        }
    }

    /// Digest of the version part alone (`version_release_id` in the
    /// persistent layout).
    pub fn version_release_id(&self) -> String {
        digest_parts(&[self.release_target.key().as_bytes(), self.version.id.as_bytes()])
    }

    /// Digest of the variables part alone (`variable_release_id`).
    pub fn variable_release_id(&self) -> String {
        digest_parts(&[
            self.release_target.key().as_bytes(),
            canonical_variables(&self.variables).as_bytes(),
        ])
    }
}

/// Deterministic release id: SHA-256 over the target key, the version id
/// and the key-sorted variables map, hex encoded.
pub fn release_id(
    target: &ReleaseTarget,
    version_id: &str,
    variables: &BTreeMap<String, LiteralValue>,
) -> String {
    digest_parts(&[
        target.key().as_bytes(),
        version_id.as_bytes(),
        canonical_variables(variables).as_bytes(),
    ])
}

fn canonical_variables(variables: &BTreeMap<String, LiteralValue>) -> String {
    let mut out = String::from("{");
    for (i, (key, value)) in variables.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::Value::String(key.clone()).to_string());
        out.push(':');
        out.push_str(&value.canonical());
    }
    out.push('}');
    out
}

fn digest_parts(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        // Length prefix keeps ("ab","c") and ("a","bc") apart.
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}
