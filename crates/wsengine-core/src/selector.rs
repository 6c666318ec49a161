//! Selector union and the `SelectorEngine` match contract.
//!
//! The engine core treats selector evaluation as a black box: every caller
//! goes through [`SelectorEngine::matches`]. [`ConditionSelectorEngine`] is
//! the built-in, deterministic implementation for JSON condition trees;
//! CEL expressions need an external engine plugged in behind the same trait.

use std::collections::HashMap;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::types::{Deployment, DeploymentVersion, Environment, Resource};

/// A selector over resources, environments, deployments or versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Selector {
    /// JSON condition tree, e.g.
    /// `{"type": "metadata", "key": "env", "operator": "equals", "value": "prod"}`.
    Json(Value),
    /// Common Expression Language source.
    Cel(String),
    /// Logical combination of nested selectors.
    Comparison(ComparisonSelector),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonSelector {
    pub operator: LogicalOperator,
    #[serde(default)]
    pub not: bool,
    pub conditions: Vec<Selector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    And,
    Or,
}

impl Selector {
    pub fn from_json(condition: Value) -> Self {
        Selector::Json(condition)
    }

    pub fn from_cel(expression: impl Into<String>) -> Self {
        Selector::Cel(expression.into())
    }

    pub fn comparison(operator: LogicalOperator, conditions: Vec<Selector>) -> Self {
        Selector::Comparison(ComparisonSelector {
            operator,
            not: false,
            conditions,
        })
    }

    /// Shorthand for a single JSON field condition.
    pub fn field(kind: &str, operator: &str, value: &str) -> Self {
        Selector::Json(serde_json::json!({
            "type": kind,
            "operator": operator,
            "value": value,
        }))
    }

    /// Shorthand for a metadata equality condition.
    pub fn metadata_equals(key: &str, value: &str) -> Self {
        Selector::Json(serde_json::json!({
            "type": "metadata",
            "key": key,
            "operator": "equals",
            "value": value,
        }))
    }
}

/// An entity a selector can be evaluated against.
#[derive(Debug, Clone, Copy)]
pub enum SelectorEntity<'a> {
    Resource(&'a Resource),
    Environment(&'a Environment),
    Deployment(&'a Deployment),
    Version(&'a DeploymentVersion),
}

impl SelectorEntity<'_> {
    pub fn to_json(&self) -> EngineResult<Value> {
        let value = match self {
            SelectorEntity::Resource(r) => serde_json::to_value(r),
            SelectorEntity::Environment(e) => serde_json::to_value(e),
            SelectorEntity::Deployment(d) => serde_json::to_value(d),
            SelectorEntity::Version(v) => serde_json::to_value(v),
        };
        value.map_err(|e| EngineError::Evaluator(format!("entity serialization: {e}")))
    }
}

/// The match contract. Implementations must be deterministic and free of
/// side effects.
pub trait SelectorEngine: Send + Sync {
    fn matches(&self, selector: &Selector, entity: &SelectorEntity<'_>) -> EngineResult<bool>;

    /// `None` selectors match everything.
    fn matches_opt(
        &self,
        selector: Option<&Selector>,
        entity: &SelectorEntity<'_>,
    ) -> EngineResult<bool> {
        match selector {
            Some(selector) => self.matches(selector, entity),
            None => Ok(true),
        }
    }
}

/// Built-in engine for JSON condition trees.
#[derive(Default)]
pub struct ConditionSelectorEngine {
    regex_cache: Mutex<HashMap<String, Regex>>,
}

impl ConditionSelectorEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn eval_selector(&self, selector: &Selector, doc: &Value) -> EngineResult<bool> {
        match selector {
            Selector::Json(condition) => self.eval_condition(condition, doc),
            Selector::Cel(_) => Err(EngineError::Evaluator(
                "cel selectors require an external selector engine".to_string(),
            )),
            Selector::Comparison(cmp) => {
                let mut outcome = match cmp.operator {
                    LogicalOperator::And => true,
                    LogicalOperator::Or => false,
                };
                for nested in &cmp.conditions {
                    let matched = self.eval_selector(nested, doc)?;
                    match cmp.operator {
                        LogicalOperator::And if !matched => {
                            outcome = false;
                            break;
                        }
                        LogicalOperator::Or if matched => {
                            outcome = true;
                            break;
                        }
                        _ => {}
                    }
                }
                Ok(outcome != cmp.not)
            }
        }
    }

    fn eval_condition(&self, condition: &Value, doc: &Value) -> EngineResult<bool> {
        let kind = condition
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Evaluator("condition without a type".to_string()))?;
        let operator = condition
            .get("operator")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Evaluator(format!("{kind} condition without operator")))?;

        if kind == "comparison" {
            let conditions = condition
                .get("conditions")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let negate = condition.get("not").and_then(Value::as_bool).unwrap_or(false);
            let matched = match operator {
                "and" => {
                    let mut all = true;
                    for nested in conditions {
                        if !self.eval_condition(nested, doc)? {
                            all = false;
                            break;
                        }
                    }
                    all
                }
                "or" => {
                    let mut any = false;
                    for nested in conditions {
                        if self.eval_condition(nested, doc)? {
                            any = true;
                            break;
                        }
                    }
                    any
                }
                other => {
                    return Err(EngineError::Evaluator(format!(
                        "unknown comparison operator {other}"
                    )));
                }
            };
            return Ok(matched != negate);
        }

        let actual = match kind {
            "metadata" => {
                let key = condition.get("key").and_then(Value::as_str).ok_or_else(|| {
                    EngineError::Evaluator("metadata condition without key".to_string())
                })?;
                doc.get("metadata").and_then(|m| m.get(key))
            }
            other => field_path(other).and_then(|field| doc.get(field)),
        };

        if operator == "exists" {
            return Ok(actual.is_some_and(|v| !v.is_null()));
        }

        let expected = condition.get("value").and_then(Value::as_str).ok_or_else(|| {
            EngineError::Evaluator(format!("{kind} condition without string value"))
        })?;
        let Some(actual) = actual.and_then(as_text) else {
            // Absent fields only satisfy negative comparisons.
            return Ok(operator == "not-equals");
        };

        match operator {
            "equals" => Ok(actual == expected),
            "not-equals" => Ok(actual != expected),
            "contains" => Ok(actual.contains(expected)),
            "starts-with" => Ok(actual.starts_with(expected)),
            "ends-with" => Ok(actual.ends_with(expected)),
            "regex" => self.regex_matches(expected, &actual),
            other => Err(EngineError::Evaluator(format!("unknown operator {other}"))),
        }
    }

    fn regex_matches(&self, pattern: &str, text: &str) -> EngineResult<bool> {
        let mut cache = self.regex_cache.lock();
        if let Some(re) = cache.get(pattern) {
            return Ok(re.is_match(text));
        }
        let re = Regex::new(pattern)
            .map_err(|e| EngineError::Evaluator(format!("invalid regex {pattern}: {e}")))?;
        let matched = re.is_match(text);
        cache.insert(pattern.to_string(), re);
        Ok(matched)
    }
}

impl SelectorEngine for ConditionSelectorEngine {
    fn matches(&self, selector: &Selector, entity: &SelectorEntity<'_>) -> EngineResult<bool> {
        let doc = entity.to_json()?;
        self.eval_selector(selector, &doc)
    }
}

/// Map a condition type onto the camelCase JSON field it reads.
fn field_path(kind: &str) -> Option<&'static str> {
    match kind {
        "id" => Some("id"),
        "name" => Some("name"),
        "kind" => Some("kind"),
        "identifier" => Some("identifier"),
        "version" => Some("version"),
        "tag" => Some("tag"),
        "status" => Some("status"),
        "slug" => Some("slug"),
        "systemId" | "system-id" => Some("systemId"),
        "deploymentId" | "deployment-id" => Some("deploymentId"),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
