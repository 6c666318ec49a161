//! Rule verdicts and their reduction.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    /// Waiting on time or external input.
    Pending,
    /// Will not change without an input event.
    Denied,
}

/// The verdict of one rule for one (release target, version) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEvaluation {
    pub allowed: bool,
    pub action_required: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satisfied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_evaluation_time: Option<DateTime<Utc>>,
}

impl RuleEvaluation {
    fn new(allowed: bool, action_required: bool, message: impl Into<String>) -> Self {
        Self {
            allowed,
            action_required,
            message: message.into(),
            details: BTreeMap::new(),
            satisfied_at: None,
            next_evaluation_time: None,
        }
    }

    pub fn allowed(message: impl Into<String>) -> Self {
        Self::new(true, false, message)
    }

    pub fn pending(message: impl Into<String>) -> Self {
        Self::new(false, true, message)
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(false, false, message)
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_satisfied_at(mut self, at: DateTime<Utc>) -> Self {
        self.satisfied_at = Some(at);
        self
    }

    pub fn with_next_evaluation_time(mut self, at: DateTime<Utc>) -> Self {
        self.next_evaluation_time = Some(at);
        self
    }

    pub fn decision(&self) -> Decision {
        match (self.allowed, self.action_required) {
            (true, _) => Decision::Allowed,
            (false, true) => Decision::Pending,
            (false, false) => Decision::Denied,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// AND-reduction: any denial denies, otherwise any pending pends with the
/// earliest hint, otherwise allowed at the latest satisfaction instant.
pub fn all_of<'a>(evaluations: impl IntoIterator<Item = &'a RuleEvaluation>) -> RuleEvaluation {
    let mut denied = Vec::new();
    let mut pending = Vec::new();
    let mut next: Option<DateTime<Utc>> = None;
    let mut satisfied: Option<DateTime<Utc>> = None;

    for evaluation in evaluations {
        match evaluation.decision() {
            Decision::Denied => denied.push(evaluation.message.clone()),
            Decision::Pending => {
                pending.push(evaluation.message.clone());
                next = min_time(next, evaluation.next_evaluation_time);
            }
            Decision::Allowed => {
                satisfied = max_time(satisfied, evaluation.satisfied_at);
            }
        }
    }

    if !denied.is_empty() {
        return RuleEvaluation::denied(denied.join("; "));
    }
    if !pending.is_empty() {
        let mut result = RuleEvaluation::pending(pending.join("; "));
        result.next_evaluation_time = next;
        return result;
    }
    let mut result = RuleEvaluation::allowed("all checks passed");
    result.satisfied_at = satisfied;
    result
}

pub(crate) fn min_time(
    a: Option<DateTime<Utc>>,
    b: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

pub(crate) fn max_time(
    a: Option<DateTime<Utc>>,
    b: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
