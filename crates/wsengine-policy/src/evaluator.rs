//! The evaluator capability and the per-pass memoizer.

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use wsengine_core::{
    Deployment, DeploymentVersion, EngineResult, Environment, ReleaseTarget, Resource, RuleType,
};
use wsengine_store::Store;

use crate::evaluation::RuleEvaluation;

/// Which parts of an [`EvaluatorScope`] an evaluator reads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScopeFields(u8);

impl ScopeFields {
    pub const ENVIRONMENT: ScopeFields = ScopeFields(1);
    pub const VERSION: ScopeFields = ScopeFields(1 << 1);
    pub const RELEASE_TARGET: ScopeFields = ScopeFields(1 << 2);
    pub const RESOURCE: ScopeFields = ScopeFields(1 << 3);
    pub const DEPLOYMENT: ScopeFields = ScopeFields(1 << 4);

    pub fn contains(self, other: ScopeFields) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ScopeFields {
    type Output = ScopeFields;

    fn bitor(self, rhs: ScopeFields) -> ScopeFields {
        ScopeFields(self.0 | rhs.0)
    }
}

impl fmt::Debug for ScopeFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::ENVIRONMENT, "Environment"),
            (Self::VERSION, "Version"),
            (Self::RELEASE_TARGET, "ReleaseTarget"),
            (Self::RESOURCE, "Resource"),
            (Self::DEPLOYMENT, "Deployment"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(field, _)| self.contains(*field))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "ScopeFields({})", set.join("|"))
    }
}

/// Everything one rule evaluation can look at.
#[derive(Debug, Clone, Copy)]
pub struct EvaluatorScope<'a> {
    pub release_target: &'a ReleaseTarget,
    pub environment: &'a Environment,
    pub resource: &'a Resource,
    pub deployment: &'a Deployment,
    pub version: &'a DeploymentVersion,
}

impl EvaluatorScope<'_> {
    /// Memoization key restricted to `fields`.
    pub fn key(&self, fields: ScopeFields) -> String {
        let mut parts = Vec::with_capacity(5);
        if fields.contains(ScopeFields::ENVIRONMENT) {
            parts.push(format!("env={}", self.environment.id));
        }
        if fields.contains(ScopeFields::VERSION) {
            parts.push(format!("version={}", self.version.id));
        }
        if fields.contains(ScopeFields::RELEASE_TARGET) {
            parts.push(format!("target={}", self.release_target.key()));
        }
        if fields.contains(ScopeFields::RESOURCE) {
            parts.push(format!("resource={}", self.resource.id));
        }
        if fields.contains(ScopeFields::DEPLOYMENT) {
            parts.push(format!("deployment={}", self.deployment.id));
        }
        parts.join(",")
    }
}

/// Read-only inputs shared by every evaluation in a pass.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub store: &'a Store,
    pub now: DateTime<Utc>,
}

impl<'a> EvalContext<'a> {
    pub fn new(store: &'a Store, now: DateTime<Utc>) -> Self {
        Self { store, now }
    }
}

pub trait Evaluator: Send + Sync {
    fn scope_fields(&self) -> ScopeFields;

    fn rule_type(&self) -> RuleType;

    fn rule_id(&self) -> &str;

    /// Relative cost; cheaper evaluators run first.
    fn complexity(&self) -> u32;

    fn evaluate(
        &self,
        ctx: &EvalContext<'_>,
        scope: &EvaluatorScope<'_>,
    ) -> EngineResult<RuleEvaluation>;
}

/// Caches verdicts keyed by the wrapped evaluator's scope fields. Lives for
/// one reconciliation pass.
pub struct MemoizedEvaluator {
    inner: Box<dyn Evaluator>,
    cache: Mutex<HashMap<String, RuleEvaluation>>,
}

impl MemoizedEvaluator {
    pub fn new(inner: Box<dyn Evaluator>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Evaluator for MemoizedEvaluator {
    fn scope_fields(&self) -> ScopeFields {
        self.inner.scope_fields()
    }

    fn rule_type(&self) -> RuleType {
        self.inner.rule_type()
    }

    fn rule_id(&self) -> &str {
        self.inner.rule_id()
    }

    fn complexity(&self) -> u32 {
        self.inner.complexity()
    }

    fn evaluate(
        &self,
        ctx: &EvalContext<'_>,
        scope: &EvaluatorScope<'_>,
    ) -> EngineResult<RuleEvaluation> {
        let key = scope.key(self.inner.scope_fields());
        if let Some(hit) = self.cache.lock().get(&key) {
            return Ok(hit.clone());
        }
        // Errors are not cached.
        let evaluation = self.inner.evaluate(ctx, scope)?;
        self.cache.lock().insert(key, evaluation.clone());
        Ok(evaluation)
    }
}
