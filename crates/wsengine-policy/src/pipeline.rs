//! Policy composition for one (release target, version) pair.

use serde::Serialize;
use tracing::debug;

use wsengine_core::{
    Deployment, DeploymentVersion, EngineError, EngineResult, EntityKind, Environment, Policy,
    PolicySkip, PolicyTargetSelector, ReleaseTarget, Resource, RuleType, SelectorEngine,
    SelectorEntity,
};
use wsengine_store::Store;

use crate::evaluation::{Decision, RuleEvaluation, all_of};
use crate::evaluator::{EvalContext, Evaluator, EvaluatorScope, MemoizedEvaluator};
use crate::rules::evaluator_for;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResult {
    pub rule_id: String,
    pub rule_type: RuleType,
    /// A policy skip bypassed this rule.
    pub skipped: bool,
    pub evaluation: RuleEvaluation,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyVerdict {
    pub policy_id: String,
    pub policy_name: String,
    pub evaluation: RuleEvaluation,
    pub rules: Vec<RuleResult>,
}

impl PolicyVerdict {
    pub fn decision(&self) -> Decision {
        self.evaluation.decision()
    }
}

/// The combined verdict of every policy governing a target.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub evaluation: RuleEvaluation,
    pub policies: Vec<PolicyVerdict>,
}

impl Verdict {
    pub fn decision(&self) -> Decision {
        self.evaluation.decision()
    }

    pub fn is_allowed(&self) -> bool {
        self.evaluation.is_allowed()
    }
}

struct PreparedPolicy {
    policy: Policy,
    evaluators: Vec<MemoizedEvaluator>,
}

/// Evaluators for every enabled policy, memoized for one pass. Prepare a
/// fresh pipeline whenever policies or their inputs may have changed.
pub struct PolicyPipeline {
    policies: Vec<PreparedPolicy>,
}

impl PolicyPipeline {
    pub fn prepare(store: &Store) -> Self {
        let mut policies: Vec<Policy> = store
            .policies
            .values()
            .into_iter()
            .filter(|p| p.enabled)
            .collect();
        policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        let policies = policies
            .into_iter()
            .map(|policy| {
                let mut evaluators: Vec<MemoizedEvaluator> = policy
                    .rules
                    .iter()
                    .map(|rule| MemoizedEvaluator::new(evaluator_for(rule)))
                    .collect();
                evaluators.sort_by_key(|e| e.complexity());
                PreparedPolicy { policy, evaluators }
            })
            .collect();
        Self { policies }
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn evaluate(
        &self,
        ctx: &EvalContext<'_>,
        target: &ReleaseTarget,
        version: &DeploymentVersion,
    ) -> EngineResult<Verdict> {
        let store = ctx.store;
        let environment = store
            .environments
            .get(&target.environment_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Environment, &target.environment_id))?;
        let resource = store
            .resource(&target.resource_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Resource, &target.resource_id))?;
        let deployment = store
            .deployments
            .get(&target.deployment_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Deployment, &target.deployment_id))?;

        let scope = EvaluatorScope {
            release_target: target,
            environment: &environment,
            resource: &resource,
            deployment: &deployment,
            version,
        };
        let skips = store.skips_for_version(&version.id);

        let mut verdicts = Vec::new();
        for prepared in &self.policies {
            let applies = policy_matches(
                store.selectors(),
                &prepared.policy,
                &environment,
                &resource,
                &deployment,
            )?;
            if !applies {
                continue;
            }
            verdicts.push(self.evaluate_policy(ctx, prepared, &scope, &skips)?);
        }

        let evaluation = all_of(verdicts.iter().map(|v| &v.evaluation));
        debug!(
            release_target = %target,
            version = %version.id,
            policies = verdicts.len(),
            decision = ?evaluation.decision(),
            "policies evaluated"
        );
        Ok(Verdict {
            evaluation,
            policies: verdicts,
        })
    }

    fn evaluate_policy(
        &self,
        ctx: &EvalContext<'_>,
        prepared: &PreparedPolicy,
        scope: &EvaluatorScope<'_>,
        skips: &[PolicySkip],
    ) -> EngineResult<PolicyVerdict> {
        let mut rules = Vec::with_capacity(prepared.evaluators.len());
        for evaluator in &prepared.evaluators {
            let skip = skips.iter().find(|s| {
                s.applies_to(evaluator.rule_id(), &scope.version.id, scope.release_target, ctx.now)
            });
            let (skipped, evaluation) = match skip {
                Some(skip) => (
                    true,
                    RuleEvaluation::allowed(format!("skipped: {}", skip.reason))
                        .with_detail("skipId", skip.id.clone()),
                ),
                None => (false, evaluator.evaluate(ctx, scope)?),
            };
            rules.push(RuleResult {
                rule_id: evaluator.rule_id().to_string(),
                rule_type: evaluator.rule_type(),
                skipped,
                evaluation,
            });
        }
        let mut evaluation = all_of(rules.iter().map(|r| &r.evaluation));
        if evaluation.is_allowed() && rules.is_empty() {
            evaluation.message = "no rules".to_string();
        }
        Ok(PolicyVerdict {
            policy_id: prepared.policy.id.clone(),
            policy_name: prepared.policy.name.clone(),
            evaluation,
            rules,
        })
    }
}

fn entry_matches(
    selectors: &dyn SelectorEngine,
    entry: &PolicyTargetSelector,
    environment: &Environment,
    resource: &Resource,
    deployment: &Deployment,
) -> EngineResult<bool> {
    Ok(selectors.matches_opt(
        entry.environment_selector.as_ref(),
        &SelectorEntity::Environment(environment),
    )? && selectors.matches_opt(
        entry.deployment_selector.as_ref(),
        &SelectorEntity::Deployment(deployment),
    )? && selectors.matches_opt(
        entry.resource_selector.as_ref(),
        &SelectorEntity::Resource(resource),
    )?)
}

/// A policy governs a target when any of its selector entries matches.
/// A policy without entries governs nothing.
fn policy_matches(
    selectors: &dyn SelectorEngine,
    policy: &Policy,
    environment: &Environment,
    resource: &Resource,
    deployment: &Deployment,
) -> EngineResult<bool> {
    for entry in &policy.selectors {
        if entry_matches(selectors, entry, environment, resource, deployment)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether `policy` governs `target`. Targets whose entities are missing
/// are not governed.
pub fn policy_applies(store: &Store, policy: &Policy, target: &ReleaseTarget) -> EngineResult<bool> {
    let (Some(environment), Some(resource), Some(deployment)) = (
        store.environments.get(&target.environment_id),
        store.resource(&target.resource_id),
        store.deployments.get(&target.deployment_id),
    ) else {
        return Ok(false);
    };
    policy_matches(store.selectors(), policy, &environment, &resource, &deployment)
}
