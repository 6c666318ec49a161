//! Environment progression: gate a target on how the same version fared in
//! upstream environments of the same system.

use chrono::{DateTime, Duration, Utc};

use wsengine_core::{
    DeploymentVersion, EngineResult, Environment, EnvironmentProgressionRule, JobStatus, Policy,
    ReleaseTarget, RuleKind, RuleType, SelectorEntity,
};
use wsengine_store::Store;

use crate::evaluation::{Decision, RuleEvaluation, all_of, max_time, min_time};
use crate::evaluator::{EvalContext, Evaluator, EvaluatorScope, ScopeFields};
use crate::pipeline::policy_applies;

/// Success evidence for one version in one dependency environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencySuccesses {
    /// Release targets of the version's deployment in the environment.
    pub targets: usize,
    /// Earliest success per succeeded target, ascending.
    pub first_successes: Vec<DateTime<Utc>>,
    pub most_recent: Option<DateTime<Utc>>,
}

pub fn dependency_successes(
    store: &Store,
    environment_id: &str,
    version: &DeploymentVersion,
    success_statuses: &[JobStatus],
) -> EngineResult<DependencySuccesses> {
    let targets: Vec<ReleaseTarget> = store
        .release_targets_for_environment(environment_id)?
        .into_iter()
        .filter(|t| t.deployment_id == version.deployment_id)
        .collect();

    let mut stats = DependencySuccesses {
        targets: targets.len(),
        ..Default::default()
    };
    for target in &targets {
        let mut first: Option<DateTime<Utc>> = None;
        for release in store.releases_for_target(&target.key()) {
            if release.version.id != version.id {
                continue;
            }
            for job in store.jobs_for_release(&release.id) {
                if !success_statuses.contains(&job.status) {
                    continue;
                }
                let at = job.completion_time();
                first = min_time(first, Some(at));
                stats.most_recent = max_time(stats.most_recent, Some(at));
            }
        }
        stats.first_successes.extend(first);
    }
    stats.first_successes.sort();
    Ok(stats)
}

/// Targets that must succeed for a percentage. Unset or zero means one.
pub fn required_successes(targets: usize, percentage: Option<f64>) -> usize {
    match percentage {
        Some(pct) if pct > 0.0 => {
            let pct = pct.min(100.0);
            ((targets as f64 * pct / 100.0).ceil() as usize).max(1)
        }
        _ => 1,
    }
}

macro_rules! dependency_evaluator {
    ($name:ident, $rule_type:expr, $complexity:expr) => {
        impl Evaluator for $name {
            fn scope_fields(&self) -> ScopeFields {
                ScopeFields::VERSION
            }
            fn rule_type(&self) -> RuleType {
                $rule_type
            }
            fn rule_id(&self) -> &str {
                &self.rule_id
            }
            fn complexity(&self) -> u32 {
                $complexity
            }
            fn evaluate(
                &self,
                ctx: &EvalContext<'_>,
                scope: &EvaluatorScope<'_>,
            ) -> EngineResult<RuleEvaluation> {
                let stats = dependency_successes(
                    ctx.store,
                    &self.dependency.id,
                    scope.version,
                    &self.success_statuses,
                )?;
                Ok(self.check(&stats, ctx.now))
            }
        }
    };
}

/// Fraction of dependency targets with at least one success.
pub struct PassRateEvaluator {
    rule_id: String,
    dependency: Environment,
    minimum_success_percentage: Option<f64>,
    success_statuses: Vec<JobStatus>,
}

impl PassRateEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        dependency: Environment,
        minimum_success_percentage: Option<f64>,
        success_statuses: Vec<JobStatus>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            dependency,
            minimum_success_percentage,
            success_statuses,
        }
    }

    pub fn check(&self, stats: &DependencySuccesses, _now: DateTime<Utc>) -> RuleEvaluation {
        let env = &self.dependency.name;
        if stats.targets == 0 {
            return RuleEvaluation::denied(format!("{env}: no release targets"));
        }
        let succeeded = stats.first_successes.len();
        let required = required_successes(stats.targets, self.minimum_success_percentage);
        if succeeded >= required {
            RuleEvaluation::allowed(format!("{env}: {succeeded}/{} succeeded", stats.targets))
                .with_satisfied_at(stats.first_successes[required - 1])
                .with_detail("required", required)
                .with_detail("succeeded", succeeded)
        } else {
            RuleEvaluation::denied(format!(
                "{env}: {succeeded}/{} succeeded, {required} required",
                stats.targets
            ))
        }
    }
}

dependency_evaluator!(PassRateEvaluator, RuleType::PassRate, 5);

/// Minimum time since the most recent success.
pub struct SoakTimeEvaluator {
    rule_id: String,
    dependency: Environment,
    soak: Duration,
    success_statuses: Vec<JobStatus>,
}

impl SoakTimeEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        dependency: Environment,
        soak: Duration,
        success_statuses: Vec<JobStatus>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            dependency,
            soak,
            success_statuses,
        }
    }

    pub fn check(&self, stats: &DependencySuccesses, now: DateTime<Utc>) -> RuleEvaluation {
        let env = &self.dependency.name;
        let Some(most_recent) = stats.most_recent else {
            return RuleEvaluation::denied(format!("{env}: no successful jobs to soak"));
        };
        let ready_at = most_recent + self.soak;
        if now >= ready_at {
            RuleEvaluation::allowed(format!("{env}: soaked {} minutes", self.soak.num_minutes()))
                .with_satisfied_at(ready_at)
        } else {
            RuleEvaluation::pending(format!(
                "{env}: soaking for {} more minutes",
                (ready_at - now).num_minutes()
            ))
            .with_next_evaluation_time(ready_at)
        }
    }
}

dependency_evaluator!(SoakTimeEvaluator, RuleType::SoakTime, 5);

/// Maximum age of the most recent success.
pub struct MaxAgeEvaluator {
    rule_id: String,
    dependency: Environment,
    max_age: Duration,
    success_statuses: Vec<JobStatus>,
}

impl MaxAgeEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        dependency: Environment,
        max_age: Duration,
        success_statuses: Vec<JobStatus>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            dependency,
            max_age,
            success_statuses,
        }
    }

    pub fn check(&self, stats: &DependencySuccesses, now: DateTime<Utc>) -> RuleEvaluation {
        let env = &self.dependency.name;
        match stats.most_recent {
            Some(most_recent) if now - most_recent <= self.max_age => {
                RuleEvaluation::allowed(format!("{env}: most recent success is fresh"))
                    .with_satisfied_at(most_recent)
            }
            Some(_) => RuleEvaluation::denied(format!(
                "{env}: most recent success older than {} hours",
                self.max_age.num_hours()
            )),
            None => RuleEvaluation::denied(format!("{env}: no successful jobs")),
        }
    }
}

dependency_evaluator!(MaxAgeEvaluator, RuleType::MaxAge, 5);

pub struct EnvironmentProgressionEvaluator {
    rule_id: String,
    rule: EnvironmentProgressionRule,
}

impl EnvironmentProgressionEvaluator {
    pub fn new(rule_id: impl Into<String>, rule: EnvironmentProgressionRule) -> Self {
        Self {
            rule_id: rule_id.into(),
            rule,
        }
    }

    /// Environments in the target's system, other than its own, matching
    /// the dependency selector.
    fn dependencies(&self, store: &Store, environment: &Environment) -> EngineResult<Vec<Environment>> {
        let mut deps = Vec::new();
        for candidate in store.environments_for_system(&environment.system_id) {
            if candidate.id == environment.id {
                continue;
            }
            if store.selectors().matches(
                &self.rule.depends_on_environment_selector,
                &SelectorEntity::Environment(&candidate),
            )? {
                deps.push(candidate);
            }
        }
        Ok(deps)
    }

    fn evaluate_dependency(
        &self,
        ctx: &EvalContext<'_>,
        scope: &EvaluatorScope<'_>,
        dependency: &Environment,
    ) -> EngineResult<RuleEvaluation> {
        let statuses = self.rule.success_statuses();
        let stats = dependency_successes(ctx.store, &dependency.id, scope.version, &statuses)?;

        // One stats read serves every sub-check.
        let mut checks = vec![
            PassRateEvaluator::new(
                self.rule_id.as_str(),
                dependency.clone(),
                self.rule.minimum_success_percentage,
                statuses.clone(),
            )
            .check(&stats, ctx.now),
        ];
        if let Some(minutes) = self.rule.minimum_soak_time_minutes.filter(|m| *m > 0) {
            let soak = SoakTimeEvaluator::new(
                self.rule_id.as_str(),
                dependency.clone(),
                Duration::minutes(minutes),
                statuses.clone(),
            );
            checks.push(soak.check(&stats, ctx.now));
        }
        if let Some(hours) = self.rule.maximum_age_hours.filter(|h| *h > 0) {
            let max_age = MaxAgeEvaluator::new(
                self.rule_id.as_str(),
                dependency.clone(),
                Duration::hours(hours),
                statuses,
            );
            checks.push(max_age.check(&stats, ctx.now));
        }
        let mut combined = all_of(&checks);
        if combined.is_allowed() {
            combined.message = format!("{} satisfied", dependency.name);
        }
        Ok(combined.with_detail("environment", dependency.id.clone()))
    }
}

impl Evaluator for EnvironmentProgressionEvaluator {
    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::ENVIRONMENT | ScopeFields::VERSION
    }

    fn rule_type(&self) -> RuleType {
        RuleType::EnvironmentProgression
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u32 {
        10
    }

    fn evaluate(
        &self,
        ctx: &EvalContext<'_>,
        scope: &EvaluatorScope<'_>,
    ) -> EngineResult<RuleEvaluation> {
        let dependencies = self.dependencies(ctx.store, scope.environment)?;
        if dependencies.is_empty() {
            return Ok(RuleEvaluation::allowed("no dependency environments"));
        }

        let mut allowed: Option<RuleEvaluation> = None;
        let mut pending: Option<RuleEvaluation> = None;
        let mut denied = Vec::new();
        for dependency in &dependencies {
            let evaluation = self.evaluate_dependency(ctx, scope, dependency)?;
            match evaluation.decision() {
                Decision::Allowed => {
                    let earlier = allowed
                        .as_ref()
                        .is_none_or(|best| evaluation.satisfied_at < best.satisfied_at);
                    if earlier {
                        allowed = Some(evaluation);
                    }
                }
                Decision::Pending => {
                    let sooner = pending.as_ref().is_none_or(|best| {
                        min_time(best.next_evaluation_time, evaluation.next_evaluation_time)
                            != best.next_evaluation_time
                    });
                    if sooner {
                        pending = Some(evaluation);
                    }
                }
                Decision::Denied => denied.push(evaluation.message),
            }
        }

        if let Some(evaluation) = allowed.or(pending) {
            return Ok(evaluation);
        }
        Ok(RuleEvaluation::denied(denied.join("; ")))
    }
}

/// Enabled policies with a progression rule whose dependency selector
/// matches `environment`.
pub fn policies_depending_on(store: &Store, environment: &Environment) -> EngineResult<Vec<Policy>> {
    let mut matched = Vec::new();
    let mut policies = store.policies.values();
    policies.sort_by(|a, b| a.id.cmp(&b.id));
    for policy in policies {
        if !policy.enabled {
            continue;
        }
        let mut depends = false;
        for rule in &policy.rules {
            if let RuleKind::EnvironmentProgression(progression) = &rule.kind {
                if store.selectors().matches(
                    &progression.depends_on_environment_selector,
                    &SelectorEntity::Environment(environment),
                )? {
                    depends = true;
                    break;
                }
            }
        }
        if depends {
            matched.push(policy);
        }
    }
    Ok(matched)
}

/// Every release target a policy's selectors cover.
pub fn policy_targets(store: &Store, policy: &Policy) -> EngineResult<Vec<ReleaseTarget>> {
    let mut targets = Vec::new();
    for target in store.release_targets()? {
        if policy_applies(store, policy, &target)? {
            targets.push(target);
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testing::Fixture;
    use chrono::TimeZone;
    use wsengine_core::Selector;

    fn rule(pct: Option<f64>, soak: Option<i64>, max_age: Option<i64>) -> EnvironmentProgressionEvaluator {
        EnvironmentProgressionEvaluator::new(
            "progression",
            EnvironmentProgressionRule {
                depends_on_environment_selector: Selector::field("name", "equals", "staging"),
                minimum_success_percentage: pct,
                minimum_soak_time_minutes: soak,
                maximum_age_hours: max_age,
                success_statuses: None,
            },
        )
    }

    #[test]
    fn required_successes_rounds_up() {
        assert_eq!(required_successes(3, Some(50.0)), 2);
        assert_eq!(required_successes(3, Some(100.0)), 3);
        assert_eq!(required_successes(3, Some(0.0)), 1);
        assert_eq!(required_successes(3, None), 1);
        assert_eq!(required_successes(4, Some(10.0)), 1);
        assert_eq!(required_successes(2, Some(250.0)), 2);
    }

    #[test]
    fn sub_evaluators_stand_alone() {
        let fx = Fixture::new();
        fx.add_resource("stg-1", "staging");
        fx.add_resource("stg-2", "staging");
        fx.job("stg-1", "staging", JobStatus::Successful, fx.t0);
        let staging = fx.store.environments.get("staging").unwrap();

        let half = PassRateEvaluator::new("r", staging.clone(), Some(50.0), vec![JobStatus::Successful]);
        assert_eq!(half.rule_type(), RuleType::PassRate);
        assert!(fx.evaluate(&half).is_allowed());
        let all = PassRateEvaluator::new("r", staging.clone(), Some(100.0), vec![JobStatus::Successful]);
        assert_eq!(fx.evaluate(&all).decision(), Decision::Denied);

        let soak = SoakTimeEvaluator::new("r", staging, Duration::minutes(15), vec![JobStatus::Successful]);
        let verdict = fx.evaluate_at(&soak, fx.t0 + Duration::minutes(5));
        assert_eq!(verdict.decision(), Decision::Pending);
        assert_eq!(verdict.next_evaluation_time, Some(fx.t0 + Duration::minutes(15)));
    }

    #[test]
    fn no_dependency_environment_allows() {
        let fx = Fixture::new();
        let eval = EnvironmentProgressionEvaluator::new(
            "progression",
            EnvironmentProgressionRule {
                depends_on_environment_selector: Selector::field("name", "equals", "qa"),
                minimum_success_percentage: None,
                minimum_soak_time_minutes: None,
                maximum_age_hours: None,
                success_statuses: None,
            },
        );
        assert!(fx.evaluate(&eval).is_allowed());
    }

    #[test]
    fn dependency_without_targets_denies() {
        let fx = Fixture::new();
        assert_eq!(fx.evaluate(&rule(None, None, None)).decision(), Decision::Denied);
    }

    #[test]
    fn failed_jobs_do_not_count() {
        let fx = Fixture::new();
        fx.add_resource("stg-1", "staging");
        fx.job("stg-1", "staging", JobStatus::Failure, fx.t0);
        assert_eq!(fx.evaluate(&rule(None, None, None)).decision(), Decision::Denied);

        fx.job("stg-1", "staging", JobStatus::Successful, fx.t0 + Duration::minutes(3));
        let verdict = fx.evaluate(&rule(None, None, None));
        assert!(verdict.is_allowed());
        assert_eq!(verdict.satisfied_at, Some(fx.t0 + Duration::minutes(3)));
    }

    #[test]
    fn other_versions_do_not_count() {
        let fx = Fixture::new();
        fx.add_resource("stg-1", "staging");
        let mut other = fx.version();
        other.id = "v0".into();
        let target = ReleaseTarget::new("stg-1", "staging", "api");
        let release = wsengine_core::Release::new(target, other, Default::default(), fx.t0);
        fx.store.releases.upsert(&fx.ctx, release.clone()).unwrap();
        let job = wsengine_core::Job {
            id: "old".into(),
            release_id: release.id,
            job_agent_id: None,
            job_agent_config: serde_json::json!({}),
            status: JobStatus::Successful,
            external_id: None,
            message: None,
            created_at: fx.t0,
            updated_at: fx.t0,
            started_at: None,
            completed_at: Some(fx.t0),
        };
        fx.store.jobs.upsert(&fx.ctx, job).unwrap();
        assert_eq!(fx.evaluate(&rule(None, None, None)).decision(), Decision::Denied);
    }

    #[test]
    fn max_age_denies_stale_success() {
        let fx = Fixture::new();
        fx.add_resource("stg-1", "staging");
        fx.job("stg-1", "staging", JobStatus::Successful, fx.t0);
        let eval = rule(None, None, Some(2));
        assert!(fx.evaluate_at(&eval, fx.t0 + Duration::hours(1)).is_allowed());
        assert_eq!(
            fx.evaluate_at(&eval, fx.t0 + Duration::hours(3)).decision(),
            Decision::Denied
        );
    }

    #[test]
    fn custom_success_statuses() {
        let fx = Fixture::new();
        fx.add_resource("stg-1", "staging");
        fx.job("stg-1", "staging", JobStatus::Skipped, fx.t0);
        let eval = EnvironmentProgressionEvaluator::new(
            "progression",
            EnvironmentProgressionRule {
                depends_on_environment_selector: Selector::field("name", "equals", "staging"),
                minimum_success_percentage: Some(100.0),
                minimum_soak_time_minutes: None,
                maximum_age_hours: None,
                success_statuses: Some(vec![JobStatus::Successful, JobStatus::Skipped]),
            },
        );
        assert!(fx.evaluate(&eval).is_allowed());
    }

    #[test]
    fn or_across_dependency_environments() {
        let fx = Fixture::new();
        fx.store
            .environments
            .upsert(
                &fx.ctx,
                Environment {
                    id: "qa".into(),
                    system_id: "s1".into(),
                    name: "qa".into(),
                    description: None,
                    resource_selector: Some(Selector::metadata_equals("env", "qa")),
                    created_at: fx.t0,
                },
            )
            .unwrap();
        fx.add_resource("stg-1", "staging");
        fx.add_resource("qa-1", "qa");
        fx.job("qa-1", "qa", JobStatus::Successful, fx.t0);

        let eval = EnvironmentProgressionEvaluator::new(
            "progression",
            EnvironmentProgressionRule {
                depends_on_environment_selector: Selector::field("name", "not-equals", "prod"),
                minimum_success_percentage: Some(100.0),
                minimum_soak_time_minutes: None,
                maximum_age_hours: None,
                success_statuses: None,
            },
        );
        let verdict = fx.evaluate(&eval);
        assert!(verdict.is_allowed());
        assert_eq!(verdict.details["environment"], "qa");
    }

    #[test]
    fn dependents_and_policy_targets() {
        let fx = Fixture::new();
        let policy: Policy = serde_json::from_value(serde_json::json!({
            "id": "p1",
            "workspaceId": "ws",
            "name": "prod gate",
            "selectors": [{"environmentSelector": {"json": {"type": "name", "operator": "equals", "value": "prod"}}}],
            "rules": [{
                "id": "rule-1",
                "policyId": "p1",
                "environmentProgression": {
                    "dependsOnEnvironmentSelector": {"json": {"type": "name", "operator": "equals", "value": "staging"}}
                }
            }],
            "createdAt": Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }))
        .unwrap();
        fx.store.policies.upsert(&fx.ctx, policy.clone()).unwrap();

        let staging = fx.store.environments.get("staging").unwrap();
        let prod = fx.store.environments.get("prod").unwrap();
        assert_eq!(policies_depending_on(&fx.store, &staging).unwrap().len(), 1);
        assert!(policies_depending_on(&fx.store, &prod).unwrap().is_empty());

        let targets = policy_targets(&fx.store, &policy).unwrap();
        assert_eq!(targets, vec![ReleaseTarget::new("r1", "prod", "api")]);
    }
}
