//! Approval rules.

use std::collections::BTreeMap;

use wsengine_core::{ApprovalStatus, EngineResult, RuleType, UserApprovalRecord};

use crate::evaluation::RuleEvaluation;
use crate::evaluator::{EvalContext, Evaluator, EvaluatorScope, ScopeFields};

/// Requires `min_approvals` distinct approvers for the (version,
/// environment) pair. Rejections neither count nor veto.
pub struct AnyApprovalEvaluator {
    rule_id: String,
    min_approvals: u32,
}

impl AnyApprovalEvaluator {
    pub fn new(rule_id: impl Into<String>, min_approvals: u32) -> Self {
        Self {
            rule_id: rule_id.into(),
            min_approvals,
        }
    }
}

impl Evaluator for AnyApprovalEvaluator {
    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::ENVIRONMENT | ScopeFields::VERSION
    }

    fn rule_type(&self) -> RuleType {
        RuleType::AnyApproval
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u32 {
        1
    }

    fn evaluate(
        &self,
        ctx: &EvalContext<'_>,
        scope: &EvaluatorScope<'_>,
    ) -> EngineResult<RuleEvaluation> {
        let required = self.min_approvals as usize;
        if required == 0 {
            return Ok(RuleEvaluation::allowed("no approvals required"));
        }

        // Earliest approval per user.
        let mut by_user: BTreeMap<String, UserApprovalRecord> = BTreeMap::new();
        for record in ctx.store.approvals_for(&scope.version.id, &scope.environment.id) {
            if record.status != ApprovalStatus::Approved {
                continue;
            }
            let keep = by_user
                .get(&record.user_id)
                .is_none_or(|existing| record.created_at < existing.created_at);
            if keep {
                by_user.insert(record.user_id.clone(), record);
            }
        }
        let mut approvals: Vec<UserApprovalRecord> = by_user.into_values().collect();
        approvals.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let approvers: Vec<&str> = approvals.iter().map(|a| a.user_id.as_str()).collect();
        if approvals.len() >= required {
            return Ok(
                RuleEvaluation::allowed(format!("{} of {required} approvals", approvals.len()))
                    .with_satisfied_at(approvals[required - 1].created_at)
                    .with_detail("approvers", approvers),
            );
        }
        Ok(RuleEvaluation::pending(format!(
            "waiting for approvals: {} of {required}",
            approvals.len()
        ))
        .with_detail("approvers", approvers))
    }
}

/// Requires an approval from one specific user. A rejection by that user
/// denies.
pub struct UserApprovalEvaluator {
    rule_id: String,
    user_id: String,
}

impl UserApprovalEvaluator {
    pub fn new(rule_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl Evaluator for UserApprovalEvaluator {
    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::ENVIRONMENT | ScopeFields::VERSION
    }

    fn rule_type(&self) -> RuleType {
        RuleType::UserApproval
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u32 {
        1
    }

    fn evaluate(
        &self,
        ctx: &EvalContext<'_>,
        scope: &EvaluatorScope<'_>,
    ) -> EngineResult<RuleEvaluation> {
        let record = ctx
            .store
            .approvals_for(&scope.version.id, &scope.environment.id)
            .into_iter()
            .find(|r| r.user_id == self.user_id);
        Ok(match record {
            Some(r) if r.status == ApprovalStatus::Approved => {
                RuleEvaluation::allowed(format!("approved by {}", self.user_id))
                    .with_satisfied_at(r.created_at)
            }
            Some(r) => {
                let reason = r.reason.unwrap_or_default();
                RuleEvaluation::denied(format!("rejected by {}", self.user_id))
                    .with_detail("reason", reason)
            }
            None => RuleEvaluation::pending(format!("waiting for approval from {}", self.user_id)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::Decision;
    use crate::rules::testing::Fixture;
    use chrono::Duration;

    #[test]
    fn any_approval_counts_distinct_approvers() {
        let fx = Fixture::new();
        let eval = AnyApprovalEvaluator::new("rule", 2);

        fx.approve("alice", ApprovalStatus::Approved, 0);
        fx.approve("bob", ApprovalStatus::Rejected, 1);
        let verdict = fx.evaluate(&eval);
        assert_eq!(verdict.decision(), Decision::Pending);

        fx.approve("carol", ApprovalStatus::Approved, 5);
        let verdict = fx.evaluate(&eval);
        assert!(verdict.is_allowed());
        assert_eq!(verdict.satisfied_at, Some(fx.t0 + Duration::minutes(5)));
    }

    #[test]
    fn zero_required_is_allowed() {
        let fx = Fixture::new();
        assert!(fx.evaluate(&AnyApprovalEvaluator::new("rule", 0)).is_allowed());
    }

    #[test]
    fn user_approval_states() {
        let fx = Fixture::new();
        let eval = UserApprovalEvaluator::new("rule", "alice");
        assert_eq!(fx.evaluate(&eval).decision(), Decision::Pending);

        fx.approve("alice", ApprovalStatus::Rejected, 0);
        assert_eq!(fx.evaluate(&eval).decision(), Decision::Denied);

        fx.approve("alice", ApprovalStatus::Approved, 2);
        let verdict = fx.evaluate(&eval);
        assert!(verdict.is_allowed());
        assert_eq!(verdict.satisfied_at, Some(fx.t0 + Duration::minutes(2)));
    }
}
