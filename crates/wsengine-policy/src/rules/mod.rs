//! Rule evaluators and the factory mapping a policy rule onto one.

pub mod approval;
pub mod progression;

#[cfg(test)]
pub(crate) mod testing;

use wsengine_core::{PolicyRule, RuleKind};

use crate::evaluator::Evaluator;

pub use approval::{AnyApprovalEvaluator, UserApprovalEvaluator};
pub use progression::{
    EnvironmentProgressionEvaluator, MaxAgeEvaluator, PassRateEvaluator, SoakTimeEvaluator,
};

pub fn evaluator_for(rule: &PolicyRule) -> Box<dyn Evaluator> {
    match &rule.kind {
        RuleKind::AnyApproval(r) => Box::new(AnyApprovalEvaluator::new(&rule.id, r.min_approvals)),
        RuleKind::UserApproval(r) => Box::new(UserApprovalEvaluator::new(&rule.id, &r.user_id)),
        RuleKind::EnvironmentProgression(r) => {
            Box::new(EnvironmentProgressionEvaluator::new(&rule.id, r.clone()))
        }
    }
}
