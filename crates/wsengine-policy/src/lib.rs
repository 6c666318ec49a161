//! wsengine-policy — reduces a target's policies to one verdict per version.
//!
//! # Pipeline
//!
//! ```text
//! policies  = enabled policies whose target selectors match the release target
//! for policy in policies:
//!     for rule in policy.rules (cheapest first):
//!         if a policy skip covers (rule, version, target): allowed
//!         else: memoized evaluator verdict
//!     policy = denied  if any rule denied
//!              pending if any rule pending (next = min of hints)
//!              allowed otherwise
//! verdict = same reduction across policies
//! ```
//!
//! Environment progression ORs across dependency environments; within one
//! dependency environment the pass-rate, soak-time and max-age checks AND.

pub mod evaluation;
pub mod evaluator;
pub mod pipeline;
pub mod rules;

pub use evaluation::{Decision, RuleEvaluation};
pub use evaluator::{EvalContext, Evaluator, EvaluatorScope, MemoizedEvaluator, ScopeFields};
pub use pipeline::{PolicyPipeline, PolicyVerdict, RuleResult, Verdict};
pub use rules::progression::{policies_depending_on, policy_targets};
