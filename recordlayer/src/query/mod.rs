//! Query condition modeling, `IN`-predicate strategy selection, cost-based planning, and plan
//! execution.

pub mod condition;
pub mod executor;
pub mod in_predicate;
pub mod planner;

pub use condition::{Condition, Operator, ScalarFieldCondition};
pub use executor::{execute, ExecutionOptions, QueryResults};
pub use in_predicate::{plan_in_predicates, select_strategy, InPredicateConfig, InPredicatePlan, InPredicateStrategy};
pub use planner::{indexed_field_names, plan, Plan, PlanNode, PlannerConfig};
