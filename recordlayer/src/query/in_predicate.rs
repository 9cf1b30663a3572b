//! Strategy selection for `IN` predicates.
//!
//! A condition tree can carry any number of `field IN (v1, v2, ...)` predicates. Each one is
//! independently rewritten into whichever of four strategies the planner can execute most
//! cheaply, given which fields have an index and how many values are in the list.

use std::collections::HashSet;

use crate::codec::Value;
use crate::query::condition::{Condition, Operator, ScalarFieldCondition};

/// Thresholds governing which strategy an `IN` predicate is rewritten into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InPredicateConfig {
    /// Above this value count, an indexed field no longer gets a per-value point lookup; below
    /// or at it, [`InPredicateStrategy::IndexUnion`] applies.
    pub union_threshold: usize,
    /// Above this value count (and without an index), the predicate is left unoptimized rather
    /// than joined against a full scan.
    pub join_threshold: usize,
    /// The minimum estimated selectivity gain an indexed union must offer over a full scan before
    /// it is worth the extra point lookups; reserved for the planner's cost model once table and
    /// index statistics are tracked.
    pub min_selectivity_improvement: f64,
}

impl Default for InPredicateConfig {
    fn default() -> Self {
        Self {
            union_threshold: 20,
            join_threshold: 200,
            min_selectivity_improvement: 0.1,
        }
    }
}

/// How one `IN` predicate will be executed.
#[derive(Debug, Clone, PartialEq)]
pub enum InPredicateStrategy {
    /// Not an `IN` predicate, or no rewrite applies: evaluate as written.
    NoOptimization,
    /// `field` has an index and the value list is small: issue one point lookup per value and
    /// union the results.
    IndexUnion { field: String, values: Vec<Value> },
    /// No index on `field`, but the value list is large enough that a streaming join against a
    /// full scan beats re-evaluating membership per row with `contains`.
    InJoin { field: String, values: Vec<Value> },
    /// No index, and the value list is small enough that `field IN (v1, v2, ...)` is simply
    /// rewritten as `field = v1 OR field = v2 OR ...`.
    OrExpansion { field: String, values: Vec<Value> },
}

/// Picks a strategy for a single scalar `IN` condition. Returns
/// [`InPredicateStrategy::NoOptimization`] if `condition.operator` is not [`Operator::In`].
pub fn select_strategy(
    condition: &ScalarFieldCondition,
    config: &InPredicateConfig,
    indexed_fields: &HashSet<String>,
) -> InPredicateStrategy {
    if condition.operator != Operator::In {
        return InPredicateStrategy::NoOptimization;
    }
    let field = condition.field.clone();
    let values = condition.comparands.clone();
    let has_index = indexed_fields.contains(&field);

    if has_index && values.len() <= config.union_threshold {
        InPredicateStrategy::IndexUnion { field, values }
    } else if !has_index && values.len() <= config.union_threshold {
        InPredicateStrategy::OrExpansion { field, values }
    } else if !has_index && values.len() <= config.join_threshold {
        InPredicateStrategy::InJoin { field, values }
    } else {
        InPredicateStrategy::NoOptimization
    }
}

/// One `IN` predicate found in a condition tree, paired with its chosen strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct InPredicatePlan {
    pub condition: ScalarFieldCondition,
    pub strategy: InPredicateStrategy,
}

/// Walks `condition` and returns a strategy decision for every `IN` predicate found, in tree
/// order. A condition with no `IN` predicates yields an empty list.
pub fn plan_in_predicates(
    condition: &Condition,
    config: &InPredicateConfig,
    indexed_fields: &HashSet<String>,
) -> Vec<InPredicatePlan> {
    let mut plans = Vec::new();
    collect(condition, config, indexed_fields, &mut plans);
    plans
}

fn collect(
    condition: &Condition,
    config: &InPredicateConfig,
    indexed_fields: &HashSet<String>,
    out: &mut Vec<InPredicatePlan>,
) {
    match condition {
        Condition::AlwaysTrue | Condition::AlwaysFalse => {}
        Condition::Field(field) => {
            if field.operator == Operator::In {
                let strategy = select_strategy(field, config, indexed_fields);
                out.push(InPredicatePlan {
                    condition: field.clone(),
                    strategy,
                });
            }
        }
        Condition::Conjunction(children) | Condition::Disjunction(children) => {
            for child in children {
                collect(child, config, indexed_fields, out);
            }
        }
        Condition::Negation(child) => collect(child, config, indexed_fields, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(strs: &[&str]) -> Vec<Value> {
        strs.iter().map(|s| Value::Str((*s).into())).collect()
    }

    #[test]
    fn indexed_small_list_uses_index_union() {
        let config = InPredicateConfig::default();
        let indexed: HashSet<String> = vec!["status".to_string()].into_iter().collect();
        let condition = ScalarFieldCondition::new("status", Operator::In, values(&["open", "closed"]));
        assert_eq!(
            select_strategy(&condition, &config, &indexed),
            InPredicateStrategy::IndexUnion {
                field: "status".into(),
                values: values(&["open", "closed"]),
            }
        );
    }

    #[test]
    fn unindexed_small_list_expands_to_or() {
        let config = InPredicateConfig::default();
        let indexed = HashSet::new();
        let condition = ScalarFieldCondition::new("status", Operator::In, values(&["open", "closed"]));
        assert_eq!(
            select_strategy(&condition, &config, &indexed),
            InPredicateStrategy::OrExpansion {
                field: "status".into(),
                values: values(&["open", "closed"]),
            }
        );
    }

    #[test]
    fn unindexed_large_list_uses_in_join() {
        let config = InPredicateConfig {
            union_threshold: 2,
            join_threshold: 50,
            min_selectivity_improvement: 0.1,
        };
        let indexed = HashSet::new();
        let many: Vec<Value> = (0..10).map(Value::Int).collect();
        let condition = ScalarFieldCondition::new("id", Operator::In, many.clone());
        assert_eq!(
            select_strategy(&condition, &config, &indexed),
            InPredicateStrategy::InJoin {
                field: "id".into(),
                values: many,
            }
        );
    }

    #[test]
    fn list_beyond_join_threshold_is_left_unoptimized() {
        let config = InPredicateConfig {
            union_threshold: 2,
            join_threshold: 5,
            min_selectivity_improvement: 0.1,
        };
        let indexed = HashSet::new();
        let many: Vec<Value> = (0..10).map(Value::Int).collect();
        let condition = ScalarFieldCondition::new("id", Operator::In, many);
        assert_eq!(select_strategy(&condition, &config, &indexed), InPredicateStrategy::NoOptimization);
    }

    #[test]
    fn non_in_condition_is_never_optimized() {
        let config = InPredicateConfig::default();
        let indexed: HashSet<String> = vec!["status".to_string()].into_iter().collect();
        let condition = ScalarFieldCondition::new("status", Operator::Eq, values(&["open"]));
        assert_eq!(select_strategy(&condition, &config, &indexed), InPredicateStrategy::NoOptimization);
    }

    #[test]
    fn plan_in_predicates_finds_nested_predicates_only() {
        let config = InPredicateConfig::default();
        let indexed: HashSet<String> = vec!["status".to_string()].into_iter().collect();
        let condition = Condition::and(vec![
            Condition::in_values("status", values(&["open", "closed"])),
            Condition::eq("owner", "alice"),
            Condition::not(Condition::in_values("tag", values(&["x", "y"]))),
        ]);
        let plans = plan_in_predicates(&condition, &config, &indexed);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].condition.field, "status");
        assert!(matches!(plans[0].strategy, InPredicateStrategy::IndexUnion { .. }));
        assert_eq!(plans[1].condition.field, "tag");
        assert!(matches!(plans[1].strategy, InPredicateStrategy::OrExpansion { .. }));
    }
}
