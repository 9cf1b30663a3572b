//! Query planning: turns a [`Condition`] plus a catalog of available indexes into an executable
//! [`PlanNode`] tree, under structural, enumeration, and wall-clock budgets.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::IndexDescriptor;
use crate::query::condition::{Condition, Operator};
use crate::query::in_predicate::{select_strategy, InPredicateConfig, InPredicateStrategy};

const TABLE_SCAN_WEIGHT: u64 = 100;
const INDEX_SCAN_WEIGHT: u64 = 10;
const FILTER_WEIGHT: u64 = 1;
const SORT_WEIGHT: u64 = 10;

/// Budgets and feature toggles governing plan enumeration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// The maximum structural complexity a selected plan may have.
    pub complexity_threshold: u64,
    /// The maximum number of candidate plans considered before giving up.
    pub max_plan_enumerations: u64,
    /// The maximum number of rewrite rules (index intersection, union, `IN` rewrites) applied
    /// before giving up.
    pub max_rule_applications: u64,
    /// The wall-clock budget for the whole planning pass.
    pub timeout_seconds: u64,
    pub enable_cost_based_optimization: bool,
    pub enable_plan_caching: bool,
    pub enable_index_intersection: bool,
    pub enable_index_union: bool,
    pub enable_in_predicate_optimization: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            complexity_threshold: 1_000,
            max_plan_enumerations: 64,
            max_rule_applications: 64,
            timeout_seconds: 5,
            enable_cost_based_optimization: true,
            enable_plan_caching: true,
            enable_index_intersection: true,
            enable_index_union: true,
            enable_in_predicate_optimization: true,
        }
    }
}

impl PlannerConfig {
    /// Favors correctness and predictability over plan quality: no intersection/union
    /// combination, no `IN` rewriting, a tight enumeration budget.
    pub fn conservative() -> Self {
        Self {
            complexity_threshold: 500,
            max_plan_enumerations: 16,
            max_rule_applications: 8,
            timeout_seconds: 2,
            enable_cost_based_optimization: true,
            enable_plan_caching: false,
            enable_index_intersection: false,
            enable_index_union: false,
            enable_in_predicate_optimization: false,
        }
    }

    /// Wide enumeration, every rewrite rule enabled, generous budgets.
    pub fn aggressive() -> Self {
        Self {
            complexity_threshold: 5_000,
            max_plan_enumerations: 256,
            max_rule_applications: 256,
            timeout_seconds: 15,
            enable_cost_based_optimization: true,
            enable_plan_caching: true,
            enable_index_intersection: true,
            enable_index_union: true,
            enable_in_predicate_optimization: true,
        }
    }

    /// No rewrite rules at all: every query plans to a table scan plus filter.
    pub fn minimal() -> Self {
        Self {
            complexity_threshold: 1_000,
            max_plan_enumerations: 4,
            max_rule_applications: 0,
            timeout_seconds: 5,
            enable_cost_based_optimization: false,
            enable_plan_caching: false,
            enable_index_intersection: false,
            enable_index_union: false,
            enable_in_predicate_optimization: false,
        }
    }
}

/// A node in a query execution plan.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    /// A full scan of the record type's primary subspace.
    TableScan,
    /// A scan of one named index.
    IndexScan { index_name: String },
    /// The intersection of several child scans' primary keys.
    Intersection(Vec<PlanNode>),
    /// The union of several child scans' primary keys.
    Union(Vec<PlanNode>),
    /// Re-checks `condition` against each row produced by `input`.
    Filter {
        input: Box<PlanNode>,
        condition: Condition,
    },
    /// Orders `input`'s output by `fields`.
    Sort { input: Box<PlanNode>, fields: Vec<String> },
}

impl PlanNode {
    fn complexity(&self) -> u64 {
        match self {
            PlanNode::TableScan => TABLE_SCAN_WEIGHT,
            PlanNode::IndexScan { .. } => INDEX_SCAN_WEIGHT,
            PlanNode::Intersection(children) | PlanNode::Union(children) => {
                children.iter().map(PlanNode::complexity).sum()
            }
            PlanNode::Filter { input, .. } => FILTER_WEIGHT + input.complexity(),
            PlanNode::Sort { input, .. } => SORT_WEIGHT + input.complexity(),
        }
    }

    fn operator_count(&self) -> usize {
        match self {
            PlanNode::TableScan | PlanNode::IndexScan { .. } => 1,
            PlanNode::Intersection(children) | PlanNode::Union(children) => {
                1 + children.iter().map(PlanNode::operator_count).sum::<usize>()
            }
            PlanNode::Filter { input, .. } | PlanNode::Sort { input, .. } => {
                1 + input.operator_count()
            }
        }
    }
}

/// A selected plan, with its precomputed cost metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub root: PlanNode,
    pub complexity: u64,
    pub operator_count: usize,
    /// `{root:?}`, used as the final tie-breaker between equally cheap plans with the same
    /// operator count.
    pub description: String,
}

impl Plan {
    fn new(root: PlanNode) -> Self {
        let complexity = root.complexity();
        let operator_count = root.operator_count();
        let description = format!("{:?}", root);
        Self {
            root,
            complexity,
            operator_count,
            description,
        }
    }
}

/// Looks up which index (if any) covers a scalar field by direct equality/range lookup, the only
/// shape the planner currently turns into an index scan.
pub fn indexed_field_names(indexes: &[IndexDescriptor]) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();
    for index in indexes {
        if let crate::index::FieldExpr::Field(name) = &index.root_expression {
            map.insert(name.clone(), index.name.clone());
        }
    }
    map
}

struct Budget {
    config: PlannerConfig,
    deadline: Instant,
    enumerations: u64,
    rule_applications: u64,
}

impl Budget {
    fn check_timeout(&self) -> Result<()> {
        if Instant::now() >= self.deadline {
            return Err(Error::PlanningTimeoutExceeded {
                timeout_seconds: self.config.timeout_seconds,
            });
        }
        Ok(())
    }

    fn count_enumeration(&mut self) -> Result<()> {
        self.enumerations += 1;
        if self.enumerations > self.config.max_plan_enumerations {
            return Err(Error::PlanEnumerationsExceeded {
                count: self.enumerations,
                limit: self.config.max_plan_enumerations,
            });
        }
        Ok(())
    }

    fn count_rule_application(&mut self) -> Result<()> {
        self.rule_applications += 1;
        if self.rule_applications > self.config.max_rule_applications {
            return Err(Error::RuleApplicationsExceeded {
                count: self.rule_applications,
                limit: self.config.max_rule_applications,
            });
        }
        Ok(())
    }
}

/// Enumerates candidate plans for `condition` and returns the cheapest one within budget.
///
/// `indexed_fields` maps a scalar field name to the index that scans it directly, as produced by
/// [`indexed_field_names`]. `order_by`, if given, is satisfied with an explicit sort unless the
/// chosen scan is a single-field index scan already ordered by `order_by[0]`.
pub fn plan(
    condition: &Condition,
    indexed_fields: &std::collections::HashMap<String, String>,
    order_by: Option<&[String]>,
    config: &PlannerConfig,
) -> Result<Plan> {
    let mut budget = Budget {
        config: config.clone(),
        deadline: Instant::now() + Duration::from_secs(config.timeout_seconds.max(1)),
        enumerations: 0,
        rule_applications: 0,
    };

    let scans = base_scans(condition, indexed_fields, order_by, config, &mut budget)?;
    let mut candidates = Vec::new();
    for scan in scans {
        budget.check_timeout()?;
        budget.count_enumeration()?;
        let with_filter = match condition {
            Condition::AlwaysTrue => scan,
            _ => PlanNode::Filter {
                input: Box::new(scan),
                condition: condition.clone(),
            },
        };
        let final_node = match order_by {
            Some(fields) if !fields.is_empty() && !already_ordered(&with_filter, &fields[0], indexed_fields) => {
                PlanNode::Sort {
                    input: Box::new(with_filter),
                    fields: fields.to_vec(),
                }
            }
            _ => with_filter,
        };
        candidates.push(Plan::new(final_node));
    }

    select_cheapest(candidates, config)
}

/// Whether `node` already produces rows ordered by `field`, so an explicit [`PlanNode::Sort`]
/// would be redundant. A `Filter` wrapping an ordered scan preserves its input's order, so this
/// looks through filters to the underlying scan.
fn already_ordered(node: &PlanNode, field: &str, indexed_fields: &std::collections::HashMap<String, String>) -> bool {
    match node {
        PlanNode::IndexScan { index_name } => indexed_fields.get(field) == Some(index_name),
        PlanNode::Filter { input, .. } => already_ordered(input, field, indexed_fields),
        _ => false,
    }
}

fn select_cheapest(candidates: Vec<Plan>, config: &PlannerConfig) -> Result<Plan> {
    let mut best: Option<Plan> = None;
    let mut cheapest_seen = u64::MAX;
    for candidate in candidates {
        cheapest_seen = cheapest_seen.min(candidate.complexity);
        if candidate.complexity > config.complexity_threshold {
            continue;
        }
        best = Some(match best {
            None => candidate,
            Some(current) => {
                if is_better(&candidate, &current) {
                    candidate
                } else {
                    current
                }
            }
        });
    }
    best.ok_or(Error::PlanComplexityExceeded {
        actual: cheapest_seen,
        threshold: config.complexity_threshold,
    })
}

fn is_better(a: &Plan, b: &Plan) -> bool {
    (a.complexity, a.operator_count, &a.description) < (b.complexity, b.operator_count, &b.description)
}

/// The maximum number of indexed conjunction children considered for subset intersection.
/// Beyond this, the `2^n` subset space itself becomes the bottleneck rather than the budgets it
/// feeds; extra children past this bound still contribute to the residual filter, just not to
/// the intersection candidate set.
const MAX_INTERSECTION_CHILDREN: usize = 20;

fn base_scans(
    condition: &Condition,
    indexed_fields: &std::collections::HashMap<String, String>,
    order_by: Option<&[String]>,
    config: &PlannerConfig,
    budget: &mut Budget,
) -> Result<Vec<PlanNode>> {
    let mut scans = vec![PlanNode::TableScan];

    match condition {
        Condition::Field(field) => {
            if field.operator == Operator::In && config.enable_in_predicate_optimization {
                let strategy = select_strategy(
                    field,
                    &InPredicateConfig::default(),
                    &indexed_fields.keys().cloned().collect(),
                );
                if let InPredicateStrategy::IndexUnion { field: name, values } = strategy {
                    budget.check_timeout()?;
                    budget.count_rule_application()?;
                    if let Some(index_name) = indexed_fields.get(&name) {
                        let scans_per_value = values
                            .iter()
                            .map(|_| PlanNode::IndexScan {
                                index_name: index_name.clone(),
                            })
                            .collect();
                        scans.push(PlanNode::Union(scans_per_value));
                    }
                }
            } else if let Some(index_name) = indexed_fields.get(&field.field) {
                scans.push(PlanNode::IndexScan {
                    index_name: index_name.clone(),
                });
            }
        }
        Condition::Conjunction(children) if config.enable_index_intersection => {
            let indexed_children: Vec<PlanNode> = children
                .iter()
                .filter_map(|child| match child {
                    Condition::Field(f) => indexed_fields.get(&f.field).map(|name| PlanNode::IndexScan {
                        index_name: name.clone(),
                    }),
                    _ => None,
                })
                .collect();
            // Every subset of two or more indexed children is its own intersection candidate, at
            // its own cost, not just the intersection of all of them: a conjunction over fields
            // a/b/c can be served by a∩b plus a residual filter on c, by a∩b∩c, or by any other
            // combination, and these are not equivalent in cost once the index stats differ.
            let n = indexed_children.len().min(MAX_INTERSECTION_CHILDREN);
            if n >= 2 {
                for mask in 1u32..(1u32 << n) {
                    if mask.count_ones() < 2 {
                        continue;
                    }
                    budget.check_timeout()?;
                    budget.count_rule_application()?;
                    let subset = (0..n)
                        .filter(|i| mask & (1 << i) != 0)
                        .map(|i| indexed_children[i].clone())
                        .collect();
                    scans.push(PlanNode::Intersection(subset));
                }
            }
        }
        Condition::Disjunction(children) if config.enable_index_union => {
            let indexed_children: Option<Vec<PlanNode>> = children
                .iter()
                .map(|child| match child {
                    Condition::Field(f) => {
                        indexed_fields.get(&f.field).map(|name| PlanNode::IndexScan {
                            index_name: name.clone(),
                        })
                    }
                    _ => None,
                })
                .collect();
            if let Some(scans_per_child) = indexed_children {
                if scans_per_child.len() == children.len() && !scans_per_child.is_empty() {
                    budget.check_timeout()?;
                    budget.count_rule_application()?;
                    scans.push(PlanNode::Union(scans_per_child));
                }
            }
        }
        _ => {}
    }

    // Sort-placement variant: if an index already produces rows ordered by the requested sort
    // field, scanning it avoids an explicit `Sort` node downstream, at the cost of taking on the
    // whole original condition as a residual filter instead of sharing work with the scans above.
    if let Some(index_name) = order_by.and_then(|fields| fields.first()).and_then(|f| indexed_fields.get(f)) {
        let ordered_scan = PlanNode::IndexScan {
            index_name: index_name.clone(),
        };
        if !scans.contains(&ordered_scan) {
            scans.push(ordered_scan);
        }
    }

    Ok(scans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::query::condition::ScalarFieldCondition;
    use std::collections::HashMap;

    fn indexed(fields: &[&str]) -> HashMap<String, String> {
        fields.iter().map(|f| (f.to_string(), format!("by_{}", f))).collect()
    }

    #[test]
    fn prefers_index_scan_over_table_scan_when_available() {
        let condition = Condition::eq("status", "open");
        let config = PlannerConfig::default();
        let plan = plan(&condition, &indexed(&["status"]), None, &config).unwrap();
        assert!(matches!(
            plan.root,
            PlanNode::Filter { ref input, .. } if matches!(**input, PlanNode::IndexScan { .. })
        ));
        assert_eq!(plan.complexity, INDEX_SCAN_WEIGHT + FILTER_WEIGHT);
    }

    #[test]
    fn falls_back_to_table_scan_without_an_index() {
        let condition = Condition::eq("status", "open");
        let config = PlannerConfig::default();
        let plan = plan(&condition, &HashMap::new(), None, &config).unwrap();
        assert_eq!(plan.complexity, TABLE_SCAN_WEIGHT + FILTER_WEIGHT);
    }

    #[test]
    fn complexity_threshold_below_any_candidate_fails() {
        let condition = Condition::eq("status", "open");
        let mut config = PlannerConfig::default();
        config.complexity_threshold = 5;
        let err = plan(&condition, &HashMap::new(), None, &config).unwrap_err();
        assert!(matches!(err, Error::PlanComplexityExceeded { .. }));
    }

    #[test]
    fn conjunction_of_two_indexed_fields_intersects() {
        let condition = Condition::and(vec![
            Condition::eq("status", "open"),
            Condition::eq("owner", "alice"),
        ]);
        let config = PlannerConfig::default();
        let plan = plan(&condition, &indexed(&["status", "owner"]), None, &config).unwrap();
        let has_intersection = matches!(
            plan.root,
            PlanNode::Filter { ref input, .. } if matches!(**input, PlanNode::Intersection(_))
        );
        assert!(has_intersection);
    }

    #[test]
    fn enumeration_budget_is_enforced() {
        let condition = Condition::and(vec![
            Condition::eq("a", "1"),
            Condition::eq("b", "2"),
            Condition::eq("c", "3"),
        ]);
        let mut config = PlannerConfig::default();
        config.max_plan_enumerations = 1;
        let err = plan(&condition, &indexed(&["a", "b", "c"]), None, &config).unwrap_err();
        assert!(matches!(err, Error::PlanEnumerationsExceeded { limit: 1, .. }));
    }

    #[test]
    fn sort_is_added_when_scan_does_not_already_satisfy_order() {
        let condition = Condition::AlwaysTrue;
        let config = PlannerConfig::default();
        let plan = plan(&condition, &HashMap::new(), Some(&["created_at".to_string()]), &config).unwrap();
        assert!(matches!(plan.root, PlanNode::Sort { .. }));
    }

    #[test]
    fn presets_have_distinct_feature_toggles() {
        assert!(!PlannerConfig::minimal().enable_index_intersection);
        assert!(PlannerConfig::aggressive().enable_index_union);
        assert!(!PlannerConfig::conservative().enable_in_predicate_optimization);
    }

    #[test]
    fn in_predicate_rewrites_to_union_of_index_scans() {
        let condition = Condition::in_values(
            "status",
            vec![Value::Str("open".into()), Value::Str("closed".into())],
        );
        let config = PlannerConfig::default();
        let plan = plan(&condition, &indexed(&["status"]), None, &config).unwrap();
        let has_union = matches!(
            plan.root,
            PlanNode::Filter { ref input, .. } if matches!(**input, PlanNode::Union(_))
        );
        assert!(has_union);
    }

    #[test]
    fn unreferenced_scalar_condition_helper_compiles() {
        let _ = ScalarFieldCondition::new("x", Operator::Eq, vec![Value::Int(1)]);
    }
}
