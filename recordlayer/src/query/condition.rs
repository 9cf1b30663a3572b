//! The query condition model: a recursive sum type describing a filter predicate, independent of
//! any particular query execution strategy.

use crate::codec::Value;

/// A scalar comparison operator usable in a [`ScalarFieldCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Between,
    StartsWith,
    IsNull,
}

/// A single-field comparison: `field <operator> comparand(s)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarFieldCondition {
    pub field: String,
    pub operator: Operator,
    /// The comparand(s): one value for `Eq`/`Neq`/`Lt`/`Le`/`Gt`/`Ge`/`StartsWith`, a list for
    /// `In`, exactly two (low, high) for `Between`, and empty for `IsNull`.
    pub comparands: Vec<Value>,
}

impl ScalarFieldCondition {
    pub fn new(field: impl Into<String>, operator: Operator, comparands: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            comparands,
        }
    }
}

/// A recursive filter expression over a record's fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    AlwaysTrue,
    AlwaysFalse,
    Field(ScalarFieldCondition),
    Conjunction(Vec<Condition>),
    Disjunction(Vec<Condition>),
    Negation(Box<Condition>),
}

impl Condition {
    /// A convenience constructor for an equality condition, the common case.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Field(ScalarFieldCondition::new(field, Operator::Eq, vec![value.into()]))
    }

    /// A convenience constructor for an `IN` condition.
    pub fn in_values(field: impl Into<String>, values: Vec<Value>) -> Self {
        Condition::Field(ScalarFieldCondition::new(field, Operator::In, values))
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::Conjunction(conditions)
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Disjunction(conditions)
    }

    pub fn not(condition: Condition) -> Self {
        Condition::Negation(Box::new(condition))
    }

    /// `true` if this condition, or any descendant, is an `IN` predicate.
    pub fn contains_in_predicate(&self) -> bool {
        match self {
            Condition::AlwaysTrue | Condition::AlwaysFalse => false,
            Condition::Field(field) => field.operator == Operator::In,
            Condition::Conjunction(children) | Condition::Disjunction(children) => {
                children.iter().any(Condition::contains_in_predicate)
            }
            Condition::Negation(child) => child.contains_in_predicate(),
        }
    }

    /// The total number of `IN` predicates anywhere in this condition tree.
    pub fn in_predicate_count(&self) -> usize {
        match self {
            Condition::AlwaysTrue | Condition::AlwaysFalse => 0,
            Condition::Field(field) => usize::from(field.operator == Operator::In),
            Condition::Conjunction(children) | Condition::Disjunction(children) => {
                children.iter().map(Condition::in_predicate_count).sum()
            }
            Condition::Negation(child) => child.in_predicate_count(),
        }
    }

    /// Evaluates this condition against a decoded record's fields. Used by the executor's
    /// filter-over-scan plan step and by tests; the planner never calls this directly.
    pub fn evaluate(&self, fields: &[(String, Value)]) -> bool {
        match self {
            Condition::AlwaysTrue => true,
            Condition::AlwaysFalse => false,
            Condition::Field(field) => evaluate_scalar(field, fields),
            Condition::Conjunction(children) => children.iter().all(|c| c.evaluate(fields)),
            Condition::Disjunction(children) => children.iter().any(|c| c.evaluate(fields)),
            Condition::Negation(child) => !child.evaluate(fields),
        }
    }
}

fn evaluate_scalar(condition: &ScalarFieldCondition, fields: &[(String, Value)]) -> bool {
    let actual = fields.iter().find(|(name, _)| name == &condition.field).map(|(_, v)| v);
    match condition.operator {
        Operator::IsNull => matches!(actual, None | Some(Value::Null)),
        Operator::Eq => actual == condition.comparands.first(),
        Operator::Neq => actual != condition.comparands.first(),
        Operator::Lt => actual.zip(condition.comparands.first()).map_or(false, |(a, b)| a < b),
        Operator::Le => actual.zip(condition.comparands.first()).map_or(false, |(a, b)| a <= b),
        Operator::Gt => actual.zip(condition.comparands.first()).map_or(false, |(a, b)| a > b),
        Operator::Ge => actual.zip(condition.comparands.first()).map_or(false, |(a, b)| a >= b),
        Operator::StartsWith => match (actual, condition.comparands.first()) {
            (Some(Value::Str(s)), Some(Value::Str(prefix))) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        Operator::In => actual.map_or(false, |a| condition.comparands.contains(a)),
        Operator::Between => match (actual, condition.comparands.as_slice()) {
            (Some(a), [low, high]) => a >= low && a <= high,
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_predicate_count_recurses_through_conjunctions() {
        let condition = Condition::and(vec![
            Condition::in_values("status", vec![Value::Str("open".into()), Value::Str("closed".into())]),
            Condition::eq("owner", "alice"),
            Condition::or(vec![Condition::in_values("tag", vec![Value::Str("x".into())])]),
        ]);
        assert!(condition.contains_in_predicate());
        assert_eq!(condition.in_predicate_count(), 2);
    }

    #[test]
    fn evaluate_matches_conjunction_of_scalars() {
        let condition = Condition::and(vec![
            Condition::eq("status", "open"),
            Condition::Field(ScalarFieldCondition::new(
                "priority",
                Operator::Ge,
                vec![Value::Int(3)],
            )),
        ]);
        let fields = vec![
            ("status".to_string(), Value::Str("open".into())),
            ("priority".to_string(), Value::Int(5)),
        ];
        assert!(condition.evaluate(&fields));
        let low_priority = vec![
            ("status".to_string(), Value::Str("open".into())),
            ("priority".to_string(), Value::Int(1)),
        ];
        assert!(!condition.evaluate(&low_priority));
    }

    #[test]
    fn is_null_matches_absent_and_explicit_null() {
        let condition = Condition::Field(ScalarFieldCondition::new("deleted_at", Operator::IsNull, vec![]));
        assert!(condition.evaluate(&[]));
        assert!(condition.evaluate(&[("deleted_at".to_string(), Value::Null)]));
        assert!(!condition.evaluate(&[("deleted_at".to_string(), Value::Int(1))]));
    }
}
