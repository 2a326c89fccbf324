//! Filter and sort evaluation over the JSON form of a stored document.
//!
//! Comparison semantics follow the usual document-store conventions: numbers
//! compare numerically regardless of integer/float representation, equality
//! against an array field matches when any element matches, and values of
//! different types never satisfy a range comparison.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use super::{Direction, SortKey};

/// A single field predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
}

impl Comparison {
    /// Operator name in its `$`-prefixed textual form.
    pub fn operator(&self) -> &'static str {
        match self {
            Comparison::Eq(_) => "$eq",
            Comparison::Ne(_) => "$ne",
            Comparison::Gt(_) => "$gt",
            Comparison::Gte(_) => "$gte",
            Comparison::Lt(_) => "$lt",
            Comparison::Lte(_) => "$lte",
            Comparison::In(_) => "$in",
            Comparison::Nin(_) => "$nin",
            Comparison::Exists(_) => "$exists",
        }
    }

    fn matches(&self, field: Option<&Value>) -> bool {
        match self {
            Comparison::Eq(expected) => field_equals(field, expected),
            Comparison::Ne(expected) => !field_equals(field, expected),
            Comparison::Gt(bound) => field_satisfies(field, bound, |o| o == Ordering::Greater),
            Comparison::Gte(bound) => field_satisfies(field, bound, |o| o != Ordering::Less),
            Comparison::Lt(bound) => field_satisfies(field, bound, |o| o == Ordering::Less),
            Comparison::Lte(bound) => field_satisfies(field, bound, |o| o != Ordering::Greater),
            Comparison::In(candidates) => candidates.iter().any(|c| field_equals(field, c)),
            Comparison::Nin(candidates) => !candidates.iter().any(|c| field_equals(field, c)),
            Comparison::Exists(expected) => field.is_some() == *expected,
        }
    }
}

/// Store-level filter expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filter {
    Field { path: String, cmp: Comparison },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn field(path: impl Into<String>, cmp: Comparison) -> Self {
        Filter::Field {
            path: path.into(),
            cmp,
        }
    }

    /// Filter matching every document.
    pub fn all() -> Self {
        Filter::And(Vec::new())
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::Field { path, cmp } => cmp.matches(resolve_path(doc, path)),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }
}

/// Look up a dotted path (`payload.a.b`) inside a document.
pub fn resolve_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |current, segment| current.as_object()?.get(segment))
}

/// Order two documents by the given sort keys. Missing fields sort as null.
pub fn compare_documents(a: &Value, b: &Value, sort: &[SortKey]) -> Ordering {
    for key in sort {
        let left = resolve_path(a, &key.path).unwrap_or(&Value::Null);
        let right = resolve_path(b, &key.path).unwrap_or(&Value::Null);
        let ord = sort_order(left, right);
        let ord = match key.direction {
            Direction::Ascending => ord,
            Direction::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn field_equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(value) => values_equal(value, expected),
    }
}

fn field_satisfies(field: Option<&Value>, bound: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
    match field {
        None => false,
        Some(Value::Array(items)) if !bound.is_array() => items
            .iter()
            .any(|item| compare_values(item, bound).is_some_and(&pred)),
        Some(value) => compare_values(value, bound).is_some_and(pred),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y) == Some(Ordering::Equal),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

/// Compare two values of the same type. `None` when the types differ or the
/// values have no natural order (objects, arrays).
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare_numbers(x: &Number, y: &Number) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return Some(a.cmp(&b));
    }
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return Some(a.cmp(&b));
    }
    x.as_f64()?.partial_cmp(&y.as_f64()?)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order used for sorting: values are grouped by type, then compared
/// within the type.
fn sort_order(a: &Value, b: &Value) -> Ordering {
    type_rank(a)
        .cmp(&type_rank(b))
        .then_with(|| compare_values(a, b).unwrap_or(Ordering::Equal))
}
