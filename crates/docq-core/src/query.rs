//! Consumer-facing filter grammar.
//!
//! A [`Query`] maps payload field paths to conditions. Operators can only
//! appear under a field, never at the top level, so a query always narrows
//! by named fields and composes safely with the engine's own predicates.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{QueueError, QueueResult};
use crate::message::{fields, MessageId};
use crate::store::{Comparison, Filter};

/// Condition on one payload field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The field equals this value (or, for array fields, contains it).
    Equals(Value),
    /// Every operator must hold.
    Operators(Vec<Comparison>),
}

/// A filter over message payloads, optionally pinned to one message id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    id: Option<MessageId>,
    fields: BTreeMap<String, Condition>,
}

impl Query {
    /// Query matching every message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the message with this id.
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Require `path` to equal `value`. Replaces any earlier condition on it.
    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields
            .insert(path.into(), Condition::Equals(value.into()));
        self
    }

    /// Add an operator condition on `path`. Operators on the same path
    /// accumulate; an earlier equality on it is replaced.
    pub fn matching(mut self, path: impl Into<String>, cmp: Comparison) -> Self {
        let entry = self
            .fields
            .entry(path.into())
            .or_insert_with(|| Condition::Operators(Vec::new()));
        match entry {
            Condition::Operators(ops) => ops.push(cmp),
            other => *other = Condition::Operators(vec![cmp]),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.fields.is_empty()
    }

    /// Parse the document form, e.g. `{"kind": "email", "attempts": {"$lt": 3}}`.
    pub fn from_json(value: &Value) -> QueueResult<Self> {
        let Value::Object(obj) = value else {
            return Err(QueueError::invalid("query must be an object"));
        };
        let mut query = Query::new();
        for (key, value) in obj {
            if key.starts_with('$') {
                return Err(QueueError::invalid(format!(
                    "operator {key} is not allowed at the top level of a query"
                )));
            }
            validate_field_path(key)?;
            let condition = match value {
                Value::Object(inner) if inner.keys().any(|k| k.starts_with('$')) => {
                    Condition::Operators(parse_operators(key, inner)?)
                }
                other => Condition::Equals(other.clone()),
            };
            query.fields.insert(key.clone(), condition);
        }
        Ok(query)
    }

    /// Check every field path.
    pub fn validate(&self) -> QueueResult<()> {
        self.fields.keys().try_for_each(|p| validate_field_path(p))
    }

    /// Build the store filter, with paths rooted at the payload.
    pub(crate) fn to_filter(&self) -> QueueResult<Filter> {
        self.validate()?;
        let mut clauses = Vec::with_capacity(self.fields.len() + 1);
        if let Some(id) = self.id {
            clauses.push(Filter::field(
                fields::ID,
                Comparison::Eq(Value::String(id.to_string())),
            ));
        }
        for (path, condition) in &self.fields {
            let full = format!("{}.{path}", fields::PAYLOAD);
            match condition {
                Condition::Equals(value) => {
                    clauses.push(Filter::field(full, Comparison::Eq(value.clone())))
                }
                Condition::Operators(ops) => clauses.extend(
                    ops.iter()
                        .map(|cmp| Filter::field(full.clone(), cmp.clone())),
                ),
            }
        }
        Ok(Filter::And(clauses))
    }
}

fn parse_operators(path: &str, ops: &Map<String, Value>) -> QueueResult<Vec<Comparison>> {
    if let Some(plain) = ops.keys().find(|k| !k.starts_with('$')) {
        return Err(QueueError::invalid(format!(
            "field {path} mixes operators with plain key {plain}"
        )));
    }
    ops.iter()
        .map(|(op, operand)| parse_operator(path, op, operand))
        .collect()
}

fn parse_operator(path: &str, op: &str, operand: &Value) -> QueueResult<Comparison> {
    let list = || match operand {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(QueueError::invalid(format!(
            "{op} on field {path} needs an array"
        ))),
    };
    Ok(match op {
        "$eq" => Comparison::Eq(operand.clone()),
        "$ne" => Comparison::Ne(operand.clone()),
        "$gt" => Comparison::Gt(operand.clone()),
        "$gte" => Comparison::Gte(operand.clone()),
        "$lt" => Comparison::Lt(operand.clone()),
        "$lte" => Comparison::Lte(operand.clone()),
        "$in" => Comparison::In(list()?),
        "$nin" => Comparison::Nin(list()?),
        "$exists" => match operand {
            Value::Bool(b) => Comparison::Exists(*b),
            _ => {
                return Err(QueueError::invalid(format!(
                    "$exists on field {path} needs a boolean"
                )))
            }
        },
        other => {
            return Err(QueueError::invalid(format!(
                "unknown operator {other} on field {path}"
            )))
        }
    })
}

/// Field paths are dotted names: non-empty segments, no leading `$`.
pub(crate) fn validate_field_path(path: &str) -> QueueResult<()> {
    if path.is_empty() {
        return Err(QueueError::invalid("field name must not be empty"));
    }
    if path.starts_with('$') {
        return Err(QueueError::invalid(format!(
            "field name {path} must not start with $"
        )));
    }
    if path.split('.').any(str::is_empty) {
        return Err(QueueError::invalid(format!(
            "field name {path} has an empty path segment"
        )));
    }
    Ok(())
}
