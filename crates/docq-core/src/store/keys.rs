//! Ordered index entries and the access planner that uses them.
//!
//! An entry is the encoded value of every index key followed by the 16 raw id
//! bytes. Values are encoded so that byte order equals the sort order used by
//! [`compare_documents`](super::compare_documents): a type-rank byte, then a
//! self-delimiting body. Descending keys store the bitwise complement, which
//! reverses the order because no encoding is a prefix of another.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use super::{resolve_path, Comparison, Direction, Filter, IndexSpec, SortKey};
use crate::message::{fields, MessageId};

/// An index as a collection keeps it: the public spec plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct IndexRecord {
    pub spec: IndexSpec,
    /// Stable small number prefixing this index's entries in shared storage.
    pub ordinal: u32,
    /// Set once any indexed document held an array under one of the keys.
    /// Equality prefixes are unusable from then on, because equality against
    /// an array field matches its elements.
    pub multikey: bool,
}

impl IndexRecord {
    pub fn new(spec: IndexSpec, ordinal: u32) -> Self {
        Self {
            spec,
            ordinal,
            multikey: false,
        }
    }

    pub fn entry(&self, doc: &Value, id: &MessageId) -> Vec<u8> {
        entry_key(&self.spec.keys, doc, id)
    }

    /// True if `doc` would make this index multikey.
    pub fn has_array(&self, doc: &Value) -> bool {
        self.spec
            .keys
            .iter()
            .any(|key| matches!(resolve_path(doc, &key.path), Some(Value::Array(_))))
    }
}

/// How to find the documents a filter may match.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Access {
    /// The filter pins a single id.
    ById(MessageId),
    /// Walk the entries of `indexes[position]` starting with `prefix`.
    Index { position: usize, prefix: Vec<u8> },
    /// No index helps.
    Scan,
}

const RANK_NULL: u8 = 0x10;
const RANK_NUMBER: u8 = 0x20;
const RANK_STRING: u8 = 0x30;
const RANK_OBJECT: u8 = 0x40;
const RANK_ARRAY: u8 = 0x50;
const RANK_BOOL: u8 = 0x60;

pub(crate) fn entry_key(keys: &[SortKey], doc: &Value, id: &MessageId) -> Vec<u8> {
    let mut out = Vec::with_capacity(keys.len() * 26 + 16);
    for key in keys {
        let value = resolve_path(doc, &key.path).unwrap_or(&Value::Null);
        encode_value(value, key.direction, &mut out);
    }
    out.extend_from_slice(id.as_bytes());
    out
}

/// The id stored in the last 16 bytes of an entry.
pub(crate) fn entry_id(entry: &[u8]) -> Option<MessageId> {
    let start = entry.len().checked_sub(16)?;
    MessageId::from_slice(&entry[start..]).ok()
}

fn encode_value(value: &Value, direction: Direction, out: &mut Vec<u8>) {
    let start = out.len();
    match value {
        Value::Null => out.push(RANK_NULL),
        Value::Number(n) => {
            out.push(RANK_NUMBER);
            encode_number(n, out);
        }
        Value::String(s) => {
            out.push(RANK_STRING);
            for &b in s.as_bytes() {
                out.push(b);
                if b == 0 {
                    out.push(0xFF);
                }
            }
            out.extend_from_slice(&[0, 0]);
        }
        // objects and arrays are unordered within their type
        Value::Object(_) => out.push(RANK_OBJECT),
        Value::Array(_) => out.push(RANK_ARRAY),
        Value::Bool(b) => {
            out.push(RANK_BOOL);
            out.push(u8::from(*b));
        }
    }
    if direction == Direction::Descending {
        for b in &mut out[start..] {
            *b = !*b;
        }
    }
}

/// 8 bytes of order-preserving f64, then 16 bytes of the exact integer value
/// so that large integers that share an f64 image still order correctly.
fn encode_number(n: &Number, out: &mut Vec<u8>) {
    let mut f = n.as_f64().unwrap_or(0.0);
    if f == 0.0 {
        f = 0.0;
    }
    let bits = f.to_bits();
    let ordered = if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    };
    out.extend_from_slice(&ordered.to_be_bytes());

    let exact = if let Some(u) = n.as_u64() {
        i128::from(u)
    } else if let Some(i) = n.as_i64() {
        i128::from(i)
    } else if f.fract() == 0.0 && f.abs() < 1e38 {
        f as i128
    } else {
        0
    };
    out.extend_from_slice(&((exact as u128) ^ (1 << 127)).to_be_bytes());
}

/// Values whose equality matches exactly the documents with the same entry
/// bytes. Large numbers are left out because mixed integer and float forms
/// compare equal through their shared f64 image.
fn pins_entries(value: &Value) -> bool {
    match value {
        Value::Array(_) | Value::Object(_) => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f.abs() < MAX_SAFE_INTEGER),
        _ => true,
    }
}

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Scalar equality constraints in the top-level conjunction of `filter`.
fn equalities(filter: &Filter) -> HashMap<&str, &Value> {
    let mut found = HashMap::new();
    let mut pending = vec![filter];
    while let Some(f) = pending.pop() {
        match f {
            Filter::And(parts) => pending.extend(parts),
            Filter::Field {
                path,
                cmp: Comparison::Eq(value),
            } if pins_entries(value) => {
                found.entry(path.as_str()).or_insert(value);
            }
            _ => {}
        }
    }
    found
}

/// Number of leading keys pinned by equalities, and their encoded prefix.
fn pinned_prefix(keys: &[SortKey], eq: &HashMap<&str, &Value>) -> (usize, Vec<u8>) {
    let mut prefix = Vec::new();
    let mut pinned = 0;
    for key in keys {
        let Some(value) = eq.get(key.path.as_str()) else {
            break;
        };
        encode_value(value, key.direction, &mut prefix);
        pinned += 1;
    }
    (pinned, prefix)
}

/// Choose how to evaluate `filter`, visiting documents in `sort` order when a
/// sort is given.
///
/// With a sort, an index qualifies when its keys are some equality-pinned
/// leading keys followed by exactly the sort keys. Without one, the index
/// with the most pinned leading keys wins. Documents tied on the sort keys
/// come out in the order of the index's remaining keys, then id.
pub(crate) fn plan<'a>(
    indexes: impl IntoIterator<Item = &'a IndexRecord>,
    filter: &Filter,
    sort: &[SortKey],
) -> Access {
    let eq = equalities(filter);
    if let Some(id) = eq
        .get(fields::ID)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<MessageId>().ok())
    {
        return Access::ById(id);
    }

    let mut best: Option<(usize, usize, Vec<u8>)> = None;
    for (position, record) in indexes.into_iter().enumerate() {
        let keys = &record.spec.keys;
        let (mut pinned, mut prefix) = pinned_prefix(keys, &eq);
        if record.multikey {
            pinned = 0;
            prefix.clear();
        }

        let usable = if sort.is_empty() {
            pinned > 0
        } else {
            // walk back from the longest pinned run to one where the sort starts
            loop {
                if keys.len() >= pinned + sort.len() && keys[pinned..pinned + sort.len()] == *sort
                {
                    break true;
                }
                if pinned == 0 {
                    break false;
                }
                pinned -= 1;
                prefix = pinned_prefix(&keys[..pinned], &eq).1;
            }
        };

        if usable && best.as_ref().map_or(true, |(n, _, _)| pinned > *n) {
            best = Some((pinned, position, prefix));
        }
    }

    match best {
        Some((_, position, prefix)) => Access::Index { position, prefix },
        None => Access::Scan,
    }
}
