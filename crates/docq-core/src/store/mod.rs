mod filter;
mod keys;
mod memory;
mod rocksdb;
pub mod wire;

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, StorageResult};
use crate::message::{Message, MessageId, Payload};

pub use self::filter::{compare_documents, compare_values, resolve_path, Comparison, Filter};
pub use self::memory::MemoryCollection;
pub use self::rocksdb::{RocksDbCollection, RocksDbStore};

/// Sort or index direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    /// The `1` / `-1` form used in index names.
    pub fn as_i32(self) -> i32 {
        match self {
            Direction::Ascending => 1,
            Direction::Descending => -1,
        }
    }
}

impl TryFrom<i64> for Direction {
    type Error = QueueError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Direction::Ascending),
            -1 => Ok(Direction::Descending),
            other => Err(QueueError::invalid(format!(
                "direction must be 1 or -1, got {other}"
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// One key of a sort or index specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub path: String,
    pub direction: Direction,
}

impl SortKey {
    pub fn new(path: impl Into<String>, direction: Direction) -> Self {
        Self {
            path: path.into(),
            direction,
        }
    }

    pub fn asc(path: impl Into<String>) -> Self {
        Self::new(path, Direction::Ascending)
    }
}

/// Parses the `field:direction` form, e.g. `customer:1` or `created:-1`.
impl FromStr for SortKey {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, dir) = s
            .rsplit_once(':')
            .ok_or_else(|| QueueError::invalid(format!("expected field:direction, got {s:?}")))?;
        let dir: i64 = dir
            .trim()
            .parse()
            .map_err(|_| QueueError::invalid(format!("direction must be 1 or -1, got {dir:?}")))?;
        Ok(SortKey::new(path.trim(), Direction::try_from(dir)?))
    }
}

/// A named compound index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<SortKey>,
}

/// Field assignments applied atomically to one document. `None` leaves the
/// stored value as it is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Update {
    pub payload: Option<Payload>,
    pub priority: Option<f64>,
    pub earliest_get: Option<u64>,
    pub enqueued_at: Option<u64>,
    pub running: Option<bool>,
    pub reset_at: Option<u64>,
}

impl Update {
    pub fn apply(&self, message: &mut Message) {
        if let Some(payload) = &self.payload {
            message.payload = payload.clone();
        }
        if let Some(priority) = self.priority {
            message.priority = priority;
        }
        if let Some(earliest_get) = self.earliest_get {
            message.earliest_get = earliest_get;
        }
        if let Some(enqueued_at) = self.enqueued_at {
            message.enqueued_at = enqueued_at;
        }
        if let Some(running) = self.running {
            message.running = running;
        }
        if let Some(reset_at) = self.reset_at {
            message.reset_at = reset_at;
        }
    }
}

/// Result of [`Collection::update_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateOutcome {
    Updated,
    /// The document was missing and the upsert template was inserted.
    Inserted,
    Missing,
}

/// Which version of the document `find_one_and_update` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnDocument {
    Before,
    After,
}

/// A document collection. Implementations must be thread-safe and every
/// method must be atomic with respect to every other mutating method.
pub trait Collection: Send + Sync {
    /// Insert a new document. The id must not already exist.
    fn insert(&self, message: &Message) -> StorageResult<()>;

    /// Select the first document matching `filter` in `sort` order, apply
    /// `update` to it and return it. Selection and mutation are indivisible:
    /// two concurrent callers never select the same document unless it still
    /// matches after the first update.
    ///
    /// When an index ends with exactly the sort keys (after any keys the filter
    /// pins by equality), the index is walked instead of the collection and
    /// documents tied on the sort keys come out in the index's order, then by
    /// id. A full scan breaks ties by ascending id.
    fn find_one_and_update(
        &self,
        filter: &Filter,
        sort: &[SortKey],
        update: &Update,
        returning: ReturnDocument,
    ) -> StorageResult<Option<Message>>;

    /// Apply `update` to the document with this id. If it does not exist and
    /// `upsert` is given, insert that document instead (with `update` applied).
    fn update_one(
        &self,
        id: &MessageId,
        update: &Update,
        upsert: Option<&Message>,
    ) -> StorageResult<UpdateOutcome>;

    /// Delete a document by id. Returns true if it existed.
    fn delete_one(&self, id: &MessageId) -> StorageResult<bool>;

    /// Count documents matching `filter`, walking the index with the most
    /// equality-pinned leading keys when there is one.
    fn count(&self, filter: &Filter) -> StorageResult<u64>;

    /// Create an index over the existing documents. A no-op if an identical
    /// index already exists; fails with `StorageError::IndexConflict` if the
    /// name is taken by other keys.
    fn create_index(&self, spec: &IndexSpec) -> StorageResult<()>;

    /// List all indexes on the collection.
    fn list_indexes(&self) -> StorageResult<Vec<IndexSpec>>;

    /// Make all prior writes durable.
    fn flush(&self) -> StorageResult<()>;
}

/// Shared selection for the scan-based collections: the matching document
/// that sorts lowest, ties broken by ascending id.
pub(crate) fn select_first<M, I>(
    docs: I,
    filter: &Filter,
    sort: &[SortKey],
) -> StorageResult<Option<M>>
where
    M: Borrow<Message>,
    I: IntoIterator<Item = M>,
{
    let mut best: Option<(serde_json::Value, M)> = None;
    for doc in docs {
        let value = serde_json::to_value(doc.borrow())?;
        if !filter.matches(&value) {
            continue;
        }
        let better = match &best {
            None => true,
            Some((best_value, best_doc)) => compare_documents(&value, best_value, sort)
                .then_with(|| doc.borrow().id.cmp(&best_doc.borrow().id))
                .is_lt(),
        };
        if better {
            best = Some((value, doc));
        }
    }
    Ok(best.map(|(_, doc)| doc))
}

/// Index-name rules shared by all collections. Returns true when `spec` is new
/// and should be stored.
pub(crate) fn check_index(existing: &[IndexSpec], spec: &IndexSpec) -> StorageResult<bool> {
    match existing.iter().find(|idx| idx.name == spec.name) {
        Some(idx) if idx.keys == spec.keys => Ok(false),
        Some(_) => Err(crate::error::StorageError::IndexConflict {
            name: spec.name.clone(),
        }),
        None => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_field_direction_pairs() {
        assert_eq!(
            "customer:1".parse::<SortKey>().unwrap(),
            SortKey::new("customer", Direction::Ascending)
        );
        assert_eq!(
            "meta.created:-1".parse::<SortKey>().unwrap(),
            SortKey::new("meta.created", Direction::Descending)
        );
    }

    #[test]
    fn rejects_bad_directions() {
        for bad in ["customer", "customer:2", "customer:asc", "customer:0"] {
            let err = bad.parse::<SortKey>().unwrap_err();
            assert!(
                matches!(err, QueueError::InvalidArgument(_)),
                "{bad} should be invalid, got {err:?}"
            );
        }
    }

    #[test]
    fn update_only_touches_set_fields() {
        let mut msg = Message {
            id: Message::new_id(),
            payload: Payload::new(),
            priority: 1.0,
            earliest_get: 0,
            enqueued_at: 10,
            running: true,
            reset_at: 99,
        };
        let update = Update {
            running: Some(false),
            priority: Some(2.0),
            ..Default::default()
        };
        update.apply(&mut msg);
        assert!(!msg.running);
        assert_eq!(msg.priority, 2.0);
        assert_eq!(msg.enqueued_at, 10);
        assert_eq!(msg.reset_at, 99);
    }
}
