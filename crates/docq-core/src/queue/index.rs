use std::collections::HashSet;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Queue;
use crate::error::{QueueError, QueueResult, StorageError};
use crate::message::fields;
use crate::query::validate_field_path;
use crate::store::{IndexSpec, SortKey};

/// How many names `ensure_index` tries before giving up.
pub const MAX_INDEX_ATTEMPTS: u32 = 5;

/// Longer generated names are replaced by a random short one.
const MAX_INDEX_NAME_LEN: usize = 120;

impl Queue {
    /// Ensure the index serving `get`: caller fields before the sort, then
    /// `priority`, `enqueuedAt`, then caller fields after the sort. Also ensures
    /// the `(running, resetAt)` index used to find expired leases.
    ///
    /// Caller fields are payload paths. Returns the name of the main index.
    #[tracing::instrument(skip_all, fields(queue = %self.name))]
    pub fn ensure_get_index(
        &self,
        before_sort: &[SortKey],
        after_sort: &[SortKey],
    ) -> QueueResult<String> {
        let mut keys = payload_keys(before_sort)?;
        keys.push(SortKey::asc(fields::PRIORITY));
        keys.push(SortKey::asc(fields::ENQUEUED_AT));
        keys.extend(payload_keys(after_sort)?);
        check_unique(&keys)?;

        let name = self.ensure_index(keys)?;
        self.ensure_index(vec![
            SortKey::asc(fields::RUNNING),
            SortKey::asc(fields::RESET_AT),
        ])?;
        Ok(name)
    }

    /// Ensure an index serving `count` over the given payload fields,
    /// prefixed with `running` when `include_running` is set.
    #[tracing::instrument(skip_all, fields(queue = %self.name, include_running = include_running))]
    pub fn ensure_count_index(
        &self,
        count_fields: &[SortKey],
        include_running: bool,
    ) -> QueueResult<String> {
        let mut keys = Vec::with_capacity(count_fields.len() + 1);
        if include_running {
            keys.push(SortKey::asc(fields::RUNNING));
        }
        keys.extend(payload_keys(count_fields)?);
        if keys.is_empty() {
            return Err(QueueError::invalid("count index needs at least one field"));
        }
        check_unique(&keys)?;
        self.ensure_index(keys)
    }

    /// Create an index with these keys unless one already exists, retrying
    /// under fresh names when the preferred name is taken.
    fn ensure_index(&self, keys: Vec<SortKey>) -> QueueResult<String> {
        if let Some(existing) = self.find_index(&keys)? {
            debug!(index = %existing, "index already present");
            return Ok(existing);
        }

        let mut name = index_name(&keys);
        for attempt in 1..=MAX_INDEX_ATTEMPTS {
            let spec = IndexSpec {
                name: name.clone(),
                keys: keys.clone(),
            };
            match self.collection.create_index(&spec) {
                Ok(()) => {
                    info!(index = %name, "index ensured");
                    return Ok(name);
                }
                Err(StorageError::IndexConflict { name: taken }) => {
                    // another process may have created the same keys meanwhile
                    if let Some(existing) = self.find_index(&keys)? {
                        return Ok(existing);
                    }
                    warn!(attempt, index = %taken, "index name taken, retrying");
                    name = generated_name();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(QueueError::IndexCreation {
            attempts: MAX_INDEX_ATTEMPTS,
        })
    }

    fn find_index(&self, keys: &[SortKey]) -> QueueResult<Option<String>> {
        Ok(self
            .collection
            .list_indexes()?
            .into_iter()
            .find(|idx| idx.keys == keys)
            .map(|idx| idx.name))
    }
}

/// Validate caller fields and root them at the payload.
fn payload_keys(keys: &[SortKey]) -> QueueResult<Vec<SortKey>> {
    keys.iter()
        .map(|key| {
            validate_field_path(&key.path)?;
            Ok(SortKey::new(
                format!("{}.{}", fields::PAYLOAD, key.path),
                key.direction,
            ))
        })
        .collect()
}

fn check_unique(keys: &[SortKey]) -> QueueResult<()> {
    let mut seen = HashSet::with_capacity(keys.len());
    for key in keys {
        if !seen.insert(key.path.as_str()) {
            return Err(QueueError::invalid(format!(
                "field {} appears more than once in the index",
                key.path
            )));
        }
    }
    Ok(())
}

/// `payload.a_1_priority_1_enqueuedAt_-1` style name.
fn index_name(keys: &[SortKey]) -> String {
    let name = keys
        .iter()
        .map(|k| format!("{}_{}", k.path, k.direction))
        .collect::<Vec<_>>()
        .join("_");
    if name.len() > MAX_INDEX_NAME_LEN {
        generated_name()
    } else {
        name
    }
}

fn generated_name() -> String {
    // the tail of a v7 UUID is random; the head is a timestamp
    let id = Uuid::now_v7().simple().to_string();
    format!("idx_{}", &id[20..])
}
