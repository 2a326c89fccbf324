use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{StorageError, StorageResult};
use crate::message::{Message, MessageId};
use crate::store::keys::{entry_id, plan, Access, IndexRecord};
use crate::store::{
    check_index, select_first, Collection, Filter, IndexSpec, ReturnDocument, SortKey, Update,
    UpdateOutcome,
};

struct MemoryIndex {
    record: IndexRecord,
    entries: BTreeSet<Vec<u8>>,
}

impl MemoryIndex {
    fn reindex(&mut self, id: &MessageId, old: Option<&Value>, new: Option<&Value>) {
        let old_entry = old.map(|doc| self.record.entry(doc, id));
        let new_entry = new.map(|doc| self.record.entry(doc, id));
        if old_entry == new_entry {
            return;
        }
        if let Some(entry) = old_entry {
            self.entries.remove(&entry);
        }
        if let Some(entry) = new_entry {
            self.entries.insert(entry);
        }
        if new.is_some_and(|doc| self.record.has_array(doc)) {
            self.record.multikey = true;
        }
    }
}

#[derive(Default)]
struct State {
    docs: BTreeMap<MessageId, Message>,
    indexes: Vec<MemoryIndex>,
    examined: u64,
}

impl State {
    fn put(&mut self, old: Option<&Message>, new: &Message) -> StorageResult<()> {
        let old_value = old.map(serde_json::to_value).transpose()?;
        let new_value = serde_json::to_value(new)?;
        for index in &mut self.indexes {
            index.reindex(&new.id, old_value.as_ref(), Some(&new_value));
        }
        self.docs.insert(new.id, new.clone());
        Ok(())
    }

    fn remove(&mut self, id: &MessageId) -> StorageResult<bool> {
        let Some(old) = self.docs.remove(id) else {
            return Ok(false);
        };
        let old_value = serde_json::to_value(&old)?;
        for index in &mut self.indexes {
            index.reindex(id, Some(&old_value), None);
        }
        Ok(true)
    }

    fn check(&mut self, id: &MessageId, filter: &Filter) -> StorageResult<bool> {
        let Some(doc) = self.docs.get(id) else {
            return Ok(false);
        };
        self.examined += 1;
        Ok(filter.matches(&serde_json::to_value(doc)?))
    }

    fn entries(&self, position: usize, prefix: &[u8]) -> Vec<MessageId> {
        self.indexes[position]
            .entries
            .range(prefix.to_vec()..)
            .take_while(|entry| entry.starts_with(prefix))
            .filter_map(|entry| entry_id(entry))
            .collect()
    }

    /// Id of the first document matching `filter` in `sort` order.
    fn select(&mut self, filter: &Filter, sort: &[SortKey]) -> StorageResult<Option<MessageId>> {
        match plan(self.indexes.iter().map(|i| &i.record), filter, sort) {
            Access::ById(id) => Ok(self.check(&id, filter)?.then_some(id)),
            Access::Index { position, prefix } => {
                let mut examined = 0;
                let mut found = None;
                for entry in self.indexes[position].entries.range(prefix.clone()..) {
                    if !entry.starts_with(&prefix) {
                        break;
                    }
                    let Some(doc) = entry_id(entry).and_then(|id| self.docs.get(&id)) else {
                        continue;
                    };
                    examined += 1;
                    if filter.matches(&serde_json::to_value(doc)?) {
                        found = Some(doc.id);
                        break;
                    }
                }
                self.examined += examined;
                Ok(found)
            }
            Access::Scan => {
                self.examined += self.docs.len() as u64;
                Ok(select_first(self.docs.values(), filter, sort)?.map(|m| m.id))
            }
        }
    }

    fn count(&mut self, filter: &Filter) -> StorageResult<u64> {
        let ids = match plan(self.indexes.iter().map(|i| &i.record), filter, &[]) {
            Access::ById(id) => vec![id],
            Access::Index { position, prefix } => self.entries(position, &prefix),
            Access::Scan => self.docs.keys().copied().collect(),
        };
        let mut n = 0u64;
        for id in &ids {
            if self.check(id, filter)? {
                n += 1;
            }
        }
        Ok(n)
    }
}

/// In-process collection. Every operation runs under one lock, which is what
/// makes `find_one_and_update` indivisible. Indexes are kept as ordered sets
/// of encoded entries and serve claims and counts the way the RocksDB store's
/// entry column family does.
#[derive(Default)]
pub struct MemoryCollection {
    state: Mutex<State>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents reads have evaluated against a filter so far.
    pub fn documents_examined(&self) -> u64 {
        self.state.lock().examined
    }
}

impl Collection for MemoryCollection {
    fn insert(&self, message: &Message) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.docs.contains_key(&message.id) {
            return Err(StorageError::DuplicateId(message.id));
        }
        state.put(None, message)
    }

    fn find_one_and_update(
        &self,
        filter: &Filter,
        sort: &[SortKey],
        update: &Update,
        returning: ReturnDocument,
    ) -> StorageResult<Option<Message>> {
        let mut state = self.state.lock();
        let Some(id) = state.select(filter, sort)? else {
            return Ok(None);
        };
        let Some(before) = state.docs.get(&id).cloned() else {
            return Ok(None);
        };
        let mut after = before.clone();
        update.apply(&mut after);
        state.put(Some(&before), &after)?;
        Ok(Some(match returning {
            ReturnDocument::Before => before,
            ReturnDocument::After => after,
        }))
    }

    fn update_one(
        &self,
        id: &MessageId,
        update: &Update,
        upsert: Option<&Message>,
    ) -> StorageResult<UpdateOutcome> {
        let mut state = self.state.lock();
        let old = state.docs.get(id).cloned();
        let (mut doc, outcome) = match (&old, upsert) {
            (Some(doc), _) => (doc.clone(), UpdateOutcome::Updated),
            (None, Some(template)) => {
                let mut doc = template.clone();
                doc.id = *id;
                (doc, UpdateOutcome::Inserted)
            }
            (None, None) => return Ok(UpdateOutcome::Missing),
        };
        update.apply(&mut doc);
        state.put(old.as_ref(), &doc)?;
        Ok(outcome)
    }

    fn delete_one(&self, id: &MessageId) -> StorageResult<bool> {
        self.state.lock().remove(id)
    }

    fn count(&self, filter: &Filter) -> StorageResult<u64> {
        self.state.lock().count(filter)
    }

    fn create_index(&self, spec: &IndexSpec) -> StorageResult<()> {
        let mut state = self.state.lock();
        let specs: Vec<IndexSpec> = state.indexes.iter().map(|i| i.record.spec.clone()).collect();
        if !check_index(&specs, spec)? {
            return Ok(());
        }
        let mut index = MemoryIndex {
            record: IndexRecord::new(spec.clone(), state.indexes.len() as u32),
            entries: BTreeSet::new(),
        };
        for (id, doc) in &state.docs {
            let value = serde_json::to_value(doc)?;
            index.reindex(id, None, Some(&value));
        }
        state.indexes.push(index);
        Ok(())
    }

    fn list_indexes(&self) -> StorageResult<Vec<IndexSpec>> {
        Ok(self
            .state
            .lock()
            .indexes
            .iter()
            .map(|i| i.record.spec.clone())
            .collect())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}
