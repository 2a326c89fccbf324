use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, DBWithThreadMode, Direction as ScanDirection, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::message::{Message, MessageId};
use crate::store::keys::{entry_id, plan, Access, IndexRecord};
use crate::store::{
    check_index, select_first, Collection, Filter, IndexSpec, ReturnDocument, SortKey, Update,
    UpdateOutcome,
};

/// Suffix of the column family holding a collection's index records.
const INDEXES_SUFFIX: &str = ".indexes";
/// Suffix of the column family holding a collection's index entries.
const ENTRIES_SUFFIX: &str = ".entries";

type DB = DBWithThreadMode<MultiThreaded>;

/// Index records of one collection, shared by every handle to it. Holding the
/// lock serializes the collection's writes.
type Catalog = Arc<Mutex<Vec<IndexRecord>>>;

/// A RocksDB database holding any number of collections. Each collection is
/// three column families:
///
/// - `<name>`: JSON documents keyed by the raw 16 id bytes
/// - `<name>.indexes`: index records keyed by index name
/// - `<name>.entries`: one empty-valued key per indexed document, the index
///   ordinal (4 bytes, big-endian) followed by the encoded entry
///
/// A document and its entries are always written in the same `WriteBatch`.
pub struct RocksDbStore {
    db: Arc<DB>,
    catalogs: Mutex<HashMap<String, Catalog>>,
}

impl RocksDbStore {
    /// Open or create a database at the given path, reopening every column
    /// family it already contains.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let existing = if path.join("CURRENT").exists() {
            DB::list_cf(&db_opts, path)?
        } else {
            Vec::new()
        };
        let db = DB::open_cf(&db_opts, path, &existing)?;
        info!(path = %path.display(), column_families = existing.len(), "opened rocksdb store");

        Ok(Self {
            db: Arc::new(db),
            catalogs: Mutex::new(HashMap::new()),
        })
    }

    /// Get a handle to a named collection, creating it if needed.
    pub fn collection(&self, name: &str) -> StorageResult<RocksDbCollection> {
        if name.is_empty() || name.ends_with(INDEXES_SUFFIX) || name.ends_with(ENTRIES_SUFFIX) {
            return Err(StorageError::InvalidCollectionName(name.to_string()));
        }
        // held while creating column families so concurrent callers don't race
        let mut catalogs = self.catalogs.lock();
        let indexes_cf = format!("{name}{INDEXES_SUFFIX}");
        let entries_cf = format!("{name}{ENTRIES_SUFFIX}");
        for cf_name in [name, indexes_cf.as_str(), entries_cf.as_str()] {
            if self.db.cf_handle(cf_name).is_none() {
                self.db.create_cf(cf_name, &Options::default())?;
                debug!(column_family = cf_name, "created column family");
            }
        }

        let catalog = match catalogs.get(name) {
            Some(catalog) => Arc::clone(catalog),
            None => {
                let catalog = Arc::new(Mutex::new(self.load_catalog(&indexes_cf)?));
                catalogs.insert(name.to_string(), Arc::clone(&catalog));
                catalog
            }
        };

        Ok(RocksDbCollection {
            db: Arc::clone(&self.db),
            docs_cf: name.to_string(),
            indexes_cf,
            entries_cf,
            catalog,
        })
    }

    fn load_catalog(&self, indexes_cf: &str) -> StorageResult<Vec<IndexRecord>> {
        let cf = self
            .db
            .cf_handle(indexes_cf)
            .ok_or_else(|| StorageError::ColumnFamilyMissing(indexes_cf.to_string()))?;
        let mut records: Vec<IndexRecord> = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            records.push(serde_json::from_slice(&value)?);
        }
        records.sort_by_key(|record| record.ordinal);
        Ok(records)
    }
}

/// Handle to one collection in a [`RocksDbStore`].
///
/// Claims and counts walk an index's entries when one fits the filter and
/// sort, and scan the documents otherwise. Every mutation holds the
/// collection's catalog lock across its read-modify-write, so mutations are
/// atomic with respect to each other within this process.
pub struct RocksDbCollection {
    db: Arc<DB>,
    docs_cf: String,
    indexes_cf: String,
    entries_cf: String,
    catalog: Catalog,
}

fn entry_cf_key(record: &IndexRecord, doc: &Value, id: &MessageId) -> Vec<u8> {
    let mut key = record.ordinal.to_be_bytes().to_vec();
    key.extend_from_slice(&record.entry(doc, id));
    key
}

impl RocksDbCollection {
    fn handle(&self, name: &str) -> StorageResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyMissing(name.to_string()))
    }

    fn load(&self, id: &MessageId) -> StorageResult<Option<Message>> {
        let cf = self.handle(&self.docs_cf)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn scan(&self) -> StorageResult<Vec<Message>> {
        let cf = self.handle(&self.docs_cf)?;
        let mut results = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            results.push(serde_json::from_slice(&value)?);
        }
        Ok(results)
    }

    /// Replace `old` with `new` (either may be absent) together with their
    /// index entries in one batch.
    fn write(
        &self,
        catalog: &mut [IndexRecord],
        id: &MessageId,
        old: Option<&Message>,
        new: Option<&Message>,
    ) -> StorageResult<()> {
        let docs = self.handle(&self.docs_cf)?;
        let entries = self.handle(&self.entries_cf)?;
        let indexes = self.handle(&self.indexes_cf)?;
        let old_value = old.map(serde_json::to_value).transpose()?;
        let new_value = new.map(serde_json::to_value).transpose()?;

        let mut batch = WriteBatch::default();
        for record in catalog.iter_mut() {
            let old_key = old_value.as_ref().map(|doc| entry_cf_key(record, doc, id));
            let new_key = new_value.as_ref().map(|doc| entry_cf_key(record, doc, id));
            if old_key != new_key {
                if let Some(key) = old_key {
                    batch.delete_cf(&entries, key);
                }
                if let Some(key) = new_key {
                    batch.put_cf(&entries, key, b"");
                }
            }
            if !record.multikey && new_value.as_ref().is_some_and(|doc| record.has_array(doc)) {
                record.multikey = true;
                batch.put_cf(&indexes, record.spec.name.as_bytes(), serde_json::to_vec(record)?);
            }
        }
        match &new_value {
            Some(doc) => batch.put_cf(&docs, id.as_bytes(), serde_json::to_vec(doc)?),
            None => batch.delete_cf(&docs, id.as_bytes()),
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Walk the entries of `record` that start with `prefix`, loading each
    /// document. Stops when `visit` returns false.
    fn walk_entries(
        &self,
        record: &IndexRecord,
        prefix: &[u8],
        mut visit: impl FnMut(Message, &Value) -> bool,
    ) -> StorageResult<()> {
        let cf = self.handle(&self.entries_cf)?;
        let mut seek = record.ordinal.to_be_bytes().to_vec();
        seek.extend_from_slice(prefix);
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&seek, ScanDirection::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&seek) {
                break;
            }
            let Some(id) = entry_id(&key) else {
                continue;
            };
            let Some(doc) = self.load(&id)? else {
                continue;
            };
            let value = serde_json::to_value(&doc)?;
            if !visit(doc, &value) {
                break;
            }
        }
        Ok(())
    }

    fn select(
        &self,
        catalog: &[IndexRecord],
        filter: &Filter,
        sort: &[SortKey],
    ) -> StorageResult<Option<Message>> {
        match plan(catalog, filter, sort) {
            Access::ById(id) => match self.load(&id)? {
                Some(doc) if filter.matches(&serde_json::to_value(&doc)?) => Ok(Some(doc)),
                _ => Ok(None),
            },
            Access::Index { position, prefix } => {
                let mut found = None;
                self.walk_entries(&catalog[position], &prefix, |doc, value| {
                    if filter.matches(value) {
                        found = Some(doc);
                        return false;
                    }
                    true
                })?;
                Ok(found)
            }
            Access::Scan => select_first(self.scan()?, filter, sort),
        }
    }
}

impl Collection for RocksDbCollection {
    fn insert(&self, message: &Message) -> StorageResult<()> {
        let mut catalog = self.catalog.lock();
        if self.load(&message.id)?.is_some() {
            return Err(StorageError::DuplicateId(message.id));
        }
        self.write(&mut catalog, &message.id, None, Some(message))
    }

    fn find_one_and_update(
        &self,
        filter: &Filter,
        sort: &[SortKey],
        update: &Update,
        returning: ReturnDocument,
    ) -> StorageResult<Option<Message>> {
        let mut catalog = self.catalog.lock();
        let Some(before) = self.select(&catalog, filter, sort)? else {
            return Ok(None);
        };
        let mut after = before.clone();
        update.apply(&mut after);
        self.write(&mut catalog, &before.id, Some(&before), Some(&after))?;
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
        let mut catalog = self.catalog.lock();
        let old = self.load(id)?;
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
        self.write(&mut catalog, id, old.as_ref(), Some(&doc))?;
        Ok(outcome)
    }

    fn delete_one(&self, id: &MessageId) -> StorageResult<bool> {
        let mut catalog = self.catalog.lock();
        let Some(old) = self.load(id)? else {
            return Ok(false);
        };
        self.write(&mut catalog, id, Some(&old), None)?;
        Ok(true)
    }

    fn count(&self, filter: &Filter) -> StorageResult<u64> {
        let catalog = self.catalog.lock().clone();
        let mut n = 0u64;
        match plan(&catalog, filter, &[]) {
            Access::ById(id) => {
                if let Some(doc) = self.load(&id)? {
                    if filter.matches(&serde_json::to_value(&doc)?) {
                        n += 1;
                    }
                }
            }
            Access::Index { position, prefix } => {
                self.walk_entries(&catalog[position], &prefix, |_, value| {
                    if filter.matches(value) {
                        n += 1;
                    }
                    true
                })?;
            }
            Access::Scan => {
                for doc in self.scan()? {
                    if filter.matches(&serde_json::to_value(&doc)?) {
                        n += 1;
                    }
                }
            }
        }
        Ok(n)
    }

    fn create_index(&self, spec: &IndexSpec) -> StorageResult<()> {
        let mut catalog = self.catalog.lock();
        let specs: Vec<IndexSpec> = catalog.iter().map(|record| record.spec.clone()).collect();
        if !check_index(&specs, spec)? {
            return Ok(());
        }
        let ordinal = catalog
            .iter()
            .map(|record| record.ordinal + 1)
            .max()
            .unwrap_or(0);
        let mut record = IndexRecord::new(spec.clone(), ordinal);

        let entries = self.handle(&self.entries_cf)?;
        let indexes = self.handle(&self.indexes_cf)?;
        let mut batch = WriteBatch::default();
        let mut backfilled = 0usize;
        for doc in self.scan()? {
            let value = serde_json::to_value(&doc)?;
            record.multikey |= record.has_array(&value);
            batch.put_cf(&entries, entry_cf_key(&record, &value, &doc.id), b"");
            backfilled += 1;
        }
        batch.put_cf(&indexes, spec.name.as_bytes(), serde_json::to_vec(&record)?);
        self.db.write(batch)?;
        debug!(
            collection = %self.docs_cf,
            index = %spec.name,
            backfilled,
            "created index"
        );

        catalog.push(record);
        Ok(())
    }

    fn list_indexes(&self) -> StorageResult<Vec<IndexSpec>> {
        Ok(self
            .catalog
            .lock()
            .iter()
            .map(|record| record.spec.clone())
            .collect())
    }

    fn flush(&self) -> StorageResult<()> {
        self.db.flush_wal(true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{fields, Payload, NO_LEASE};
    use crate::store::Comparison;
    use serde_json::json;

    fn test_store() -> (RocksDbStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn test_message(kind: &str, priority: f64) -> Message {
        let mut payload = Payload::new();
        payload.insert("kind".to_string(), json!(kind));
        Message {
            id: Message::new_id(),
            payload,
            priority,
            earliest_get: 0,
            enqueued_at: 1_000_000_000,
            running: false,
            reset_at: NO_LEASE,
        }
    }

    #[test]
    fn collection_creates_column_families() {
        let (store, _dir) = test_store();
        store.collection("jobs").unwrap();
        assert!(store.db.cf_handle("jobs").is_some());
        assert!(store.db.cf_handle("jobs.indexes").is_some());
        assert!(store.db.cf_handle("jobs.entries").is_some());
    }

    #[test]
    fn rejects_reserved_collection_names() {
        let (store, _dir) = test_store();
        for name in ["", "jobs.indexes", "jobs.entries"] {
            match store.collection(name) {
                Err(StorageError::InvalidCollectionName(got)) => assert_eq!(got, name),
                Err(other) => panic!("{name:?}: expected InvalidCollectionName, got {other:?}"),
                Ok(_) => panic!("{name:?} should be rejected"),
            }
        }
    }

    #[test]
    fn open_reports_a_corrupt_database() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("CURRENT"), "MANIFEST-000042\n").unwrap();
        assert!(matches!(
            RocksDbStore::open(dir.path()),
            Err(StorageError::RocksDb(_))
        ));
    }

    #[test]
    fn claim_update_and_delete() {
        let (store, _dir) = test_store();
        let coll = store.collection("jobs").unwrap();
        let slow = test_message("report", 2.0);
        let fast = test_message("email", 1.0);
        coll.insert(&slow).unwrap();
        coll.insert(&fast).unwrap();

        let claim = Update {
            running: Some(true),
            reset_at: Some(7),
            ..Default::default()
        };
        let sort = [SortKey::asc(fields::PRIORITY)];
        let unleased = Filter::field(fields::RUNNING, Comparison::Eq(json!(false)));
        let got = coll
            .find_one_and_update(&unleased, &sort, &claim, ReturnDocument::After)
            .unwrap()
            .unwrap();
        assert_eq!(got.id, fast.id);
        assert!(got.running);

        let running = Filter::field(fields::RUNNING, Comparison::Eq(json!(true)));
        assert_eq!(coll.count(&running).unwrap(), 1);
        assert_eq!(coll.count(&Filter::all()).unwrap(), 2);

        assert!(coll.delete_one(&fast.id).unwrap());
        assert!(!coll.delete_one(&fast.id).unwrap());
        assert_eq!(coll.count(&Filter::all()).unwrap(), 1);
    }

    #[test]
    fn collections_are_isolated() {
        let (store, _dir) = test_store();
        let a = store.collection("a").unwrap();
        let b = store.collection("b").unwrap();
        a.insert(&test_message("x", 0.0)).unwrap();
        assert_eq!(a.count(&Filter::all()).unwrap(), 1);
        assert_eq!(b.count(&Filter::all()).unwrap(), 0);
    }

    #[test]
    fn handles_to_same_collection_share_catalog() {
        let (store, _dir) = test_store();
        let a = store.collection("jobs").unwrap();
        let b = store.collection("jobs").unwrap();
        assert!(Arc::ptr_eq(&a.catalog, &b.catalog));

        a.create_index(&claim_index()).unwrap();
        assert_eq!(b.list_indexes().unwrap(), vec![claim_index()]);
    }

    #[test]
    fn update_one_with_upsert() {
        let (store, _dir) = test_store();
        let coll = store.collection("jobs").unwrap();
        let msg = test_message("email", 0.0);
        let update = Update {
            running: Some(false),
            priority: Some(5.0),
            ..Default::default()
        };
        assert_eq!(
            coll.update_one(&msg.id, &update, None).unwrap(),
            UpdateOutcome::Missing
        );
        assert_eq!(
            coll.update_one(&msg.id, &update, Some(&msg)).unwrap(),
            UpdateOutcome::Inserted
        );
        let stored = coll.load(&msg.id).unwrap().unwrap();
        assert_eq!(stored.priority, 5.0);
        assert_eq!(stored.payload, msg.payload);
    }

    #[test]
    fn reopen_preserves_documents_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let msg = test_message("email", 0.0);
        let spec = IndexSpec {
            name: "priority_1".to_string(),
            keys: vec![SortKey::asc(fields::PRIORITY)],
        };

        {
            let store = RocksDbStore::open(dir.path()).unwrap();
            let coll = store.collection("jobs").unwrap();
            coll.insert(&msg).unwrap();
            coll.create_index(&spec).unwrap();
            coll.flush().unwrap();
        }

        {
            let store = RocksDbStore::open(dir.path()).unwrap();
            let coll = store.collection("jobs").unwrap();
            assert_eq!(coll.load(&msg.id).unwrap().unwrap(), msg);
            assert_eq!(coll.list_indexes().unwrap(), vec![spec]);
        }
    }

    #[test]
    fn index_name_conflict() {
        let (store, _dir) = test_store();
        let coll = store.collection("jobs").unwrap();
        let spec = IndexSpec {
            name: "idx".to_string(),
            keys: vec![SortKey::asc(fields::PRIORITY)],
        };
        coll.create_index(&spec).unwrap();
        coll.create_index(&spec).unwrap();
        let other = IndexSpec {
            name: "idx".to_string(),
            keys: vec![SortKey::asc(fields::ENQUEUED_AT)],
        };
        assert!(matches!(
            coll.create_index(&other),
            Err(StorageError::IndexConflict { .. })
        ));
        assert_eq!(coll.list_indexes().unwrap().len(), 1);
    }

    fn claim_index() -> IndexSpec {
        IndexSpec {
            name: "priority_1_enqueuedAt_1".to_string(),
            keys: vec![
                SortKey::asc(fields::PRIORITY),
                SortKey::asc(fields::ENQUEUED_AT),
            ],
        }
    }

    fn entry_count(store: &RocksDbStore) -> usize {
        let cf = store.db.cf_handle("jobs.entries").unwrap();
        store.db.iterator_cf(&cf, IteratorMode::Start).count()
    }

    #[test]
    fn entries_follow_document_writes() {
        let (store, _dir) = test_store();
        let coll = store.collection("jobs").unwrap();
        let early = test_message("email", 1.0);
        coll.insert(&early).unwrap();
        coll.create_index(&claim_index()).unwrap();
        assert_eq!(entry_count(&store), 1, "backfill");

        let late = test_message("email", 0.5);
        coll.insert(&late).unwrap();
        assert_eq!(entry_count(&store), 2);

        let bump = Update {
            priority: Some(9.0),
            ..Default::default()
        };
        coll.update_one(&late.id, &bump, None).unwrap();
        assert_eq!(entry_count(&store), 2, "old entry replaced");

        let got = coll
            .find_one_and_update(
                &Filter::all(),
                &claim_index().keys,
                &Update::default(),
                ReturnDocument::Before,
            )
            .unwrap()
            .unwrap();
        assert_eq!(got.id, early.id);

        coll.delete_one(&early.id).unwrap();
        coll.delete_one(&late.id).unwrap();
        assert_eq!(entry_count(&store), 0);
    }

    #[test]
    fn indexed_claims_follow_sort_order() {
        let (store, _dir) = test_store();
        let coll = store.collection("jobs").unwrap();
        coll.create_index(&claim_index()).unwrap();
        let mut expected = Vec::new();
        for (i, priority) in [2.0, -3.5, 0.0, 1e12, -0.0, 7.25].into_iter().enumerate() {
            let mut msg = test_message("email", priority);
            msg.enqueued_at = 1_000 + i as u64;
            coll.insert(&msg).unwrap();
            expected.push(msg);
        }
        // -0.0 and 0.0 compare equal, so enqueue order decides between them
        expected.sort_by(|a, b| {
            a.priority
                .partial_cmp(&b.priority)
                .unwrap()
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });

        let unleased = Filter::field(fields::RUNNING, Comparison::Eq(json!(false)));
        let claim = Update {
            running: Some(true),
            ..Default::default()
        };
        for want in &expected {
            let got = coll
                .find_one_and_update(&unleased, &claim_index().keys, &claim, ReturnDocument::Before)
                .unwrap()
                .unwrap();
            assert_eq!(got.id, want.id);
        }
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let low = test_message("email", 0.0);
        let high = test_message("email", 5.0);
        {
            let store = RocksDbStore::open(dir.path()).unwrap();
            let coll = store.collection("jobs").unwrap();
            coll.create_index(&claim_index()).unwrap();
            coll.insert(&high).unwrap();
            coll.insert(&low).unwrap();
            coll.flush().unwrap();
        }

        let store = RocksDbStore::open(dir.path()).unwrap();
        let coll = store.collection("jobs").unwrap();
        assert_eq!(entry_count(&store), 2);
        let kind = Filter::field("payload.kind", Comparison::Eq(json!("email")));
        assert_eq!(coll.count(&kind).unwrap(), 2);
        let got = coll
            .find_one_and_update(&kind, &claim_index().keys, &Update::default(), ReturnDocument::Before)
            .unwrap()
            .unwrap();
        assert_eq!(got.id, low.id);
    }

    #[test]
    fn array_values_mark_index_multikey() {
        let (store, _dir) = test_store();
        let coll = store.collection("jobs").unwrap();
        coll.create_index(&IndexSpec {
            name: "kind_1".to_string(),
            keys: vec![SortKey::asc("payload.kind")],
        })
        .unwrap();
        let mut tagged = test_message("email", 0.0);
        tagged.payload.insert("kind".to_string(), json!(["email", "sms"]));
        coll.insert(&tagged).unwrap();
        coll.insert(&test_message("email", 0.0)).unwrap();

        assert!(coll.catalog.lock()[0].multikey);
        let email = Filter::field("payload.kind", Comparison::Eq(json!("email")));
        assert_eq!(coll.count(&email).unwrap(), 2);
    }
}
