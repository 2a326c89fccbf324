use super::*;

/// Queue over a fresh RocksDB store in a temp dir.
pub(super) fn test_queue() -> (Queue, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksDbStore::open(dir.path()).unwrap();
    let collection = store.collection("messages").unwrap();
    (Queue::new(Arc::new(collection), "messages"), dir)
}

/// Queue over an in-memory collection.
pub(super) fn memory_queue() -> Queue {
    Queue::new(Arc::new(MemoryCollection::new()), "messages")
}

/// Build a payload from a JSON object literal.
pub(super) fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("payload must be an object, got {other}"),
    }
}

/// Single attempt, no waiting.
pub(super) fn no_wait(lease: Duration) -> GetOptions {
    GetOptions::new(lease).wait(Duration::ZERO)
}

/// Claim with a 60s lease and no wait.
pub(super) fn get_now(queue: &Queue, query: &Query) -> Option<Message> {
    queue
        .get(query, &no_wait(Duration::from_secs(60)))
        .unwrap()
}

/// Make sure consecutive sends get distinct enqueue timestamps.
pub(super) fn tick() {
    thread::sleep(Duration::from_millis(2));
}
