//! Several independent client handles working one store through a server.

use std::collections::HashSet;
use std::net::TcpListener as StdListener;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use docq_client::RemoteCollection;
use docq_core::store::{Collection, IndexSpec, SortKey};
use docq_core::{GetOptions, Message, Payload, Query, Queue, RocksDbStore, Schedule, StorageError};
use serde_json::json;

/// A server on an ephemeral port, running until dropped.
struct TestServer {
    addr: String,
    _runtime: tokio::runtime::Runtime,
    _dir: tempfile::TempDir,
}

fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RocksDbStore::open(dir.path()).unwrap());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let listener = runtime
        .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
        .unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    runtime.spawn(docq_server::serve(listener, store, std::future::pending()));
    TestServer {
        addr,
        _runtime: runtime,
        _dir: dir,
    }
}

/// A queue over its own client handle, as a separate process would have.
fn remote_queue(server: &TestServer, collection: &str) -> Queue {
    let remote = RemoteCollection::new(&server.addr, collection).unwrap();
    Queue::new(Arc::new(remote), collection)
}

fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("payload must be an object, got {other}"),
    }
}

fn no_wait() -> GetOptions {
    GetOptions::new(Duration::from_secs(60)).wait(Duration::ZERO)
}

#[test]
fn producer_and_consumer_handles_share_messages() {
    let server = start_server();
    let producer = remote_queue(&server, "jobs");
    let consumer = remote_queue(&server, "jobs");

    let mut sent = Vec::new();
    for i in 0..10 {
        let id = producer
            .send(payload(json!({ "n": i })), Schedule::new().priority(f64::from(10 - i)))
            .unwrap();
        sent.push(id);
    }
    assert_eq!(consumer.count(&Query::new(), None).unwrap(), 10);

    // lowest priority value first, i.e. the last one sent
    let first = consumer.get(&Query::new(), &no_wait()).unwrap().unwrap();
    assert_eq!(first.id, sent[9]);
    assert_eq!(producer.count(&Query::new(), Some(true)).unwrap(), 1);

    consumer.ack(&first).unwrap();
    while let Some(msg) = consumer.get(&Query::new(), &no_wait()).unwrap() {
        consumer.ack(&msg).unwrap();
    }
    assert_eq!(producer.count(&Query::new(), None).unwrap(), 0);
}

#[test]
fn waiting_consumer_sees_a_later_send() {
    let server = start_server();
    let producer = remote_queue(&server, "jobs");
    let consumer = remote_queue(&server, "jobs");

    let waiter = thread::spawn(move || {
        let opts = GetOptions::new(Duration::from_secs(60))
            .wait(Duration::from_secs(5))
            .poll(Duration::from_millis(20));
        consumer.get(&Query::new(), &opts).unwrap()
    });
    thread::sleep(Duration::from_millis(100));
    let id = producer
        .send(payload(json!({ "late": true })), Schedule::new())
        .unwrap();

    let got = waiter.join().unwrap().expect("message should arrive while waiting");
    assert_eq!(got.id, id);
}

#[test]
fn concurrent_remote_consumers_never_share_a_message() {
    let server = start_server();
    let producer = remote_queue(&server, "jobs");
    producer.ensure_get_index(&[], &[]).unwrap();
    for i in 0..120 {
        producer
            .send(payload(json!({ "n": i })), Schedule::new().priority(f64::from(i % 4)))
            .unwrap();
    }

    let claimed = Arc::new(Mutex::new(Vec::new()));
    let workers: Vec<_> = (0..6)
        .map(|_| {
            let queue = remote_queue(&server, "jobs");
            let claimed = Arc::clone(&claimed);
            thread::spawn(move || {
                while let Some(msg) = queue.get(&Query::new(), &no_wait()).unwrap() {
                    claimed.lock().unwrap().push(msg.id);
                    queue.ack(&msg).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let claimed = claimed.lock().unwrap();
    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(claimed.len(), 120);
    assert_eq!(unique.len(), 120, "a message was claimed twice");
}

#[test]
fn store_errors_cross_the_wire() {
    let server = start_server();
    let remote = RemoteCollection::new(&server.addr, "jobs").unwrap();
    let msg = Message {
        id: Message::new_id(),
        payload: Payload::new(),
        priority: 0.0,
        earliest_get: 0,
        enqueued_at: 1,
        running: false,
        reset_at: docq_core::message::NO_LEASE,
    };
    remote.insert(&msg).unwrap();
    assert_eq!(
        remote.insert(&msg).unwrap_err(),
        StorageError::DuplicateId(msg.id)
    );

    let spec = IndexSpec {
        name: "idx".to_string(),
        keys: vec![SortKey::asc("priority")],
    };
    remote.create_index(&spec).unwrap();
    let clash = IndexSpec {
        name: "idx".to_string(),
        keys: vec![SortKey::asc("enqueuedAt")],
    };
    assert_eq!(
        remote.create_index(&clash).unwrap_err(),
        StorageError::IndexConflict {
            name: "idx".to_string()
        }
    );
    assert_eq!(remote.list_indexes().unwrap(), vec![spec]);

    let reserved = RemoteCollection::new(&server.addr, "jobs.entries").unwrap();
    assert_eq!(
        reserved.count(&docq_core::store::Filter::all()).unwrap_err(),
        StorageError::InvalidCollectionName("jobs.entries".to_string())
    );
}

#[test]
fn healthz_answers() {
    let server = start_server();
    let body = reqwest::blocking::get(format!("{}/healthz", server.addr))
        .unwrap()
        .text()
        .unwrap();
    assert_eq!(body, "ok");
}

/// The `docq-server` binary, killed on drop.
struct ServerProcess(Child);

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_server_process(dir: &Path) -> (ServerProcess, String) {
    let port = StdListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let config = dir.join("docq.toml");
    std::fs::write(
        &config,
        format!(
            "[storage]\ndata_dir = {:?}\n\n[server]\nlisten_addr = \"127.0.0.1:{port}\"\n",
            dir.join("data").display().to_string()
        ),
    )
    .unwrap();

    let child = Command::new(env!("CARGO_BIN_EXE_docq-server"))
        .arg("--config")
        .arg(&config)
        .env_remove("DOCQ_DATA_DIR")
        .env("RUST_LOG", "warn")
        .spawn()
        .unwrap();
    let process = ServerProcess(child);

    let addr = format!("http://127.0.0.1:{port}");
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        if reqwest::blocking::get(format!("{addr}/healthz")).is_ok_and(|r| r.status().is_success())
        {
            break;
        }
        assert!(Instant::now() < deadline, "docq-server did not come up");
        thread::sleep(Duration::from_millis(50));
    }
    (process, addr)
}

#[test]
fn server_process_owns_the_store_for_every_client() {
    let dir = tempfile::tempdir().unwrap();
    let (_server, addr) = spawn_server_process(dir.path());

    // a second direct open of the data dir is exactly what the server avoids
    assert!(RocksDbStore::open(dir.path().join("data")).is_err());

    let producer = Queue::new(
        Arc::new(RemoteCollection::new(&addr, "jobs").unwrap()),
        "jobs",
    );
    let consumer = Queue::new(
        Arc::new(RemoteCollection::new(&addr, "jobs").unwrap()),
        "jobs",
    );
    let id = producer
        .send(payload(json!({ "kind": "email" })), Schedule::new())
        .unwrap();
    let got = consumer
        .get(&Query::new().eq("kind", "email"), &no_wait())
        .unwrap()
        .unwrap();
    assert_eq!(got.id, id);
    consumer.ack(&got).unwrap();
    assert_eq!(producer.count(&Query::new(), None).unwrap(), 0);
}
