use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identifier of a stored message. Assigned once on insert and never reused.
pub type MessageId = Uuid;

/// Application-defined message body. Opaque to the engine.
pub type Payload = Map<String, Value>;

/// Document field names as they appear in the stored form.
pub mod fields {
    pub const ID: &str = "id";
    pub const PAYLOAD: &str = "payload";
    pub const PRIORITY: &str = "priority";
    pub const EARLIEST_GET: &str = "earliestGet";
    pub const ENQUEUED_AT: &str = "enqueuedAt";
    pub const RUNNING: &str = "running";
    pub const RESET_AT: &str = "resetAt";
}

/// Value of `reset_at` for a message nobody holds a lease on.
pub const NO_LEASE: u64 = u64::MAX;

/// A queued message. This is both the stored document and what `get` hands
/// back to consumers. All timestamps are nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub payload: Payload,
    /// Lower values are dequeued first. Always finite.
    pub priority: f64,
    pub earliest_get: u64,
    pub enqueued_at: u64,
    pub running: bool,
    pub reset_at: u64,
}

impl Message {
    /// Generate a new UUIDv7 message ID.
    pub fn new_id() -> MessageId {
        Uuid::now_v7()
    }

    /// True if a `get` issued at `now_ns` may claim this message.
    pub fn is_claimable(&self, now_ns: u64) -> bool {
        if self.running {
            self.reset_at <= now_ns
        } else {
            self.earliest_get <= now_ns
        }
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
