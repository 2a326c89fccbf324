pub mod config;
pub mod error;
pub mod message;
pub mod query;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use config::DocqConfig;
pub use error::{ConfigError, QueueError, QueueResult, StorageError, StorageResult};
pub use message::{Message, MessageId, Payload};
pub use query::{Condition, Query};
pub use queue::{EnqueueTime, GetOptions, Queue, Schedule};
pub use store::{
    Collection, Comparison, Direction, MemoryCollection, RocksDbCollection, RocksDbStore, SortKey,
};
