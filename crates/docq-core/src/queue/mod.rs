//! The queue engine: send, claim, acknowledge and count messages held in a
//! [`Collection`], plus the indexes those operations rely on.
//!
//! All coordination between producers and consumers goes through the
//! collection's atomic operations. The engine itself keeps no shared mutable
//! state, so one `Queue` can be shared freely across threads.

mod ack;
mod claim;
mod count;
mod index;
mod send;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use crate::error::{QueueError, QueueResult};
use crate::message::now_ns;
use crate::store::Collection;

pub use claim::GetOptions;
pub use index::MAX_INDEX_ATTEMPTS;

/// Handle to one queue. Holds the backing collection and its name.
#[derive(Clone)]
pub struct Queue {
    collection: Arc<dyn Collection>,
    name: String,
}

impl Queue {
    pub fn new(collection: Arc<dyn Collection>, name: impl Into<String>) -> Self {
        Self {
            collection,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self) -> &Arc<dyn Collection> {
        &self.collection
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.name).finish()
    }
}

/// When a message becomes eligible and where it sorts.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Schedule {
    /// Nanoseconds since the Unix epoch; 0 means immediately.
    pub earliest_get: u64,
    /// Lower values are claimed first. Must be finite.
    pub priority: f64,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn earliest_get(mut self, earliest_get: u64) -> Self {
        self.earliest_get = earliest_get;
        self
    }

    /// Not claimable until `delay` from now.
    pub fn delay(self, delay: Duration) -> Self {
        let delay_ns = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        self.earliest_get(now_ns().saturating_add(delay_ns))
    }

    pub(crate) fn validate(&self) -> QueueResult<()> {
        // documents are stored as JSON, which has no NaN or infinities
        if !self.priority.is_finite() {
            return Err(QueueError::invalid(format!(
                "priority must be a finite number, got {}",
                self.priority
            )));
        }
        Ok(())
    }
}

/// What happens to `enqueuedAt` when a message is sent back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnqueueTime {
    /// Stamp the current time, sending the message behind its equal-priority peers.
    #[default]
    Refresh,
    /// Keep the stored value, so the message keeps its place.
    Preserve,
}

/// `reset_at` for a lease of `lease` starting at `now`.
pub(crate) fn lease_deadline(now: u64, lease: Duration) -> u64 {
    now.saturating_add(u64::try_from(lease.as_nanos()).unwrap_or(u64::MAX))
}
