use tracing::debug;

use super::{Queue, Schedule};
use crate::error::QueueResult;
use crate::message::{now_ns, Message, MessageId, Payload, NO_LEASE};

impl Queue {
    /// Insert a new, unleased message. Returns its id.
    #[tracing::instrument(skip_all, fields(queue = %self.name, priority = schedule.priority))]
    pub fn send(&self, payload: Payload, schedule: Schedule) -> QueueResult<MessageId> {
        schedule.validate()?;

        let message = Message {
            id: Message::new_id(),
            payload,
            priority: schedule.priority,
            earliest_get: schedule.earliest_get,
            enqueued_at: now_ns(),
            running: false,
            reset_at: NO_LEASE,
        };
        self.collection.insert(&message)?;

        debug!(msg_id = %message.id, "message sent");
        Ok(message.id)
    }
}
