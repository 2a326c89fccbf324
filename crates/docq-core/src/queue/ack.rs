use tracing::{debug, warn};

use super::{EnqueueTime, Queue, Schedule};
use crate::error::{QueueError, QueueResult};
use crate::message::{now_ns, Message, MessageId, Payload, NO_LEASE};
use crate::store::{Update, UpdateOutcome};

fn check_id(id: &MessageId) -> QueueResult<()> {
    if id.is_nil() {
        return Err(QueueError::invalid("message id must not be nil"));
    }
    Ok(())
}

impl Queue {
    /// Remove a message for good. Acknowledging a message that is already
    /// gone is not an error.
    pub fn ack(&self, message: &Message) -> QueueResult<()> {
        self.ack_id(&message.id)
    }

    /// [`Queue::ack`] by id alone.
    #[tracing::instrument(skip_all, fields(queue = %self.name, msg_id = %id))]
    pub fn ack_id(&self, id: &MessageId) -> QueueResult<()> {
        check_id(id)?;
        if self.collection.delete_one(id)? {
            debug!("message acknowledged");
        } else {
            debug!("message already acknowledged");
        }
        Ok(())
    }

    /// Atomically replace a message's payload and schedule and release its
    /// lease, reusing the same id. If the message has vanished it is inserted
    /// again under that id.
    #[tracing::instrument(skip_all, fields(queue = %self.name, msg_id = %message.id))]
    pub fn ack_send(
        &self,
        message: &Message,
        payload: Payload,
        schedule: Schedule,
        enqueue_time: EnqueueTime,
    ) -> QueueResult<()> {
        self.send_back(message, Some(payload), schedule, enqueue_time)
    }

    /// Atomically release a message's lease and give it a new schedule,
    /// keeping the stored payload. If the message has vanished it is inserted
    /// again with the payload carried by `message`.
    #[tracing::instrument(skip_all, fields(queue = %self.name, msg_id = %message.id))]
    pub fn requeue(
        &self,
        message: &Message,
        schedule: Schedule,
        enqueue_time: EnqueueTime,
    ) -> QueueResult<()> {
        self.send_back(message, None, schedule, enqueue_time)
    }

    fn send_back(
        &self,
        message: &Message,
        payload: Option<Payload>,
        schedule: Schedule,
        enqueue_time: EnqueueTime,
    ) -> QueueResult<()> {
        check_id(&message.id)?;
        schedule.validate()?;

        let update = Update {
            payload,
            priority: Some(schedule.priority),
            earliest_get: Some(schedule.earliest_get),
            enqueued_at: match enqueue_time {
                EnqueueTime::Refresh => Some(now_ns()),
                EnqueueTime::Preserve => None,
            },
            running: Some(false),
            reset_at: Some(NO_LEASE),
        };

        match self
            .collection
            .update_one(&message.id, &update, Some(message))?
        {
            UpdateOutcome::Updated => debug!(?enqueue_time, "message sent back"),
            UpdateOutcome::Inserted => warn!("message was missing, inserted it again"),
            UpdateOutcome::Missing => {}
        }
        Ok(())
    }
}
