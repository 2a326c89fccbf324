use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde_json::{json, Value};
use tracing::debug;

use super::{lease_deadline, Queue};
use crate::error::QueueResult;
use crate::message::{fields, now_ns, Message};
use crate::query::Query;
use crate::store::{Comparison, Filter, ReturnDocument, SortKey, Update};

/// Parameters of a `get` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    /// How long a claimed message stays hidden from other consumers.
    pub lease: Duration,
    /// Total time to keep polling for a claimable message. Zero means a
    /// single attempt.
    pub wait: Duration,
    /// Pause between attempts.
    pub poll: Duration,
}

impl GetOptions {
    pub const DEFAULT_WAIT: Duration = Duration::from_millis(3000);
    pub const DEFAULT_POLL: Duration = Duration::from_millis(200);

    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            wait: Self::DEFAULT_WAIT,
            poll: Self::DEFAULT_POLL,
        }
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }
}

/// Matches messages a consumer may take at `now`: unleased and due, or leased
/// with an expired lease.
fn claimable(now: u64) -> Filter {
    Filter::Or(vec![
        Filter::And(vec![
            Filter::field(fields::RUNNING, Comparison::Eq(Value::Bool(false))),
            Filter::field(fields::EARLIEST_GET, Comparison::Lte(json!(now))),
        ]),
        Filter::And(vec![
            Filter::field(fields::RUNNING, Comparison::Eq(Value::Bool(true))),
            Filter::field(fields::RESET_AT, Comparison::Lte(json!(now))),
        ]),
    ])
}

fn claim_order() -> [SortKey; 2] {
    [
        SortKey::asc(fields::PRIORITY),
        SortKey::asc(fields::ENQUEUED_AT),
    ]
}

impl Queue {
    /// Claim the highest-priority claimable message matching `query`, polling
    /// until one shows up or `opts.wait` has passed.
    ///
    /// The returned message is the document as it was just before the claim.
    /// `Ok(None)` means nothing became claimable in time.
    pub fn get(&self, query: &Query, opts: &GetOptions) -> QueueResult<Option<Message>> {
        self.get_cancellable(query, opts, &crossbeam_channel::never())
    }

    /// Like [`Queue::get`], but gives up early with `Ok(None)` once `cancel`
    /// receives a value or its sender is dropped.
    #[tracing::instrument(
        skip_all,
        fields(queue = %self.name, filtered = !query.is_empty(), lease_ms = opts.lease.as_millis() as u64)
    )]
    pub fn get_cancellable(
        &self,
        query: &Query,
        opts: &GetOptions,
        cancel: &Receiver<()>,
    ) -> QueueResult<Option<Message>> {
        let query_filter = query.to_filter()?;
        // None if the deadline is too far out to represent, i.e. wait forever
        let deadline = Instant::now().checked_add(opts.wait);

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if let Some(message) = self.try_claim(&query_filter, opts.lease)? {
                debug!(msg_id = %message.id, attempts, reclaimed = message.running, "message claimed");
                return Ok(Some(message));
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(attempts, "no claimable message");
                        return Ok(None);
                    }
                    opts.poll.min(deadline - now)
                }
                None => opts.poll,
            };

            match cancel.recv_timeout(pause) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!(attempts, "get cancelled");
                    return Ok(None);
                }
            }
        }
    }

    /// One atomic claim attempt.
    fn try_claim(&self, query_filter: &Filter, lease: Duration) -> QueueResult<Option<Message>> {
        let now = now_ns();
        let filter = Filter::And(vec![query_filter.clone(), claimable(now)]);
        let update = Update {
            running: Some(true),
            reset_at: Some(lease_deadline(now, lease)),
            ..Default::default()
        };
        Ok(self.collection.find_one_and_update(
            &filter,
            &claim_order(),
            &update,
            ReturnDocument::Before,
        )?)
    }
}
