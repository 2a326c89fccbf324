use serde_json::Value;

use super::Queue;
use crate::error::QueueResult;
use crate::message::fields;
use crate::query::Query;
use crate::store::{Comparison, Filter};

impl Queue {
    /// Count messages matching `query`. `running` restricts to leased
    /// (`Some(true)`) or unleased (`Some(false)`) messages; `None` counts both.
    #[tracing::instrument(skip_all, fields(queue = %self.name, running = ?running))]
    pub fn count(&self, query: &Query, running: Option<bool>) -> QueueResult<u64> {
        let query_filter = query.to_filter()?;
        let filter = match running {
            Some(running) => Filter::And(vec![
                query_filter,
                Filter::field(fields::RUNNING, Comparison::Eq(Value::Bool(running))),
            ]),
            None => query_filter,
        };
        Ok(self.collection.count(&filter)?)
    }
}
