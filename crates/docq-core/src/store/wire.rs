//! Request and response bodies for serving a [`Collection`](super::Collection)
//! over HTTP. Shared by `docq-server` and `docq-client` so both sides agree on
//! the JSON shapes.

use serde::{Deserialize, Serialize};

use super::{Filter, ReturnDocument, SortKey, Update};
use crate::message::Message;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindOneAndUpdateRequest {
    pub filter: Filter,
    pub sort: Vec<SortKey>,
    pub update: Update,
    pub returning: ReturnDocument,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOneRequest {
    pub update: Update,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upsert: Option<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Comparison;
    use serde_json::json;

    #[test]
    fn claim_request_json_shape() {
        let request = FindOneAndUpdateRequest {
            filter: Filter::And(vec![Filter::field(
                "running",
                Comparison::Eq(json!(false)),
            )]),
            sort: vec![SortKey::asc("priority")],
            update: Update {
                running: Some(true),
                ..Default::default()
            },
            returning: ReturnDocument::Before,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "filter": { "and": [{ "field": { "path": "running", "cmp": { "eq": false } } }] },
                "sort": [{ "path": "priority", "direction": "ascending" }],
                "update": {
                    "payload": null,
                    "priority": null,
                    "earliestGet": null,
                    "enqueuedAt": null,
                    "running": true,
                    "resetAt": null
                },
                "returning": "before"
            })
        );
        let back: FindOneAndUpdateRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn update_request_defaults_missing_fields() {
        let request: UpdateOneRequest =
            serde_json::from_value(json!({ "update": { "priority": 2.5 } })).unwrap();
        assert_eq!(request.update.priority, Some(2.5));
        assert_eq!(request.update.running, None);
        assert!(request.upsert.is_none());
    }
}
