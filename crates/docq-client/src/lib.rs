//! Blocking client for collections served by `docq-server`.
//!
//! [`RemoteCollection`] implements [`Collection`], so a
//! [`Queue`](docq_core::Queue) runs unchanged on top of it: the poll loop
//! stays in the calling process and every store operation is one request.
//! Any number of processes can hold handles to the same collection.

use std::time::Duration;

use docq_core::store::wire::{
    CountResponse, DeleteResponse, FindOneAndUpdateRequest, UpdateOneRequest,
};
use docq_core::store::{
    Collection, Filter, IndexSpec, ReturnDocument, SortKey, Update, UpdateOutcome,
};
use docq_core::{Message, MessageId, StorageError, StorageResult};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::Url;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Per-request timeout. Store calls never block on the server side, so this
/// only trips on a stuck server or network.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn transport(err: reqwest::Error) -> StorageError {
    StorageError::Unavailable(err.to_string())
}

/// Handle to one collection on a `docq-server`.
#[derive(Debug, Clone)]
pub struct RemoteCollection {
    http: Client,
    base: Url,
    collection: String,
}

impl RemoteCollection {
    /// `addr` is the server's base URL, e.g. `http://127.0.0.1:5580`.
    pub fn new(addr: &str, collection: impl Into<String>) -> StorageResult<Self> {
        let base = Url::parse(addr).map_err(|e| {
            StorageError::Unavailable(format!("invalid server address {addr:?}: {e}"))
        })?;
        if base.cannot_be_a_base() {
            return Err(StorageError::Unavailable(format!(
                "invalid server address {addr:?}"
            )));
        }
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(transport)?;
        Ok(Self {
            http,
            base,
            collection: collection.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.collection
    }

    /// URL of `/collections/<name>/<segments...>`, each segment escaped.
    fn url(&self, segments: &[&str]) -> StorageResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| {
                StorageError::Unavailable(format!("invalid server address {}", self.base))
            })?
            .pop_if_empty()
            .extend(["collections", self.collection.as_str()])
            .extend(segments);
        Ok(url)
    }

    /// Send `request` and decode a JSON body, or rebuild the server's error.
    fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> StorageResult<T> {
        let body = self.execute(request)?;
        Ok(serde_json::from_str(&body)?)
    }

    fn execute(&self, request: RequestBuilder) -> StorageResult<String> {
        let response = request.send().map_err(transport)?;
        let status = response.status();
        let body = response.text().map_err(transport)?;
        if status.is_success() {
            return Ok(body);
        }
        debug!(collection = %self.collection, %status, "server returned an error");
        Err(serde_json::from_str::<StorageError>(&body).unwrap_or_else(|_| {
            StorageError::Unavailable(format!("server returned {status}: {body}"))
        }))
    }
}

impl Collection for RemoteCollection {
    fn insert(&self, message: &Message) -> StorageResult<()> {
        let url = self.url(&["documents"])?;
        self.execute(self.http.post(url).json(message))?;
        Ok(())
    }

    fn find_one_and_update(
        &self,
        filter: &Filter,
        sort: &[SortKey],
        update: &Update,
        returning: ReturnDocument,
    ) -> StorageResult<Option<Message>> {
        let url = self.url(&["find-one-and-update"])?;
        let request = FindOneAndUpdateRequest {
            filter: filter.clone(),
            sort: sort.to_vec(),
            update: update.clone(),
            returning,
        };
        self.call(self.http.post(url).json(&request))
    }

    fn update_one(
        &self,
        id: &MessageId,
        update: &Update,
        upsert: Option<&Message>,
    ) -> StorageResult<UpdateOutcome> {
        let id = id.to_string();
        let url = self.url(&["documents", id.as_str()])?;
        let request = UpdateOneRequest {
            update: update.clone(),
            upsert: upsert.cloned(),
        };
        self.call(self.http.patch(url).json(&request))
    }

    fn delete_one(&self, id: &MessageId) -> StorageResult<bool> {
        let id = id.to_string();
        let url = self.url(&["documents", id.as_str()])?;
        let response: DeleteResponse = self.call(self.http.delete(url))?;
        Ok(response.deleted)
    }

    fn count(&self, filter: &Filter) -> StorageResult<u64> {
        let url = self.url(&["count"])?;
        let response: CountResponse = self.call(self.http.post(url).json(filter))?;
        Ok(response.count)
    }

    fn create_index(&self, spec: &IndexSpec) -> StorageResult<()> {
        let url = self.url(&["indexes"])?;
        self.execute(self.http.post(url).json(spec))?;
        Ok(())
    }

    fn list_indexes(&self) -> StorageResult<Vec<IndexSpec>> {
        let url = self.url(&["indexes"])?;
        self.call(self.http.get(url))
    }

    fn flush(&self) -> StorageResult<()> {
        let url = self.url(&["flush"])?;
        self.execute(self.http.post(url))?;
        Ok(())
    }
}
