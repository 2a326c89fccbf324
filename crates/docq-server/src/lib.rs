//! HTTP front for a [`RocksDbStore`].
//!
//! RocksDB locks its directory to a single process, so one `docq-server`
//! owns the store and every other process reaches its collections through
//! `docq-client`. Each route is one [`Collection`] call, so the atomicity of
//! `find_one_and_update` carries over the wire unchanged.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use docq_core::store::wire::{
    CountResponse, DeleteResponse, FindOneAndUpdateRequest, UpdateOneRequest,
};
use docq_core::store::{Collection, Filter, IndexSpec, UpdateOutcome};
use docq_core::{Message, MessageId, RocksDbCollection, RocksDbStore, StorageError, StorageResult};
use tracing::{debug, warn};

/// A store error on its way back to a client. The body is the error itself
/// as JSON so the client can rebuild it.
#[derive(Debug)]
pub struct ApiError(pub StorageError);

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StorageError::InvalidCollectionName(_) => StatusCode::BAD_REQUEST,
            StorageError::DuplicateId(_) | StorageError::IndexConflict { .. } => {
                StatusCode::CONFLICT
            }
            StorageError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        } else {
            debug!(error = %self.0, "request rejected");
        }
        (status, Json(self.0)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run one blocking store call against collection `name` off the async
/// runtime.
async fn with_collection<T, F>(
    store: Arc<RocksDbStore>,
    name: String,
    op: F,
) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&RocksDbCollection) -> StorageResult<T> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || {
        let collection = store.collection(&name)?;
        op(&collection)
    })
    .await
    .map_err(|e| StorageError::Unavailable(format!("store task failed: {e}")))?;
    Ok(result?)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn insert(
    State(store): State<Arc<RocksDbStore>>,
    Path(name): Path<String>,
    Json(message): Json<Message>,
) -> Result<StatusCode, ApiError> {
    with_collection(store, name, move |c| c.insert(&message)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn find_one_and_update(
    State(store): State<Arc<RocksDbStore>>,
    Path(name): Path<String>,
    Json(req): Json<FindOneAndUpdateRequest>,
) -> ApiResult<Option<Message>> {
    with_collection(store, name, move |c| {
        c.find_one_and_update(&req.filter, &req.sort, &req.update, req.returning)
    })
    .await
    .map(Json)
}

async fn update_one(
    State(store): State<Arc<RocksDbStore>>,
    Path((name, id)): Path<(String, MessageId)>,
    Json(req): Json<UpdateOneRequest>,
) -> ApiResult<UpdateOutcome> {
    with_collection(store, name, move |c| {
        c.update_one(&id, &req.update, req.upsert.as_ref())
    })
    .await
    .map(Json)
}

async fn delete_one(
    State(store): State<Arc<RocksDbStore>>,
    Path((name, id)): Path<(String, MessageId)>,
) -> ApiResult<DeleteResponse> {
    let deleted = with_collection(store, name, move |c| c.delete_one(&id)).await?;
    Ok(Json(DeleteResponse { deleted }))
}

async fn count(
    State(store): State<Arc<RocksDbStore>>,
    Path(name): Path<String>,
    Json(filter): Json<Filter>,
) -> ApiResult<CountResponse> {
    let count = with_collection(store, name, move |c| c.count(&filter)).await?;
    Ok(Json(CountResponse { count }))
}

async fn create_index(
    State(store): State<Arc<RocksDbStore>>,
    Path(name): Path<String>,
    Json(spec): Json<IndexSpec>,
) -> Result<StatusCode, ApiError> {
    with_collection(store, name, move |c| c.create_index(&spec)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_indexes(
    State(store): State<Arc<RocksDbStore>>,
    Path(name): Path<String>,
) -> ApiResult<Vec<IndexSpec>> {
    with_collection(store, name, |c| c.list_indexes())
        .await
        .map(Json)
}

async fn flush(
    State(store): State<Arc<RocksDbStore>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    with_collection(store, name, |c| c.flush()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Routes for every collection in `store`.
pub fn router(store: Arc<RocksDbStore>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/collections/{name}/documents", post(insert))
        .route(
            "/collections/{name}/documents/{id}",
            patch(update_one).delete(delete_one),
        )
        .route(
            "/collections/{name}/find-one-and-update",
            post(find_one_and_update),
        )
        .route("/collections/{name}/count", post(count))
        .route(
            "/collections/{name}/indexes",
            get(list_indexes).post(create_index),
        )
        .route("/collections/{name}/flush", post(flush))
        .with_state(store)
}

/// Serve `store` on `listener` until `shutdown` completes.
pub async fn serve(
    listener: tokio::net::TcpListener,
    store: Arc<RocksDbStore>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await
}
