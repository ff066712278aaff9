//! Ordin read API: a thin HTTP surface over the mirror.
//!
//! Every read takes one snapshot of the store, so a response never mixes two
//! states and never waits longer than one store lock hold.

#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics::counter;
use ordin_core::{Mirrored, Uid};
use ordin_queue::{PipelineStats, StatsSnapshot};
use ordin_store::MirrorStore;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Errors surfaced to HTTP clients.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{kind} {uid} not found")]
    NotFound { kind: String, uid: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pong {
    pub message: String,
}

/// Pipeline counters plus the mirror's current shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub epoch: u64,
    pub entries: usize,
    pub pipeline: StatsSnapshot,
}

pub struct ApiState<K> {
    pub store: Arc<MirrorStore<K>>,
    pub stats: Arc<PipelineStats>,
}

impl<K> Clone for ApiState<K> {
    fn clone(&self) -> Self { Self { store: self.store.clone(), stats: self.stats.clone() } }
}

impl<K: Mirrored> ApiState<K> {
    pub fn new(store: Arc<MirrorStore<K>>, stats: Arc<PipelineStats>) -> Self { Self { store, stats } }
}

/// Routes: `/ping`, `/stats`, `/<plural>` and `/<plural>/:uid` (e.g. `/deployments`).
pub fn router<K: Mirrored>(state: ApiState<K>) -> Router {
    let plural = K::plural(&());
    Router::new()
        .route("/ping", get(ping))
        .route("/stats", get(stats::<K>))
        .route(&format!("/{}", plural), get(list::<K>))
        .route(&format!("/{}/:uid", plural), get(get_one::<K>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping() -> Json<Pong> { Json(Pong { message: "pong".into() }) }

async fn list<K: Mirrored>(State(state): State<ApiState<K>>) -> Json<Vec<K>> {
    counter!("ordin_api_requests_total", 1, "route" => "list");
    let snap = state.store.snapshot();
    Json(snap.items().cloned().collect())
}

async fn get_one<K: Mirrored>(State(state): State<ApiState<K>>, Path(uid): Path<String>) -> Result<Json<K>, ApiError> {
    counter!("ordin_api_requests_total", 1, "route" => "get");
    let snap = state.store.snapshot();
    match snap.get(&Uid::new(uid.as_str())) {
        Some(entry) => Ok(Json(entry.repr.clone())),
        None => Err(ApiError::NotFound { kind: K::kind(&()).into_owned(), uid }),
    }
}

async fn stats<K: Mirrored>(State(state): State<ApiState<K>>) -> Json<Stats> {
    counter!("ordin_api_requests_total", 1, "route" => "stats");
    let snap = state.store.snapshot();
    Json(Stats { epoch: snap.epoch, entries: snap.len(), pipeline: state.stats.snapshot() })
}

/// Serve `app` on `listener` until `cancel` fires; in-flight requests finish first.
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "read api listening");
    axum::serve(listener, app).with_graceful_shutdown(cancel.cancelled_owned()).await?;
    info!("read api stopped");
    Ok(())
}
