pub mod api;
pub mod artifact;
pub mod backend;
pub mod cache;
pub mod config;
pub mod models;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod source_url;
pub mod store;
pub mod tasks;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    backend::ConversionBackend, cache::ResultCache, config::Config, models::ConvertJob,
    queue::QueueStats, store::KvStore, tasks::TaskManager,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn KvStore>,
    pub tasks: TaskManager,
    pub cache: ResultCache,
    pub backend: Arc<dyn ConversionBackend>,
    pub queue_tx: mpsc::Sender<ConvertJob>,
    pub stats: Arc<QueueStats>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/api/convert", post(api::convert))
        .route("/api/status/{task_id}", get(api::task_status))
        .route("/api/download/{task_id}", get(api::download_artifact))
        .route("/api/stream/{task_id}", get(api::stream_artifact))
        .route("/api/cleanup", post(api::cleanup_task))
        .route("/api/retry", post(api::retry_task))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
