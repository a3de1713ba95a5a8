use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;

use ytaudio_api::{
    backend::ConversionBackend,
    build_router,
    cache::ResultCache,
    config::{BackendKind, Config, StoreKind},
    pipeline::SubprocessPipelineBackend,
    provider::RemoteProviderBackend,
    queue::{self, QueueStats},
    store::{KvStore, MemoryKv, SqliteKv},
    tasks::TaskManager,
    AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ytaudio_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn KvStore> = match &config.store {
        StoreKind::Memory => Arc::new(MemoryKv::new()),
        StoreKind::Sqlite(path) => Arc::new(SqliteKv::open(path)?),
    };

    let tasks = TaskManager::new(
        Arc::clone(&store),
        Duration::from_secs(config.task_ttl_seconds),
    );
    let cache = ResultCache::new(
        Arc::clone(&store),
        Duration::from_secs(config.cache_ttl_seconds),
    );

    let backend: Arc<dyn ConversionBackend> = match config.backend {
        BackendKind::Remote => Arc::new(RemoteProviderBackend::new(
            config.provider_base_url.clone(),
            config.provider_host.clone(),
            config.provider_api_key.clone(),
            Duration::from_secs(config.provider_request_timeout_seconds),
        )?),
        BackendKind::Pipeline => Arc::new(SubprocessPipelineBackend::new(
            config.ytdlp_bin.clone(),
            config.ffmpeg_bin.clone(),
        )),
    };

    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
    let state = AppState {
        config: config.clone(),
        store,
        tasks,
        cache,
        backend,
        queue_tx,
        stats: Arc::new(QueueStats::default()),
    };

    queue::spawn_convert_workers(state.clone(), queue_rx);
    queue::spawn_maintenance_worker(state.clone());

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        "ytaudio-api listening on {} ({} backend)",
        config.bind_addr,
        config.backend.as_str()
    );
    axum::serve(listener, app).await?;
    Ok(())
}
