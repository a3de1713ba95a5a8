use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tower::ServiceExt;

use ytaudio_api::{
    backend::{BackendError, ConversionBackend, ConversionOutput, PerformanceProfile, ProgressSender},
    build_router,
    cache::ResultCache,
    config::{BackendKind, Config, StoreKind},
    models::{TaskRecord, TaskStatus},
    queue::{self, QueueStats},
    store::{KvStore, MemoryKv},
    tasks::TaskManager,
    AppState,
};

const VIDEO_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

type Scripted = Result<ConversionOutput, BackendError>;

/// Backend that plays back a fixed list of outcomes and counts invocations.
struct ScriptedBackend {
    outcomes: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedBackend {
    fn new(outcomes: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        })
    }

    fn slow(outcomes: Vec<Scripted>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn audio_output(title: &str) -> Scripted {
    Ok(ConversionOutput {
        bytes: Bytes::from_static(b"ID3 fake mp3 payload"),
        title: title.to_string(),
    })
}

#[async_trait]
impl ConversionBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn convert(
        &self,
        _video_id: &str,
        _profile: &PerformanceProfile,
        progress: ProgressSender,
    ) -> Result<ConversionOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = progress.send(20).await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let _ = progress.send(60).await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let _ = progress.send(90).await;
        self.outcomes
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Permanent("script exhausted".to_string())))
    }
}

fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        backend: BackendKind::Pipeline,
        store: StoreKind::Memory,
        provider_base_url: "https://provider.invalid".to_string(),
        provider_host: "provider.invalid".to_string(),
        provider_api_key: None,
        ytdlp_bin: "yt-dlp".into(),
        ffmpeg_bin: "ffmpeg".into(),
        task_ttl_seconds: 60,
        cache_ttl_seconds: 60,
        max_retries: 3,
        retry_backoff_ms: 10,
        convert_timeout_seconds: 5,
        provider_request_timeout_seconds: 5,
        max_concurrent: 3,
        queue_capacity: 16,
        sweep_interval_seconds: 60,
    }
}

fn build_app(backend: Arc<dyn ConversionBackend>, config: Config) -> (AppState, Router) {
    let store: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let tasks = TaskManager::new(
        Arc::clone(&store),
        Duration::from_secs(config.task_ttl_seconds),
    );
    let cache = ResultCache::new(
        Arc::clone(&store),
        Duration::from_secs(config.cache_ttl_seconds),
    );
    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
    let state = AppState {
        config,
        store,
        tasks,
        cache,
        backend,
        queue_tx,
        stats: Arc::new(QueueStats::default()),
    };
    queue::spawn_convert_workers(state.clone(), queue_rx);
    (state.clone(), build_router(state))
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("Content-Type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Poll the status endpoint until the task settles. Panics if it never does.
async fn poll_until_terminal(app: &Router, task_id: &str) -> Value {
    for _ in 0..500 {
        let (status, body) = get_json(app, &format!("/api/status/{task_id}")).await;
        assert_eq!(status, StatusCode::OK, "status poll failed: {body}");
        let state = body["status"].as_str().unwrap_or_default().to_string();
        if state == "finished" || state == "error" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached a terminal state");
}

#[tokio::test]
async fn convert_success_end_to_end() {
    let backend = ScriptedBackend::new(vec![audio_output("Test Video Title")]);
    let (_state, app) = build_app(backend.clone(), test_config());

    let (status, body) = post_json(&app, "/api/convert", json!({ "url": VIDEO_URL })).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let terminal = poll_until_terminal(&app, &task_id).await;
    assert_eq!(terminal["status"], "finished");
    assert_eq!(terminal["progress"], 100);
    assert_eq!(
        terminal["file_url"].as_str().unwrap(),
        format!("/api/download/{task_id}")
    );
    assert!(!terminal["title"].as_str().unwrap().is_empty());
    assert!(terminal.get("error").is_none());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/download/{task_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "audio/mpeg"
    );
    let len: u64 = response.headers()["content-length"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(len > 0);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn invalid_url_is_rejected_before_task_creation() {
    let backend = ScriptedBackend::new(vec![]);
    let (_state, app) = build_app(backend.clone(), test_config());

    for bad in ["", "not a url", "https://vimeo.com/123", "https://www.youtube.com/watch?v=bad"] {
        let (status, body) = post_json(&app, "/api/convert", json!({ "url": bad })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "accepted: {bad}");
        assert_eq!(body["error"]["code"], "INVALID_URL");
        assert!(body.get("task_id").is_none());
    }
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn permanent_failure_fails_fast_without_retry() {
    let backend = ScriptedBackend::new(vec![Err(BackendError::Permanent(
        "Video unavailable".to_string(),
    ))]);
    let (_state, app) = build_app(backend.clone(), test_config());

    let (_, body) = post_json(&app, "/api/convert", json!({ "url": VIDEO_URL })).await;
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let terminal = poll_until_terminal(&app, &task_id).await;
    assert_eq!(terminal["status"], "error");
    assert!(terminal["error"].as_str().unwrap().contains("Video unavailable"));
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn transient_errors_are_retried_until_success() {
    let backend = ScriptedBackend::new(vec![
        Err(BackendError::Transient("connection reset".to_string())),
        Err(BackendError::Transient("timed out".to_string())),
        audio_output("Recovered"),
    ]);
    let (_state, app) = build_app(backend.clone(), test_config());

    let (_, body) = post_json(&app, "/api/convert", json!({ "url": VIDEO_URL })).await;
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let terminal = poll_until_terminal(&app, &task_id).await;
    assert_eq!(terminal["status"], "finished", "body: {terminal}");
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn retries_exhaust_into_terminal_error() {
    let backend = ScriptedBackend::new(vec![
        Err(BackendError::Transient("429".to_string())),
        Err(BackendError::Transient("429".to_string())),
        Err(BackendError::Transient("429".to_string())),
        Err(BackendError::Transient("429".to_string())),
    ]);
    let (_state, app) = build_app(backend.clone(), test_config());

    let (_, body) = post_json(&app, "/api/convert", json!({ "url": VIDEO_URL })).await;
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let terminal = poll_until_terminal(&app, &task_id).await;
    assert_eq!(terminal["status"], "error");
    // Initial attempt plus the three-retry bound, no more.
    assert_eq!(backend.calls(), 4);
}

/// The cache entry lands just after the finished state becomes visible; wait
/// for it so the follow-up convert deterministically hits.
async fn wait_for_cache_entry(state: &AppState, url: &str) {
    for _ in 0..200 {
        if state.cache.lookup(url).await.unwrap().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("cache entry for {url} never appeared");
}

#[tokio::test]
async fn second_convert_within_window_hits_cache() {
    let backend = ScriptedBackend::new(vec![audio_output("Cached Title")]);
    let (state, app) = build_app(backend.clone(), test_config());

    let (_, body) = post_json(&app, "/api/convert", json!({ "url": VIDEO_URL })).await;
    let first_id = body["task_id"].as_str().unwrap().to_string();
    poll_until_terminal(&app, &first_id).await;
    wait_for_cache_entry(&state, VIDEO_URL).await;

    // Same video through the short-link form must hit the same cache entry.
    let (status, body) = post_json(
        &app,
        "/api/convert",
        json!({ "url": "https://youtu.be/dQw4w9WgXcQ" }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "finished");
    assert_eq!(body["title"], "Cached Title");
    let second_id = body["task_id"].as_str().unwrap().to_string();
    assert_ne!(first_id, second_id);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/download/{second_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(bytes.as_ref(), b"ID3 fake mp3 payload");

    assert_eq!(backend.calls(), 1, "cache hit must not re-run the backend");
}

#[tokio::test]
async fn retry_on_finished_task_is_a_noop() {
    let backend = ScriptedBackend::new(vec![audio_output("Done")]);
    let (_state, app) = build_app(backend.clone(), test_config());

    let (_, body) = post_json(&app, "/api/convert", json!({ "url": VIDEO_URL })).await;
    let task_id = body["task_id"].as_str().unwrap().to_string();
    poll_until_terminal(&app, &task_id).await;

    let (status, body) = post_json(&app, "/api/retry", json!({ "task_id": task_id })).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].as_str().unwrap().contains("already finished"));
    assert_eq!(body["task"]["status"], "finished");
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn retry_after_error_rechecks_cache_before_backend() {
    let backend = ScriptedBackend::new(vec![audio_output("From Cache")]);
    let (state, app) = build_app(backend.clone(), test_config());

    // First conversion populates the cache.
    let (_, body) = post_json(&app, "/api/convert", json!({ "url": VIDEO_URL })).await;
    let first_id = body["task_id"].as_str().unwrap().to_string();
    poll_until_terminal(&app, &first_id).await;
    wait_for_cache_entry(&state, VIDEO_URL).await;
    assert_eq!(backend.calls(), 1);

    // Seed a failed task for the same URL, as if an earlier attempt died.
    let mut failed = TaskRecord::queued(
        "failed-task".to_string(),
        "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
    );
    failed.status = TaskStatus::Error;
    failed.error = Some("earlier failure".to_string());
    state.tasks.create(&failed).await.unwrap();

    let (status, _) = post_json(&app, "/api/retry", json!({ "task_id": "failed-task" })).await;
    assert_eq!(status, StatusCode::OK);

    let terminal = poll_until_terminal(&app, "failed-task").await;
    assert_eq!(terminal["status"], "finished");
    assert_eq!(terminal["title"], "From Cache");
    assert!(terminal.get("error").is_none(), "stale diagnostic must be cleared");
    assert_eq!(backend.calls(), 1, "retry must be served from the cache");
}

#[tokio::test]
async fn cleanup_forces_stuck_processing_task_to_error() {
    let backend = ScriptedBackend::new(vec![]);
    let (state, app) = build_app(backend, test_config());

    let mut stuck = TaskRecord::queued("stuck-task".to_string(), VIDEO_URL.to_string());
    stuck.status = TaskStatus::Processing;
    stuck.progress = 40;
    state.tasks.create(&stuck).await.unwrap();

    let (status, body) = post_json(&app, "/api/cleanup", json!({ "task_id": "stuck-task" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["new_status"], "error");

    let (_, body) = get_json(&app, "/api/status/stuck-task").await;
    assert_eq!(body["status"], "error");
    assert!(body["error"].as_str().unwrap().to_lowercase().contains("clean"));
}

#[tokio::test]
async fn cleanup_on_settled_task_reports_not_stuck() {
    let backend = ScriptedBackend::new(vec![audio_output("Done")]);
    let (_state, app) = build_app(backend, test_config());

    let (_, body) = post_json(&app, "/api/convert", json!({ "url": VIDEO_URL })).await;
    let task_id = body["task_id"].as_str().unwrap().to_string();
    poll_until_terminal(&app, &task_id).await;

    let (status, body) = post_json(&app, "/api/cleanup", json!({ "task_id": task_id })).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].as_str().unwrap().contains("not stuck"));
    assert_eq!(body["current_status"], "finished");
}

#[tokio::test]
async fn unknown_task_ids_return_not_found() {
    let backend = ScriptedBackend::new(vec![]);
    let (_state, app) = build_app(backend, test_config());

    let (status, body) = get_json(&app, "/api/status/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "TASK_NOT_FOUND");

    let (status, _) = get_json(&app, "/api/download/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post_json(&app, "/api/cleanup", json!({ "task_id": "nope" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post_json(&app, "/api/retry", json!({ "task_id": "nope" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn progress_never_decreases_while_processing() {
    let backend = ScriptedBackend::slow(
        vec![audio_output("Slow One")],
        Duration::from_millis(60),
    );
    let (_state, app) = build_app(backend, test_config());

    let (_, body) = post_json(&app, "/api/convert", json!({ "url": VIDEO_URL })).await;
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let mut samples = Vec::new();
    loop {
        let (_, body) = get_json(&app, &format!("/api/status/{task_id}")).await;
        let progress = body["progress"].as_u64().unwrap_or(0);
        let status = body["status"].as_str().unwrap_or_default().to_string();
        samples.push(progress);
        if status == "finished" || status == "error" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for window in samples.windows(2) {
        assert!(window[1] >= window[0], "progress went backwards: {samples:?}");
    }
    assert_eq!(*samples.last().unwrap(), 100);
}

#[tokio::test]
async fn conversion_timeout_forces_error() {
    let mut config = test_config();
    config.convert_timeout_seconds = 1;
    let backend = ScriptedBackend::slow(
        vec![audio_output("Too Slow")],
        Duration::from_secs(30),
    );
    let (_state, app) = build_app(backend, config);

    let (_, body) = post_json(&app, "/api/convert", json!({ "url": VIDEO_URL })).await;
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let terminal = poll_until_terminal(&app, &task_id).await;
    assert_eq!(terminal["status"], "error");
    assert!(terminal["error"].as_str().unwrap().contains("timed out"));
}

#[tokio::test]
async fn healthz_reports_backend_and_queue() {
    let backend = ScriptedBackend::new(vec![]);
    let (_state, app) = build_app(backend, test_config());

    let (status, body) = get_json(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["backend"], "scripted");
    assert!(body["queue"]["active"].is_u64());
}
