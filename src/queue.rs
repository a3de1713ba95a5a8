use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{mpsc, Semaphore},
    time::{self, Instant},
};
use tracing::{error, info, warn};

use crate::{
    backend::{profile_for_attempt, BackendError, ConversionOutput},
    models::{ConvertJob, TaskPatch, TaskRecord, TaskStatus},
    source_url::{extract_video_id, normalize_url},
    AppState,
};

const STORE_WRITE_ATTEMPTS: u32 = 3;

#[derive(Debug, Default)]
pub struct QueueStats {
    pub active: AtomicUsize,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStatsSnapshot {
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub fn spawn_convert_workers(state: AppState, mut queue_rx: mpsc::Receiver<ConvertJob>) {
    tokio::spawn(async move {
        let permits = Arc::new(Semaphore::new(state.config.max_concurrent.max(1)));
        while let Some(job) = queue_rx.recv().await {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let state = state.clone();
            tokio::spawn(async move {
                info!(task_id = %job.task_id, "Worker picked conversion task");
                state.stats.active.fetch_add(1, Ordering::Relaxed);
                drive_conversion(&state, &job).await;
                state.stats.active.fetch_sub(1, Ordering::Relaxed);
                drop(permit);
            });
        }
    });
}

pub fn spawn_maintenance_worker(state: AppState) {
    tokio::spawn(async move {
        let mut interval =
            time::interval(Duration::from_secs(state.config.sweep_interval_seconds.max(1)));
        loop {
            interval.tick().await;
            match state.store.sweep().await {
                Ok(removed) if removed > 0 => info!(removed, "Swept expired store entries"),
                Ok(_) => {}
                Err(err) => warn!("Store sweep failed: {err:#}"),
            }
            match state.tasks.drop_orphaned_payloads().await {
                Ok(removed) if removed > 0 => {
                    info!(removed, "Dropped artifact payloads for expired tasks")
                }
                Ok(_) => {}
                Err(err) => warn!("Orphaned payload sweep failed: {err:#}"),
            }
        }
    });
}

/// Drive one task through the state machine. Every exit path leaves the task
/// either terminal or expired; nothing here can take the process down.
async fn drive_conversion(state: &AppState, job: &ConvertJob) {
    let view = match state.tasks.get(&job.task_id).await {
        Ok(Some(view)) => view,
        Ok(None) => {
            warn!(task_id = %job.task_id, "Task expired before the worker picked it up");
            return;
        }
        Err(err) => {
            error!(task_id = %job.task_id, "Task store unreachable at pickup: {err:#}");
            return;
        }
    };
    if view.record.status.is_terminal() {
        info!(task_id = %job.task_id, "Skipping task already in a terminal state");
        return;
    }

    update_task(
        state,
        &job.task_id,
        TaskPatch {
            status: Some(TaskStatus::Processing),
            progress: Some(10),
            ..Default::default()
        },
    )
    .await;

    let Some(video_id) = extract_video_id(&job.source_url) else {
        settle_error(state, &job.task_id, "Cannot extract video id from URL".to_string()).await;
        return;
    };
    let normalized = normalize_url(&video_id);

    // A retry must re-check the cache before touching the backend.
    match state.cache.lookup(&normalized).await {
        Ok(Some(hit)) => {
            if state.tasks.alias_payload(&hit.task_id, &job.task_id).await {
                info!(task_id = %job.task_id, source = %hit.task_id, "Result cache hit");
                settle_finished(state, job, &normalized, &hit.title, None).await;
                return;
            }
            // Bytes already evicted: the entry is useless, fall through.
        }
        Ok(None) => {}
        Err(err) => warn!(task_id = %job.task_id, "Result cache lookup failed: {err:#}"),
    }

    let deadline = Instant::now() + Duration::from_secs(state.config.convert_timeout_seconds);
    let max_attempts = state.config.max_retries + 1;
    let mut last_error: Option<BackendError> = None;
    let mut outcome: Option<ConversionOutput> = None;

    for attempt in 0..max_attempts {
        if attempt > 0 {
            // Strictly escalating backoff between attempts.
            let delay = Duration::from_millis(state.config.retry_backoff_ms * u64::from(attempt));
            if Instant::now() + delay >= deadline {
                break;
            }
            info!(
                task_id = %job.task_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Backing off before retry"
            );
            time::sleep(delay).await;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let profile = profile_for_attempt(attempt);
        let (progress_tx, progress_rx) = mpsc::channel(16);
        let forwarder = tokio::spawn(forward_progress(
            state.clone(),
            job.task_id.clone(),
            progress_rx,
        ));

        info!(
            task_id = %job.task_id,
            attempt,
            profile = profile.name,
            backend = state.backend.name(),
            "Starting conversion attempt"
        );

        let result = time::timeout(
            remaining,
            state.backend.convert(&video_id, &profile, progress_tx),
        )
        .await;
        let _ = forwarder.await;

        match result {
            Ok(Ok(output)) => {
                outcome = Some(output);
                break;
            }
            Ok(Err(err)) => {
                warn!(task_id = %job.task_id, attempt, "Conversion attempt failed: {err}");
                let retryable = err.is_retryable();
                last_error = Some(err);
                if !retryable {
                    break;
                }
            }
            Err(_) => {
                // The in-flight call is dropped with the timeout; whatever it
                // was doing must not resurrect this task later.
                last_error = Some(BackendError::Transient(format!(
                    "conversion timed out after {}s",
                    state.config.convert_timeout_seconds
                )));
                break;
            }
        }
    }

    match outcome {
        Some(output) => {
            let title = output.title.clone();
            settle_finished(state, job, &normalized, &title, Some(output)).await;
        }
        None => {
            let message = last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "conversion failed before any attempt could run".to_string());
            settle_error(state, &job.task_id, message).await;
        }
    }
}

/// Write the finished state, guarded against a terminal state that landed
/// while the backend was running (manual cleanup, timeout race).
async fn settle_finished(
    state: &AppState,
    job: &ConvertJob,
    normalized_url: &str,
    title: &str,
    output: Option<ConversionOutput>,
) {
    if !still_live(state, &job.task_id).await {
        return;
    }

    let patch = TaskPatch {
        status: Some(TaskStatus::Finished),
        progress: Some(100),
        title: Some(title.to_string()),
        file_url: Some(format!("/api/download/{}", job.task_id)),
        clear_error: true,
        artifact_bytes: output.map(|o| o.bytes),
        ..Default::default()
    };
    if update_task(state, &job.task_id, patch).await.is_some() {
        state.stats.completed.fetch_add(1, Ordering::Relaxed);
        info!(task_id = %job.task_id, title = %title, "Conversion task finished");
        if let Err(err) = state.cache.store(normalized_url, &job.task_id, title).await {
            warn!(task_id = %job.task_id, "Failed to record result cache entry: {err:#}");
        }
    }
}

async fn settle_error(state: &AppState, task_id: &str, message: String) {
    if !still_live(state, task_id).await {
        return;
    }
    let patch = TaskPatch {
        status: Some(TaskStatus::Error),
        error: Some(message.clone()),
        ..Default::default()
    };
    if update_task(state, task_id, patch).await.is_some() {
        state.stats.failed.fetch_add(1, Ordering::Relaxed);
        info!(task_id = %task_id, error = %message, "Conversion task failed");
    }
}

/// True while the task exists and is not terminal. Terminal states are never
/// overwritten, even by a late-finishing backend call.
async fn still_live(state: &AppState, task_id: &str) -> bool {
    match state.tasks.get(task_id).await {
        Ok(Some(view)) if !view.record.status.is_terminal() => true,
        Ok(Some(_)) => {
            info!(task_id = %task_id, "Task reached a terminal state elsewhere; not overwriting");
            false
        }
        Ok(None) => {
            warn!(task_id = %task_id, "Task expired mid-conversion; dropping result");
            false
        }
        Err(err) => {
            error!(task_id = %task_id, "Task store unreachable at settle: {err:#}");
            false
        }
    }
}

/// Apply a patch with a small bounded retry against store hiccups. A final
/// failure is logged and swallowed; the request path must never crash over a
/// state write.
async fn update_task(state: &AppState, task_id: &str, patch: TaskPatch) -> Option<TaskRecord> {
    for attempt in 1..=STORE_WRITE_ATTEMPTS {
        match state.tasks.update(task_id, patch.clone()).await {
            Ok(result) => return result,
            Err(err) if attempt < STORE_WRITE_ATTEMPTS => {
                warn!(task_id = %task_id, attempt, "Task store write failed, retrying: {err:#}");
                time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
            Err(err) => {
                error!(task_id = %task_id, "Giving up on task store write: {err:#}");
            }
        }
    }
    None
}

/// Relay advisory progress checkpoints into the durable record. Progress is
/// clamped below 100 and never moves backwards; terminal records are left
/// alone.
async fn forward_progress(state: AppState, task_id: String, mut rx: mpsc::Receiver<u8>) {
    let mut last = 0u8;
    while let Some(pct) = rx.recv().await {
        let pct = pct.min(99);
        if pct <= last {
            continue;
        }
        match state.tasks.get(&task_id).await {
            Ok(Some(view)) => {
                if view.record.status.is_terminal() {
                    break;
                }
                if view.record.progress >= pct {
                    last = view.record.progress;
                    continue;
                }
                last = pct;
                if let Err(err) = state
                    .tasks
                    .update(
                        &task_id,
                        TaskPatch {
                            progress: Some(pct),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    warn!(task_id = %task_id, "Progress checkpoint write failed: {err:#}");
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(task_id = %task_id, "Progress checkpoint read failed: {err:#}");
            }
        }
    }
}
