use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::{
    artifact::artifact_response,
    models::{
        ConvertAcceptedResponse, ConvertJob, ConvertRequest, TaskIdRequest, TaskPatch, TaskRecord,
        TaskStatus,
    },
    source_url::{extract_video_id, normalize_url},
    AppState,
};

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let queued = state
        .queue_tx
        .max_capacity()
        .saturating_sub(state.queue_tx.capacity());
    Json(json!({
        "ok": true,
        "timestamp": Utc::now(),
        "backend": state.backend.name(),
        "queued": queued,
        "queue": state.stats.snapshot(),
    }))
}

pub async fn convert(
    State(state): State<AppState>,
    Json(payload): Json<ConvertRequest>,
) -> impl IntoResponse {
    let Some(video_id) = extract_video_id(&payload.url) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_URL",
            "Not a recognizable YouTube video URL.",
        );
    };
    let normalized = normalize_url(&video_id);
    let task_id = Uuid::new_v4().to_string();

    // A cache hit short-circuits dispatch entirely: the task is born
    // finished and the client protocol stays create → poll → download.
    match state.cache.lookup(&normalized).await {
        Ok(Some(hit)) => {
            if state.tasks.alias_payload(&hit.task_id, &task_id).await {
                let mut record = TaskRecord::queued(task_id.clone(), normalized.clone());
                record.status = TaskStatus::Finished;
                record.progress = 100;
                record.title = Some(hit.title.clone());
                record.file_url = Some(format!("/api/download/{task_id}"));

                if let Err(err) = state.tasks.create(&record).await {
                    return store_unavailable(err);
                }
                return (
                    StatusCode::ACCEPTED,
                    Json(ConvertAcceptedResponse {
                        task_id,
                        status: TaskStatus::Finished,
                        message: "Served from result cache.".to_string(),
                        title: record.title,
                        file_url: record.file_url,
                    }),
                )
                    .into_response();
            }
        }
        Ok(None) => {}
        Err(err) => warn!("Result cache lookup failed during convert: {err:#}"),
    }

    let record = TaskRecord::queued(task_id.clone(), normalized.clone());
    if let Err(err) = state.tasks.create(&record).await {
        return store_unavailable(err);
    }

    let job = ConvertJob {
        task_id: task_id.clone(),
        source_url: normalized,
    };
    if state.queue_tx.send(job).await.is_err() {
        if let Err(err) = state.tasks.delete(&task_id).await {
            warn!(task_id = %task_id, "Failed to remove task after dispatch failure: {err:#}");
        }
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "QUEUE_UNAVAILABLE",
            "Conversion queue is unavailable.",
        );
    }

    (
        StatusCode::ACCEPTED,
        Json(ConvertAcceptedResponse {
            task_id,
            status: TaskStatus::Queued,
            message: "Conversion queued.".to_string(),
            title: None,
            file_url: None,
        }),
    )
        .into_response()
}

pub async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match state.tasks.get(&task_id).await {
        Ok(Some(view)) => (StatusCode::OK, Json(view.record.to_response())).into_response(),
        Ok(None) => task_not_found(),
        Err(err) => store_unavailable(err),
    }
}

pub async fn download_artifact(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    serve_artifact(&state, &task_id, &headers, true).await
}

pub async fn stream_artifact(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    serve_artifact(&state, &task_id, &headers, false).await
}

async fn serve_artifact(
    state: &AppState,
    task_id: &str,
    headers: &HeaderMap,
    attachment: bool,
) -> axum::response::Response {
    let view = match state.tasks.get(task_id).await {
        Ok(Some(view)) => view,
        Ok(None) => return task_not_found(),
        Err(err) => return store_unavailable(err),
    };

    if view.record.status != TaskStatus::Finished {
        return error_response(
            StatusCode::NOT_FOUND,
            "ARTIFACT_NOT_READY",
            "Conversion has not finished for this task.",
        );
    }

    let Some(bytes) = view.artifact_bytes else {
        // Known limitation of in-memory payload storage: the record can
        // outlive the bytes across restarts or instance hops.
        return error_response(
            StatusCode::NOT_FOUND,
            "ARTIFACT_UNAVAILABLE",
            "Artifact is no longer available; retry the conversion.",
        );
    };

    let title = view.record.title.as_deref().unwrap_or("youtube_audio");
    artifact_response(headers, bytes, title, attachment)
}

pub async fn cleanup_task(
    State(state): State<AppState>,
    Json(payload): Json<TaskIdRequest>,
) -> impl IntoResponse {
    let view = match state.tasks.get(&payload.task_id).await {
        Ok(Some(view)) => view,
        Ok(None) => return task_not_found(),
        Err(err) => return store_unavailable(err),
    };

    if view.record.status != TaskStatus::Processing {
        return (
            StatusCode::OK,
            Json(json!({
                "message": "Task is not stuck.",
                "current_status": view.record.status,
            })),
        )
            .into_response();
    }

    let patch = TaskPatch {
        status: Some(TaskStatus::Error),
        error: Some(
            "Manually cleaned up: task was stuck in processing past the ceiling.".to_string(),
        ),
        ..Default::default()
    };
    match state.tasks.update(&payload.task_id, patch).await {
        Ok(Some(record)) => (
            StatusCode::OK,
            Json(json!({
                "message": "Task cleaned up successfully.",
                "previous_status": TaskStatus::Processing,
                "new_status": record.status,
            })),
        )
            .into_response(),
        Ok(None) => task_not_found(),
        Err(err) => store_unavailable(err),
    }
}

pub async fn retry_task(
    State(state): State<AppState>,
    Json(payload): Json<TaskIdRequest>,
) -> impl IntoResponse {
    let view = match state.tasks.get(&payload.task_id).await {
        Ok(Some(view)) => view,
        Ok(None) => return task_not_found(),
        Err(err) => return store_unavailable(err),
    };

    // Finished work is never re-run; queued/processing tasks still have a
    // driver, so only failed tasks are eligible for a reset.
    match view.record.status {
        TaskStatus::Finished => {
            return (
                StatusCode::OK,
                Json(json!({
                    "message": "Task already finished; nothing to retry.",
                    "task": view.record.to_response(),
                })),
            )
                .into_response();
        }
        TaskStatus::Queued | TaskStatus::Processing => {
            return (
                StatusCode::OK,
                Json(json!({
                    "message": "Task is still in flight; clean it up before retrying.",
                    "current_status": view.record.status,
                })),
            )
                .into_response();
        }
        TaskStatus::Error => {}
    }

    let patch = TaskPatch {
        status: Some(TaskStatus::Queued),
        progress: Some(0),
        clear_error: true,
        ..Default::default()
    };
    if let Err(err) = state.tasks.update(&payload.task_id, patch).await {
        return store_unavailable(err);
    }

    let job = ConvertJob {
        task_id: payload.task_id.clone(),
        source_url: view.record.source_url.clone(),
    };
    if state.queue_tx.send(job).await.is_err() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "QUEUE_UNAVAILABLE",
            "Conversion queue is unavailable.",
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "message": "Task retry initiated.",
            "task_id": payload.task_id,
        })),
    )
        .into_response()
}

fn task_not_found() -> axum::response::Response {
    error_response(
        StatusCode::NOT_FOUND,
        "TASK_NOT_FOUND",
        "Task not found or expired.",
    )
}

fn store_unavailable(err: anyhow::Error) -> axum::response::Response {
    warn!("Task store unavailable: {err:#}");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "STORE_UNAVAILABLE",
        "Task store is unreachable.",
    )
}

fn error_response(status: StatusCode, code: &str, message: &str) -> axum::response::Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        })),
    )
        .into_response()
}
