use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Finished,
    Error,
}

impl TaskStatus {
    /// Terminal states are absorbing: no transition ever leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

/// Durable task record, serialized into the KV store under `task:{id}`.
/// Artifact bytes never appear here; they live in the process-local payload
/// map and are merged on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub source_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn queued(id: String, source_url: String) -> Self {
        Self {
            id,
            status: TaskStatus::Queued,
            progress: 0,
            source_url,
            title: None,
            file_url: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn to_response(&self) -> TaskResponse {
        TaskResponse {
            task_id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            title: self.title.clone(),
            file_url: self.file_url.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
        }
    }
}

/// Partial update applied onto an existing durable record. `artifact_bytes`
/// is routed to the in-memory payload map only, never the durable store.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub title: Option<String>,
    pub file_url: Option<String>,
    pub error: Option<String>,
    /// Wipes a stale diagnostic when a task is reset for retry.
    pub clear_error: bool,
    pub artifact_bytes: Option<Bytes>,
}

/// Merged view returned by the task manager: the durable record plus any
/// locally held artifact payload.
#[derive(Debug, Clone)]
pub struct TaskView {
    pub record: TaskRecord,
    pub artifact_bytes: Option<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConvertRequest {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertAcceptedResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskIdRequest {
    pub task_id: String,
}

/// Result cache entry, serialized under `cache:{sha256(normalized_url)}`.
/// Points at the task that produced the artifact; the bytes themselves stay
/// in the payload map, so a hit is only honored while they are still held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub task_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Unit of work handed from the convert handler to the background workers.
#[derive(Debug, Clone)]
pub struct ConvertJob {
    pub task_id: String,
    pub source_url: String,
}
