use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::{
    models::{TaskPatch, TaskRecord, TaskView},
    store::KvStore,
};

const TASK_PREFIX: &str = "task:";

/// Single source of truth for task existence and state. Durable fields go
/// through the KV store; artifact bytes stay in a process-local map and are
/// merged on read. Store errors propagate to the caller untouched; the
/// orchestrator owns the retry decision.
#[derive(Clone)]
pub struct TaskManager {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    payloads: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl TaskManager {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            payloads: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Write a fresh durable record. The id is caller-generated and assumed
    /// unique; a collision silently overwrites, as with any KV put.
    pub async fn create(&self, record: &TaskRecord) -> Result<()> {
        let encoded = serde_json::to_string(record).context("Failed to encode task record")?;
        self.store
            .set(&task_key(&record.id), encoded, self.ttl)
            .await
    }

    /// Merged view, or `None` when the durable record is absent or expired.
    /// Absence is a normal outcome, never an error.
    pub async fn get(&self, task_id: &str) -> Result<Option<TaskView>> {
        let Some(raw) = self.store.get(&task_key(task_id)).await? else {
            return Ok(None);
        };
        let record: TaskRecord =
            serde_json::from_str(&raw).context("Failed to decode task record")?;
        let artifact_bytes = self.payloads.read().await.get(task_id).cloned();
        Ok(Some(TaskView {
            record,
            artifact_bytes,
        }))
    }

    /// Read-modify-write partial merge, last-writer-wins. Artifact bytes go
    /// to the local payload map only. When the durable record has expired
    /// mid-flight the whole update is dropped, bytes included; an orphaned
    /// payload for a task nobody can poll is just leaked memory.
    pub async fn update(&self, task_id: &str, patch: TaskPatch) -> Result<Option<TaskRecord>> {
        let Some(raw) = self.store.get(&task_key(task_id)).await? else {
            return Ok(None);
        };
        let mut record: TaskRecord =
            serde_json::from_str(&raw).context("Failed to decode task record")?;

        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(progress) = patch.progress {
            record.progress = progress;
        }
        if let Some(title) = patch.title {
            record.title = Some(title);
        }
        if let Some(file_url) = patch.file_url {
            record.file_url = Some(file_url);
        }
        if patch.clear_error {
            record.error = None;
        } else if let Some(error) = patch.error {
            record.error = Some(error);
        }

        let encoded = serde_json::to_string(&record).context("Failed to encode task record")?;
        self.store.set(&task_key(task_id), encoded, self.ttl).await?;

        if let Some(bytes) = patch.artifact_bytes {
            self.payloads
                .write()
                .await
                .insert(task_id.to_string(), bytes);
        }

        Ok(Some(record))
    }

    /// Remove both the durable record and the payload. Idempotent.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        self.store.delete(&task_key(task_id)).await?;
        self.payloads.write().await.remove(task_id);
        Ok(())
    }

    pub async fn exists(&self, task_id: &str) -> Result<bool> {
        self.store.exists(&task_key(task_id)).await
    }

    pub async fn payload(&self, task_id: &str) -> Option<Bytes> {
        self.payloads.read().await.get(task_id).cloned()
    }

    /// Share an artifact payload under a second task id. `Bytes` clones are
    /// reference-counted, so this does not copy the audio.
    pub async fn alias_payload(&self, from_id: &str, to_id: &str) -> bool {
        let mut payloads = self.payloads.write().await;
        match payloads.get(from_id).cloned() {
            Some(bytes) => {
                payloads.insert(to_id.to_string(), bytes);
                true
            }
            None => false,
        }
    }

    /// Drop payloads whose durable record has expired. Returns how many were
    /// reclaimed; used by the maintenance sweep.
    pub async fn drop_orphaned_payloads(&self) -> Result<u64> {
        let ids: Vec<String> = self.payloads.read().await.keys().cloned().collect();
        let mut orphaned = Vec::new();
        for id in ids {
            if !self.store.exists(&task_key(&id)).await? {
                orphaned.push(id);
            }
        }
        let mut payloads = self.payloads.write().await;
        let mut removed = 0;
        for id in orphaned {
            if payloads.remove(&id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn task_key(task_id: &str) -> String {
    format!("{TASK_PREFIX}{task_id}")
}
