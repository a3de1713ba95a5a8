use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::sync::RwLock;

/// Minimal TTL'd key-value contract shared by every durable record in the
/// service (`task:{id}` and `cache:{hash}` entries). Expired keys read as
/// absent; `sweep` reclaims them eagerly.
///
/// Errors mean the store itself is unreachable. Callers decide whether to
/// retry; nothing here retries internally.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn sweep(&self) -> Result<u64>;
}

#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn sweep(&self) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - entries.len()) as u64)
    }
}

/// SQLite-backed store for deployments that need task records to survive a
/// restart. All statements run under `spawn_blocking`; the connection is
/// serialized behind a mutex, which is plenty for a KV workload this small.
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKv {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open KV database at {}", path.display()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS kv_expires_at ON kv(expires_at);",
        )
        .context("Failed to initialize KV schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("KV connection mutex poisoned"))?;
            op(&guard)
        })
        .await
        .context("KV blocking task failed")?
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2")?;
            let mut rows = stmt.query(params![key, now_unix()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let key = key.to_string();
        let expires_at = now_unix() + ttl.as_secs() as i64;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn sweep(&self) -> Result<u64> {
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM kv WHERE expires_at <= ?1", params![now_unix()])?;
            Ok(removed as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_kv_expires_entries() {
        let kv = MemoryKv::new();
        kv.set("task:a", "1".into(), Duration::from_secs(60))
            .await
            .unwrap();
        kv.set("task:b", "2".into(), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(kv.get("task:a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.get("task:b").await.unwrap(), None);
        assert!(!kv.exists("task:b").await.unwrap());

        let removed = kv.sweep().await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn memory_kv_delete_is_idempotent() {
        let kv = MemoryKv::new();
        kv.set("k", "v".into(), Duration::from_secs(60)).await.unwrap();
        kv.delete("k").await.unwrap();
        kv.delete("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_kv_roundtrip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let kv = SqliteKv::open(&dir.path().join("kv.db")).unwrap();

        kv.set("task:x", "first".into(), Duration::from_secs(60))
            .await
            .unwrap();
        kv.set("task:x", "second".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(kv.get("task:x").await.unwrap().as_deref(), Some("second"));

        kv.delete("task:x").await.unwrap();
        assert_eq!(kv.get("task:x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_kv_sweep_removes_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let kv = SqliteKv::open(&dir.path().join("kv.db")).unwrap();

        kv.set("stale", "v".into(), Duration::from_secs(0))
            .await
            .unwrap();
        kv.set("fresh", "v".into(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(kv.get("stale").await.unwrap(), None);
        assert_eq!(kv.sweep().await.unwrap(), 1);
        assert!(kv.exists("fresh").await.unwrap());
    }
}
