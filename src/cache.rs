use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::{models::CacheEntry, store::KvStore};

const CACHE_PREFIX: &str = "cache:";

/// Best-effort memoization of produced artifacts, keyed by the hash of the
/// normalized source URL. Strictly an optimization: a miss (or a stale hit)
/// only costs another backend call.
#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn KvStore>,
    validity: Duration,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KvStore>, validity: Duration) -> Self {
        Self { store, validity }
    }

    /// Pure store read. Entries past the validity window are evicted lazily
    /// here even if the backing store has not reclaimed them yet.
    pub async fn lookup(&self, normalized_url: &str) -> Result<Option<CacheEntry>> {
        let key = cache_key(normalized_url);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_str(&raw).context("Failed to decode cache entry")?;

        let age = Utc::now().signed_duration_since(entry.created_at);
        if age.num_seconds() < 0 || age.num_seconds() as u64 >= self.validity.as_secs() {
            self.store.delete(&key).await?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Last-write-wins overwrite.
    pub async fn store(&self, normalized_url: &str, task_id: &str, title: &str) -> Result<()> {
        let entry = CacheEntry {
            task_id: task_id.to_string(),
            title: title.to_string(),
            created_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&entry).context("Failed to encode cache entry")?;
        self.store
            .set(&cache_key(normalized_url), encoded, self.validity)
            .await
    }
}

pub fn cache_key(normalized_url: &str) -> String {
    let digest = Sha256::digest(normalized_url.as_bytes());
    format!("{CACHE_PREFIX}{}", hex::encode(digest))
}
