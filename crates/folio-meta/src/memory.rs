use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use tokio::sync::RwLock;

use crate::types::MetaStore;

/// Single-process store. Expired entries read as absent and are purged on
/// the next write.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    revision: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t > now).unwrap_or(true)
    }
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }

    fn live_revision(&self, key: &str, now: Instant) -> u64 {
        self.kv
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.revision)
            .unwrap_or(0)
    }

    fn purge_expired(&mut self, now: Instant) {
        self.kv.retain(|_, e| e.live(now));
    }

    fn insert(&mut self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>, now: Instant) -> u64 {
        let revision = self.next_revision();
        let expires_at = ttl_ms.map(|ms| now + Duration::from_millis(ms));
        self.kv.insert(
            key.to_string(),
            Entry {
                value,
                revision,
                expires_at,
            },
        );
        revision
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.purge_expired(now);
        Ok(inner.insert(key, value, ttl_ms, now))
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| (e.value.clone(), e.revision)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        inner.kv.remove(key);
        Ok(inner.next_revision())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        let out = inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.live(now))
            .map(|(k, e)| (k.clone(), e.value.clone(), e.revision))
            .collect();
        Ok(out)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
        ttl_ms: Option<u64>,
    ) -> Result<(bool, u64)> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let current = inner.live_revision(key, now);
        if current != expected_revision {
            return Ok((false, current));
        }
        inner.purge_expired(now);
        Ok((true, inner.insert(key, value, ttl_ms, now)))
    }

    async fn compare_and_delete(&self, key: &str, expected_revision: u64) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let current = inner.live_revision(key, now);
        if current == 0 || current != expected_revision {
            return Ok(false);
        }
        inner.kv.remove(key);
        inner.next_revision();
        Ok(true)
    }
}
