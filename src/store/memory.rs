use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{child_name, RemoteStore, StoreResult};
use crate::errors::StoreError;

/// Process-local coordination store.
///
/// Clones share the same entries, so two service instances built on clones
/// of one store behave like two gateway nodes on a shared backend.
/// `set_available(false)` simulates a connectivity outage and
/// `set_latency` a slow backend.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<DashMap<String, Vec<u8>>>,
    offline: Arc<AtomicBool>,
    writes: Arc<AtomicU64>,
    latency_ms: Arc<AtomicU64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Delay applied before every operation. Zero disables it.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Successful writes since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Overwrite a raw payload, bypassing availability (test fixtures).
    pub fn put_raw(&self, path: &str, value: Vec<u8>) {
        self.entries.insert(path.to_string(), value);
    }

    async fn round_trip(&self) -> StoreResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection lost".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn exists(&self, path: &str) -> StoreResult<bool> {
        self.round_trip().await?;
        Ok(self.entries.contains_key(path))
    }

    async fn read(&self, path: &str) -> StoreResult<Vec<u8>> {
        self.round_trip().await?;
        self.entries
            .get(path)
            .map(|v| v.value().clone())
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, value: &[u8]) -> StoreResult<()> {
        self.round_trip().await?;
        self.entries.insert(path.to_string(), value.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<BTreeSet<String>> {
        self.round_trip().await?;
        Ok(self
            .entries
            .iter()
            .filter_map(|entry| child_name(prefix, entry.key()).map(String::from))
            .collect())
    }
}
