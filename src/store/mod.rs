//! Remote coordination store seam.
//!
//! The token state service only needs a hierarchical key/value service with
//! last-write-wins semantics. Backends:
//!   - `memory`: in-process map, shareable between service instances.
//!   - `redis`: paths are keys, listing uses `SCAN`.
//!   - `object`: any `object_store` backend (local filesystem, S3/MinIO).

pub mod memory;
pub mod object;
pub mod redis;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::errors::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Abstract hierarchical key/value service shared by all gateway nodes.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn exists(&self, path: &str) -> StoreResult<bool>;

    /// Fails with [`StoreError::NotFound`] if nothing is stored at `path`.
    async fn read(&self, path: &str) -> StoreResult<Vec<u8>>;

    /// Last write wins; concurrent writers from other nodes are expected.
    async fn write(&self, path: &str, value: &[u8]) -> StoreResult<()>;

    /// Names of the direct children under `prefix` (not full paths).
    async fn list(&self, prefix: &str) -> StoreResult<BTreeSet<String>>;
}

/// Parsed `type=<kind>;address=<addr>` connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDescriptor {
    pub kind: StoreKind,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Redis,
    Object,
}

impl std::str::FromStr for StoreDescriptor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut kind = None;
        let mut address = None;
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .with_context(|| format!("invalid store descriptor entry '{part}'"))?;
            match key.trim() {
                "type" => {
                    kind = Some(match value.trim() {
                        "memory" => StoreKind::Memory,
                        "redis" => StoreKind::Redis,
                        "object" => StoreKind::Object,
                        other => anyhow::bail!("unsupported remote store type: {}", other),
                    })
                }
                "address" => address = Some(value.trim().to_string()),
                other => anyhow::bail!("unknown store descriptor key: {}", other),
            }
        }

        let kind = kind.context("store descriptor is missing 'type'")?;
        if kind != StoreKind::Memory && address.is_none() {
            anyhow::bail!("store descriptor for {:?} requires an 'address'", kind);
        }
        Ok(Self { kind, address })
    }
}

/// Build the configured backend. Call once at startup and share the handle.
pub async fn connect(descriptor: &StoreDescriptor) -> anyhow::Result<Arc<dyn RemoteStore>> {
    let address = descriptor.address.as_deref().unwrap_or_default();
    let store: Arc<dyn RemoteStore> = match descriptor.kind {
        StoreKind::Memory => Arc::new(memory::InMemoryStore::new()),
        StoreKind::Redis => Arc::new(redis::RedisStore::connect(address).await?),
        StoreKind::Object => Arc::new(object::ObjectStoreBackend::from_url(address)?),
    };
    tracing::info!(kind = ?descriptor.kind, "remote store connected");
    Ok(store)
}

/// Name of the direct child of `prefix` that `path` lives under.
pub(crate) fn child_name<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    let rest = path
        .strip_prefix(prefix.trim_end_matches('/'))?
        .strip_prefix('/')?;
    rest.split('/').next().filter(|name| !name.is_empty())
}
