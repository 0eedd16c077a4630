use std::collections::BTreeSet;

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;

use super::{child_name, RemoteStore, StoreResult};
use crate::errors::StoreError;

/// Redis-backed coordination store. Each alias path is a plain key.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn exists(&self, path: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists::<_, bool>(path).await?)
    }

    async fn read(&self, path: &str) -> StoreResult<Vec<u8>> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<Vec<u8>>>(path)
            .await?
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, value: &[u8]) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(path, value).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<BTreeSet<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}/*", escape_glob(prefix.trim_end_matches('/')));
        let mut iter = conn.scan_match::<_, String>(pattern).await?;

        let mut children = BTreeSet::new();
        while let Some(key) = iter.next_item().await {
            if let Some(name) = child_name(prefix, &key) {
                children.insert(name.to_string());
            }
        }
        Ok(children)
    }
}

/// Escape characters that `SCAN MATCH` treats as glob syntax.
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
