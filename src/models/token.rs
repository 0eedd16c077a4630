//! Token lifecycle state held by the local cache.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Descriptive attributes attached to a token after issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TokenMetadata {
    pub fn new(user_name: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            comment: Some(comment.into()),
            enabled: true,
        }
    }
}

/// One independently persisted field of a token record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AliasField {
    Expiration,
    MaxLifetime,
    Metadata,
}

impl AliasField {
    pub fn as_str(&self) -> &'static str {
        match self {
            AliasField::Expiration => "expiration",
            AliasField::MaxLifetime => "max_lifetime",
            AliasField::Metadata => "metadata",
        }
    }
}

/// Where the local copy of a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrigin {
    /// Created or mutated on this node; this copy is authoritative here.
    Local,
    /// Learned through read-through at `fetched_at`.
    Remote { fetched_at: Instant },
}

/// All times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    /// Unknown for records discovered on another node.
    pub issue_time: Option<i64>,
    pub expiration: i64,
    pub max_lifetime: Option<i64>,
    pub metadata: Option<TokenMetadata>,
    pub origin: RecordOrigin,
}

impl TokenRecord {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expiration || self.max_lifetime.is_some_and(|max| now_ms >= max)
    }
}

/// The plaintext value of a single alias, before encryption.
#[derive(Debug, Clone, PartialEq)]
pub enum AliasValue {
    Millis(i64),
    Metadata(TokenMetadata),
}

impl AliasValue {
    pub fn to_plaintext(&self) -> anyhow::Result<String> {
        Ok(match self {
            AliasValue::Millis(ms) => ms.to_string(),
            AliasValue::Metadata(meta) => serde_json::to_string(meta)?,
        })
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
