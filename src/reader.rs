//! Read-through from the coordination store on local cache misses.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::alias::{alias_name, displayable_alias_text, parse_alias, AliasCodec};
use crate::errors::{StoreError, TokenStateError};
use crate::models::token::{AliasField, RecordOrigin, TokenMetadata, TokenRecord};
use crate::store::RemoteStore;
use crate::vault::AliasCipher;

pub struct RemoteReader {
    store: Arc<dyn RemoteStore>,
    codec: AliasCodec,
    cipher: Arc<dyn AliasCipher>,
    read_timeout: Duration,
}

impl RemoteReader {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        codec: AliasCodec,
        cipher: Arc<dyn AliasCipher>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            store,
            codec,
            cipher,
            read_timeout,
        }
    }

    /// Fetch every alias of `token_id`. The expiration alias is mandatory.
    pub async fn fetch_record(&self, token_id: &str) -> Result<TokenRecord, TokenStateError> {
        let (expiration, max_lifetime, metadata) = tokio::join!(
            self.read_millis(token_id, AliasField::Expiration),
            self.read_millis(token_id, AliasField::MaxLifetime),
            self.fetch_metadata(token_id),
        );

        let expiration = expiration?
            .ok_or_else(|| TokenStateError::TokenNotFound(displayable_alias_text(token_id)))?;

        Ok(TokenRecord {
            issue_time: None,
            expiration,
            max_lifetime: max_lifetime?,
            metadata: metadata?,
            origin: RecordOrigin::Remote {
                fetched_at: Instant::now(),
            },
        })
    }

    pub async fn fetch_metadata(
        &self,
        token_id: &str,
    ) -> Result<Option<TokenMetadata>, TokenStateError> {
        let Some(raw) = self.read_alias(token_id, AliasField::Metadata).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!(
                    alias = %displayable_alias_text(&alias_name(token_id, AliasField::Metadata)),
                    error = %e,
                    "ignoring undecodable token metadata"
                );
                Ok(None)
            }
        }
    }

    async fn read_millis(
        &self,
        token_id: &str,
        field: AliasField,
    ) -> Result<Option<i64>, TokenStateError> {
        let Some(raw) = self.read_alias(token_id, field).await? else {
            return Ok(None);
        };
        match raw.trim().parse::<i64>() {
            Ok(ms) => Ok(Some(ms)),
            Err(e) => {
                warn!(
                    alias = %displayable_alias_text(&alias_name(token_id, field)),
                    error = %e,
                    "ignoring undecodable {} value",
                    field.as_str()
                );
                Ok(None)
            }
        }
    }

    /// Read and decrypt one alias. Absent and corrupt values both yield `None`.
    async fn read_alias(
        &self,
        token_id: &str,
        field: AliasField,
    ) -> Result<Option<String>, TokenStateError> {
        let path = self.codec.path_for(token_id, field);
        let alias = displayable_alias_text(&alias_name(token_id, field));

        let payload = match timeout(self.read_timeout, self.store.read(&path)).await {
            Err(_) => {
                return Err(TokenStateError::RemoteUnavailable(format!(
                    "read of {} timed out after {:?}",
                    alias, self.read_timeout
                )))
            }
            Ok(Err(StoreError::NotFound(_))) => return Ok(None),
            Ok(Err(StoreError::Unavailable(msg))) => {
                return Err(TokenStateError::RemoteUnavailable(msg))
            }
            Ok(Ok(payload)) => payload,
        };

        match self.cipher.open(&payload) {
            Ok(plaintext) => {
                debug!(alias = %alias, "alias read through");
                Ok(Some(plaintext))
            }
            Err(e) => {
                warn!(
                    alias = %alias,
                    error = %e,
                    "treating undecryptable alias as absent"
                );
                Ok(None)
            }
        }
    }

    /// Ids of every token with an expiration alias in the store.
    pub async fn list_token_ids(&self) -> Result<BTreeSet<String>, TokenStateError> {
        let buckets = self.list(self.codec.base()).await?;

        let mut ids = BTreeSet::new();
        for bucket in buckets {
            for leaf in self.list(&self.codec.bucket_path(&bucket)).await? {
                if let (id, AliasField::Expiration) = parse_alias(&leaf) {
                    ids.insert(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, TokenStateError> {
        match timeout(self.read_timeout, self.store.list(prefix)).await {
            Err(_) => Err(TokenStateError::RemoteUnavailable(format!(
                "listing {prefix} timed out"
            ))),
            Ok(result) => Ok(result?),
        }
    }
}
