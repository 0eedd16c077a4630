use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::TokenStateError;
use crate::models::token::{AliasField, AliasValue, RecordOrigin, TokenMetadata, TokenRecord};

/// Latest unpersisted value of one alias.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub token_id: String,
    pub field: AliasField,
    pub value: AliasValue,
    /// Bumped on every mutation; a write only clears the entry it snapshotted.
    pub version: u64,
}

type AliasKey = (String, AliasField);

/// In-memory token state for the local node.
///
/// `records` holds plaintext token state. `pending` holds at most one entry
/// per alias (the latest value), drained by the persistence scheduler.
///
/// Lock order: a record shard may be held while touching `pending`, never
/// the other way around. The scheduler only ever touches `pending`.
#[derive(Clone, Default)]
pub struct TokenStateCache {
    records: Arc<DashMap<String, TokenRecord>>,
    pending: Arc<DashMap<AliasKey, PendingWrite>>,
    next_version: Arc<AtomicU64>,
}

impl TokenStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, token_id: &str) -> Option<TokenRecord> {
        self.records.get(token_id).map(|r| r.value().clone())
    }

    /// Insert (or overwrite) a token created on this node and queue its aliases.
    pub fn add(
        &self,
        token_id: &str,
        issue_time: i64,
        expiration: i64,
        max_lifetime: Option<i64>,
    ) {
        // Hold the shard lock while queueing so a concurrent mutation cannot
        // interleave between the record update and its pending write.
        let mut record = self
            .records
            .entry(token_id.to_string())
            .or_insert_with(|| TokenRecord {
                issue_time: None,
                expiration,
                max_lifetime: None,
                metadata: None,
                origin: RecordOrigin::Local,
            });
        record.issue_time = Some(issue_time);
        record.expiration = expiration;
        record.origin = RecordOrigin::Local;

        self.mark_dirty(token_id, AliasField::Expiration, AliasValue::Millis(expiration));
        // The store cannot delete an alias, so a re-add without a max lifetime
        // keeps the one already recorded rather than diverging from it.
        if let Some(max) = max_lifetime {
            record.max_lifetime = Some(max);
            self.mark_dirty(token_id, AliasField::MaxLifetime, AliasValue::Millis(max));
        }
    }

    /// Extend the expiration to `now_ms + extension_ms`, bounded by max lifetime.
    pub fn renew(
        &self,
        token_id: &str,
        extension_ms: i64,
        now_ms: i64,
    ) -> Result<i64, TokenStateError> {
        let mut record = self
            .records
            .get_mut(token_id)
            .ok_or_else(|| TokenStateError::TokenNotFound(token_id.to_string()))?;

        let expiration = now_ms.saturating_add(extension_ms.max(0));
        if record.max_lifetime.is_some_and(|max| expiration > max) {
            return Err(TokenStateError::RenewalLimitExceeded {
                token: crate::alias::displayable_alias_text(token_id),
            });
        }

        record.expiration = expiration;
        record.origin = RecordOrigin::Local;
        self.mark_dirty(token_id, AliasField::Expiration, AliasValue::Millis(expiration));
        Ok(expiration)
    }

    pub fn set_metadata(
        &self,
        token_id: &str,
        metadata: TokenMetadata,
    ) -> Result<(), TokenStateError> {
        let mut record = self
            .records
            .get_mut(token_id)
            .ok_or_else(|| TokenStateError::TokenNotFound(token_id.to_string()))?;

        record.metadata = Some(metadata.clone());
        self.mark_dirty(token_id, AliasField::Metadata, AliasValue::Metadata(metadata));
        Ok(())
    }

    /// Store a record fetched from the remote store.
    ///
    /// Local-origin records are never replaced, and fields with an
    /// unpersisted local value keep that value. Returns the resulting record.
    pub fn merge_remote(&self, token_id: &str, fetched: TokenRecord) -> TokenRecord {
        match self.records.entry(token_id.to_string()) {
            Entry::Vacant(vacant) => vacant.insert(fetched).value().clone(),
            Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                if current.origin == RecordOrigin::Local {
                    let has_pending_meta = self.is_pending(token_id, AliasField::Metadata);
                    if current.metadata.is_none() && !has_pending_meta {
                        current.metadata = fetched.metadata;
                    }
                    return current.clone();
                }

                if !self.is_pending(token_id, AliasField::Expiration) {
                    current.expiration = fetched.expiration;
                }
                if !self.is_pending(token_id, AliasField::MaxLifetime) {
                    current.max_lifetime = fetched.max_lifetime;
                }
                if !self.is_pending(token_id, AliasField::Metadata) {
                    current.metadata = fetched.metadata;
                }
                current.issue_time = current.issue_time.or(fetched.issue_time);
                current.origin = fetched.origin;
                current.clone()
            }
        }
    }

    /// Attach metadata discovered remotely, unless a local value exists.
    pub fn merge_remote_metadata(
        &self,
        token_id: &str,
        metadata: TokenMetadata,
    ) -> Option<TokenMetadata> {
        let mut record = self.records.get_mut(token_id)?;
        if !self.is_pending(token_id, AliasField::Metadata) {
            record.metadata = Some(metadata);
        }
        record.metadata.clone()
    }

    fn mark_dirty(&self, token_id: &str, field: AliasField, value: AliasValue) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending.insert(
            (token_id.to_string(), field),
            PendingWrite {
                token_id: token_id.to_string(),
                field,
                value,
                version,
            },
        );
    }

    fn is_pending(&self, token_id: &str, field: AliasField) -> bool {
        self.pending.contains_key(&(token_id.to_string(), field))
    }

    /// Copy of every pending write. Entries stay queued until [`Self::complete`].
    pub fn snapshot_pending(&self) -> Vec<PendingWrite> {
        self.pending.iter().map(|e| e.value().clone()).collect()
    }

    /// Clear a pending write after it was persisted, unless it was overtaken.
    pub fn complete(&self, write: &PendingWrite) -> bool {
        self.pending
            .remove_if(&(write.token_id.clone(), write.field), |_, current| {
                current.version == write.version
            })
            .is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Current number of records in the local cache (for metrics / debugging).
    pub fn local_len(&self) -> usize {
        self.records.len()
    }

    pub fn contains(&self, token_id: &str) -> bool {
        self.records.contains_key(token_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn remote_record(expiration: i64) -> TokenRecord {
        TokenRecord {
            issue_time: None,
            expiration,
            max_lifetime: None,
            metadata: None,
            origin: RecordOrigin::Remote {
                fetched_at: Instant::now(),
            },
        }
    }

    #[test]
    fn test_add_queues_expiration_and_max_lifetime() {
        let cache = TokenStateCache::new();
        cache.add("a0-token1", 1, 2, Some(10));
        let mut fields: Vec<_> = cache.snapshot_pending().into_iter().map(|w| w.field).collect();
        fields.sort_by_key(|f| f.as_str());
        assert_eq!(fields, vec![AliasField::Expiration, AliasField::MaxLifetime]);
    }

    #[test]
    fn test_add_without_max_lifetime_queues_only_expiration() {
        let cache = TokenStateCache::new();
        cache.add("a0-token1", 1, 2, None);
        let pending = cache.snapshot_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].field, AliasField::Expiration);
    }

    #[test]
    fn test_pending_coalesces_to_latest_value() {
        let cache = TokenStateCache::new();
        cache.add("a1-token", 0, 1_000, None);
        cache.renew("a1-token", 5_000, 100).unwrap();
        cache.renew("a1-token", 9_000, 200).unwrap();

        let pending = cache.snapshot_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].value, AliasValue::Millis(9_200));
    }

    #[test]
    fn test_complete_keeps_overtaken_value() {
        let cache = TokenStateCache::new();
        cache.add("a1-token", 0, 1_000, None);
        let snapshot = cache.snapshot_pending();

        cache.renew("a1-token", 2_000, 0).unwrap();
        assert!(!cache.complete(&snapshot[0]));
        assert_eq!(cache.pending_len(), 1);

        let latest = cache.snapshot_pending();
        assert!(cache.complete(&latest[0]));
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn test_renew_respects_max_lifetime() {
        let cache = TokenStateCache::new();
        cache.add("a1-token", 0, 1_000, Some(5_000));
        assert_eq!(cache.renew("a1-token", 4_000, 1_000).unwrap(), 5_000);
        let err = cache.renew("a1-token", 4_001, 1_000).unwrap_err();
        assert!(matches!(err, TokenStateError::RenewalLimitExceeded { .. }));
        assert_eq!(cache.get("a1-token").unwrap().expiration, 5_000);
    }

    #[test]
    fn test_renew_unknown_token() {
        let cache = TokenStateCache::new();
        assert!(matches!(
            cache.renew("zz-missing", 1, 0),
            Err(TokenStateError::TokenNotFound(_))
        ));
    }

    #[test]
    fn test_merge_remote_never_replaces_local_record() {
        let cache = TokenStateCache::new();
        cache.add("a0-token1", 1, 2, None);
        let merged = cache.merge_remote("a0-token1", remote_record(99));
        assert_eq!(merged.expiration, 2);
        assert_eq!(merged.origin, RecordOrigin::Local);
    }

    #[test]
    fn test_merge_remote_keeps_pending_local_fields() {
        let cache = TokenStateCache::new();
        cache.merge_remote("b2-token", remote_record(100));
        cache
            .set_metadata("b2-token", TokenMetadata::new("bob", "local"))
            .unwrap();

        let merged = cache.merge_remote("b2-token", remote_record(300));
        assert_eq!(merged.expiration, 300);
        assert_eq!(merged.metadata.unwrap().comment.as_deref(), Some("local"));
    }

    #[test]
    fn test_readd_is_idempotent_overwrite() {
        let cache = TokenStateCache::new();
        cache.add("a0-token1", 1, 2, Some(10));
        cache.set_metadata("a0-token1", TokenMetadata::new("u", "c")).unwrap();
        cache.add("a0-token1", 5, 6, Some(20));

        let record = cache.get("a0-token1").unwrap();
        assert_eq!(record.issue_time, Some(5));
        assert_eq!(record.expiration, 6);
        assert_eq!(record.max_lifetime, Some(20));
        assert!(record.metadata.is_some());
        assert_eq!(cache.local_len(), 1);
    }

    #[test]
    fn test_readd_without_max_lifetime_keeps_recorded_one() {
        let cache = TokenStateCache::new();
        cache.add("a0-token1", 1, 2, Some(10));
        for write in cache.snapshot_pending() {
            cache.complete(&write);
        }

        cache.add("a0-token1", 5, 6, None);
        assert_eq!(cache.get("a0-token1").unwrap().max_lifetime, Some(10));
        let pending = cache.snapshot_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].field, AliasField::Expiration);
        assert!(cache.renew("a0-token1", 100, 0).is_err());
    }
}
