//! Process-scoped token state service.
//!
//! Wires the local cache, the cross-node reader and the persistence
//! scheduler together. Lifecycle is `new` → `start` → `stop`; the API is
//! usable between `new` and `start`, writes just stay pending until the
//! scheduler runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::alias::{displayable_alias_text, validate_token_id, AliasCodec};
use crate::cache::TokenStateCache;
use crate::config::Config;
use crate::errors::TokenStateError;
use crate::jobs::persistence::{FlushReport, PersistenceScheduler};
use crate::metrics::SyncMetrics;
use crate::models::token::{now_millis, RecordOrigin, TokenMetadata, TokenRecord};
use crate::reader::RemoteReader;
use crate::store::{self, RemoteStore};
use crate::vault::builtin::EnvelopeCipher;
use crate::vault::AliasCipher;

pub struct TokenStateService {
    cache: TokenStateCache,
    reader: RemoteReader,
    scheduler: Arc<PersistenceScheduler>,
    metrics: Arc<SyncMetrics>,
    remote_refresh: Duration,
    default_max_lifetime: Option<Duration>,
    not_found_retries: u32,
    retry_delay: Duration,
    warm_cache: bool,
}

impl TokenStateService {
    pub fn new(
        config: &Config,
        store: Arc<dyn RemoteStore>,
        cipher: Arc<dyn AliasCipher>,
    ) -> Self {
        let cache = TokenStateCache::new();
        let codec = AliasCodec::new(config.base_path.clone());
        let metrics = Arc::new(SyncMetrics::new());

        let reader = RemoteReader::new(
            store.clone(),
            codec.clone(),
            cipher.clone(),
            config.read_timeout,
        );
        let scheduler = Arc::new(PersistenceScheduler::new(
            cache.clone(),
            store,
            codec,
            cipher,
            metrics.clone(),
            config.persistence_interval,
            config.read_timeout,
        ));

        Self {
            cache,
            reader,
            scheduler,
            metrics,
            remote_refresh: config.remote_refresh,
            default_max_lifetime: config.default_max_lifetime,
            not_found_retries: config.not_found_retries,
            retry_delay: config.persistence_interval,
            warm_cache: config.warm_cache,
        }
    }

    /// Connect the configured store and build the built-in cipher.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = store::connect(&config.remote_store).await?;
        let cipher = Arc::new(EnvelopeCipher::new(&config.master_key)?);
        Ok(Self::new(config, store, cipher))
    }

    /// Optionally warm the cache, then start the persistence loop.
    pub async fn start(&self) {
        if self.warm_cache {
            self.warm_up().await;
        }
        self.scheduler.start();
    }

    /// Stop the persistence loop after one final flush.
    pub async fn stop(&self) -> FlushReport {
        self.scheduler.stop().await
    }

    /// Flush pending writes immediately (admin and tests).
    pub async fn flush_now(&self) -> FlushReport {
        self.scheduler.flush().await
    }

    pub fn add_token(
        &self,
        token_id: &str,
        issue_time: i64,
        expiration: i64,
        max_lifetime: Option<i64>,
    ) -> Result<(), TokenStateError> {
        validate_token_id(token_id)?;

        let max_lifetime = max_lifetime.or_else(|| {
            self.default_max_lifetime
                .map(|d| issue_time.saturating_add(duration_millis(d)))
        });
        self.cache.add(token_id, issue_time, expiration, max_lifetime);
        self.metrics.set_pending(self.cache.pending_len());

        debug!(
            token = %displayable_alias_text(token_id),
            expiration,
            max_lifetime,
            "token added"
        );
        Ok(())
    }

    /// Extend the expiration to now + `extension_ms`. Returns the new expiration.
    pub async fn renew_token(
        &self,
        token_id: &str,
        extension_ms: i64,
    ) -> Result<i64, TokenStateError> {
        validate_token_id(token_id)?;
        self.resolve(token_id).await?;

        let expiration = self.cache.renew(token_id, extension_ms, now_millis())?;
        self.metrics.set_pending(self.cache.pending_len());

        debug!(
            token = %displayable_alias_text(token_id),
            expiration,
            "token renewed"
        );
        Ok(expiration)
    }

    pub async fn add_metadata(
        &self,
        token_id: &str,
        metadata: TokenMetadata,
    ) -> Result<(), TokenStateError> {
        validate_token_id(token_id)?;
        self.resolve(token_id).await?;

        self.cache.set_metadata(token_id, metadata)?;
        self.metrics.set_pending(self.cache.pending_len());
        Ok(())
    }

    pub async fn get_token_expiration(&self, token_id: &str) -> Result<i64, TokenStateError> {
        validate_token_id(token_id)?;
        Ok(self.resolve(token_id).await?.expiration)
    }

    pub async fn get_token_max_lifetime(
        &self,
        token_id: &str,
    ) -> Result<Option<i64>, TokenStateError> {
        validate_token_id(token_id)?;
        Ok(self.resolve(token_id).await?.max_lifetime)
    }

    /// Metadata may have been attached on another node, so a record without
    /// metadata always consults the remote store.
    pub async fn get_token_metadata(
        &self,
        token_id: &str,
    ) -> Result<Option<TokenMetadata>, TokenStateError> {
        validate_token_id(token_id)?;
        let record = self.resolve(token_id).await?;
        if record.metadata.is_some() {
            return Ok(record.metadata);
        }

        match self.reader.fetch_metadata(token_id).await {
            Ok(Some(metadata)) => Ok(self.cache.merge_remote_metadata(token_id, metadata)),
            Ok(None) => Ok(None),
            Err(TokenStateError::RemoteUnavailable(reason)) => {
                warn!(
                    token = %displayable_alias_text(token_id),
                    reason = %reason,
                    "metadata read-through failed, reporting none"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn is_expired(&self, token_id: &str) -> Result<bool, TokenStateError> {
        validate_token_id(token_id)?;
        Ok(self.resolve(token_id).await?.is_expired_at(now_millis()))
    }

    pub fn pending_writes(&self) -> usize {
        self.cache.pending_len()
    }

    pub fn local_len(&self) -> usize {
        self.cache.local_len()
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    pub fn cache(&self) -> &TokenStateCache {
        &self.cache
    }

    /// Local record if authoritative or still inside the refresh window,
    /// otherwise a read-through. The cached copy covers a failed refresh.
    async fn resolve(&self, token_id: &str) -> Result<TokenRecord, TokenStateError> {
        let Some(record) = self.cache.get(token_id) else {
            return self.read_through(token_id).await;
        };

        let fetched_at = match record.origin {
            RecordOrigin::Local => {
                self.metrics.record_read_through("hit");
                return Ok(record);
            }
            RecordOrigin::Remote { fetched_at } => fetched_at,
        };
        if fetched_at.elapsed() < self.remote_refresh {
            self.metrics.record_read_through("hit");
            return Ok(record);
        }

        match self.fetch_and_merge(token_id).await {
            Ok(fresh) => Ok(fresh),
            Err(e) => {
                warn!(
                    token = %displayable_alias_text(token_id),
                    error = %e,
                    "refresh from remote store failed, serving cached record"
                );
                self.metrics.record_read_through("stale");
                Ok(record)
            }
        }
    }

    /// Cache miss: read from the remote store, retrying a not-found result
    /// up to `not_found_retries` times, one persistence interval apart. The
    /// owning node may not have flushed yet.
    async fn read_through(&self, token_id: &str) -> Result<TokenRecord, TokenStateError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_and_merge(token_id).await {
                Err(TokenStateError::TokenNotFound(_)) if attempt <= self.not_found_retries => {
                    debug!(
                        token = %displayable_alias_text(token_id),
                        "attempt {}/{} found nothing, retrying in {:?}",
                        attempt,
                        self.not_found_retries + 1,
                        self.retry_delay
                    );
                    sleep(self.retry_delay).await;
                }
                Err(e) => {
                    let result = match &e {
                        TokenStateError::TokenNotFound(_) => "not_found",
                        TokenStateError::RemoteUnavailable(_) => "unavailable",
                        _ => "error",
                    };
                    self.metrics.record_read_through(result);
                    return Err(e);
                }
                Ok(record) => return Ok(record),
            }
        }
    }

    async fn fetch_and_merge(&self, token_id: &str) -> Result<TokenRecord, TokenStateError> {
        let fetched = self.reader.fetch_record(token_id).await?;
        self.metrics.record_read_through("loaded");
        Ok(self.cache.merge_remote(token_id, fetched))
    }

    /// Load every persisted token not already cached. Failures are logged.
    async fn warm_up(&self) {
        let ids = match self.reader.list_token_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "cache warm-up skipped, could not list tokens");
                return;
            }
        };

        let mut loaded = 0usize;
        for id in ids.iter().filter(|id| !self.cache.contains(id)) {
            match self.fetch_and_merge(id).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!(
                    token = %displayable_alias_text(id),
                    error = %e,
                    "could not load token during warm-up"
                ),
            }
        }
        info!(loaded, listed = ids.len(), "token cache warmed");
    }
}

impl Drop for TokenStateService {
    fn drop(&mut self) {
        self.scheduler.signal_shutdown();
    }
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use tokio::time;

    const MASTER_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const HOUR_MS: i64 = 60 * 60 * 1000;

    fn node(store: &InMemoryStore, config: &Config) -> TokenStateService {
        TokenStateService::new(
            config,
            Arc::new(store.clone()),
            Arc::new(EnvelopeCipher::new(MASTER_KEY).unwrap()),
        )
    }

    #[tokio::test]
    async fn test_invalid_token_id_rejected() {
        let store = InMemoryStore::new();
        let svc = node(&store, &Config::with_interval(1).unwrap());
        assert!(matches!(
            svc.add_token("", 1, 2, None),
            Err(TokenStateError::InvalidTokenId(_))
        ));
        assert!(matches!(
            svc.get_token_expiration("a0/evil").await,
            Err(TokenStateError::InvalidTokenId(_))
        ));
    }

    #[tokio::test]
    async fn test_default_max_lifetime_applied() {
        let store = InMemoryStore::new();
        let svc = node(&store, &Config::with_interval(1).unwrap());
        svc.add_token("a0-token1", 1_000, 2_000, None).unwrap();

        let max = svc.get_token_max_lifetime("a0-token1").await.unwrap();
        assert_eq!(max, Some(1_000 + 7 * 24 * HOUR_MS));
    }

    #[tokio::test]
    async fn test_zero_default_means_no_max_lifetime() {
        let store = InMemoryStore::new();
        let mut config = Config::with_interval(1).unwrap();
        config.default_max_lifetime = None;
        let svc = node(&store, &config);

        svc.add_token("a0-token1", 1_000, 2_000, None).unwrap();
        assert_eq!(svc.pending_writes(), 1);
        svc.flush_now().await;
        assert!(!store.contains("/gateway/security/tokens/a0/a0-token1--max"));
    }

    #[tokio::test]
    async fn test_unknown_token_not_found() {
        let store = InMemoryStore::new();
        let mut config = Config::with_interval(1).unwrap();
        config.not_found_retries = 0;
        let svc = node(&store, &config);
        assert!(matches!(
            svc.get_token_expiration("zz-missing").await,
            Err(TokenStateError::TokenNotFound(_))
        ));
        assert!(matches!(
            svc.renew_token("zz-missing", 1_000).await,
            Err(TokenStateError::TokenNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_retried_once_per_interval_by_default() {
        let store = InMemoryStore::new();
        let svc = node(&store, &Config::with_interval(3).unwrap());

        let started = time::Instant::now();
        assert!(matches!(
            svc.get_token_expiration("zz-missing").await,
            Err(TokenStateError::TokenNotFound(_))
        ));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(6) && waited < Duration::from_secs(7));
        assert!(svc.metrics().encode().contains("result=\"not_found\""));
    }

    #[tokio::test]
    async fn test_is_expired_uses_wall_clock() {
        let store = InMemoryStore::new();
        let svc = node(&store, &Config::with_interval(1).unwrap());
        let now = now_millis();
        svc.add_token("a0-old", now - 2 * HOUR_MS, now - HOUR_MS, None)
            .unwrap();
        svc.add_token("a0-new", now, now + HOUR_MS, None).unwrap();

        assert!(svc.is_expired("a0-old").await.unwrap());
        assert!(!svc.is_expired("a0-new").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_remote_record_served_during_outage() {
        let store = InMemoryStore::new();
        let config = Config::with_interval(1).unwrap();
        let owner = node(&store, &config);
        let peer = node(&store, &config);

        owner.add_token("c3-token", 1, 5_000, None).unwrap();
        owner.flush_now().await;
        assert_eq!(peer.get_token_expiration("c3-token").await.unwrap(), 5_000);

        store.set_available(false);
        time::advance(Duration::from_secs(5)).await;
        assert_eq!(peer.get_token_expiration("c3-token").await.unwrap(), 5_000);
        assert!(peer.metrics().encode().contains("result=\"stale\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_up_loads_persisted_tokens() {
        let store = InMemoryStore::new();
        let mut config = Config::with_interval(1).unwrap();
        let owner = node(&store, &config);
        owner.add_token("a0-one", 1, 100, None).unwrap();
        owner.add_token("b1-two", 1, 200, None).unwrap();
        owner.flush_now().await;

        config.warm_cache = true;
        let peer = node(&store, &config);
        peer.start().await;
        assert_eq!(peer.local_len(), 2);
        assert!(peer.cache().contains("b1-two"));
        peer.stop().await;
    }
}
