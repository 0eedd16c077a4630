//! Multi-node token state synchronization tests.
//!
//! Two `TokenStateService` instances sharing one `InMemoryStore` stand in for
//! two gateway nodes. Timing tests run on paused tokio time so persistence
//! intervals elapse deterministically.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_test::{assert_err, assert_ok};

use tokensync::alias::displayable_alias_text;
use tokensync::config::Config;
use tokensync::models::token::{now_millis, TokenMetadata};
use tokensync::store::memory::InMemoryStore;
use tokensync::vault::builtin::EnvelopeCipher;
use tokensync::vault::AliasCipher;
use tokensync::{TokenStateError, TokenStateService};

const MASTER_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
const BASE: &str = "/gateway/security/tokens";
const HOUR_MS: i64 = 60 * 60 * 1000;

fn cipher() -> Arc<EnvelopeCipher> {
    Arc::new(EnvelopeCipher::new(MASTER_KEY).unwrap())
}

fn node_with(store: &InMemoryStore, config: &Config) -> TokenStateService {
    TokenStateService::new(config, Arc::new(store.clone()), cipher())
}

fn node(store: &InMemoryStore) -> TokenStateService {
    node_with(store, &Config::with_interval(1).unwrap())
}

/// Lets at least one persistence tick elapse.
async fn one_interval() {
    time::sleep(Duration::from_millis(1_500)).await;
}

mod persistence_tests {
    use super::*;

    /// Aliases only reach the store after a tick, and only those with values.
    #[tokio::test(start_paused = true)]
    async fn test_aliases_written_after_tick() {
        let store = InMemoryStore::new();
        let svc = node(&store);
        svc.start().await;

        svc.add_token("a0-token1", 1, 2, None).unwrap();
        assert!(!store.contains(&format!("{BASE}/a0/a0-token1")));
        assert!(!store.contains(&format!("{BASE}/a0/a0-token1--max")));

        one_interval().await;
        assert!(store.contains(&format!("{BASE}/a0/a0-token1")));
        assert!(store.contains(&format!("{BASE}/a0/a0-token1--max")));
        assert!(!store.contains(&format!("{BASE}/a0/a0-token1--meta")));
        assert_eq!(svc.pending_writes(), 0);

        svc.stop().await;
    }

    /// Writes made during an outage are retried until the store comes back.
    #[tokio::test(start_paused = true)]
    async fn test_writes_survive_outage() {
        let store = InMemoryStore::new();
        let svc = node(&store);
        svc.start().await;

        store.set_available(false);
        svc.add_token("d4-token", 1, 2, Some(10)).unwrap();
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(svc.pending_writes(), 2);
        assert!(svc.metrics().flush_writes("failed") >= 2);

        store.set_available(true);
        one_interval().await;
        assert_eq!(svc.pending_writes(), 0);
        assert!(store.contains(&format!("{BASE}/d4/d4-token")));
        assert!(store.contains(&format!("{BASE}/d4/d4-token--max")));

        svc.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_renewals_write_latest_value_once() {
        let store = InMemoryStore::new();
        let svc = node(&store);
        let peer = node(&store);
        svc.start().await;

        let now = now_millis();
        svc.add_token("e5-token", now, now + HOUR_MS, Some(now + 100 * HOUR_MS))
            .unwrap();
        one_interval().await;
        let writes_after_add = store.write_count();

        let mut last = 0;
        for hours in 2..12 {
            last = assert_ok!(svc.renew_token("e5-token", hours * HOUR_MS).await);
        }
        one_interval().await;

        assert_eq!(store.write_count(), writes_after_add + 1);
        assert_eq!(peer.get_token_expiration("e5-token").await.unwrap(), last);
        svc.stop().await;
    }

    /// Stopping a node flushes what the last tick did not.
    #[tokio::test]
    async fn test_stop_flushes_pending_writes() {
        let store = InMemoryStore::new();
        let svc = node(&store);
        svc.start().await;

        svc.add_token("f6-token", 1, 2, None).unwrap();
        let report = svc.stop().await;

        assert_eq!(report.failed, 0);
        assert!(store.contains(&format!("{BASE}/f6/f6-token")));
    }
}

mod cross_node_tests {
    use super::*;

    /// A read on another node right after the add waits for the owner's flush.
    #[tokio::test(start_paused = true)]
    async fn test_expiration_visible_on_other_node_after_flush() {
        let store = InMemoryStore::new();
        let a = node(&store);
        let b = node(&store);
        a.start().await;

        a.add_token("a0-token1", 1, 2_000, None).unwrap();
        assert_eq!(a.get_token_expiration("a0-token1").await.unwrap(), 2_000);
        assert!(!store.contains(&format!("{BASE}/a0/a0-token1")));
        assert_eq!(b.get_token_expiration("a0-token1").await.unwrap(), 2_000);
        assert_eq!(
            b.get_token_max_lifetime("a0-token1").await.unwrap(),
            a.get_token_max_lifetime("a0-token1").await.unwrap()
        );

        a.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_round_trip() {
        let store = InMemoryStore::new();
        let a = node(&store);
        let b = node(&store);
        a.start().await;

        let meta = TokenMetadata::new("testUser", "This is my test comment");
        a.add_token("b1-token", 1, 2_000, None).unwrap();
        assert_ok!(a.add_metadata("b1-token", meta.clone()).await);
        one_interval().await;

        let fetched = b.get_token_metadata("b1-token").await.unwrap();
        assert_eq!(fetched, Some(meta));
        a.stop().await;
    }

    /// Metadata added on one node is found by a node that already cached the
    /// token without metadata.
    #[tokio::test(start_paused = true)]
    async fn test_late_metadata_found_through_read_through() {
        let store = InMemoryStore::new();
        let a = node(&store);
        let b = node(&store);

        a.add_token("b2-token", 1, 2_000, None).unwrap();
        a.flush_now().await;
        assert_eq!(b.get_token_metadata("b2-token").await.unwrap(), None);

        assert_ok!(
            a.add_metadata("b2-token", TokenMetadata::new("late", "added later"))
                .await
        );
        a.flush_now().await;

        let fetched = b.get_token_metadata("b2-token").await.unwrap();
        assert_eq!(fetched.map(|m| m.user_name), Some("late".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_visible_on_other_node() {
        let store = InMemoryStore::new();
        let a = node(&store);
        let b = node(&store);
        a.start().await;

        let now = now_millis();
        a.add_token("c3-token", now, now + HOUR_MS, None).unwrap();
        one_interval().await;
        assert_eq!(b.get_token_expiration("c3-token").await.unwrap(), now + HOUR_MS);

        let renewed = assert_ok!(a.renew_token("c3-token", 3 * HOUR_MS).await);
        assert!(renewed > now + HOUR_MS);
        one_interval().await;

        assert_eq!(b.get_token_expiration("c3-token").await.unwrap(), renewed);
        a.stop().await;
    }

    /// A node may renew a token it only knows through read-through.
    #[tokio::test(start_paused = true)]
    async fn test_renewal_of_remote_token_is_persisted() {
        let store = InMemoryStore::new();
        let a = node(&store);
        let b = node(&store);

        let now = now_millis();
        a.add_token("c4-token", now, now + HOUR_MS, None).unwrap();
        a.flush_now().await;

        let renewed = assert_ok!(b.renew_token("c4-token", 2 * HOUR_MS).await);
        b.flush_now().await;

        let c = node(&store);
        assert_eq!(c.get_token_expiration("c4-token").await.unwrap(), renewed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_reported_immediately_without_retries() {
        let store = InMemoryStore::new();
        let a = node(&store);
        let mut config = Config::with_interval(1).unwrap();
        config.not_found_retries = 0;
        let b = node_with(&store, &config);
        a.start().await;

        a.add_token("g6-token", 1, 2_000, None).unwrap();
        assert!(matches!(
            b.get_token_expiration("g6-token").await,
            Err(TokenStateError::TokenNotFound(_))
        ));
        one_interval().await;
        assert_eq!(b.get_token_expiration("g6-token").await.unwrap(), 2_000);
        a.stop().await;
    }

    /// A renewal flushed after another node cached the token is seen on that
    /// node's next lookup, not one refresh window later.
    #[tokio::test(start_paused = true)]
    async fn test_renewal_after_peer_cached_token_is_not_masked() {
        let store = InMemoryStore::new();
        let config = Config::with_interval(2).unwrap();
        let a = node_with(&store, &config);
        let b = node_with(&store, &config);
        a.start().await;

        let now = now_millis();
        a.add_token("m3-token", now, now + HOUR_MS, None).unwrap();
        time::sleep(Duration::from_millis(2_050)).await;
        assert!(store.contains(&format!("{BASE}/m3/m3-token")));

        let renewed = assert_ok!(a.renew_token("m3-token", 3 * HOUR_MS).await);
        time::sleep(Duration::from_millis(450)).await;
        assert_eq!(b.get_token_expiration("m3-token").await.unwrap(), now + HOUR_MS);

        time::sleep(Duration::from_millis(1_700)).await;
        assert_eq!(a.pending_writes(), 0);
        assert_eq!(b.get_token_expiration("m3-token").await.unwrap(), renewed);
        a.stop().await;
    }

    /// A reader configured to retry waits for the owning node's next flush.
    #[tokio::test(start_paused = true)]
    async fn test_not_found_read_retries_until_flushed() {
        let store = InMemoryStore::new();
        let a = node(&store);
        let mut config = Config::with_interval(1).unwrap();
        config.not_found_retries = 3;
        let b = node_with(&store, &config);
        a.start().await;

        a.add_token("g7-token", 1, 4_242, None).unwrap();
        assert_eq!(b.get_token_expiration("g7-token").await.unwrap(), 4_242);
        a.stop().await;
    }
}

mod lifetime_tests {
    use super::*;

    #[tokio::test]
    async fn test_renewal_beyond_max_lifetime_rejected() {
        let store = InMemoryStore::new();
        let svc = node(&store);

        let now = now_millis();
        svc.add_token("h8-token", now, now + HOUR_MS, Some(now + 2 * HOUR_MS))
            .unwrap();

        let err = assert_err!(svc.renew_token("h8-token", 5 * HOUR_MS).await);
        assert!(matches!(err, TokenStateError::RenewalLimitExceeded { .. }));
        assert_eq!(svc.get_token_expiration("h8-token").await.unwrap(), now + HOUR_MS);
        assert_eq!(
            svc.get_token_max_lifetime("h8-token").await.unwrap(),
            Some(now + 2 * HOUR_MS)
        );
    }

    #[tokio::test]
    async fn test_expired_token_reported() {
        let store = InMemoryStore::new();
        let svc = node(&store);
        let now = now_millis();
        svc.add_token("i9-token", now - 2 * HOUR_MS, now - HOUR_MS, None)
            .unwrap();
        assert!(svc.is_expired("i9-token").await.unwrap());
    }
}

mod corruption_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_expiration_reads_as_absent() {
        let store = InMemoryStore::new();
        store.put_raw(&format!("{BASE}/j0/j0-token"), b"not ciphertext".to_vec());

        let svc = node(&store);
        assert!(matches!(
            svc.get_token_expiration("j0-token").await,
            Err(TokenStateError::TokenNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_metadata_reads_as_none() {
        let store = InMemoryStore::new();
        let cipher = cipher();
        store.put_raw(&format!("{BASE}/k1/k1-token"), cipher.seal("5000").unwrap());
        store.put_raw(
            &format!("{BASE}/k1/k1-token--meta"),
            cipher.seal("{not json").unwrap(),
        );

        let svc = node(&store);
        assert_eq!(svc.get_token_expiration("k1-token").await.unwrap(), 5_000);
        assert_eq!(svc.get_token_metadata("k1-token").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_under_another_key_are_unreadable() {
        let store = InMemoryStore::new();
        let other = EnvelopeCipher::new(
            "ff0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1eff",
        )
        .unwrap();
        store.put_raw(&format!("{BASE}/l2/l2-token"), other.seal("5000").unwrap());

        let svc = node(&store);
        assert!(svc.get_token_expiration("l2-token").await.is_err());
    }
}

mod display_tests {
    use super::*;

    #[test]
    fn test_uuid_alias_is_truncated() {
        let id = "3f2b8c1e-9d4a-4b7e-8f01-2c3d4e5f6a7b";
        for alias in [id.to_string(), format!("{id}--max"), format!("{id}--meta")] {
            let shown = displayable_alias_text(&alias);
            assert!(shown.len() < alias.len());
            assert_eq!(shown.find("..."), Some(8));
            assert!(!shown.contains(id));
            assert!(shown.starts_with("3f2b8c1e..."));
        }
        assert_eq!(displayable_alias_text(&format!("{id}--max")), "3f2b8c1e...6a7b--max");
    }
}
