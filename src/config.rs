use std::time::Duration;

use anyhow::Context;

use crate::alias::DEFAULT_BASE_PATH;
use crate::store::StoreDescriptor;

const INSECURE_PLACEHOLDER_KEY: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

const DEFAULT_PERSISTENCE_INTERVAL_SECS: u64 = 15;
const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_LIFETIME_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_NOT_FOUND_RETRIES: u32 = 2;

#[derive(Debug, Clone)]
pub struct Config {
    /// Period between flush passes. Always > 0.
    pub persistence_interval: Duration,
    pub remote_store: StoreDescriptor,
    pub master_key: String,
    pub base_path: String,
    /// Upper bound on a single read-through call.
    pub read_timeout: Duration,
    /// How long a record learned from another node is served before re-reading.
    /// Zero re-reads on every lookup; the cached copy is then only used while
    /// the store is unreachable.
    pub remote_refresh: Duration,
    /// Applied when a token is added without an explicit max lifetime.
    /// `None` means tokens get no max lifetime alias.
    pub default_max_lifetime: Option<Duration>,
    /// Extra read-through attempts, one persistence interval apart, before a
    /// token missing from the remote store is reported as not found.
    pub not_found_retries: u32,
    /// List and load every persisted token on start.
    pub warm_cache: bool,
    pub port: u16,
}

impl Config {
    /// Defaults suitable for tests and single-process use.
    pub fn with_interval(persistence_interval_secs: u64) -> anyhow::Result<Self> {
        let persistence_interval = validate_interval(persistence_interval_secs)?;
        Ok(Self {
            persistence_interval,
            remote_store: StoreDescriptor {
                kind: crate::store::StoreKind::Memory,
                address: None,
            },
            master_key: INSECURE_PLACEHOLDER_KEY.to_string(),
            base_path: DEFAULT_BASE_PATH.to_string(),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            remote_refresh: Duration::ZERO,
            default_max_lifetime: Some(Duration::from_secs(DEFAULT_MAX_LIFETIME_SECS)),
            not_found_retries: DEFAULT_NOT_FOUND_RETRIES,
            warm_cache: false,
            port: 9464,
        })
    }
}

fn validate_interval(secs: u64) -> anyhow::Result<Duration> {
    if secs == 0 {
        anyhow::bail!("TOKENSYNC_PERSISTENCE_INTERVAL must be a positive number of seconds");
    }
    Ok(Duration::from_secs(secs))
}

fn env_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a non-negative integer, got '{v}'")),
        Err(_) => Ok(default),
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let master_key = std::env::var("TOKENSYNC_MASTER_KEY")
        .unwrap_or_else(|_| INSECURE_PLACEHOLDER_KEY.into());

    if master_key == INSECURE_PLACEHOLDER_KEY {
        let env_mode = std::env::var("TOKENSYNC_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "TOKENSYNC_MASTER_KEY is still the insecure placeholder. \
                 Set a proper 64-char hex key before running in production."
            );
        }
        tracing::warn!("TOKENSYNC_MASTER_KEY is not set, using insecure placeholder key");
    }

    let persistence_interval = validate_interval(env_u64(
        "TOKENSYNC_PERSISTENCE_INTERVAL",
        DEFAULT_PERSISTENCE_INTERVAL_SECS,
    )?)?;

    let remote_store: StoreDescriptor = std::env::var("TOKENSYNC_REMOTE_STORE")
        .unwrap_or_else(|_| "type=memory".into())
        .parse()
        .context("invalid TOKENSYNC_REMOTE_STORE")?;

    let remote_refresh = Duration::from_secs(env_u64("TOKENSYNC_REMOTE_REFRESH_SECS", 0)?);

    let default_max_lifetime =
        match env_u64("TOKENSYNC_DEFAULT_MAX_LIFETIME_SECS", DEFAULT_MAX_LIFETIME_SECS)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

    Ok(Config {
        persistence_interval,
        remote_store,
        master_key,
        base_path: std::env::var("TOKENSYNC_BASE_PATH")
            .unwrap_or_else(|_| DEFAULT_BASE_PATH.into()),
        read_timeout: Duration::from_millis(env_u64(
            "TOKENSYNC_READ_TIMEOUT_MS",
            DEFAULT_READ_TIMEOUT_MS,
        )?),
        remote_refresh,
        default_max_lifetime,
        not_found_retries: env_u64(
            "TOKENSYNC_NOT_FOUND_RETRIES",
            DEFAULT_NOT_FOUND_RETRIES.into(),
        )?
            .try_into()
            .context("TOKENSYNC_NOT_FOUND_RETRIES is too large")?,
        warm_cache: std::env::var("TOKENSYNC_WARM_CACHE")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false),
        port: std::env::var("TOKENSYNC_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(9464),
    })
}
