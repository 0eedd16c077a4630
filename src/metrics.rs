//! Prometheus metrics for token state synchronization.
//!
//! Each service instance owns its own registry so that several nodes can
//! live in one process (tests, embedded gateways) without colliding on the
//! global default registry.

use prometheus::{opts, Encoder, IntCounterVec, IntGauge, Registry, TextEncoder};

pub struct SyncMetrics {
    registry: Registry,
    flush_writes_total: IntCounterVec,
    pending_aliases: IntGauge,
    read_through_total: IntCounterVec,
}

impl SyncMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let flush_writes_total = IntCounterVec::new(
            opts!(
                "tokensync_flush_writes_total",
                "Alias writes attempted by the persistence scheduler"
            ),
            &["outcome"],
        )
        .expect("valid metric definition");

        let pending_aliases = IntGauge::with_opts(opts!(
            "tokensync_pending_aliases",
            "Aliases waiting to be written to the remote store"
        ))
        .expect("valid metric definition");

        let read_through_total = IntCounterVec::new(
            opts!(
                "tokensync_read_through_total",
                "Cache misses served from the remote store"
            ),
            &["result"],
        )
        .expect("valid metric definition");

        // Fresh registry, names are unique: registration cannot collide.
        let _ = registry.register(Box::new(flush_writes_total.clone()));
        let _ = registry.register(Box::new(pending_aliases.clone()));
        let _ = registry.register(Box::new(read_through_total.clone()));

        Self {
            registry,
            flush_writes_total,
            pending_aliases,
            read_through_total,
        }
    }

    pub fn record_flush_write(&self, ok: bool) {
        let outcome = if ok { "ok" } else { "failed" };
        self.flush_writes_total.with_label_values(&[outcome]).inc();
    }

    pub fn set_pending(&self, pending: usize) {
        self.pending_aliases.set(pending as i64);
    }

    pub fn record_read_through(&self, result: &str) {
        self.read_through_total.with_label_values(&[result]).inc();
    }

    pub fn flush_writes(&self, outcome: &str) -> u64 {
        self.flush_writes_total.with_label_values(&[outcome]).get()
    }

    /// Encode this registry in Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}
