//! Background job: drain pending alias writes to the coordination store.
//!
//! Runs every persistence interval. Each pass snapshots the latest value of
//! every dirty alias, encrypts and writes it, and clears the pending entry
//! only when the write succeeded and the value was not overtaken meanwhile.
//! Failed writes stay queued and are retried on the next tick, forever, at
//! the same cadence.
//!
//! A write that timed out may still be applied by the backend later. The
//! next successful write of that alias is therefore repeated once more on
//! the following tick before the entry is cleared.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::stream::{self, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alias::{alias_name, displayable_alias_text, AliasCodec};
use crate::cache::{PendingWrite, TokenStateCache};
use crate::metrics::SyncMetrics;
use crate::models::token::AliasField;
use crate::store::RemoteStore;
use crate::vault::AliasCipher;

/// Upper bound on concurrent writes within one pass.
const MAX_IN_FLIGHT_WRITES: usize = 16;

/// Outcome of one flush pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
    /// Another pass was already running.
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Written,
    Failed,
    TimedOut,
}

pub struct PersistenceScheduler {
    cache: TokenStateCache,
    store: Arc<dyn RemoteStore>,
    codec: AliasCodec,
    cipher: Arc<dyn AliasCipher>,
    metrics: Arc<SyncMetrics>,
    interval: Duration,
    write_timeout: Duration,
    /// Aliases whose last write timed out with an unknown result.
    unconfirmed: DashSet<(String, AliasField)>,
    flush_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: TokenStateCache,
        store: Arc<dyn RemoteStore>,
        codec: AliasCodec,
        cipher: Arc<dyn AliasCipher>,
        metrics: Arc<SyncMetrics>,
        interval: Duration,
        write_timeout: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            cache,
            store,
            codec,
            cipher,
            metrics,
            interval,
            write_timeout,
            unconfirmed: DashSet::new(),
            flush_lock: Mutex::new(()),
            shutdown,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Spawn the periodic flush loop. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }

        let scheduler = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            let mut interval = time::interval(scheduler.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; nothing can be dirty yet.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.flush().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("persistence loop stopped");
        }));

        info!(
            interval_secs = self.interval.as_secs(),
            "token state persistence scheduler started"
        );
    }

    /// Stop the loop, wait for an in-progress pass, then flush once more.
    pub async fn stop(&self) -> FlushReport {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("persistence loop terminated abnormally: {}", e);
            }
        }

        let report = self.flush().await;
        let remaining = self.cache.pending_len();
        if remaining > 0 {
            warn!(
                remaining,
                "final flush left aliases unpersisted; they are lost on exit"
            );
        } else {
            info!(written = report.written, "final token state flush complete");
        }
        report
    }

    /// Ask the loop to exit without a final flush (used on drop).
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Run one flush pass now. Skips if a pass is already running.
    pub async fn flush(&self) -> FlushReport {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            debug!("flush already in progress, skipping tick");
            return FlushReport {
                skipped: true,
                ..FlushReport::default()
            };
        };

        let snapshot = self.cache.snapshot_pending();
        if snapshot.is_empty() {
            return FlushReport::default();
        }

        let results: Vec<(PendingWrite, WriteOutcome)> = stream::iter(snapshot)
            .map(|write| async move {
                let outcome = self.persist(&write).await;
                (write, outcome)
            })
            .buffer_unordered(MAX_IN_FLIGHT_WRITES)
            .collect()
            .await;

        let mut report = FlushReport::default();
        for (write, outcome) in &results {
            let key = (write.token_id.clone(), write.field);
            match outcome {
                WriteOutcome::Written => {
                    report.written += 1;
                    if self.unconfirmed.remove(&key).is_none() {
                        self.cache.complete(write);
                    }
                }
                WriteOutcome::TimedOut => {
                    self.unconfirmed.insert(key);
                    report.failed += 1;
                }
                WriteOutcome::Failed => report.failed += 1,
            }
        }

        self.metrics.set_pending(self.cache.pending_len());
        if report.failed > 0 {
            warn!(
                written = report.written,
                failed = report.failed,
                "some token aliases could not be persisted; retrying next tick"
            );
        } else {
            debug!(written = report.written, "token aliases persisted");
        }
        report
    }

    async fn persist(&self, write: &PendingWrite) -> WriteOutcome {
        let path = self.codec.path_for(&write.token_id, write.field);
        let alias = displayable_alias_text(&alias_name(&write.token_id, write.field));

        let payload = match write
            .value
            .to_plaintext()
            .and_then(|plaintext| self.cipher.seal(&plaintext))
        {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    alias = %alias,
                    error = %e,
                    "failed to encrypt alias value"
                );
                self.metrics.record_flush_write(false);
                return WriteOutcome::Failed;
            }
        };

        let write = self.store.write(&path, &payload);
        let (outcome, reason) = match time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => {
                self.metrics.record_flush_write(true);
                return WriteOutcome::Written;
            }
            Ok(Err(e)) => (WriteOutcome::Failed, e.to_string()),
            Err(_) => (
                WriteOutcome::TimedOut,
                format!("timed out after {:?}", self.write_timeout),
            ),
        };

        debug!(
            alias = %alias,
            reason = %reason,
            "alias write failed"
        );
        self.metrics.record_flush_write(false);
        outcome
    }
}
