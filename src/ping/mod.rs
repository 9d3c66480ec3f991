//! Background supervisor: periodic pings to opted-in connections and the
//! expired-entry purge of the global key/value store.
//!
//! One task owns both duties; each runs on its own timer. Due connections are
//! collected and stamped under one write lock, then the frames go out with
//! the lock released, so a slow socket never stalls registry mutations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::connection::OutboundFrame;
use crate::kv::GlobalKvStore;
use crate::metrics::SupervisorMetrics;
use crate::registry::ConnectionRegistry;

/// Timeout for one ping send
const PING_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum concurrent ping sends per tick
const MAX_CONCURRENT_PINGS: usize = 1000;

/// Timer settings for one supervisor instance.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often per-connection ping deadlines are checked. Effective ping
    /// cadence is each connection's own interval, quantized to this tick.
    pub tick: Duration,
    /// How often the key/value store sheds expired entries.
    pub kv_purge_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            kv_purge_interval: Duration::from_secs(30),
        }
    }
}

/// Background task driving pings and KV expiry.
pub struct PingSupervisor {
    config: SupervisorConfig,
    registry: Arc<ConnectionRegistry>,
    kv: Arc<GlobalKvStore>,
    shutdown: broadcast::Receiver<()>,
}

impl PingSupervisor {
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<ConnectionRegistry>,
        kv: Arc<GlobalKvStore>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            registry,
            kv,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut ping_timer = tokio::time::interval(self.config.tick);
        let mut purge_timer = tokio::time::interval(self.config.kv_purge_interval);

        // Skip immediate first tick
        ping_timer.tick().await;
        purge_timer.tick().await;

        tracing::info!(
            tick_ms = self.config.tick.as_millis() as u64,
            kv_purge_secs = self.config.kv_purge_interval.as_secs(),
            "Ping supervisor started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Ping supervisor received shutdown signal");
                    break;
                }
                _ = ping_timer.tick() => {
                    self.send_due_pings().await;
                }
                _ = purge_timer.tick() => {
                    let purged = self.kv.purge_expired();
                    if purged > 0 {
                        SupervisorMetrics::record_kv_purge(purged);
                        tracing::debug!(purged, "Purged expired key/value entries");
                    }
                }
            }
        }

        tracing::info!("Ping supervisor stopped");
    }

    /// One tick: stamp and collect due connections, then fan the ping frames
    /// out in bounded batches.
    async fn send_due_pings(&self) {
        let due = self.registry.due_pings(Instant::now()).await;
        let total = due.len();
        if total == 0 {
            return;
        }

        let sent = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        for batch in due.chunks(MAX_CONCURRENT_PINGS) {
            let futures: Vec<_> = batch
                .iter()
                .map(|ticket| {
                    let sent = sent.clone();
                    let failed = failed.clone();
                    let sink = ticket.sink.clone();
                    let id = ticket.id.clone();
                    let seq = ticket.seq;

                    async move {
                        let send = sink.deliver(OutboundFrame::Ping { seq });
                        match timeout(PING_SEND_TIMEOUT, send).await {
                            Ok(Ok(())) => {
                                sent.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(Err(_)) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                tracing::debug!(
                                    connection_id = %id,
                                    "Failed to send ping, connection may be dead"
                                );
                            }
                            Err(_) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                tracing::debug!(connection_id = %id, "Ping send timed out");
                            }
                        }
                    }
                })
                .collect();

            join_all(futures).await;
        }

        let sent_count = sent.load(Ordering::Relaxed);
        SupervisorMetrics::record_pings(sent_count);
        tracing::debug!(
            total,
            sent = sent_count,
            failed = failed.load(Ordering::Relaxed),
            "Ping tick complete"
        );
    }
}
