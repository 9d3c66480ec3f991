//! Fan-out of payloads to registry-selected connections.
//!
//! Every send runs against a snapshot taken under one read lock, so a single
//! broadcast observes one consistent membership; connections registered after
//! the snapshot catch the next one. Failures are isolated per recipient: a
//! dead sink costs that recipient its copy and nothing else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::timeout;

use crate::connection::{OutboundFrame, Route, SendKind};
use crate::error::{HubError, Result};
use crate::metrics::DeliveryMetrics;
use crate::registry::{ConnectionRegistry, DeliveryTarget};
use crate::tagexpr::TagExpr;

/// Maximum number of concurrent sink sends per broadcast
const MAX_CONCURRENT_SENDS: usize = 100;

/// Default patience per recipient before its send counts as failed
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    /// Connections matched by the selection at snapshot time
    pub matched: usize,
    /// Copies handed to a sink
    pub delivered: usize,
    /// Copies refused or timed out
    pub failed: usize,
}

impl DeliveryReport {
    fn new(matched: usize, delivered: usize, failed: usize) -> Self {
        Self {
            matched,
            delivered,
            failed,
        }
    }
}

/// Counters for the broadcaster, cheap enough to bump on every send.
#[derive(Debug, Default)]
pub struct BroadcasterStats {
    pub total_sends: AtomicU64,
    pub total_delivered: AtomicU64,
    pub total_failed: AtomicU64,
}

impl BroadcasterStats {
    fn record(&self, delivered: usize, failed: usize) {
        self.total_sends.fetch_add(1, Ordering::Relaxed);
        self.total_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.total_failed.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BroadcasterStatsSnapshot {
        BroadcasterStatsSnapshot {
            total_sends: self.total_sends.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcasterStatsSnapshot {
    pub total_sends: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
}

/// Fans payloads out to connections selected through the registry.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    send_timeout: Duration,
    stats: BroadcasterStats,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_send_timeout(registry, DEFAULT_SEND_TIMEOUT)
    }

    pub fn with_send_timeout(registry: Arc<ConnectionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
            stats: BroadcasterStats::default(),
        }
    }

    pub fn stats(&self) -> BroadcasterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Send to one connection, optionally requiring it to be on `route`.
    /// Unlike the fan-out operations, an unknown or mismatched id is an
    /// error the caller can act on.
    #[tracing::instrument(name = "broadcaster.send_to", skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn send_to(
        &self,
        id: &str,
        payload: Arc<[u8]>,
        route: Option<&Route>,
    ) -> Result<()> {
        let Some(target) = self.registry.snapshot_one(id, route).await else {
            return Err(HubError::NotFound(id.to_string()));
        };

        let send = target.sink.deliver(OutboundFrame::Data(payload.clone()));
        match timeout(self.send_timeout, send).await {
            Ok(Ok(())) => {
                self.stats.record(1, 0);
                DeliveryMetrics::record_broadcast("direct");
                DeliveryMetrics::record_outcome(1, 0);
                self.registry
                    .track_delivery(id, payload, SendKind::Direct, id)
                    .await;
                Ok(())
            }
            Ok(Err(_)) => {
                self.stats.record(0, 1);
                DeliveryMetrics::record_outcome(0, 1);
                Err(HubError::Delivery(format!("sink closed for '{id}'")))
            }
            Err(_) => {
                self.stats.record(0, 1);
                DeliveryMetrics::record_outcome(0, 1);
                Err(HubError::Delivery(format!("send to '{id}' timed out")))
            }
        }
    }

    /// Send to every connection, or every connection on `route`.
    #[tracing::instrument(name = "broadcaster.send_to_all", skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn send_to_all(&self, payload: Arc<[u8]>, route: Option<&Route>) -> DeliveryReport {
        let targets = self.registry.snapshot_all(route).await;
        DeliveryMetrics::record_broadcast("all");
        self.fan_out(targets, payload, SendKind::Broadcast, "*").await
    }

    /// Send to every connection carrying `tag`.
    #[tracing::instrument(name = "broadcaster.send_to_tag", skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn send_to_tag(
        &self,
        tag: &str,
        payload: Arc<[u8]>,
        route: Option<&Route>,
    ) -> DeliveryReport {
        let targets = self.registry.snapshot_by_tag(tag, route).await;
        DeliveryMetrics::record_broadcast("tag");
        self.fan_out(targets, payload, SendKind::Tag, tag).await
    }

    /// Send to every connection whose tag set satisfies `expression`.
    /// A malformed expression fails before anything is sent.
    #[tracing::instrument(name = "broadcaster.send_to_expression", skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn send_to_expression(
        &self,
        expression: &str,
        payload: Arc<[u8]>,
        route: Option<&Route>,
    ) -> Result<DeliveryReport> {
        let expr = TagExpr::parse(expression)?;
        let targets = self.registry.snapshot_by_expression(&expr, route).await;
        DeliveryMetrics::record_broadcast("expression");
        Ok(self
            .fan_out(targets, payload, SendKind::Expression, expression)
            .await)
    }

    /// Deliver `payload` to each target with bounded concurrency. One slow or
    /// dead sink affects only its own slot in the report.
    async fn fan_out(
        &self,
        targets: Vec<DeliveryTarget>,
        payload: Arc<[u8]>,
        kind: SendKind,
        target_label: &str,
    ) -> DeliveryReport {
        let matched = targets.len();
        if matched == 0 {
            return DeliveryReport::new(0, 0, 0);
        }

        let mut futures = FuturesUnordered::new();
        let mut delivered_ids = Vec::new();
        let mut failed = 0;
        let mut pending = 0;

        for target in targets {
            let frame = OutboundFrame::Data(payload.clone());
            let send_timeout = self.send_timeout;
            futures.push(async move {
                match timeout(send_timeout, target.sink.deliver(frame)).await {
                    Ok(Ok(())) => Ok(target.id),
                    Ok(Err(_)) => Err((target.id, "sink closed")),
                    Err(_) => Err((target.id, "send timed out")),
                }
            });
            pending += 1;

            while pending >= MAX_CONCURRENT_SENDS {
                let Some(result) = futures.next().await else {
                    break;
                };
                pending -= 1;
                match result {
                    Ok(id) => delivered_ids.push(id),
                    Err((id, reason)) => {
                        failed += 1;
                        tracing::warn!(connection_id = %id, reason, "Delivery failed");
                    }
                }
            }
        }

        while let Some(result) = futures.next().await {
            match result {
                Ok(id) => delivered_ids.push(id),
                Err((id, reason)) => {
                    failed += 1;
                    tracing::warn!(connection_id = %id, reason, "Delivery failed");
                }
            }
        }

        let delivered = delivered_ids.len();
        for id in &delivered_ids {
            self.registry
                .track_delivery(id, payload.clone(), kind, target_label)
                .await;
        }

        self.stats.record(delivered, failed);
        DeliveryMetrics::record_outcome(delivered, failed);
        tracing::debug!(
            matched,
            delivered,
            failed,
            kind = %kind,
            "Fan-out complete"
        );
        DeliveryReport::new(matched, delivered, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::connection::{ChannelSink, DeliverySink};

    fn live_sink() -> (Arc<dyn DeliverySink>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(ChannelSink::new(tx)), rx)
    }

    fn dead_sink() -> Arc<dyn DeliverySink> {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        Arc::new(ChannelSink::new(tx))
    }

    fn payload(bytes: &[u8]) -> Arc<[u8]> {
        Arc::from(bytes)
    }

    async fn recv_data(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<u8> {
        match rx.recv().await {
            Some(OutboundFrame::Data(bytes)) => bytes.to_vec(),
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_unknown_id_is_not_found() {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(registry);
        let err = broadcaster
            .send_to("nobody", payload(b"x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotFound(id) if id == "nobody"));
    }

    #[tokio::test]
    async fn send_to_enforces_route_filter() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (sink, mut rx) = live_sink();
        registry
            .register("c1", Route::named("/chat"), sink)
            .await
            .unwrap();
        let broadcaster = Broadcaster::new(registry);

        let err = broadcaster
            .send_to("c1", payload(b"x"), Some(&Route::named("/news")))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));

        broadcaster
            .send_to("c1", payload(b"hello"), Some(&Route::named("/chat")))
            .await
            .unwrap();
        assert_eq!(recv_data(&mut rx).await, b"hello");
    }

    #[tokio::test]
    async fn broadcast_isolates_failures() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (good1, mut rx1) = live_sink();
        let (good2, mut rx2) = live_sink();
        registry.register("good1", Route::Default, good1).await.unwrap();
        registry.register("dead", Route::Default, dead_sink()).await.unwrap();
        registry.register("good2", Route::Default, good2).await.unwrap();

        let broadcaster = Broadcaster::new(registry);
        let report = broadcaster.send_to_all(payload(b"news"), None).await;

        assert_eq!(report.matched, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(recv_data(&mut rx1).await, b"news");
        assert_eq!(recv_data(&mut rx2).await, b"news");
    }

    #[tokio::test]
    async fn broadcast_respects_route_boundaries() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (chat_sink, mut chat_rx) = live_sink();
        let (news_sink, mut news_rx) = live_sink();
        registry
            .register("chatter", Route::named("/chat"), chat_sink)
            .await
            .unwrap();
        registry
            .register("reader", Route::named("/news"), news_sink)
            .await
            .unwrap();

        let broadcaster = Broadcaster::new(registry);
        let chat = Route::named("/chat");
        let report = broadcaster.send_to_all(payload(b"hi"), Some(&chat)).await;

        assert_eq!(report.matched, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(recv_data(&mut chat_rx).await, b"hi");
        assert!(news_rx.try_recv().is_err(), "other route must not receive");
    }

    #[tokio::test]
    async fn tag_broadcast_hits_current_membership_only() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (vip_sink, mut vip_rx) = live_sink();
        let (plain_sink, mut plain_rx) = live_sink();
        registry.register("vip", Route::Default, vip_sink).await.unwrap();
        registry.register("plain", Route::Default, plain_sink).await.unwrap();
        registry.add_tag("vip", "gold").await;

        let broadcaster = Broadcaster::new(registry.clone());
        let report = broadcaster.send_to_tag("gold", payload(b"perk"), None).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(recv_data(&mut vip_rx).await, b"perk");
        assert!(plain_rx.try_recv().is_err());

        registry.remove_tag("vip", "gold").await;
        let report = broadcaster.send_to_tag("gold", payload(b"perk"), None).await;
        assert_eq!(report.matched, 0);
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn expression_broadcast_parses_before_sending() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (sink, mut rx) = live_sink();
        registry.register("c1", Route::Default, sink).await.unwrap();
        registry.add_tag("c1", "vip").await;
        registry.add_tag("c1", "beta").await;

        let broadcaster = Broadcaster::new(registry);
        let report = broadcaster
            .send_to_expression("vip AND NOT banned", payload(b"m"), None)
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(recv_data(&mut rx).await, b"m");

        let err = broadcaster
            .send_to_expression("vip AND", payload(b"m"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Syntax { .. }));
        assert!(rx.try_recv().is_err(), "nothing sent on parse failure");
    }

    #[tokio::test]
    async fn deliveries_feed_queue_counters() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (sink, mut rx) = live_sink();
        registry.register("c1", Route::Default, sink).await.unwrap();
        registry
            .enable_queue_counter("c1", 10, Duration::from_secs(60))
            .await;

        let broadcaster = Broadcaster::new(registry.clone());
        broadcaster.send_to("c1", payload(b"a"), None).await.unwrap();
        broadcaster.send_to_all(payload(b"b"), None).await;

        assert_eq!(registry.queue_count("c1").await, Some(2));
        let messages = registry.queue_messages("c1").await.unwrap();
        assert_eq!(messages[0].kind, SendKind::Direct);
        assert_eq!(messages[1].kind, SendKind::Broadcast);
        assert_eq!(recv_data(&mut rx).await, b"a");
        assert_eq!(recv_data(&mut rx).await, b"b");
    }

    #[tokio::test]
    async fn stats_accumulate_across_sends() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (sink, _rx) = live_sink();
        registry.register("c1", Route::Default, sink).await.unwrap();
        registry.register("dead", Route::Default, dead_sink()).await.unwrap();

        let broadcaster = Broadcaster::new(registry);
        broadcaster.send_to_all(payload(b"x"), None).await;
        broadcaster.send_to_all(payload(b"y"), None).await;

        let stats = broadcaster.stats();
        assert_eq!(stats.total_sends, 2);
        assert_eq!(stats.total_delivered, 2);
        assert_eq!(stats.total_failed, 2);
    }
}
