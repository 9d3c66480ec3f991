//! Cross-component integration tests
//!
//! These tests run the registry, broadcaster, and supervisor together the
//! way an embedding gateway would, with channel-backed sinks standing in for
//! socket writer tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_test::assert_ok;

use ws_hub::{
    Broadcaster, ChannelSink, ConnectionRegistry, DeliverySink, GlobalKvStore, HubError,
    OutboundFrame, PingSupervisor, Route, SearchOperator, SupervisorConfig,
};

struct TestClient {
    id: String,
    rx: mpsc::Receiver<OutboundFrame>,
}

impl TestClient {
    async fn expect_data(&mut self) -> Vec<u8> {
        let frame = tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .unwrap_or_else(|_| panic!("{}: no frame within 1s", self.id));
        match frame {
            Some(OutboundFrame::Data(bytes)) => bytes.to_vec(),
            other => panic!("{}: expected data frame, got {other:?}", self.id),
        }
    }

    fn expect_silence(&mut self) {
        assert!(
            self.rx.try_recv().is_err(),
            "{}: received a frame it should not have",
            self.id
        );
    }
}

async fn connect(
    registry: &ConnectionRegistry,
    id: &str,
    route: Route,
) -> TestClient {
    ws_hub::telemetry::init_tracing_for_tests();
    let (tx, rx) = mpsc::channel(32);
    let sink: Arc<dyn DeliverySink> = Arc::new(ChannelSink::new(tx));
    registry.register(id, route, sink).await.unwrap();
    TestClient {
        id: id.to_string(),
        rx,
    }
}

fn payload(bytes: &[u8]) -> Arc<[u8]> {
    Arc::from(bytes)
}

#[tokio::test]
async fn tag_expression_broadcast_tracks_live_membership() {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(registry.clone());

    let mut c1 = connect(&registry, "c1", Route::named("/chat")).await;
    registry.add_tag("c1", "vip").await;

    let report = broadcaster
        .send_to_expression("vip AND NOT banned", payload(b"welcome"), None)
        .await
        .unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(c1.expect_data().await, b"welcome");

    registry.remove_tag("c1", "vip").await;
    let report = broadcaster
        .send_to_expression("vip AND NOT banned", payload(b"again"), None)
        .await
        .unwrap();
    assert_eq!(report.matched, 0);
    c1.expect_silence();
}

#[tokio::test]
async fn routes_isolate_broadcasts_and_direct_sends() {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(registry.clone());

    let mut chat_a = connect(&registry, "chat-a", Route::named("/chat")).await;
    let mut chat_b = connect(&registry, "chat-b", Route::named("/chat")).await;
    let mut newsroom = connect(&registry, "newsroom", Route::named("/news")).await;
    let mut bare = connect(&registry, "bare", Route::Default).await;

    let chat = Route::named("/chat");
    let report = broadcaster.send_to_all(payload(b"chat only"), Some(&chat)).await;
    assert_eq!(report.delivered, 2);
    assert_eq!(chat_a.expect_data().await, b"chat only");
    assert_eq!(chat_b.expect_data().await, b"chat only");
    newsroom.expect_silence();
    bare.expect_silence();

    // Route-unaware broadcast reaches everyone, default route included.
    let report = broadcaster.send_to_all(payload(b"everyone"), None).await;
    assert_eq!(report.delivered, 4);
    for client in [&mut chat_a, &mut chat_b, &mut newsroom, &mut bare] {
        assert_eq!(client.expect_data().await, b"everyone");
    }

    // Direct send with the wrong route filter does not leak across routes.
    let err = broadcaster
        .send_to("newsroom", payload(b"x"), Some(&chat))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::NotFound(_)));
}

#[tokio::test]
async fn rename_preserves_addressability_and_state() {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(registry.clone());

    let mut client = connect(&registry, "anon-7f3a", Route::named("/chat")).await;
    registry.add_tag("anon-7f3a", "lurker").await;
    registry.set_info("anon-7f3a", "name", "dana").await;

    assert!(registry.rename("anon-7f3a", "dana").await);

    assert_ok!(broadcaster.send_to("dana", payload(b"hello dana"), None).await);
    assert_eq!(client.expect_data().await, b"hello dana");

    let err = broadcaster
        .send_to("anon-7f3a", payload(b"stale"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::NotFound(_)));

    assert_eq!(registry.tags_of("dana").await, vec!["lurker".to_string()]);
    assert_eq!(registry.get_info("dana", "name").await.as_deref(), Some("dana"));
}

#[tokio::test]
async fn stored_info_search_feeds_targeted_sends() {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(registry.clone());

    let mut admin = connect(&registry, "admin", Route::named("/ops")).await;
    let mut user = connect(&registry, "user", Route::named("/ops")).await;
    registry.set_info("admin", "role", "Administrator").await;
    registry.set_info("user", "role", "member").await;

    let hits = registry
        .search_by_info("role", SearchOperator::Iprefix, "admin", None)
        .await
        .unwrap();
    assert_eq!(hits, vec!["admin".to_string()]);

    for id in &hits {
        broadcaster.send_to(id, payload(b"audit"), None).await.unwrap();
    }
    assert_eq!(admin.expect_data().await, b"audit");
    user.expect_silence();
}

#[tokio::test]
async fn disconnect_between_snapshot_and_send_is_absorbed() {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(registry.clone());

    let mut stayer = connect(&registry, "stayer", Route::Default).await;
    let leaver = connect(&registry, "leaver", Route::Default).await;

    // The leaver's writer task is gone but the registry entry is still
    // there, exactly the race a real disconnect produces.
    drop(leaver);
    let report = broadcaster.send_to_all(payload(b"news"), None).await;
    assert_eq!(report.matched, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(stayer.expect_data().await, b"news");

    registry.unregister("leaver").await;
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn supervisor_pings_and_purges_alongside_broadcasts() {
    let registry = Arc::new(ConnectionRegistry::new());
    let kv = Arc::new(GlobalKvStore::new());
    let broadcaster = Broadcaster::new(registry.clone());

    let mut client = connect(&registry, "c1", Route::Default).await;
    registry.enable_ping("c1", Duration::from_millis(30)).await;
    kv.set("motd", "hello", 0);
    kv.set("flash", "gone soon", 1);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let config = SupervisorConfig {
        tick: Duration::from_millis(10),
        kv_purge_interval: Duration::from_millis(200),
    };
    let supervisor = tokio::spawn(
        PingSupervisor::new(config, registry.clone(), kv.clone(), shutdown_rx).run(),
    );

    // Data and ping frames interleave on the same sink.
    broadcaster.send_to("c1", payload(b"payload"), None).await.unwrap();
    let mut saw_ping = false;
    let mut saw_data = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !(saw_ping && saw_data) {
        let frame = tokio::time::timeout_at(deadline, client.rx.recv())
            .await
            .expect("expected both data and ping frames")
            .expect("sink closed unexpectedly");
        match frame {
            OutboundFrame::Ping { seq } => {
                assert!(seq >= 1);
                saw_ping = true;
            }
            OutboundFrame::Data(bytes) => {
                assert_eq!(&bytes[..], b"payload");
                saw_data = true;
            }
            OutboundFrame::Close => panic!("unexpected close"),
        }
    }

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(kv.has("motd"));
    assert!(!kv.has("flash"));

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), supervisor)
        .await
        .expect("supervisor should stop on shutdown")
        .unwrap();
}

#[tokio::test]
async fn ghost_connection_outlives_its_socket() {
    let registry = Arc::new(ConnectionRegistry::new());

    let client = connect(&registry, "watcher", Route::named("/feed")).await;
    registry.add_tag("watcher", "audit").await;
    registry.activate_ghost("watcher").await;

    // Socket goes away and the I/O layer reports the disconnect.
    drop(client);
    registry.unregister("watcher").await;

    assert!(registry.contains("watcher").await);
    assert_eq!(registry.clients_by_tag("audit").await, vec!["watcher".to_string()]);

    assert!(registry.release_ghost("watcher").await);
    assert!(!registry.contains("watcher").await);
}

#[tokio::test]
async fn queue_counters_survive_descriptor_clears() {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(registry.clone());

    let mut client = connect(&registry, "c1", Route::Default).await;
    registry
        .enable_queue_counter("c1", 5, Duration::from_secs(60))
        .await;

    for _ in 0..3 {
        broadcaster.send_to("c1", payload(b"m"), None).await.unwrap();
        client.expect_data().await;
    }
    assert_eq!(registry.queue_count("c1").await, Some(3));

    registry.clear_queue_messages("c1").await;
    assert_eq!(registry.queue_count("c1").await, Some(3));
    assert!(registry.queue_messages("c1").await.unwrap().is_empty());

    broadcaster.send_to("c1", payload(b"m"), None).await.unwrap();
    client.expect_data().await;
    assert_eq!(registry.queue_count("c1").await, Some(4));
}

#[tokio::test]
async fn stats_serialize_for_status_endpoints() {
    let registry = Arc::new(ConnectionRegistry::new());
    let _a = connect(&registry, "a", Route::named("/chat")).await;
    let _b = connect(&registry, "b", Route::named("/chat")).await;
    let _c = connect(&registry, "c", Route::Default).await;
    registry.add_tag("a", "vip").await;
    registry.add_tag("b", "vip").await;
    registry.add_tag("b", "beta").await;

    let stats = registry.stats().await;
    let value = serde_json::to_value(&stats).unwrap();
    assert_eq!(value["total_connections"], 3);
    assert_eq!(value["distinct_tags"], 2);
    assert_eq!(value["routes"]["/chat"], 2);
    assert_eq!(value["routes"]["(default)"], 1);
}
