//! The connection registry: every live connection, indexed by id, route, and
//! tag.
//!
//! All three maps live behind one `RwLock` so a mutation updates the record
//! and the derived indices in a single critical section — the bidirectional
//! tag-index invariant (every tag of a connection appears in the index and
//! vice versa) holds at every point an outside observer can see. No guard is
//! ever held across an `.await`; delivery I/O runs on snapshots resolved
//! here and consumed by the broadcaster after the lock is gone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::{
    Connection, DeliverySink, OutboundFrame, PingState, QueueCounter, QueuedMessage, Route,
    SendKind,
};
use crate::error::{HubError, Result};
use crate::metrics::RegistryMetrics;
use crate::search::{Pattern, SearchOperator};
use crate::tagexpr::TagExpr;

/// How long `kill` waits for the Close frame to be accepted before giving up.
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// A resolved delivery target: everything the broadcaster needs after the
/// registry lock is released.
#[derive(Clone)]
pub struct DeliveryTarget {
    pub id: String,
    pub route: Route,
    pub sink: Arc<dyn DeliverySink>,
}

/// A ping the supervisor owes a connection.
pub struct PingTicket {
    pub id: String,
    pub seq: u64,
    pub sink: Arc<dyn DeliverySink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub routes: HashMap<String, usize>,
    pub distinct_tags: usize,
    pub ghost_connections: usize,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<String, Connection>,
    /// tag -> ids carrying it. Kept in lockstep with each connection's tag
    /// set; entries are removed when their id set drains.
    tag_index: HashMap<String, HashSet<String>>,
    route_index: HashMap<Route, HashSet<String>>,
}

impl RegistryInner {
    fn insert(&mut self, conn: Connection) {
        self.route_index
            .entry(conn.route.clone())
            .or_default()
            .insert(conn.id.clone());
        self.connections.insert(conn.id.clone(), conn);
    }

    fn remove(&mut self, id: &str) -> Option<Connection> {
        let conn = self.connections.remove(id)?;
        for tag in &conn.tags {
            if let Some(ids) = self.tag_index.get_mut(tag) {
                ids.remove(id);
                if ids.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        if let Some(ids) = self.route_index.get_mut(&conn.route) {
            ids.remove(id);
            if ids.is_empty() {
                self.route_index.remove(&conn.route);
            }
        }
        Some(conn)
    }

    fn ids_on_route(&self, route: Option<&Route>) -> Vec<String> {
        match route {
            Some(route) => self
                .route_index
                .get(route)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default(),
            None => self.connections.keys().cloned().collect(),
        }
    }

    fn target(&self, conn: &Connection) -> DeliveryTarget {
        DeliveryTarget {
            id: conn.id.clone(),
            route: conn.route.clone(),
            sink: conn.sink.clone(),
        }
    }
}

/// Owns all [`Connection`] records and their indices. One instance per
/// gateway process, constructed at server start and handed around as an
/// `Arc` — never a process-wide singleton.
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    /// Per-connection cap on retained queue-message descriptors.
    max_tracked_messages: usize,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_tracked_message_cap(1000)
    }

    pub fn with_tracked_message_cap(max_tracked_messages: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            max_tracked_messages,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Register a connection under `id`. Ids are unique across the whole
    /// registry, not per route.
    pub async fn register(
        &self,
        id: impl Into<String>,
        route: Route,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<()> {
        let id = id.into();
        let mut inner = self.inner.write().await;
        if inner.connections.contains_key(&id) {
            return Err(HubError::DuplicateId(id));
        }
        inner.insert(Connection::new(id.clone(), route.clone(), sink));
        RegistryMetrics::set_connections(inner.connections.len());
        drop(inner);

        tracing::info!(connection_id = %id, route = %route, "Connection registered");
        Ok(())
    }

    /// Register with a generated id; returns it.
    pub async fn register_generated(
        &self,
        route: Route,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<String> {
        let id = Uuid::new_v4().simple().to_string();
        self.register(id.clone(), route, sink).await?;
        Ok(id)
    }

    /// Idempotent removal. Unknown ids are a no-op: the connection may have
    /// disconnected between a query and this call. Ghost connections survive
    /// until [`release_ghost`](Self::release_ghost).
    pub async fn unregister(&self, id: &str) {
        let mut inner = self.inner.write().await;
        match inner.connections.get(id) {
            None => return,
            Some(conn) if conn.ghost => {
                tracing::debug!(connection_id = %id, "Disconnect ignored for ghost connection");
                return;
            }
            Some(_) => {}
        }
        inner.remove(id);
        RegistryMetrics::set_connections(inner.connections.len());
        drop(inner);

        tracing::info!(connection_id = %id, "Connection unregistered");
    }

    /// Remove the connection and ask the I/O layer to tear the socket down.
    /// Returns false if the id was already gone.
    pub async fn kill(&self, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write().await;
            let removed = inner.remove(id);
            RegistryMetrics::set_connections(inner.connections.len());
            removed
        };
        let Some(conn) = removed else {
            return false;
        };

        // Teardown notification happens outside the lock; a wedged writer
        // task must not stall registry mutations.
        let sent =
            tokio::time::timeout(CLOSE_SEND_TIMEOUT, conn.sink.deliver(OutboundFrame::Close))
                .await;
        if !matches!(sent, Ok(Ok(()))) {
            tracing::debug!(connection_id = %id, "Close notification not accepted by sink");
        }
        tracing::info!(connection_id = %id, "Connection killed");
        true
    }

    /// Atomic rename: false if `current_id` is absent or `new_id` is taken
    /// anywhere in the registry. All tags, stored info, and counters move
    /// with the connection.
    pub async fn rename(&self, current_id: &str, new_id: &str) -> bool {
        if current_id == new_id {
            return self.contains(current_id).await;
        }
        let mut inner = self.inner.write().await;
        if !inner.connections.contains_key(current_id)
            || inner.connections.contains_key(new_id)
        {
            return false;
        }

        let Some(mut conn) = inner.remove(current_id) else {
            return false;
        };
        conn.id = new_id.to_string();
        for tag in &conn.tags {
            inner
                .tag_index
                .entry(tag.clone())
                .or_default()
                .insert(new_id.to_string());
        }
        inner.insert(conn);
        drop(inner);

        tracing::info!(from = %current_id, to = %new_id, "Connection renamed");
        true
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.connections.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.connections.is_empty()
    }

    // ------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------

    /// Ids on `route`, or on every route (the default route included) when
    /// `None`. Order is stable within one call only.
    pub async fn list_by_route(&self, route: Option<&Route>) -> Vec<String> {
        self.inner.read().await.ids_on_route(route)
    }

    pub async fn count_by_route(&self, route: Option<&Route>) -> usize {
        let inner = self.inner.read().await;
        match route {
            Some(route) => inner.route_index.get(route).map_or(0, |ids| ids.len()),
            None => inner.connections.len(),
        }
    }

    pub async fn route_of(&self, id: &str) -> Option<Route> {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .map(|c| c.route.clone())
    }

    pub async fn all_routes(&self) -> Vec<Route> {
        self.inner.read().await.route_index.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------

    /// Unknown ids are a silent no-op, mirroring `unregister`.
    pub async fn add_tag(&self, id: &str, tag: impl Into<String>) {
        let tag = tag.into();
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return;
        };
        if conn.tags.insert(tag.clone()) {
            inner
                .tag_index
                .entry(tag.clone())
                .or_default()
                .insert(id.to_string());
            tracing::debug!(connection_id = %id, tag = %tag, "Tag added");
        }
    }

    pub async fn remove_tag(&self, id: &str, tag: &str) {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return;
        };
        if conn.tags.remove(tag) {
            if let Some(ids) = inner.tag_index.get_mut(tag) {
                ids.remove(id);
                if ids.is_empty() {
                    inner.tag_index.remove(tag);
                }
            }
            tracing::debug!(connection_id = %id, tag = %tag, "Tag removed");
        }
    }

    pub async fn clear_tags(&self, id: &str) {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return;
        };
        let tags = std::mem::take(&mut conn.tags);
        for tag in &tags {
            if let Some(ids) = inner.tag_index.get_mut(tag) {
                ids.remove(id);
                if ids.is_empty() {
                    inner.tag_index.remove(tag);
                }
            }
        }
        if !tags.is_empty() {
            tracing::debug!(connection_id = %id, count = tags.len(), "Tags cleared");
        }
    }

    /// Empty for unknown ids.
    pub async fn tags_of(&self, id: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .map(|c| c.tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn clients_by_tag(&self, tag: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .tag_index
            .get(tag)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn tag_count(&self, tag: &str) -> usize {
        self.inner.read().await.tag_index.get(tag).map_or(0, |ids| ids.len())
    }

    pub async fn all_tags(&self) -> Vec<String> {
        self.inner.read().await.tag_index.keys().cloned().collect()
    }

    /// Evaluate a compiled expression against every connection's tag set
    /// under one read snapshot.
    pub async fn select_by_expression(&self, expr: &TagExpr) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .connections
            .values()
            .filter(|conn| expr.evaluate(&conn.tags))
            .map(|conn| conn.id.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Stored information
    // ------------------------------------------------------------------

    pub async fn set_info(&self, id: &str, key: impl Into<String>, value: impl Into<String>) {
        let mut inner = self.inner.write().await;
        if let Some(conn) = inner.connections.get_mut(id) {
            conn.info.insert(key.into(), value.into());
        }
    }

    pub async fn get_info(&self, id: &str, key: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .and_then(|c| c.info.get(key).cloned())
    }

    pub async fn has_info(&self, id: &str, key: &str) -> bool {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .is_some_and(|c| c.info.contains_key(key))
    }

    /// True iff the key existed.
    pub async fn delete_info(&self, id: &str, key: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner
            .connections
            .get_mut(id)
            .is_some_and(|c| c.info.remove(key).is_some())
    }

    pub async fn clear_info(&self, id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(conn) = inner.connections.get_mut(id) {
            conn.info.clear();
        }
    }

    pub async fn info_keys(&self, id: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .map(|c| c.info.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn all_info(&self, id: &str) -> HashMap<String, String> {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .map(|c| c.info.clone())
            .unwrap_or_default()
    }

    /// Ids whose `storedInfo[key]` satisfies `op` against `value`, optionally
    /// restricted to one route. Connections without the key never match. The
    /// pattern compiles once; an invalid regex or operator fails before the
    /// scan starts.
    pub async fn search_by_info(
        &self,
        key: &str,
        op: SearchOperator,
        value: &str,
        route: Option<&Route>,
    ) -> Result<Vec<String>> {
        let pattern = Pattern::compile(op, value)?;
        let inner = self.inner.read().await;
        Ok(inner
            .connections
            .values()
            .filter(|conn| route.map_or(true, |r| conn.route == *r))
            .filter(|conn| conn.info.get(key).is_some_and(|v| pattern.matches(v)))
            .map(|conn| conn.id.clone())
            .collect())
    }

    // ------------------------------------------------------------------
    // Ping
    // ------------------------------------------------------------------

    pub async fn enable_ping(&self, id: &str, interval: Duration) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return false;
        };
        conn.ping = Some(PingState::new(interval));
        true
    }

    pub async fn disable_ping(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return false;
        };
        conn.ping = None;
        true
    }

    /// Last observed round-trip, `None` until the first pong arrives.
    pub async fn last_ping_round_trip(&self, id: &str) -> Option<Duration> {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .and_then(|c| c.ping.as_ref())
            .and_then(|p| p.last_round_trip)
    }

    /// Called by the I/O layer when a pong arrives.
    pub async fn record_pong(&self, id: &str, round_trip: Duration) {
        let mut inner = self.inner.write().await;
        if let Some(ping) = inner
            .connections
            .get_mut(id)
            .and_then(|c| c.ping.as_mut())
        {
            ping.last_round_trip = Some(round_trip);
            RegistryMetrics::observe_ping_rtt(round_trip);
        }
    }

    /// Collect connections whose ping is due, stamping them as pinged now.
    /// The supervisor issues the frames after this returns.
    pub async fn due_pings(&self, now: Instant) -> Vec<PingTicket> {
        let mut inner = self.inner.write().await;
        let mut due = Vec::new();
        for conn in inner.connections.values_mut() {
            let Some(ping) = conn.ping.as_mut() else {
                continue;
            };
            if ping.due(now) {
                ping.last_ping_at = Some(now);
                ping.last_seq += 1;
                due.push(PingTicket {
                    id: conn.id.clone(),
                    seq: ping.last_seq,
                    sink: conn.sink.clone(),
                });
            }
        }
        due
    }

    // ------------------------------------------------------------------
    // Queue counter
    // ------------------------------------------------------------------

    pub async fn enable_queue_counter(
        &self,
        id: &str,
        max_messages: u64,
        max_window: Duration,
    ) -> bool {
        let max_tracked = self.max_tracked_messages;
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return false;
        };
        conn.queue = Some(QueueCounter::new(max_messages, max_window, max_tracked));
        true
    }

    pub async fn disable_queue_counter(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return false;
        };
        conn.queue = None;
        true
    }

    /// `None` when the id is unknown or the counter is disabled.
    pub async fn queue_count(&self, id: &str) -> Option<u64> {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .and_then(|c| c.queue.as_ref())
            .map(|q| q.count())
    }

    pub async fn queue_messages(&self, id: &str) -> Option<Vec<QueuedMessage>> {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .and_then(|c| c.queue.as_ref())
            .map(|q| q.messages().cloned().collect())
    }

    pub async fn clear_queue_messages(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner
            .connections
            .get_mut(id)
            .and_then(|c| c.queue.as_mut())
            .map(|q| {
                q.clear_messages();
                true
            })
            .unwrap_or(false)
    }

    /// Account one delivered message against the connection's counter, if
    /// enabled. Called by the broadcaster after a successful send.
    pub async fn track_delivery(
        &self,
        id: &str,
        payload: Arc<[u8]>,
        kind: SendKind,
        target: &str,
    ) {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return;
        };
        let route = conn.route.clone();
        if let Some(queue) = conn.queue.as_mut() {
            let seq = queue.record(payload, &route, kind, target);
            if queue.count() == queue.max_messages + 1 {
                tracing::warn!(
                    connection_id = %id,
                    count = queue.count(),
                    limit = queue.max_messages,
                    seq,
                    "Queue counter exceeded its advisory limit"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Ghost connections
    // ------------------------------------------------------------------

    /// Mark a connection as ghost: subsequent disconnects are ignored and the
    /// record stays alive until released.
    pub async fn activate_ghost(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get_mut(id) else {
            return false;
        };
        conn.ghost = true;
        tracing::info!(connection_id = %id, "Ghost mode activated");
        true
    }

    /// Release a ghost connection, performing the removal its disconnect
    /// skipped. False when the id is unknown or not a ghost.
    pub async fn release_ghost(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.connections.get(id) {
            Some(conn) if conn.ghost => {}
            _ => return false,
        }
        inner.remove(id);
        RegistryMetrics::set_connections(inner.connections.len());
        drop(inner);

        tracing::info!(connection_id = %id, "Ghost connection released");
        true
    }

    pub async fn is_ghost(&self, id: &str) -> bool {
        self.inner
            .read()
            .await
            .connections
            .get(id)
            .is_some_and(|c| c.ghost)
    }

    // ------------------------------------------------------------------
    // Snapshots for the broadcaster
    // ------------------------------------------------------------------

    /// One target, `None` if absent or not on the requested route.
    pub async fn snapshot_one(&self, id: &str, route: Option<&Route>) -> Option<DeliveryTarget> {
        let inner = self.inner.read().await;
        let conn = inner.connections.get(id)?;
        if route.is_some_and(|r| conn.route != *r) {
            return None;
        }
        Some(inner.target(conn))
    }

    pub async fn snapshot_all(&self, route: Option<&Route>) -> Vec<DeliveryTarget> {
        let inner = self.inner.read().await;
        inner
            .connections
            .values()
            .filter(|conn| route.map_or(true, |r| conn.route == *r))
            .map(|conn| inner.target(conn))
            .collect()
    }

    pub async fn snapshot_by_tag(&self, tag: &str, route: Option<&Route>) -> Vec<DeliveryTarget> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.tag_index.get(tag) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.connections.get(id))
            .filter(|conn| route.map_or(true, |r| conn.route == *r))
            .map(|conn| inner.target(conn))
            .collect()
    }

    pub async fn snapshot_by_expression(
        &self,
        expr: &TagExpr,
        route: Option<&Route>,
    ) -> Vec<DeliveryTarget> {
        let inner = self.inner.read().await;
        inner
            .connections
            .values()
            .filter(|conn| route.map_or(true, |r| conn.route == *r))
            .filter(|conn| expr.evaluate(&conn.tags))
            .map(|conn| inner.target(conn))
            .collect()
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        let routes = inner
            .route_index
            .iter()
            .map(|(route, ids)| (route.to_string(), ids.len()))
            .collect();
        RegistryStats {
            total_connections: inner.connections.len(),
            routes,
            distinct_tags: inner.tag_index.len(),
            ghost_connections: inner.connections.values().filter(|c| c.ghost).count(),
        }
    }
}
