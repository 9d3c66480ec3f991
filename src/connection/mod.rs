//! Per-connection model: routes, outbound frames, the injected send
//! capability, and the per-connection ping/queue bookkeeping owned by the
//! registry.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// Logical endpoint a connection belongs to.
///
/// Connections upgraded without an explicit route land on [`Route::Default`],
/// a real member of every route-unaware broadcast rather than a missing
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    Default,
    Named(String),
}

impl Route {
    pub fn named(route: impl Into<String>) -> Self {
        Self::Named(route.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Route::Default => "",
            Route::Named(name) => name,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Default => f.write_str("(default)"),
            Route::Named(name) => f.write_str(name),
        }
    }
}

impl From<Option<String>> for Route {
    fn from(route: Option<String>) -> Self {
        match route {
            Some(name) if !name.is_empty() => Route::Named(name),
            _ => Route::Default,
        }
    }
}

impl From<&str> for Route {
    fn from(route: &str) -> Self {
        if route.is_empty() {
            Route::Default
        } else {
            Route::Named(route.to_string())
        }
    }
}

/// Frames handed to the I/O layer for a single connection.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Opaque payload bytes, shared across all recipients of one broadcast.
    Data(Arc<[u8]>),
    /// Liveness probe; the I/O layer answers with `record_pong`.
    Ping { seq: u64 },
    /// Ask the I/O layer to tear the socket down.
    Close,
}

/// Returned by a sink whose peer is gone.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("connection sink closed")]
pub struct SinkClosed;

/// The injected per-connection send capability.
///
/// The registry never owns the socket; it holds one of these, sufficient to
/// hand bytes to whatever writer task the I/O layer runs.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, frame: OutboundFrame) -> Result<(), SinkClosed>;
}

/// Standard sink: a bounded channel drained by the socket writer task.
pub struct ChannelSink {
    sender: mpsc::Sender<OutboundFrame>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl DeliverySink for ChannelSink {
    async fn deliver(&self, frame: OutboundFrame) -> Result<(), SinkClosed> {
        self.sender.send(frame).await.map_err(|_| SinkClosed)
    }
}

/// How a tracked outbound message was addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendKind {
    Direct,
    Broadcast,
    Tag,
    Expression,
}

impl fmt::Display for SendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SendKind::Direct => "direct",
            SendKind::Broadcast => "broadcast",
            SendKind::Tag => "tag",
            SendKind::Expression => "expression",
        };
        f.write_str(s)
    }
}

/// Descriptor of one delivered message, kept by the queue counter.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessage {
    pub seq: u64,
    #[serde(skip)]
    pub payload: Arc<[u8]>,
    pub route: String,
    pub timestamp: DateTime<Utc>,
    pub kind: SendKind,
    /// The tag, expression, or connection id the send was addressed to.
    pub target: String,
}

/// Advisory outbound-message accounting over a fixed window.
///
/// Counts only; exceeding `max_messages` never blocks or drops a send. The
/// caller reads the count and the recent descriptors and applies its own
/// policy.
#[derive(Debug)]
pub struct QueueCounter {
    pub max_messages: u64,
    pub max_window: Duration,
    count: u64,
    window_start: DateTime<Utc>,
    next_seq: u64,
    messages: VecDeque<QueuedMessage>,
    /// Cap on retained descriptors, not on the counter itself.
    max_tracked: usize,
}

impl QueueCounter {
    pub fn new(max_messages: u64, max_window: Duration, max_tracked: usize) -> Self {
        Self {
            max_messages,
            max_window,
            count: 0,
            window_start: Utc::now(),
            next_seq: 0,
            messages: VecDeque::new(),
            max_tracked,
        }
    }

    /// Record one delivered message, returning its sequence number. Resets
    /// the window first if it has elapsed.
    pub fn record(
        &mut self,
        payload: Arc<[u8]>,
        route: &Route,
        kind: SendKind,
        target: &str,
    ) -> u64 {
        let now = Utc::now();
        let elapsed = now.signed_duration_since(self.window_start);
        if elapsed >= chrono::Duration::from_std(self.max_window).unwrap_or_default() {
            self.count = 0;
            self.window_start = now;
        }

        self.count += 1;
        self.next_seq += 1;
        if self.max_tracked > 0 {
            if self.messages.len() >= self.max_tracked {
                self.messages.pop_front();
            }
            self.messages.push_back(QueuedMessage {
                seq: self.next_seq,
                payload,
                route: route.to_string(),
                timestamp: now,
                kind,
                target: target.to_string(),
            });
        }
        self.next_seq
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    pub fn over_limit(&self) -> bool {
        self.count > self.max_messages
    }

    pub fn messages(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.messages.iter()
    }

    /// Drops the retained descriptors. The window counter is untouched.
    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }
}

/// Periodic-ping state for one connection.
#[derive(Debug, Clone)]
pub struct PingState {
    pub interval: Duration,
    pub last_ping_at: Option<Instant>,
    pub last_seq: u64,
    pub last_round_trip: Option<Duration>,
}

impl PingState {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_ping_at: None,
            last_seq: 0,
            last_round_trip: None,
        }
    }

    /// True when the next ping is due.
    pub fn due(&self, now: Instant) -> bool {
        match self.last_ping_at {
            None => true,
            Some(at) => now.duration_since(at) >= self.interval,
        }
    }
}

/// The mutable per-socket record. Owned exclusively by the registry; callers
/// address it by id and never hold a reference across operations.
pub struct Connection {
    pub id: String,
    pub route: Route,
    pub tags: HashSet<String>,
    pub info: HashMap<String, String>,
    pub sink: Arc<dyn DeliverySink>,
    pub connected_at: DateTime<Utc>,
    pub ping: Option<PingState>,
    pub queue: Option<QueueCounter>,
    /// Ghost connections survive disconnect until explicitly released.
    pub ghost: bool,
}

impl Connection {
    pub fn new(id: String, route: Route, sink: Arc<dyn DeliverySink>) -> Self {
        Self {
            id,
            route,
            tags: HashSet::new(),
            info: HashMap::new(),
            sink,
            connected_at: Utc::now(),
            ping: None,
            queue: None,
            ghost: false,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("tags", &self.tags)
            .field("ghost", &self.ghost)
            .finish_non_exhaustive()
    }
}
