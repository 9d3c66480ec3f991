// Infrastructure layer (shared components)
pub mod config;
pub mod error;
pub mod metrics;

// Domain layer (coordination core)
pub mod broadcast;
pub mod connection;
pub mod kv;
pub mod registry;
pub mod search;
pub mod tagexpr;

// Supporting modules
pub mod ping;
pub mod telemetry;

// Flat re-exports of the types an embedding gateway touches constantly
pub use broadcast::{Broadcaster, DeliveryReport};
pub use connection::{ChannelSink, DeliverySink, OutboundFrame, Route, SendKind, SinkClosed};
pub use error::{HubError, Result};
pub use kv::GlobalKvStore;
pub use ping::{PingSupervisor, SupervisorConfig};
pub use registry::{ConnectionRegistry, RegistryStats};
pub use search::SearchOperator;
pub use tagexpr::TagExpr;
