mod settings;

pub use settings::{BroadcastConfig, KvConfig, PingConfig, QueueConfig, Settings};
