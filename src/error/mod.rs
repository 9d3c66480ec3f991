use thiserror::Error;

/// Error taxonomy for the coordination core.
///
/// Structural errors (duplicate id, syntax, operator misuse) are returned
/// synchronously by the operation that caused them. Per-recipient delivery
/// failures during a broadcast are never surfaced here; they are aggregated
/// into a [`crate::broadcast::DeliveryReport`].
#[derive(Error, Debug)]
pub enum HubError {
    #[error("duplicate connection id: {0}")]
    DuplicateId(String),

    #[error("connection not found: {0}")]
    NotFound(String),

    #[error("tag expression syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unknown search operator: {0}")]
    UnknownOperator(String),

    #[error("invalid search pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl HubError {
    pub fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
