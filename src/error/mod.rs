//! Unified error type for queue operations.

use thiserror::Error;

/// Maximum length of a logical queue name.
///
/// Physical identifiers are limited to 64 characters and two of them are
/// reserved for the `q_` table prefix.
pub const MAX_QUEUE_NAME_LEN: usize = 62;

#[derive(Error, Debug)]
pub enum QueueError {
    /// Logical queue name cannot be mapped onto a physical identifier
    #[error("Invalid queue name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// Capability intentionally absent on this queue variant
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A queue role asks for a backend that has no connection configured
    #[error("Backend not configured: {0}")]
    BackendUnavailable(&'static str),

    /// Reply channel publish without a usable correlation id
    #[error("Reply queue message does not have a correlation id")]
    MissingCorrelationId,

    /// PostgreSQL operation failed
    #[error("PostgreSQL error: {0}")]
    Database(#[from] sqlx::Error),

    /// AMQP broker operation failed
    #[error("Broker error: {0}")]
    Broker(String),

    /// Broker management API call failed
    #[error("Management API error: {0}")]
    Management(#[from] reqwest::Error),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A consumer handler returned an error; the consume loop was aborted
    #[error("Message handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl QueueError {
    /// Wrap an arbitrary handler failure.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Handler(err.into())
    }

    /// Whether the underlying store or broker call itself failed.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Broker(_) | Self::Management(_)
        )
    }
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        Self::Broker(err.to_string())
    }
}

/// Validate a logical queue name against the physical identifier budget.
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(QueueError::InvalidName {
            name: name.to_string(),
            reason: "name must not be empty".to_string(),
        });
    }
    // Identifier limits are byte limits.
    let len = name.len();
    if len > MAX_QUEUE_NAME_LEN {
        return Err(QueueError::InvalidName {
            name: name.to_string(),
            reason: format!(
                "name is {} bytes, max length is {} characters",
                len, MAX_QUEUE_NAME_LEN
            ),
        });
    }
    Ok(())
}

pub type Result<T> = std::result::Result<T, QueueError>;
