//! Error types for replication and leader election.
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Push or pull handler failed |
//! | `Stream` | Yes | Live stream could not connect or dropped |
//! | `Storage` | Yes | Checkpoint or flush failed |
//! | `Core` | No | Local store rejected a document or is closed |
//! | `Config` | No | Configuration invalid |
//! | `Shutdown` | No | Replication is stopping |

use lofi_storage::StorageError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A push or pull handler failed. The checkpoint is left untouched.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The live pull stream failed; a full pull cycle follows.
    #[error("Stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Core(#[from] lofi_core::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Replication stopped")]
    Shutdown,
}

impl ReplicationError {
    pub fn transport(message: impl Into<String>) -> Self {
        ReplicationError::Transport(message.into())
    }

    pub fn stream(message: impl Into<String>) -> Self {
        ReplicationError::Stream(message.into())
    }

    /// Whether the operation should be retried with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::Transport(_) | ReplicationError::Stream(_) | ReplicationError::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ReplicationError::transport("connection refused").is_retryable());
        assert!(ReplicationError::stream("eof").is_retryable());
        assert!(ReplicationError::Storage(StorageError::Database("busy".into())).is_retryable());
        assert!(!ReplicationError::Core(lofi_core::Error::Closed).is_retryable());
        assert!(!ReplicationError::Config("bad".into()).is_retryable());
        assert!(!ReplicationError::Shutdown.is_retryable());
    }
}
