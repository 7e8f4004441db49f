use thiserror::Error;

/// Errors surfaced by event log clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("log transport error: {0}")]
    Transport(String),

    #[error("log operation timed out after {0}ms")]
    Timeout(u64),

    #[error("log is closed")]
    Closed,

    #[error("record rejected: {0}")]
    Rejected(String),
}

impl From<redis::RedisError> for LogError {
    fn from(err: redis::RedisError) -> Self {
        LogError::Transport(err.to_string())
    }
}
