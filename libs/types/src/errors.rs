//! Error types shared across the pipeline
//!
//! Only input-shape errors live here; infrastructure errors belong to the
//! crate that owns the infrastructure client.

use thiserror::Error;

/// A payload could not be decoded into one of the pipeline's message types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidEventError {
    #[error("Malformed score event: {0}")]
    MalformedScore(String),

    #[error("Malformed ranking-changed notification: {0}")]
    MalformedNotification(String),

    #[error("Malformed leaderboard snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("Payload is not valid UTF-8")]
    NotUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_score_display() {
        let err = InvalidEventError::MalformedScore("expected value at line 1".to_string());
        assert_eq!(
            err.to_string(),
            "Malformed score event: expected value at line 1"
        );
    }

    #[test]
    fn test_not_utf8_display() {
        assert_eq!(
            InvalidEventError::NotUtf8.to_string(),
            "Payload is not valid UTF-8"
        );
    }
}
