//! Score events
//!
//! A `ScoreEvent` is produced once by score ingestion, appended to the
//! `scoring` topic keyed by user, and never mutated afterwards.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::InvalidEventError;
use crate::ids::UserId;

/// Synthetic user ids are drawn from `[1, SYNTHETIC_MAX_USER_ID)`.
pub const SYNTHETIC_MAX_USER_ID: i64 = 1_000_000;

/// Synthetic scores are drawn from `[1, SYNTHETIC_MAX_SCORE)`.
pub const SYNTHETIC_MAX_SCORE: i64 = 101;

/// A single scoring occurrence for one user.
///
/// Wire format: `{"userId":1,"score":10,"createdAt":"2024-02-16T12:00:00Z"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEvent {
    pub user_id: UserId,
    pub score: i64,
    pub created_at: DateTime<Utc>,
}

/// Inbound shape: clients may omit `createdAt`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScoreSubmission {
    user_id: UserId,
    score: i64,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl ScoreEvent {
    pub fn new(user_id: UserId, score: i64, created_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            score,
            created_at,
        }
    }

    /// Parse a client submission, stamping `createdAt` with the current
    /// time when the client left it out.
    pub fn parse(raw: &str) -> Result<Self, InvalidEventError> {
        let submission: ScoreSubmission = serde_json::from_str(raw)
            .map_err(|e| InvalidEventError::MalformedScore(e.to_string()))?;

        Ok(Self {
            user_id: submission.user_id,
            score: submission.score,
            created_at: submission.created_at.unwrap_or_else(Utc::now),
        })
    }

    /// Decode an event log payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, InvalidEventError> {
        let raw = std::str::from_utf8(payload).map_err(|_| InvalidEventError::NotUtf8)?;
        Self::parse(raw)
    }

    /// Build a random event, used when a submission carries no body and by
    /// the load generator.
    pub fn synthetic<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            user_id: UserId::new(rng.gen_range(1..SYNTHETIC_MAX_USER_ID)),
            score: rng.gen_range(1..SYNTHETIC_MAX_SCORE),
            created_at: Utc::now(),
        }
    }

    /// Partition key on the `scoring` topic.
    pub fn partition_key(&self) -> String {
        self.user_id.to_string()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
