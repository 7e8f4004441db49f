//! Score ingestion
//!
//! Turns a client submission into a [`ScoreEvent`] and appends it to the
//! `scoring` topic, keyed by user id so one user's events stay ordered.

use std::sync::Arc;

use event_log::{LogError, Producer};
use thiserror::Error;
use tracing::{debug, warn};
use types::errors::InvalidEventError;
use types::score::ScoreEvent;
use types::topics;

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("invalid score submission: {0}")]
    InvalidEvent(#[from] InvalidEventError),

    #[error("failed to append score event: {0}")]
    Append(#[from] LogError),

    #[error("failed to encode score event: {0}")]
    Encode(String),
}

#[derive(Clone)]
pub struct ScoreIngestion {
    producer: Arc<dyn Producer>,
}

impl ScoreIngestion {
    pub fn new(producer: Arc<dyn Producer>) -> Self {
        Self { producer }
    }

    /// Submit a score.
    ///
    /// `None` or a blank body produces a synthetic event; anything else must
    /// parse as a score submission. The event is returned once appended.
    pub async fn submit(&self, raw: Option<&str>) -> Result<ScoreEvent, IngestionError> {
        let event = match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
            None => ScoreEvent::synthetic(&mut rand::thread_rng()),
            Some(raw) => ScoreEvent::parse(raw).map_err(|err| {
                warn!(error = %err, "Rejected score submission");
                err
            })?,
        };

        self.publish(&event).await?;
        Ok(event)
    }

    pub async fn publish(&self, event: &ScoreEvent) -> Result<(), IngestionError> {
        let payload = event
            .to_json()
            .map_err(|e| IngestionError::Encode(e.to_string()))?;
        let key = event.partition_key();

        self.producer
            .send(topics::SCORING, Some(&key), &payload)
            .await?;

        debug!(
            user_id = %event.user_id,
            score = event.score,
            topic = topics::SCORING,
            "Score event published"
        );
        Ok(())
    }
}
