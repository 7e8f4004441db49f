//! Persistence consumer: save each score event to the durable store.

use std::sync::Arc;

use async_trait::async_trait;
use event_log::Record;
use tracing::debug;
use types::score::ScoreEvent;

use crate::consumer::{HandleError, RecordHandler};
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;
use crate::store::ScoreStore;

pub const COMPONENT: &str = "persistence";

pub struct PersistenceHandler {
    store: Arc<dyn ScoreStore>,
    retry: RetryPolicy,
}

impl PersistenceHandler {
    pub fn new(store: Arc<dyn ScoreStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }
}

#[async_trait]
impl RecordHandler for PersistenceHandler {
    async fn handle(&self, record: &Record, shutdown: &Shutdown) -> Result<(), HandleError> {
        let event = ScoreEvent::from_slice(&record.payload)?;

        self.retry
            .run("save", shutdown, || self.store.save(&event))
            .await
            .map_err(|e| HandleError::from_retry("save", e))?;

        debug!(user_id = %event.user_id, score = event.score, "Score saved");
        Ok(())
    }
}
