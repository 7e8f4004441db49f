//! Ranking update consumer
//!
//! Adds each event's score to the user's cumulative total, then announces
//! the change on `ranking-changed`. The two steps retry independently so a
//! failing emit never re-applies the increment. A crash between them still
//! does: the record is redelivered and counted twice.

use std::sync::Arc;

use async_trait::async_trait;
use event_log::{Producer, Record};
use tracing::debug;
use types::ranking::RankingChanged;
use types::score::ScoreEvent;
use types::topics;

use crate::cache::RankingCache;
use crate::consumer::{HandleError, RecordHandler};
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;

pub const COMPONENT: &str = "ranking-update";

pub struct RankingUpdateHandler {
    cache: Arc<dyn RankingCache>,
    producer: Arc<dyn Producer>,
    retry: RetryPolicy,
}

impl RankingUpdateHandler {
    pub fn new(cache: Arc<dyn RankingCache>, producer: Arc<dyn Producer>, retry: RetryPolicy) -> Self {
        Self {
            cache,
            producer,
            retry,
        }
    }
}

#[async_trait]
impl RecordHandler for RankingUpdateHandler {
    async fn handle(&self, record: &Record, shutdown: &Shutdown) -> Result<(), HandleError> {
        let event = ScoreEvent::from_slice(&record.payload)?;

        let total = self
            .retry
            .run("increment", shutdown, || {
                self.cache.increment(event.user_id, event.score)
            })
            .await
            .map_err(|e| HandleError::from_retry("increment", e))?;

        let payload = RankingChanged::now()
            .to_json()
            .map_err(|e| HandleError::Exhausted {
                operation: "encode",
                reason: e.to_string(),
            })?;

        self.retry
            .run("emit", shutdown, || {
                self.producer.send(topics::RANKING_CHANGED, None, &payload)
            })
            .await
            .map_err(|e| HandleError::from_retry("emit", e))?;

        debug!(user_id = %event.user_id, delta = event.score, total, "Ranking updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryRankingCache;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use event_log::{LogError, MemoryLog, Position};
    use types::ids::UserId;

    /// Fails the first `failures` sends, then appends to the wrapped log.
    struct FlakyProducer {
        log: MemoryLog,
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyProducer {
        fn new(log: &MemoryLog, failures: u32) -> Self {
            Self {
                log: log.clone(),
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Producer for FlakyProducer {
        async fn send(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<(), LogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(LogError::Transport("broker unavailable".to_string()));
            }
            self.log.send(topic, key, payload).await
        }
    }

    fn retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base: Duration::from_millis(1),
            max: Duration::from_millis(2),
        }
    }

    fn score_record(user: i64, score: i64) -> Record {
        let event = ScoreEvent::new(UserId::new(user), score, chrono::Utc::now());
        Record {
            topic: topics::SCORING.to_string(),
            partition: 0,
            position: Position::Offset(0),
            key: Some(event.partition_key()),
            payload: event.to_json().unwrap(),
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_emit_retry_does_not_reapply_increment() {
        let log = MemoryLog::new(1);
        let cache = Arc::new(MemoryRankingCache::new());
        let producer = Arc::new(FlakyProducer::new(&log, 2));
        let handler = RankingUpdateHandler::new(cache.clone(), producer.clone(), retry(5));
        let (_trigger, shutdown) = crate::shutdown::channel();

        handler.handle(&score_record(4, 25), &shutdown).await.unwrap();

        assert_eq!(cache.score(UserId::new(4)), Some(25.0));
        assert_eq!(producer.calls.load(Ordering::SeqCst), 3);
        let notifications = log.records(topics::RANKING_CHANGED);
        assert_eq!(notifications.len(), 1);
        assert!(RankingChanged::from_slice(&notifications[0].payload).is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_emit_keeps_single_increment() {
        let log = MemoryLog::new(1);
        let cache = Arc::new(MemoryRankingCache::new());
        let producer = Arc::new(FlakyProducer::new(&log, u32::MAX));
        let handler = RankingUpdateHandler::new(cache.clone(), producer.clone(), retry(3));
        let (_trigger, shutdown) = crate::shutdown::channel();

        let result = handler.handle(&score_record(4, 25), &shutdown).await;

        assert!(matches!(
            result,
            Err(HandleError::Exhausted { operation: "emit", .. })
        ));
        assert_eq!(cache.score(UserId::new(4)), Some(25.0));
        assert_eq!(producer.calls.load(Ordering::SeqCst), 3);
        assert!(log.is_empty(topics::RANKING_CHANGED));
    }

    #[tokio::test]
    async fn test_malformed_record_touches_nothing() {
        let log = MemoryLog::new(1);
        let cache = Arc::new(MemoryRankingCache::new());
        let handler = RankingUpdateHandler::new(cache.clone(), Arc::new(log.clone()), retry(3));
        let (_trigger, shutdown) = crate::shutdown::channel();
        let mut record = score_record(1, 1);
        record.payload = b"not json".to_vec();

        let result = handler.handle(&record, &shutdown).await;

        assert!(matches!(result, Err(HandleError::Malformed(_))));
        assert!(cache.is_empty());
        assert!(log.is_empty(topics::RANKING_CHANGED));
    }
}
