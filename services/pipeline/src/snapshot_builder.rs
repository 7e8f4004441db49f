//! Snapshot builder
//!
//! On every ranking-changed notification, reads the current top of the
//! ranking cache, resolves nicknames and publishes a full snapshot on
//! `leaderboard`. Snapshots are rebuilt from scratch each time, so any
//! number of redelivered notifications converge on the same result.

use std::sync::Arc;

use async_trait::async_trait;
use event_log::{LogError, Producer, Record};
use thiserror::Error;
use tracing::{debug, warn};
use types::ids::UserId;
use types::leaderboard::{LeaderboardSnapshot, LEADERBOARD_SIZE};
use types::ranking::RankingChanged;
use types::topics;

use crate::cache::{CacheError, NicknameCache, RankingCache};
use crate::consumer::{HandleError, RecordHandler};
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;

pub const COMPONENT: &str = "snapshot-builder";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("ranking read failed: {0}")]
    Ranking(#[from] CacheError),

    #[error("snapshot publish failed: {0}")]
    Publish(#[from] LogError),

    #[error("snapshot encode failed: {0}")]
    Encode(String),
}

pub struct SnapshotBuilder {
    ranking: Arc<dyn RankingCache>,
    nicknames: Arc<dyn NicknameCache>,
    producer: Arc<dyn Producer>,
    size: usize,
}

impl SnapshotBuilder {
    pub fn new(
        ranking: Arc<dyn RankingCache>,
        nicknames: Arc<dyn NicknameCache>,
        producer: Arc<dyn Producer>,
    ) -> Self {
        Self {
            ranking,
            nicknames,
            producer,
            size: LEADERBOARD_SIZE,
        }
    }

    /// Read the top entries and resolve their nicknames.
    ///
    /// A nickname lookup failure is not fatal: those entries get the
    /// placeholder nickname.
    pub async fn build(&self) -> Result<LeaderboardSnapshot, SnapshotError> {
        let rows = self.ranking.top_k(self.size).await?;
        let users: Vec<UserId> = rows.iter().map(|r| r.user_id).collect();

        let mut names = match self.nicknames.nicknames(&users).await {
            Ok(names) => names,
            Err(err) => {
                warn!(error = %err, users = users.len(), "Nickname lookup failed, using placeholder");
                Vec::new()
            }
        };
        names.resize(rows.len(), None);

        Ok(LeaderboardSnapshot::from_ranked(
            rows.into_iter().zip(names),
            chrono::Utc::now().timestamp_millis(),
        ))
    }

    pub async fn publish(&self) -> Result<LeaderboardSnapshot, SnapshotError> {
        let snapshot = self.build().await?;
        let payload = snapshot
            .to_json()
            .map_err(|e| SnapshotError::Encode(e.to_string()))?;

        // A fixed key keeps every snapshot on one partition, in build order.
        self.producer
            .send(topics::LEADERBOARD, Some(topics::LEADERBOARD), &payload)
            .await?;
        debug!(
            entries = snapshot.users.len(),
            last_modify_timestamp = snapshot.last_modify_timestamp,
            "Leaderboard snapshot published"
        );
        Ok(snapshot)
    }
}

pub struct SnapshotHandler {
    builder: Arc<SnapshotBuilder>,
    retry: RetryPolicy,
}

impl SnapshotHandler {
    pub fn new(builder: Arc<SnapshotBuilder>, retry: RetryPolicy) -> Self {
        Self { builder, retry }
    }
}

#[async_trait]
impl RecordHandler for SnapshotHandler {
    async fn handle(&self, record: &Record, shutdown: &Shutdown) -> Result<(), HandleError> {
        let notification = RankingChanged::from_slice(&record.payload)?;
        debug!(
            record_timestamp_ms = notification.record_timestamp_ms,
            "Rebuilding leaderboard"
        );

        self.retry
            .run("rebuild", shutdown, || self.builder.publish())
            .await
            .map_err(|e| HandleError::from_retry("rebuild", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryNicknameCache, MemoryRankingCache};
    use event_log::MemoryLog;
    use types::leaderboard::UNKNOWN_NICKNAME;

    struct FailingNicknames;

    #[async_trait]
    impl NicknameCache for FailingNicknames {
        async fn nickname(&self, _user: UserId) -> Result<Option<String>, CacheError> {
            Err(CacheError::Transport("connection reset".to_string()))
        }
    }

    fn builder(
        ranking: Arc<MemoryRankingCache>,
        nicknames: Arc<dyn NicknameCache>,
        log: &MemoryLog,
    ) -> SnapshotBuilder {
        SnapshotBuilder::new(ranking, nicknames, Arc::new(log.clone()))
    }

    #[tokio::test]
    async fn test_build_resolves_nicknames_and_placeholders() {
        let ranking = Arc::new(MemoryRankingCache::new());
        ranking.increment(UserId::new(1), 30).await.unwrap();
        ranking.increment(UserId::new(2), 50).await.unwrap();
        let nicknames = Arc::new(MemoryNicknameCache::new());
        nicknames.insert(UserId::new(2), "bob");

        let snapshot = builder(ranking, nicknames, &MemoryLog::new(1))
            .build()
            .await
            .unwrap();

        assert_eq!(snapshot.users.len(), 2);
        assert_eq!(snapshot.users[0].rank, 1);
        assert_eq!(snapshot.users[0].nickname, "bob");
        assert_eq!(snapshot.users[0].score, 50.0);
        assert_eq!(snapshot.users[1].nickname, UNKNOWN_NICKNAME);
    }

    #[tokio::test]
    async fn test_build_caps_at_leaderboard_size() {
        let ranking = Arc::new(MemoryRankingCache::new());
        for user in 1..=25 {
            ranking.increment(UserId::new(user), user).await.unwrap();
        }

        let snapshot = builder(ranking, Arc::new(MemoryNicknameCache::new()), &MemoryLog::new(1))
            .build()
            .await
            .unwrap();

        assert_eq!(snapshot.users.len(), LEADERBOARD_SIZE);
        assert_eq!(snapshot.users[0].score, 25.0);
        assert_eq!(snapshot.users[9].score, 16.0);
    }

    #[tokio::test]
    async fn test_nickname_failure_falls_back_to_placeholder() {
        let ranking = Arc::new(MemoryRankingCache::new());
        ranking.increment(UserId::new(9), 10).await.unwrap();

        let snapshot = builder(ranking, Arc::new(FailingNicknames), &MemoryLog::new(1))
            .build()
            .await
            .unwrap();

        assert_eq!(snapshot.users[0].nickname, UNKNOWN_NICKNAME);
    }

    #[tokio::test]
    async fn test_empty_ranking_publishes_empty_snapshot() {
        let log = MemoryLog::new(1);
        let snapshot = builder(
            Arc::new(MemoryRankingCache::new()),
            Arc::new(MemoryNicknameCache::new()),
            &log,
        )
        .publish()
        .await
        .unwrap();

        assert!(snapshot.is_empty());
        let records = log.records(topics::LEADERBOARD);
        assert_eq!(records.len(), 1);
        assert!(LeaderboardSnapshot::from_slice(&records[0].payload)
            .unwrap()
            .is_empty());
    }
}
