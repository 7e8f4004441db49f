//! Ranking cache and nickname cache
//!
//! The ranking cache keeps one cumulative score per user and answers top-K
//! queries in leaderboard order. The nickname cache maps a user id to a
//! display name and is written by something outside this system.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{debug, warn};
use types::ids::UserId;
use types::ranking::{top_k, RankedUser};

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache transport error: {0}")]
    Transport(String),

    #[error("cache operation timed out after {0}ms")]
    Timeout(u64),

    #[error("cache state poisoned")]
    Poisoned,
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Transport(err.to_string())
    }
}

#[async_trait]
pub trait RankingCache: Send + Sync {
    /// Atomically add `delta` to the user's score, creating it at zero.
    /// Returns the new total.
    async fn increment(&self, user: UserId, delta: i64) -> Result<f64, CacheError>;

    /// Up to `k` users ordered by score descending, then user id ascending.
    async fn top_k(&self, k: usize) -> Result<Vec<RankedUser>, CacheError>;
}

#[async_trait]
pub trait NicknameCache: Send + Sync {
    async fn nickname(&self, user: UserId) -> Result<Option<String>, CacheError>;

    /// One lookup result per user, in input order.
    async fn nicknames(&self, users: &[UserId]) -> Result<Vec<Option<String>>, CacheError> {
        let mut names = Vec::with_capacity(users.len());
        for user in users {
            names.push(self.nickname(*user).await?);
        }
        Ok(names)
    }
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, CacheError>
where
    F: std::future::Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(CacheError::from),
        Err(_) => Err(CacheError::Timeout(limit.as_millis() as u64)),
    }
}

/// Score with a total order, so it can key the sorted index.
#[derive(Debug, Clone, Copy)]
struct OrderedScore(f64);

impl PartialEq for OrderedScore {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedScore {}

impl PartialOrd for OrderedScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Iterating the set ascending yields leaderboard order.
type RankKey = (Reverse<OrderedScore>, UserId);

#[derive(Debug, Default)]
struct Ranking {
    scores: HashMap<UserId, f64>,
    order: BTreeSet<RankKey>,
}

/// In-process ranking cache.
///
/// Totals live in a map with a sorted index beside it, both updated under
/// one lock, so `top_k` walks only the first `k` index entries.
#[derive(Debug, Default)]
pub struct MemoryRankingCache {
    ranking: Mutex<Ranking>,
}

impl MemoryRankingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(&self, user: UserId) -> Option<f64> {
        self.ranking.lock().ok()?.scores.get(&user).copied()
    }

    pub fn len(&self) -> usize {
        self.ranking.lock().map(|r| r.scores.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RankingCache for MemoryRankingCache {
    async fn increment(&self, user: UserId, delta: i64) -> Result<f64, CacheError> {
        let mut ranking = self.ranking.lock().map_err(|_| CacheError::Poisoned)?;
        let Ranking { scores, order } = &mut *ranking;

        let total = scores.entry(user).or_insert(0.0);
        order.remove(&(Reverse(OrderedScore(*total)), user));
        *total += delta as f64;
        order.insert((Reverse(OrderedScore(*total)), user));
        Ok(*total)
    }

    async fn top_k(&self, k: usize) -> Result<Vec<RankedUser>, CacheError> {
        let ranking = self.ranking.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(ranking
            .order
            .iter()
            .take(k)
            .map(|(Reverse(score), user)| RankedUser::new(*user, score.0))
            .collect())
    }
}

/// Ranking cache over a Redis sorted set; members are decimal user ids.
#[derive(Clone)]
pub struct RedisRankingCache {
    conn: MultiplexedConnection,
    key: String,
    op_timeout: Duration,
}

impl RedisRankingCache {
    pub fn new(conn: MultiplexedConnection, key: impl Into<String>, op_timeout: Duration) -> Self {
        Self {
            conn,
            key: key.into(),
            op_timeout,
        }
    }

    fn parse_rows(&self, raw: Vec<(String, f64)>) -> Vec<RankedUser> {
        raw.into_iter()
            .filter_map(|(member, score)| match member.parse::<UserId>() {
                Ok(user) => Some(RankedUser::new(user, score)),
                Err(_) => {
                    warn!(key = %self.key, member = %member, "Non-numeric ranking member ignored");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl RankingCache for RedisRankingCache {
    async fn increment(&self, user: UserId, delta: i64) -> Result<f64, CacheError> {
        let mut conn = self.conn.clone();
        let total: f64 = with_timeout(
            self.op_timeout,
            conn.zincr(&self.key, user.to_string(), delta),
        )
        .await?;
        Ok(total)
    }

    /// Redis breaks score ties by member bytes in reverse, which is not
    /// ascending user id. Everyone tied with the last score in the head is
    /// fetched as well, then the union is re-sorted.
    async fn top_k(&self, k: usize) -> Result<Vec<RankedUser>, CacheError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let head: Vec<(String, f64)> = with_timeout(
            self.op_timeout,
            conn.zrevrange_withscores(&self.key, 0, k as isize - 1),
        )
        .await?;
        let mut rows = self.parse_rows(head);

        if rows.len() == k {
            if let Some(boundary) = rows.last().map(|r| r.score) {
                let tied: Vec<(String, f64)> = with_timeout(
                    self.op_timeout,
                    conn.zrangebyscore_withscores(&self.key, boundary, boundary),
                )
                .await?;
                for extra in self.parse_rows(tied) {
                    if !rows.iter().any(|r| r.user_id == extra.user_id) {
                        rows.push(extra);
                    }
                }
            }
        }

        debug!(key = %self.key, fetched = rows.len(), "Read ranking head");
        Ok(top_k(rows, k))
    }
}

/// In-process nickname cache, filled by whoever owns the process.
#[derive(Debug, Default)]
pub struct MemoryNicknameCache {
    names: RwLock<HashMap<UserId, String>>,
}

impl MemoryNicknameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserId, nickname: impl Into<String>) {
        if let Ok(mut names) = self.names.write() {
            names.insert(user, nickname.into());
        }
    }
}

#[async_trait]
impl NicknameCache for MemoryNicknameCache {
    async fn nickname(&self, user: UserId) -> Result<Option<String>, CacheError> {
        let names = self.names.read().map_err(|_| CacheError::Poisoned)?;
        Ok(names.get(&user).cloned())
    }
}

/// Nickname cache over plain Redis string keys `{prefix}{userId}`.
#[derive(Clone)]
pub struct RedisNicknameCache {
    conn: MultiplexedConnection,
    prefix: String,
    op_timeout: Duration,
}

impl RedisNicknameCache {
    pub fn new(conn: MultiplexedConnection, prefix: impl Into<String>, op_timeout: Duration) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            op_timeout,
        }
    }

    fn key(&self, user: UserId) -> String {
        format!("{}{}", self.prefix, user)
    }
}

#[async_trait]
impl NicknameCache for RedisNicknameCache {
    async fn nickname(&self, user: UserId) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        with_timeout(self.op_timeout, conn.get(self.key(user))).await
    }

    async fn nicknames(&self, users: &[UserId]) -> Result<Vec<Option<String>>, CacheError> {
        if users.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = users.iter().map(|u| self.key(*u)).collect();
        let mut conn = self.conn.clone();
        let names: Vec<Option<String>> = with_timeout(self.op_timeout, conn.mget(&keys)).await?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64) -> UserId {
        UserId::new(id)
    }

    #[tokio::test]
    async fn test_increment_creates_at_zero() {
        let cache = MemoryRankingCache::new();
        assert_eq!(cache.increment(user(7), 15).await.unwrap(), 15.0);
        assert_eq!(cache.increment(user(7), 5).await.unwrap(), 20.0);
        assert_eq!(cache.score(user(7)), Some(20.0));
        assert_eq!(cache.score(user(8)), None);
    }

    #[tokio::test]
    async fn test_negative_delta_decrements() {
        let cache = MemoryRankingCache::new();
        cache.increment(user(1), 10).await.unwrap();
        assert_eq!(cache.increment(user(1), -4).await.unwrap(), 6.0);
    }

    #[tokio::test]
    async fn test_top_k_orders_with_tie_break() {
        let cache = MemoryRankingCache::new();
        cache.increment(user(3), 50).await.unwrap();
        cache.increment(user(1), 50).await.unwrap();
        cache.increment(user(2), 70).await.unwrap();
        cache.increment(user(4), 10).await.unwrap();

        let top = cache.top_k(3).await.unwrap();
        let ids: Vec<i64> = top.iter().map(|r| r.user_id.value()).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[tokio::test]
    async fn test_index_follows_score_changes() {
        let cache = MemoryRankingCache::new();
        for id in 1..=5 {
            cache.increment(user(id), id * 10).await.unwrap();
        }

        // User 1 overtakes everyone, user 5 drops to the bottom.
        cache.increment(user(1), 100).await.unwrap();
        cache.increment(user(5), -60).await.unwrap();

        let top = cache.top_k(10).await.unwrap();
        let rows: Vec<(i64, f64)> = top.iter().map(|r| (r.user_id.value(), r.score)).collect();
        assert_eq!(
            rows,
            vec![(1, 110.0), (4, 40.0), (3, 30.0), (2, 20.0), (5, -10.0)]
        );
        assert_eq!(cache.len(), 5);
    }

    #[tokio::test]
    async fn test_top_k_matches_full_sort_on_many_users() {
        let cache = MemoryRankingCache::new();
        let mut expected = HashMap::new();
        for n in 0..2_000i64 {
            let id = (n * 7919) % 500 + 1;
            let delta = (n * 31) % 97 - 20;
            cache.increment(user(id), delta).await.unwrap();
            *expected.entry(user(id)).or_insert(0.0) += delta as f64;
        }

        let rows = expected
            .into_iter()
            .map(|(id, score)| RankedUser::new(id, score))
            .collect();
        assert_eq!(cache.top_k(10).await.unwrap(), top_k(rows, 10));
    }

    #[tokio::test]
    async fn test_top_k_on_empty_cache() {
        let cache = MemoryRankingCache::new();
        assert!(cache.top_k(10).await.unwrap().is_empty());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_increments_sum() {
        let cache = std::sync::Arc::new(MemoryRankingCache::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    cache.increment(user(1), 1).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(cache.score(user(1)), Some(800.0));
    }

    #[tokio::test]
    async fn test_nickname_lookup_in_order() {
        let names = MemoryNicknameCache::new();
        names.insert(user(1), "alice");
        names.insert(user(3), "carol");

        let found = names.nicknames(&[user(3), user(2), user(1)]).await.unwrap();
        assert_eq!(
            found,
            vec![Some("carol".to_string()), None, Some("alice".to_string())]
        );
    }
}
