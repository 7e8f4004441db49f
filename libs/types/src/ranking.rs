//! Ranking cache rows and change notifications

use std::cmp::Ordering;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::InvalidEventError;
use crate::ids::UserId;

/// Notification that the ranking cache changed.
///
/// Carries no payload besides the time the change was announced; the
/// snapshot builder always re-reads the cache in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingChanged {
    pub record_timestamp_ms: i64,
}

impl RankingChanged {
    pub fn now() -> Self {
        Self {
            record_timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, InvalidEventError> {
        serde_json::from_slice(payload)
            .map_err(|e| InvalidEventError::MalformedNotification(e.to_string()))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// One row of the ranking cache: a user and their cumulative score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedUser {
    pub user_id: UserId,
    pub score: f64,
}

impl RankedUser {
    pub fn new(user_id: UserId, score: f64) -> Self {
        Self { user_id, score }
    }
}

/// Leaderboard order: score descending, ties broken by ascending user id.
pub fn rank_order(a: &RankedUser, b: &RankedUser) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.user_id.cmp(&b.user_id))
}

/// Sort rows into leaderboard order and keep the first `k`.
pub fn top_k(mut rows: Vec<RankedUser>, k: usize) -> Vec<RankedUser> {
    rows.sort_by(rank_order);
    rows.truncate(k);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(user: i64, score: f64) -> RankedUser {
        RankedUser::new(UserId::new(user), score)
    }

    #[test]
    fn test_ranking_changed_wire_format() {
        let json = RankingChanged {
            record_timestamp_ms: 1708123456789,
        }
        .to_json()
        .unwrap();
        assert_eq!(
            String::from_utf8(json).unwrap(),
            r#"{"recordTimestampMs":1708123456789}"#
        );
    }

    #[test]
    fn test_ranking_changed_rejects_garbage() {
        let result = RankingChanged::from_slice(b"not json");
        assert!(matches!(
            result,
            Err(InvalidEventError::MalformedNotification(_))
        ));
    }

    #[test]
    fn test_rank_order_by_score_descending() {
        let rows = top_k(vec![row(1, 10.0), row(2, 30.0), row(3, 20.0)], 10);
        let users: Vec<i64> = rows.iter().map(|r| r.user_id.value()).collect();
        assert_eq!(users, vec![2, 3, 1]);
    }

    #[test]
    fn test_ties_broken_by_ascending_user_id() {
        let rows = top_k(vec![row(9, 50.0), row(3, 50.0), row(5, 50.0)], 2);
        let users: Vec<i64> = rows.iter().map(|r| r.user_id.value()).collect();
        assert_eq!(users, vec![3, 5]);
    }
}
