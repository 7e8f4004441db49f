//! Leaderboard snapshots
//!
//! A snapshot is a complete top-N view stamped with the time it was built.
//! Each snapshot supersedes the previous one in full; there is no diffing.

use serde::{Deserialize, Serialize};

use crate::errors::InvalidEventError;
use crate::ranking::RankedUser;

/// Number of entries in a leaderboard snapshot.
pub const LEADERBOARD_SIZE: usize = 10;

/// Placeholder shown when a user has no cached display name.
pub const UNKNOWN_NICKNAME: &str = "unknown";

/// One ranked row as shown to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    /// 1-based position
    pub rank: u32,
    pub nickname: String,
    pub score: f64,
}

/// Full leaderboard state at a point in time.
///
/// Wire format:
/// `{"lastModifyTimestamp":1708123456789,"users":[{"rank":1,"nickname":"ada","score":120.0}]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardSnapshot {
    /// Unix milliseconds when the snapshot was built
    pub last_modify_timestamp: i64,
    /// Entries in ascending rank order
    pub users: Vec<LeaderboardEntry>,
}

impl LeaderboardSnapshot {
    /// Placeholder served before any snapshot has been built.
    pub fn empty() -> Self {
        Self {
            last_modify_timestamp: 0,
            users: Vec::new(),
        }
    }

    /// Assign ranks 1..=n to rows that are already in leaderboard order.
    ///
    /// A missing nickname is replaced with [`UNKNOWN_NICKNAME`].
    pub fn from_ranked<I>(rows: I, last_modify_timestamp: i64) -> Self
    where
        I: IntoIterator<Item = (RankedUser, Option<String>)>,
    {
        let users = rows
            .into_iter()
            .enumerate()
            .map(|(index, (row, nickname))| LeaderboardEntry {
                rank: index as u32 + 1,
                nickname: nickname.unwrap_or_else(|| UNKNOWN_NICKNAME.to_string()),
                score: row.score,
            })
            .collect();

        Self {
            last_modify_timestamp,
            users,
        }
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, InvalidEventError> {
        serde_json::from_slice(payload)
            .map_err(|e| InvalidEventError::MalformedSnapshot(e.to_string()))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use crate::ranking::top_k;
    use proptest::prelude::*;

    fn row(user: i64, score: f64) -> RankedUser {
        RankedUser::new(UserId::new(user), score)
    }

    #[test]
    fn test_from_ranked_assigns_ranks_in_order() {
        let snapshot = LeaderboardSnapshot::from_ranked(
            vec![
                (row(1, 30.0), Some("ada".to_string())),
                (row(2, 20.0), Some("bob".to_string())),
            ],
            1708123456789,
        );

        assert_eq!(snapshot.users[0].rank, 1);
        assert_eq!(snapshot.users[0].nickname, "ada");
        assert_eq!(snapshot.users[1].rank, 2);
        assert_eq!(snapshot.last_modify_timestamp, 1708123456789);
    }

    #[test]
    fn test_missing_nickname_uses_placeholder() {
        let snapshot = LeaderboardSnapshot::from_ranked(vec![(row(1, 5.0), None)], 1);
        assert_eq!(snapshot.users[0].nickname, UNKNOWN_NICKNAME);
    }

    #[test]
    fn test_empty_placeholder_wire_format() {
        let json = String::from_utf8(LeaderboardSnapshot::empty().to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"lastModifyTimestamp":0,"users":[]}"#);
    }

    #[test]
    fn test_entry_wire_format() {
        let snapshot = LeaderboardSnapshot::from_ranked(
            vec![(row(1, 15.0), Some("ada".to_string()))],
            42,
        );
        let json = String::from_utf8(snapshot.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"lastModifyTimestamp":42,"users":[{"rank":1,"nickname":"ada","score":15.0}]}"#
        );
    }

    #[test]
    fn test_from_slice_rejects_wrong_shape() {
        let result = LeaderboardSnapshot::from_slice(br#"{"users":"nope"}"#);
        assert!(matches!(result, Err(InvalidEventError::MalformedSnapshot(_))));
    }

    proptest! {
        #[test]
        fn prop_snapshot_sorted_and_bounded(
            scores in proptest::collection::vec((1i64..500, 0u32..1_000), 0..60)
        ) {
            let rows: Vec<RankedUser> = scores
                .iter()
                .map(|(user, score)| row(*user, *score as f64))
                .collect();
            let ranked = top_k(rows, LEADERBOARD_SIZE);
            let snapshot = LeaderboardSnapshot::from_ranked(
                ranked.into_iter().map(|r| (r, None)),
                1,
            );

            prop_assert!(snapshot.users.len() <= LEADERBOARD_SIZE);
            for (index, entry) in snapshot.users.iter().enumerate() {
                prop_assert_eq!(entry.rank as usize, index + 1);
            }
            for pair in snapshot.users.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
        }
    }
}
