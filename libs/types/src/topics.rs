//! Event log topic names
//!
//! These names are part of the external contract; other producers and
//! consumers of the log address the topics by these exact strings.

/// `ScoreEvent` records, keyed by user id.
pub const SCORING: &str = "scoring";

/// `RankingChanged` notifications.
pub const RANKING_CHANGED: &str = "ranking-changed";

/// `LeaderboardSnapshot` records.
pub const LEADERBOARD: &str = "leaderboard";
