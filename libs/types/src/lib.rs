//! Types library for the real-time leaderboard pipeline
//!
//! This library provides the data model shared by every stage of the
//! pipeline and by the broadcast gateway, so that the JSON exchanged over
//! the event log and the client channel has exactly one definition.
//!
//! # Modules
//! - `ids`: Identifiers (UserId, ConnectionId)
//! - `score`: Score events produced by ingestion
//! - `ranking`: Ranking-changed notifications and ranking cache rows
//! - `leaderboard`: Leaderboard entries and snapshots
//! - `topics`: Event log topic names
//! - `errors`: Error taxonomy

pub mod ids;
pub mod score;
pub mod ranking;
pub mod leaderboard;
pub mod topics;
pub mod errors;
