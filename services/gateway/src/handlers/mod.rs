pub mod health;
pub mod leaderboard;
pub mod scores;
pub mod ws;
