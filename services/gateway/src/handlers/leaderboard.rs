use axum::{Json, extract::State};
use types::leaderboard::LeaderboardSnapshot;

use crate::state::AppState;

/// GET /leaderboard
/// Latest snapshot, or an empty board before the first one was built.
pub async fn get_leaderboard(State(state): State<AppState>) -> Json<LeaderboardSnapshot> {
    Json(state.latest.snapshot().as_ref().clone())
}
