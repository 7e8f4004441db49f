use axum::{Json, extract::State, http::StatusCode};
use types::score::ScoreEvent;

use crate::error::AppError;
use crate::state::AppState;

/// POST /scores
/// Body `{ userId, score, createdAt? }`; an empty body submits a random event.
pub async fn submit_score(
    State(state): State<AppState>,
    body: String,
) -> Result<(StatusCode, Json<ScoreEvent>), AppError> {
    let event = state.ingestion.submit(Some(&body)).await?;
    Ok((StatusCode::ACCEPTED, Json(event)))
}
