use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use pipeline::IngestionError;
use serde_json::json;
use thiserror::Error;

/// Central error type for the gateway's HTTP surface
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error")]
    InternalError(#[from] anyhow::Error),
}

impl From<IngestionError> for AppError {
    fn from(err: IngestionError) -> Self {
        match err {
            IngestionError::InvalidEvent(e) => AppError::BadRequest(e.to_string()),
            IngestionError::Append(e) => AppError::ServiceUnavailable(e.to_string()),
            IngestionError::Encode(e) => AppError::InternalError(anyhow::anyhow!(e)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, code) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "BAD_REQUEST"),
            AppError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                msg,
                "SERVICE_UNAVAILABLE",
            ),
            AppError::InternalError(err) => {
                tracing::error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL_ERROR",
                )
            }
        };

        let body = Json(json!({
            "error": code,
            "message": error_message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_log::LogError;
    use types::errors::InvalidEventError;

    #[test]
    fn test_invalid_submission_maps_to_bad_request() {
        let err: AppError =
            IngestionError::InvalidEvent(InvalidEventError::MalformedScore("eof".into())).into();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_append_failure_maps_to_unavailable() {
        let err: AppError = IngestionError::Append(LogError::Closed).into();
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
