pub mod calendars;
pub mod dav;
pub mod events;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use calcard_core::CalCardError;
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .merge(calendars::router())
        .merge(events::router())
        .merge(dav::router())
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Standard API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

/// Convert anyhow errors to HTTP responses
pub struct AppError(anyhow::Error);

impl AppError {
    pub fn core(&self) -> Option<&CalCardError> {
        self.0.downcast_ref::<CalCardError>()
    }
}

/// HTTP status and machine-readable code for a library error.
pub fn classify(err: &CalCardError) -> (StatusCode, &'static str) {
    match err {
        CalCardError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        CalCardError::Conflict(_) => (StatusCode::PRECONDITION_FAILED, "etag_mismatch"),
        CalCardError::InvalidSyncToken(_) => (StatusCode::FORBIDDEN, "invalid_sync_token"),
        CalCardError::IcsParse(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_ics"),
        CalCardError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        CalCardError::InvalidOccurrenceKey(_) => (StatusCode::BAD_REQUEST, "invalid_recurrence_id"),
        CalCardError::MissingMaster(_) => (StatusCode::BAD_REQUEST, "missing_master"),
        CalCardError::Config(_)
        | CalCardError::IcsGenerate(_)
        | CalCardError::Storage(_)
        | CalCardError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self
            .core()
            .map(classify)
            .unwrap_or((StatusCode::INTERNAL_SERVER_ERROR, "internal"));
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = Json(ErrorResponse {
            error: self.0.to_string(),
            code,
        });
        (status, body).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_health() {
        let response = send(&app(), empty_request("GET", "/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[test]
    fn test_classify_sync_token() {
        let err = calcard_core::CalCardError::InvalidSyncToken("x".into());
        assert_eq!(super::classify(&err), (StatusCode::FORBIDDEN, "invalid_sync_token"));
    }
}
