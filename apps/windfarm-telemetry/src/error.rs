use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

/// Failures surfaced by the aggregation and forecasting engine.
///
/// Missing data is not an error: empty ranges yield zero-valued buckets and
/// forecasts instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("telemetry source unavailable: {0}")]
    SourceUnavailable(#[from] StoreError),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_))
    }
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProblemDetails<'a> {
    timestamp: String,
    status: u16,
    error: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a str>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            path: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(message) => Self::bad_request(message),
            EngineError::SourceUnavailable(err) => {
                tracing::warn!(error = %err, "telemetry source unavailable");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Telemetry source unavailable; retry later",
                )
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() && self.status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(status = %self.status, message = %self.message, "request failed");
        }
        let body = ProblemDetails {
            timestamp: Utc::now().to_rfc3339(),
            status: self.status.as_u16(),
            error: self.status.canonical_reason().unwrap_or("Error"),
            message: &self.message,
            path: self.path.as_deref(),
        };
        (self.status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        let err: AppError = EngineError::validation("from must be before to").into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "from must be before to");
    }

    #[test]
    fn source_failure_is_retryable_and_maps_to_unavailable() {
        let engine_err = EngineError::from(StoreError::Unavailable("pool closed".to_string()));
        assert!(engine_err.is_retryable());
        let err: AppError = engine_err.into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
