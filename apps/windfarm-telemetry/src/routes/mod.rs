pub mod devices;
pub mod forecast;
pub mod health;
pub mod ingest;
pub mod latest;
pub mod metrics;
pub mod stream;

use axum::Router;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use crate::bucket::BucketWidth;
use crate::error::AppError;
use crate::state::AppState;

pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api",
            Router::new()
                .merge(metrics::router())
                .merge(forecast::router())
                .merge(latest::router())
                .merge(devices::router())
                .merge(stream::router())
                .merge(ingest::router()),
        )
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn non_blank(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|value| !value.is_empty())
}

pub(crate) fn parse_time(name: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, AppError> {
    let Some(value) = non_blank(raw) else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(value)
        .map(|ts| Some(ts.with_timezone(&Utc)))
        .map_err(|_| AppError::bad_request(format!("{name} must be an RFC 3339 timestamp")))
}

pub(crate) fn parse_int(name: &str, raw: Option<&str>, default: i64) -> Result<i64, AppError> {
    match non_blank(raw) {
        None => Ok(default),
        Some(value) => value
            .parse::<i64>()
            .map_err(|_| AppError::bad_request(format!("{name} must be an integer"))),
    }
}

pub(crate) fn parse_bucket(raw: Option<&str>) -> Result<BucketWidth, AppError> {
    match non_blank(raw) {
        None => Ok(BucketWidth::ONE_MINUTE),
        Some(value) => BucketWidth::parse(value).map_err(AppError::from),
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    pub async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    pub async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }
}
