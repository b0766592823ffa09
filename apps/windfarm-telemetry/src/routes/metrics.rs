use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};

use super::{parse_bucket, parse_time};
use crate::bucket::{Bucket, BucketWidth};
use crate::engine::TelemetryEngine;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::telemetry::Scope;

const DEFAULT_LOOKBACK_HOURS: i64 = 6;
const PATH: &str = "/api/metrics";

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MetricsQuery {
    from: Option<String>,
    to: Option<String>,
    device_id: Option<String>,
    bucket: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MetricsResponse {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    device_id: Scope,
    bucket: BucketWidth,
    points: Vec<Bucket>,
}

pub(crate) async fn metrics_handler(
    State(engine): State<TelemetryEngine>,
    Query(query): Query<MetricsQuery>,
) -> AppResult<Json<MetricsResponse>> {
    let at_path = |err: AppError| err.at(PATH);
    let to = parse_time("to", query.to.as_deref())
        .map_err(at_path)?
        .unwrap_or_else(Utc::now);
    let from = parse_time("from", query.from.as_deref())
        .map_err(at_path)?
        .unwrap_or(to - Duration::hours(DEFAULT_LOOKBACK_HOURS));
    let bucket = parse_bucket(query.bucket.as_deref()).map_err(at_path)?;
    let scope = Scope::from_param(query.device_id.as_deref());

    let points = engine
        .compute_buckets(&scope, from, to, bucket)
        .await
        .map_err(|err| AppError::from(err).at(PATH))?;

    Ok(Json(MetricsResponse {
        from,
        to,
        device_id: scope,
        bucket,
        points,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}
