use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};

use super::{parse_bucket, parse_int};
use crate::engine::TelemetryEngine;
use crate::error::{AppError, AppResult};
use crate::forecast::{Forecast, ForecastRequest};
use crate::state::AppState;
use crate::telemetry::Scope;

const DEFAULT_HORIZON_MINUTES: i64 = 60;
const DEFAULT_WINDOW_MINUTES: i64 = 180;
const PATH: &str = "/api/forecast";

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ForecastQuery {
    device_id: Option<String>,
    horizon_minutes: Option<String>,
    window_minutes: Option<String>,
    bucket: Option<String>,
}

pub(crate) async fn forecast_handler(
    State(engine): State<TelemetryEngine>,
    Query(query): Query<ForecastQuery>,
) -> AppResult<Json<Forecast>> {
    let at_path = |err: AppError| err.at(PATH);
    let horizon = parse_int(
        "horizonMinutes",
        query.horizon_minutes.as_deref(),
        DEFAULT_HORIZON_MINUTES,
    )
    .map_err(at_path)?;
    let window = parse_int(
        "windowMinutes",
        query.window_minutes.as_deref(),
        DEFAULT_WINDOW_MINUTES,
    )
    .map_err(at_path)?;
    let bucket = parse_bucket(query.bucket.as_deref()).map_err(at_path)?;
    let scope = Scope::from_param(query.device_id.as_deref());

    let request = ForecastRequest::new(scope, window, horizon, bucket)
        .map_err(|err| AppError::from(err).at(PATH))?;
    let forecast = engine
        .compute_forecast(&request)
        .await
        .map_err(|err| AppError::from(err).at(PATH))?;
    Ok(Json(forecast))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/forecast", get(forecast_handler))
}
