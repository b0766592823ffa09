use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};

use super::parse_int;
use crate::engine::TelemetryEngine;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::telemetry::{Scope, TelemetryRecord};

const DEFAULT_LIMIT: i64 = 50;
const PATH: &str = "/api/latest";

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LatestQuery {
    device_id: Option<String>,
    limit: Option<String>,
}

pub(crate) async fn latest_handler(
    State(engine): State<TelemetryEngine>,
    Query(query): Query<LatestQuery>,
) -> AppResult<Json<Vec<TelemetryRecord>>> {
    let limit = parse_int("limit", query.limit.as_deref(), DEFAULT_LIMIT)
        .map_err(|err| err.at(PATH))?;
    let limit = usize::try_from(limit).unwrap_or(0);
    let scope = Scope::from_param(query.device_id.as_deref());
    let records = engine
        .latest(&scope, limit)
        .await
        .map_err(|err| AppError::from(err).at(PATH))?;
    Ok(Json(records))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/latest", get(latest_handler))
}
