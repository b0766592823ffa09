use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::engine::TelemetryEngine;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize)]
pub(crate) struct DevicesResponse {
    devices: Vec<String>,
}

pub(crate) async fn devices_handler(
    State(engine): State<TelemetryEngine>,
) -> AppResult<Json<DevicesResponse>> {
    let devices = engine
        .devices()
        .await
        .map_err(|err| AppError::from(err).at("/api/devices"))?;
    Ok(Json(DevicesResponse { devices }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/devices", get(devices_handler))
}
