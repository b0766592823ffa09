use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub queue_depth: u64,
    pub last_flush_unix_ms: u64,
    pub last_batch_len: u64,
    pub average_flush_ms: f64,
    pub dropped_records: u64,
    pub mqtt_connected: bool,
    pub subscribers: usize,
    pub dropped_deliveries: u64,
    pub last_error: Option<String>,
}

pub(crate) async fn healthz_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.stats().snapshot();
    let hub = state.hub();
    Json(HealthResponse {
        status: if stats.last_error.is_some() { "degraded" } else { "ok" },
        queue_depth: stats.queue_depth,
        last_flush_unix_ms: stats.last_flush_unix_ms,
        last_batch_len: stats.last_batch_len,
        average_flush_ms: stats.average_flush_ms,
        dropped_records: stats.dropped_records,
        mqtt_connected: stats.mqtt_connected,
        subscribers: hub.subscriber_count(),
        dropped_deliveries: hub.dropped_total(),
        last_error: stats.last_error,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz_handler))
}
