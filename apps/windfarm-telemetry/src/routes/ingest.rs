use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use crate::error::{AppError, AppResult};
use crate::ingest::{IngestSummary, TelemetryIngestor};
use crate::state::AppState;
use crate::telemetry::TelemetryRecord;

const PATH: &str = "/api/telemetry";

pub(crate) async fn ingest_handler(
    State(ingestor): State<TelemetryIngestor>,
    payload: Result<Json<Vec<TelemetryRecord>>, JsonRejection>,
) -> AppResult<Json<IngestSummary>> {
    let Json(records) = payload
        .map_err(|rejection| AppError::bad_request(rejection.body_text()).at(PATH))?;
    let summary = ingestor
        .ingest_batch(records)
        .await
        .map_err(|err| AppError::from(err).at(PATH))?;
    tracing::debug!(
        accepted = summary.accepted,
        superseded = summary.superseded,
        "ingested telemetry batch"
    );
    Ok(Json(summary))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/telemetry", post(ingest_handler))
}
