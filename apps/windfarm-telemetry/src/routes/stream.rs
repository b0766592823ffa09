use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;

use crate::state::AppState;
use crate::telemetry::{Scope, TelemetryRecord};

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StreamQuery {
    device_id: Option<String>,
}

fn record_event(record: &TelemetryRecord) -> Option<Event> {
    match Event::default()
        .id(record.time.to_rfc3339())
        .json_data(record)
    {
        Ok(event) => Some(event),
        Err(err) => {
            tracing::warn!(error = %err, device = %record.device_id, "failed to encode SSE record");
            None
        }
    }
}

/// Live telemetry for one scope. The subscription lives as long as the
/// response body, so a client disconnect unsubscribes it.
pub(crate) async fn stream_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let scope = Scope::from_param(query.device_id.as_deref());
    let subscription = state.hub().subscribe(scope);
    tracing::debug!(
        subscriber = subscription.id(),
        scope = %subscription.scope(),
        "stream client connected"
    );

    let init = stream::once(async { Ok(Event::default().event("init").data("connected")) });
    let records = subscription.filter_map(|record| async move { record_event(&record).map(Ok) });

    Sse::new(init.chain(records)).keep_alive(KeepAlive::new().interval(state.sse_keepalive))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/stream", get(stream_handler))
}
