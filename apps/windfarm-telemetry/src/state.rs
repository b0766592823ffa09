use crate::engine::TelemetryEngine;
use crate::fanout::SubscriptionHub;
use crate::ingest::TelemetryIngestor;
use crate::pipeline::IngestStats;
use axum::extract::FromRef;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub engine: TelemetryEngine,
    pub ingestor: TelemetryIngestor,
    pub sse_keepalive: Duration,
}

impl AppState {
    pub fn new(engine: TelemetryEngine, ingestor: TelemetryIngestor, sse_keepalive: Duration) -> Self {
        Self {
            engine,
            ingestor,
            sse_keepalive,
        }
    }

    pub fn hub(&self) -> &SubscriptionHub {
        self.ingestor.hub()
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.ingestor.stats()
    }
}

impl FromRef<AppState> for TelemetryEngine {
    fn from_ref(state: &AppState) -> TelemetryEngine {
        state.engine.clone()
    }
}

impl FromRef<AppState> for TelemetryIngestor {
    fn from_ref(state: &AppState) -> TelemetryIngestor {
        state.ingestor.clone()
    }
}
