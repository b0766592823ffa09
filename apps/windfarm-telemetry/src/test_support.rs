use crate::config::Config;
use crate::engine::TelemetryEngine;
use crate::fanout::SubscriptionHub;
use crate::ingest::{LiveAggregator, TelemetryIngestor};
use crate::pipeline::{self, WorkerSettings};
use crate::state::AppState;
use crate::store::MemoryTelemetryStore;
use std::sync::Arc;
use std::time::Duration;

pub fn test_config() -> Config {
    Config {
        // Tests flush explicitly.
        flush_interval_ms: 3_600_000,
        subscriber_buffer: 64,
        subscriber_max_drops: 64,
        sse_keepalive_secs: 15,
        mqtt_client_id: "windfarm-telemetry-test".to_string(),
        ..Config::default()
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryTelemetryStore>,
}

/// Fully wired application state over an in-memory store.
pub fn test_app() -> TestApp {
    let config = test_config();
    let store = Arc::new(MemoryTelemetryStore::new());
    let live = Arc::new(LiveAggregator::new(
        config.bucket_width,
        config.live_retention_minutes,
    ));
    let (pipeline, _worker) = pipeline::start(
        store.clone(),
        WorkerSettings {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            max_queue: config.max_queue,
        },
    );
    let hub = SubscriptionHub::new(config.subscriber_buffer, config.subscriber_max_drops);
    let ingestor = TelemetryIngestor::new(live.clone(), pipeline, store.clone(), hub);
    let engine = TelemetryEngine::new(store.clone(), live, config.min_forecast_window_minutes);
    TestApp {
        state: AppState::new(engine, ingestor, Duration::from_secs(config.sse_keepalive_secs)),
        store,
    }
}
