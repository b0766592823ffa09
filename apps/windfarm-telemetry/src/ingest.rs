mod ingestor;
mod state;
mod types;
mod window;

#[cfg(test)]
mod tests;

pub use state::LiveAggregator;
pub use types::{IngestOutcome, IngestSummary, Observation};

use crate::fanout::SubscriptionHub;
use crate::pipeline::PipelineHandle;
use crate::store::TelemetryStore;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Entry point for accepted telemetry: updates live state, queues the record
/// for persistence and fans it out to subscribers.
///
/// Records older than the live window are written straight to the store
/// before `ingest` returns, so readers see them immediately.
#[derive(Clone)]
pub struct TelemetryIngestor {
    live: Arc<LiveAggregator>,
    pipeline: PipelineHandle,
    store: Arc<dyn TelemetryStore>,
    hub: SubscriptionHub,
    late_writes: Arc<Mutex<()>>,
}
