use crate::dataset::Dataset;
use crate::ingest::TelemetryIngestor;
use crate::telemetry::TelemetryRecord;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Endless walk over the dataset. Each completed cycle shifts timestamps
/// forward by the dataset span so replayed time keeps increasing.
#[derive(Debug)]
pub struct ReplayCursor {
    records: Arc<[TelemetryRecord]>,
    span: ChronoDuration,
    index: usize,
    cycle: i32,
}

impl ReplayCursor {
    pub fn new(dataset: &Dataset, interval: Duration) -> Self {
        let interval = ChronoDuration::from_std(interval).unwrap_or(ChronoDuration::minutes(1));
        Self {
            records: dataset.records().into(),
            span: dataset.cycle_span(interval),
            index: 0,
            cycle: 0,
        }
    }

    pub fn cycle(&self) -> i32 {
        self.cycle
    }

    pub fn next_record(&mut self) -> Option<TelemetryRecord> {
        let base = self.records.get(self.index)?;
        let record = base.with_time(base.time + self.span * self.cycle);
        self.index += 1;
        if self.index == self.records.len() {
            self.index = 0;
            tracing::debug!(cycle = self.cycle, "completed emitter cycle");
            self.cycle = self.cycle.saturating_add(1);
        }
        Some(record)
    }
}

/// Feeds one dataset record into the ingestor per tick.
pub fn spawn_emitter(
    dataset: &Dataset,
    interval: Duration,
    ingestor: TelemetryIngestor,
) -> JoinHandle<()> {
    let mut cursor = ReplayCursor::new(dataset, interval);
    tracing::info!(
        records = dataset.len(),
        interval_ms = interval.as_millis() as u64,
        "telemetry emitter started"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(record) = cursor.next_record() else {
                tracing::warn!("emitter has no records; stopping");
                return;
            };
            if let Err(err) = ingestor.ingest(record).await {
                tracing::warn!(error = %err, "emitter failed to ingest record");
            }
        }
    })
}
