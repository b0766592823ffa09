use super::types::{IngestOutcome, IngestSummary, Observation};
use super::{LiveAggregator, TelemetryIngestor};
use crate::error::EngineError;
use crate::fanout::SubscriptionHub;
use crate::pipeline::{IngestStats, PipelineHandle};
use crate::store::{StoreError, TelemetryStore};
use crate::telemetry::TelemetryRecord;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;

fn pipeline_unavailable(err: anyhow::Error) -> EngineError {
    EngineError::SourceUnavailable(StoreError::Unavailable(err.to_string()))
}

impl TelemetryIngestor {
    pub fn new(
        live: Arc<LiveAggregator>,
        pipeline: PipelineHandle,
        store: Arc<dyn TelemetryStore>,
        hub: SubscriptionHub,
    ) -> Self {
        Self {
            live,
            pipeline,
            store,
            hub,
            late_writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.pipeline.stats()
    }

    pub fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    pub fn live(&self) -> &Arc<LiveAggregator> {
        &self.live
    }

    pub async fn flush(&self) -> Result<()> {
        self.pipeline.flush().await
    }

    /// Validates and accepts one record.
    ///
    /// Redelivery of an identical record is absorbed without persisting or
    /// publishing it again.
    pub async fn ingest(&self, record: TelemetryRecord) -> Result<IngestOutcome, EngineError> {
        record.validate()?;

        let observation = self.live.observe(&record).await;
        let outcome = match observation {
            Observation::Unchanged => IngestOutcome {
                observation,
                superseded: true,
            },
            Observation::Inserted | Observation::Superseded => {
                self.pipeline
                    .enqueue(record.clone())
                    .await
                    .map_err(pipeline_unavailable)?;
                IngestOutcome {
                    observation,
                    superseded: observation == Observation::Superseded,
                }
            }
            Observation::Stale => match self.persist_late(&record).await? {
                Some(previous) if previous == record => IngestOutcome {
                    observation: Observation::Unchanged,
                    superseded: true,
                },
                previous => IngestOutcome {
                    observation,
                    superseded: previous.is_some(),
                },
            },
        };

        if outcome.observation != Observation::Unchanged {
            let report = self.hub.publish(&record);
            tracing::trace!(
                device = %record.device_id,
                delivered = report.delivered,
                dropped = report.dropped,
                "published record"
            );
        }
        Ok(outcome)
    }

    /// Writes a record that fell outside the live window through to the
    /// store and returns what the store held for its key beforehand.
    ///
    /// Queued writes are flushed first so an older queued value for the same
    /// key cannot land after this one.
    async fn persist_late(
        &self,
        record: &TelemetryRecord,
    ) -> Result<Option<TelemetryRecord>, EngineError> {
        let _serial = self.late_writes.lock().await;
        self.pipeline.flush().await.map_err(pipeline_unavailable)?;
        let previous = self.store.find_record(&record.key()).await?;
        if previous.as_ref() != Some(record) {
            self.store
                .upsert_records(std::slice::from_ref(record))
                .await?;
            tracing::debug!(
                device = %record.device_id,
                time = %record.time,
                "late record written through to the store"
            );
        }
        Ok(previous)
    }

    /// Accepts a batch in order. The whole batch is validated before any
    /// record is incorporated.
    pub async fn ingest_batch(
        &self,
        records: Vec<TelemetryRecord>,
    ) -> Result<IngestSummary, EngineError> {
        for (idx, record) in records.iter().enumerate() {
            record
                .validate()
                .map_err(|err| EngineError::validation(format!("record {idx}: {err}")))?;
        }
        let mut summary = IngestSummary::default();
        for record in records {
            let outcome = self.ingest(record).await?;
            summary.accepted += 1;
            if outcome.superseded {
                summary.superseded += 1;
            }
        }
        Ok(summary)
    }
}
