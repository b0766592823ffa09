//! Read side: bucketed metrics, forecasts, latest records and devices.
//!
//! Every read merges the store with the live window. Live records win over
//! stored ones with the same key, so a record is visible to readers as soon
//! as it has been ingested, before the pipeline persists it.

use crate::bucket::{self, Bucket, BucketWidth};
use crate::error::EngineError;
use crate::forecast::{self, Forecast, ForecastRequest};
use crate::ingest::LiveAggregator;
use crate::store::{TelemetryStore, TimeBounds};
use crate::telemetry::{RecordKey, Scope, TelemetryRecord};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const MAX_LATEST_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct TelemetryEngine {
    store: Arc<dyn TelemetryStore>,
    live: Arc<LiveAggregator>,
    min_forecast_window_minutes: i64,
}

impl TelemetryEngine {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        live: Arc<LiveAggregator>,
        min_forecast_window_minutes: i64,
    ) -> Self {
        Self {
            store,
            live,
            min_forecast_window_minutes: min_forecast_window_minutes.max(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn TelemetryStore> {
        &self.store
    }

    async fn records_in_range(
        &self,
        scope: &Scope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>, EngineError> {
        let stored = self.store.query_records(scope, from, to).await?;
        let live = self.live.records_in_range(scope, from, to).await;
        if live.is_empty() {
            return Ok(stored);
        }
        let mut merged: BTreeMap<RecordKey, TelemetryRecord> = BTreeMap::new();
        for record in stored.into_iter().chain(live) {
            merged.insert(record.key(), record);
        }
        Ok(merged.into_values().collect())
    }

    async fn time_bounds(&self, scope: &Scope) -> Result<Option<TimeBounds>, EngineError> {
        let stored = self.store.time_bounds(scope).await?;
        let live = self.live.time_bounds(scope).await;
        Ok(match (stored, live) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => a.or(b),
        })
    }

    /// Contiguous buckets covering `[from, to)` for `scope`.
    pub async fn compute_buckets(
        &self,
        scope: &Scope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        width: BucketWidth,
    ) -> Result<Vec<Bucket>, EngineError> {
        if bucket::bucket_count(from, to, width)? == 0 {
            return Ok(Vec::new());
        }
        let start = width.align_down(from);
        let records = self.records_in_range(scope, start, to).await?;
        bucket::compute_buckets(&records, scope, from, to, width)
    }

    /// Fits a trend to the scope's most recent window and projects it
    /// over the requested horizon. A scope without history forecasts zero.
    pub async fn compute_forecast(&self, request: &ForecastRequest) -> Result<Forecast, EngineError> {
        let window_minutes = request.effective_window_minutes(self.min_forecast_window_minutes);
        let Some(bounds) = self.time_bounds(&request.scope).await? else {
            tracing::debug!(scope = %request.scope, "no telemetry for forecast scope");
            return Ok(forecast::empty_forecast(request, Utc::now(), window_minutes));
        };

        let (window_start, window_end) =
            forecast::plan_window(bounds.earliest, bounds.latest, window_minutes, request.width);
        let buckets = self
            .compute_buckets(&request.scope, window_start, window_end, request.width)
            .await?;
        Ok(forecast::forecast_from_buckets(
            request,
            &buckets,
            window_start,
            window_end,
        ))
    }

    /// The `limit` most recent records of `scope`, ascending by time.
    pub async fn latest(&self, scope: &Scope, limit: usize) -> Result<Vec<TelemetryRecord>, EngineError> {
        if limit == 0 || limit > MAX_LATEST_LIMIT {
            return Err(EngineError::validation(format!(
                "limit must be between 1 and {MAX_LATEST_LIMIT}"
            )));
        }
        let stored = self.store.latest_records(scope, limit).await?;
        let live = self.live.latest_records(scope, limit).await;

        let mut merged: BTreeMap<(DateTime<Utc>, String), TelemetryRecord> = BTreeMap::new();
        for record in stored.into_iter().chain(live) {
            merged.insert((record.time, record.device_id.clone()), record);
        }
        let skip = merged.len().saturating_sub(limit);
        Ok(merged.into_values().skip(skip).collect())
    }

    pub async fn devices(&self) -> Result<Vec<String>, EngineError> {
        let mut devices: BTreeSet<String> = self.store.list_devices().await?.into_iter().collect();
        devices.extend(self.live.devices().await);
        Ok(devices.into_iter().collect())
    }
}
