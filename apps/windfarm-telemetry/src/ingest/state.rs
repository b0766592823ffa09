use super::types::Observation;
use super::window::ScopeWindow;
#[cfg(test)]
use crate::bucket::Bucket;
use crate::bucket::BucketWidth;
use crate::store::TimeBounds;
use crate::telemetry::{Scope, TelemetryRecord};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

type SharedWindow = Arc<Mutex<ScopeWindow>>;

/// Per-scope live bucket state for recently observed telemetry.
///
/// The registry lock only guards scope lookup; each scope has its own mutex,
/// so writers to different devices never wait on each other.
#[derive(Debug)]
pub struct LiveAggregator {
    width: BucketWidth,
    retention: ChronoDuration,
    scopes: RwLock<HashMap<Scope, SharedWindow>>,
}

impl LiveAggregator {
    pub fn new(width: BucketWidth, retention_minutes: i64) -> Self {
        Self {
            width,
            retention: ChronoDuration::try_minutes(retention_minutes.max(0))
                .unwrap_or(ChronoDuration::MAX),
            scopes: RwLock::new(HashMap::new()),
        }
    }

    async fn existing(&self, scope: &Scope) -> Option<SharedWindow> {
        self.scopes.read().await.get(scope).cloned()
    }

    async fn window(&self, scope: &Scope) -> SharedWindow {
        if let Some(window) = self.existing(scope).await {
            return window;
        }
        let mut scopes = self.scopes.write().await;
        scopes
            .entry(scope.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ScopeWindow::new(
                    scope.clone(),
                    self.width,
                    self.retention,
                )))
            })
            .clone()
    }

    /// Incorporates `record` into its device scope and the ALL scope.
    ///
    /// A record already held unchanged by its device scope is `Unchanged`.
    /// Otherwise it is `Stale` when either scope judged it older than its
    /// window, since the ALL window may have moved past a device that is
    /// still catching up. Anything else reports the device scope's result.
    pub async fn observe(&self, record: &TelemetryRecord) -> Observation {
        let device_scope = Scope::device(record.device_id.clone());
        let device = {
            let window = self.window(&device_scope).await;
            let mut guard = window.lock().await;
            guard.observe(record)
        };
        let all = {
            let window = self.window(&Scope::All).await;
            let mut guard = window.lock().await;
            guard.observe(record)
        };
        let observation = match (device, all) {
            (Observation::Unchanged, _) => Observation::Unchanged,
            (Observation::Stale, _) | (_, Observation::Stale) => Observation::Stale,
            (device, _) => device,
        };
        if observation == Observation::Stale {
            tracing::debug!(
                device = %record.device_id,
                time = %record.time,
                "record older than live window"
            );
        }
        observation
    }

    pub async fn records_in_range(
        &self,
        scope: &Scope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<TelemetryRecord> {
        let Some(window) = self.existing(scope).await else {
            return Vec::new();
        };
        let guard = window.lock().await;
        guard.records_in(from, to)
    }

    pub async fn time_bounds(&self, scope: &Scope) -> Option<TimeBounds> {
        let window = self.existing(scope).await?;
        let guard = window.lock().await;
        guard.bounds()
    }

    /// Up to `limit` most recent retained records, newest first.
    pub async fn latest_records(&self, scope: &Scope, limit: usize) -> Vec<TelemetryRecord> {
        let Some(window) = self.existing(scope).await else {
            return Vec::new();
        };
        let guard = window.lock().await;
        guard.latest_records(limit)
    }

    /// Non-empty live buckets of `scope`, ascending.
    #[cfg(test)]
    pub(crate) async fn live_buckets(&self, scope: &Scope) -> Vec<Bucket> {
        let Some(window) = self.existing(scope).await else {
            return Vec::new();
        };
        let guard = window.lock().await;
        guard.buckets()
    }

    pub async fn devices(&self) -> Vec<String> {
        let scopes = self.scopes.read().await;
        let mut devices: Vec<String> = scopes
            .keys()
            .filter_map(|scope| scope.device_id().map(str::to_string))
            .collect();
        devices.sort();
        devices
    }
}
