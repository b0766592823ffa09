//! Raw telemetry record source.
//!
//! The engine treats the store as an append-mostly record source: it reads
//! ranges and recent records, and the persistence pipeline upserts accepted
//! records into it.

mod memory;
mod postgres;

pub use memory::MemoryTelemetryStore;
pub use postgres::{build_pool, PgTelemetryStore};

use crate::telemetry::{RecordKey, Scope, TelemetryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Earliest and latest record timestamps of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBounds {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

impl TimeBounds {
    pub fn merge(self, other: TimeBounds) -> TimeBounds {
        TimeBounds {
            earliest: self.earliest.min(other.earliest),
            latest: self.latest.max(other.latest),
        }
    }
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Records of `scope` with `from <= time < to`, ascending by
    /// `(time, deviceId)`.
    async fn query_records(
        &self,
        scope: &Scope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>, StoreError>;

    /// The `limit` most recent records of `scope`, in no particular order.
    async fn latest_records(
        &self,
        scope: &Scope,
        limit: usize,
    ) -> Result<Vec<TelemetryRecord>, StoreError>;

    /// The stored record with exactly this key, if any.
    async fn find_record(&self, key: &RecordKey) -> Result<Option<TelemetryRecord>, StoreError>;

    async fn time_bounds(&self, scope: &Scope) -> Result<Option<TimeBounds>, StoreError>;

    /// Distinct device ids, sorted.
    async fn list_devices(&self) -> Result<Vec<String>, StoreError>;

    /// Idempotent upsert keyed by `(deviceId, time)`; a later write replaces
    /// an earlier one. Returns the number of rows written.
    async fn upsert_records(&self, records: &[TelemetryRecord]) -> Result<u64, StoreError>;
}
