use super::{StoreError, TelemetryStore, TimeBounds};
use crate::telemetry::{RecordKey, Scope, TelemetryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

type Key = (DateTime<Utc>, String);

/// In-process store used when no database is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryTelemetryStore {
    records: RwLock<BTreeMap<Key, TelemetryRecord>>,
    offline: AtomicBool,
}

impl MemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_records(records: &[TelemetryRecord]) -> Self {
        let store = Self::new();
        {
            let mut guard = store.records.write().await;
            for record in records {
                guard.insert((record.time, record.device_id.clone()), record.clone());
            }
        }
        store
    }

    /// Makes every call fail with [`StoreError::Unavailable`] until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetryStore for MemoryTelemetryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn query_records(
        &self,
        scope: &Scope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>, StoreError> {
        self.check_online()?;
        if to <= from {
            return Ok(Vec::new());
        }
        let guard = self.records.read().await;
        Ok(guard
            .range((from, String::new())..(to, String::new()))
            .map(|(_, record)| record)
            .filter(|record| scope.matches(&record.device_id))
            .cloned()
            .collect())
    }

    async fn latest_records(
        &self,
        scope: &Scope,
        limit: usize,
    ) -> Result<Vec<TelemetryRecord>, StoreError> {
        self.check_online()?;
        let guard = self.records.read().await;
        Ok(guard
            .values()
            .rev()
            .filter(|record| scope.matches(&record.device_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_record(&self, key: &RecordKey) -> Result<Option<TelemetryRecord>, StoreError> {
        self.check_online()?;
        let guard = self.records.read().await;
        Ok(guard.get(&(key.time, key.device_id.clone())).cloned())
    }

    async fn time_bounds(&self, scope: &Scope) -> Result<Option<TimeBounds>, StoreError> {
        self.check_online()?;
        let guard = self.records.read().await;
        let mut matching = guard.values().filter(|record| scope.matches(&record.device_id));
        let Some(first) = matching.next() else {
            return Ok(None);
        };
        let latest = guard
            .values()
            .rev()
            .find(|record| scope.matches(&record.device_id))
            .map(|record| record.time)
            .unwrap_or(first.time);
        Ok(Some(TimeBounds {
            earliest: first.time,
            latest,
        }))
    }

    async fn list_devices(&self) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        let guard = self.records.read().await;
        let devices: BTreeSet<&str> = guard.keys().map(|(_, device)| device.as_str()).collect();
        Ok(devices.into_iter().map(str::to_string).collect())
    }

    async fn upsert_records(&self, records: &[TelemetryRecord]) -> Result<u64, StoreError> {
        self.check_online()?;
        let mut guard = self.records.write().await;
        for record in records {
            guard.insert((record.time, record.device_id.clone()), record.clone());
        }
        Ok(records.len() as u64)
    }
}
