use super::types::Observation;
#[cfg(test)]
use crate::bucket::Bucket;
use crate::bucket::{BucketStats, BucketWidth};
use crate::store::TimeBounds;
use crate::telemetry::{Scope, TelemetryRecord};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;

type SampleKey = (DateTime<Utc>, String);

#[derive(Debug, Default)]
struct LiveBucket {
    samples: BTreeMap<SampleKey, TelemetryRecord>,
    stats: BucketStats,
}

impl LiveBucket {
    fn recompute(&mut self) {
        self.stats = BucketStats::from_samples(self.samples.values());
    }
}

/// Retained recent buckets of one scope.
///
/// Only buckets starting at or after `align_down(latest) - retention` are
/// kept; anything older is served from the store.
#[derive(Debug)]
pub(in crate::ingest) struct ScopeWindow {
    scope: Scope,
    width: BucketWidth,
    retention: ChronoDuration,
    buckets: BTreeMap<DateTime<Utc>, LiveBucket>,
    latest: Option<DateTime<Utc>>,
}

impl ScopeWindow {
    pub(in crate::ingest) fn new(scope: Scope, width: BucketWidth, retention: ChronoDuration) -> Self {
        Self {
            scope,
            width,
            retention,
            buckets: BTreeMap::new(),
            latest: None,
        }
    }

    fn horizon(&self) -> Option<DateTime<Utc>> {
        self.latest
            .and_then(|latest| self.width.align_down(latest).checked_sub_signed(self.retention))
    }

    pub(in crate::ingest) fn observe(&mut self, record: &TelemetryRecord) -> Observation {
        if let Some(horizon) = self.horizon() {
            if record.time < horizon {
                return Observation::Stale;
            }
        }

        let start = self.width.align_down(record.time);
        let bucket = self.buckets.entry(start).or_default();
        let key = (record.time, record.device_id.clone());
        let observation = match bucket.samples.insert(key, record.clone()) {
            None => Observation::Inserted,
            Some(previous) if previous == *record => Observation::Unchanged,
            Some(_) => Observation::Superseded,
        };
        if observation != Observation::Unchanged {
            bucket.recompute();
            tracing::trace!(
                scope = %self.scope,
                bucket = %start,
                average_power_kw = bucket.stats.average_power_kw,
                samples = bucket.stats.sample_count,
                "live bucket updated"
            );
        }

        if self.latest.map(|latest| record.time > latest).unwrap_or(true) {
            self.latest = Some(record.time);
            self.prune();
        }
        observation
    }

    fn prune(&mut self) {
        if let Some(horizon) = self.horizon() {
            let kept = self.buckets.split_off(&horizon);
            let evicted = std::mem::replace(&mut self.buckets, kept).len();
            if evicted > 0 {
                tracing::trace!(scope = %self.scope, evicted, "pruned live buckets");
            }
        }
    }

    /// Retained records with `from <= time < to`, ascending by time.
    pub(in crate::ingest) fn records_in(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<TelemetryRecord> {
        if to <= from {
            return Vec::new();
        }
        self.buckets
            .range(self.width.align_down(from)..to)
            .flat_map(|(_, bucket)| bucket.samples.values())
            .filter(|record| record.time >= from && record.time < to)
            .cloned()
            .collect()
    }

    pub(in crate::ingest) fn bounds(&self) -> Option<TimeBounds> {
        let earliest = self
            .buckets
            .values()
            .find_map(|bucket| bucket.samples.keys().next().map(|(time, _)| *time))?;
        let latest = self.latest?;
        Some(TimeBounds { earliest, latest })
    }

    pub(in crate::ingest) fn latest_records(&self, limit: usize) -> Vec<TelemetryRecord> {
        self.buckets
            .values()
            .rev()
            .flat_map(|bucket| bucket.samples.values().rev())
            .take(limit)
            .cloned()
            .collect()
    }

    /// Non-empty retained buckets, ascending.
    #[cfg(test)]
    pub(in crate::ingest) fn buckets(&self) -> Vec<Bucket> {
        self.buckets
            .iter()
            .filter(|(_, bucket)| bucket.stats.sample_count > 0)
            .map(|(start, bucket)| Bucket::new(*start, self.scope.clone(), bucket.stats))
            .collect()
    }
}
