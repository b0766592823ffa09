//! Historical turbine dataset used to seed the store and drive the replay
//! emitter.
//!
//! The CSV carries `timestamp,device_id,energy_produced_kwh` rows with
//! `dd-MM-yyyy HH:mm` UTC timestamps. Rows sharing a `(time, device)` pair
//! are summed.

use crate::store::TelemetryStore;
use crate::telemetry::TelemetryRecord;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

const TIMESTAMP_FORMAT: &str = "%d-%m-%Y %H:%M";

/// Seed size per requested minute of history.
const SEED_RECORDS_PER_MINUTE: usize = 100;

#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    energy_produced_kwh: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    records: Vec<TelemetryRecord>,
    raw_rows: usize,
}

impl Dataset {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("dataset not found at {}", path.display()))?;
        let dataset = Self::from_reader(file)
            .with_context(|| format!("failed to load dataset {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            raw_rows = dataset.raw_rows,
            records = dataset.records.len(),
            "loaded dataset"
        );
        Ok(dataset)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut totals: BTreeMap<(DateTime<Utc>, String), f64> = BTreeMap::new();
        let mut raw_rows = 0usize;
        for (line, row) in csv_reader.deserialize::<RawRow>().enumerate() {
            raw_rows += 1;
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    tracing::warn!(line = line + 2, error = %err, "skipping unreadable dataset row");
                    continue;
                }
            };
            match parse_row(&row) {
                Some((time, device_id, energy)) => {
                    *totals.entry((time, device_id)).or_insert(0.0) += energy;
                }
                None => {
                    tracing::warn!(line = line + 2, row = ?row, "skipping malformed dataset row");
                }
            }
        }

        if totals.is_empty() {
            bail!("dataset produced no telemetry rows");
        }
        let records = totals
            .into_iter()
            .map(|((time, device_id), energy)| TelemetryRecord::from_energy(time, device_id, energy))
            .collect();
        Ok(Self { records, raw_rows })
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn raw_rows(&self) -> usize {
        self.raw_rows
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.records.first().map(|record| record.time)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.records.last().map(|record| record.time)
    }

    /// Time covered by one replay cycle: first to last record plus one
    /// emission interval.
    pub fn cycle_span(&self, interval: ChronoDuration) -> ChronoDuration {
        match (self.start(), self.end()) {
            (Some(start), Some(end)) => end - start + interval,
            _ => interval,
        }
    }

    /// Leading records used to seed a fresh store.
    pub fn seed_subset(&self, minutes: usize) -> &[TelemetryRecord] {
        let limit = minutes
            .saturating_mul(SEED_RECORDS_PER_MINUTE)
            .min(self.records.len());
        &self.records[..limit]
    }
}

fn parse_row(row: &RawRow) -> Option<(DateTime<Utc>, String, f64)> {
    let timestamp = row.timestamp.as_deref().filter(|v| !v.is_empty())?;
    let device_id = row.device_id.as_deref().filter(|v| !v.is_empty())?;
    let energy = row
        .energy_produced_kwh
        .as_deref()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())?;
    let time = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    Some((time, device_id.to_string(), energy))
}

/// Upserts the leading `minutes` worth of dataset records into `store`.
pub async fn seed_store(store: &dyn TelemetryStore, dataset: &Dataset, minutes: usize) -> Result<u64> {
    let subset = dataset.seed_subset(minutes);
    if subset.is_empty() {
        tracing::warn!("no records available for seeding");
        return Ok(0);
    }
    let written = store
        .upsert_records(subset)
        .await
        .context("failed to seed telemetry store")?;
    tracing::info!(records = subset.len(), store = store.name(), "seeded telemetry store");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTelemetryStore;
    use chrono::TimeZone;
    use std::io::Write;

    const SAMPLE: &str = "timestamp,device_id,energy_produced_kwh\n\
        01-01-2025 00:00,WT-01,1.0\n\
        01-01-2025 00:00,WT-01,0.5\n\
        01-01-2025 00:00,WT-02,2.0\n\
        01-01-2025 00:01,WT-01,1.25\n\
        not-a-date,WT-01,1.0\n\
        01-01-2025 00:01,,1.0\n\
        01-01-2025 00:02,WT-02,NaN\n\
        01-01-2025 00:02,WT-02,abc\n\
        01-01-2025 00:02,WT-01,0.75\n";

    #[test]
    fn sums_duplicate_rows_and_skips_malformed_ones() {
        let dataset = Dataset::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(dataset.raw_rows(), 9);
        assert_eq!(dataset.len(), 4);

        let first = &dataset.records()[0];
        assert_eq!(first.device_id, "WT-01");
        assert_eq!(first.energy_kwh, 1.5);
        assert_eq!(first.power_kw, 90.0);
        assert_eq!(first.time, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());

        let order: Vec<(i64, &str)> = dataset
            .records()
            .iter()
            .map(|r| (r.time.timestamp() / 60 % 60, r.device_id.as_str()))
            .collect();
        assert_eq!(order, vec![(0, "WT-01"), (0, "WT-02"), (1, "WT-01"), (2, "WT-01")]);
    }

    #[test]
    fn empty_dataset_is_an_error() {
        let err = Dataset::from_reader("timestamp,device_id,energy_produced_kwh\n".as_bytes());
        assert!(err.is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let dataset = Dataset::load(file.path()).unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(
            dataset.cycle_span(ChronoDuration::minutes(1)),
            ChronoDuration::minutes(3)
        );

        assert!(Dataset::load(Path::new("/nonexistent/windfarm.csv")).is_err());
    }

    #[tokio::test]
    async fn seeding_is_bounded_by_minutes() {
        let dataset = Dataset::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(dataset.seed_subset(0).len(), 0);
        assert_eq!(dataset.seed_subset(180).len(), 4);

        let store = MemoryTelemetryStore::new();
        let written = seed_store(&store, &dataset, 180).await.unwrap();
        assert_eq!(written, 4);
        assert_eq!(store.len().await, 4);
    }
}
