//! Fixed-width time bucketing of raw telemetry.
//!
//! Buckets are half-open `[start, start + width)` intervals aligned to
//! multiples of the width since the Unix epoch. A bucket's power is the
//! farm output averaged over the instants that reported inside it: records
//! that share a timestamp are summed first, then the per-instant totals are
//! averaged. For one device this is the plain mean of its records; for the
//! ALL scope it is total farm output taken straight from raw records.

use crate::error::EngineError;
use crate::telemetry::{RecordKey, Scope, TelemetryRecord};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Upper bound on buckets produced by one request.
pub const MAX_BUCKETS_PER_QUERY: i64 = 500_000;

const SECONDS_PER_MINUTE: i64 = 60;
const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;
const SECONDS_PER_WEEK: i64 = 7 * SECONDS_PER_DAY;

/// Widest accepted bucket: one leap year.
pub const MAX_BUCKET_SECONDS: i64 = 366 * SECONDS_PER_DAY;

/// A strictly positive bucket width with whole-second granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketWidth {
    seconds: i64,
}

impl BucketWidth {
    pub const ONE_MINUTE: BucketWidth = BucketWidth { seconds: 60 };

    pub fn from_seconds(seconds: i64) -> Result<Self, EngineError> {
        if seconds <= 0 {
            return Err(EngineError::validation(format!(
                "bucket width must be positive (got {seconds}s)"
            )));
        }
        if seconds > MAX_BUCKET_SECONDS {
            return Err(EngineError::validation(format!(
                "bucket width must not exceed {MAX_BUCKET_SECONDS}s (got {seconds}s)"
            )));
        }
        Ok(Self { seconds })
    }

    pub fn from_minutes(minutes: i64) -> Result<Self, EngineError> {
        Self::from_seconds(minutes.saturating_mul(SECONDS_PER_MINUTE))
    }

    /// Parses an ISO-8601 duration (`PT1M`, `PT1H30M`, `P1D`, ...) or the
    /// legacy `"<n> minute(s)"` form.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let trimmed = raw.trim();
        let invalid = || EngineError::validation(format!("Invalid bucket duration: {raw}"));
        if trimmed.is_empty() {
            return Err(invalid());
        }

        let lower = trimmed.to_ascii_lowercase();
        if lower.ends_with("minute") || lower.ends_with("minutes") {
            let digits = lower.split_whitespace().next().ok_or_else(invalid)?;
            let minutes = digits.parse::<i64>().map_err(|_| invalid())?;
            return Self::from_minutes(minutes);
        }

        let upper = trimmed.to_ascii_uppercase();
        let body = upper.strip_prefix('P').ok_or_else(invalid)?;
        let (date_part, time_part) = match body.split_once('T') {
            Some((date, time)) => {
                if time.is_empty() {
                    return Err(invalid());
                }
                (date, Some(time))
            }
            None => (body, None),
        };

        let mut seconds = 0i64;
        for (value, unit) in duration_components(date_part).ok_or_else(invalid)? {
            let scale = match unit {
                'W' => SECONDS_PER_WEEK,
                'D' => SECONDS_PER_DAY,
                _ => return Err(invalid()),
            };
            seconds = seconds.saturating_add(value.saturating_mul(scale));
        }
        if let Some(time_part) = time_part {
            for (value, unit) in duration_components(time_part).ok_or_else(invalid)? {
                let scale = match unit {
                    'H' => SECONDS_PER_HOUR,
                    'M' => SECONDS_PER_MINUTE,
                    'S' => 1,
                    _ => return Err(invalid()),
                };
                seconds = seconds.saturating_add(value.saturating_mul(scale));
            }
        }
        if date_part.is_empty() && time_part.is_none() {
            return Err(invalid());
        }

        Self::from_seconds(seconds)
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn duration(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.seconds)
    }

    pub fn minutes(&self) -> f64 {
        self.seconds as f64 / SECONDS_PER_MINUTE as f64
    }

    /// Start of the bucket containing `ts`.
    pub fn align_down(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let interval_ms = self.millis();
        let ts_ms = ts.timestamp_millis();
        ts_ms
            .div_euclid(interval_ms)
            .checked_mul(interval_ms)
            .and_then(|bucket_ms| Utc.timestamp_millis_opt(bucket_ms).single())
            .unwrap_or(ts)
    }

    /// Smallest aligned boundary at or after `ts`.
    pub fn align_up(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let down = self.align_down(ts);
        if down == ts {
            down
        } else {
            self.next_boundary(down).unwrap_or(down)
        }
    }

    /// Start of the bucket after the one starting at `start`, if representable.
    pub fn next_boundary(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        start.checked_add_signed(self.duration())
    }

    fn millis(&self) -> i64 {
        self.seconds * 1000
    }
}

impl Default for BucketWidth {
    fn default() -> Self {
        Self::ONE_MINUTE
    }
}

impl FromStr for BucketWidth {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BucketWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days = self.seconds / SECONDS_PER_DAY;
        let rest = self.seconds % SECONDS_PER_DAY;
        f.write_str("P")?;
        if days > 0 {
            write!(f, "{days}D")?;
        }
        if rest == 0 {
            return Ok(());
        }
        f.write_str("T")?;
        let hours = rest / SECONDS_PER_HOUR;
        let minutes = (rest % SECONDS_PER_HOUR) / SECONDS_PER_MINUTE;
        let secs = rest % SECONDS_PER_MINUTE;
        if hours > 0 {
            write!(f, "{hours}H")?;
        }
        if minutes > 0 {
            write!(f, "{minutes}M")?;
        }
        if secs > 0 {
            write!(f, "{secs}S")?;
        }
        Ok(())
    }
}

impl Serialize for BucketWidth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn duration_components(part: &str) -> Option<Vec<(i64, char)>> {
    let mut out = Vec::new();
    let mut digits = String::new();
    for ch in part.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return None;
        }
        out.push((digits.parse::<i64>().ok()?, ch));
        digits.clear();
    }
    if !digits.is_empty() {
        return None;
    }
    Some(out)
}

/// Aggregated statistics for one interval.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BucketStats {
    pub average_power_kw: f64,
    pub total_energy_kwh: f64,
    pub sample_count: u64,
}

impl BucketStats {
    /// Folds samples into bucket statistics. Callers pass samples in key
    /// order so the floating-point sums are reproducible.
    pub fn from_samples<'a, I>(samples: I) -> Self
    where
        I: IntoIterator<Item = &'a TelemetryRecord>,
    {
        let mut instants: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();
        let mut total_energy_kwh = 0.0;
        let mut sample_count = 0u64;
        for sample in samples {
            *instants.entry(sample.time).or_insert(0.0) += sample.power_kw;
            total_energy_kwh += sample.energy_kwh;
            sample_count += 1;
        }
        if instants.is_empty() {
            return Self::default();
        }
        let total_power: f64 = instants.values().sum();
        Self {
            average_power_kw: total_power / instants.len() as f64,
            total_energy_kwh,
            sample_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub bucket_start: DateTime<Utc>,
    #[serde(skip)]
    pub scope: Scope,
    pub average_power_kw: f64,
    pub total_energy_kwh: f64,
    pub sample_count: u64,
}

impl Bucket {
    pub fn new(bucket_start: DateTime<Utc>, scope: Scope, stats: BucketStats) -> Self {
        Self {
            bucket_start,
            scope,
            average_power_kw: stats.average_power_kw,
            total_energy_kwh: stats.total_energy_kwh,
            sample_count: stats.sample_count,
        }
    }

    pub fn empty(bucket_start: DateTime<Utc>, scope: Scope) -> Self {
        Self::new(bucket_start, scope, BucketStats::default())
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

pub fn validate_range(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<(), EngineError> {
    if to < from {
        return Err(EngineError::validation("from must be before to"));
    }
    Ok(())
}

/// Number of buckets needed to cover `[width.align_down(from), to)`.
pub fn bucket_count(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    width: BucketWidth,
) -> Result<i64, EngineError> {
    validate_range(from, to)?;
    if from == to {
        return Ok(0);
    }
    let start = width.align_down(from);
    let span_ms = (to - start).num_milliseconds();
    let width_ms = width.millis();
    let count = span_ms.div_euclid(width_ms) + i64::from(span_ms.rem_euclid(width_ms) != 0);
    if count > MAX_BUCKETS_PER_QUERY {
        return Err(EngineError::validation(format!(
            "range spans {count} buckets of {width}; at most {MAX_BUCKETS_PER_QUERY} are allowed"
        )));
    }
    Ok(count)
}

/// Partitions `[from, to)` into contiguous buckets of `width` and aggregates
/// the matching records into them.
///
/// Every interval is emitted, empty ones included, in ascending order.
/// Records outside the scope or outside the covered range are ignored;
/// records repeating a `(deviceId, time)` key supersede earlier ones.
pub fn compute_buckets(
    records: &[TelemetryRecord],
    scope: &Scope,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    width: BucketWidth,
) -> Result<Vec<Bucket>, EngineError> {
    let count = bucket_count(from, to, width)?;
    if count == 0 {
        return Ok(Vec::new());
    }
    let start = width.align_down(from);

    let mut latest: BTreeMap<RecordKey, &TelemetryRecord> = BTreeMap::new();
    for record in records {
        if !scope.matches(&record.device_id) || record.time < start || record.time >= to {
            continue;
        }
        latest.insert(record.key(), record);
    }

    let mut grouped: Vec<Vec<&TelemetryRecord>> = vec![Vec::new(); count as usize];
    let mut ordered: Vec<&TelemetryRecord> = latest.into_values().collect();
    ordered.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.device_id.cmp(&b.device_id)));
    for record in ordered {
        let offset = (record.time - start).num_seconds() / width.seconds();
        if let Some(slot) = grouped.get_mut(offset as usize) {
            slot.push(record);
        }
    }

    Ok(grouped
        .into_iter()
        .enumerate()
        .map(|(idx, samples)| {
            let bucket_start = start + ChronoDuration::seconds(width.seconds() * idx as i64);
            Bucket::new(
                bucket_start,
                scope.clone(),
                BucketStats::from_samples(samples.into_iter()),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn minutes(n: i64) -> ChronoDuration {
        ChronoDuration::minutes(n)
    }

    #[test]
    fn parses_iso_and_legacy_durations() {
        assert_eq!(BucketWidth::parse("PT1M").unwrap().seconds(), 60);
        assert_eq!(BucketWidth::parse("pt15m").unwrap().seconds(), 900);
        assert_eq!(BucketWidth::parse("PT1H30M").unwrap().seconds(), 5_400);
        assert_eq!(BucketWidth::parse("PT30S").unwrap().seconds(), 30);
        assert_eq!(BucketWidth::parse("P1D").unwrap().seconds(), 86_400);
        assert_eq!(BucketWidth::parse("P1DT1H").unwrap().seconds(), 90_000);
        assert_eq!(BucketWidth::parse("5 minutes").unwrap().seconds(), 300);
        assert_eq!(BucketWidth::parse("1 minute").unwrap().seconds(), 60);
    }

    #[test]
    fn rejects_malformed_or_non_positive_durations() {
        for raw in ["", "P", "PT", "1M", "PT0M", "P1M", "PTM", "PT1.5M", "0 minutes", "abc"] {
            assert!(BucketWidth::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn formats_as_iso_duration() {
        assert_eq!(BucketWidth::ONE_MINUTE.to_string(), "PT1M");
        assert_eq!(BucketWidth::parse("PT1H30M").unwrap().to_string(), "PT1H30M");
        assert_eq!(BucketWidth::parse("P1D").unwrap().to_string(), "P1D");
        assert_eq!(BucketWidth::parse("PT90S").unwrap().to_string(), "PT1M30S");
    }

    #[test]
    fn aligns_to_width_boundaries() {
        let width = BucketWidth::parse("PT15M").unwrap();
        let ts = t0() + minutes(22) + ChronoDuration::seconds(5);
        assert_eq!(width.align_down(ts), t0() + minutes(15));
        assert_eq!(width.align_up(ts), t0() + minutes(30));
        assert_eq!(width.align_up(t0()), t0());
    }

    #[test]
    fn three_minute_series_yields_three_buckets() {
        let records = vec![
            TelemetryRecord::new(t0(), "D1", 50.0 / 60.0, 50.0),
            TelemetryRecord::new(t0() + minutes(1), "D1", 1.0, 60.0),
            TelemetryRecord::new(t0() + minutes(2), "D1", 70.0 / 60.0, 70.0),
        ];
        let buckets = compute_buckets(
            &records,
            &Scope::device("D1"),
            t0(),
            t0() + minutes(3),
            BucketWidth::ONE_MINUTE,
        )
        .unwrap();
        let power: Vec<f64> = buckets.iter().map(|b| b.average_power_kw).collect();
        assert_eq!(power, vec![50.0, 60.0, 70.0]);
        assert!(buckets.iter().all(|b| b.sample_count == 1));
    }

    #[test]
    fn covers_range_without_gaps() {
        let width = BucketWidth::parse("PT5M").unwrap();
        let from = t0() + minutes(3);
        let to = t0() + minutes(61);
        let records = vec![TelemetryRecord::new(t0() + minutes(31), "D1", 1.0, 60.0)];
        let buckets = compute_buckets(&records, &Scope::All, from, to, width).unwrap();

        assert_eq!(buckets.first().unwrap().bucket_start, t0());
        assert_eq!(buckets.len(), 13);
        for pair in buckets.windows(2) {
            assert_eq!(pair[1].bucket_start - pair[0].bucket_start, width.duration());
        }
        assert!(buckets.last().unwrap().bucket_start < to);
        let filled: Vec<_> = buckets.iter().filter(|b| !b.is_empty()).collect();
        assert_eq!(filled.len(), 1);
        assert_eq!(filled[0].bucket_start, t0() + minutes(30));
    }

    #[test]
    fn empty_range_and_inverted_range() {
        let empty = compute_buckets(&[], &Scope::All, t0(), t0(), BucketWidth::ONE_MINUTE).unwrap();
        assert!(empty.is_empty());
        let err = compute_buckets(
            &[],
            &Scope::All,
            t0() + minutes(1),
            t0(),
            BucketWidth::ONE_MINUTE,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn empty_buckets_are_zero_valued() {
        let buckets = compute_buckets(
            &[],
            &Scope::device("D1"),
            t0(),
            t0() + minutes(4),
            BucketWidth::ONE_MINUTE,
        )
        .unwrap();
        assert_eq!(buckets.len(), 4);
        assert!(buckets
            .iter()
            .all(|b| b.average_power_kw == 0.0 && b.total_energy_kwh == 0.0 && b.is_empty()));
    }

    #[test]
    fn all_scope_reports_total_farm_output() {
        let width = BucketWidth::parse("PT5M").unwrap();
        let mut records = Vec::new();
        for minute in 0..5 {
            for device in ["D1", "D2"] {
                records.push(TelemetryRecord::new(t0() + minutes(minute), device, 100.0 / 60.0, 100.0));
            }
        }
        let all = compute_buckets(&records, &Scope::All, t0(), t0() + minutes(5), width).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].average_power_kw, 200.0);
        assert_eq!(all[0].sample_count, 10);

        let single =
            compute_buckets(&records, &Scope::device("D1"), t0(), t0() + minutes(5), width).unwrap();
        assert_eq!(single[0].average_power_kw, 100.0);
        assert_eq!(single[0].sample_count, 5);
    }

    #[test]
    fn duplicate_keys_are_counted_once() {
        let records = vec![
            TelemetryRecord::new(t0(), "D1", 1.0, 60.0),
            TelemetryRecord::new(t0(), "D1", 2.0, 120.0),
        ];
        let buckets = compute_buckets(
            &records,
            &Scope::device("D1"),
            t0(),
            t0() + minutes(1),
            BucketWidth::ONE_MINUTE,
        )
        .unwrap();
        assert_eq!(buckets[0].sample_count, 1);
        assert_eq!(buckets[0].average_power_kw, 120.0);
        assert_eq!(buckets[0].total_energy_kwh, 2.0);
    }

    #[test]
    fn rejects_widths_beyond_one_year() {
        for raw in ["PT9223372036854775807S", "P367D", "P53W", "99999999999 minutes"] {
            let err = BucketWidth::parse(raw).unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)), "{raw} should be rejected");
        }
        assert!(BucketWidth::from_seconds(i64::MAX).is_err());
        assert!(BucketWidth::from_minutes(i64::MAX).is_err());
        assert_eq!(
            BucketWidth::parse("P366D").unwrap().seconds(),
            MAX_BUCKET_SECONDS
        );
    }

    #[test]
    fn widest_bucket_aligns_extreme_timestamps() {
        let width = BucketWidth::from_seconds(MAX_BUCKET_SECONDS).unwrap();
        for ts in [DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC, t0()] {
            let down = width.align_down(ts);
            assert!(down <= ts);
            assert!(width.align_up(ts) >= down);
        }
        assert!(width.next_boundary(DateTime::<Utc>::MAX_UTC).is_none());
    }

    #[test]
    fn rejects_ranges_with_too_many_buckets() {
        let width = BucketWidth::from_seconds(1).unwrap();
        let err = bucket_count(t0(), t0() + ChronoDuration::days(30), width).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
