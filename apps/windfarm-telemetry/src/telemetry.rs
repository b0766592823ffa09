use crate::error::EngineError;
use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Pseudo device id used on the wire for the farm-wide aggregate.
pub const ALL_DEVICES: &str = "ALL";

/// Records are reported once per minute, so one record's energy in kWh times
/// sixty is its average power in kW.
pub const MINUTES_PER_HOUR: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub time: DateTime<Utc>,
    pub device_id: String,
    pub energy_kwh: f64,
    pub power_kw: f64,
}

/// Identity of a record: two records with the same key are the same event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub device_id: String,
    pub time: DateTime<Utc>,
}

impl TelemetryRecord {
    pub fn new(
        time: DateTime<Utc>,
        device_id: impl Into<String>,
        energy_kwh: f64,
        power_kw: f64,
    ) -> Self {
        Self {
            time,
            device_id: device_id.into(),
            energy_kwh,
            power_kw,
        }
    }

    /// Builds a per-minute record whose power is derived from its energy.
    pub fn from_energy(time: DateTime<Utc>, device_id: impl Into<String>, energy_kwh: f64) -> Self {
        Self::new(time, device_id, energy_kwh, energy_kwh * MINUTES_PER_HOUR)
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            device_id: self.device_id.clone(),
            time: self.time,
        }
    }

    pub fn with_time(&self, time: DateTime<Utc>) -> Self {
        Self {
            time,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.device_id.trim().is_empty() {
            return Err(EngineError::validation("deviceId must not be blank"));
        }
        if !self.energy_kwh.is_finite() || self.energy_kwh < 0.0 {
            return Err(EngineError::validation(format!(
                "energyKwh must be a non-negative number (device {}, got {})",
                self.device_id, self.energy_kwh
            )));
        }
        if !self.power_kw.is_finite() || self.power_kw < 0.0 {
            return Err(EngineError::validation(format!(
                "powerKw must be a non-negative number (device {}, got {})",
                self.device_id, self.power_kw
            )));
        }
        Ok(())
    }
}

/// Aggregation scope: a single device or the whole farm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    All,
    Device(String),
}

impl Scope {
    pub fn device(id: impl Into<String>) -> Self {
        Self::Device(id.into())
    }

    /// Interprets an optional `deviceId` query parameter. Missing, blank and
    /// `ALL` all select the farm-wide scope.
    pub fn from_param(raw: Option<&str>) -> Self {
        match raw.map(str::trim).filter(|value| !value.is_empty()) {
            None => Self::All,
            Some(value) if value.eq_ignore_ascii_case(ALL_DEVICES) => Self::All,
            Some(value) => Self::Device(value.to_string()),
        }
    }

    pub fn matches(&self, device_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Device(id) => id == device_id,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Device(id) => Some(id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(ALL_DEVICES),
            Self::Device(id) => f.write_str(id),
        }
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Deserialize)]
struct BorrowedTelemetry<'a> {
    #[serde(default, borrow)]
    timestamp: Option<BorrowedTimestamp<'a>>,
    energy_kwh: f64,
    #[serde(default)]
    power_kw: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedTimestamp<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
}

impl<'a> BorrowedTimestamp<'a> {
    fn to_datetime(&self) -> Result<DateTime<Utc>> {
        match self {
            BorrowedTimestamp::Str(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|err| anyhow!("invalid timestamp {s:?}: {err}")),
            BorrowedTimestamp::Int(ms) => millis_to_dt(*ms),
            BorrowedTimestamp::Float(ts) => millis_to_dt((*ts * 1000.0) as i64),
        }
    }
}

fn millis_to_dt(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("timestamp out of range: {ms}"))
}

/// Decodes a `<prefix>/<device_id>/telemetry` publish. Topics that do not
/// match the pattern yield `Ok(None)`.
pub fn parse_mqtt_payload(
    topic_prefix: &str,
    topic: &str,
    payload: &mut [u8],
) -> Result<Option<TelemetryRecord>> {
    let Some(rest) = topic
        .strip_prefix(topic_prefix.trim_end_matches('/'))
        .and_then(|rest| rest.strip_prefix('/'))
    else {
        return Ok(None);
    };
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() != 2 || parts[1] != "telemetry" {
        return Ok(None);
    }
    let device_id = parts[0].trim();
    if device_id.is_empty() {
        return Ok(None);
    }

    let telemetry: BorrowedTelemetry = simd_json::from_slice(payload)?;
    let time = match telemetry.timestamp.as_ref() {
        Some(ts) => ts.to_datetime()?,
        None => Utc::now(),
    };

    let record = match telemetry.power_kw {
        Some(power_kw) => TelemetryRecord::new(time, device_id, telemetry.energy_kwh, power_kw),
        None => TelemetryRecord::from_energy(time, device_id, telemetry.energy_kwh),
    };
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_from_param_treats_blank_and_all_as_aggregate() {
        assert_eq!(Scope::from_param(None), Scope::All);
        assert_eq!(Scope::from_param(Some("  ")), Scope::All);
        assert_eq!(Scope::from_param(Some("all")), Scope::All);
        assert_eq!(Scope::from_param(Some(" WT-01 ")), Scope::device("WT-01"));
    }

    #[test]
    fn scope_matching_branches_on_variant() {
        assert!(Scope::All.matches("WT-07"));
        assert!(Scope::device("WT-07").matches("WT-07"));
        assert!(!Scope::device("WT-07").matches("WT-08"));
        assert_eq!(Scope::All.to_string(), "ALL");
    }

    #[test]
    fn record_serializes_with_camel_case_fields() {
        let time = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let record = TelemetryRecord::from_energy(time, "WT-01", 1.5);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["deviceId"], "WT-01");
        assert_eq!(value["energyKwh"], 1.5);
        assert_eq!(value["powerKw"], 90.0);
        assert_eq!(value["time"], "2025-01-01T00:00:00Z");
    }

    #[test]
    fn validate_rejects_negative_and_non_finite_values() {
        let time = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(TelemetryRecord::new(time, "WT-01", 1.0, 60.0).validate().is_ok());
        assert!(TelemetryRecord::new(time, "WT-01", -1.0, 60.0).validate().is_err());
        assert!(TelemetryRecord::new(time, "WT-01", 1.0, f64::NAN).validate().is_err());
        assert!(TelemetryRecord::new(time, " ", 1.0, 60.0).validate().is_err());
    }

    #[test]
    fn parse_mqtt_payload_derives_power_from_energy() {
        let mut payload = br#"{"timestamp":"2025-01-01T00:05:00Z","energy_kwh":2.0}"#.to_vec();
        let record = parse_mqtt_payload("windfarm", "windfarm/WT-03/telemetry", &mut payload)
            .unwrap()
            .expect("record");
        assert_eq!(record.device_id, "WT-03");
        assert_eq!(record.power_kw, 120.0);
        assert_eq!(
            record.time,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap()
        );
    }

    #[test]
    fn parse_mqtt_payload_accepts_epoch_millis_and_explicit_power() {
        let mut payload = br#"{"timestamp":1735689600000,"energy_kwh":1.0,"power_kw":55.5}"#.to_vec();
        let record = parse_mqtt_payload("windfarm", "windfarm/WT-04/telemetry", &mut payload)
            .unwrap()
            .expect("record");
        assert_eq!(record.power_kw, 55.5);
        assert_eq!(record.time.timestamp(), 1_735_689_600);
    }

    #[test]
    fn parse_mqtt_payload_ignores_foreign_topics() {
        let mut payload = br#"{"energy_kwh":1.0}"#.to_vec();
        assert!(parse_mqtt_payload("windfarm", "iot/node/sensor/telemetry", &mut payload)
            .unwrap()
            .is_none());
        assert!(parse_mqtt_payload("windfarm", "windfarm/WT-01/status", &mut payload)
            .unwrap()
            .is_none());
    }
}
