use serde::Serialize;

/// How a record changed the live window it was offered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Inserted,
    /// Replaced an earlier record with the same `(deviceId, time)` key.
    Superseded,
    /// Same key and same values as a record already held.
    Unchanged,
    /// Older than the retained window; written through to the store.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub observation: Observation,
    pub superseded: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub accepted: usize,
    pub superseded: usize,
}
