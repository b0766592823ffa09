use crate::store::TelemetryStore;
use crate::telemetry::TelemetryRecord;
use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum BatchCommand {
    Record(TelemetryRecord),
    /// Writes the buffer now and reports whether the write succeeded.
    Flush(oneshot::Sender<Result<(), String>>),
}

#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<BatchCommand>,
    stats: Arc<IngestStats>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<BatchCommand>, stats: Arc<IngestStats>) -> Self {
        Self { tx, stats }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn enqueue(&self, record: TelemetryRecord) -> Result<()> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, device = %record.device_id, "queued record");
        if self.tx.send(BatchCommand::Record(record)).await.is_err() {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(anyhow!("persistence pipeline closed"));
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(BatchCommand::Flush(tx))
            .await
            .map_err(|_| anyhow!("persistence pipeline closed"))?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(anyhow!("flush failed: {err}")),
            Err(_) => Err(anyhow!("persistence pipeline closed")),
        }
    }
}

#[derive(Debug)]
pub struct IngestStats {
    pub queue_depth: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub dropped_records: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

/// Point-in-time copy of [`IngestStats`] for the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStatsSnapshot {
    pub queue_depth: u64,
    pub last_flush_unix_ms: u64,
    pub last_batch_len: u64,
    pub average_flush_ms: f64,
    pub dropped_records: u64,
    pub mqtt_connected: bool,
    pub last_error: Option<String>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            queue_depth: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            dropped_records: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            last_flush_unix_ms: self.last_flush_unix_ms.load(Ordering::Relaxed),
            last_batch_len: self.last_batch_len.load(Ordering::Relaxed),
            average_flush_ms: self.average_flush_micros.load(Ordering::Relaxed) as f64 / 1000.0,
            dropped_records: self.dropped_records.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Records kept for retry after a failed flush.
    pub max_queue: usize,
}

/// Creates the command channel and spawns the batch writer.
pub fn start(
    store: Arc<dyn TelemetryStore>,
    settings: WorkerSettings,
) -> (PipelineHandle, JoinHandle<()>) {
    let stats = Arc::new(IngestStats::new());
    let (tx, rx) = mpsc::channel::<BatchCommand>(settings.max_queue.max(1));
    let handle = spawn_worker(store, rx, stats.clone(), settings);
    (PipelineHandle::new(tx, stats), handle)
}

pub fn spawn_worker(
    store: Arc<dyn TelemetryStore>,
    mut rx: mpsc::Receiver<BatchCommand>,
    stats: Arc<IngestStats>,
    settings: WorkerSettings,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let batch_size = settings.batch_size.max(1);
        let mut buffer: Vec<TelemetryRecord> = Vec::with_capacity(batch_size);
        let first_tick = tokio::time::Instant::now() + settings.flush_interval;
        let mut ticker = tokio::time::interval_at(first_tick, settings.flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = flush(store.as_ref(), &mut buffer, &stats, settings.max_queue).await {
                        tracing::warn!(error=%err, "flush on interval failed");
                    }
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(BatchCommand::Record(record)) => {
                            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            buffer.push(record);
                            if buffer.len() >= batch_size {
                                if let Err(err) = flush(store.as_ref(), &mut buffer, &stats, settings.max_queue).await {
                                    tracing::warn!(error=%err, "flush on batch size failed");
                                }
                            }
                        }
                        Some(BatchCommand::Flush(done)) => {
                            let result = flush(store.as_ref(), &mut buffer, &stats, settings.max_queue).await;
                            if let Err(err) = &result {
                                tracing::warn!(error=%err, "flush on demand failed");
                            }
                            let _ = done.send(result.map_err(|err| err.to_string()));
                        }
                        None => {
                            if let Err(err) = flush(store.as_ref(), &mut buffer, &stats, settings.max_queue).await {
                                tracing::warn!(error=%err, "flush during shutdown failed");
                            }
                            break;
                        }
                    }
                }
            }
        }
    })
}

async fn flush(
    store: &dyn TelemetryStore,
    buffer: &mut Vec<TelemetryRecord>,
    stats: &IngestStats,
    max_queue: usize,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }

    let started = Instant::now();
    let items = std::mem::take(buffer);
    let len = items.len();

    match store.upsert_records(&items).await {
        Ok(written) => {
            stats.last_batch_len.store(len as u64, Ordering::Relaxed);
            let now = Utc::now().timestamp_millis() as u64;
            stats.last_flush_unix_ms.store(now, Ordering::Relaxed);
            let micros = started.elapsed().as_micros() as u64;
            let prev = stats.average_flush_micros.load(Ordering::Relaxed);
            let avg = if prev == 0 {
                micros
            } else {
                (prev + micros) / 2
            };
            stats.average_flush_micros.store(avg, Ordering::Relaxed);
            stats.clear_error();
            tracing::debug!(len, written, micros, store = store.name(), "flushed telemetry batch");
            Ok(())
        }
        Err(err) => {
            stats.record_error(err.to_string());
            tracing::error!(error=%err, store = store.name(), "failed to flush telemetry");
            buffer.extend(items);
            let overflow = buffer.len().saturating_sub(max_queue.max(1));
            if overflow > 0 {
                buffer.drain(..overflow);
                stats
                    .dropped_records
                    .fetch_add(overflow as u64, Ordering::Relaxed);
                tracing::warn!(dropped = overflow, "retry buffer full; dropped oldest records");
            }
            Err(err.into())
        }
    }
}
