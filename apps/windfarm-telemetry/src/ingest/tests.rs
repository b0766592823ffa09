use super::{LiveAggregator, Observation, TelemetryIngestor};
use crate::bucket::BucketWidth;
use crate::engine::TelemetryEngine;
use crate::error::EngineError;
use crate::fanout::SubscriptionHub;
use crate::pipeline::{self, WorkerSettings};
use crate::store::{MemoryTelemetryStore, TelemetryStore};
use crate::telemetry::{Scope, TelemetryRecord};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn at(minute: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::minutes(minute)
}

fn power(minute: i64, device: &str, kw: f64) -> TelemetryRecord {
    TelemetryRecord::new(at(minute), device, kw / 60.0, kw)
}

struct Harness {
    store: Arc<MemoryTelemetryStore>,
    live: Arc<LiveAggregator>,
    ingestor: TelemetryIngestor,
    engine: TelemetryEngine,
    hub: SubscriptionHub,
}

fn harness(width: BucketWidth, retention_minutes: i64) -> Harness {
    let store = Arc::new(MemoryTelemetryStore::new());
    let live = Arc::new(LiveAggregator::new(width, retention_minutes));
    let (pipeline, _worker) = pipeline::start(
        store.clone(),
        WorkerSettings {
            batch_size: 1000,
            flush_interval: Duration::from_secs(3600),
            max_queue: 10_000,
        },
    );
    let hub = SubscriptionHub::new(64, 64);
    let ingestor = TelemetryIngestor::new(live.clone(), pipeline, store.clone(), hub.clone());
    let engine = TelemetryEngine::new(store.clone(), live.clone(), 180);
    Harness {
        store,
        live,
        ingestor,
        engine,
        hub,
    }
}

#[tokio::test]
async fn redelivery_is_idempotent() {
    let h = harness(BucketWidth::ONE_MINUTE, 240);
    let record = power(0, "D1", 30.0);

    let first = h.ingestor.ingest(record.clone()).await.unwrap();
    assert_eq!(first.observation, Observation::Inserted);
    let again = h.ingestor.ingest(record.clone()).await.unwrap();
    assert_eq!(again.observation, Observation::Unchanged);
    assert!(again.superseded);

    let live = h.live.live_buckets(&Scope::device("D1")).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].sample_count, 1);
    assert_eq!(live[0].average_power_kw, 30.0);
}

#[tokio::test]
async fn same_key_supersedes_previous_values() {
    let h = harness(BucketWidth::ONE_MINUTE, 240);
    h.ingestor.ingest(power(0, "D1", 30.0)).await.unwrap();
    let outcome = h.ingestor.ingest(power(0, "D1", 45.0)).await.unwrap();
    assert_eq!(outcome.observation, Observation::Superseded);

    for scope in [Scope::device("D1"), Scope::All] {
        let live = h.live.live_buckets(&scope).await;
        assert_eq!(live[0].sample_count, 1);
        assert_eq!(live[0].average_power_kw, 45.0);
    }
}

#[tokio::test]
async fn live_state_matches_batch_bucketing() {
    let width = BucketWidth::parse("PT5M").unwrap();
    let h = harness(width, 240);
    let mut records = Vec::new();
    for minute in 0..15 {
        records.push(power(minute, "D1", 10.0 + minute as f64));
        records.push(power(minute, "D2", 3.0 * minute as f64));
    }
    // Shuffled arrival, with one redelivered record.
    records.reverse();
    records.push(power(7, "D2", 21.0));
    for record in &records {
        h.ingestor.ingest(record.clone()).await.unwrap();
    }

    let live = h.live.live_buckets(&Scope::All).await;
    let batch = crate::bucket::compute_buckets(&records, &Scope::All, at(0), at(15), width).unwrap();
    assert_eq!(live.len(), 3);
    for (l, b) in live.iter().zip(batch.iter()) {
        assert_eq!(l.bucket_start, b.bucket_start);
        assert_eq!(l.average_power_kw, b.average_power_kw);
        assert_eq!(l.total_energy_kwh, b.total_energy_kwh);
        assert_eq!(l.sample_count, b.sample_count);
    }
}

#[tokio::test]
async fn late_record_updates_only_its_bucket() {
    let h = harness(BucketWidth::ONE_MINUTE, 240);
    for minute in 0..5 {
        h.ingestor.ingest(power(minute, "D1", 100.0)).await.unwrap();
    }
    let before = h
        .engine
        .compute_buckets(&Scope::All, at(0), at(5), BucketWidth::ONE_MINUTE)
        .await
        .unwrap();

    h.ingestor.ingest(power(1, "D2", 50.0)).await.unwrap();
    let after = h
        .engine
        .compute_buckets(&Scope::All, at(0), at(5), BucketWidth::ONE_MINUTE)
        .await
        .unwrap();

    assert_eq!(after[1].average_power_kw, 150.0);
    assert_eq!(after[1].sample_count, 2);
    for idx in [0, 2, 3, 4] {
        assert_eq!(after[idx], before[idx]);
    }
}

#[tokio::test]
async fn records_beyond_retention_are_written_through() {
    let h = harness(BucketWidth::ONE_MINUTE, 10);
    h.ingestor.ingest(power(0, "D1", 5.0)).await.unwrap();
    h.ingestor.ingest(power(60, "D1", 6.0)).await.unwrap();

    // The first bucket fell out of the live window when minute 60 arrived.
    let live = h.live.live_buckets(&Scope::device("D1")).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].bucket_start, at(60));

    let stale = h.ingestor.ingest(power(1, "D1", 7.0)).await.unwrap();
    assert_eq!(stale.observation, Observation::Stale);
    assert!(!stale.superseded);

    // Persisted before ingest returned, along with everything queued ahead of it.
    assert_eq!(h.store.len().await, 3);
    let buckets = h
        .engine
        .compute_buckets(&Scope::device("D1"), at(0), at(2), BucketWidth::ONE_MINUTE)
        .await
        .unwrap();
    assert_eq!(buckets[0].average_power_kw, 5.0);
    assert_eq!(buckets[1].average_power_kw, 7.0);
}

#[tokio::test]
async fn late_records_agree_across_scopes_without_flush() {
    let h = harness(BucketWidth::ONE_MINUTE, 240);
    h.ingestor.ingest(power(10, "D2", 20.0)).await.unwrap();
    h.ingestor.ingest(power(300, "D1", 100.0)).await.unwrap();

    // Stale for D1 and the farm.
    let d1 = h.ingestor.ingest(power(10, "D1", 30.0)).await.unwrap();
    assert_eq!(d1.observation, Observation::Stale);
    // Still inside D2's own window but behind the farm window.
    let d2 = h.ingestor.ingest(power(10, "D2", 25.0)).await.unwrap();
    assert_eq!(d2.observation, Observation::Stale);
    assert!(d2.superseded);

    let bucket_at_10 = |scope: Scope| {
        let engine = h.engine.clone();
        async move {
            engine
                .compute_buckets(&scope, at(10), at(11), BucketWidth::ONE_MINUTE)
                .await
                .unwrap()
                .remove(0)
        }
    };
    let d1 = bucket_at_10(Scope::device("D1")).await;
    let d2 = bucket_at_10(Scope::device("D2")).await;
    let all = bucket_at_10(Scope::All).await;
    assert_eq!(d1.average_power_kw, 30.0);
    assert_eq!(d2.average_power_kw, 25.0);
    assert_eq!(all.average_power_kw, 55.0);
    assert_eq!(all.sample_count, d1.sample_count + d2.sample_count);
    assert_eq!(all.total_energy_kwh, d1.total_energy_kwh + d2.total_energy_kwh);
}

#[tokio::test]
async fn stale_redelivery_is_published_once() {
    let h = harness(BucketWidth::ONE_MINUTE, 240);
    let mut all = h.hub.subscribe(Scope::All);
    h.ingestor.ingest(power(300, "D1", 100.0)).await.unwrap();

    let late = power(10, "D1", 30.0);
    let first = h.ingestor.ingest(late.clone()).await.unwrap();
    assert_eq!(first.observation, Observation::Stale);
    let again = h.ingestor.ingest(late.clone()).await.unwrap();
    assert_eq!(again.observation, Observation::Unchanged);
    assert!(again.superseded);

    assert_eq!(all.recv().await.map(|r| r.time), Some(at(300)));
    assert_eq!(all.recv().await, Some(late));
    assert!(all.try_recv().is_none());

    let revised = h.ingestor.ingest(power(10, "D1", 40.0)).await.unwrap();
    assert_eq!(revised.observation, Observation::Stale);
    assert!(revised.superseded);
    assert_eq!(all.recv().await.map(|r| r.power_kw), Some(40.0));
    assert_eq!(h.store.len().await, 2);
}

#[tokio::test]
async fn late_record_with_store_down_is_retryable() {
    let h = harness(BucketWidth::ONE_MINUTE, 240);
    let mut all = h.hub.subscribe(Scope::All);
    h.ingestor.ingest(power(300, "D1", 100.0)).await.unwrap();
    assert!(all.recv().await.is_some());

    h.store.set_offline(true);
    let err = h.ingestor.ingest(power(10, "D1", 30.0)).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(all.try_recv().is_none());

    h.store.set_offline(false);
    let retried = h.ingestor.ingest(power(10, "D1", 30.0)).await.unwrap();
    assert_eq!(retried.observation, Observation::Stale);
    assert_eq!(all.recv().await.map(|r| r.time), Some(at(10)));
    assert_eq!(h.store.len().await, 2);
}

#[tokio::test]
async fn ingest_publishes_and_persists() {
    let h = harness(BucketWidth::ONE_MINUTE, 240);
    let mut d1 = h.hub.subscribe(Scope::device("D1"));
    let mut all = h.hub.subscribe(Scope::All);

    h.ingestor.ingest(power(0, "D1", 1.0)).await.unwrap();
    h.ingestor.ingest(power(0, "D2", 2.0)).await.unwrap();
    h.ingestor.ingest(power(0, "D1", 1.0)).await.unwrap();

    assert_eq!(d1.recv().await.map(|r| r.device_id), Some("D1".to_string()));
    assert!(d1.try_recv().is_none());
    assert_eq!(all.recv().await.map(|r| r.device_id), Some("D1".to_string()));
    assert_eq!(all.recv().await.map(|r| r.device_id), Some("D2".to_string()));
    assert!(all.try_recv().is_none());

    h.ingestor.flush().await.unwrap();
    assert_eq!(h.store.len().await, 2);
    assert_eq!(h.ingestor.stats().snapshot().queue_depth, 0);
}

#[tokio::test]
async fn invalid_batch_is_rejected_without_side_effects() {
    let h = harness(BucketWidth::ONE_MINUTE, 240);
    let err = h
        .ingestor
        .ingest_batch(vec![power(0, "D1", 1.0), power(1, "D1", -5.0)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(h.live.devices().await.is_empty());

    let summary = h
        .ingestor
        .ingest_batch(vec![power(0, "D1", 1.0), power(0, "D1", 2.0)])
        .await
        .unwrap();
    assert_eq!(summary.accepted, 2);
    assert_eq!(summary.superseded, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ingest_across_devices() {
    let h = harness(BucketWidth::ONE_MINUTE, 240);
    let mut tasks = Vec::new();
    for device in 0..8 {
        let ingestor = h.ingestor.clone();
        tasks.push(tokio::spawn(async move {
            let id = format!("WT-{device:02}");
            for minute in 0..30 {
                ingestor.ingest(power(minute, &id, 10.0)).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let buckets = h
        .engine
        .compute_buckets(&Scope::All, at(0), at(30), BucketWidth::ONE_MINUTE)
        .await
        .unwrap();
    assert_eq!(buckets.len(), 30);
    assert!(buckets.iter().all(|b| b.average_power_kw == 80.0 && b.sample_count == 8));
    assert_eq!(h.live.devices().await.len(), 8);

    h.ingestor.flush().await.unwrap();
    assert_eq!(h.store.list_devices().await.unwrap().len(), 8);
}
