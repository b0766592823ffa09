//! Live record fan-out to scoped subscribers.
//!
//! Each subscriber owns a bounded channel. Publishing never waits: a full
//! buffer drops the record for that subscriber only, and a subscriber that
//! keeps dropping or has gone away is evicted.

use crate::telemetry::{Scope, TelemetryRecord};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};

struct SubscriberSlot {
    scope: Scope,
    tx: mpsc::Sender<TelemetryRecord>,
    consecutive_drops: u64,
}

struct HubInner {
    subscribers: Mutex<HashMap<u64, SubscriberSlot>>,
    next_id: AtomicU64,
    buffer: usize,
    max_consecutive_drops: u64,
    dropped_total: AtomicU64,
}

impl HubInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<u64, SubscriberSlot>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn remove(&self, id: u64) -> bool {
        self.registry().remove(&id).is_some()
    }
}

/// Outcome of a single publish.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: usize,
}

#[derive(Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl SubscriptionHub {
    pub fn new(buffer: usize, max_consecutive_drops: u64) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                max_consecutive_drops: max_consecutive_drops.max(1),
                dropped_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self, scope: Scope) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        self.inner.registry().insert(
            id,
            SubscriberSlot {
                scope: scope.clone(),
                tx,
                consecutive_drops: 0,
            },
        );
        tracing::debug!(subscriber = id, scope = %scope, "subscriber registered");
        Subscription {
            id,
            scope,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Removes a subscriber. Removing an unknown or already removed id is a
    /// no-op. Once this returns no further record reaches that subscriber.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.inner.remove(id);
        if removed {
            tracing::debug!(subscriber = id, "subscriber removed");
        }
        removed
    }

    /// Offers `record` to every subscriber whose scope matches it.
    pub fn publish(&self, record: &TelemetryRecord) -> PublishReport {
        let mut report = PublishReport::default();
        let mut registry = self.inner.registry();
        let mut evict = Vec::new();

        for (id, slot) in registry.iter_mut() {
            if !slot.scope.matches(&record.device_id) {
                continue;
            }
            match slot.tx.try_send(record.clone()) {
                Ok(()) => {
                    slot.consecutive_drops = 0;
                    report.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    slot.consecutive_drops += 1;
                    report.dropped += 1;
                    tracing::debug!(
                        subscriber = *id,
                        device = %record.device_id,
                        consecutive = slot.consecutive_drops,
                        "subscriber buffer full; dropped record"
                    );
                    if slot.consecutive_drops >= self.inner.max_consecutive_drops {
                        tracing::warn!(subscriber = *id, "evicting stalled subscriber");
                        evict.push(*id);
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    evict.push(*id);
                }
            }
        }

        for id in &evict {
            registry.remove(id);
        }
        report.evicted = evict.len();
        if report.dropped > 0 {
            self.inner
                .dropped_total
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
        }
        report
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry().len()
    }

    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    scope: Scope,
    rx: mpsc::Receiver<TelemetryRecord>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Next record, or `None` once the subscriber has been removed and its
    /// buffer drained.
    pub async fn recv(&mut self) -> Option<TelemetryRecord> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TelemetryRecord> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = TelemetryRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            if hub.remove(self.id) {
                tracing::debug!(subscriber = self.id, "subscriber disconnected");
            }
        }
    }
}
