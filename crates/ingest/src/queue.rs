//! Bounded delta queue with a drop-oldest policy.
//!
//! Producers never wait: when the queue is full the oldest delta is evicted.
//! This keeps a slow fusion consumer from stalling the ingest adapters, at the
//! cost of losing the stalest context.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::warn;

use drivetalk_core::{ContextDelta, DomainEvent, EventBus};

pub struct DeltaQueue {
    items: Mutex<VecDeque<ContextDelta>>,
    capacity: usize,
    available: Notify,
    dropped: AtomicU64,
    events: Option<Arc<EventBus>>,
}

impl DeltaQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            available: Notify::new(),
            dropped: AtomicU64::new(0),
            events: None,
        }
    }

    /// Publish a `DeltaDropped` event for every eviction.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Enqueue a delta. Returns the evicted delta when the queue was full.
    pub fn push(&self, delta: ContextDelta) -> Option<ContextDelta> {
        let evicted = {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(delta);
            evicted
        };

        if let Some(old) = &evicted {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                session_id = %old.session_id,
                source = %old.source,
                sequence = old.sequence,
                total_dropped = total,
                "Ingest queue full, dropped oldest delta"
            );
            if let Some(events) = &self.events {
                events.publish(DomainEvent::DeltaDropped {
                    session_id: Some(old.session_id.to_string()),
                    source: old.source,
                    reason: "queue_full".into(),
                    timestamp: Utc::now(),
                });
            }
        }

        self.available.notify_one();
        evicted
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<ContextDelta> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Wait for the next delta.
    pub async fn pop(&self) -> ContextDelta {
        loop {
            if let Some(delta) = self.try_pop() {
                return delta;
            }
            self.available.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total deltas evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
