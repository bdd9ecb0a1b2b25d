//! Ingest hub — owns every registered signal source.
//!
//! Each source runs in its own task: connect, pull deltas into the shared
//! [`DeltaQueue`], reconnect with exponential backoff when the connection
//! drops. Malformed events are skipped and reported; they never stop a source.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drivetalk_core::{DomainEvent, EventBus, IngestError, SignalSource, SourceKind};

use crate::queue::DeltaQueue;

/// Exponential reconnect delay: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(30))
    }
}

/// Registry of signal sources, one per source kind.
pub struct IngestHub {
    sources: HashMap<SourceKind, Box<dyn SignalSource>>,
    queue: Arc<DeltaQueue>,
    events: Arc<EventBus>,
    backoff: Backoff,
}

impl IngestHub {
    pub fn new(queue: Arc<DeltaQueue>, events: Arc<EventBus>) -> Self {
        Self {
            sources: HashMap::new(),
            queue,
            events,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Register a source. A second source of the same kind replaces the first.
    pub fn register(&mut self, source: Box<dyn SignalSource>) {
        let kind = source.kind();
        let name = source.name().to_string();
        if let Some(previous) = self.sources.insert(kind, source) {
            warn!(
                kind = %kind,
                replaced = %previous.name(),
                source = %name,
                "Replaced existing signal source"
            );
        } else {
            info!(kind = %kind, source = %name, "Registered signal source");
        }
    }

    /// Registered source names by kind.
    pub fn list(&self) -> Vec<(SourceKind, String)> {
        let mut sources: Vec<_> = self
            .sources
            .iter()
            .map(|(kind, source)| (*kind, source.name().to_string()))
            .collect();
        sources.sort();
        sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn queue(&self) -> &Arc<DeltaQueue> {
        &self.queue
    }

    /// Spawn one task per source. Tasks run until `shutdown` is cancelled.
    pub fn start_all(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let Self {
            sources,
            queue,
            events,
            backoff,
        } = self;

        sources
            .into_values()
            .map(|source| {
                let queue = queue.clone();
                let events = events.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(run_source(source, queue, events, backoff, shutdown))
            })
            .collect()
    }
}

async fn run_source(
    mut source: Box<dyn SignalSource>,
    queue: Arc<DeltaQueue>,
    events: Arc<EventBus>,
    backoff: Backoff,
    shutdown: CancellationToken,
) {
    let name = source.name().to_string();
    let kind = source.kind();
    let mut attempt = 0u32;

    'connect: loop {
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break 'connect,
            result = source.connect() => result,
        };
        if let Err(e) = connected {
            let delay = backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            warn!(
                source = %name,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Source connect failed"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break 'connect,
                _ = tokio::time::sleep(delay) => continue 'connect,
            }
        }
        attempt = 0;

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break 'connect,
                next = source.next_delta() => next,
            };
            match next {
                Ok(Some(delta)) => {
                    debug!(
                        source = %name,
                        session_id = %delta.session_id,
                        cursor = %delta.cursor(),
                        "Delta received"
                    );
                    queue.push(delta);
                }
                Ok(None) => {
                    info!(source = %name, "Source stream ended, reconnecting");
                    continue 'connect;
                }
                Err(IngestError::ConnectionLost(reason)) => {
                    warn!(source = %name, reason = %reason, "Source connection lost");
                    continue 'connect;
                }
                Err(e) => {
                    warn!(source = %name, error = %e, "Skipping bad event");
                    events.publish(DomainEvent::DeltaDropped {
                        session_id: None,
                        source: kind,
                        reason: e.kind().into(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    }

    info!(source = %name, "Source stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ChannelConnector, RawEvent, SourceAdapter};
    use serde_json::json;

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_millis(1000));
        assert_eq!(backoff.delay(60), Duration::from_millis(1000));
    }

    #[test]
    fn register_replaces_same_kind() {
        let mut hub = IngestHub::new(Arc::new(DeltaQueue::new(8)), Arc::new(EventBus::default()));
        hub.register(Box::new(SourceAdapter::telemetry(
            "can0",
            Arc::new(ChannelConnector::new("a")),
        )));
        hub.register(Box::new(SourceAdapter::telemetry(
            "can1",
            Arc::new(ChannelConnector::new("b")),
        )));
        hub.register(Box::new(SourceAdapter::external(
            "weather",
            Arc::new(ChannelConnector::new("c")),
        )));
        assert_eq!(hub.len(), 2);
        assert_eq!(
            hub.list(),
            vec![
                (SourceKind::Telemetry, "can1".to_string()),
                (SourceKind::External, "weather".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn source_reconnects_with_new_epoch() {
        let queue = Arc::new(DeltaQueue::new(16));
        let bus = Arc::new(EventBus::default());
        let mut dropped = bus.subscribe();

        let connector = Arc::new(ChannelConnector::new("asr"));
        let first = connector.add_connection(8);
        let mut hub = IngestHub::new(queue.clone(), bus)
            .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(40)));
        hub.register(Box::new(SourceAdapter::transcript("asr", connector.clone())));

        let shutdown = CancellationToken::new();
        let handles = hub.start_all(shutdown.clone());

        first.send(RawEvent::new("s1").with("text", json!("hi"))).await.unwrap();
        first.send(RawEvent::new("s1").with("final", json!(true))).await.unwrap();
        drop(first);

        let d1 = queue.pop().await;
        assert_eq!((d1.epoch, d1.sequence), (1, 1));
        let event = dropped.recv().await.unwrap();
        assert!(matches!(
            event.as_ref(),
            DomainEvent::DeltaDropped { reason, .. } if reason == "malformed"
        ));

        // No pending connection: the hub backs off until one appears.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = connector.add_connection(8);
        second.send(RawEvent::new("s1").with("text", json!("again"))).await.unwrap();

        let d2 = tokio::time::timeout(Duration::from_secs(5), queue.pop())
            .await
            .unwrap();
        assert_eq!((d2.epoch, d2.sequence), (2, 1));

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
