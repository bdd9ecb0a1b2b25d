//! Wires ingest, fusion, allocation, scheduling and telemetry into one
//! process-local runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use drivetalk_allocator::ResourceAllocator;
use drivetalk_config::AppConfig;
use drivetalk_core::{EventBus, SourceKind, StageKind};
use drivetalk_fusion::{ContextStore, FusionEngine, FusionWorker};
use drivetalk_ingest::{Backoff, ChannelConnector, DeltaQueue, IngestHub, RawEvent, SourceAdapter};
use drivetalk_scheduler::{TurnOutput, TurnScheduler};
use drivetalk_telemetry::TelemetryEngine;

use crate::loopback::LoopbackStage;

/// Loopback latency per stage at the normal tier.
const LOOPBACK_LATENCY: [(StageKind, u64); 3] = [
    (StageKind::Understanding, 60),
    (StageKind::Generation, 180),
    (StageKind::Synthesis, 90),
];

pub struct Runtime {
    config: AppConfig,
    events: Arc<EventBus>,
    queue: Arc<DeltaQueue>,
    store: Arc<ContextStore>,
    scheduler: TurnScheduler,
    telemetry: Arc<TelemetryEngine>,
    hub: Option<IngestHub>,
    feeds: HashMap<SourceKind, mpsc::Sender<RawEvent>>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Build every component from `config`, with loopback stage adapters and
    /// one in-process connector per source kind.
    pub fn new(config: AppConfig) -> Self {
        let events = Arc::new(EventBus::new(4096));
        let queue =
            Arc::new(DeltaQueue::new(config.ingest.queue_capacity).with_events(events.clone()));
        let store = Arc::new(
            ContextStore::new(
                FusionEngine::from_skew_ms(config.fusion.max_clock_skew_ms),
                events.clone(),
            )
            .with_history_limit(config.sessions.history_limit),
        );
        let allocator = Arc::new(ResourceAllocator::new(config.allocator.clone(), events.clone()));

        let mut builder =
            TurnScheduler::builder(config.scheduler.clone(), store.clone(), allocator)
                .idle_timeout(Duration::from_secs(config.sessions.idle_timeout_secs));
        if config.proactive.enabled {
            builder = builder.proactive_rules(config.proactive.rules.clone());
        }
        for (kind, latency_ms) in LOOPBACK_LATENCY {
            builder = builder.stage(Arc::new(
                LoopbackStage::new(kind, Duration::from_millis(latency_ms))
                    .with_field_max_age(config.fusion.field_max_age_secs),
            ));
        }

        let mut hub = IngestHub::new(queue.clone(), events.clone()).with_backoff(Backoff::new(
            Duration::from_millis(config.ingest.reconnect_base_ms),
            Duration::from_millis(config.ingest.reconnect_max_ms),
        ));
        let mut feeds = HashMap::new();
        for kind in SourceKind::ALL {
            let (connector, tx) = ChannelConnector::pair(format!("loopback://{kind}"), 256);
            hub.register(Box::new(SourceAdapter::new(
                format!("{kind}-loopback"),
                kind,
                Arc::new(connector),
            )));
            feeds.insert(kind, tx);
        }

        Self {
            telemetry: Arc::new(TelemetryEngine::from_config(&config.telemetry)),
            config,
            events,
            queue,
            store,
            scheduler: builder.build(),
            hub: Some(hub),
            feeds,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn scheduler(&self) -> &TurnScheduler {
        &self.scheduler
    }

    pub fn telemetry(&self) -> &Arc<TelemetryEngine> {
        &self.telemetry
    }

    /// Spawn the background tasks and return the turn output stream.
    pub fn start(&mut self) -> Result<mpsc::Receiver<TurnOutput>, Box<dyn std::error::Error>> {
        let hub = self.hub.take().ok_or("runtime already started")?;

        if self.config.telemetry.enabled {
            self.handles
                .push(self.telemetry.clone().start(&self.events, self.shutdown.clone()));
        }
        self.handles.extend(hub.start_all(self.shutdown.clone()));
        self.handles.push(
            FusionWorker::new(self.store.clone(), self.queue.clone())
                .auto_open(self.config.fusion.auto_open_sessions)
                .start(self.shutdown.clone()),
        );

        let (outputs, handle) = self.scheduler.start(self.shutdown.clone())?;
        self.handles.push(handle);
        info!(tasks = self.handles.len(), "Runtime started");
        Ok(outputs)
    }

    /// Push a raw event into the connector for `source`.
    pub async fn feed(&self, source: SourceKind, event: RawEvent) {
        let Some(tx) = self.feeds.get(&source) else {
            warn!(source = %source, "No connector for source");
            return;
        };
        if tx.send(event).await.is_err() {
            warn!(source = %source, "Connector is not accepting events");
        }
    }

    /// Cancel every task and wait for them to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Runtime task ended abnormally");
            }
        }
        info!("Runtime stopped");
    }
}
