//! Fusion worker — drains the ingest queue into the context store.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use drivetalk_ingest::DeltaQueue;

use crate::store::ContextStore;

pub struct FusionWorker {
    store: Arc<ContextStore>,
    queue: Arc<DeltaQueue>,
    auto_open: bool,
}

impl FusionWorker {
    pub fn new(store: Arc<ContextStore>, queue: Arc<DeltaQueue>) -> Self {
        Self {
            store,
            queue,
            auto_open: false,
        }
    }

    /// Open a session for the first delta that names an unknown one.
    pub fn auto_open(mut self, enabled: bool) -> Self {
        self.auto_open = enabled;
        self
    }

    /// Apply everything currently queued. Returns how many deltas changed a snapshot.
    pub fn drain(&self) -> usize {
        let mut changed = 0;
        while let Some(delta) = self.queue.try_pop() {
            if self.process(&delta) {
                changed += 1;
            }
        }
        changed
    }

    fn process(&self, delta: &drivetalk_core::ContextDelta) -> bool {
        if self.auto_open && !self.store.contains(&delta.session_id) {
            self.store
                .open_with_id(delta.session_id.clone(), format!("auto:{}", delta.source));
        }
        matches!(self.store.apply_delta(delta), Ok(outcome) if outcome.changed)
    }

    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(auto_open = self.auto_open, "Fusion worker started");
            loop {
                let delta = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    delta = self.queue.pop() => delta,
                };
                self.process(&delta);
            }
            info!("Fusion worker stopped");
        })
    }
}
