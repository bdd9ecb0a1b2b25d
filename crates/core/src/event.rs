//! Domain event system — the observability boundary of the core.
//!
//! Turn state transitions, tier changes, context changes, dropped deltas and
//! session lifecycle changes are published here. A telemetry sink (or anything else) subscribes
//! without the publishers knowing about it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::context::SourceKind;
use crate::turn::{Priority, QualityTier, StageKind, TurnState};

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A session was opened
    SessionOpened {
        session_id: String,
        user_ref: String,
        timestamp: DateTime<Utc>,
    },

    /// A session was closed explicitly or reaped after idling
    SessionClosed {
        session_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A turn moved to a new state
    TurnStateChanged {
        turn_id: String,
        session_id: String,
        priority: Priority,
        state: TurnState,
        timestamp: DateTime<Utc>,
    },

    /// A stage invocation finished (successfully or not)
    StageCompleted {
        turn_id: String,
        session_id: String,
        stage: StageKind,
        tier: QualityTier,
        duration_ms: u64,
        success: bool,
        timestamp: DateTime<Utc>,
    },

    /// The allocator moved a stage to another quality tier
    TierChanged {
        stage: StageKind,
        from: QualityTier,
        to: QualityTier,
        avg_latency_ms: u64,
        queue_depth: usize,
        timestamp: DateTime<Utc>,
    },

    /// A context delta was rejected or dropped
    DeltaDropped {
        session_id: Option<String>,
        source: SourceKind,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A delta changed at least one field of a session's snapshot
    ContextUpdated {
        session_id: String,
        version: u64,
        fields: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A context change matched a proactive rule and queued a turn
    ProactiveTriggered {
        turn_id: String,
        session_id: String,
        rule: String,
        timestamp: DateTime<Utc>,
    },

    /// A queued turn picked up a newer context snapshot before dispatch
    ContextRefreshed {
        turn_id: String,
        session_id: String,
        version: u64,
        timestamp: DateTime<Utc>,
    },

    /// A failed turn produced a fallback response
    FallbackIssued {
        turn_id: String,
        session_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Event name, matching the serialized `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionOpened { .. } => "session_opened",
            Self::SessionClosed { .. } => "session_closed",
            Self::TurnStateChanged { .. } => "turn_state_changed",
            Self::StageCompleted { .. } => "stage_completed",
            Self::TierChanged { .. } => "tier_changed",
            Self::DeltaDropped { .. } => "delta_dropped",
            Self::ContextUpdated { .. } => "context_updated",
            Self::ProactiveTriggered { .. } => "proactive_triggered",
            Self::ContextRefreshed { .. } => "context_refreshed",
            Self::FallbackIssued { .. } => "fallback_issued",
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Slow subscribers lag and lose the oldest events; publishers never block.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
