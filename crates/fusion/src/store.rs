//! Context store — one fused snapshot per active session.
//!
//! The session map sits behind a short `RwLock` used only for lookup; each
//! session carries its own `watch` channel holding the current snapshot, so
//! fusion for one session never waits on another. Readers clone the `Arc`
//! and keep a consistent view for as long as they like.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use drivetalk_core::{
    ContextDelta, ContextSnapshot, DomainEvent, EventBus, HistoryEntry, IngestError, SessionId,
    SessionInfo,
};

use crate::engine::{FusionEngine, FusionOutcome};

struct SessionCell {
    user_ref: String,
    created_at: DateTime<Utc>,
    snapshot: watch::Sender<Arc<ContextSnapshot>>,
    state: Mutex<SessionState>,
}

struct SessionState {
    history: VecDeque<HistoryEntry>,
    last_activity: DateTime<Utc>,
    last_seen: Instant,
}

impl SessionCell {
    fn new(user_ref: String) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(ContextSnapshot::new()));
        Self {
            user_ref,
            created_at: Utc::now(),
            snapshot,
            state: Mutex::new(SessionState {
                history: VecDeque::new(),
                last_activity: Utc::now(),
                last_seen: Instant::now(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ContextStore {
    sessions: RwLock<HashMap<SessionId, Arc<SessionCell>>>,
    engine: FusionEngine,
    events: Arc<EventBus>,
    history_limit: usize,
}

impl ContextStore {
    pub fn new(engine: FusionEngine, events: Arc<EventBus>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            engine,
            events,
            history_limit: 10,
        }
    }

    /// Maximum completed turns retained per session.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn cell(&self, id: &SessionId) -> Option<Arc<SessionCell>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Open a session with a fresh id and an empty snapshot.
    pub fn open(&self, user_ref: impl Into<String>) -> SessionId {
        let id = SessionId::generate();
        self.open_with_id(id.clone(), user_ref);
        id
    }

    /// Open a session under a caller-chosen id. Returns false if it already exists.
    pub fn open_with_id(&self, id: SessionId, user_ref: impl Into<String>) -> bool {
        let user_ref = user_ref.into();
        {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            if sessions.contains_key(&id) {
                return false;
            }
            sessions.insert(id.clone(), Arc::new(SessionCell::new(user_ref.clone())));
        }

        info!(session_id = %id, user_ref = %user_ref, "Session opened");
        self.events.publish(DomainEvent::SessionOpened {
            session_id: id.to_string(),
            user_ref,
            timestamp: Utc::now(),
        });
        true
    }

    /// Drop a session and its snapshot. Subscribers see the channel close.
    pub fn close(&self, id: &SessionId, reason: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed.is_none() {
            return false;
        }

        info!(session_id = %id, reason = %reason, "Session closed");
        self.events.publish(DomainEvent::SessionClosed {
            session_id: id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        true
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.cell(id).is_some()
    }

    /// Fuse one delta into its session's snapshot.
    ///
    /// Subscribers are notified only when a field actually changed, and only
    /// then is `ContextUpdated` published with the applied field names. A
    /// delta whose fields were all stale still advances the source cursor.
    pub fn apply_delta(&self, delta: &ContextDelta) -> Result<FusionOutcome, IngestError> {
        let mut version = 0;
        let result = match self.cell(&delta.session_id) {
            Some(cell) => {
                let mut result = Err(IngestError::SessionNotFound(delta.session_id.to_string()));
                cell.snapshot.send_if_modified(|current| {
                    match self.engine.apply(current, delta) {
                        Ok((next, outcome)) => {
                            let changed = outcome.changed;
                            version = next.version;
                            *current = Arc::new(next);
                            result = Ok(outcome);
                            changed
                        }
                        Err(e) => {
                            result = Err(e);
                            false
                        }
                    }
                });
                result
            }
            None => Err(IngestError::SessionNotFound(delta.session_id.to_string())),
        };

        match &result {
            Ok(outcome) => {
                debug!(
                    session_id = %delta.session_id,
                    source = %delta.source,
                    cursor = %delta.cursor(),
                    applied = outcome.applied_fields.len(),
                    stale = outcome.stale_fields.len(),
                    "Delta fused"
                );
                if outcome.changed {
                    self.events.publish(DomainEvent::ContextUpdated {
                        session_id: delta.session_id.to_string(),
                        version,
                        fields: outcome.applied_fields.clone(),
                        timestamp: Utc::now(),
                    });
                }
            }
            Err(e) => {
                if matches!(e, IngestError::SessionNotFound(_)) {
                    debug!(session_id = %delta.session_id, source = %delta.source, "Delta for unknown session");
                } else {
                    warn!(
                        session_id = %delta.session_id,
                        source = %delta.source,
                        error = %e,
                        "Delta rejected"
                    );
                }
                self.events.publish(DomainEvent::DeltaDropped {
                    session_id: Some(delta.session_id.to_string()),
                    source: delta.source,
                    reason: e.kind().into(),
                    timestamp: Utc::now(),
                });
            }
        }
        result
    }

    /// The current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self, id: &SessionId) -> Option<Arc<ContextSnapshot>> {
        self.cell(id).map(|cell| cell.snapshot.borrow().clone())
    }

    /// Change notifications for a session's snapshot.
    pub fn subscribe(&self, id: &SessionId) -> Option<watch::Receiver<Arc<ContextSnapshot>>> {
        self.cell(id).map(|cell| cell.snapshot.subscribe())
    }

    /// Record a completed turn; the oldest entry is evicted past the limit.
    pub fn push_history(&self, id: &SessionId, entry: HistoryEntry) -> bool {
        let Some(cell) = self.cell(id) else {
            return false;
        };
        let mut state = cell.state();
        state.history.push_back(entry);
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
        true
    }

    /// The most recent `limit` history entries, oldest first.
    pub fn history(&self, id: &SessionId, limit: usize) -> Vec<HistoryEntry> {
        let Some(cell) = self.cell(id) else {
            return Vec::new();
        };
        let state = cell.state();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Mark user activity on a session.
    pub fn touch(&self, id: &SessionId) {
        if let Some(cell) = self.cell(id) {
            let mut state = cell.state();
            state.last_activity = Utc::now();
            state.last_seen = Instant::now();
        }
    }

    /// Sessions with no activity for at least `max_idle`.
    pub fn idle_sessions(&self, max_idle: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut idle: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, cell)| now.duration_since(cell.state().last_seen) >= max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        idle.sort();
        idle
    }

    pub fn info(&self, id: &SessionId) -> Option<SessionInfo> {
        let cell = self.cell(id)?;
        let context_version = cell.snapshot.borrow().version;
        let state = cell.state();
        Some(SessionInfo {
            id: id.clone(),
            user_ref: cell.user_ref.clone(),
            created_at: cell.created_at,
            last_activity: state.last_activity,
            history_len: state.history.len(),
            context_version,
        })
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids.iter().filter_map(|id| self.info(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
