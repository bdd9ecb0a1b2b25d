//! Thread-safe telemetry engine: folds domain events into turn traces,
//! stage latency statistics and running counters.

use crate::TelemetryError;
use crate::model::*;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use drivetalk_config::TelemetryConfig;
use drivetalk_core::{DomainEvent, EventBus, Priority, StageKind, TurnState};

/// The core telemetry engine.
///
/// Thread-safe via `RwLock`. Everything it knows comes from [`DomainEvent`]s,
/// either pushed through [`record`](Self::record) or pulled off the bus by
/// the task from [`start`](Self::start).
pub struct TelemetryEngine {
    /// Traces retained before the oldest completed ones are pruned.
    max_traces: usize,
    response_threshold_ms: u64,
    log_events: bool,
    started_at: DateTime<Utc>,
    /// All recorded traces (most recent last).
    traces: RwLock<Vec<Trace>>,
    totals: RwLock<RunningTotals>,
}

#[derive(Debug, Default)]
struct StageTotals {
    invocations: u64,
    failures: u64,
    total_ms: u64,
    min_ms: u64,
    max_ms: u64,
    latest_ms: u64,
}

impl StageTotals {
    fn observe(&mut self, duration_ms: u64, success: bool) {
        if self.invocations == 0 || duration_ms < self.min_ms {
            self.min_ms = duration_ms;
        }
        self.max_ms = self.max_ms.max(duration_ms);
        self.latest_ms = duration_ms;
        self.total_ms = self.total_ms.saturating_add(duration_ms);
        self.invocations += 1;
        if !success {
            self.failures += 1;
        }
    }

    fn summary(&self) -> LatencySummary {
        LatencySummary {
            invocations: self.invocations,
            failures: self.failures,
            mean_ms: if self.invocations == 0 {
                0.0
            } else {
                self.total_ms as f64 / self.invocations as f64
            },
            min_ms: self.min_ms,
            max_ms: self.max_ms,
            latest_ms: self.latest_ms,
        }
    }
}

#[derive(Debug, Default)]
struct RunningTotals {
    turns_submitted: u64,
    turns_succeeded: u64,
    turns_failed: u64,
    turns_cancelled: u64,
    fallbacks: u64,
    slow_turns: u64,
    sessions_opened: u64,
    sessions_closed: u64,
    tier_changes: u64,
    context_refreshes: u64,
    context_updates: u64,
    proactive_turns: u64,
    dropped_deltas: BTreeMap<String, u64>,
    stages: BTreeMap<StageKind, StageTotals>,
}

impl TelemetryEngine {
    /// Create an engine retaining up to `max_traces` traces.
    pub fn new(max_traces: usize) -> Self {
        Self {
            max_traces: max_traces.max(1),
            response_threshold_ms: 1_000,
            log_events: false,
            started_at: Utc::now(),
            traces: RwLock::new(Vec::new()),
            totals: RwLock::new(RunningTotals::default()),
        }
    }

    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self::new(config.max_traces)
            .with_response_threshold(config.response_threshold_ms)
            .with_event_logging(config.log_events)
    }

    pub fn with_response_threshold(mut self, threshold_ms: u64) -> Self {
        self.response_threshold_ms = threshold_ms;
        self
    }

    /// Debug-log every recorded event as JSON.
    pub fn with_event_logging(mut self, enabled: bool) -> Self {
        self.log_events = enabled;
        self
    }

    fn traces_read(&self) -> RwLockReadGuard<'_, Vec<Trace>> {
        self.traces.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn traces_write(&self) -> RwLockWriteGuard<'_, Vec<Trace>> {
        self.traces.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn totals_read(&self) -> RwLockReadGuard<'_, RunningTotals> {
        self.totals.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn totals_write(&self) -> RwLockWriteGuard<'_, RunningTotals> {
        self.totals.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Event intake ──────────────────────────────────────────────────

    /// Subscribe to `events` and record everything published until
    /// `shutdown` fires or the bus goes away.
    pub fn start(self: Arc<Self>, events: &EventBus, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(event) => self.record(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Telemetry fell behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Telemetry subscriber stopped");
        })
    }

    /// Fold one event into traces and totals.
    pub fn record(&self, event: &DomainEvent) {
        if self.log_events {
            match serde_json::to_string(event) {
                Ok(json) => debug!(event = %json, "Domain event"),
                Err(e) => warn!(error = %e, "Failed to serialize domain event"),
            }
        }

        match event {
            DomainEvent::SessionOpened { .. } => self.totals_write().sessions_opened += 1,
            DomainEvent::SessionClosed { .. } => self.totals_write().sessions_closed += 1,
            DomainEvent::TurnStateChanged {
                turn_id,
                session_id,
                priority,
                state,
                timestamp,
            } => self.record_transition(turn_id, session_id, *priority, state, *timestamp),
            DomainEvent::StageCompleted {
                turn_id,
                stage,
                tier,
                duration_ms,
                success,
                timestamp,
                ..
            } => {
                self.totals_write()
                    .stages
                    .entry(*stage)
                    .or_default()
                    .observe(*duration_ms, *success);
                let span = Span::completed(*stage, *tier, *duration_ms, *success, *timestamp);
                self.with_trace(turn_id, |trace| trace.add_span(span));
            }
            DomainEvent::TierChanged { .. } => self.totals_write().tier_changes += 1,
            DomainEvent::DeltaDropped { reason, .. } => {
                *self
                    .totals_write()
                    .dropped_deltas
                    .entry(reason.clone())
                    .or_insert(0) += 1;
            }
            DomainEvent::ContextUpdated { .. } => self.totals_write().context_updates += 1,
            DomainEvent::ProactiveTriggered { .. } => self.totals_write().proactive_turns += 1,
            DomainEvent::ContextRefreshed { turn_id, .. } => {
                self.totals_write().context_refreshes += 1;
                self.with_trace(turn_id, |trace| trace.context_refreshes += 1);
            }
            DomainEvent::FallbackIssued { turn_id, .. } => {
                self.totals_write().fallbacks += 1;
                self.with_trace(turn_id, |trace| trace.fallback = true);
            }
        }
    }

    fn record_transition(
        &self,
        turn_id: &str,
        session_id: &str,
        priority: Priority,
        state: &TurnState,
        at: DateTime<Utc>,
    ) {
        let created = self.ensure_trace(turn_id, session_id, priority, at);
        if !state.is_terminal() {
            if created {
                self.totals_write().turns_submitted += 1;
            }
            return;
        }

        let mut response_ms = None;
        self.with_trace(turn_id, |trace| {
            if !trace.is_finished() {
                trace.end(state.label(), at);
                response_ms = trace.response_time_ms();
            }
        });
        // Already ended: a duplicate terminal event.
        let Some(response_ms) = response_ms else {
            return;
        };

        let mut totals = self.totals_write();
        if created {
            totals.turns_submitted += 1;
        }
        match state {
            TurnState::Succeeded => totals.turns_succeeded += 1,
            TurnState::Failed { .. } => totals.turns_failed += 1,
            TurnState::Cancelled => totals.turns_cancelled += 1,
            TurnState::Queued { .. } | TurnState::Dispatched { .. } => {}
        }
        if response_ms > self.response_threshold_ms {
            totals.slow_turns += 1;
            debug!(turn_id, response_ms, "Turn exceeded response threshold");
        }
    }

    /// Start a trace for `turn_id` unless one exists. Returns whether one
    /// was created.
    fn ensure_trace(
        &self,
        turn_id: &str,
        session_id: &str,
        priority: Priority,
        at: DateTime<Utc>,
    ) -> bool {
        let mut traces = self.traces_write();
        if traces.iter().rev().any(|t| t.id == turn_id) {
            return false;
        }

        if traces.len() >= self.max_traces {
            // Remove oldest completed traces first
            let drain_count = (self.max_traces / 10).max(1);
            let mut removed = 0;
            traces.retain(|t| {
                if removed >= drain_count || !t.is_finished() {
                    return true;
                }
                removed += 1;
                false
            });
            if traces.len() >= self.max_traces {
                traces.remove(0);
            }
        }

        traces.push(Trace::new(turn_id, session_id, priority, at));
        true
    }

    fn with_trace(&self, turn_id: &str, f: impl FnOnce(&mut Trace)) {
        let mut traces = self.traces_write();
        if let Some(trace) = traces.iter_mut().rev().find(|t| t.id == turn_id) {
            f(trace);
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn get_trace(&self, turn_id: &str) -> Option<Trace> {
        self.traces_read().iter().find(|t| t.id == turn_id).cloned()
    }

    /// List recent traces (most recent first).
    pub fn recent_traces(&self, limit: usize) -> Vec<Trace> {
        self.traces_read().iter().rev().take(limit).cloned().collect()
    }

    pub fn traces_for_session(&self, session_id: &str) -> Vec<Trace> {
        self.traces_read()
            .iter()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn trace_count(&self) -> usize {
        self.traces_read().len()
    }

    /// A trace as pretty-printed JSON.
    pub fn export_trace(&self, turn_id: &str) -> Result<String, TelemetryError> {
        let trace = self
            .get_trace(turn_id)
            .ok_or_else(|| TelemetryError::UnknownTrace(turn_id.to_string()))?;
        Ok(serde_json::to_string_pretty(&trace)?)
    }

    pub fn stage_latency(&self, stage: StageKind) -> LatencySummary {
        self.totals_read()
            .stages
            .get(&stage)
            .map(StageTotals::summary)
            .unwrap_or_default()
    }

    pub fn summary(&self) -> TelemetrySummary {
        let trace_count = self.trace_count();
        let totals = self.totals_read();
        TelemetrySummary {
            turns_submitted: totals.turns_submitted,
            turns_succeeded: totals.turns_succeeded,
            turns_failed: totals.turns_failed,
            turns_cancelled: totals.turns_cancelled,
            fallbacks: totals.fallbacks,
            slow_turns: totals.slow_turns,
            response_threshold_ms: self.response_threshold_ms,
            sessions_opened: totals.sessions_opened,
            sessions_closed: totals.sessions_closed,
            tier_changes: totals.tier_changes,
            context_refreshes: totals.context_refreshes,
            context_updates: totals.context_updates,
            proactive_turns: totals.proactive_turns,
            dropped_deltas: totals.dropped_deltas.clone(),
            stages: totals
                .stages
                .iter()
                .map(|(stage, t)| (*stage, t.summary()))
                .collect(),
            trace_count,
            from: self.started_at,
            to: Utc::now(),
        }
    }

    /// Drop finished traces that started before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut traces = self.traces_write();
        let before = traces.len();
        traces.retain(|t| !t.is_finished() || t.started_at >= cutoff);
        before - traces.len()
    }
}

impl Default for TelemetryEngine {
    fn default() -> Self {
        Self::from_config(&TelemetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use drivetalk_core::{QualityTier, SourceKind};

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-10T07:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::milliseconds(ms)
    }

    fn transition(turn: &str, state: TurnState, ms: i64) -> DomainEvent {
        DomainEvent::TurnStateChanged {
            turn_id: turn.into(),
            session_id: "s1".into(),
            priority: Priority::Normal,
            state,
            timestamp: at(ms),
        }
    }

    fn stage(turn: &str, stage: StageKind, duration_ms: u64, success: bool, ms: i64) -> DomainEvent {
        DomainEvent::StageCompleted {
            turn_id: turn.into(),
            session_id: "s1".into(),
            stage,
            tier: QualityTier::Normal,
            duration_ms,
            success,
            timestamp: at(ms),
        }
    }

    fn run_turn(engine: &TelemetryEngine, turn: &str, total_ms: i64) {
        engine.record(&transition(turn, TurnState::Queued { stage: StageKind::Understanding }, 0));
        engine.record(&transition(turn, TurnState::Dispatched { stage: StageKind::Understanding }, 1));
        engine.record(&stage(turn, StageKind::Understanding, 100, true, 100));
        engine.record(&transition(turn, TurnState::Queued { stage: StageKind::Generation }, 100));
        engine.record(&stage(turn, StageKind::Generation, 300, true, 400));
        engine.record(&stage(turn, StageKind::Synthesis, 50, true, total_ms));
        engine.record(&transition(turn, TurnState::Succeeded, total_ms));
    }

    #[test]
    fn turn_lifecycle_builds_a_trace() {
        let engine = TelemetryEngine::new(100);
        run_turn(&engine, "t1", 450);

        assert_eq!(engine.trace_count(), 1);
        let trace = engine.get_trace("t1").unwrap();
        assert_eq!(trace.spans.len(), 3);
        assert_eq!(trace.outcome.as_deref(), Some("succeeded"));
        assert_eq!(trace.response_time_ms(), Some(450));

        let summary = engine.summary();
        assert_eq!(summary.turns_submitted, 1);
        assert_eq!(summary.turns_succeeded, 1);
        assert_eq!(summary.slow_turns, 0);
    }

    #[test]
    fn stage_latency_statistics() {
        let engine = TelemetryEngine::new(100);
        engine.record(&stage("t1", StageKind::Generation, 300, true, 0));
        engine.record(&stage("t2", StageKind::Generation, 100, true, 0));
        engine.record(&stage("t3", StageKind::Generation, 500, false, 0));

        let latency = engine.stage_latency(StageKind::Generation);
        assert_eq!(latency.invocations, 3);
        assert_eq!(latency.failures, 1);
        assert!((latency.mean_ms - 300.0).abs() < 1e-9);
        assert_eq!(latency.min_ms, 100);
        assert_eq!(latency.max_ms, 500);
        assert_eq!(latency.latest_ms, 500);

        assert_eq!(engine.stage_latency(StageKind::Synthesis), LatencySummary::default());
    }

    #[test]
    fn slow_turns_are_counted() {
        let engine = TelemetryEngine::new(100).with_response_threshold(1_000);
        run_turn(&engine, "fast", 800);
        run_turn(&engine, "slow", 1_500);
        assert_eq!(engine.summary().slow_turns, 1);
    }

    #[test]
    fn duplicate_terminal_event_is_counted_once() {
        let engine = TelemetryEngine::new(100);
        run_turn(&engine, "t1", 400);
        engine.record(&transition("t1", TurnState::Succeeded, 500));
        let summary = engine.summary();
        assert_eq!(summary.turns_succeeded, 1);
        assert_eq!(engine.get_trace("t1").unwrap().response_time_ms(), Some(400));
    }

    #[test]
    fn counters_for_failures_and_drops() {
        let engine = TelemetryEngine::new(100);
        engine.record(&transition("t1", TurnState::Queued { stage: StageKind::Understanding }, 0));
        engine.record(&DomainEvent::ContextRefreshed {
            turn_id: "t1".into(),
            session_id: "s1".into(),
            version: 4,
            timestamp: at(10),
        });
        engine.record(&DomainEvent::ContextUpdated {
            session_id: "s1".into(),
            version: 4,
            fields: vec!["vehicle.fuel_level".into()],
            timestamp: at(5),
        });
        engine.record(&DomainEvent::ProactiveTriggered {
            turn_id: "t2".into(),
            session_id: "s1".into(),
            rule: "low_fuel".into(),
            timestamp: at(5),
        });
        engine.record(&transition("t1", TurnState::Failed { reason: "deadline".into() }, 2_000));
        engine.record(&DomainEvent::FallbackIssued {
            turn_id: "t1".into(),
            session_id: "s1".into(),
            reason: "deadline".into(),
            timestamp: at(2_000),
        });
        for reason in ["duplicate", "duplicate", "malformed"] {
            engine.record(&DomainEvent::DeltaDropped {
                session_id: None,
                source: SourceKind::Telemetry,
                reason: reason.into(),
                timestamp: at(0),
            });
        }
        engine.record(&DomainEvent::TierChanged {
            stage: StageKind::Generation,
            from: QualityTier::Normal,
            to: QualityTier::Degraded,
            avg_latency_ms: 2_100,
            queue_depth: 4,
            timestamp: at(0),
        });

        let summary = engine.summary();
        assert_eq!(summary.turns_failed, 1);
        assert_eq!(summary.fallbacks, 1);
        assert_eq!(summary.context_refreshes, 1);
        assert_eq!(summary.context_updates, 1);
        assert_eq!(summary.proactive_turns, 1);
        assert_eq!(summary.tier_changes, 1);
        assert_eq!(summary.dropped_deltas["duplicate"], 2);
        assert_eq!(summary.dropped_deltas["malformed"], 1);

        let trace = engine.get_trace("t1").unwrap();
        assert!(trace.fallback);
        assert_eq!(trace.context_refreshes, 1);
        assert_eq!(trace.outcome.as_deref(), Some("failed"));
    }

    #[test]
    fn retention_prunes_oldest_completed_first() {
        let engine = TelemetryEngine::new(10);
        engine.record(&transition("open", TurnState::Queued { stage: StageKind::Understanding }, 0));
        for i in 0..12 {
            run_turn(&engine, &format!("t{i}"), 400);
        }

        assert!(engine.trace_count() <= 10);
        assert!(engine.get_trace("open").is_some());
        assert!(engine.get_trace("t0").is_none());
        assert!(engine.get_trace("t11").is_some());
        assert_eq!(engine.summary().turns_succeeded, 12);
    }

    #[test]
    fn recent_and_per_session_queries() {
        let engine = TelemetryEngine::new(100);
        for i in 0..5 {
            run_turn(&engine, &format!("t{i}"), 400);
        }
        let recent = engine.recent_traces(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].id, "t4");
        assert_eq!(recent[2].id, "t2");
        assert_eq!(engine.traces_for_session("s1").len(), 5);
        assert!(engine.traces_for_session("other").is_empty());
    }

    #[test]
    fn export_unknown_trace_fails() {
        let engine = TelemetryEngine::new(100);
        run_turn(&engine, "t1", 400);
        assert!(engine.export_trace("t1").unwrap().contains("\"outcome\": \"succeeded\""));
        let err = engine.export_trace("missing").unwrap_err();
        assert!(matches!(err, TelemetryError::UnknownTrace(_)));
    }

    #[test]
    fn prune_keeps_unfinished_traces() {
        let engine = TelemetryEngine::new(100);
        run_turn(&engine, "done", 400);
        engine.record(&transition("open", TurnState::Queued { stage: StageKind::Understanding }, 0));
        let pruned = engine.prune_before(at(60_000));
        assert_eq!(pruned, 1);
        assert!(engine.get_trace("open").is_some());
    }

    #[tokio::test]
    async fn subscriber_records_bus_events() {
        let bus = EventBus::new(64);
        let engine = Arc::new(TelemetryEngine::new(100));
        let shutdown = CancellationToken::new();
        let handle = engine.clone().start(&bus, shutdown.clone());

        bus.publish(DomainEvent::SessionOpened {
            session_id: "s1".into(),
            user_ref: "driver".into(),
            timestamp: Utc::now(),
        });
        bus.publish(transition("t1", TurnState::Succeeded, 10));

        for _ in 0..50 {
            if engine.summary().turns_succeeded == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let summary = engine.summary();
        assert_eq!(summary.sessions_opened, 1);
        assert_eq!(summary.turns_succeeded, 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
