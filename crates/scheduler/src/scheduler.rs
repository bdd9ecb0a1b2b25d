//! The turn scheduler.
//!
//! All bookkeeping lives in one `SchedState` behind a std `Mutex` that is
//! never held across an `.await`. Stage invocations run as their own tasks and
//! report back through `complete_stage`; a result whose dispatch generation no
//! longer matches the turn is ignored.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drivetalk_allocator::{ResourceAllocator, SlotDecision};
use drivetalk_config::{ProactiveRule, SchedulerConfig};
use drivetalk_core::{
    ContextSnapshot, DomainEvent, Error, EventBus, HistoryEntry, PipelineStage, Priority,
    QualityTier, ScheduleError, SessionId, StageError, StageInput, StageKind, StageOutput,
    StageRequest, Turn, TurnId, TurnInput, TurnState,
};
use drivetalk_fusion::ContextStore;

use crate::invoke::{ChunkSink, Deadline, run_stage};
use crate::output::TurnOutput;
use crate::proactive::ProactiveMonitor;
use crate::ready::{ReadyEntry, ReadyQueue};

/// Terminal states kept for `turn_state` lookups.
const FINISHED_RETENTION: usize = 1024;

struct TurnEntry {
    turn: Turn,
    state: TurnState,
    seq: u64,
    token: u64,
    started: Instant,
    soft_expired: bool,
    cancel: CancellationToken,
    generation: u64,
    context: watch::Receiver<Arc<ContextSnapshot>>,
    snapshot: Arc<ContextSnapshot>,
}

impl TurnEntry {
    fn soft_deadline(&self) -> Instant {
        self.started + Duration::from_millis(self.turn.budget_ms)
    }

    fn deadline(&self) -> Deadline {
        Deadline {
            started: self.started,
            ceiling: Duration::from_millis(self.turn.hard_ceiling_ms()),
        }
    }
}

#[derive(Default)]
struct SessionQueue {
    /// Non-terminal turns in submission order; the front is the head.
    pending: VecDeque<TurnId>,
    in_flight: Option<TurnId>,
}

#[derive(Default)]
struct SchedState {
    ready: ReadyQueue,
    turns: HashMap<TurnId, TurnEntry>,
    sessions: HashMap<SessionId, SessionQueue>,
    finished: HashMap<TurnId, TurnState>,
    finished_order: VecDeque<TurnId>,
    next_seq: u64,
}

impl SchedState {
    fn push_ready(&mut self, id: &TurnId) {
        let token = self.ready.token();
        if let Some(entry) = self.turns.get_mut(id) {
            entry.token = token;
            self.ready.push(ReadyEntry {
                priority: entry.turn.priority,
                submitted_at: entry.turn.submitted_at,
                session_id: entry.turn.session_id.clone(),
                seq: entry.seq,
                turn_id: id.clone(),
                token,
            });
        }
    }

    fn retire(&mut self, id: TurnId, state: TurnState) {
        self.finished.insert(id.clone(), state);
        self.finished_order.push_back(id);
        while self.finished_order.len() > FINISHED_RETENTION {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
    }

    fn queued(&self) -> usize {
        self.turns
            .values()
            .filter(|e| matches!(e.state, TurnState::Queued { .. }))
            .count()
    }
}

struct DispatchJob {
    turn_id: TurnId,
    session_id: SessionId,
    generation: u64,
    stage: StageKind,
    tier: QualityTier,
    request: StageRequest,
    cancel: CancellationToken,
    deadline: Deadline,
}

struct FallbackJob {
    turn_id: TurnId,
    session_id: SessionId,
    reason: String,
}

struct Inner {
    config: SchedulerConfig,
    store: Arc<ContextStore>,
    allocator: Arc<ResourceAllocator>,
    stages: HashMap<StageKind, Arc<dyn PipelineStage>>,
    events: Arc<EventBus>,
    idle_timeout: Option<Duration>,
    proactive: ProactiveMonitor,
    state: Mutex<SchedState>,
    wake: Notify,
    outputs: mpsc::Sender<TurnOutput>,
    outputs_rx: Mutex<Option<mpsc::Receiver<TurnOutput>>>,
}

/// Builds a [`TurnScheduler`] with its stage adapters.
pub struct TurnSchedulerBuilder {
    config: SchedulerConfig,
    store: Arc<ContextStore>,
    allocator: Arc<ResourceAllocator>,
    stages: HashMap<StageKind, Arc<dyn PipelineStage>>,
    idle_timeout: Option<Duration>,
    proactive: Vec<ProactiveRule>,
}

impl TurnSchedulerBuilder {
    /// Register the adapter for `stage.kind()`, replacing any earlier one.
    pub fn stage(mut self, stage: Arc<dyn PipelineStage>) -> Self {
        self.stages.insert(stage.kind(), stage);
        self
    }

    /// Close sessions idle for this long (checked on every tick).
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Queue a text turn whenever a context change makes one of `rules` hold.
    pub fn proactive_rules(mut self, rules: Vec<ProactiveRule>) -> Self {
        self.proactive = rules;
        self
    }

    pub fn build(self) -> TurnScheduler {
        let (outputs, outputs_rx) = mpsc::channel(self.config.output_buffer.max(1));
        let events = self.store.events().clone();
        TurnScheduler {
            inner: Arc::new(Inner {
                config: self.config,
                store: self.store,
                allocator: self.allocator,
                stages: self.stages,
                events,
                idle_timeout: self.idle_timeout,
                proactive: ProactiveMonitor::new(self.proactive),
                state: Mutex::new(SchedState::default()),
                wake: Notify::new(),
                outputs,
                outputs_rx: Mutex::new(Some(outputs_rx)),
            }),
        }
    }
}

/// Session lifecycle API and dispatch loop. Cheap to clone.
#[derive(Clone)]
pub struct TurnScheduler {
    inner: Arc<Inner>,
}

impl TurnScheduler {
    pub fn builder(
        config: SchedulerConfig,
        store: Arc<ContextStore>,
        allocator: Arc<ResourceAllocator>,
    ) -> TurnSchedulerBuilder {
        TurnSchedulerBuilder {
            config,
            store,
            allocator,
            stages: HashMap::new(),
            idle_timeout: None,
            proactive: Vec::new(),
        }
    }

    /// Start the dispatch loop.
    ///
    /// Returns the receiver for turn outputs and the loop's join handle. The
    /// loop runs until `shutdown` is cancelled; in-flight turns are cancelled
    /// on the way out.
    pub fn start(
        &self,
        shutdown: CancellationToken,
    ) -> drivetalk_core::Result<(mpsc::Receiver<TurnOutput>, JoinHandle<()>)> {
        let rx = self
            .inner
            .outputs_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Internal("turn scheduler already started".into()))?;

        let context = self.inner.events.subscribe();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run(shutdown, context).await });
        Ok((rx, handle))
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.inner.store
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.inner.allocator
    }

    pub fn open_session(&self, user_ref: impl Into<String>) -> SessionId {
        self.inner.store.open(user_ref)
    }

    /// Queue a turn. An `Utterance` barges in: it cancels the session's
    /// active turn and every older pending utterance.
    pub fn submit_turn(
        &self,
        session_id: &SessionId,
        input: TurnInput,
        priority: Priority,
    ) -> Result<TurnId, ScheduleError> {
        self.inner.submit(session_id, input, priority)
    }

    /// Submit a finalized transcript.
    ///
    /// Below `min_confidence` no turn is created; a reprompt is emitted
    /// instead and `None` is returned.
    pub async fn submit_utterance(
        &self,
        session_id: &SessionId,
        text: &str,
        confidence: f32,
    ) -> Result<Option<TurnId>, ScheduleError> {
        let inner = &self.inner;
        if !inner.store.contains(session_id) {
            return Err(ScheduleError::SessionNotFound(session_id.to_string()));
        }

        if text.trim().is_empty() || confidence < inner.config.min_confidence {
            info!(
                session_id = %session_id,
                confidence,
                min_confidence = inner.config.min_confidence,
                "Utterance below confidence threshold, reprompting"
            );
            inner.store.touch(session_id);
            let reprompt = TurnOutput::Reprompt {
                session_id: session_id.clone(),
                text: inner.config.reprompt_text.clone(),
                confidence,
            };
            if inner.outputs.send(reprompt).await.is_err() {
                debug!("Output receiver dropped");
            }
            return Ok(None);
        }

        inner
            .submit(
                session_id,
                TurnInput::utterance(text, confidence),
                Priority::High,
            )
            .map(Some)
    }

    /// Cancel a turn. Cancelling a finished turn is a no-op.
    pub fn cancel_turn(&self, turn_id: &TurnId) -> Result<(), ScheduleError> {
        let inner = &self.inner;
        {
            let mut guard = inner.lock();
            let st = &mut *guard;
            if st.turns.contains_key(turn_id) {
                inner.cancel_locked(st, turn_id);
            } else if !st.finished.contains_key(turn_id) {
                return Err(ScheduleError::TurnNotFound(turn_id.to_string()));
            }
        }
        inner.wake.notify_one();
        Ok(())
    }

    /// Cancel every turn of the session and drop its context.
    pub fn close_session(&self, session_id: &SessionId) -> Result<(), ScheduleError> {
        self.inner.close_session(session_id, "closed")
    }

    pub fn turn_state(&self, turn_id: &TurnId) -> Option<TurnState> {
        let st = self.inner.lock();
        st.turns
            .get(turn_id)
            .map(|e| e.state.clone())
            .or_else(|| st.finished.get(turn_id).cloned())
    }

    /// Dispatched turns per session. Never more than one.
    pub fn audit(&self) -> BTreeMap<SessionId, usize> {
        let st = self.inner.lock();
        let mut counts = BTreeMap::new();
        for entry in st.turns.values().filter(|e| e.state.is_dispatched()) {
            *counts.entry(entry.turn.session_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Turns waiting for dispatch.
    pub fn queue_depth(&self) -> usize {
        self.inner.lock().queued()
    }

    /// Query every stage adapter concurrently.
    pub async fn health_check(&self) -> BTreeMap<StageKind, bool> {
        let checks = self.inner.stages.iter().map(|(kind, stage)| async move {
            let healthy = match stage.health_check().await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!(stage = %kind, error = %e, "Stage health check failed");
                    false
                }
            };
            (*kind, healthy)
        });
        futures::future::join_all(checks).await.into_iter().collect()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_state(&self, entry: &TurnEntry) {
        self.events.publish(DomainEvent::TurnStateChanged {
            turn_id: entry.turn.id.to_string(),
            session_id: entry.turn.session_id.to_string(),
            priority: entry.turn.priority,
            state: entry.state.clone(),
            timestamp: Utc::now(),
        });
    }

    async fn run(
        self: Arc<Self>,
        shutdown: CancellationToken,
        mut context: broadcast::Receiver<Arc<DomainEvent>>,
    ) {
        let released = self.allocator.slot_released();
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            stages = self.stages.len(),
            tick_ms = self.config.tick_interval_ms,
            proactive = !self.proactive.is_empty(),
            "Turn scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = released.notified() => {}
                _ = tick.tick() => self.housekeeping(),
                received = context.recv() => {
                    if !self.on_bus_event(received) {
                        continue;
                    }
                }
            }
            self.dispatch_ready();
        }

        let st = self.lock();
        for entry in st.turns.values() {
            entry.cancel.cancel();
        }
        info!(pending = st.turns.len(), "Turn scheduler stopped");
    }

    /// Returns true when the event queued new work.
    fn on_bus_event(&self, received: Result<Arc<DomainEvent>, broadcast::error::RecvError>) -> bool {
        match received {
            Ok(event) => match event.as_ref() {
                DomainEvent::ContextUpdated {
                    session_id, fields, ..
                } => self.raise_proactive(&SessionId::from(session_id.as_str()), fields),
                _ => false,
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Scheduler lagged behind the event bus, context updates lost");
                false
            }
            Err(broadcast::error::RecvError::Closed) => false,
        }
    }

    fn raise_proactive(&self, session_id: &SessionId, changed: &[String]) -> bool {
        if self.proactive.is_empty() {
            return false;
        }
        let Some(snapshot) = self.store.snapshot(session_id) else {
            return false;
        };

        let mut queued = false;
        for rule in self.proactive.evaluate(session_id, &snapshot, changed) {
            match self.submit(session_id, TurnInput::text(rule.prompt.as_str()), rule.priority) {
                Ok(turn_id) => {
                    info!(
                        turn_id = %turn_id,
                        session_id = %session_id,
                        rule = %rule.name,
                        field = %rule.field,
                        "Proactive turn queued"
                    );
                    self.events.publish(DomainEvent::ProactiveTriggered {
                        turn_id: turn_id.to_string(),
                        session_id: session_id.to_string(),
                        rule: rule.name.clone(),
                        timestamp: Utc::now(),
                    });
                    queued = true;
                }
                Err(e) => warn!(session_id = %session_id, rule = %rule.name, error = %e, "Proactive turn rejected"),
            }
        }
        queued
    }

    fn submit(
        &self,
        session_id: &SessionId,
        input: TurnInput,
        priority: Priority,
    ) -> Result<TurnId, ScheduleError> {
        let mut context = self
            .store
            .subscribe(session_id)
            .ok_or_else(|| ScheduleError::SessionNotFound(session_id.to_string()))?;
        self.store.touch(session_id);

        let budget_ms = self.config.latency_budgets.for_priority(priority);
        let turn = Turn::new(session_id.clone(), input, priority, budget_ms);
        let turn_id = turn.id.clone();
        let supersedes = turn.input.supersedes();

        {
            let mut guard = self.lock();
            let st = &mut *guard;

            if supersedes {
                let older: Vec<TurnId> = st
                    .sessions
                    .get(session_id)
                    .map(|q| q.pending.iter().cloned().collect())
                    .unwrap_or_default();
                for old in older {
                    let barge = st.turns.get(&old).is_some_and(|e| {
                        e.state.is_dispatched()
                            || e.turn.input.supersedes()
                            || !e.turn.outputs.is_empty()
                    });
                    if barge {
                        info!(
                            session_id = %session_id,
                            superseded = %old,
                            by = %turn_id,
                            "Barge-in, cancelling earlier turn"
                        );
                        self.cancel_locked(st, &old);
                    }
                }
            }

            let snapshot = context.borrow_and_update().clone();
            let seq = st.next_seq;
            st.next_seq += 1;

            let entry = TurnEntry {
                turn,
                state: TurnState::Queued {
                    stage: StageKind::Understanding,
                },
                seq,
                token: 0,
                started: Instant::now(),
                soft_expired: false,
                cancel: CancellationToken::new(),
                generation: 0,
                context,
                snapshot,
            };
            self.publish_state(&entry);
            st.turns.insert(turn_id.clone(), entry);

            let queue = st.sessions.entry(session_id.clone()).or_default();
            queue.pending.push_back(turn_id.clone());
            if queue.pending.len() == 1 {
                st.push_ready(&turn_id);
            }
        }

        info!(
            turn_id = %turn_id,
            session_id = %session_id,
            priority = %priority,
            budget_ms,
            "Turn submitted"
        );
        self.wake.notify_one();
        Ok(turn_id)
    }

    /// Cancel a live turn. Dispatched turns are signalled and finish when the
    /// stage acknowledges (or the grace period runs out); queued turns finish
    /// immediately.
    fn cancel_locked(&self, st: &mut SchedState, turn_id: &TurnId) {
        let dispatched = match st.turns.get_mut(turn_id) {
            Some(entry) if entry.state.is_dispatched() => {
                if !entry.turn.cancelled {
                    entry.turn.cancelled = true;
                    entry.cancel.cancel();
                    debug!(turn_id = %turn_id, "Cancellation signalled to in-flight stage");
                }
                true
            }
            Some(_) => false,
            None => return,
        };
        if !dispatched {
            self.finish_turn(st, turn_id, TurnState::Cancelled);
        }
    }

    /// Move a turn to a terminal state and promote the session's next head.
    fn finish_turn(&self, st: &mut SchedState, turn_id: &TurnId, state: TurnState) {
        let Some(mut entry) = st.turns.remove(turn_id) else {
            return;
        };
        entry.state = state.clone();
        entry.cancel.cancel();

        let next_head = st.sessions.get_mut(&entry.turn.session_id).and_then(|queue| {
            queue.pending.retain(|id| id != turn_id);
            if queue.in_flight.as_ref() == Some(turn_id) {
                queue.in_flight = None;
            }
            queue.pending.front().cloned()
        });
        if let Some(head) = next_head {
            let waiting = st
                .turns
                .get(&head)
                .is_some_and(|e| matches!(e.state, TurnState::Queued { .. }));
            if waiting {
                st.push_ready(&head);
            }
        }

        info!(
            turn_id = %turn_id,
            session_id = %entry.turn.session_id,
            state = state.label(),
            elapsed_ms = entry.started.elapsed().as_millis() as u64,
            "Turn finished"
        );
        self.publish_state(&entry);
        st.retire(turn_id.clone(), state);
    }

    fn fail_locked(&self, st: &mut SchedState, turn_id: &TurnId, reason: String) -> FallbackJob {
        let session_id = st
            .turns
            .get(turn_id)
            .map(|e| e.turn.session_id.clone())
            .unwrap_or_else(|| SessionId::from(""));
        warn!(turn_id = %turn_id, session_id = %session_id, reason = %reason, "Turn failed");
        self.finish_turn(
            st,
            turn_id,
            TurnState::Failed {
                reason: reason.clone(),
            },
        );
        FallbackJob {
            turn_id: turn_id.clone(),
            session_id,
            reason,
        }
    }

    /// Dispatch every eligible head that can get a slot.
    fn dispatch_ready(self: &Arc<Self>) {
        let mut jobs = Vec::new();
        let mut fallbacks = Vec::new();
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            let now = Instant::now();
            let mut deferred = Vec::new();

            while let Some(ready) = st.ready.pop() {
                let Some(entry) = st.turns.get(&ready.turn_id) else {
                    continue;
                };
                if entry.token != ready.token {
                    continue;
                }
                let TurnState::Queued { stage } = entry.state else {
                    continue;
                };
                let deadline = entry.deadline();

                let is_head = st.sessions.get(&ready.session_id).is_some_and(|q| {
                    q.in_flight.is_none() && q.pending.front() == Some(&ready.turn_id)
                });
                if !is_head {
                    continue;
                }

                if now >= deadline.at() {
                    let reason = deadline.exceeded().to_string();
                    fallbacks.push(self.fail_locked(st, &ready.turn_id, reason));
                    continue;
                }

                match self.allocator.request_slot(stage) {
                    SlotDecision::Denied => {
                        debug!(turn_id = %ready.turn_id, stage = %stage, "No slot, re-queued");
                        deferred.push(ready);
                    }
                    SlotDecision::Granted { tier } => {
                        match self.prepare_dispatch(st, &ready.turn_id, stage, tier) {
                            Some(job) => jobs.push(job),
                            None => self.allocator.release_slot(stage),
                        }
                    }
                }
            }

            for ready in deferred {
                st.ready.push(ready);
            }
        }

        for job in jobs {
            self.spawn_stage(job);
        }
        for job in fallbacks {
            self.spawn_fallback(job);
        }
    }

    fn prepare_dispatch(
        &self,
        st: &mut SchedState,
        turn_id: &TurnId,
        stage: StageKind,
        granted: QualityTier,
    ) -> Option<DispatchJob> {
        let entry = st.turns.get_mut(turn_id)?;
        let session_id = entry.turn.session_id.clone();

        if matches!(entry.context.has_changed(), Ok(true)) {
            entry.snapshot = entry.context.borrow_and_update().clone();
            debug!(
                turn_id = %turn_id,
                version = entry.snapshot.version,
                "Context changed since last stage, refreshed"
            );
            self.events.publish(DomainEvent::ContextRefreshed {
                turn_id: turn_id.to_string(),
                session_id: session_id.to_string(),
                version: entry.snapshot.version,
                timestamp: Utc::now(),
            });
        }

        let tier = if entry.turn.degraded {
            granted.downgrade()
        } else {
            granted
        };
        let budget = self.config.tiers.for_tier(tier);
        let input = StageInput {
            text: entry.turn.input.as_text().to_string(),
            understanding: entry.turn.output(StageKind::Understanding).cloned(),
            response: entry.turn.output(StageKind::Generation).cloned(),
            history: self.store.history(&session_id, budget.context_turns),
            fallback: false,
        };

        entry.generation += 1;
        entry.state = TurnState::Dispatched { stage };
        let request = StageRequest {
            turn_id: turn_id.clone(),
            session_id: session_id.clone(),
            stage,
            snapshot: entry.snapshot.clone(),
            input,
            tier,
            budget,
        };
        let job = DispatchJob {
            turn_id: turn_id.clone(),
            session_id: session_id.clone(),
            generation: entry.generation,
            stage,
            tier,
            request,
            cancel: entry.cancel.child_token(),
            deadline: entry.deadline(),
        };
        self.publish_state(entry);

        if let Some(queue) = st.sessions.get_mut(&session_id) {
            queue.in_flight = Some(turn_id.clone());
        }
        debug!(turn_id = %turn_id, stage = %stage, tier = %tier, "Stage dispatched");
        Some(job)
    }

    fn spawn_stage(self: &Arc<Self>, job: DispatchJob) {
        let inner = self.clone();
        tokio::spawn(async move {
            let DispatchJob {
                turn_id,
                session_id,
                generation,
                stage,
                tier,
                request,
                cancel,
                deadline,
            } = job;
            let grace = Duration::from_millis(inner.config.cancel_grace_ms);
            let sink = ChunkSink {
                tx: inner.outputs.clone(),
                turn_id: turn_id.clone(),
                session_id: session_id.clone(),
            };

            let started = Instant::now();
            let result = match inner.stages.get(&stage).cloned() {
                Some(adapter) => {
                    run_stage(adapter, request, cancel, deadline, grace, Some(&sink)).await
                }
                None => Err(StageError::Unavailable(format!("no {stage} stage registered"))),
            };
            let elapsed = started.elapsed();

            inner
                .complete_stage(turn_id, session_id, generation, stage, tier, result, elapsed)
                .await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete_stage(
        self: &Arc<Self>,
        turn_id: TurnId,
        session_id: SessionId,
        generation: u64,
        stage: StageKind,
        tier: QualityTier,
        result: Result<StageOutput, StageError>,
        elapsed: Duration,
    ) {
        if !matches!(result, Err(StageError::Cancelled)) {
            self.allocator.record_latency(stage, elapsed);
        }
        self.events.publish(DomainEvent::StageCompleted {
            turn_id: turn_id.to_string(),
            session_id: session_id.to_string(),
            stage,
            tier,
            duration_ms: elapsed.as_millis() as u64,
            success: result.is_ok(),
            timestamp: Utc::now(),
        });

        let (output, fallback) = {
            let mut guard = self.lock();
            self.apply_stage_result(&mut guard, &turn_id, generation, stage, tier, result)
        };
        self.allocator.release_slot(stage);

        if let Some(output) = output {
            if self.outputs.send(output).await.is_err() {
                debug!("Output receiver dropped");
            }
        }
        if let Some(job) = fallback {
            self.spawn_fallback(job);
        }
        self.wake.notify_one();
    }

    fn apply_stage_result(
        &self,
        st: &mut SchedState,
        turn_id: &TurnId,
        generation: u64,
        stage: StageKind,
        tier: QualityTier,
        result: Result<StageOutput, StageError>,
    ) -> (Option<TurnOutput>, Option<FallbackJob>) {
        let Some(entry) = st.turns.get_mut(turn_id) else {
            return (None, None);
        };
        if entry.generation != generation || !entry.state.is_dispatched() {
            debug!(turn_id = %turn_id, stage = %stage, "Discarding stale stage result");
            return (None, None);
        }
        let session_id = entry.turn.session_id.clone();
        if let Some(queue) = st.sessions.get_mut(&session_id) {
            if queue.in_flight.as_ref() == Some(turn_id) {
                queue.in_flight = None;
            }
        }

        let Some(entry) = st.turns.get_mut(turn_id) else {
            return (None, None);
        };
        match result {
            Ok(output) if !entry.turn.cancelled => {
                entry.turn.outputs.push(output);
                match stage.next() {
                    Some(next) => {
                        entry.turn.stage = next;
                        entry.state = TurnState::Queued { stage: next };
                        self.publish_state(entry);
                        st.push_ready(turn_id);
                        (None, None)
                    }
                    None => {
                        let content = |kind| {
                            entry
                                .turn
                                .output(kind)
                                .map(|o| o.content.clone())
                                .unwrap_or_default()
                        };
                        let response = content(StageKind::Generation);
                        let audio = content(StageKind::Synthesis);
                        self.store.push_history(
                            &session_id,
                            HistoryEntry {
                                turn_id: turn_id.clone(),
                                user_text: entry.turn.input.as_text().to_string(),
                                response_text: response.clone(),
                                completed_at: Utc::now(),
                            },
                        );
                        self.finish_turn(st, turn_id, TurnState::Succeeded);
                        let output = TurnOutput::Completed {
                            turn_id: turn_id.clone(),
                            session_id,
                            response,
                            audio,
                            tier,
                        };
                        (Some(output), None)
                    }
                }
            }
            Ok(_) => {
                self.finish_turn(st, turn_id, TurnState::Cancelled);
                (None, None)
            }
            Err(_) if entry.turn.cancelled || entry.cancel.is_cancelled() => {
                self.finish_turn(st, turn_id, TurnState::Cancelled);
                (None, None)
            }
            // A stage reporting `Cancelled` on its own is a stage failure.
            Err(e) => {
                let job = self.fail_locked(st, turn_id, e.to_string());
                (None, Some(job))
            }
        }
    }

    /// Soft/hard deadline checks, tier sampling and idle reaping.
    fn housekeeping(self: &Arc<Self>) {
        let now = Instant::now();
        let mut fallbacks = Vec::new();
        let (depth, busy) = {
            let mut guard = self.lock();
            let st = &mut *guard;

            let mut expired = Vec::new();
            for (id, entry) in st.turns.iter_mut() {
                if !entry.soft_expired && now >= entry.soft_deadline() {
                    entry.soft_expired = true;
                    entry.turn.degraded = true;
                    warn!(
                        turn_id = %id,
                        budget_ms = entry.turn.budget_ms,
                        state = entry.state.label(),
                        "Soft deadline missed, degrading remaining stages"
                    );
                }
                if matches!(entry.state, TurnState::Queued { .. }) && now >= entry.deadline().at()
                {
                    expired.push((id.clone(), entry.deadline().exceeded().to_string()));
                }
            }
            for (id, reason) in expired {
                fallbacks.push(self.fail_locked(st, &id, reason));
            }

            let busy: HashSet<SessionId> = st
                .sessions
                .iter()
                .filter(|(_, q)| !q.pending.is_empty())
                .map(|(id, _)| id.clone())
                .collect();
            (st.queued(), busy)
        };

        self.allocator.sample(depth);
        for job in fallbacks {
            self.spawn_fallback(job);
        }

        if let Some(idle) = self.idle_timeout {
            for session_id in self.store.idle_sessions(idle) {
                if busy.contains(&session_id) {
                    continue;
                }
                info!(session_id = %session_id, idle_secs = idle.as_secs(), "Closing idle session");
                let _ = self.close_session(&session_id, "idle");
            }
        }
    }

    fn close_session(&self, session_id: &SessionId, reason: &str) -> Result<(), ScheduleError> {
        if !self.store.contains(session_id) {
            return Err(ScheduleError::SessionNotFound(session_id.to_string()));
        }
        {
            let mut guard = self.lock();
            let st = &mut *guard;
            if let Some(queue) = st.sessions.remove(session_id) {
                for turn_id in queue.pending {
                    self.cancel_locked(st, &turn_id);
                }
            }
        }
        self.proactive.forget(session_id);
        self.store.close(session_id, reason);
        self.wake.notify_one();
        Ok(())
    }

    /// Best-effort apology synthesis for a failed turn.
    fn spawn_fallback(self: &Arc<Self>, job: FallbackJob) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.events.publish(DomainEvent::FallbackIssued {
                turn_id: job.turn_id.to_string(),
                session_id: job.session_id.to_string(),
                reason: job.reason.clone(),
                timestamp: Utc::now(),
            });

            let text = inner.config.fallback_text.clone();
            let audio = inner.synthesize_fallback(&job, &text).await;
            let output = TurnOutput::Fallback {
                turn_id: job.turn_id,
                session_id: job.session_id,
                reason: job.reason,
                text,
                audio,
            };
            if inner.outputs.send(output).await.is_err() {
                debug!("Output receiver dropped");
            }
        });
    }

    async fn synthesize_fallback(&self, job: &FallbackJob, text: &str) -> Option<String> {
        let adapter = self.stages.get(&StageKind::Synthesis)?.clone();
        let budget = self.config.tiers.for_tier(QualityTier::Minimal);
        let request = StageRequest {
            turn_id: job.turn_id.clone(),
            session_id: job.session_id.clone(),
            stage: StageKind::Synthesis,
            snapshot: self.store.snapshot(&job.session_id).unwrap_or_default(),
            input: StageInput {
                text: text.to_string(),
                fallback: true,
                ..StageInput::default()
            },
            tier: QualityTier::Minimal,
            budget,
        };
        let deadline = Deadline {
            started: Instant::now(),
            ceiling: Duration::from_millis(self.config.fallback_timeout_ms),
        };
        let grace = Duration::from_millis(self.config.cancel_grace_ms);

        match run_stage(adapter, request, CancellationToken::new(), deadline, grace, None).await {
            Ok(output) => Some(output.content),
            Err(e) => {
                warn!(turn_id = %job.turn_id, error = %e, "Fallback synthesis failed");
                None
            }
        }
    }
}
