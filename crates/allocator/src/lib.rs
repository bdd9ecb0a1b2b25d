//! # DriveTalk Resource Allocator
//!
//! Concurrency slots and quality tiers per pipeline stage.
//!
//! `request_slot` never blocks: it either grants a slot at the stage's
//! current tier or denies, and the scheduler re-queues. Tiers move one step at
//! a time under hysteresis. A stage needs `downgrade_after` consecutive
//! breaching samples to drop a tier and `upgrade_after` consecutive healthy
//! samples to regain one, so load hovering around the threshold cannot make
//! the tier flap.
//!
//! The latency average only counts as evidence when at least one new latency
//! arrived since the previous evaluation. A window that has not moved between
//! housekeeping ticks neither extends nor resets a streak, and a latency
//! breach also needs the newest latency above the threshold, so one slow
//! invocation is a single breaching sample however long it stays in the
//! window. An idle stage (no new samples, nothing in flight, short queue)
//! counts as healthy.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use drivetalk_config::AllocatorConfig;
use drivetalk_core::{DomainEvent, EventBus, QualityTier, StageKind};

/// Outcome of a slot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    Granted { tier: QualityTier },
    Denied,
}

/// Point-in-time view of one stage, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct StageStats {
    pub stage: StageKind,
    pub tier: QualityTier,
    pub in_use: u32,
    pub max_concurrency: u32,
    pub samples: usize,
    pub mean_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub latest_ms: u64,
}

struct StageState {
    max: u32,
    in_use: u32,
    tier: QualityTier,
    window: VecDeque<Duration>,
    /// Latencies recorded since the last evaluation.
    fresh: usize,
    breach_streak: u32,
    healthy_streak: u32,
}

impl StageState {
    fn average(&self) -> Duration {
        if self.window.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.window.iter().sum();
        total / self.window.len() as u32
    }
}

pub struct ResourceAllocator {
    config: AllocatorConfig,
    stages: HashMap<StageKind, Mutex<StageState>>,
    released: Arc<Notify>,
    events: Arc<EventBus>,
}

impl ResourceAllocator {
    pub fn new(config: AllocatorConfig, events: Arc<EventBus>) -> Self {
        let stages = StageKind::PIPELINE
            .into_iter()
            .map(|stage| {
                let state = StageState {
                    max: config.stages.for_stage(stage),
                    in_use: 0,
                    tier: QualityTier::Normal,
                    window: VecDeque::with_capacity(config.window_size),
                    fresh: 0,
                    breach_streak: 0,
                    healthy_streak: 0,
                };
                (stage, Mutex::new(state))
            })
            .collect();

        Self {
            config,
            stages,
            released: Arc::new(Notify::new()),
            events,
        }
    }

    fn state(&self, stage: StageKind) -> Option<MutexGuard<'_, StageState>> {
        self.stages
            .get(&stage)
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Grant a slot at the current tier, or deny when the stage is saturated.
    pub fn request_slot(&self, stage: StageKind) -> SlotDecision {
        let Some(mut state) = self.state(stage) else {
            return SlotDecision::Denied;
        };
        if state.in_use >= state.max {
            debug!(stage = %stage, in_use = state.in_use, "Slot denied");
            return SlotDecision::Denied;
        }
        state.in_use += 1;
        SlotDecision::Granted { tier: state.tier }
    }

    /// Return a slot. Wakes one waiter on [`slot_released`](Self::slot_released).
    pub fn release_slot(&self, stage: StageKind) {
        if let Some(mut state) = self.state(stage) {
            if state.in_use == 0 {
                warn!(stage = %stage, "Released a slot that was not held");
            }
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.released.notify_one();
    }

    /// Notified whenever a slot is released.
    pub fn slot_released(&self) -> Arc<Notify> {
        self.released.clone()
    }

    pub fn tier(&self, stage: StageKind) -> QualityTier {
        self.state(stage).map(|s| s.tier).unwrap_or_default()
    }

    pub fn in_use(&self, stage: StageKind) -> u32 {
        self.state(stage).map(|s| s.in_use).unwrap_or(0)
    }

    /// Add one completed invocation's latency to the stage window.
    pub fn record_latency(&self, stage: StageKind, latency: Duration) {
        let window_size = self.config.window_size.max(1);
        if let Some(mut state) = self.state(stage) {
            if state.window.len() >= window_size {
                state.window.pop_front();
            }
            state.window.push_back(latency);
            state.fresh += 1;
        }
    }

    /// Evaluate the tier policy once for every stage.
    pub fn sample(&self, queue_depth: usize) {
        for stage in StageKind::PIPELINE {
            self.sample_stage(stage, queue_depth);
        }
    }

    fn sample_stage(&self, stage: StageKind, queue_depth: usize) {
        let threshold = Duration::from_millis(self.config.latency_threshold_ms);
        let Some(mut state) = self.state(stage) else {
            return;
        };

        let average = state.average();
        let depth_bound = self.config.queue_capacity_multiple * f64::from(state.max);
        let depth = queue_depth as f64;
        let comfort = self.config.comfort_ratio;

        let fresh = std::mem::take(&mut state.fresh) > 0;
        let depth_breach = depth > depth_bound;
        let depth_healthy = depth < comfort * depth_bound;

        let latest = state.window.back().copied().unwrap_or_default();
        let breach = depth_breach || (fresh && average > threshold && latest > threshold);
        let healthy = depth_healthy
            && if fresh {
                average.as_secs_f64() < comfort * threshold.as_secs_f64()
            } else {
                state.in_use == 0
            };

        let from = state.tier;
        if !fresh && !breach && !healthy {
            // Nothing new to judge.
            return;
        }
        if breach {
            state.healthy_streak = 0;
            state.breach_streak += 1;
            if state.breach_streak >= self.config.downgrade_after {
                state.breach_streak = 0;
                state.tier = from.downgrade();
            }
        } else if healthy {
            state.breach_streak = 0;
            state.healthy_streak += 1;
            if state.healthy_streak >= self.config.upgrade_after {
                state.healthy_streak = 0;
                state.tier = from.upgrade();
            }
        } else {
            state.breach_streak = 0;
            state.healthy_streak = 0;
        }

        let to = state.tier;
        if to == from {
            return;
        }
        // Judge the new tier on its own latencies.
        state.window.clear();
        state.fresh = 0;
        drop(state);

        let avg_latency_ms = average.as_millis() as u64;
        info!(
            stage = %stage,
            from = %from,
            to = %to,
            avg_latency_ms,
            queue_depth,
            "Quality tier changed"
        );
        self.events.publish(DomainEvent::TierChanged {
            stage,
            from,
            to,
            avg_latency_ms,
            queue_depth,
            timestamp: Utc::now(),
        });
    }

    pub fn stats(&self) -> Vec<StageStats> {
        StageKind::PIPELINE
            .into_iter()
            .filter_map(|stage| {
                let state = self.state(stage)?;
                let millis: Vec<u64> = state.window.iter().map(|d| d.as_millis() as u64).collect();
                let mean_ms = if millis.is_empty() {
                    0.0
                } else {
                    millis.iter().sum::<u64>() as f64 / millis.len() as f64
                };
                Some(StageStats {
                    stage,
                    tier: state.tier,
                    in_use: state.in_use,
                    max_concurrency: state.max,
                    samples: millis.len(),
                    mean_ms,
                    min_ms: millis.iter().copied().min().unwrap_or(0),
                    max_ms: millis.iter().copied().max().unwrap_or(0),
                    latest_ms: millis.last().copied().unwrap_or(0),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivetalk_config::StageLimits;

    fn allocator(limit: u32) -> ResourceAllocator {
        let config = AllocatorConfig {
            window_size: 4,
            latency_threshold_ms: 1000,
            downgrade_after: 3,
            upgrade_after: 5,
            stages: StageLimits::uniform(limit),
            ..AllocatorConfig::default()
        };
        ResourceAllocator::new(config, Arc::new(EventBus::default()))
    }

    fn feed(alloc: &ResourceAllocator, stage: StageKind, ms: u64, samples: usize) {
        for _ in 0..samples {
            alloc.record_latency(stage, Duration::from_millis(ms));
        }
    }

    #[test]
    fn slots_are_bounded_and_released() {
        let alloc = allocator(2);
        let stage = StageKind::Generation;
        assert!(matches!(alloc.request_slot(stage), SlotDecision::Granted { .. }));
        assert!(matches!(alloc.request_slot(stage), SlotDecision::Granted { .. }));
        assert_eq!(alloc.request_slot(stage), SlotDecision::Denied);
        // Other stages are independent.
        assert!(matches!(
            alloc.request_slot(StageKind::Synthesis),
            SlotDecision::Granted { .. }
        ));

        alloc.release_slot(stage);
        assert_eq!(alloc.in_use(stage), 1);
        assert!(matches!(alloc.request_slot(stage), SlotDecision::Granted { .. }));
    }

    #[test]
    fn spurious_release_saturates() {
        let alloc = allocator(1);
        alloc.release_slot(StageKind::Understanding);
        assert_eq!(alloc.in_use(StageKind::Understanding), 0);
    }

    /// One evaluation per new latency, like a tick after each completion.
    fn tick(alloc: &ResourceAllocator, stage: StageKind, ms: u64) {
        alloc.record_latency(stage, Duration::from_millis(ms));
        alloc.sample(0);
    }

    #[test]
    fn sustained_latency_downgrades_one_tier_at_a_time() {
        let alloc = allocator(4);
        let stage = StageKind::Generation;

        tick(&alloc, stage, 1500);
        tick(&alloc, stage, 1500);
        assert_eq!(alloc.tier(stage), QualityTier::Normal);
        tick(&alloc, stage, 1500);
        assert_eq!(alloc.tier(stage), QualityTier::Degraded);
        // The window was cleared by the tier change.
        assert_eq!(alloc.stats()[1].samples, 0);

        for _ in 0..3 {
            tick(&alloc, stage, 1500);
        }
        assert_eq!(alloc.tier(stage), QualityTier::Minimal);
        assert_eq!(alloc.tier(StageKind::Understanding), QualityTier::Normal);
    }

    #[test]
    fn single_spike_survives_repeated_ticks() {
        let alloc = ResourceAllocator::new(AllocatorConfig::default(), Arc::new(EventBus::default()));
        let stage = StageKind::Generation;
        alloc.record_latency(stage, Duration::from_millis(1500));
        for _ in 0..3 {
            alloc.sample(0);
        }
        assert_eq!(alloc.tier(stage), QualityTier::Normal);
    }

    #[test]
    fn stale_window_with_work_in_flight_keeps_streak() {
        let alloc = allocator(4);
        let stage = StageKind::Generation;
        assert!(matches!(alloc.request_slot(stage), SlotDecision::Granted { .. }));

        tick(&alloc, stage, 1500);
        tick(&alloc, stage, 1500);
        // Ticks without new latencies neither advance nor reset the streak.
        for _ in 0..5 {
            alloc.sample(0);
        }
        assert_eq!(alloc.tier(stage), QualityTier::Normal);
        tick(&alloc, stage, 1500);
        assert_eq!(alloc.tier(stage), QualityTier::Degraded);
    }

    #[test]
    fn spike_right_after_tier_change_is_not_enough() {
        let alloc = allocator(4);
        let stage = StageKind::Synthesis;
        for _ in 0..3 {
            tick(&alloc, stage, 1500);
        }
        assert_eq!(alloc.tier(stage), QualityTier::Degraded);

        // The cleared window makes one spike the whole average, once.
        tick(&alloc, stage, 2500);
        tick(&alloc, stage, 100);
        tick(&alloc, stage, 100);
        assert_eq!(alloc.tier(stage), QualityTier::Degraded);
    }

    #[test]
    fn oscillating_load_does_not_flap() {
        let alloc = allocator(4);
        let stage = StageKind::Synthesis;
        for round in 0..20 {
            let ms = if round % 2 == 0 { 3000 } else { 100 };
            feed(&alloc, stage, ms, 4);
            alloc.sample(0);
        }
        assert_eq!(alloc.tier(stage), QualityTier::Normal);
    }

    #[test]
    fn recovery_needs_consecutive_healthy_samples() {
        let alloc = allocator(4);
        let stage = StageKind::Understanding;
        for _ in 0..3 {
            tick(&alloc, stage, 2000);
        }
        assert_eq!(alloc.tier(stage), QualityTier::Degraded);

        for _ in 0..4 {
            tick(&alloc, stage, 100);
        }
        assert_eq!(alloc.tier(stage), QualityTier::Degraded);
        tick(&alloc, stage, 100);
        assert_eq!(alloc.tier(stage), QualityTier::Normal);
    }

    #[test]
    fn idle_stage_recovers() {
        let alloc = allocator(4);
        let stage = StageKind::Generation;
        for _ in 0..3 {
            tick(&alloc, stage, 2000);
        }
        assert_eq!(alloc.tier(stage), QualityTier::Degraded);
        for _ in 0..5 {
            alloc.sample(0);
        }
        assert_eq!(alloc.tier(stage), QualityTier::Normal);
    }

    #[test]
    fn deep_queue_counts_as_breach() {
        let alloc = allocator(2);
        // Bound is 2.0 × 2 = 4 waiting turns.
        for _ in 0..3 {
            alloc.sample(9);
        }
        assert_eq!(alloc.tier(StageKind::Generation), QualityTier::Degraded);
    }

    #[tokio::test]
    async fn tier_change_is_published() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let config = AllocatorConfig {
            downgrade_after: 1,
            stages: StageLimits::uniform(1),
            ..AllocatorConfig::default()
        };
        let alloc = ResourceAllocator::new(config, bus);
        alloc.record_latency(StageKind::Generation, Duration::from_secs(4));
        alloc.sample(0);

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::TierChanged { stage, to, avg_latency_ms, .. } => {
                assert_eq!(*stage, StageKind::Generation);
                assert_eq!(*to, QualityTier::Degraded);
                assert_eq!(*avg_latency_ms, 4000);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn stats_summarize_window() {
        let alloc = allocator(3);
        for ms in [100, 300, 200] {
            alloc.record_latency(StageKind::Synthesis, Duration::from_millis(ms));
        }
        let stats = alloc.stats();
        let synth = stats.iter().find(|s| s.stage == StageKind::Synthesis).unwrap();
        assert_eq!(synth.samples, 3);
        assert_eq!(synth.min_ms, 100);
        assert_eq!(synth.max_ms, 300);
        assert_eq!(synth.latest_ms, 200);
        assert!((synth.mean_ms - 200.0).abs() < f64::EPSILON);
    }
}
