//! Data model for turn traces, stage spans and aggregated latency views.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use drivetalk_core::{Priority, QualityTier, StageKind};

// ── Span ──────────────────────────────────────────────────────────────────

/// One stage invocation within a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub stage: StageKind,
    /// Quality tier the stage ran at.
    pub tier: QualityTier,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
}

impl Span {
    /// Build a span from a completion report.
    pub fn completed(
        stage: StageKind,
        tier: QualityTier,
        duration_ms: u64,
        success: bool,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let elapsed = Duration::milliseconds(i64::try_from(duration_ms).unwrap_or(i64::MAX));
        Self {
            stage,
            tier,
            started_at: ended_at - elapsed,
            ended_at,
            duration_ms,
            success,
        }
    }
}

// ── Trace ─────────────────────────────────────────────────────────────────

/// Everything recorded about one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    /// The turn id.
    pub id: String,
    pub session_id: String,
    pub priority: Priority,
    pub spans: Vec<Span>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Terminal state label once the turn finished.
    pub outcome: Option<String>,
    #[serde(default)]
    pub context_refreshes: u32,
    #[serde(default)]
    pub fallback: bool,
}

impl Trace {
    pub fn new(
        turn_id: impl Into<String>,
        session_id: impl Into<String>,
        priority: Priority,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: turn_id.into(),
            session_id: session_id.into(),
            priority,
            spans: Vec::new(),
            started_at,
            ended_at: None,
            outcome: None,
            context_refreshes: 0,
            fallback: false,
        }
    }

    pub fn add_span(&mut self, span: Span) {
        self.spans.push(span);
    }

    /// Mark the trace complete with the turn's terminal state.
    pub fn end(&mut self, outcome: impl Into<String>, at: DateTime<Utc>) {
        self.ended_at = Some(at);
        self.outcome = Some(outcome.into());
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Submission to terminal state, in milliseconds.
    pub fn response_time_ms(&self) -> Option<u64> {
        self.ended_at.map(|end| {
            end.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64
        })
    }

    /// Time spent inside stages.
    pub fn stage_time_ms(&self) -> u64 {
        self.spans.iter().map(|s| s.duration_ms).sum()
    }

    /// Whether any stage ran below the normal tier.
    pub fn degraded(&self) -> bool {
        self.spans.iter().any(|s| s.tier != QualityTier::Normal)
    }
}

// ── Aggregated views ──────────────────────────────────────────────────────

/// Latency statistics for one stage since the engine started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub invocations: u64,
    pub failures: u64,
    pub mean_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub latest_ms: u64,
}

/// Aggregate report over everything the engine has seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub turns_submitted: u64,
    pub turns_succeeded: u64,
    pub turns_failed: u64,
    pub turns_cancelled: u64,
    pub fallbacks: u64,
    /// Finished turns slower than the response-time threshold.
    pub slow_turns: u64,
    pub response_threshold_ms: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub tier_changes: u64,
    pub context_refreshes: u64,
    /// Deltas that changed at least one field.
    pub context_updates: u64,
    /// Turns queued by proactive rules.
    pub proactive_turns: u64,
    /// Dropped deltas by reason.
    pub dropped_deltas: BTreeMap<String, u64>,
    pub stages: BTreeMap<StageKind, LatencySummary>,
    pub trace_count: usize,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-10T07:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::seconds(secs)
    }

    #[test]
    fn span_start_is_derived_from_duration() {
        let span = Span::completed(StageKind::Generation, QualityTier::Normal, 1500, true, at(10));
        assert_eq!(span.started_at, at(10) - Duration::milliseconds(1500));
    }

    #[test]
    fn trace_timings() {
        let mut trace = Trace::new("t1", "s1", Priority::High, at(0));
        trace.add_span(Span::completed(StageKind::Understanding, QualityTier::Normal, 200, true, at(1)));
        trace.add_span(Span::completed(StageKind::Generation, QualityTier::Degraded, 900, true, at(2)));
        assert!(!trace.is_finished());
        assert_eq!(trace.response_time_ms(), None);

        trace.end("succeeded", at(3));
        assert_eq!(trace.response_time_ms(), Some(3000));
        assert_eq!(trace.stage_time_ms(), 1100);
        assert!(trace.degraded());
    }

    #[test]
    fn trace_serializes() {
        let trace = Trace::new("t1", "s1", Priority::Low, at(0));
        let json = serde_json::to_string(&trace).unwrap();
        assert!(json.contains(r#""priority":"low""#));
    }
}
