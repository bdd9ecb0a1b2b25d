//! Turn model: one request/response cycle through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionId;
use crate::stage::StageOutput;

/// Unique identifier for a turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TurnId(pub String);

impl TurnId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TurnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Priority class of a turn. Higher classes are dispatched first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    /// Safety-relevant prompts (e.g. a driver-assistance warning)
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The downstream pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Understanding,
    Generation,
    Synthesis,
}

impl StageKind {
    pub const PIPELINE: [StageKind; 3] = [Self::Understanding, Self::Generation, Self::Synthesis];

    /// The stage that follows this one, or `None` after synthesis.
    pub fn next(self) -> Option<StageKind> {
        match self {
            Self::Understanding => Some(Self::Generation),
            Self::Generation => Some(Self::Synthesis),
            Self::Synthesis => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Understanding => "understanding",
            Self::Generation => "generation",
            Self::Synthesis => "synthesis",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Degradation level controlling compute cost vs. output richness.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    #[default]
    Normal,
    Degraded,
    Minimal,
}

impl QualityTier {
    /// One step cheaper. Minimal stays Minimal.
    pub fn downgrade(self) -> Self {
        match self {
            Self::Normal => Self::Degraded,
            Self::Degraded | Self::Minimal => Self::Minimal,
        }
    }

    /// One step richer. Normal stays Normal.
    pub fn upgrade(self) -> Self {
        match self {
            Self::Minimal => Self::Degraded,
            Self::Degraded | Self::Normal => Self::Normal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Degraded => "degraded",
            Self::Minimal => "minimal",
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What triggered a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnInput {
    /// A finalized spoken utterance. Supersedes the session's active turn.
    Utterance { text: String, confidence: f32 },
    /// Typed input or a proactive prompt. Queues behind the active turn.
    Text { text: String },
}

impl TurnInput {
    pub fn utterance(text: impl Into<String>, confidence: f32) -> Self {
        Self::Utterance {
            text: text.into(),
            confidence,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> &str {
        match self {
            Self::Utterance { text, .. } | Self::Text { text } => text,
        }
    }

    /// Whether submitting this input barges in on the session's active turn.
    pub fn supersedes(&self) -> bool {
        matches!(self, Self::Utterance { .. })
    }
}

/// Lifecycle state of a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TurnState {
    /// Waiting for a slot for `stage`.
    Queued { stage: StageKind },
    /// Occupying a pipeline stage.
    Dispatched { stage: StageKind },
    Succeeded,
    Failed { reason: String },
    Cancelled,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. } | Self::Cancelled)
    }

    pub fn is_dispatched(&self) -> bool {
        matches!(self, Self::Dispatched { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Dispatched { .. } => "dispatched",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A conversational turn.
///
/// References its session by id only; the context store owns sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub session_id: SessionId,
    pub input: TurnInput,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,

    /// Soft latency budget in milliseconds; the hard ceiling is twice this
    pub budget_ms: u64,

    /// The stage the turn is at (or waiting for)
    pub stage: StageKind,

    pub cancelled: bool,

    /// Tier floor applied after the soft deadline passed
    #[serde(default)]
    pub degraded: bool,

    /// Outputs of the stages completed so far
    #[serde(default)]
    pub outputs: Vec<StageOutput>,
}

impl Turn {
    pub fn new(session_id: SessionId, input: TurnInput, priority: Priority, budget_ms: u64) -> Self {
        Self {
            id: TurnId::generate(),
            session_id,
            input,
            priority,
            submitted_at: Utc::now(),
            budget_ms,
            stage: StageKind::Understanding,
            cancelled: false,
            degraded: false,
            outputs: Vec::new(),
        }
    }

    /// Output of a completed stage.
    pub fn output(&self, stage: StageKind) -> Option<&StageOutput> {
        self.outputs.iter().find(|o| o.stage == stage)
    }

    pub fn hard_ceiling_ms(&self) -> u64 {
        self.budget_ms.saturating_mul(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_order() {
        assert_eq!(StageKind::Understanding.next(), Some(StageKind::Generation));
        assert_eq!(StageKind::Generation.next(), Some(StageKind::Synthesis));
        assert_eq!(StageKind::Synthesis.next(), None);
    }

    #[test]
    fn tiers_saturate() {
        assert_eq!(QualityTier::Minimal.downgrade(), QualityTier::Minimal);
        assert_eq!(QualityTier::Normal.upgrade(), QualityTier::Normal);
        assert_eq!(QualityTier::Normal.downgrade().downgrade(), QualityTier::Minimal);
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn only_utterances_supersede() {
        assert!(TurnInput::utterance("navigate home", 0.9).supersedes());
        assert!(!TurnInput::text("low fuel warning").supersedes());
    }

    #[test]
    fn terminal_states() {
        assert!(TurnState::Cancelled.is_terminal());
        assert!(TurnState::Failed { reason: "x".into() }.is_terminal());
        assert!(!TurnState::Queued { stage: StageKind::Generation }.is_terminal());
    }

    #[test]
    fn turn_state_serializes_with_tag() {
        let json = serde_json::to_string(&TurnState::Dispatched {
            stage: StageKind::Synthesis,
        })
        .unwrap();
        assert!(json.contains(r#""state":"dispatched""#));
        assert!(json.contains(r#""stage":"synthesis""#));
    }
}
