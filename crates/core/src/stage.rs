//! Pipeline stage trait — the abstraction over Understanding, Generation and
//! Synthesis backends.
//!
//! A stage receives a read-only context snapshot plus the turn's input and
//! returns a complete output, a stream of chunks, or an error. Which model or
//! service sits behind it is irrelevant to the scheduler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::ContextSnapshot;
use crate::error::StageError;
use crate::session::{HistoryEntry, SessionId};
use crate::turn::{QualityTier, StageKind, TurnId};

/// Compute budget derived from the granted quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBudget {
    /// How many history turns the stage may look at
    pub context_turns: usize,

    /// Generation length limit
    pub max_tokens: u32,
}

/// Input for one stage invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageInput {
    /// The user's utterance or typed text
    pub text: String,

    /// Understanding output, once available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub understanding: Option<StageOutput>,

    /// Generation output, once available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<StageOutput>,

    /// Most recent history, trimmed to the budget
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,

    /// Set for the apology synthesis issued after a failed turn
    #[serde(default)]
    pub fallback: bool,
}

/// Everything a stage adapter is invoked with.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub turn_id: TurnId,
    pub session_id: SessionId,
    pub stage: StageKind,
    pub snapshot: Arc<ContextSnapshot>,
    pub input: StageInput,
    pub tier: QualityTier,
    pub budget: StageBudget,
}

/// A complete stage result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub stage: StageKind,

    /// Intent JSON, response text, or an audio reference depending on the stage
    pub content: String,

    /// Adapter-specific metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl StageOutput {
    pub fn new(stage: StageKind, content: impl Into<String>) -> Self {
        Self {
            stage,
            content: content.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// A single chunk in a streaming stage response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageChunk {
    pub content: String,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,
}

/// The outcome of a stage invocation.
#[derive(Debug)]
pub enum StageResult {
    Success(StageOutput),
    /// Streamed chunks; the stream ends at a `done` chunk or when the sender drops.
    Partial(mpsc::Receiver<Result<StageChunk, StageError>>),
    Error(StageError),
}

/// The core pipeline stage trait.
///
/// Implementations must honor `cancel` at their next yield point (between
/// streamed chunks, before a network round-trip). The scheduler waits a short
/// grace period for that acknowledgement and then discards late results.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// A human-readable name for this adapter (e.g. "intent-classifier").
    fn name(&self) -> &str;

    /// Which pipeline position this adapter serves.
    fn kind(&self) -> StageKind;

    /// Run the stage for one turn.
    async fn invoke(&self, request: StageRequest, cancel: CancellationToken) -> StageResult;

    /// Health check — can we reach the backing service?
    async fn health_check(&self) -> std::result::Result<bool, StageError> {
        Ok(true)
    }
}
