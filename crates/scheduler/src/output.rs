//! What the scheduler hands back to the embedding application.

use serde::Serialize;

use drivetalk_core::{QualityTier, SessionId, StageKind, TurnId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnOutput {
    /// A streamed piece of a stage's output, forwarded as it arrives.
    Chunk {
        turn_id: TurnId,
        session_id: SessionId,
        stage: StageKind,
        content: String,
    },

    /// The turn finished every stage.
    Completed {
        turn_id: TurnId,
        session_id: SessionId,
        response: String,
        audio: String,
        tier: QualityTier,
    },

    /// The turn failed; `text` is the apology and `audio` its synthesis when
    /// that succeeded in time.
    Fallback {
        turn_id: TurnId,
        session_id: SessionId,
        reason: String,
        text: String,
        audio: Option<String>,
    },

    /// An utterance was too uncertain to act on.
    Reprompt {
        session_id: SessionId,
        text: String,
        confidence: f32,
    },
}

impl TurnOutput {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Chunk { session_id, .. }
            | Self::Completed { session_id, .. }
            | Self::Fallback { session_id, .. }
            | Self::Reprompt { session_id, .. } => session_id,
        }
    }

    pub fn turn_id(&self) -> Option<&TurnId> {
        match self {
            Self::Chunk { turn_id, .. }
            | Self::Completed { turn_id, .. }
            | Self::Fallback { turn_id, .. } => Some(turn_id),
            Self::Reprompt { .. } => None,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Chunk { .. })
    }
}
