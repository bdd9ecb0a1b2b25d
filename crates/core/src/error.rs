//! Error types for the DriveTalk core.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each component has its own error enum; the top-level [`Error`] wraps them.

use thiserror::Error;

/// The top-level error type for all DriveTalk operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Ingest / fusion errors ---
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    // --- Pipeline stage errors ---
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    // --- Scheduling errors ---
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Component errors ---

/// Errors raised while normalizing or fusing context deltas.
///
/// All of these are recoverable: the delta is dropped, the error is logged,
/// and processing continues for every session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("Malformed delta from {source_name}: {reason}")]
    Malformed { source_name: String, reason: String },

    #[error("Duplicate delta from {source_name}: sequence {epoch}/{sequence} already applied")]
    Duplicate {
        source_name: String,
        epoch: u32,
        sequence: u64,
    },

    #[error(
        "Out-of-order delta from {source_name}: {epoch}/{sequence} is older than {last_epoch}/{last_sequence}"
    )]
    OutOfOrder {
        source_name: String,
        epoch: u32,
        sequence: u64,
        last_epoch: u32,
        last_sequence: u64,
    },

    #[error("Source connection lost: {0}")]
    ConnectionLost(String),

    #[error("Delta for unknown session: {0}")]
    SessionNotFound(String),
}

impl IngestError {
    /// Short machine-readable label used in events and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "malformed",
            Self::Duplicate { .. } => "duplicate",
            Self::OutOfOrder { .. } => "out_of_order",
            Self::ConnectionLost(_) => "connection_lost",
            Self::SessionNotFound(_) => "session_not_found",
        }
    }
}

/// Errors reported by (or on behalf of) a pipeline stage adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("Stage unavailable: {0}")]
    Unavailable(String),

    #[error("Stage {stage} failed: {reason}")]
    Failed { stage: String, reason: String },

    #[error("Stage invocation cancelled")]
    Cancelled,

    #[error("Deadline exceeded after {elapsed_ms}ms (hard ceiling {ceiling_ms}ms)")]
    DeadlineExceeded { elapsed_ms: u64, ceiling_ms: u64 },

    #[error("Stage returned invalid output: {0}")]
    InvalidOutput(String),
}

/// Errors returned to callers of the session lifecycle API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Turn not found: {0}")]
    TurnNotFound(String),

    #[error("Session is closing: {0}")]
    SessionClosed(String),

    #[error("No {stage} slot available")]
    ResourceExhausted { stage: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_error_displays_both_cursors() {
        let err = Error::Ingest(IngestError::OutOfOrder {
            source_name: "telemetry".into(),
            epoch: 1,
            sequence: 2,
            last_epoch: 1,
            last_sequence: 3,
        });
        let text = err.to_string();
        assert!(text.contains("1/2"));
        assert!(text.contains("1/3"));
        assert!(text.contains("telemetry"));
    }

    #[test]
    fn stage_error_converts_into_top_level() {
        let err: Error = StageError::DeadlineExceeded {
            elapsed_ms: 4100,
            ceiling_ms: 4000,
        }
        .into();
        assert!(err.to_string().contains("4000ms"));
    }

    #[test]
    fn ingest_error_kinds_are_stable() {
        assert_eq!(
            IngestError::SessionNotFound("s".into()).kind(),
            "session_not_found"
        );
        assert_eq!(
            IngestError::Malformed {
                source_name: "x".into(),
                reason: "y".into()
            }
            .kind(),
            "malformed"
        );
    }
}
