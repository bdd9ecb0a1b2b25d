//! Observability sink for DriveTalk.
//!
//! Consumes the domain events published by the fusion, allocator and
//! scheduler crates and keeps per-turn traces with stage spans, per-stage
//! latency statistics and running counters (dropped deltas, tier changes,
//! fallbacks, slow turns).

pub mod engine;
pub mod model;

pub use engine::TelemetryEngine;
pub use model::{LatencySummary, Span, TelemetrySummary, Trace};

/// Errors from the telemetry subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("unknown trace: {0}")]
    UnknownTrace(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
