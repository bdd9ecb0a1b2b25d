//! # DriveTalk Core
//!
//! Domain types, traits, and error definitions for the DriveTalk context
//! fusion and turn scheduling core. This crate has no runtime logic — it
//! defines the model that the fusion, ingest, allocator and scheduler crates
//! implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here:
//! - [`PipelineStage`] for Understanding / Generation / Synthesis backends
//! - [`SignalSource`] for telemetry, transcript and external-data producers
//!
//! Implementations are chosen at construction time and injected, which keeps
//! the core testable with scripted adapters.

pub mod context;
pub mod error;
pub mod event;
pub mod session;
pub mod source;
pub mod stage;
pub mod turn;

// Re-export key types at crate root for ergonomics
pub use context::{ContextDelta, ContextSnapshot, FieldValue, SourceCursor, SourceKind};
pub use error::{Error, IngestError, Result, ScheduleError, StageError};
pub use event::{DomainEvent, EventBus};
pub use session::{HistoryEntry, SessionId, SessionInfo};
pub use source::SignalSource;
pub use stage::{
    PipelineStage, StageBudget, StageChunk, StageInput, StageOutput, StageRequest, StageResult,
};
pub use turn::{Priority, QualityTier, StageKind, Turn, TurnId, TurnInput, TurnState};
