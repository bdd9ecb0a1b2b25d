//! # DriveTalk Fusion
//!
//! Merges context deltas from every signal source into one consistent,
//! versioned snapshot per session.
//!
//! - [`FusionEngine`] is the pure merge: per-source cursor ordering, per-field
//!   last-writer-wins by timestamp, source priority on ties.
//! - [`ContextStore`] holds the snapshot of each active session and publishes
//!   change notifications.
//! - [`FusionWorker`] drains the ingest queue into the store.

pub mod engine;
pub mod store;
pub mod worker;

pub use engine::{FusionEngine, FusionOutcome};
pub use store::ContextStore;
pub use worker::FusionWorker;
