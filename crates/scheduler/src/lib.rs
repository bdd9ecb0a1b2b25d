//! # DriveTalk Turn Scheduler
//!
//! Orders pending turns across sessions and moves each one through
//! Understanding → Generation → Synthesis.
//!
//! ## Guarantees
//!
//! - At most one turn per session is dispatched at any time; only the head
//!   of a session's queue is eligible.
//! - Across sessions, heads dispatch by priority, then submission time, then
//!   session id.
//! - A new utterance barges in on the session's active turn; the stage gets a
//!   grace period to acknowledge cancellation before its result is discarded.
//! - Missing the soft deadline lowers the quality of the remaining stages;
//!   missing the hard ceiling (twice the budget) fails the turn, and every
//!   failed turn gets a spoken fallback.
//! - Context changes are checked against proactive rules; a rule that starts
//!   holding queues a text turn for the session.

mod invoke;
pub mod output;
mod proactive;
mod ready;
pub mod scheduler;

pub use output::TurnOutput;
pub use scheduler::{TurnScheduler, TurnSchedulerBuilder};
