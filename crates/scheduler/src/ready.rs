//! Ready heap: the dispatch order over eligible turns.
//!
//! Only the head turn of each session is ever pushed. Entries are invalidated
//! lazily: each push carries a token, and a popped entry whose token no longer
//! matches the turn's current one is discarded by the caller.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use drivetalk_core::{Priority, SessionId, TurnId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReadyEntry {
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    pub session_id: SessionId,
    pub seq: u64,
    pub turn_id: TurnId,
    pub token: u64,
}

impl Ord for ReadyEntry {
    /// Greater dispatches first: priority desc, then submission asc, then
    /// session id asc.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.submitted_at.cmp(&self.submitted_at))
            .then_with(|| other.session_id.cmp(&self.session_id))
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| other.token.cmp(&self.token))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    heap: BinaryHeap<ReadyEntry>,
    next_token: u64,
}

impl ReadyQueue {
    /// Allocate a token for a fresh push.
    pub fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    pub fn push(&mut self, entry: ReadyEntry) {
        self.heap.push(entry);
    }

    pub fn pop(&mut self) -> Option<ReadyEntry> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
