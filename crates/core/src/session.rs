//! Session identity and conversation history types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::turn::TurnId;

/// Unique identifier for a conversation session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One completed turn in a session's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub turn_id: TurnId,

    /// What the user said or typed
    pub user_text: String,

    /// What the assistant answered (generation output)
    pub response_text: String,

    pub completed_at: DateTime<Utc>,
}

/// A read-only description of a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub user_ref: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub history_len: usize,
    pub context_version: u64,
}
