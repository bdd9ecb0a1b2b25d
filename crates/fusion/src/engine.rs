//! The fusion function: `apply(snapshot, delta) -> (snapshot', outcome)`.
//!
//! Pure with respect to its inputs. The snapshot passed in is never mutated;
//! a rejected delta leaves the caller holding the unchanged original.

use chrono::{DateTime, Duration, Utc};

use drivetalk_core::{ContextDelta, ContextSnapshot, FieldValue, IngestError};

/// What applying one delta did to the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FusionOutcome {
    /// True when at least one field was written.
    pub changed: bool,
    pub applied_fields: Vec<String>,
    /// Fields rejected because a fresher value was already stored.
    pub stale_fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FusionEngine {
    max_clock_skew: Duration,
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self::new(Duration::seconds(5))
    }
}

impl FusionEngine {
    pub fn new(max_clock_skew: Duration) -> Self {
        Self { max_clock_skew }
    }

    pub fn from_skew_ms(max_clock_skew_ms: u64) -> Self {
        let millis = i64::try_from(max_clock_skew_ms).unwrap_or(i64::MAX);
        Self::new(Duration::try_milliseconds(millis).unwrap_or(Duration::MAX))
    }

    pub fn apply(
        &self,
        snapshot: &ContextSnapshot,
        delta: &ContextDelta,
    ) -> Result<(ContextSnapshot, FusionOutcome), IngestError> {
        self.apply_at(snapshot, delta, Utc::now())
    }

    /// Apply with an explicit wall clock, used for the future-timestamp check.
    pub fn apply_at(
        &self,
        snapshot: &ContextSnapshot,
        delta: &ContextDelta,
        now: DateTime<Utc>,
    ) -> Result<(ContextSnapshot, FusionOutcome), IngestError> {
        self.validate(delta, now)?;

        let cursor = delta.cursor();
        if let Some(last) = snapshot.cursor(delta.source) {
            if cursor == last {
                return Err(IngestError::Duplicate {
                    source_name: delta.source.to_string(),
                    epoch: cursor.epoch,
                    sequence: cursor.sequence,
                });
            }
            if cursor < last {
                return Err(IngestError::OutOfOrder {
                    source_name: delta.source.to_string(),
                    epoch: cursor.epoch,
                    sequence: cursor.sequence,
                    last_epoch: last.epoch,
                    last_sequence: last.sequence,
                });
            }
        }

        let mut next = snapshot.clone();
        next.cursors.insert(delta.source, cursor);

        let mut outcome = FusionOutcome::default();
        for (name, value) in &delta.fields {
            let accept = match next.fields.get(name) {
                None => true,
                Some(current) => {
                    delta.timestamp > current.updated_at
                        || (delta.timestamp == current.updated_at
                            && delta.source.priority() >= current.source.priority())
                }
            };

            if accept {
                next.fields.insert(
                    name.clone(),
                    FieldValue {
                        value: value.clone(),
                        updated_at: delta.timestamp,
                        source: delta.source,
                    },
                );
                outcome.applied_fields.push(name.clone());
            } else {
                outcome.stale_fields.push(name.clone());
            }
        }

        outcome.changed = !outcome.applied_fields.is_empty();
        if outcome.changed {
            next.version += 1;
        }
        Ok((next, outcome))
    }

    fn validate(&self, delta: &ContextDelta, now: DateTime<Utc>) -> Result<(), IngestError> {
        let malformed = |reason: &str| IngestError::Malformed {
            source_name: delta.source.to_string(),
            reason: reason.to_string(),
        };

        if delta.session_id.as_str().is_empty() {
            return Err(malformed("empty session id"));
        }
        if delta.sequence == 0 {
            return Err(malformed("sequence numbers start at 1"));
        }
        if delta.fields.is_empty() {
            return Err(malformed("delta carries no fields"));
        }
        if delta.fields.keys().any(|name| name.trim().is_empty()) {
            return Err(malformed("empty field name"));
        }
        if delta.timestamp > now + self.max_clock_skew {
            return Err(malformed("timestamp is in the future"));
        }
        Ok(())
    }
}
