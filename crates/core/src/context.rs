//! Context signals and the fused per-session snapshot.
//!
//! A [`ContextDelta`] is an immutable, timestamped update to one or more
//! semantic fields from a single source. The fusion engine folds deltas into a
//! [`ContextSnapshot`], which is the read-only view handed to pipeline stages.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::session::SessionId;

/// Where a context signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Vehicle bus telemetry (speed, location, climate, ...).
    Telemetry,
    /// Partial or final speech transcripts.
    Transcript,
    /// External feeds: weather, traffic, calendar, trip history.
    External,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [Self::Telemetry, Self::Transcript, Self::External];

    /// Tie-break rank for writes with identical timestamps. Higher wins.
    pub fn priority(self) -> u8 {
        match self {
            Self::Telemetry => 3,
            Self::Transcript => 2,
            Self::External => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Transcript => "transcript",
            Self::External => "external",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a delta in its source's stream.
///
/// `epoch` is the connection generation; sequence numbers restart in each new
/// epoch. Ordering is lexicographic: any delta of a later epoch is newer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SourceCursor {
    pub epoch: u32,
    pub sequence: u64,
}

impl SourceCursor {
    pub fn new(epoch: u32, sequence: u64) -> Self {
        Self { epoch, sequence }
    }
}

impl std::fmt::Display for SourceCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.epoch, self.sequence)
    }
}

/// An incremental update to a session's context from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDelta {
    /// Session this delta belongs to
    pub session_id: SessionId,

    /// Which source produced it
    pub source: SourceKind,

    /// When the source observed the values
    pub timestamp: DateTime<Utc>,

    /// Connection generation of the producing adapter
    #[serde(default)]
    pub epoch: u32,

    /// Per (source, session) sequence number, starting at 1 in each epoch
    pub sequence: u64,

    /// Semantic fields carried by this delta
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl ContextDelta {
    /// Create an empty delta stamped with the current time.
    pub fn new(session_id: impl Into<SessionId>, source: SourceKind, sequence: u64) -> Self {
        Self {
            session_id: session_id.into(),
            source,
            timestamp: Utc::now(),
            epoch: 0,
            sequence,
            fields: BTreeMap::new(),
        }
    }

    /// Set the observation time.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the connection epoch.
    pub fn in_epoch(mut self, epoch: u32) -> Self {
        self.epoch = epoch;
        self
    }

    /// Add a field.
    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn cursor(&self) -> SourceCursor {
        SourceCursor::new(self.epoch, self.sequence)
    }
}

/// The fused value of one semantic field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
    pub source: SourceKind,
}

/// The fused, current view of all known context fields for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Field name → latest accepted value
    pub fields: BTreeMap<String, FieldValue>,

    /// Last accepted cursor per source
    pub cursors: BTreeMap<SourceKind, SourceCursor>,

    /// Incremented on every change
    pub version: u64,
}

impl ContextSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// The raw value of a field, if present.
    pub fn value(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name).map(|f| &f.value)
    }

    pub fn cursor(&self, source: SourceKind) -> Option<SourceCursor> {
        self.cursors.get(&source).copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Plain name → value map of the fields updated within `max_age` of `now`.
    ///
    /// Stale fields stay in the snapshot (so they can never regress) but are
    /// not shown to stages.
    pub fn view(&self, now: DateTime<Utc>, max_age: Duration) -> BTreeMap<String, serde_json::Value> {
        self.fields
            .iter()
            .filter(|(_, f)| now.signed_duration_since(f.updated_at) <= max_age)
            .map(|(name, f)| (name.clone(), f.value.clone()))
            .collect()
    }

    /// Field count per namespace (the part of the name before the first `.`).
    pub fn summary(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for name in self.fields.keys() {
            let namespace = name.split('.').next().unwrap_or(name).to_string();
            *counts.entry(namespace).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(value: serde_json::Value, updated_at: DateTime<Utc>) -> FieldValue {
        FieldValue {
            value,
            updated_at,
            source: SourceKind::Telemetry,
        }
    }

    #[test]
    fn source_priority_prefers_telemetry() {
        assert!(SourceKind::Telemetry.priority() > SourceKind::Transcript.priority());
        assert!(SourceKind::Transcript.priority() > SourceKind::External.priority());
    }

    #[test]
    fn cursor_orders_by_epoch_first() {
        assert!(SourceCursor::new(2, 1) > SourceCursor::new(1, 900));
        assert!(SourceCursor::new(1, 3) > SourceCursor::new(1, 2));
    }

    #[test]
    fn view_hides_stale_fields() {
        let now = Utc::now();
        let mut snap = ContextSnapshot::new();
        snap.fields
            .insert("vehicle.speed".into(), field(json!(88), now - Duration::seconds(2)));
        snap.fields
            .insert("external.weather.sky".into(), field(json!("rain"), now - Duration::minutes(30)));

        let view = snap.view(now, Duration::minutes(5));
        assert_eq!(view.len(), 1);
        assert_eq!(view["vehicle.speed"], json!(88));
    }

    #[test]
    fn summary_groups_by_namespace() {
        let now = Utc::now();
        let mut snap = ContextSnapshot::new();
        snap.fields.insert("vehicle.speed".into(), field(json!(10), now));
        snap.fields.insert("vehicle.gear".into(), field(json!("D"), now));
        snap.fields.insert("transcript.text".into(), field(json!("hi"), now));

        let summary = snap.summary();
        assert_eq!(summary["vehicle"], 2);
        assert_eq!(summary["transcript"], 1);
    }

    #[test]
    fn delta_builder_sets_fields() {
        let delta = ContextDelta::new("s1", SourceKind::External, 4)
            .in_epoch(2)
            .with_field("external.traffic.level", json!("heavy"));
        assert_eq!(delta.cursor(), SourceCursor::new(2, 4));
        assert_eq!(delta.fields.len(), 1);
    }

    #[test]
    fn snapshot_serializes_source_keys() {
        let mut snap = ContextSnapshot::new();
        snap.cursors.insert(SourceKind::Transcript, SourceCursor::new(0, 7));
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("transcript"));
    }
}
