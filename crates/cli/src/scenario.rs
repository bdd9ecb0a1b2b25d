//! JSONL scenario files for `drivetalk run`.
//!
//! One step per line, each scheduled at `at_ms` after the run starts:
//!
//! ```text
//! {"at_ms": 0,   "op": "open", "session": "car-1", "user": "driver"}
//! {"at_ms": 10,  "op": "signal", "source": "telemetry", "session": "car-1", "payload": {"speed_kph": 88}}
//! {"at_ms": 50,  "op": "utterance", "session": "car-1", "text": "navigate home", "confidence": 0.93, "label": "nav"}
//! {"at_ms": 60,  "op": "cancel", "label": "nav"}
//! {"at_ms": 900, "op": "close", "session": "car-1"}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;

use drivetalk_core::{Priority, SourceKind};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub at_ms: u64,

    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Action {
    Open {
        session: String,
        #[serde(default = "default_user")]
        user: String,
    },
    /// A raw event pushed through the ingest connector for `source`.
    Signal {
        source: SourceKind,
        session: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        payload: serde_json::Map<String, serde_json::Value>,
    },
    Utterance {
        session: String,
        text: String,
        #[serde(default = "default_confidence")]
        confidence: f32,
        #[serde(default)]
        label: Option<String>,
    },
    Text {
        session: String,
        text: String,
        #[serde(default)]
        priority: Priority,
        #[serde(default)]
        label: Option<String>,
    },
    /// Cancel the turn submitted under `label`.
    Cancel { label: String },
    Close { session: String },
}

fn default_user() -> String {
    "driver".into()
}

fn default_confidence() -> f32 {
    1.0
}

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("failed to read scenario {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },

    #[error("line {line}: step at {at_ms}ms is earlier than the previous step")]
    OutOfOrder { line: usize, at_ms: u64 },
}

/// Parse scenario text. Steps must be in non-decreasing `at_ms` order.
pub fn parse(content: &str) -> Result<Vec<Step>, ScenarioError> {
    let mut steps: Vec<Step> = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let step: Step = serde_json::from_str(line).map_err(|source| ScenarioError::Parse {
            line: index + 1,
            source,
        })?;
        if steps.last().is_some_and(|prev| prev.at_ms > step.at_ms) {
            return Err(ScenarioError::OutOfOrder {
                line: index + 1,
                at_ms: step.at_ms,
            });
        }
        steps.push(step);
    }
    Ok(steps)
}

pub fn load(path: &Path) -> Result<Vec<Step>, ScenarioError> {
    let content = std::fs::read_to_string(path).map_err(|source| ScenarioError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_op() {
        let steps = parse(
            r#"
# morning commute
{"at_ms": 0, "op": "open", "session": "car-1"}
{"at_ms": 5, "op": "signal", "source": "external", "session": "car-1", "payload": {"feed": "weather", "condition": "rain"}}
{"at_ms": 10, "op": "utterance", "session": "car-1", "text": "navigate home", "confidence": 0.9, "label": "nav"}
{"at_ms": 10, "op": "text", "session": "car-1", "text": "status", "priority": "low"}
{"at_ms": 20, "op": "cancel", "label": "nav"}
{"at_ms": 30, "op": "close", "session": "car-1"}
"#,
        )
        .unwrap();

        assert_eq!(steps.len(), 6);
        assert_eq!(
            steps[0].action,
            Action::Open {
                session: "car-1".into(),
                user: "driver".into()
            }
        );
        match &steps[1].action {
            Action::Signal { source, payload, .. } => {
                assert_eq!(*source, SourceKind::External);
                assert_eq!(payload["condition"], "rain");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &steps[3].action {
            Action::Text { priority, label, .. } => {
                assert_eq!(*priority, Priority::Low);
                assert!(label.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reports_the_bad_line() {
        let err = parse("{\"op\": \"open\", \"session\": \"a\"}\n{\"op\": \"jump\"}").unwrap_err();
        assert!(matches!(err, ScenarioError::Parse { line: 2, .. }));
    }

    #[test]
    fn rejects_steps_going_back_in_time() {
        let err = parse(
            "{\"at_ms\": 50, \"op\": \"close\", \"session\": \"a\"}\n{\"at_ms\": 10, \"op\": \"close\", \"session\": \"a\"}",
        )
        .unwrap_err();
        assert!(matches!(err, ScenarioError::OutOfOrder { line: 2, at_ms: 10 }));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        std::fs::write(&path, "{\"op\": \"open\", \"session\": \"a\"}\n").unwrap();
        assert_eq!(load(&path).unwrap().len(), 1);
        assert!(matches!(
            load(&dir.path().join("missing.jsonl")),
            Err(ScenarioError::Read { .. })
        ));
    }
}
