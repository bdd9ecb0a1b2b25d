//! Proactive prompts raised from context changes.
//!
//! Rules are edge-triggered per session: a rule fires when a change to its
//! field makes the condition hold, and stays latched until a later change
//! makes it stop holding.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use drivetalk_config::ProactiveRule;
use drivetalk_core::{ContextSnapshot, SessionId};

pub(crate) struct ProactiveMonitor {
    rules: Vec<ProactiveRule>,
    latched: Mutex<HashSet<(SessionId, String)>>,
}

impl ProactiveMonitor {
    pub(crate) fn new(rules: Vec<ProactiveRule>) -> Self {
        Self {
            rules,
            latched: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules that start holding after `changed` fields were written.
    pub(crate) fn evaluate(
        &self,
        session_id: &SessionId,
        snapshot: &ContextSnapshot,
        changed: &[String],
    ) -> Vec<ProactiveRule> {
        let mut latched = self.latched.lock().unwrap_or_else(PoisonError::into_inner);
        let mut fired = Vec::new();
        for rule in &self.rules {
            if !changed.contains(&rule.field) {
                continue;
            }
            let key = (session_id.clone(), rule.name.clone());
            let holds = snapshot.value(&rule.field).is_some_and(|v| matches(rule, v));
            if !holds {
                latched.remove(&key);
            } else if latched.insert(key) {
                fired.push(rule.clone());
            }
        }
        fired
    }

    pub(crate) fn forget(&self, session_id: &SessionId) {
        self.latched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(session, _)| session != session_id);
    }
}

fn matches(rule: &ProactiveRule, value: &serde_json::Value) -> bool {
    if let Some(limit) = rule.below {
        return value.as_f64().is_some_and(|v| v < limit);
    }
    if let Some(limit) = rule.above {
        return value.as_f64().is_some_and(|v| v > limit);
    }
    match (&rule.equals, value) {
        (Some(expected), serde_json::Value::String(s)) => s == expected,
        (Some(expected), other) => other.to_string() == *expected,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use drivetalk_core::{FieldValue, Priority, SourceKind};
    use serde_json::json;

    fn rule(name: &str, field: &str) -> ProactiveRule {
        ProactiveRule {
            name: name.into(),
            field: field.into(),
            below: None,
            above: None,
            equals: None,
            prompt: format!("{name} prompt"),
            priority: Priority::High,
        }
    }

    fn snapshot(field: &str, value: serde_json::Value) -> ContextSnapshot {
        let mut snap = ContextSnapshot::new();
        snap.fields.insert(
            field.into(),
            FieldValue {
                value,
                updated_at: Utc::now(),
                source: SourceKind::Telemetry,
            },
        );
        snap
    }

    fn changed(field: &str) -> Vec<String> {
        vec![field.to_string()]
    }

    #[test]
    fn fires_once_until_condition_clears() {
        let low_fuel = ProactiveRule {
            below: Some(10.0),
            ..rule("low_fuel", "vehicle.fuel_level")
        };
        let monitor = ProactiveMonitor::new(vec![low_fuel]);
        let session = SessionId::from("car-1");
        let field = "vehicle.fuel_level";

        assert!(monitor.evaluate(&session, &snapshot(field, json!(40)), &changed(field)).is_empty());
        let fired = monitor.evaluate(&session, &snapshot(field, json!(8)), &changed(field));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].name, "low_fuel");
        // Still low: latched.
        assert!(monitor.evaluate(&session, &snapshot(field, json!(7)), &changed(field)).is_empty());
        // Refuelled, then low again.
        assert!(monitor.evaluate(&session, &snapshot(field, json!(60)), &changed(field)).is_empty());
        assert_eq!(monitor.evaluate(&session, &snapshot(field, json!(9)), &changed(field)).len(), 1);
    }

    #[test]
    fn unrelated_changes_are_ignored() {
        let monitor = ProactiveMonitor::new(vec![ProactiveRule {
            below: Some(10.0),
            ..rule("low_fuel", "vehicle.fuel_level")
        }]);
        let session = SessionId::from("car-1");
        let snap = snapshot("vehicle.fuel_level", json!(5));
        assert!(monitor.evaluate(&session, &snap, &changed("vehicle.speed_kph")).is_empty());
    }

    #[test]
    fn latches_are_per_session() {
        let monitor = ProactiveMonitor::new(vec![ProactiveRule {
            above: Some(100.0),
            ..rule("engine_hot", "vehicle.coolant_c")
        }]);
        let field = "vehicle.coolant_c";
        let hot = snapshot(field, json!(112.5));
        let a = SessionId::from("a");
        let b = SessionId::from("b");

        assert_eq!(monitor.evaluate(&a, &hot, &changed(field)).len(), 1);
        assert_eq!(monitor.evaluate(&b, &hot, &changed(field)).len(), 1);
        monitor.forget(&a);
        assert_eq!(monitor.evaluate(&a, &hot, &changed(field)).len(), 1);
        assert!(monitor.evaluate(&b, &hot, &changed(field)).is_empty());
    }

    #[test]
    fn equals_compares_strings_and_json() {
        let rain = ProactiveRule {
            equals: Some("rain".into()),
            ..rule("rain", "external.weather.condition")
        };
        assert!(matches(&rain, &json!("rain")));
        assert!(!matches(&rain, &json!("sun")));

        let parked = ProactiveRule {
            equals: Some("true".into()),
            ..rule("parked", "vehicle.parked")
        };
        assert!(matches(&parked, &json!(true)));
        assert!(!matches(&parked, &json!(false)));
        // Non-numeric values never satisfy a numeric bound.
        let low = ProactiveRule {
            below: Some(10.0),
            ..rule("low", "vehicle.fuel_level")
        };
        assert!(!matches(&low, &json!("empty")));
    }
}
