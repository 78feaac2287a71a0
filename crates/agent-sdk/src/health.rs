//! Agent health reporting.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health state of an agent. Ordered from best to worst, so the worst of a
/// set of states is simply the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health response payload (0xE1).
///
/// The overall state rolls up individual checks using the worst-state rule:
/// `unhealthy` dominates `degraded`, which dominates `healthy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: HealthState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<HealthCheck>,
}

/// An individual health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub state: HealthState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl HealthCheck {
    pub fn new(name: impl Into<String>, state: HealthState) -> Self {
        Self {
            name: name.into(),
            state,
            message: String::new(),
            duration_ms: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::healthy()
    }
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self::with_state(HealthState::Healthy, String::new())
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_state(HealthState::Degraded, message.into())
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_state(HealthState::Unhealthy, message.into())
    }

    fn with_state(state: HealthState, message: String) -> Self {
        Self {
            state,
            message,
            details: HashMap::new(),
            timestamp: Utc::now(),
            checks: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Add a check and fold its state into the overall state.
    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.state = self.state.max(check.state);
        self.checks.push(check);
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }

    pub fn is_degraded(&self) -> bool {
        self.state == HealthState::Degraded
    }

    pub fn is_unhealthy(&self) -> bool {
        self.state == HealthState::Unhealthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_order_worst_last() {
        assert!(HealthState::Healthy < HealthState::Degraded);
        assert!(HealthState::Degraded < HealthState::Unhealthy);
    }

    #[test]
    fn degraded_check_downgrades_healthy_status() {
        let status = HealthStatus::healthy()
            .with_check(HealthCheck::new("db", HealthState::Healthy))
            .with_check(HealthCheck::new("cache", HealthState::Degraded));

        assert!(status.is_degraded());
        assert_eq!(status.checks.len(), 2);
    }

    #[test]
    fn unhealthy_dominates_degraded() {
        let status = HealthStatus::degraded("cache slow")
            .with_check(HealthCheck::new("db", HealthState::Unhealthy).with_message("down"));

        assert!(status.is_unhealthy());
    }

    #[test]
    fn healthy_check_never_upgrades() {
        let status = HealthStatus::unhealthy("db down")
            .with_check(HealthCheck::new("cache", HealthState::Healthy));

        assert!(status.is_unhealthy());
    }

    #[test]
    fn aggregate_is_worst_of_any_permutation() {
        use HealthState::*;
        let cases = [
            (vec![Healthy, Healthy], Healthy),
            (vec![Healthy, Degraded, Healthy], Degraded),
            (vec![Degraded, Unhealthy, Healthy], Unhealthy),
            (vec![Unhealthy, Degraded], Unhealthy),
        ];

        for (states, expected) in cases {
            let mut status = HealthStatus::healthy();
            for (i, state) in states.iter().enumerate() {
                status = status.with_check(HealthCheck::new(format!("check-{i}"), *state));
            }
            assert_eq!(status.state, expected, "states {states:?}");
        }
    }

    #[test]
    fn wire_shape_uses_snake_case_states() {
        let json = serde_json::to_value(HealthStatus::degraded("cache slow")).unwrap();
        assert_eq!(json["state"], "degraded");
        assert_eq!(json["message"], "cache slow");
        assert!(json.get("checks").is_none());
    }
}
