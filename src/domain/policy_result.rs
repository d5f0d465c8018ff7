//! Policy evaluation output
//!
//! Every score is clamped to [0, 1] and rounded to two decimals when it is
//! assigned, including when a stored result is deserialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Clamps to [0, 1] and rounds to 2 decimals; NaN becomes 0.0
#[must_use]
pub fn bounded_score(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    (value.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

/// Next visit time plus the scores that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawPolicyResult")]
pub struct PolicyResult {
    next_visit_at: DateTime<Utc>,
    change_boost: f64,
    value_boost: f64,
    error_penalty: f64,
    priority: f64,
    urgency: f64,
    cost_factor: f64,
    policy: String,
    evaluated_at: DateTime<Utc>,
}

/// Unchecked shape used for deserialization; funnels through the setters
#[derive(Deserialize)]
struct RawPolicyResult {
    next_visit_at: DateTime<Utc>,
    change_boost: f64,
    value_boost: f64,
    error_penalty: f64,
    priority: f64,
    urgency: f64,
    cost_factor: f64,
    policy: String,
    evaluated_at: DateTime<Utc>,
}

impl From<RawPolicyResult> for PolicyResult {
    fn from(raw: RawPolicyResult) -> Self {
        let mut result = Self::neutral(raw.policy, raw.next_visit_at, raw.evaluated_at);
        result.set_change_boost(raw.change_boost);
        result.set_value_boost(raw.value_boost);
        result.set_error_penalty(raw.error_penalty);
        result.set_priority(raw.priority);
        result.set_urgency(raw.urgency);
        result.set_cost_factor(raw.cost_factor);
        result
    }
}

impl PolicyResult {
    /// All scores 0.5 except the error penalty, which starts at 0.0
    pub fn neutral(
        policy: impl Into<String>,
        next_visit_at: DateTime<Utc>,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            next_visit_at,
            change_boost: 0.5,
            value_boost: 0.5,
            error_penalty: 0.0,
            priority: 0.5,
            urgency: 0.5,
            cost_factor: 0.5,
            policy: policy.into(),
            evaluated_at,
        }
    }

    pub fn set_change_boost(&mut self, value: f64) {
        self.change_boost = bounded_score(value);
    }

    pub fn set_value_boost(&mut self, value: f64) {
        self.value_boost = bounded_score(value);
    }

    pub fn set_error_penalty(&mut self, value: f64) {
        self.error_penalty = bounded_score(value);
    }

    pub fn set_priority(&mut self, value: f64) {
        self.priority = bounded_score(value);
    }

    pub fn set_urgency(&mut self, value: f64) {
        self.urgency = bounded_score(value);
    }

    pub fn set_cost_factor(&mut self, value: f64) {
        self.cost_factor = bounded_score(value);
    }

    pub fn set_next_visit_at(&mut self, next_visit_at: DateTime<Utc>) {
        self.next_visit_at = next_visit_at;
    }

    #[must_use]
    pub const fn next_visit_at(&self) -> DateTime<Utc> {
        self.next_visit_at
    }

    #[must_use]
    pub const fn change_boost(&self) -> f64 {
        self.change_boost
    }

    #[must_use]
    pub const fn value_boost(&self) -> f64 {
        self.value_boost
    }

    #[must_use]
    pub const fn error_penalty(&self) -> f64 {
        self.error_penalty
    }

    #[must_use]
    pub const fn priority(&self) -> f64 {
        self.priority
    }

    #[must_use]
    pub const fn urgency(&self) -> f64 {
        self.urgency
    }

    #[must_use]
    pub const fn cost_factor(&self) -> f64 {
        self.cost_factor
    }

    #[must_use]
    pub fn policy(&self) -> &str {
        &self.policy
    }

    #[must_use]
    pub const fn evaluated_at(&self) -> DateTime<Utc> {
        self.evaluated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn result() -> PolicyResult {
        let now = Utc::now();
        PolicyResult::neutral("test", now, now)
    }

    #[test]
    fn setters_clamp_and_round() {
        let mut r = result();
        r.set_change_boost(1.5);
        assert!((r.change_boost() - 1.0).abs() < f64::EPSILON);
        r.set_change_boost(-0.3);
        assert!(r.change_boost().abs() < f64::EPSILON);
        r.set_change_boost(0.666);
        assert!((r.change_boost() - 0.67).abs() < f64::EPSILON);
        r.set_urgency(f64::NAN);
        assert!(r.urgency().abs() < f64::EPSILON);
    }

    #[test]
    fn deserialization_goes_through_setters() {
        let json = serde_json::json!({
            "next_visit_at": "2026-01-01T00:00:00Z",
            "change_boost": 3.0,
            "value_boost": -1.0,
            "error_penalty": 0.333,
            "priority": 0.5,
            "urgency": 0.129,
            "cost_factor": 0.5,
            "policy": "signal_decay",
            "evaluated_at": "2026-01-01T00:00:00Z"
        });
        let r: PolicyResult = serde_json::from_value(json).unwrap();
        assert!((r.change_boost() - 1.0).abs() < f64::EPSILON);
        assert!(r.value_boost().abs() < f64::EPSILON);
        assert!((r.error_penalty() - 0.33).abs() < f64::EPSILON);
        assert!((r.urgency() - 0.13).abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn bounded_score_stays_in_unit_interval(value in proptest::num::f64::ANY) {
            let score = bounded_score(value);
            prop_assert!((0.0..=1.0).contains(&score));
            prop_assert!(((score * 100.0).round() - score * 100.0).abs() < 1e-9);
        }
    }
}
