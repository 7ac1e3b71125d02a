//! Dynamic risk analysis.
//!
//! Decides whether a request must be elevated to human review. The decision
//! is a pure function of the resolved policy and the raw payload, so policy
//! authors can tune thresholds in the `conditions` blob without code or
//! schema changes.

use serde::Deserialize;
use tracing::warn;

use crate::domain::{Policy, PolicyEffect};

/// Shape of the `conditions` blob this analyzer understands.
#[derive(Debug, Deserialize)]
struct RiskConditions {
    #[serde(default)]
    risk_field: String,
    #[serde(default)]
    threshold: f64,
}

/// Stateless risk analyzer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskAnalyzer;

impl RiskAnalyzer {
    /// Creates the analyzer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// True when the request needs a human decision before execution.
    ///
    /// Rules, in order: a `QUARANTINE` effect always requires review; an
    /// `ALLOW` effect with usable conditions requires review when the
    /// payload's `risk_field` value is numeric and strictly above the
    /// threshold. Broken conditions or payloads degrade to a plain allow —
    /// the conditions are an escalation mechanism, not a validation gate.
    #[must_use]
    pub fn required(&self, policy: &Policy, payload: &[u8]) -> bool {
        if policy.decide() == PolicyEffect::Quarantine {
            return true;
        }

        if policy.decide() != PolicyEffect::Allow {
            return false;
        }
        let Some(raw_conditions) = policy.conditions.as_ref() else {
            return false;
        };

        let Ok(conditions) = serde_json::from_value::<RiskConditions>(raw_conditions.clone())
        else {
            return false;
        };
        if conditions.risk_field.is_empty() {
            return false;
        }

        let request: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "payload not inspectable for risk analysis");
                return false;
            }
        };

        let Some(value) = request.get(&conditions.risk_field).and_then(
            serde_json::Value::as_f64,
        ) else {
            return false;
        };

        if value > conditions.threshold {
            warn!(
                policy_id = %policy.id,
                field = %conditions.risk_field,
                value,
                threshold = conditions.threshold,
                "dynamic approval triggered"
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn policy(effect: PolicyEffect, conditions: Option<serde_json::Value>) -> Policy {
        Policy {
            id: "p1".into(),
            agent_id: "a1".into(),
            capability_id: "jira.ticket.delete".into(),
            effect: Some(effect),
            conditions,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn threshold_conditions() -> serde_json::Value {
        serde_json::json!({"risk_field": "amount", "threshold": 1000})
    }

    #[test]
    fn quarantine_effect_always_requires_review() {
        let analyzer = RiskAnalyzer::new();
        assert!(analyzer.required(&policy(PolicyEffect::Quarantine, None), b"{}"));
    }

    #[test]
    fn allow_above_threshold_requires_review() {
        let analyzer = RiskAnalyzer::new();
        let p = policy(PolicyEffect::Allow, Some(threshold_conditions()));

        assert!(analyzer.required(&p, br#"{"amount": 5000}"#));
        assert!(!analyzer.required(&p, br#"{"amount": 1000}"#));
        assert!(!analyzer.required(&p, br#"{"amount": 50}"#));
    }

    #[test]
    fn missing_or_non_numeric_field_passes() {
        let analyzer = RiskAnalyzer::new();
        let p = policy(PolicyEffect::Allow, Some(threshold_conditions()));

        assert!(!analyzer.required(&p, br#"{"id": "T-1"}"#));
        assert!(!analyzer.required(&p, br#"{"amount": "a lot"}"#));
        assert!(!analyzer.required(&p, b"not json"));
    }

    #[test]
    fn broken_conditions_degrade_to_plain_allow() {
        let analyzer = RiskAnalyzer::new();

        let empty_field = policy(
            PolicyEffect::Allow,
            Some(serde_json::json!({"risk_field": "", "threshold": 10})),
        );
        assert!(!analyzer.required(&empty_field, br#"{"amount": 99}"#));

        let wrong_shape = policy(PolicyEffect::Allow, Some(serde_json::json!([1, 2, 3])));
        assert!(!analyzer.required(&wrong_shape, br#"{"amount": 99}"#));

        let no_conditions = policy(PolicyEffect::Allow, None);
        assert!(!analyzer.required(&no_conditions, br#"{"amount": 99}"#));
    }

    #[test]
    fn non_allow_effects_do_not_consult_conditions() {
        let analyzer = RiskAnalyzer::new();
        let p = policy(PolicyEffect::Sandbox, Some(threshold_conditions()));
        assert!(!analyzer.required(&p, br#"{"amount": 5000}"#));
    }

    #[test]
    fn decision_is_a_pure_function_of_inputs() {
        let analyzer = RiskAnalyzer::new();
        let p = policy(PolicyEffect::Allow, Some(threshold_conditions()));
        let payload = br#"{"amount": 5000}"#;

        let first = analyzer.required(&p, payload);
        for _ in 0..10 {
            assert_eq!(analyzer.required(&p, payload), first);
        }
    }
}
