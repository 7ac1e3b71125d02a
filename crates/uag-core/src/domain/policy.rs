//! Security policies and their decision semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Literal agent id that matches every agent.
pub const WILDCARD_AGENT: &str = "*";

/// What the gateway does with a matching request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyEffect {
    /// Execute against the live downstream system.
    Allow,
    /// Refuse the request.
    Deny,
    /// Record the intended action, return a synthetic success.
    Sandbox,
    /// Suspend the request for human review.
    Quarantine,
}

impl std::fmt::Display for PolicyEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Deny => write!(f, "DENY"),
            Self::Sandbox => write!(f, "SANDBOX"),
            Self::Quarantine => write!(f, "QUARANTINE"),
        }
    }
}

impl std::str::FromStr for PolicyEffect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALLOW" => Ok(Self::Allow),
            "DENY" => Ok(Self::Deny),
            "SANDBOX" => Ok(Self::Sandbox),
            "QUARANTINE" => Ok(Self::Quarantine),
            other => Err(format!("unknown policy effect: {other}")),
        }
    }
}

/// A single access rule for one `(agent, capability)` pair.
///
/// `agent_id` may be [`WILDCARD_AGENT`]; an exact match always outranks the
/// wildcard. `conditions` is an opaque JSON blob interpreted only by the
/// risk analyzer, which lets operators tighten thresholds without schema
/// changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Policy identifier.
    pub id: String,

    /// Agent this rule applies to, or `"*"` for all agents.
    pub agent_id: String,

    /// Capability being regulated, e.g. `jira.ticket.delete`.
    pub capability_id: String,

    /// Effect when this policy matches. `None` (absent in storage) decides
    /// to deny.
    pub effect: Option<PolicyEffect>,

    /// Dynamic risk rules, e.g. `{"risk_field":"amount","threshold":1000}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<serde_json::Value>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Synthetic deny returned when no stored policy matches.
    ///
    /// Lookups never come back empty: an absent rule is an explicit refusal.
    #[must_use]
    pub fn default_deny(agent_id: &str, capability_id: &str) -> Self {
        Self {
            id: String::new(),
            agent_id: agent_id.to_string(),
            capability_id: capability_id.to_string(),
            effect: Some(PolicyEffect::Deny),
            conditions: None,
            created_at: DateTime::<Utc>::MIN_UTC,
            updated_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Resolves the effective decision for this policy.
    ///
    /// A policy with no effect recorded decides to deny rather than
    /// defaulting open.
    #[must_use]
    pub fn decide(&self) -> PolicyEffect {
        self.effect.unwrap_or(PolicyEffect::Deny)
    }

    /// True if this is the synthetic deny produced by a lookup miss.
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        self.id.is_empty()
    }
}
