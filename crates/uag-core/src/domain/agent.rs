//! Agent identity and lifecycle status.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Control-plane status of an agent.
///
/// The gateway never mutates this directly; it observes the derived
/// membership sets (blocked / quarantined / sandboxed) through the runtime
/// state plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Full access, subject to policy.
    Active,
    /// Kill switch engaged: every action fails immediately.
    Blocked,
    /// Every action requires human review before execution.
    Quarantine,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Blocked => write!(f, "blocked"),
            Self::Quarantine => write!(f, "quarantine"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "blocked" => Ok(Self::Blocked),
            "quarantine" => Ok(Self::Quarantine),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

/// An autonomous caller registered with the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Opaque agent identifier (UUID in practice).
    pub id: String,

    /// Human-readable name, e.g. "jira-helper-bot".
    pub name: String,

    /// Current control-plane status.
    pub status: AgentStatus,

    /// Whether the agent runs in sandbox mode regardless of policy.
    pub is_sandbox: bool,

    /// Capability ids this agent may be granted in a token.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Last successful request, for the console dashboard.
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,

    /// Free-form metadata (version, environment, owner team).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}
