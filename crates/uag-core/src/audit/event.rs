//! Audit trail records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether the action touched the live downstream system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Real downstream call.
    Live,
    /// Intercepted; only the intent was recorded.
    Sandbox,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::Sandbox => write!(f, "SANDBOX"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LIVE" => Ok(Self::Live),
            "SANDBOX" => Ok(Self::Sandbox),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// Outcome recorded for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    /// Downstream call completed.
    Success,
    /// Downstream call failed after all recovery.
    Failed,
    /// Refused by policy.
    Denied,
    /// Sandbox mode captured the action instead of executing it.
    Intercepted,
    /// Kill switch stopped the request.
    Blocked,
    /// Suspended, waiting for a reviewer.
    QuarantinePending,
    /// Token lacked the scope, or the approval plane misbehaved.
    SecurityViolation,
    /// Reviewer rejected the suspended request.
    Rejected,
    /// Reviewer did not answer within the window.
    Timeout,
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Denied => "DENIED",
            Self::Intercepted => "INTERCEPTED",
            Self::Blocked => "BLOCKED",
            Self::QuarantinePending => "QUARANTINE_PENDING",
            Self::SecurityViolation => "SECURITY_VIOLATION",
            Self::Rejected => "REJECTED",
            Self::Timeout => "TIMEOUT",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "DENIED" => Ok(Self::Denied),
            "INTERCEPTED" => Ok(Self::Intercepted),
            "BLOCKED" => Ok(Self::Blocked),
            "QUARANTINE_PENDING" => Ok(Self::QuarantinePending),
            "SECURITY_VIOLATION" => Ok(Self::SecurityViolation),
            "REJECTED" => Ok(Self::Rejected),
            "TIMEOUT" => Ok(Self::Timeout),
            other => Err(format!("unknown audit status: {other}")),
        }
    }
}

/// One immutable audit record.
///
/// Created on the hot path, enqueued into the sink, batched, persisted.
/// Timestamps are client-side; the store does not re-order on insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier (UUID).
    pub id: String,

    /// Request-scoped trace id.
    pub trace_id: String,

    /// Acting agent.
    pub agent_id: String,

    /// Capability the agent invoked.
    pub capability_id: String,

    /// Structured request payload, best-effort decoded.
    pub payload: serde_json::Value,

    /// Live or sandbox execution.
    pub mode: ExecutionMode,

    /// Policy that allowed or intercepted the action; empty for the
    /// synthetic default deny.
    pub policy_id: String,

    /// Final outcome.
    pub status: AuditStatus,

    /// What was returned to the agent, when structured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,

    /// When the event was created. Filled by the sink when absent.
    pub timestamp: Option<DateTime<Utc>>,

    /// End-to-end handling time in milliseconds.
    pub duration_ms: i64,

    /// Error text for failed outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    /// Starts a record for one request with a fresh event id.
    #[must_use]
    pub fn begin(trace_id: &str, agent_id: &str, capability_id: &str, payload: &[u8]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trace_id: trace_id.to_string(),
            agent_id: agent_id.to_string(),
            capability_id: capability_id.to_string(),
            payload: serde_json::from_slice(payload).unwrap_or(serde_json::Value::Null),
            mode: ExecutionMode::Live,
            policy_id: String::new(),
            status: AuditStatus::Failed,
            response: None,
            timestamp: Some(Utc::now()),
            duration_ms: 0,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            AuditStatus::Success,
            AuditStatus::Failed,
            AuditStatus::Denied,
            AuditStatus::Intercepted,
            AuditStatus::Blocked,
            AuditStatus::QuarantinePending,
            AuditStatus::SecurityViolation,
            AuditStatus::Rejected,
            AuditStatus::Timeout,
        ] {
            let parsed: AuditStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn begin_decodes_payload_best_effort() {
        let event = AuditEvent::begin("t-1", "a1", "jira.ticket.delete", br#"{"id":"T-1"}"#);
        assert_eq!(event.payload["id"], "T-1");

        let opaque = AuditEvent::begin("t-1", "a1", "jira.ticket.delete", b"\xff\xfe");
        assert_eq!(opaque.payload, serde_json::Value::Null);
    }
}
