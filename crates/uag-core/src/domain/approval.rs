//! Human-in-the-loop approval requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of an approval request.
///
/// The only legal transition is `Pending` to a decided state; the store
/// enforces this with a conditional update so racing reviewers cannot both
/// win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    /// Waiting for a reviewer.
    Pending,
    /// Reviewer approved; the suspended request may execute.
    Approved,
    /// Reviewer rejected; the suspended request fails.
    Rejected,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Approved => write!(f, "APPROVED"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(format!("unknown approval status: {other}")),
        }
    }
}

/// Errors from the approval state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    /// A decided request cannot be decided again.
    #[error("approval request already processed")]
    AlreadyProcessed,

    /// Transition target is not a decided state.
    #[error("invalid approval status transition")]
    InvalidTransition,
}

/// A suspended action awaiting an operator decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request identifier.
    pub id: String,

    /// Links back to the suspended in-flight gateway request; the decision
    /// signal channel is keyed on this.
    pub execution_id: String,

    /// Agent that triggered the review.
    pub agent_id: String,

    /// Capability the agent attempted.
    pub capability_id: String,

    /// Raw payload the agent wanted to send, for reviewer inspection.
    pub payload: String,

    /// Current state.
    pub status: ApprovalStatus,

    /// Reviewer who decided, once decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_id: Option<String>,

    /// Optional reviewer comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Checks whether the state machine permits moving to `next`.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::AlreadyProcessed`] when this request left `Pending`,
    /// [`ApprovalError::InvalidTransition`] when `next` is `Pending`.
    pub fn can_transition_to(&self, next: ApprovalStatus) -> Result<(), ApprovalError> {
        if self.status != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyProcessed);
        }
        if next == ApprovalStatus::Pending {
            return Err(ApprovalError::InvalidTransition);
        }
        Ok(())
    }
}
