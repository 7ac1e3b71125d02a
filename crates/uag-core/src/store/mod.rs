//! Durable state behind the gateway.
//!
//! Everything the gateway persists or warm-loads goes through the
//! [`StateStore`] trait: membership lists for the runtime caches, policies,
//! approvals, the audit log, console users and dashboard aggregates. The
//! shipped implementation is SQLite ([`SqliteStateStore`]); the trait is the
//! seam for anything else.

mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use sqlite::SqliteStateStore;

use crate::audit::AuditEvent;
use crate::domain::{Agent, ApprovalRequest, ApprovalStatus, GlobalStats, Policy, User};
use crate::statecache::MembershipLoader;

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A row violated the stored shape (bad enum string, bad timestamp).
    #[error("corrupt row: {0}")]
    CorruptRow(String),

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The approval was already decided by another reviewer.
    #[error("approval request already processed")]
    AlreadyProcessed,

    /// The store cannot be reached (used by remote implementations and
    /// test doubles).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Filters for audit log queries.
#[derive(Debug, Clone, Default)]
pub struct AuditLogFilter {
    /// Restrict to one agent.
    pub agent_id: Option<String>,
    /// Restrict to one capability.
    pub capability_id: Option<String>,
}

/// The persistent state contract consumed by the core.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Agent ids with the kill switch engaged.
    async fn list_blocked_agents(&self) -> Result<Vec<String>, StoreError>;

    /// Agent ids forced into human review.
    async fn list_quarantined_agents(&self) -> Result<Vec<String>, StoreError>;

    /// Agent ids running in sandbox mode.
    async fn list_sandbox_agents(&self) -> Result<Vec<String>, StoreError>;

    /// Inserts or replaces an agent row.
    async fn upsert_agent(&self, agent: &Agent) -> Result<(), StoreError>;

    /// Every stored policy.
    async fn list_policies(&self) -> Result<Vec<Policy>, StoreError>;

    /// Inserts a policy.
    async fn create_policy(&self, policy: &Policy) -> Result<(), StoreError>;

    /// Updates an existing policy by id.
    async fn update_policy(&self, policy: &Policy) -> Result<(), StoreError>;

    /// Deletes a policy by id.
    async fn delete_policy(&self, id: &str) -> Result<(), StoreError>;

    /// Persists a new approval request in `PENDING` state.
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<(), StoreError>;

    /// Records a reviewer decision, conditionally on the request still being
    /// `PENDING`, and returns the linked execution id.
    ///
    /// Exactly one decision can win; the loser observes
    /// [`StoreError::AlreadyProcessed`].
    async fn decide_approval(
        &self,
        id: &str,
        decision: ApprovalStatus,
        reviewer_id: &str,
        comment: Option<&str>,
    ) -> Result<String, StoreError>;

    /// Fetches an approval by its execution id.
    async fn approval_by_execution(
        &self,
        execution_id: &str,
    ) -> Result<ApprovalRequest, StoreError>;

    /// The reviewer queue: all `PENDING` approvals, oldest first.
    async fn list_pending_approvals(&self) -> Result<Vec<ApprovalRequest>, StoreError>;

    /// Bulk-inserts a batch of audit events.
    async fn write_audit_batch(&self, events: &[AuditEvent]) -> Result<(), StoreError>;

    /// Audit events matching `filter`, newest first, capped at 100.
    async fn fetch_audit_logs(
        &self,
        filter: &AuditLogFilter,
    ) -> Result<Vec<AuditEvent>, StoreError>;

    /// Every console user.
    async fn list_users(&self) -> Result<Vec<User>, StoreError>;

    /// Dashboard aggregates over the audit log.
    async fn global_stats(&self) -> Result<GlobalStats, StoreError>;
}

/// Loader feeding the blocked-agents cache from a [`StateStore`].
pub struct BlockedAgentsLoader(pub Arc<dyn StateStore>);

#[async_trait]
impl MembershipLoader for BlockedAgentsLoader {
    async fn load_all(&self) -> Result<Vec<String>, StoreError> {
        self.0.list_blocked_agents().await
    }
}

/// Loader feeding the quarantine cache from a [`StateStore`].
pub struct QuarantinedAgentsLoader(pub Arc<dyn StateStore>);

#[async_trait]
impl MembershipLoader for QuarantinedAgentsLoader {
    async fn load_all(&self) -> Result<Vec<String>, StoreError> {
        self.0.list_quarantined_agents().await
    }
}

/// Loader feeding the sandbox cache from a [`StateStore`].
pub struct SandboxAgentsLoader(pub Arc<dyn StateStore>);

#[async_trait]
impl MembershipLoader for SandboxAgentsLoader {
    async fn load_all(&self) -> Result<Vec<String>, StoreError> {
        self.0.list_sandbox_agents().await
    }
}
