//! The request pipeline.
//!
//! [`Gateway::process_action`] is the hot path: authorization, kill switch,
//! policy lookup, risk analysis, then one of four branches — deny, suspend
//! for review, sandbox intercept, or reliability-wrapped live execution.
//!
//! The gateway only sees narrow seams ([`PolicyProvider`],
//! [`MembershipView`], [`Auditor`], [`ActionExecutor`], the approval
//! coordinator), which keeps the wiring acyclic and every stage testable in
//! isolation.
//!
//! # Invariants
//!
//! - The kill switch wins over every policy effect, including `ALLOW`.
//! - Risk elevation runs before the sandbox branch: a sandboxed agent
//!   attempting a high-risk action still lands in the reviewer queue.
//! - Every request emits exactly one terminal audit event; a suspension
//!   additionally records a non-terminal `QUARANTINE_PENDING` marker.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalCoordinator, ApprovalOutcome, ApprovalWaitError};
use crate::audit::{AuditEvent, AuditStatus, Auditor, ExecutionMode};
use crate::auth::CustomClaims;
use crate::connector::{ActionExecutor, ConnectorError};
use crate::domain::{Policy, PolicyEffect};
use crate::policy::PolicyStore;
use crate::risk::RiskAnalyzer;
use crate::statecache::StateCache;

/// Resolves the effective policy for a request.
pub trait PolicyProvider: Send + Sync {
    /// Never returns an absent policy; misses resolve to a synthetic deny.
    fn lookup(&self, agent_id: &str, capability_id: &str) -> Policy;
}

impl PolicyProvider for PolicyStore {
    fn lookup(&self, agent_id: &str, capability_id: &str) -> Policy {
        Self::lookup(self, agent_id, capability_id)
    }
}

/// Membership probe over one runtime category.
pub trait MembershipView: Send + Sync {
    /// True when `agent_id` is in the category.
    fn contains(&self, agent_id: &str) -> bool;
}

impl MembershipView for StateCache {
    fn contains(&self, agent_id: &str) -> bool {
        Self::contains(self, agent_id)
    }
}

/// Failure taxonomy of the pipeline.
///
/// Messages are safe to return to callers; internal detail stays in the
/// audit log and tracing output.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Token does not grant the capability.
    #[error("security: insufficient permissions for {0}")]
    InsufficientScope(String),

    /// Kill switch engaged for this agent.
    #[error("security: agent blocked by kill switch")]
    AgentBlocked,

    /// Policy resolved to deny.
    #[error("access denied: {0}")]
    PolicyDenied(String),

    /// Reviewer rejected the suspended request.
    #[error("security: operation explicitly rejected by human operator")]
    ApprovalRejected,

    /// Reviewer did not answer within the window.
    #[error("security: human-in-the-loop timeout, operator did not respond in time")]
    ApprovalTimeout,

    /// The approval plane produced a signal that does not match the store.
    #[error("security: unexpected signal from approval system")]
    ApprovalSignal,

    /// The request could not be suspended (persistence or admission).
    #[error("approval coordination unavailable")]
    ApprovalUnavailable,

    /// Gateway-side rate limit exhausted.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Downstream circuit breaker open.
    #[error("downstream temporarily unavailable")]
    BreakerOpen,

    /// Downstream call failed after all recovery.
    #[error("connector call failed: {0}")]
    Connector(String),

    /// Anything else; details are in the logs only.
    #[error("internal error")]
    Internal,
}

impl GatewayError {
    /// Audit status recorded for this failure.
    #[must_use]
    pub fn audit_status(&self) -> AuditStatus {
        match self {
            Self::InsufficientScope(_) | Self::ApprovalSignal => AuditStatus::SecurityViolation,
            Self::AgentBlocked => AuditStatus::Blocked,
            Self::PolicyDenied(_) => AuditStatus::Denied,
            Self::ApprovalRejected => AuditStatus::Rejected,
            Self::ApprovalTimeout => AuditStatus::Timeout,
            Self::ApprovalUnavailable
            | Self::RateLimited
            | Self::BreakerOpen
            | Self::Connector(_)
            | Self::Internal => AuditStatus::Failed,
        }
    }
}

fn map_connector_error(error: ConnectorError) -> GatewayError {
    match error {
        ConnectorError::RateLimited => GatewayError::RateLimited,
        ConnectorError::BreakerOpen => GatewayError::BreakerOpen,
        other => GatewayError::Connector(other.to_string()),
    }
}

fn map_approval_error(error: &ApprovalWaitError) -> GatewayError {
    match error {
        ApprovalWaitError::Timeout => GatewayError::ApprovalTimeout,
        ApprovalWaitError::InvalidSignal(_) => GatewayError::ApprovalSignal,
        ApprovalWaitError::Persist(_) | ApprovalWaitError::AdmissionFull => {
            GatewayError::ApprovalUnavailable
        }
        ApprovalWaitError::Bus(_) | ApprovalWaitError::Store(_) => GatewayError::Internal,
    }
}

/// Everything the gateway is wired with.
pub struct GatewayDeps {
    /// Policy snapshot.
    pub policy: Arc<dyn PolicyProvider>,
    /// Asynchronous audit intake.
    pub auditor: Arc<dyn Auditor>,
    /// Reliability-wrapped downstream executor.
    pub executor: Arc<dyn ActionExecutor>,
    /// HITL coordinator.
    pub approvals: Arc<ApprovalCoordinator>,
    /// Risk analyzer.
    pub risk: RiskAnalyzer,
    /// Kill-switch membership.
    pub blocked: Arc<dyn MembershipView>,
    /// Quarantine membership.
    pub quarantined: Arc<dyn MembershipView>,
    /// Sandbox membership.
    pub sandboxed: Arc<dyn MembershipView>,
}

/// The policy enforcement point.
pub struct Gateway {
    policy: Arc<dyn PolicyProvider>,
    auditor: Arc<dyn Auditor>,
    executor: Arc<dyn ActionExecutor>,
    approvals: Arc<ApprovalCoordinator>,
    risk: RiskAnalyzer,
    blocked: Arc<dyn MembershipView>,
    quarantined: Arc<dyn MembershipView>,
    sandboxed: Arc<dyn MembershipView>,
}

impl Gateway {
    /// Assembles the pipeline.
    #[must_use]
    pub fn new(deps: GatewayDeps) -> Self {
        Self {
            policy: deps.policy,
            auditor: deps.auditor,
            executor: deps.executor,
            approvals: deps.approvals,
            risk: deps.risk,
            blocked: deps.blocked,
            quarantined: deps.quarantined,
            sandboxed: deps.sandboxed,
        }
    }

    /// Runs one request through the pipeline.
    ///
    /// Returns the opaque response bytes on success. Exactly one terminal
    /// audit event is emitted on every path.
    ///
    /// # Errors
    ///
    /// [`GatewayError`] describing the refusal or failure.
    pub async fn process_action(
        &self,
        claims: &CustomClaims,
        agent_id: &str,
        capability_id: &str,
        payload: &[u8],
        trace_id: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        let start = Instant::now();
        let mut event = AuditEvent::begin(trace_id, agent_id, capability_id, payload);

        // Authorization: the capability must be granted in the verified
        // claims, or the caller holds the admin scope.
        if !claims.allows(capability_id) {
            warn!(agent_id, capability_id, "insufficient scope");
            return Err(self.fail(
                event,
                start,
                GatewayError::InsufficientScope(capability_id.to_string()),
            ));
        }

        // Kill switch outranks everything, including an ALLOW policy.
        if self.blocked.contains(agent_id) {
            warn!(agent_id, "kill switch engaged, request blocked");
            return Err(self.fail(event, start, GatewayError::AgentBlocked));
        }

        let policy = self.policy.lookup(agent_id, capability_id);
        event.policy_id = policy.id.clone();
        let effect = policy.decide();

        if effect == PolicyEffect::Deny {
            warn!(agent_id, capability_id, "access denied by policy");
            return Err(self.fail(
                event,
                start,
                GatewayError::PolicyDenied(capability_id.to_string()),
            ));
        }

        // Risk elevation comes before the sandbox branch: a dangerous
        // request must reach the reviewer queue even from a sandboxed
        // agent.
        if effect == PolicyEffect::Quarantine
            || self.quarantined.contains(agent_id)
            || self.risk.required(&policy, payload)
        {
            info!(agent_id, capability_id, "high risk action, suspending for review");
            return self
                .run_approval(event, start, agent_id, capability_id, payload)
                .await;
        }

        if effect == PolicyEffect::Sandbox || self.sandboxed.contains(agent_id) {
            debug!(agent_id, "executing in sandbox mode");
            return Ok(self.intercept_sandbox(event, start));
        }

        self.execute_live(event, start, capability_id, payload).await
    }

    /// Suspension branch: park until the reviewer decides, then execute or
    /// fail accordingly.
    async fn run_approval(
        &self,
        mut event: AuditEvent,
        start: Instant,
        agent_id: &str,
        capability_id: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, GatewayError> {
        // Non-terminal marker so the audit trail shows the suspension even
        // while the reviewer is still deciding.
        let mut pending = event.clone();
        pending.id = uuid::Uuid::new_v4().to_string();
        pending.status = AuditStatus::QuarantinePending;
        pending.duration_ms = duration_ms(start);
        self.auditor.log(pending);

        match self
            .approvals
            .suspend_and_wait(agent_id, capability_id, payload)
            .await
        {
            Ok((ApprovalOutcome::Approved, execution_id)) => {
                debug!(execution_id = %execution_id, "approved, executing");
                self.execute_live(event, start, capability_id, payload).await
            }
            Ok((ApprovalOutcome::Rejected, _)) => {
                Err(self.fail(event, start, GatewayError::ApprovalRejected))
            }
            Err(wait_error) => {
                let gateway_error = map_approval_error(&wait_error);
                warn!(error = %wait_error, "approval wait failed");
                event.error = Some(wait_error.to_string());
                Err(self.fail(event, start, gateway_error))
            }
        }
    }

    /// Sandbox branch: synthesize a success, record the intent, never touch
    /// downstream.
    fn intercept_sandbox(&self, mut event: AuditEvent, start: Instant) -> Vec<u8> {
        let response = serde_json::json!({
            "status": "simulated_success",
            "details": "action captured in sandbox mode, no real impact made",
        });
        // Serialization of a literal object cannot fail.
        let bytes = serde_json::to_vec(&response).unwrap_or_default();

        event.mode = ExecutionMode::Sandbox;
        event.status = AuditStatus::Intercepted;
        event.response = Some(response);
        event.duration_ms = duration_ms(start);
        self.auditor.log(event);

        bytes
    }

    /// Live branch: call downstream through the reliability wrapper.
    async fn execute_live(
        &self,
        mut event: AuditEvent,
        start: Instant,
        capability_id: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, GatewayError> {
        match self.executor.call(capability_id, payload).await {
            Ok(bytes) => {
                event.status = AuditStatus::Success;
                event.response = serde_json::from_slice(&bytes).ok();
                event.duration_ms = duration_ms(start);
                self.auditor.log(event);
                Ok(bytes)
            }
            Err(connector_error) => {
                event.error = Some(connector_error.to_string());
                Err(self.fail(event, start, map_connector_error(connector_error)))
            }
        }
    }

    /// Terminal failure: stamp the event with the error's audit status,
    /// emit it, and hand the error back.
    fn fail(&self, mut event: AuditEvent, start: Instant, error: GatewayError) -> GatewayError {
        event.status = error.audit_status();
        if event.error.is_none() {
            event.error = Some(error.to_string());
        }
        event.duration_ms = duration_ms(start);
        self.auditor.log(event);
        error
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}
