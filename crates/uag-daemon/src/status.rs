//! Pipeline error to transport status mapping.
//!
//! Both endpoints speak the same taxonomy: the HTTP server uses the numeric
//! code as the response status, the RPC server carries it in
//! `ExecuteResponse.status_code`. The kind string is the only error detail
//! clients ever see on refusals.

use uag_core::pipeline::GatewayError;

/// Maps a pipeline failure to `(status code, machine-readable kind)`.
#[must_use]
pub fn error_status(error: &GatewayError) -> (u16, &'static str) {
    match error {
        GatewayError::InsufficientScope(_) | GatewayError::ApprovalSignal => {
            (403, "security_violation")
        }
        GatewayError::AgentBlocked => (403, "agent_blocked"),
        GatewayError::PolicyDenied(_) => (403, "access_denied"),
        GatewayError::ApprovalRejected => (403, "approval_rejected"),
        GatewayError::ApprovalTimeout => (403, "approval_timeout"),
        GatewayError::ApprovalUnavailable => (500, "approval_unavailable"),
        GatewayError::RateLimited => (429, "rate_limited"),
        GatewayError::BreakerOpen => (503, "downstream_unavailable"),
        GatewayError::Connector(_) => (502, "connector_error"),
        GatewayError::Internal => (500, "internal_error"),
    }
}
