//! Downstream connector seam.
//!
//! Everything the gateway executes goes through [`ActionExecutor`]. The
//! reliability wrapper implements the same trait around an inner executor,
//! so transports, decorators and test doubles compose freely.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng as _;
use thiserror::Error;

/// Errors from the execution layer.
///
/// `RateLimited` and `BreakerOpen` are produced only by the reliability
/// wrapper; transports report the remaining variants.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The gateway-side token bucket is exhausted.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The circuit breaker is open; downstream is not being called.
    #[error("circuit breaker open")]
    BreakerOpen,

    /// Downstream asked us to back off.
    #[error("throttled, retry after {retry_after:?}")]
    Throttled {
        /// How long the downstream asked us to wait.
        retry_after: Duration,
    },

    /// One attempt exceeded its timeout.
    #[error("connector call timed out")]
    Timeout,

    /// The connector does not implement this capability.
    #[error("capability {0} not supported by connector")]
    Unsupported(String),

    /// The connector could not be reached.
    #[error("connector unavailable: {0}")]
    Unavailable(String),

    /// The downstream system reported a failure.
    #[error("connector returned error: {0}")]
    Upstream(String),
}

/// Executes one capability call against a downstream system.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Invokes `capability_id` with `payload` and returns the opaque
    /// response bytes.
    ///
    /// # Errors
    ///
    /// [`ConnectorError`] describing the failure.
    async fn call(&self, capability_id: &str, payload: &[u8]) -> Result<Vec<u8>, ConnectorError>;
}

/// Built-in connector with canned responses, for demos and tests.
///
/// `unstable.service` always fails, which is how the breaker and retry
/// paths get exercised end to end.
#[derive(Debug, Clone)]
pub struct MockConnector {
    simulate_latency: bool,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Connector with 50-300 ms of simulated integration latency.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            simulate_latency: true,
        }
    }

    /// Connector that answers immediately, for tests.
    #[must_use]
    pub const fn instant() -> Self {
        Self {
            simulate_latency: false,
        }
    }
}

#[async_trait]
impl ActionExecutor for MockConnector {
    async fn call(&self, capability_id: &str, _payload: &[u8]) -> Result<Vec<u8>, ConnectorError> {
        if self.simulate_latency {
            let millis = rand::thread_rng().gen_range(50..300);
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }

        match capability_id {
            "unstable.service" => Err(ConnectorError::Upstream("service internal error".into())),
            "jira.ticket.delete" => Ok(
                br#"{"status": "deleted", "integration": "jira", "id": "DEV-101"}"#.to_vec(),
            ),
            "slack.message.send" => Ok(
                br##"{"status": "sent", "integration": "slack", "channel": "#general"}"##.to_vec(),
            ),
            "db.query.execute" => Ok(
                br#"{"status": "success", "rows_affected": 0, "data": [{"id": 1, "balance": 5000}]}"#
                    .to_vec(),
            ),
            "crm.lead.create" => Ok(br#"{"status": "created", "lead_id": "L-990"}"#.to_vec()),
            other => Err(ConnectorError::Unsupported(other.to_string())),
        }
    }
}
