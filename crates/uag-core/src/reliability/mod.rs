//! Reliability wrapper around the downstream connector.
//!
//! Applies, in order: a shared token-bucket rate limit, a circuit breaker,
//! and a bounded retry loop with throttle-aware backoff. Each attempt runs
//! under its own timeout. The wrapper implements [`ActionExecutor`] itself,
//! so it drops in wherever a bare connector would.

mod breaker;
mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use rate_limit::TokenBucket;

use crate::connector::{ActionExecutor, ConnectorError};

/// Tuning for the whole wrapper.
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// Sustained request rate towards downstream.
    pub rate_limit_per_sec: f64,
    /// Burst capacity of the token bucket.
    pub rate_limit_burst: u32,
    /// How long a caller may wait for a token before failing with
    /// [`ConnectorError::RateLimited`].
    pub rate_limit_max_wait: Duration,
    /// Circuit breaker tuning.
    pub breaker: BreakerConfig,
    /// Attempts per call, including the first.
    pub retry_attempts: u32,
    /// Base delay of the exponential backoff.
    pub retry_base_delay: Duration,
    /// Timeout applied to every individual attempt.
    pub attempt_timeout: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: 100.0,
            rate_limit_burst: 20,
            rate_limit_max_wait: Duration::from_secs(1),
            breaker: BreakerConfig::default(),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Backoff before the next attempt. Downstream throttle hints win over the
/// exponential schedule.
fn retry_delay(base: Duration, attempt: u32, error: &ConnectorError) -> Duration {
    if let ConnectorError::Throttled { retry_after } = error {
        return *retry_after;
    }
    base.saturating_mul(1 << attempt.min(16))
}

/// Rate limit + breaker + retry around an inner executor.
pub struct ReliabilityWrapper {
    inner: Arc<dyn ActionExecutor>,
    limiter: TokenBucket,
    breaker: CircuitBreaker,
    config: ReliabilityConfig,
}

impl ReliabilityWrapper {
    /// Wraps `inner` with the given tuning.
    #[must_use]
    pub fn new(inner: Arc<dyn ActionExecutor>, config: ReliabilityConfig) -> Self {
        Self {
            inner: Arc::clone(&inner),
            limiter: TokenBucket::new(config.rate_limit_per_sec, config.rate_limit_burst),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            config,
        }
    }

    /// True while the breaker refuses calls.
    #[must_use]
    pub fn breaker_open(&self) -> bool {
        self.breaker.is_open()
    }

    async fn attempt(&self, capability_id: &str, payload: &[u8]) -> Result<Vec<u8>, ConnectorError> {
        match tokio::time::timeout(
            self.config.attempt_timeout,
            self.inner.call(capability_id, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout),
        }
    }
}

#[async_trait]
impl ActionExecutor for ReliabilityWrapper {
    async fn call(&self, capability_id: &str, payload: &[u8]) -> Result<Vec<u8>, ConnectorError> {
        if self
            .limiter
            .wait(self.config.rate_limit_max_wait)
            .await
            .is_err()
        {
            warn!(capability_id, "rate limit exceeded");
            return Err(ConnectorError::RateLimited);
        }

        if self.breaker.try_acquire().is_err() {
            warn!(capability_id, "circuit breaker open, refusing call");
            return Err(ConnectorError::BreakerOpen);
        }

        // One breaker verdict per wrapped call: a downstream that recovers
        // on a later attempt counts as a success.
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = ConnectorError::Timeout;

        for attempt in 0..attempts {
            match self.attempt(capability_id, payload).await {
                Ok(bytes) => {
                    self.breaker.record_success();
                    return Ok(bytes);
                }
                Err(e) => {
                    debug!(
                        capability_id,
                        attempt = attempt + 1,
                        error = %e,
                        "connector attempt failed"
                    );
                    last_error = e;
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(retry_delay(
                    self.config.retry_base_delay,
                    attempt,
                    &last_error,
                ))
                .await;
            }
        }

        self.breaker.record_failure();
        Err(last_error)
    }
}
