//! Circuit breaker guarding the downstream connector.
//!
//! Closed → Open after more than `failure_threshold` consecutive failed
//! calls; Open → HalfOpen once `open_timeout` elapses; HalfOpen admits up to
//! `half_open_probes` concurrent probes — one probe success closes the
//! breaker, one probe failure reopens it.
//!
//! A "call" here is one wrapped execution including its retries, so a
//! downstream that recovers mid-retry never counts against the breaker.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures tolerated before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub open_timeout: Duration,
    /// Concurrent probes admitted while half-open.
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            half_open_probes: 3,
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { probes: u32 },
}

/// Shared breaker; all callers of one connector go through the same
/// instance.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Asks to perform one call.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` when the breaker is open (or half-open with all
    /// probe slots taken); the caller must not touch downstream.
    pub fn try_acquire(&self) -> Result<(), ()> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        match &mut *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { opened_at } => {
                if opened_at.elapsed() < self.config.open_timeout {
                    return Err(());
                }
                info!("circuit breaker half-open, probing downstream");
                *state = BreakerState::HalfOpen { probes: 1 };
                Ok(())
            }
            BreakerState::HalfOpen { probes } => {
                if *probes >= self.config.half_open_probes {
                    return Err(());
                }
                *probes += 1;
                Ok(())
            }
        }
    }

    /// Reports a successful call.
    pub fn record_success(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        match &*state {
            BreakerState::Closed { .. } => {
                *state = BreakerState::Closed {
                    consecutive_failures: 0,
                };
            }
            BreakerState::HalfOpen { .. } => {
                info!("circuit breaker closed after successful probe");
                *state = BreakerState::Closed {
                    consecutive_failures: 0,
                };
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Reports a failed call.
    pub fn record_failure(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures > self.config.failure_threshold {
                    warn!(
                        failures = *consecutive_failures,
                        "circuit breaker opened"
                    );
                    *state = BreakerState::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            BreakerState::HalfOpen { .. } => {
                warn!("probe failed, circuit breaker re-opened");
                *state = BreakerState::Open {
                    opened_at: Instant::now(),
                };
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// True while calls are being refused.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(
            &*self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            BreakerState::Open { .. }
        )
    }
}
