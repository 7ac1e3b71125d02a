//! Token-bucket rate limiter.
//!
//! Shared by every request handler in front of the downstream connector.
//! Waiting callers sleep until a token becomes available or their wait
//! budget runs out; the bucket itself never blocks longer than one refill
//! computation under the lock.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A token bucket refilled continuously at `rate_per_sec`.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate_per_sec: f64,
    burst: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// `rate_per_sec` must be positive; `burst` is the bucket capacity and
    /// the number of requests that can pass without waiting.
    #[must_use]
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            rate_per_sec: rate_per_sec.max(f64::MIN_POSITIVE),
            burst,
        }
    }

    /// Takes one token if available, returning how long to wait otherwise.
    fn try_take(&self) -> Result<(), Duration> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }
        let deficit = 1.0 - state.tokens;
        Err(Duration::from_secs_f64(deficit / self.rate_per_sec))
    }

    /// Waits for one token, giving up after `max_wait`.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` when no token became available within the budget.
    pub async fn wait(&self, max_wait: Duration) -> Result<(), ()> {
        let deadline = Instant::now() + max_wait;
        loop {
            match self.try_take() {
                Ok(()) => return Ok(()),
                Err(needed) => {
                    let now = Instant::now();
                    if now + needed > deadline {
                        return Err(());
                    }
                    tokio::time::sleep(needed).await;
                }
            }
        }
    }
}
