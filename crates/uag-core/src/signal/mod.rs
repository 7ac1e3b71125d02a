//! Signal plane abstraction.
//!
//! The runtime state plane (kill switch, sandbox, quarantine, policy
//! refresh, approval decisions) is propagated over a pub/sub channel plus a
//! set-valued shared store. The core consumes both through [`SignalBus`] and
//! never talks to a concrete broker; [`MemorySignalBus`] is the in-process
//! implementation used by tests and single-node deployments.
//!
//! Delivery is at-most-once. Publishers never block on subscribers, and a
//! disconnected subscriber simply misses messages; every consumer is
//! expected to reconcile against durable truth after (re)subscribing.

mod channels;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use channels::ChannelMap;
pub use memory::MemorySignalBus;

/// Errors surfaced by the signal plane.
#[derive(Debug, Error)]
pub enum SignalBusError {
    /// The bus could not be reached.
    #[error("signal bus unavailable: {0}")]
    Unavailable(String),

    /// The subscription fell behind and messages were dropped.
    ///
    /// Consumers treat this like a disconnect: resubscribe and resync from
    /// the durable store.
    #[error("subscription to '{channel}' lagged, {skipped} messages dropped")]
    Lagged {
        /// Channel whose stream lagged.
        channel: String,
        /// Number of messages lost.
        skipped: u64,
    },
}

/// One live message stream behind a [`Subscription`].
#[async_trait]
pub trait MessageStream: Send {
    /// Waits for the next message.
    ///
    /// Returns `Ok(None)` when the channel is closed for good.
    ///
    /// # Errors
    ///
    /// [`SignalBusError::Lagged`] when messages were dropped; the caller
    /// should resubscribe and resync.
    async fn next(&mut self) -> Result<Option<String>, SignalBusError>;
}

/// An active subscription to one channel.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    channel: String,
    stream: Box<dyn MessageStream>,
}

impl Subscription {
    /// Wraps a message stream for `channel`.
    #[must_use]
    pub fn new(channel: impl Into<String>, stream: Box<dyn MessageStream>) -> Self {
        Self {
            channel: channel.into(),
            stream,
        }
    }

    /// The channel this subscription listens on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next message. See [`MessageStream::next`].
    ///
    /// # Errors
    ///
    /// Propagates the underlying stream error.
    pub async fn next(&mut self) -> Result<Option<String>, SignalBusError> {
        self.stream.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Pub/sub channels plus a set-valued store, as consumed by the core.
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Publishes `payload` on `channel`, at-most-once.
    ///
    /// # Errors
    ///
    /// [`SignalBusError::Unavailable`] when the bus cannot be reached.
    /// Callers on the hot path log and proceed; state converges through
    /// warm-up.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), SignalBusError>;

    /// Opens a subscription to `channel`.
    ///
    /// A successful return confirms the subscription is live; messages
    /// published afterwards will be observed in publisher-send order.
    ///
    /// # Errors
    ///
    /// [`SignalBusError::Unavailable`] when the bus cannot be reached.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, SignalBusError>;

    /// Adds `members` to the set at `key`.
    ///
    /// # Errors
    ///
    /// [`SignalBusError::Unavailable`] when the bus cannot be reached.
    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), SignalBusError>;

    /// Removes `members` from the set at `key`.
    ///
    /// # Errors
    ///
    /// [`SignalBusError::Unavailable`] when the bus cannot be reached.
    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), SignalBusError>;

    /// Returns all members of the set at `key`.
    ///
    /// # Errors
    ///
    /// [`SignalBusError::Unavailable`] when the bus cannot be reached.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, SignalBusError>;

    /// Returns the cardinality of the set at `key`.
    ///
    /// # Errors
    ///
    /// [`SignalBusError::Unavailable`] when the bus cannot be reached.
    async fn set_card(&self, key: &str) -> Result<usize, SignalBusError>;

    /// Tries to take the single-writer lock at `key` for `ttl`.
    ///
    /// Returns `true` only for the one caller that acquired it; the lock
    /// expires on its own, there is no release operation.
    ///
    /// # Errors
    ///
    /// [`SignalBusError::Unavailable`] when the bus cannot be reached.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool, SignalBusError>;
}
