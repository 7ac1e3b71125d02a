//! Two-tier eventually-consistent membership caches.
//!
//! One [`StateCache`] instance tracks one agent category (blocked,
//! quarantined or sandboxed). The hot path reads a local in-memory set; the
//! durable store is the source of truth; a shared set plus a broadcast
//! channel keep a fleet of gateways converged.
//!
//! # Coherence protocol
//!
//! - `init` loads the durable truth and bulk-replaces the local set, then —
//!   under a fleet-wide single-writer lock — hydrates the shared set if it
//!   is still empty. Only one instance across a cold-starting fleet performs
//!   the hydration.
//! - The listener subscribes to the category channel and re-runs `init`
//!   after every successful (re)subscribe, which closes the window between
//!   subscribing and loading. Missed messages during a disconnect are
//!   compensated by that resync; the store is authoritative.
//! - Signals are `"<agent_id>:<flag>"` with `true`/`on` adding and
//!   `false`/`off` removing. Malformed payloads are logged and skipped.
//!
//! # Invariants
//!
//! - `contains` takes a read lock only: O(1), allocation-free, never blocked
//!   longer than one map mutation.
//! - After a successful `init`, the local set is a superset of the durable
//!   truth at load time; listener deltas apply after the bulk replace.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::signal::{ChannelMap, SignalBus, SignalBusError};
use crate::store::StoreError;

/// TTL of the fleet-wide warm-up lock.
const WARMUP_LOCK_TTL: Duration = Duration::from_secs(30);

/// Pause before re-subscribing after a dropped stream.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Pause before retrying a failed subscribe.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Errors from cache warm-up.
#[derive(Debug, Error)]
pub enum StateCacheError {
    /// The durable store could not produce the membership list.
    #[error("failed to load membership from store: {0}")]
    Loader(#[from] StoreError),

    /// The shared set could not be hydrated.
    #[error(transparent)]
    Bus(#[from] SignalBusError),
}

/// Reads the durable truth for one membership category.
#[async_trait::async_trait]
pub trait MembershipLoader: Send + Sync {
    /// Returns every agent id currently in the category.
    ///
    /// # Errors
    ///
    /// [`StoreError`] when the store is unreachable.
    async fn load_all(&self) -> Result<Vec<String>, StoreError>;
}

/// The `(channel, set, lock)` triplet anchoring one cache in the signal
/// plane.
#[derive(Debug, Clone)]
pub struct CacheKeys {
    /// Broadcast channel carrying membership flips.
    pub channel: String,
    /// Shared set mirroring the membership.
    pub set_key: String,
    /// Single-writer warm-up lock.
    pub lock_key: String,
}

impl CacheKeys {
    /// Keys for the kill-switch (blocked agents) cache.
    #[must_use]
    pub fn blocked(map: &ChannelMap) -> Self {
        Self {
            channel: map.kill_switch_channel(),
            set_key: map.blocked_set(),
            lock_key: map.warmup_lock("blocked"),
        }
    }

    /// Keys for the sandbox cache.
    #[must_use]
    pub fn sandbox(map: &ChannelMap) -> Self {
        Self {
            channel: map.sandbox_channel(),
            set_key: map.sandbox_set(),
            lock_key: map.warmup_lock("sandbox"),
        }
    }

    /// Keys for the quarantine cache.
    #[must_use]
    pub fn quarantine(map: &ChannelMap) -> Self {
        Self {
            channel: map.quarantine_channel(),
            set_key: map.quarantine_set(),
            lock_key: map.warmup_lock("quarantine"),
        }
    }
}

/// One membership cache instance.
pub struct StateCache {
    name: &'static str,
    keys: CacheKeys,
    local: RwLock<HashSet<String>>,
    bus: Arc<dyn SignalBus>,
    loader: Arc<dyn MembershipLoader>,
}

impl StateCache {
    /// Creates a cache for the category identified by `keys`. `name` only
    /// labels log lines.
    #[must_use]
    pub fn new(
        name: &'static str,
        keys: CacheKeys,
        bus: Arc<dyn SignalBus>,
        loader: Arc<dyn MembershipLoader>,
    ) -> Self {
        Self {
            name,
            keys,
            local: RwLock::new(HashSet::new()),
            bus,
            loader,
        }
    }

    /// Hot-path membership probe.
    #[must_use]
    pub fn contains(&self, agent_id: &str) -> bool {
        self.local
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(agent_id)
    }

    /// Number of members currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.local
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// True when no members are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a member to the local set immediately, ahead of signal
    /// propagation.
    pub fn insert(&self, agent_id: &str) {
        self.local
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(agent_id.to_string());
    }

    /// Removes a member from the local set.
    pub fn remove(&self, agent_id: &str) {
        self.local
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(agent_id);
    }

    /// Warm-up: load the durable truth, replace the local set, and hydrate
    /// the shared set if this instance wins the single-writer lock.
    ///
    /// # Errors
    ///
    /// [`StateCacheError::Loader`] when the store read fails (fatal at first
    /// boot; the listener retries on reconnect), [`StateCacheError::Bus`]
    /// when shared-set hydration fails after the lock was won.
    pub async fn init(&self) -> Result<(), StateCacheError> {
        let ids = self.loader.load_all().await?;

        {
            let mut local = self
                .local
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            local.clear();
            local.extend(ids.iter().cloned());
        }
        debug!(cache = self.name, members = ids.len(), "local set replaced");

        // Shared-set hydration runs under the fleet lock; losing the race
        // (or failing to reach the bus at all) just means another instance
        // owns it.
        match self
            .bus
            .acquire_lock(&self.keys.lock_key, WARMUP_LOCK_TTL)
            .await
        {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => {
                warn!(cache = self.name, error = %e, "warm-up lock unavailable");
                return Ok(());
            }
        }

        let shared_count = match self.bus.set_card(&self.keys.set_key).await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    cache = self.name,
                    key = %self.keys.set_key,
                    error = %e,
                    "could not check shared set size, proceeding with warm-up"
                );
                0
            }
        };

        if shared_count == 0 && !ids.is_empty() {
            info!(
                cache = self.name,
                key = %self.keys.set_key,
                count = ids.len(),
                "shared set empty, hydrating from store"
            );
            self.bus.set_add(&self.keys.set_key, &ids).await?;
        }

        Ok(())
    }

    /// Resilient listener loop. Runs until `cancel` fires.
    ///
    /// Each successful (re)subscribe triggers a full [`StateCache::init`]
    /// resync before deltas are applied, so a disconnect can never leave a
    /// stale removal or a missed kill signal behind.
    pub async fn run_listener(&self, cancel: CancellationToken) {
        info!(cache = self.name, channel = %self.keys.channel, "listener starting");

        loop {
            let mut subscription = tokio::select! {
                () = cancel.cancelled() => break,
                result = self.bus.subscribe(&self.keys.channel) => match result {
                    Ok(sub) => sub,
                    Err(e) => {
                        error!(cache = self.name, error = %e, "subscribe failed");
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                        }
                    }
                },
            };

            if let Err(e) = self.init().await {
                error!(cache = self.name, error = %e, "resync failed after subscribe");
            }

            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    message = subscription.next() => match message {
                        Ok(Some(payload)) => self.apply_signal(&payload),
                        Ok(None) => {
                            warn!(cache = self.name, "signal channel closed, reconnecting");
                            break;
                        }
                        Err(e) => {
                            warn!(cache = self.name, error = %e, "signal stream lost, reconnecting");
                            break;
                        }
                    },
                }
            }

            drop(subscription);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }

        info!(cache = self.name, "listener stopped");
    }

    /// Applies one `"<agent_id>:<flag>"` signal to the local set.
    fn apply_signal(&self, payload: &str) {
        let Some((agent_id, flag)) = payload.split_once(':') else {
            warn!(cache = self.name, payload, "invalid signal format, skipping");
            return;
        };

        match flag {
            "true" | "on" => {
                self.insert(agent_id);
                info!(cache = self.name, agent_id, "membership added by signal");
            }
            "false" | "off" => {
                self.remove(agent_id);
                info!(cache = self.name, agent_id, "membership removed by signal");
            }
            _ => {
                warn!(cache = self.name, payload, "invalid signal flag, skipping");
            }
        }
    }
}

impl std::fmt::Debug for StateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCache")
            .field("name", &self.name)
            .field("keys", &self.keys)
            .field("members", &self.len())
            .finish_non_exhaustive()
    }
}
