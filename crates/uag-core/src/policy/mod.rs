//! In-memory policy snapshot.
//!
//! The hot path never touches the durable store: lookups hit a snapshot map
//! keyed by `"{agent_id}:{capability_id}"`. Refreshes build a complete new
//! map and swap it in one step, so concurrent lookups observe either the old
//! or the new snapshot in full — never a half-applied reload.
//!
//! Precedence on lookup: exact agent match, then the `"*"` wildcard, then a
//! synthetic deny. A lookup never comes back empty.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::{Policy, WILDCARD_AGENT};
use crate::signal::SignalBus;
use crate::store::{StateStore, StoreError};

/// Pause before retrying a failed refresh-channel subscribe.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Pause before re-subscribing after a dropped stream.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Source of the full policy list for refreshes.
#[async_trait]
pub trait PolicyLoader: Send + Sync {
    /// Returns every stored policy.
    ///
    /// # Errors
    ///
    /// [`StoreError`] when the store is unreachable.
    async fn list_all(&self) -> Result<Vec<Policy>, StoreError>;
}

/// [`PolicyLoader`] over a [`StateStore`].
pub struct StorePolicyLoader(pub Arc<dyn StateStore>);

#[async_trait]
impl PolicyLoader for StorePolicyLoader {
    async fn list_all(&self) -> Result<Vec<Policy>, StoreError> {
        self.0.list_policies().await
    }
}

/// Snapshot cache of all policies.
pub struct PolicyStore {
    snapshot: RwLock<Arc<HashMap<String, Policy>>>,
    loader: Arc<dyn PolicyLoader>,
}

fn key_for(agent_id: &str, capability_id: &str) -> String {
    format!("{agent_id}:{capability_id}")
}

impl PolicyStore {
    /// Creates an empty store; call [`PolicyStore::refresh`] before serving.
    #[must_use]
    pub fn new(loader: Arc<dyn PolicyLoader>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            loader,
        }
    }

    /// Resolves the effective policy for `(agent_id, capability_id)`.
    ///
    /// Exact match first, wildcard second, synthetic deny last.
    #[must_use]
    pub fn lookup(&self, agent_id: &str, capability_id: &str) -> Policy {
        let snapshot = Arc::clone(
            &self
                .snapshot
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );

        if let Some(policy) = snapshot.get(&key_for(agent_id, capability_id)) {
            return policy.clone();
        }
        if let Some(policy) = snapshot.get(&key_for(WILDCARD_AGENT, capability_id)) {
            return policy.clone();
        }
        Policy::default_deny(agent_id, capability_id)
    }

    /// Number of cached policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// True when no policies are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reloads every policy and swaps the snapshot whole.
    ///
    /// # Errors
    ///
    /// [`StoreError`] when the load fails; the previous snapshot stays
    /// active.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let policies = self.loader.list_all().await?;

        let mut next = HashMap::with_capacity(policies.len());
        for policy in policies {
            next.insert(key_for(&policy.agent_id, &policy.capability_id), policy);
        }
        let count = next.len();

        *self
            .snapshot
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(next);

        info!(count, "policy cache refreshed");
        Ok(())
    }

    /// Listens on the policy-update channel and refreshes on every message.
    ///
    /// Any non-empty payload triggers a reload; refresh failures are logged
    /// and the previous snapshot keeps serving. The loop resubscribes on
    /// stream loss (refreshing immediately after, since a reload may have
    /// been missed) and exits on cancellation.
    pub async fn run_refresh_listener(
        &self,
        bus: Arc<dyn SignalBus>,
        channel: &str,
        cancel: CancellationToken,
    ) {
        info!(channel, "policy refresh listener starting");

        loop {
            let mut subscription = tokio::select! {
                () = cancel.cancelled() => break,
                result = bus.subscribe(channel) => match result {
                    Ok(sub) => sub,
                    Err(e) => {
                        error!(channel, error = %e, "subscribe failed");
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                        }
                    }
                },
            };

            if let Err(e) = self.refresh().await {
                error!(error = %e, "policy resync failed after subscribe");
            }

            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    message = subscription.next() => match message {
                        Ok(Some(_)) => {
                            if let Err(e) = self.refresh().await {
                                error!(error = %e, "policy refresh failed on signal");
                            }
                        }
                        Ok(None) => {
                            warn!(channel, "policy channel closed, reconnecting");
                            break;
                        }
                        Err(e) => {
                            warn!(channel, error = %e, "policy stream lost, reconnecting");
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

        info!(channel, "policy refresh listener stopped");
    }
}
