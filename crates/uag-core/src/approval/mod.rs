//! Human-in-the-loop suspension.
//!
//! A request that needs review is persisted as a `PENDING`
//! [`ApprovalRequest`] and the calling handler parks on a per-execution
//! signal channel until a reviewer decides or the wait times out. The
//! subscription is opened *before* the row is persisted, so a decision can
//! never slip between the request becoming visible and the gateway
//! listening for it.
//!
//! The decision signal is treated as a wake-up only: on receipt the
//! coordinator re-reads the persisted row keyed by `execution_id` and
//! requires signal and store to agree. A forged or garbled signal is a
//! security failure, not a decision.
//!
//! Suspended requests each hold a handler; an admission semaphore caps how
//! many may be parked at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{ApprovalRequest, ApprovalStatus};
use crate::signal::{ChannelMap, SignalBus, SignalBusError};
use crate::store::{StateStore, StoreError};

/// Default reviewer wait window.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default cap on concurrently suspended requests.
pub const DEFAULT_MAX_SUSPENDED: usize = 64;

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    /// Hard timeout for one suspension.
    pub wait_timeout: Duration,
    /// Maximum concurrently suspended requests.
    pub max_suspended: usize,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            max_suspended: DEFAULT_MAX_SUSPENDED,
        }
    }
}

/// Outcome of a completed suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Reviewer approved; the caller may execute.
    Approved,
    /// Reviewer rejected; the caller must fail the request.
    Rejected,
}

/// Failures of the suspension protocol.
#[derive(Debug, Error)]
pub enum ApprovalWaitError {
    /// The pending request could not be persisted; nothing was suspended.
    #[error("failed to persist approval request: {0}")]
    Persist(#[source] StoreError),

    /// Too many requests are already suspended.
    #[error("approval admission limit reached")]
    AdmissionFull,

    /// The reviewer did not answer within the window.
    #[error("human-in-the-loop timeout, operator did not respond in time")]
    Timeout,

    /// The signal did not match the persisted decision.
    #[error("unexpected signal from approval plane: {0:?}")]
    InvalidSignal(String),

    /// The signal plane failed mid-wait.
    #[error(transparent)]
    Bus(#[from] SignalBusError),

    /// The decision re-read failed.
    #[error("failed to read decided approval: {0}")]
    Store(#[source] StoreError),
}

/// Suspends hot-path requests and relays reviewer decisions.
pub struct ApprovalCoordinator {
    store: Arc<dyn StateStore>,
    bus: Arc<dyn SignalBus>,
    channels: ChannelMap,
    admission: Arc<Semaphore>,
    wait_timeout: Duration,
}

impl ApprovalCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<dyn SignalBus>,
        channels: ChannelMap,
        config: ApprovalConfig,
    ) -> Self {
        Self {
            store,
            bus,
            channels,
            admission: Arc::new(Semaphore::new(config.max_suspended)),
            wait_timeout: config.wait_timeout,
        }
    }

    /// Persists a pending approval and waits for the decision.
    ///
    /// Returns the outcome together with the execution id (which links the
    /// audit record to the approval row).
    ///
    /// # Errors
    ///
    /// [`ApprovalWaitError`] — on timeout the row intentionally stays
    /// `PENDING` so the reviewer queue still shows what was attempted.
    pub async fn suspend_and_wait(
        &self,
        agent_id: &str,
        capability_id: &str,
        payload: &[u8],
    ) -> Result<(ApprovalOutcome, String), ApprovalWaitError> {
        let Ok(_permit) = self.admission.clone().try_acquire_owned() else {
            warn!(agent_id, capability_id, "approval admission limit reached");
            return Err(ApprovalWaitError::AdmissionFull);
        };

        let execution_id = Uuid::new_v4().to_string();
        let channel = self.channels.approval_channel(&execution_id);

        // Subscribe first: the row must not be reviewer-visible before the
        // wait point exists.
        let mut subscription = self.bus.subscribe(&channel).await?;

        let now = Utc::now();
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.clone(),
            agent_id: agent_id.to_string(),
            capability_id: capability_id.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            status: ApprovalStatus::Pending,
            reviewer_id: None,
            comment: None,
            created_at: now,
            updated_at: now,
        };
        self.store
            .create_approval(&request)
            .await
            .map_err(ApprovalWaitError::Persist)?;

        warn!(
            execution_id = %execution_id,
            agent_id,
            capability_id,
            "human-in-the-loop: operation suspended"
        );

        let message = match tokio::time::timeout(self.wait_timeout, subscription.next()).await {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => {
                return Err(ApprovalWaitError::Bus(SignalBusError::Unavailable(
                    "approval channel closed".into(),
                )));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!(execution_id = %execution_id, "human-in-the-loop timeout");
                return Err(ApprovalWaitError::Timeout);
            }
        };

        // The signal only wakes us; the store is the authority on what was
        // decided.
        let stored = self
            .store
            .approval_by_execution(&execution_id)
            .await
            .map_err(ApprovalWaitError::Store)?;

        match (message.as_str(), stored.status) {
            ("APPROVED", ApprovalStatus::Approved) => {
                info!(execution_id = %execution_id, "human-in-the-loop: operation approved");
                Ok((ApprovalOutcome::Approved, execution_id))
            }
            ("REJECTED", ApprovalStatus::Rejected) => {
                warn!(execution_id = %execution_id, "human-in-the-loop: operation rejected");
                Ok((ApprovalOutcome::Rejected, execution_id))
            }
            _ => {
                warn!(
                    execution_id = %execution_id,
                    signal = %message,
                    stored = %stored.status,
                    "approval signal does not match persisted decision"
                );
                Err(ApprovalWaitError::InvalidSignal(message))
            }
        }
    }

    /// Records a reviewer decision and wakes the suspended request.
    ///
    /// The conditional store update is the one-shot gate; only the winning
    /// decision publishes a signal.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyProcessed`] when another reviewer decided
    /// first, [`StoreError::NotFound`] for an unknown approval id.
    pub async fn decide(
        &self,
        approval_id: &str,
        decision: ApprovalStatus,
        reviewer_id: &str,
        comment: Option<&str>,
    ) -> Result<String, StoreError> {
        let execution_id = self
            .store
            .decide_approval(approval_id, decision, reviewer_id, comment)
            .await?;

        let channel = self.channels.approval_channel(&execution_id);
        if let Err(e) = self.bus.publish(&channel, &decision.to_string()).await {
            // The suspended request will time out and the reviewer can see
            // the decided row; nothing is lost, only delayed.
            warn!(execution_id = %execution_id, error = %e, "failed to publish approval decision");
        }
        Ok(execution_id)
    }

    /// Number of suspension slots currently free.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.admission.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::MemorySignalBus;
    use crate::store::SqliteStateStore;

    fn coordinator(config: ApprovalConfig) -> (ApprovalCoordinator, Arc<SqliteStateStore>) {
        let store = Arc::new(SqliteStateStore::in_memory().unwrap());
        let bus = Arc::new(MemorySignalBus::new());
        let coordinator = ApprovalCoordinator::new(
            Arc::clone(&store) as Arc<dyn StateStore>,
            bus as Arc<dyn SignalBus>,
            ChannelMap::new("test"),
            config,
        );
        (coordinator, store)
    }

    /// Polls the reviewer queue until the suspended request's row appears.
    async fn wait_for_pending(store: &SqliteStateStore) -> ApprovalRequest {
        for _ in 0..200 {
            if let Some(approval) = store.list_pending_approvals().await.unwrap().pop() {
                return approval;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("approval was never persisted");
    }

    #[tokio::test]
    async fn approved_decision_completes_the_wait() {
        let (coordinator, store) = coordinator(ApprovalConfig::default());
        let coordinator = Arc::new(coordinator);

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .suspend_and_wait("a1", "jira.ticket.delete", br#"{"amount":5000}"#)
                    .await
            })
        };

        // Find the pending row the way the console would.
        let approval = wait_for_pending(&store).await;
        assert_eq!(approval.status, ApprovalStatus::Pending);

        coordinator
            .decide(&approval.id, ApprovalStatus::Approved, "reviewer-1", None)
            .await
            .unwrap();

        let (outcome, execution_id) = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, ApprovalOutcome::Approved);
        assert_eq!(execution_id, approval.execution_id);
    }

    #[tokio::test]
    async fn rejected_decision_completes_the_wait() {
        let (coordinator, store) = coordinator(ApprovalConfig::default());
        let coordinator = Arc::new(coordinator);

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .suspend_and_wait("a1", "jira.ticket.delete", b"{}")
                    .await
            })
        };

        let approval = wait_for_pending(&store).await;
        coordinator
            .decide(
                &approval.id,
                ApprovalStatus::Rejected,
                "reviewer-1",
                Some("too risky"),
            )
            .await
            .unwrap();

        let (outcome, _) = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, ApprovalOutcome::Rejected);
    }

    #[tokio::test]
    async fn timeout_leaves_the_request_pending() {
        let (coordinator, store) = coordinator(ApprovalConfig {
            wait_timeout: Duration::from_millis(50),
            ..Default::default()
        });

        let result = coordinator
            .suspend_and_wait("a1", "jira.ticket.delete", b"{}")
            .await;
        assert!(matches!(result, Err(ApprovalWaitError::Timeout)));

        let approval = wait_for_pending(&store).await;
        assert_eq!(approval.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn forged_signal_without_store_transition_is_refused() {
        let store = Arc::new(SqliteStateStore::in_memory().unwrap());
        let bus = Arc::new(MemorySignalBus::new());
        let channels = ChannelMap::new("test");
        let coordinator = Arc::new(ApprovalCoordinator::new(
            Arc::clone(&store) as Arc<dyn StateStore>,
            Arc::clone(&bus) as Arc<dyn SignalBus>,
            channels.clone(),
            ApprovalConfig::default(),
        ));

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .suspend_and_wait("a1", "jira.ticket.delete", b"{}")
                    .await
            })
        };

        let approval = wait_for_pending(&store).await;
        // An attacker on the signal plane publishes a decision that was
        // never recorded in the store.
        bus.publish(
            &channels.approval_channel(&approval.execution_id),
            "APPROVED",
        )
        .await
        .unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ApprovalWaitError::InvalidSignal(_))));
    }

    #[tokio::test]
    async fn admission_cap_rejects_excess_suspensions() {
        let (coordinator, _store) = coordinator(ApprovalConfig {
            max_suspended: 0,
            wait_timeout: Duration::from_millis(50),
        });

        let result = coordinator
            .suspend_and_wait("a1", "jira.ticket.delete", b"{}")
            .await;
        assert!(matches!(result, Err(ApprovalWaitError::AdmissionFull)));
    }
}
