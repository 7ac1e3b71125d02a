//! Component wiring.
//!
//! Builds the full data plane from a [`UagConfig`] in the order the
//! coherence protocol requires: listeners subscribe *before* the caches
//! warm-load, so no delta published during startup is lost; the policy
//! snapshot is loaded before the first request; the audit sink starts first
//! and is stopped last.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use uag_core::approval::ApprovalCoordinator;
use uag_core::audit::{AuditSink, Auditor};
use uag_core::auth::{Ed25519TokenValidator, TokenValidator};
use uag_core::config::UagConfig;
use uag_core::connector::{ActionExecutor, MockConnector};
use uag_core::pipeline::{Gateway, GatewayDeps};
use uag_core::policy::{PolicyStore, StorePolicyLoader};
use uag_core::reliability::ReliabilityWrapper;
use uag_core::risk::RiskAnalyzer;
use uag_core::signal::{ChannelMap, MemorySignalBus, SignalBus};
use uag_core::statecache::{CacheKeys, StateCache};
use uag_core::store::{
    BlockedAgentsLoader, QuarantinedAgentsLoader, SandboxAgentsLoader, SqliteStateStore,
    StateStore,
};

use crate::rpc::RpcConnector;

/// A fully wired data plane.
pub struct GatewayRuntime {
    /// Durable store.
    pub store: Arc<SqliteStateStore>,
    /// Signal plane.
    pub bus: Arc<dyn SignalBus>,
    /// Channel names.
    pub channels: ChannelMap,
    /// Audit sink (started).
    pub sink: Arc<AuditSink>,
    /// The request pipeline.
    pub gateway: Arc<Gateway>,
    /// HITL coordinator.
    pub coordinator: Arc<ApprovalCoordinator>,
    /// Token validator for the transports.
    pub validator: Arc<dyn TokenValidator>,
    cancel: CancellationToken,
    listeners: Vec<JoinHandle<()>>,
}

impl GatewayRuntime {
    /// Builds and warms every component.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be opened, the key material is missing,
    /// or any warm-up load fails — a gateway must never serve with cold
    /// caches.
    pub async fn start(config: &UagConfig) -> Result<Self> {
        let store = Arc::new(
            SqliteStateStore::open(&config.datastore.path)
                .context("failed to open the state store")?,
        );

        if !config.signal.addr.is_empty() {
            warn!(
                addr = %config.signal.addr,
                "external signal broker not wired in this build, using the in-process bus"
            );
        }
        let bus: Arc<dyn SignalBus> = Arc::new(MemorySignalBus::new());
        let channels = ChannelMap::new(config.signal.namespace.clone());

        let sink = Arc::new(AuditSink::new(
            Arc::clone(&store) as _,
            config.audit_sink(),
        ));
        sink.start();

        let public_key = config
            .resolve_public_key()
            .context("token verification key is required")?;
        let validator: Arc<dyn TokenValidator> = Arc::new(
            Ed25519TokenValidator::from_base64(&public_key)
                .context("invalid token verification key")?,
        );

        let blocked = Arc::new(StateCache::new(
            "kill-switch",
            CacheKeys::blocked(&channels),
            Arc::clone(&bus),
            Arc::new(BlockedAgentsLoader(Arc::clone(&store) as Arc<dyn StateStore>)),
        ));
        let quarantined = Arc::new(StateCache::new(
            "quarantine",
            CacheKeys::quarantine(&channels),
            Arc::clone(&bus),
            Arc::new(QuarantinedAgentsLoader(
                Arc::clone(&store) as Arc<dyn StateStore>
            )),
        ));
        let sandboxed = Arc::new(StateCache::new(
            "sandbox",
            CacheKeys::sandbox(&channels),
            Arc::clone(&bus),
            Arc::new(SandboxAgentsLoader(Arc::clone(&store) as Arc<dyn StateStore>)),
        ));

        let cancel = CancellationToken::new();
        let mut listeners = Vec::new();

        // Listeners first, then init: a signal published while the caches
        // warm-load is queued behind the subscription instead of lost.
        for cache in [&blocked, &quarantined, &sandboxed] {
            let cache = Arc::clone(cache);
            let cancel = cancel.clone();
            listeners.push(tokio::spawn(async move {
                cache.run_listener(cancel).await;
            }));
        }

        blocked
            .init()
            .await
            .context("kill-switch cache warm-up failed")?;
        quarantined
            .init()
            .await
            .context("quarantine cache warm-up failed")?;
        sandboxed
            .init()
            .await
            .context("sandbox cache warm-up failed")?;

        let policies = Arc::new(PolicyStore::new(Arc::new(StorePolicyLoader(
            Arc::clone(&store) as Arc<dyn StateStore>,
        ))));
        policies
            .refresh()
            .await
            .context("initial policy load failed")?;
        {
            let policies = Arc::clone(&policies);
            let bus = Arc::clone(&bus);
            let channel = channels.policy_update_channel();
            let cancel = cancel.clone();
            listeners.push(tokio::spawn(async move {
                policies.run_refresh_listener(bus, &channel, cancel).await;
            }));
        }

        let inner: Arc<dyn ActionExecutor> = if config.connector.addr.is_empty() {
            info!("no connector address configured, using the built-in mock connector");
            Arc::new(MockConnector::new())
        } else {
            info!(addr = %config.connector.addr, "using rpc connector");
            Arc::new(RpcConnector::new(
                config.connector.addr.clone(),
                config.connector.call_timeout,
            ))
        };
        let executor = Arc::new(ReliabilityWrapper::new(inner, config.reliability()));

        let coordinator = Arc::new(ApprovalCoordinator::new(
            Arc::clone(&store) as Arc<dyn StateStore>,
            Arc::clone(&bus),
            channels.clone(),
            config.approval(),
        ));

        let gateway = Arc::new(Gateway::new(GatewayDeps {
            policy: Arc::clone(&policies) as _,
            auditor: Arc::clone(&sink) as Arc<dyn Auditor>,
            executor,
            approvals: Arc::clone(&coordinator),
            risk: RiskAnalyzer::new(),
            blocked: Arc::clone(&blocked) as _,
            quarantined: Arc::clone(&quarantined) as _,
            sandboxed: Arc::clone(&sandboxed) as _,
        }));

        info!("gateway runtime ready");
        Ok(Self {
            store,
            bus,
            channels,
            sink,
            gateway,
            coordinator,
            validator,
            cancel,
            listeners,
        })
    }

    /// Cancellation token shared by the background listeners; servers
    /// should tie their lifetime to a child of it.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the background listeners, then drains the audit sink.
    ///
    /// Call after the servers have stopped accepting requests: the sink
    /// must outlive every producer so the final events are flushed.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for listener in self.listeners {
            if let Err(e) = listener.await {
                warn!(error = %e, "listener terminated abnormally");
            }
        }
        self.sink.stop().await;
        info!("gateway runtime stopped");
    }
}
