//! End-to-end pipeline scenarios against the full in-process stack:
//! in-memory SQLite store, in-process signal bus, runtime state caches,
//! policy snapshot, reliability-wrapped mock connector and the audit sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use uag_core::approval::{ApprovalConfig, ApprovalCoordinator};
use uag_core::audit::{AuditSink, AuditSinkConfig, AuditStatus, Auditor, ExecutionMode};
use uag_core::auth::CustomClaims;
use uag_core::connector::{ActionExecutor, ConnectorError, MockConnector};
use uag_core::domain::{
    Agent, AgentStatus, ApprovalStatus, Policy, PolicyEffect,
};
use uag_core::pipeline::{Gateway, GatewayDeps, GatewayError};
use uag_core::policy::{PolicyStore, StorePolicyLoader};
use uag_core::reliability::{ReliabilityConfig, ReliabilityWrapper};
use uag_core::risk::RiskAnalyzer;
use uag_core::signal::{ChannelMap, MemorySignalBus, SignalBus};
use uag_core::statecache::{CacheKeys, StateCache};
use uag_core::store::{
    AuditLogFilter, BlockedAgentsLoader, QuarantinedAgentsLoader, SandboxAgentsLoader,
    SqliteStateStore, StateStore,
};

const AGENT: &str = "A1";
const CAPABILITY: &str = "jira.ticket.delete";

/// Counts downstream calls so tests can assert the connector was (not)
/// touched.
struct CountingConnector {
    inner: MockConnector,
    calls: AtomicU32,
}

impl CountingConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MockConnector::instant(),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ActionExecutor for CountingConnector {
    async fn call(&self, capability_id: &str, payload: &[u8]) -> Result<Vec<u8>, ConnectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.call(capability_id, payload).await
    }
}

/// Fully wired in-process gateway.
struct TestGateway {
    store: Arc<SqliteStateStore>,
    bus: Arc<MemorySignalBus>,
    sink: Arc<AuditSink>,
    connector: Arc<CountingConnector>,
    coordinator: Arc<ApprovalCoordinator>,
    blocked: Arc<StateCache>,
    sandboxed: Arc<StateCache>,
    policies: Arc<PolicyStore>,
    gateway: Gateway,
}

impl TestGateway {
    async fn start(approval: ApprovalConfig) -> Self {
        let store = Arc::new(SqliteStateStore::in_memory().unwrap());
        let bus = Arc::new(MemorySignalBus::new());
        let channels = ChannelMap::new("devit");

        let sink = Arc::new(AuditSink::new(
            Arc::clone(&store) as _,
            AuditSinkConfig {
                flush_interval: Duration::from_millis(20),
                ..Default::default()
            },
        ));
        sink.start();

        let blocked = Arc::new(StateCache::new(
            "kill-switch",
            CacheKeys::blocked(&channels),
            Arc::clone(&bus) as Arc<dyn SignalBus>,
            Arc::new(BlockedAgentsLoader(Arc::clone(&store) as _)),
        ));
        let quarantined = Arc::new(StateCache::new(
            "quarantine",
            CacheKeys::quarantine(&channels),
            Arc::clone(&bus) as Arc<dyn SignalBus>,
            Arc::new(QuarantinedAgentsLoader(Arc::clone(&store) as _)),
        ));
        let sandboxed = Arc::new(StateCache::new(
            "sandbox",
            CacheKeys::sandbox(&channels),
            Arc::clone(&bus) as Arc<dyn SignalBus>,
            Arc::new(SandboxAgentsLoader(Arc::clone(&store) as _)),
        ));

        let policies = Arc::new(PolicyStore::new(Arc::new(StorePolicyLoader(
            Arc::clone(&store) as _,
        ))));

        let connector = CountingConnector::new();
        let executor = Arc::new(ReliabilityWrapper::new(
            Arc::clone(&connector) as Arc<dyn ActionExecutor>,
            ReliabilityConfig {
                retry_base_delay: Duration::from_millis(1),
                ..Default::default()
            },
        ));

        let coordinator = Arc::new(ApprovalCoordinator::new(
            Arc::clone(&store) as _,
            Arc::clone(&bus) as _,
            channels.clone(),
            approval,
        ));

        let gateway = Gateway::new(GatewayDeps {
            policy: Arc::clone(&policies) as _,
            auditor: Arc::clone(&sink) as Arc<dyn Auditor>,
            executor,
            approvals: Arc::clone(&coordinator),
            risk: RiskAnalyzer::new(),
            blocked: Arc::clone(&blocked) as _,
            quarantined: Arc::clone(&quarantined) as _,
            sandboxed: Arc::clone(&sandboxed) as _,
        });

        Self {
            store,
            bus,
            sink,
            connector,
            coordinator,
            blocked,
            sandboxed,
            policies,
            gateway,
        }
    }

    async fn seed_agent(&self, status: AgentStatus, sandbox: bool) {
        self.store
            .upsert_agent(&Agent {
                id: AGENT.into(),
                name: "jira-helper-bot".into(),
                status,
                is_sandbox: sandbox,
                scopes: vec![CAPABILITY.into()],
                last_activity: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
    }

    async fn seed_policy(&self, effect: PolicyEffect, conditions: Option<serde_json::Value>) {
        self.store
            .create_policy(&Policy {
                id: "p1".into(),
                agent_id: AGENT.into(),
                capability_id: CAPABILITY.into(),
                effect: Some(effect),
                conditions,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        self.policies.refresh().await.unwrap();
    }

    async fn warm_caches(&self) {
        self.blocked.init().await.unwrap();
        self.sandboxed.init().await.unwrap();
    }

    fn claims(&self) -> CustomClaims {
        CustomClaims {
            user_id: AGENT.into(),
            scopes: HashMap::from([(CAPABILITY.to_string(), true)]),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            issuer: "uag-test".into(),
        }
    }

    async fn execute(&self, payload: &[u8]) -> Result<Vec<u8>, GatewayError> {
        self.gateway
            .process_action(&self.claims(), AGENT, CAPABILITY, payload, "trace-1")
            .await
    }

    /// Stops the sink (forcing the final flush) and returns the persisted
    /// audit trail for the test agent.
    async fn drain_audit(&self) -> Vec<uag_core::audit::AuditEvent> {
        self.sink.stop().await;
        self.store
            .fetch_audit_logs(&AuditLogFilter {
                agent_id: Some(AGENT.into()),
                capability_id: None,
            })
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn happy_path_executes_live() {
    let gw = TestGateway::start(ApprovalConfig::default()).await;
    gw.seed_agent(AgentStatus::Active, false).await;
    gw.seed_policy(PolicyEffect::Allow, None).await;
    gw.warm_caches().await;

    let response = gw.execute(br#"{"id":"T-1","amount":50}"#).await.unwrap();
    let decoded: serde_json::Value = serde_json::from_slice(&response).unwrap();
    assert_eq!(decoded["status"], "deleted");

    let events = gw.drain_audit().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, AuditStatus::Success);
    assert_eq!(events[0].mode, ExecutionMode::Live);
    assert_eq!(events[0].policy_id, "p1");
}

#[tokio::test]
async fn unknown_capability_is_denied_by_default() {
    let gw = TestGateway::start(ApprovalConfig::default()).await;
    gw.seed_agent(AgentStatus::Active, false).await;
    gw.warm_caches().await;
    gw.policies.refresh().await.unwrap();

    let claims = CustomClaims {
        user_id: AGENT.into(),
        scopes: HashMap::from([("crm.lead.create".to_string(), true)]),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        issuer: "uag-test".into(),
    };
    let result = gw
        .gateway
        .process_action(&claims, AGENT, "crm.lead.create", b"{}", "trace-1")
        .await;

    assert!(matches!(result, Err(GatewayError::PolicyDenied(_))));
    assert_eq!(gw.connector.calls(), 0);

    let events = gw.drain_audit().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, AuditStatus::Denied);
}

#[tokio::test]
async fn kill_switch_overrides_allow_policy() {
    let gw = TestGateway::start(ApprovalConfig::default()).await;
    gw.seed_agent(AgentStatus::Blocked, false).await;
    gw.seed_policy(PolicyEffect::Allow, None).await;
    gw.warm_caches().await;

    let result = gw.execute(br#"{"id":"T-1"}"#).await;
    assert!(matches!(result, Err(GatewayError::AgentBlocked)));
    assert_eq!(gw.connector.calls(), 0);

    let events = gw.drain_audit().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, AuditStatus::Blocked);
}

#[tokio::test]
async fn risky_payload_suspends_then_executes_on_approval() {
    let gw = Arc::new(TestGateway::start(ApprovalConfig::default()).await);
    gw.seed_agent(AgentStatus::Active, false).await;
    gw.seed_policy(
        PolicyEffect::Allow,
        Some(serde_json::json!({"risk_field": "amount", "threshold": 1000})),
    )
    .await;
    gw.warm_caches().await;

    let request = {
        let gw = Arc::clone(&gw);
        tokio::spawn(async move { gw.execute(br#"{"id":"T-1","amount":5000}"#).await })
    };

    // The suspended request shows up in the reviewer queue.
    let approval = loop {
        if let Some(approval) = gw.store.list_pending_approvals().await.unwrap().pop() {
            break approval;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(approval.agent_id, AGENT);
    assert_eq!(approval.status, ApprovalStatus::Pending);
    assert_eq!(gw.connector.calls(), 0);

    gw.coordinator
        .decide(&approval.id, ApprovalStatus::Approved, "reviewer-1", None)
        .await
        .unwrap();

    let response = request.await.unwrap().unwrap();
    let decoded: serde_json::Value = serde_json::from_slice(&response).unwrap();
    assert_eq!(decoded["status"], "deleted");
    assert_eq!(gw.connector.calls(), 1);

    let events = gw.drain_audit().await;
    let statuses: Vec<AuditStatus> = events.iter().map(|e| e.status).collect();
    assert!(statuses.contains(&AuditStatus::Success));
    assert!(statuses.contains(&AuditStatus::QuarantinePending));
}

#[tokio::test]
async fn unanswered_suspension_times_out_and_stays_pending() {
    let gw = TestGateway::start(ApprovalConfig {
        wait_timeout: Duration::from_millis(80),
        ..Default::default()
    })
    .await;
    gw.seed_agent(AgentStatus::Active, false).await;
    gw.seed_policy(
        PolicyEffect::Allow,
        Some(serde_json::json!({"risk_field": "amount", "threshold": 1000})),
    )
    .await;
    gw.warm_caches().await;

    let result = gw.execute(br#"{"amount":5000}"#).await;
    assert!(matches!(result, Err(GatewayError::ApprovalTimeout)));
    assert_eq!(gw.connector.calls(), 0);

    let pending = gw.store.list_pending_approvals().await.unwrap();
    assert_eq!(pending.len(), 1);

    let events = gw.drain_audit().await;
    assert!(events.iter().any(|e| e.status == AuditStatus::Timeout));
}

#[tokio::test]
async fn rejected_suspension_fails_the_request() {
    let gw = Arc::new(TestGateway::start(ApprovalConfig::default()).await);
    gw.seed_agent(AgentStatus::Quarantine, false).await;
    gw.seed_policy(PolicyEffect::Quarantine, None).await;
    gw.warm_caches().await;

    let request = {
        let gw = Arc::clone(&gw);
        tokio::spawn(async move { gw.execute(b"{}").await })
    };

    let approval = loop {
        if let Some(approval) = gw.store.list_pending_approvals().await.unwrap().pop() {
            break approval;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    gw.coordinator
        .decide(
            &approval.id,
            ApprovalStatus::Rejected,
            "reviewer-1",
            Some("not today"),
        )
        .await
        .unwrap();

    let result = request.await.unwrap();
    assert!(matches!(result, Err(GatewayError::ApprovalRejected)));
    assert_eq!(gw.connector.calls(), 0);

    let events = gw.drain_audit().await;
    assert!(events.iter().any(|e| e.status == AuditStatus::Rejected));
}

#[tokio::test]
async fn sandboxed_agent_gets_synthetic_success() {
    let gw = TestGateway::start(ApprovalConfig::default()).await;
    gw.seed_agent(AgentStatus::Active, true).await;
    gw.seed_policy(PolicyEffect::Allow, None).await;
    gw.warm_caches().await;

    let response = gw.execute(br#"{"id":"T-1","amount":50}"#).await.unwrap();
    let decoded: serde_json::Value = serde_json::from_slice(&response).unwrap();
    assert_eq!(decoded["status"], "simulated_success");
    assert_eq!(gw.connector.calls(), 0);

    let events = gw.drain_audit().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, AuditStatus::Intercepted);
    assert_eq!(events[0].mode, ExecutionMode::Sandbox);
}

#[tokio::test]
async fn missing_scope_is_a_security_violation() {
    let gw = TestGateway::start(ApprovalConfig::default()).await;
    gw.seed_agent(AgentStatus::Active, false).await;
    gw.seed_policy(PolicyEffect::Allow, None).await;
    gw.warm_caches().await;

    let claims = CustomClaims {
        user_id: AGENT.into(),
        scopes: HashMap::new(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        issuer: "uag-test".into(),
    };
    let result = gw
        .gateway
        .process_action(&claims, AGENT, CAPABILITY, b"{}", "trace-1")
        .await;

    assert!(matches!(result, Err(GatewayError::InsufficientScope(_))));

    let events = gw.drain_audit().await;
    assert_eq!(events[0].status, AuditStatus::SecurityViolation);
}

#[tokio::test]
async fn kill_signal_takes_effect_without_restart() {
    let gw = TestGateway::start(ApprovalConfig::default()).await;
    gw.seed_agent(AgentStatus::Active, false).await;
    gw.seed_policy(PolicyEffect::Allow, None).await;
    gw.warm_caches().await;

    // First request flows.
    gw.execute(br#"{"id":"T-1"}"#).await.unwrap();

    // Operator flips the kill switch; the delta arrives over the signal
    // channel, no restart involved. Publishing is at-most-once, so keep
    // re-sending until the listener (which may still be subscribing)
    // observes one.
    let cancel = tokio_util::sync::CancellationToken::new();
    let listener = {
        let blocked = Arc::clone(&gw.blocked);
        let cancel = cancel.clone();
        tokio::spawn(async move { blocked.run_listener(cancel).await })
    };

    for _ in 0..200 {
        gw.bus
            .publish("devit:agents:kill-switch-signal", &format!("{AGENT}:true"))
            .await
            .unwrap();
        if gw.blocked.contains(AGENT) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(gw.blocked.contains(AGENT));

    let result = gw.execute(br#"{"id":"T-2"}"#).await;
    assert!(matches!(result, Err(GatewayError::AgentBlocked)));
    assert_eq!(gw.connector.calls(), 1);

    cancel.cancel();
    listener.await.unwrap();
}
