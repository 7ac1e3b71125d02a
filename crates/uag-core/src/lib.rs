//! # uag-core
//!
//! Core library for UAG, a policy enforcement gateway between autonomous
//! agents and the enterprise systems they invoke.
//!
//! Every capability invocation flows through the request pipeline, which
//! decides in real time whether to allow, deny, sandbox or suspend the call
//! for human approval, executes approved calls with bounded failure, and
//! emits an asynchronous audit trail.
//!
//! ## Subsystems
//!
//! - **Pipeline** ([`pipeline`]): the hot path — authorization, kill
//!   switch, policy, risk, branch, execute, audit.
//! - **Runtime state plane** ([`statecache`], [`signal`]): two-tier
//!   eventually-consistent membership caches fed by pub/sub signals with a
//!   warm-up protocol that survives restarts.
//! - **Policy snapshot** ([`policy`]): in-memory default-deny policy cache
//!   with atomic whole-snapshot refresh.
//! - **Audit** ([`audit`]): non-blocking batched event log with a
//!   zero-loss drain on shutdown.
//! - **Reliability** ([`reliability`]): rate limit, circuit breaker and
//!   retry around downstream connectors.
//! - **Approvals** ([`approval`]): human-in-the-loop suspension keyed by
//!   execution id.
//! - **Durability** ([`store`]): the `StateStore` contract plus the SQLite
//!   implementation.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod approval;
pub mod audit;
pub mod auth;
pub mod config;
pub mod connector;
pub mod domain;
pub mod pipeline;
pub mod policy;
pub mod reliability;
pub mod risk;
pub mod signal;
pub mod statecache;
pub mod store;

/// Prelude for the common wiring path.
pub mod prelude {
    pub use crate::approval::{ApprovalConfig, ApprovalCoordinator};
    pub use crate::audit::{AuditSink, AuditSinkConfig, Auditor};
    pub use crate::auth::{CustomClaims, TokenValidator};
    pub use crate::config::UagConfig;
    pub use crate::connector::{ActionExecutor, MockConnector};
    pub use crate::pipeline::{Gateway, GatewayDeps, GatewayError};
    pub use crate::policy::PolicyStore;
    pub use crate::reliability::{ReliabilityConfig, ReliabilityWrapper};
    pub use crate::risk::RiskAnalyzer;
    pub use crate::signal::{ChannelMap, MemorySignalBus, SignalBus};
    pub use crate::statecache::{CacheKeys, StateCache};
    pub use crate::store::{SqliteStateStore, StateStore};
}

pub use config::UagConfig;
pub use pipeline::{Gateway, GatewayDeps, GatewayError};
