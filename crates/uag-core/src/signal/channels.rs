//! Channel, set and lock naming.
//!
//! Every name in the signal plane is derived here from a single configured
//! namespace. Nothing else in the codebase builds these strings, so the
//! gateway and the console can never drift apart on a key.

/// Default namespace prefix.
pub const DEFAULT_NAMESPACE: &str = "devit";

const CHAN_KILL_SWITCH: &str = "agents:kill-switch-signal";
const CHAN_SANDBOX: &str = "agents:sandbox-signal";
const CHAN_QUARANTINE: &str = "agents:quarantine-signal";
const CHAN_POLICY_UPDATE: &str = "agents:policy-update";
const CHAN_APPROVAL_EXECUTION: &str = "approvals:execution";

const SET_BLOCKED: &str = "agents:blocked_set";
const SET_SANDBOX: &str = "agents:sandbox_set";
const SET_QUARANTINE: &str = "agents:quarantine_set";

const LOCK_WARMUP: &str = "lock:warmup";

/// Namespaced names for every channel, set and lock the gateway touches.
#[derive(Debug, Clone)]
pub struct ChannelMap {
    namespace: String,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl ChannelMap {
    /// Builds a map rooted at `namespace`.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The configured namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn scoped(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.namespace)
    }

    /// Broadcast channel for kill-switch flips.
    #[must_use]
    pub fn kill_switch_channel(&self) -> String {
        self.scoped(CHAN_KILL_SWITCH)
    }

    /// Broadcast channel for sandbox-mode flips.
    #[must_use]
    pub fn sandbox_channel(&self) -> String {
        self.scoped(CHAN_SANDBOX)
    }

    /// Broadcast channel for quarantine flips.
    #[must_use]
    pub fn quarantine_channel(&self) -> String {
        self.scoped(CHAN_QUARANTINE)
    }

    /// Broadcast channel that triggers a policy cache reload.
    #[must_use]
    pub fn policy_update_channel(&self) -> String {
        self.scoped(CHAN_POLICY_UPDATE)
    }

    /// Per-execution channel carrying one approval decision.
    #[must_use]
    pub fn approval_channel(&self, execution_id: &str) -> String {
        format!("{}:{CHAN_APPROVAL_EXECUTION}:{execution_id}", self.namespace)
    }

    /// Shared set mirroring the blocked agents.
    #[must_use]
    pub fn blocked_set(&self) -> String {
        self.scoped(SET_BLOCKED)
    }

    /// Shared set mirroring the sandboxed agents.
    #[must_use]
    pub fn sandbox_set(&self) -> String {
        self.scoped(SET_SANDBOX)
    }

    /// Shared set mirroring the quarantined agents.
    #[must_use]
    pub fn quarantine_set(&self) -> String {
        self.scoped(SET_QUARANTINE)
    }

    /// Single-writer warm-up lock for `resource` (`blocked`, `sandbox`,
    /// `quarantine`).
    #[must_use]
    pub fn warmup_lock(&self, resource: &str) -> String {
        format!("{}:{LOCK_WARMUP}:{resource}", self.namespace)
    }
}
