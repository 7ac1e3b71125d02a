//! Console users and aggregate statistics.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A human operator of the console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// User identifier.
    pub id: String,

    /// Email address.
    pub email: String,

    /// Login name.
    pub username: String,

    /// Password hash. Never serialized outward.
    #[serde(skip_serializing)]
    pub password_hash: String,

    /// Role label, e.g. `admin` or `reviewer`.
    pub role: String,

    /// Capability scopes embedded into tokens minted for this user.
    #[serde(default)]
    pub scopes: HashMap<String, bool>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Aggregate dashboard numbers computed over the audit log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    /// All audited actions.
    pub total_actions: i64,

    /// Actions stopped by the kill switch or a deny.
    pub blocked_actions: i64,

    /// `blocked_actions / total_actions`, 0 when there is no traffic.
    pub risk_ratio: f64,

    /// Invocation counts per capability.
    pub top_capabilities: HashMap<String, i64>,

    /// Per-hour activity for the last day.
    pub hourly_activity: Vec<ActivityPoint>,
}

/// One bucket of the hourly activity series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityPoint {
    /// Hour bucket in `YYYY-MM-DD HH:00` form.
    pub hour: String,

    /// Number of actions in the bucket.
    pub count: i64,
}
