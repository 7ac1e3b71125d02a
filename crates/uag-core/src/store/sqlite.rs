//! SQLite-backed state store.
//!
//! Uses WAL mode so hot-path reads are never blocked by audit batch writes.
//! The connection sits behind a mutex; every operation is a single short
//! statement or transaction, so contention stays negligible at gateway
//! request rates.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, params};

use super::{AuditLogFilter, StateStore, StoreError};
use crate::audit::{AuditEvent, AuditStorage};
use crate::domain::{
    ActivityPoint, Agent, ApprovalRequest, ApprovalStatus, GlobalStats, Policy, User,
};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Hard cap on rows returned by audit log queries.
const AUDIT_QUERY_LIMIT: usize = 100;

/// SQLite implementation of [`StateStore`] (and [`AuditStorage`]).
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Opens or creates the database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] when the file cannot be opened or the schema
    /// fails to apply.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store for tests.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] when the schema fails to apply.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn agent_ids_where(&self, predicate: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT id FROM agents WHERE {predicate}"))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width UTC form keeps lexicographic order equal to time order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow(format!("bad timestamp '{raw}': {e}")))
}

fn parse_json(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|text| serde_json::from_str(&text).ok())
}

type ApprovalParts = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn approval_row_to_parts(row: &rusqlite::Row<'_>) -> Result<ApprovalParts, rusqlite::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn approval_from_parts(parts: ApprovalParts) -> Result<ApprovalRequest, StoreError> {
    Ok(ApprovalRequest {
        id: parts.0,
        execution_id: parts.1,
        agent_id: parts.2,
        capability_id: parts.3,
        payload: parts.4,
        status: parts
            .5
            .parse()
            .map_err(|e: String| StoreError::CorruptRow(e))?,
        reviewer_id: parts.6,
        comment: parts.7,
        created_at: parse_ts(&parts.8)?,
        updated_at: parse_ts(&parts.9)?,
    })
}

fn policy_from_row(row: &rusqlite::Row<'_>) -> Result<Policy, rusqlite::Error> {
    // Enum/timestamp parsing is finished outside so corrupt rows surface as
    // StoreError::CorruptRow rather than a generic sqlite failure.
    Ok(Policy {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        capability_id: row.get(2)?,
        effect: row
            .get::<_, Option<String>>(3)?
            .and_then(|s| s.parse().ok()),
        conditions: parse_json(row.get(4)?),
        created_at: DateTime::<Utc>::MIN_UTC,
        updated_at: DateTime::<Utc>::MIN_UTC,
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn list_blocked_agents(&self) -> Result<Vec<String>, StoreError> {
        self.agent_ids_where("status = 'blocked'")
    }

    async fn list_quarantined_agents(&self) -> Result<Vec<String>, StoreError> {
        self.agent_ids_where("status = 'quarantine'")
    }

    async fn list_sandbox_agents(&self) -> Result<Vec<String>, StoreError> {
        self.agent_ids_where("is_sandbox = 1")
    }

    async fn upsert_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let scopes = serde_json::to_string(&agent.scopes)
            .map_err(|e| StoreError::CorruptRow(e.to_string()))?;
        let metadata = serde_json::to_string(&agent.metadata)
            .map_err(|e| StoreError::CorruptRow(e.to_string()))?;
        self.conn().execute(
            "INSERT OR REPLACE INTO agents
                 (id, name, status, is_sandbox, scopes, last_activity,
                  created_at, updated_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                agent.id,
                agent.name,
                agent.status.to_string(),
                i64::from(agent.is_sandbox),
                scopes,
                agent.last_activity.map(fmt_ts),
                fmt_ts(agent.created_at),
                fmt_ts(agent.updated_at),
                metadata,
            ],
        )?;
        Ok(())
    }

    async fn list_policies(&self) -> Result<Vec<Policy>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, capability_id, effect, conditions, created_at, updated_at
             FROM policies",
        )?;
        let mut policies = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut policy = policy_from_row(row)?;
            policy.created_at = parse_ts(&row.get::<_, String>(5)?)?;
            policy.updated_at = parse_ts(&row.get::<_, String>(6)?)?;
            policies.push(policy);
        }
        Ok(policies)
    }

    async fn create_policy(&self, policy: &Policy) -> Result<(), StoreError> {
        let conditions = policy
            .conditions
            .as_ref()
            .map(std::string::ToString::to_string);
        self.conn().execute(
            "INSERT INTO policies
                 (id, agent_id, capability_id, effect, conditions, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                policy.id,
                policy.agent_id,
                policy.capability_id,
                policy.effect.map(|e| e.to_string()),
                conditions,
                fmt_ts(policy.created_at),
                fmt_ts(policy.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn update_policy(&self, policy: &Policy) -> Result<(), StoreError> {
        let conditions = policy
            .conditions
            .as_ref()
            .map(std::string::ToString::to_string);
        let changed = self.conn().execute(
            "UPDATE policies
             SET agent_id = ?2, capability_id = ?3, effect = ?4, conditions = ?5,
                 updated_at = ?6
             WHERE id = ?1",
            params![
                policy.id,
                policy.agent_id,
                policy.capability_id,
                policy.effect.map(|e| e.to_string()),
                conditions,
                fmt_ts(policy.updated_at),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("policy {}", policy.id)));
        }
        Ok(())
    }

    async fn delete_policy(&self, id: &str) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute("DELETE FROM policies WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("policy {id}")));
        }
        Ok(())
    }

    async fn create_approval(&self, request: &ApprovalRequest) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO approvals
                 (id, execution_id, agent_id, capability_id, payload, status,
                  reviewer_id, comment, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                request.id,
                request.execution_id,
                request.agent_id,
                request.capability_id,
                request.payload,
                request.status.to_string(),
                request.reviewer_id,
                request.comment,
                fmt_ts(request.created_at),
                fmt_ts(request.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn decide_approval(
        &self,
        id: &str,
        decision: ApprovalStatus,
        reviewer_id: &str,
        comment: Option<&str>,
    ) -> Result<String, StoreError> {
        if decision == ApprovalStatus::Pending {
            return Err(StoreError::CorruptRow(
                "decision must be APPROVED or REJECTED".into(),
            ));
        }

        let conn = self.conn();
        // The status predicate makes the transition one-shot: of two racing
        // reviewers exactly one update matches a PENDING row.
        let updated = conn.query_row(
            "UPDATE approvals
             SET status = ?2, reviewer_id = ?3, comment = ?4, updated_at = ?5
             WHERE id = ?1 AND status = 'PENDING'
             RETURNING execution_id",
            params![
                id,
                decision.to_string(),
                reviewer_id,
                comment,
                fmt_ts(Utc::now()),
            ],
            |row| row.get::<_, String>(0),
        );

        match updated {
            Ok(execution_id) => Ok(execution_id),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                let exists = conn.query_row(
                    "SELECT COUNT(*) FROM approvals WHERE id = ?1",
                    params![id],
                    |row| row.get::<_, i64>(0),
                )? > 0;
                if exists {
                    Err(StoreError::AlreadyProcessed)
                } else {
                    Err(StoreError::NotFound(format!("approval {id}")))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn approval_by_execution(
        &self,
        execution_id: &str,
    ) -> Result<ApprovalRequest, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, execution_id, agent_id, capability_id, payload, status,
                        reviewer_id, comment, created_at, updated_at
                 FROM approvals WHERE execution_id = ?1",
                params![execution_id],
                approval_row_to_parts,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound(format!("approval for execution {execution_id}"))
                }
                other => StoreError::Database(other),
            })?;
        approval_from_parts(row)
    }

    async fn list_pending_approvals(&self) -> Result<Vec<ApprovalRequest>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, execution_id, agent_id, capability_id, payload, status,
                    reviewer_id, comment, created_at, updated_at
             FROM approvals WHERE status = 'PENDING'
             ORDER BY created_at ASC",
        )?;
        let mut approvals = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            approvals.push(approval_from_parts(approval_row_to_parts(row)?)?);
        }
        Ok(approvals)
    }

    async fn write_audit_batch(&self, events: &[AuditEvent]) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO audit_events
                     (id, trace_id, agent_id, capability_id, payload, mode, policy_id,
                      status, response, timestamp, duration_ms, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for event in events {
                stmt.execute(params![
                    event.id,
                    event.trace_id,
                    event.agent_id,
                    event.capability_id,
                    event.payload.to_string(),
                    event.mode.to_string(),
                    event.policy_id,
                    event.status.to_string(),
                    event.response.as_ref().map(ToString::to_string),
                    fmt_ts(event.timestamp.unwrap_or_else(Utc::now)),
                    event.duration_ms,
                    event.error,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn fetch_audit_logs(
        &self,
        filter: &AuditLogFilter,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, trace_id, agent_id, capability_id, payload, mode, policy_id,
                    status, response, timestamp, duration_ms, error
             FROM audit_events
             WHERE (?1 IS NULL OR agent_id = ?1)
               AND (?2 IS NULL OR capability_id = ?2)
             ORDER BY timestamp DESC
             LIMIT ?3",
        )?;

        let mut events = Vec::new();
        let mut rows = stmt.query(params![
            filter.agent_id.as_deref(),
            filter.capability_id.as_deref(),
            AUDIT_QUERY_LIMIT as i64,
        ])?;
        while let Some(row) = rows.next()? {
            events.push(AuditEvent {
                id: row.get(0)?,
                trace_id: row.get(1)?,
                agent_id: row.get(2)?,
                capability_id: row.get(3)?,
                payload: parse_json(row.get(4)?).unwrap_or(serde_json::Value::Null),
                mode: row
                    .get::<_, String>(5)?
                    .parse()
                    .map_err(|e: String| StoreError::CorruptRow(e))?,
                policy_id: row.get(6)?,
                status: row
                    .get::<_, String>(7)?
                    .parse()
                    .map_err(|e: String| StoreError::CorruptRow(e))?,
                response: parse_json(row.get(8)?),
                timestamp: Some(parse_ts(&row.get::<_, String>(9)?)?),
                duration_ms: row.get(10)?,
                error: row.get(11)?,
            });
        }
        Ok(events)
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, email, username, password_hash, role, scopes, created_at, updated_at
             FROM users",
        )?;
        let mut users = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            users.push(User {
                id: row.get(0)?,
                email: row.get(1)?,
                username: row.get(2)?,
                password_hash: row.get(3)?,
                role: row.get(4)?,
                scopes: serde_json::from_str(&row.get::<_, String>(5)?)
                    .map_err(|e| StoreError::CorruptRow(e.to_string()))?,
                created_at: parse_ts(&row.get::<_, String>(6)?)?,
                updated_at: parse_ts(&row.get::<_, String>(7)?)?,
            });
        }
        Ok(users)
    }

    async fn global_stats(&self) -> Result<GlobalStats, StoreError> {
        let conn = self.conn();

        let total_actions: i64 =
            conn.query_row("SELECT COUNT(*) FROM audit_events", [], |row| row.get(0))?;
        let blocked_actions: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_events WHERE status IN ('BLOCKED', 'DENIED')",
            [],
            |row| row.get(0),
        )?;

        let mut top_capabilities = std::collections::HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT capability_id, COUNT(*) AS uses
                 FROM audit_events GROUP BY capability_id
                 ORDER BY uses DESC LIMIT 10",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                top_capabilities.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
            }
        }

        let mut hourly_activity = Vec::new();
        {
            let cutoff = fmt_ts(Utc::now() - Duration::hours(24));
            let mut stmt = conn.prepare(
                "SELECT strftime('%Y-%m-%d %H:00', timestamp) AS hour, COUNT(*)
                 FROM audit_events WHERE timestamp >= ?1
                 GROUP BY hour ORDER BY hour",
            )?;
            let mut rows = stmt.query(params![cutoff])?;
            while let Some(row) = rows.next()? {
                hourly_activity.push(ActivityPoint {
                    hour: row.get(0)?,
                    count: row.get(1)?,
                });
            }
        }

        let risk_ratio = if total_actions > 0 {
            #[allow(clippy::cast_precision_loss)]
            {
                blocked_actions as f64 / total_actions as f64
            }
        } else {
            0.0
        };

        Ok(GlobalStats {
            total_actions,
            blocked_actions,
            risk_ratio,
            top_capabilities,
            hourly_activity,
        })
    }
}

#[async_trait]
impl AuditStorage for SqliteStateStore {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<(), StoreError> {
        StateStore::write_audit_batch(self, events).await
    }
}
