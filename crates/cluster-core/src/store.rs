use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::config::StalenessConfig;
use crate::error::StoreError;
use crate::models::{
    Agent, AgentFilter, AgentMetrics, AgentStatus, AuditEvent, AuditResult, BindingMode, Daemon,
    DaemonStatus, ListedSession, Session, SessionType, Staleness, TelegramBinding,
};
use crate::staleness::compute_staleness;

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).expect("valid uuid")
}

fn parse_rfc3339(s: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .expect("valid date")
        .with_timezone(&Utc)
}

/// Result of [`Store::reconcile_daemon_agents`]: three disjoint id sets.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub new_agents: Vec<Uuid>,
    pub stopped_agents: Vec<Uuid>,
    pub existing_agents: Vec<Uuid>,
}

/// Async SQLite-backed persistence for the cluster's durable state.
pub struct Store {
    conn: Connection,
    staleness_config: StalenessConfig,
}

impl Store {
    pub async fn new(path: impl AsRef<Path>, staleness_config: StalenessConfig) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
        let store = Self { conn, staleness_config };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn new_in_memory(staleness_config: StalenessConfig) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
        let store = Self { conn, staleness_config };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA cache_size=-64000;
                    PRAGMA mmap_size=268435456;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS daemons (
                        id              TEXT PRIMARY KEY,
                        hostname        TEXT NOT NULL,
                        platform        TEXT NOT NULL,
                        version         TEXT NOT NULL,
                        bind_address    TEXT NOT NULL,
                        status          TEXT NOT NULL,
                        agent_count     INTEGER NOT NULL DEFAULT 0,
                        created_at      TEXT NOT NULL,
                        last_seen       TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS agents (
                        id                      TEXT PRIMARY KEY,
                        daemon_id               TEXT NOT NULL,
                        hostname                TEXT NOT NULL,
                        pid                     INTEGER NOT NULL,
                        cwd                     TEXT NOT NULL,
                        command                 TEXT NOT NULL,
                        status                  TEXT NOT NULL,
                        capabilities            TEXT NOT NULL,
                        created_at              TEXT NOT NULL,
                        updated_at              TEXT NOT NULL,
                        last_heartbeat          TEXT NOT NULL,
                        stopped_at              TEXT,
                        staleness               TEXT NOT NULL,
                        daemon_reported_status  TEXT NOT NULL,
                        daemon_reported_at      TEXT NOT NULL,
                        metrics                 TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_agents_daemon_id      ON agents(daemon_id);
                    CREATE INDEX IF NOT EXISTS idx_agents_last_heartbeat ON agents(last_heartbeat);

                    CREATE TABLE IF NOT EXISTS telegram_bindings (
                        id          TEXT PRIMARY KEY,
                        chat_id     INTEGER NOT NULL,
                        agent_id    TEXT NOT NULL,
                        operator_id TEXT NOT NULL,
                        mode        TEXT NOT NULL,
                        created_at  TEXT NOT NULL
                    );

                    CREATE UNIQUE INDEX IF NOT EXISTS idx_bindings_chat_agent ON telegram_bindings(chat_id, agent_id);

                    CREATE TABLE IF NOT EXISTS sessions (
                        id          TEXT PRIMARY KEY,
                        operator_id TEXT NOT NULL,
                        type        TEXT NOT NULL,
                        token       TEXT NOT NULL UNIQUE,
                        expires_at  TEXT NOT NULL,
                        scopes      TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_sessions_token ON sessions(token);

                    CREATE TABLE IF NOT EXISTS audit_events (
                        id          TEXT PRIMARY KEY,
                        operator_id TEXT NOT NULL,
                        event_type  TEXT NOT NULL,
                        agent_id    TEXT,
                        payload     TEXT NOT NULL,
                        result      TEXT NOT NULL,
                        timestamp   TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_events(timestamp);
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Daemon operations
    // -----------------------------------------------------------------------

    pub async fn upsert_daemon(&self, daemon: &Daemon) -> Result<(), StoreError> {
        let id = daemon.id.to_string();
        let hostname = daemon.hostname.clone();
        let platform = daemon.platform.clone();
        let version = daemon.version.clone();
        let bind_address = daemon.bind_address.clone();
        let status = enum_to_sql(&DaemonStatus::Connected);
        let agent_count = daemon.agent_count;
        let created_at = daemon.created_at.to_rfc3339();
        let last_seen = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO daemons (id, hostname, platform, version, bind_address, status, agent_count, created_at, last_seen)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                     ON CONFLICT(id) DO UPDATE SET
                        hostname=excluded.hostname, platform=excluded.platform, version=excluded.version,
                        bind_address=excluded.bind_address, status=excluded.status,
                        agent_count=excluded.agent_count, last_seen=excluded.last_seen",
                    rusqlite::params![id, hostname, platform, version, bind_address, status, agent_count, created_at, last_seen],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))
    }

    pub async fn mark_daemon_disconnected(&self, id: Uuid) -> Result<(), StoreError> {
        let id_str = id.to_string();
        let status = enum_to_sql(&DaemonStatus::Disconnected);
        let last_seen = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE daemons SET status = ?1, last_seen = ?2 WHERE id = ?3",
                    rusqlite::params![status, last_seen, id_str],
                )?;
                Ok(n)
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Agent operations
    // -----------------------------------------------------------------------

    pub async fn get_agent(&self, id: Uuid) -> Result<Agent, StoreError> {
        let id_str = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, daemon_id, hostname, pid, cwd, command, status, capabilities,
                            created_at, updated_at, last_heartbeat, stopped_at, staleness,
                            daemon_reported_status, daemon_reported_at, metrics
                     FROM agents WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;

        let mut agent = row.ok_or(StoreError::NotFound)?;
        self.refresh_staleness(&mut agent);
        Ok(agent)
    }

    pub async fn list_agents(&self, filter: AgentFilter) -> Result<Vec<Agent>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, daemon_id, hostname, pid, cwd, command, status, capabilities,
                            created_at, updated_at, last_heartbeat, stopped_at, staleness,
                            daemon_reported_status, daemon_reported_at, metrics
                     FROM agents",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;

        let mut out: Vec<Agent> = rows
            .into_iter()
            .filter(|a| filter.daemon_id.map(|d| d == a.daemon_id).unwrap_or(true))
            .filter(|a| filter.status.map(|s| s == a.status).unwrap_or(true))
            .filter(|a| !(filter.exclude_stopped && a.status == AgentStatus::Stopped))
            .collect();
        for agent in &mut out {
            self.refresh_staleness(agent);
        }
        Ok(out)
    }

    /// Insert or update an agent. Rejects a change of owning daemon.
    pub async fn upsert_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let existing_daemon = self
            .conn
            .call({
                let id = agent.id.to_string();
                move |conn| {
                    let mut stmt = conn.prepare("SELECT daemon_id FROM agents WHERE id = ?1")?;
                    let mut rows = stmt.query(rusqlite::params![id])?;
                    match rows.next()? {
                        Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                        None => Ok(None),
                    }
                }
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;

        if let Some(existing) = existing_daemon {
            if existing != agent.daemon_id.to_string() {
                return Err(StoreError::OwnershipConflict);
            }
        }

        let id = agent.id.to_string();
        let daemon_id = agent.daemon_id.to_string();
        let hostname = agent.hostname.clone();
        let pid = agent.pid;
        let cwd = agent.cwd.clone();
        let command = agent.command.clone();
        let status = enum_to_sql(&agent.status);
        let capabilities = serde_json::to_string(&agent.capabilities).expect("serialize capabilities");
        let created_at = agent.created_at.to_rfc3339();
        let updated_at = Utc::now().to_rfc3339();
        let last_heartbeat = agent.last_heartbeat.to_rfc3339();
        let stopped_at = agent.stopped_at.map(|d| d.to_rfc3339());
        let staleness = enum_to_sql(&agent.staleness);
        let daemon_reported_status = agent.daemon_reported_status.clone();
        let daemon_reported_at = agent.daemon_reported_at.to_rfc3339();
        let metrics = serde_json::to_string(&agent.metrics).expect("serialize metrics");

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, daemon_id, hostname, pid, cwd, command, status, capabilities,
                        created_at, updated_at, last_heartbeat, stopped_at, staleness,
                        daemon_reported_status, daemon_reported_at, metrics)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
                     ON CONFLICT(id) DO UPDATE SET
                        hostname=excluded.hostname, pid=excluded.pid, cwd=excluded.cwd,
                        command=excluded.command, status=excluded.status, capabilities=excluded.capabilities,
                        updated_at=excluded.updated_at, last_heartbeat=excluded.last_heartbeat,
                        stopped_at=excluded.stopped_at, staleness=excluded.staleness,
                        daemon_reported_status=excluded.daemon_reported_status,
                        daemon_reported_at=excluded.daemon_reported_at, metrics=excluded.metrics",
                    rusqlite::params![
                        id, daemon_id, hostname, pid, cwd, command, status, capabilities,
                        created_at, updated_at, last_heartbeat, stopped_at, staleness,
                        daemon_reported_status, daemon_reported_at, metrics,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))
    }

    pub async fn mark_agent_stopped(&self, id: Uuid, _exit_code: i32, _reason: &str) -> Result<(), StoreError> {
        let id_str = id.to_string();
        let status = enum_to_sql(&AgentStatus::Stopped);
        let staleness = enum_to_sql(&Staleness::Disconnected);
        let stopped_at = Utc::now().to_rfc3339();
        let updated_at = stopped_at.clone();
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE agents SET status = ?1, stopped_at = ?2, staleness = ?3, updated_at = ?4 WHERE id = ?5",
                    rusqlite::params![status, stopped_at, staleness, updated_at, id_str],
                )?;
                Ok(n)
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Partition `live_agent_ids` (as reported by the daemon) against the
    /// store's current view for that daemon, marking the `stopped` set as
    /// stopped as a side effect.
    pub async fn reconcile_daemon_agents(&self, daemon_id: Uuid, live_agent_ids: &[Uuid]) -> Result<Reconciliation, StoreError> {
        let known = self
            .list_agents(AgentFilter {
                daemon_id: Some(daemon_id),
                status: None,
                exclude_stopped: false,
            })
            .await?;

        let live: HashSet<Uuid> = live_agent_ids.iter().copied().collect();
        let known_non_terminal: HashSet<Uuid> = known
            .iter()
            .filter(|a| a.status != AgentStatus::Stopped)
            .map(|a| a.id)
            .collect();
        let known_all: HashSet<Uuid> = known.iter().map(|a| a.id).collect();

        let new_agents: Vec<Uuid> = live.difference(&known_all).copied().collect();
        let stopped_agents: Vec<Uuid> = known_non_terminal.difference(&live).copied().collect();
        let existing_agents: Vec<Uuid> = known_non_terminal.intersection(&live).copied().collect();

        for id in &stopped_agents {
            self.mark_agent_stopped(*id, 0, "reconciliation: daemon no longer reports this agent").await?;
        }

        Ok(Reconciliation { new_agents, stopped_agents, existing_agents })
    }

    pub async fn update_heartbeat(&self, agent_id: Uuid, reported_status: &str, metrics: AgentMetrics) -> Result<(), StoreError> {
        let id_str = agent_id.to_string();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let reported_status = reported_status.to_string();
        let staleness = enum_to_sql(&Staleness::Fresh);
        let metrics_json = serde_json::to_string(&metrics).expect("serialize metrics");

        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE agents SET last_heartbeat = ?1, updated_at = ?1, daemon_reported_status = ?2,
                        daemon_reported_at = ?1, staleness = ?3, metrics = ?4 WHERE id = ?5",
                    rusqlite::params![now_str, reported_status, staleness, metrics_json, id_str],
                )?;
                Ok(n)
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn refresh_staleness(&self, agent: &mut Agent) {
        agent.staleness = compute_staleness(Utc::now(), agent.last_heartbeat, &self.staleness_config);
    }

    // -----------------------------------------------------------------------
    // Telegram bindings
    // -----------------------------------------------------------------------

    /// Create or replace the binding for a (chat id, agent id) pair. At most
    /// one binding exists per pair -- a second call for the same pair
    /// replaces the operator id and mode rather than adding a row.
    pub async fn create_binding(&self, binding: &TelegramBinding) -> Result<(), StoreError> {
        let id = binding.id.to_string();
        let chat_id = binding.chat_id;
        let agent_id = binding.agent_id.to_string();
        let operator_id = binding.operator_id.clone();
        let mode = enum_to_sql(&binding.mode);
        let created_at = binding.created_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO telegram_bindings (id, chat_id, agent_id, operator_id, mode, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6)
                     ON CONFLICT(chat_id, agent_id) DO UPDATE SET
                        operator_id=excluded.operator_id, mode=excluded.mode",
                    rusqlite::params![id, chat_id, agent_id, operator_id, mode, created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))
    }

    pub async fn delete_binding(&self, chat_id: i64, agent_id: Uuid) -> Result<(), StoreError> {
        let agent_id_str = agent_id.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM telegram_bindings WHERE chat_id = ?1 AND agent_id = ?2",
                    rusqlite::params![chat_id, agent_id_str],
                )?)
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn get_binding(&self, chat_id: i64, agent_id: Uuid) -> Result<Option<TelegramBinding>, StoreError> {
        let agent_id_str = agent_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, chat_id, agent_id, operator_id, mode, created_at
                     FROM telegram_bindings WHERE chat_id = ?1 AND agent_id = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![chat_id, agent_id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_binding(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))
    }

    pub async fn list_bindings(&self) -> Result<Vec<TelegramBinding>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT id, chat_id, agent_id, operator_id, mode, created_at FROM telegram_bindings")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_binding(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let id = session.id.to_string();
        let operator_id = session.operator_id.clone();
        let session_type = enum_to_sql(&session.session_type);
        let token = session.token.clone();
        let expires_at = session.expires_at.to_rfc3339();
        let scopes = serde_json::to_string(&session.scopes).expect("serialize scopes");

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, operator_id, type, token, expires_at, scopes) VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![id, operator_id, session_type, token, expires_at, scopes],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))
    }

    pub async fn get_session_by_token(&self, token: &str) -> Result<Session, StoreError> {
        let token = token.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, operator_id, type, token, expires_at, scopes FROM sessions WHERE token = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![token])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_session(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
        row.ok_or(StoreError::NotFound)
    }

    pub async fn delete_session(&self, id: Uuid) -> Result<(), StoreError> {
        let id_str = id.to_string();
        let changed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM sessions WHERE id = ?1", rusqlite::params![id_str])?))
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<Vec<ListedSession>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT id, operator_id, type, token, expires_at, scopes FROM sessions")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_session(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
        Ok(rows.iter().map(ListedSession::from).collect())
    }

    // -----------------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------------

    pub async fn append_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let id = event.id.to_string();
        let operator_id = event.operator_id.clone();
        let event_type = event.event_type.clone();
        let agent_id = event.agent_id.map(|u| u.to_string());
        let payload = event.payload.to_string();
        let result = enum_to_sql(&event.result);
        let timestamp = event.timestamp.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO audit_events (id, operator_id, event_type, agent_id, payload, result, timestamp)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![id, operator_id, event_type, agent_id, payload, result, timestamp],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| StoreError::BackendUnavailable(e.to_string()))
    }

    pub async fn close(&self) {
        // tokio_rusqlite::Connection closes its worker thread on drop; explicit
        // method kept to mirror the graceful-shutdown sequence in spec form.
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let id_str: String = row.get(0)?;
    let daemon_id_str: String = row.get(1)?;
    let status_str: String = row.get(6)?;
    let capabilities_str: String = row.get(7)?;
    let created_at_str: String = row.get(8)?;
    let updated_at_str: String = row.get(9)?;
    let last_heartbeat_str: String = row.get(10)?;
    let stopped_at_str: Option<String> = row.get(11)?;
    let staleness_str: String = row.get(12)?;
    let daemon_reported_at_str: String = row.get(14)?;
    let metrics_str: String = row.get(15)?;

    Ok(Agent {
        id: parse_uuid(&id_str),
        daemon_id: parse_uuid(&daemon_id_str),
        hostname: row.get(2)?,
        pid: row.get(3)?,
        cwd: row.get(4)?,
        command: row.get(5)?,
        status: enum_from_sql(&status_str),
        capabilities: serde_json::from_str(&capabilities_str).expect("valid json"),
        created_at: parse_rfc3339(&created_at_str),
        updated_at: parse_rfc3339(&updated_at_str),
        last_heartbeat: parse_rfc3339(&last_heartbeat_str),
        stopped_at: stopped_at_str.map(|s| parse_rfc3339(&s)),
        staleness: enum_from_sql(&staleness_str),
        daemon_reported_status: row.get(13)?,
        daemon_reported_at: parse_rfc3339(&daemon_reported_at_str),
        metrics: serde_json::from_str(&metrics_str).expect("valid json"),
    })
}

fn row_to_binding(row: &rusqlite::Row<'_>) -> rusqlite::Result<TelegramBinding> {
    let id_str: String = row.get(0)?;
    let agent_id_str: String = row.get(2)?;
    let mode_str: String = row.get(4)?;
    let created_at_str: String = row.get(5)?;
    Ok(TelegramBinding {
        id: parse_uuid(&id_str),
        chat_id: row.get(1)?,
        agent_id: parse_uuid(&agent_id_str),
        operator_id: row.get(3)?,
        mode: enum_from_sql(&mode_str),
        created_at: parse_rfc3339(&created_at_str),
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let id_str: String = row.get(0)?;
    let type_str: String = row.get(2)?;
    let expires_at_str: String = row.get(4)?;
    let scopes_str: String = row.get(5)?;
    Ok(Session {
        id: parse_uuid(&id_str),
        operator_id: row.get(1)?,
        session_type: enum_from_sql(&type_str),
        token: row.get(3)?,
        expires_at: parse_rfc3339(&expires_at_str),
        scopes: serde_json::from_str(&scopes_str).expect("valid json"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn store() -> Store {
        Store::new_in_memory(StalenessConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_and_get_agent_round_trips() {
        let store = store().await;
        let daemon = Daemon::new("box", "linux", "1.0.0");
        store.upsert_daemon(&daemon).await.unwrap();
        let agent = Agent::new(daemon.id, "box", 123, "/tmp", "clud");
        store.upsert_agent(&agent).await.unwrap();

        let fetched = store.get_agent(agent.id).await.unwrap();
        assert_eq!(fetched.id, agent.id);
        assert_eq!(fetched.daemon_id, daemon.id);
        assert_eq!(fetched.staleness, Staleness::Fresh);
    }

    #[tokio::test]
    async fn upsert_agent_rejects_daemon_change() {
        let store = store().await;
        let d1 = Daemon::new("box1", "linux", "1.0.0");
        let d2 = Daemon::new("box2", "linux", "1.0.0");
        store.upsert_daemon(&d1).await.unwrap();
        store.upsert_daemon(&d2).await.unwrap();

        let mut agent = Agent::new(d1.id, "box1", 1, "/tmp", "clud");
        store.upsert_agent(&agent).await.unwrap();

        agent.daemon_id = d2.id;
        let err = store.upsert_agent(&agent).await.unwrap_err();
        assert!(matches!(err, StoreError::OwnershipConflict));
    }

    #[tokio::test]
    async fn mark_agent_stopped_is_terminal() {
        let store = store().await;
        let daemon = Daemon::new("box", "linux", "1.0.0");
        store.upsert_daemon(&daemon).await.unwrap();
        let agent = Agent::new(daemon.id, "box", 1, "/tmp", "clud");
        store.upsert_agent(&agent).await.unwrap();

        store.mark_agent_stopped(agent.id, 0, "stopped by operator").await.unwrap();
        let fetched = store.get_agent(agent.id).await.unwrap();
        assert_eq!(fetched.status, AgentStatus::Stopped);
        assert!(fetched.stopped_at.is_some());
    }

    #[tokio::test]
    async fn heartbeat_staleness_disconnected_after_90s() {
        let store = store().await;
        let daemon = Daemon::new("box", "linux", "1.0.0");
        store.upsert_daemon(&daemon).await.unwrap();
        let mut agent = Agent::new(daemon.id, "box", 1, "/tmp", "clud");
        agent.last_heartbeat = Utc::now() - Duration::seconds(120);
        store.upsert_agent(&agent).await.unwrap();

        let fetched = store.get_agent(agent.id).await.unwrap();
        assert_eq!(fetched.staleness, Staleness::Disconnected);
    }

    #[tokio::test]
    async fn update_heartbeat_resets_to_fresh() {
        let store = store().await;
        let daemon = Daemon::new("box", "linux", "1.0.0");
        store.upsert_daemon(&daemon).await.unwrap();
        let mut agent = Agent::new(daemon.id, "box", 1, "/tmp", "clud");
        agent.last_heartbeat = Utc::now() - Duration::seconds(200);
        store.upsert_agent(&agent).await.unwrap();

        store.update_heartbeat(agent.id, "running", AgentMetrics::default()).await.unwrap();
        let fetched = store.get_agent(agent.id).await.unwrap();
        assert_eq!(fetched.staleness, Staleness::Fresh);
    }

    #[tokio::test]
    async fn reconcile_partitions_new_stopped_existing() {
        let store = store().await;
        let daemon = Daemon::new("box", "linux", "1.0.0");
        store.upsert_daemon(&daemon).await.unwrap();

        let keep = Agent::new(daemon.id, "box", 1, "/tmp", "a");
        let drop = Agent::new(daemon.id, "box", 2, "/tmp", "b");
        store.upsert_agent(&keep).await.unwrap();
        store.upsert_agent(&drop).await.unwrap();

        let new_id = Uuid::new_v4();
        let live_ids = vec![keep.id, new_id];

        let recon = store.reconcile_daemon_agents(daemon.id, &live_ids).await.unwrap();
        assert_eq!(recon.new_agents, vec![new_id]);
        assert_eq!(recon.stopped_agents, vec![drop.id]);
        assert_eq!(recon.existing_agents, vec![keep.id]);

        let fetched = store.get_agent(drop.id).await.unwrap();
        assert_eq!(fetched.status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let store = store().await;
        let session = Session::new("op-1", SessionType::Web, "tok-abc", Utc::now() + Duration::hours(1));
        store.create_session(&session).await.unwrap();

        let fetched = store.get_session_by_token("tok-abc").await.unwrap();
        assert_eq!(fetched.id, session.id);

        let listed = store.list_sessions().await.unwrap();
        assert_eq!(listed.len(), 1);

        store.delete_session(session.id).await.unwrap();
        assert!(matches!(store.get_session_by_token("tok-abc").await.unwrap_err(), StoreError::NotFound));
    }

    #[tokio::test]
    async fn audit_event_append_only() {
        let store = store().await;
        let event = AuditEvent::new("op-1", "agent_stop", None, AuditResult::Success);
        store.append_audit_event(&event).await.unwrap();
    }

    #[tokio::test]
    async fn get_agent_not_found() {
        let store = store().await;
        let err = store.get_agent(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn create_binding_replaces_existing_for_same_chat_and_agent() {
        let store = store().await;
        let agent_id = Uuid::new_v4();
        let first = TelegramBinding::new(42, agent_id, "op-1");
        store.create_binding(&first).await.unwrap();

        let mut second = TelegramBinding::new(42, agent_id, "op-2");
        second.mode = BindingMode::Observer;
        store.create_binding(&second).await.unwrap();

        let bindings = store.list_bindings().await.unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].operator_id, "op-2");
        assert_eq!(bindings[0].mode, BindingMode::Observer);
    }

    #[tokio::test]
    async fn get_and_delete_binding_round_trip() {
        let store = store().await;
        let agent_id = Uuid::new_v4();
        let binding = TelegramBinding::new(7, agent_id, "op-1");
        store.create_binding(&binding).await.unwrap();

        let fetched = store.get_binding(7, agent_id).await.unwrap().unwrap();
        assert_eq!(fetched.id, binding.id);

        store.delete_binding(7, agent_id).await.unwrap();
        assert!(store.get_binding(7, agent_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_binding_not_found() {
        let store = store().await;
        let err = store.delete_binding(99, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn on_disk_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.db");

        let daemon = Daemon::new("box", "linux", "1.0.0");
        let agent = Agent::new(daemon.id, "box", 123, "/tmp", "clud");
        {
            let store = Store::new(&path, StalenessConfig::default()).await.unwrap();
            store.upsert_daemon(&daemon).await.unwrap();
            store.upsert_agent(&agent).await.unwrap();
        }

        let reopened = Store::new(&path, StalenessConfig::default()).await.unwrap();
        let fetched = reopened.get_agent(agent.id).await.unwrap();
        assert_eq!(fetched.id, agent.id);
        assert_eq!(fetched.daemon_id, daemon.id);
    }
}
