use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Idle,
    Error,
    Stopped,
}

/// Freshness band derived from `last_heartbeat`, never persisted as ground
/// truth -- always recomputed on read by [`crate::staleness::compute_staleness`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Staleness {
    Fresh,
    Stale,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_mb: i64,
    #[serde(default)]
    pub uptime_seconds: i64,
    #[serde(default)]
    pub pty_bytes_sent: i64,
    #[serde(default)]
    pub pty_bytes_received: i64,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_mb: 0,
            uptime_seconds: 0,
            pty_bytes_sent: 0,
            pty_bytes_received: 0,
        }
    }
}

/// An agent tracked by the cluster. State is owned by the daemon (source of
/// truth); this is an eventually-consistent view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub daemon_id: Uuid,
    pub hostname: String,
    pub pid: i64,
    pub cwd: String,
    pub command: String,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,

    pub staleness: Staleness,

    pub daemon_reported_status: String,
    pub daemon_reported_at: DateTime<Utc>,

    pub metrics: AgentMetrics,
}

impl Agent {
    pub fn new(daemon_id: Uuid, hostname: impl Into<String>, pid: i64, cwd: impl Into<String>, command: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            daemon_id,
            hostname: hostname.into(),
            pid,
            cwd: cwd.into(),
            command: command.into(),
            status: AgentStatus::Running,
            capabilities: vec!["terminal".to_string()],
            created_at: now,
            updated_at: now,
            last_heartbeat: now,
            stopped_at: None,
            staleness: Staleness::Fresh,
            daemon_reported_status: "running".to_string(),
            daemon_reported_at: now,
            metrics: AgentMetrics::default(),
        }
    }
}

/// Filter applied by [`crate::store::Store::list_agents`].
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub daemon_id: Option<Uuid>,
    pub status: Option<AgentStatus>,
    pub exclude_stopped: bool,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    Connected,
    Disconnected,
    Error,
}

/// A local daemon process on a developer machine, tracking zero or more agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Daemon {
    pub id: Uuid,
    pub hostname: String,
    pub platform: String,
    pub version: String,
    pub bind_address: String,
    pub status: DaemonStatus,
    pub agent_count: i64,

    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Daemon {
    pub fn new(hostname: impl Into<String>, platform: impl Into<String>, version: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            hostname: hostname.into(),
            platform: platform.into(),
            version: version.into(),
            bind_address: "127.0.0.1:7565".to_string(),
            status: DaemonStatus::Connected,
            agent_count: 0,
            created_at: now,
            last_seen: now,
        }
    }
}

// ---------------------------------------------------------------------------
// TelegramBinding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    Active,
    Observer,
}

/// Links a Telegram chat to an agent. One controlling chat per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramBinding {
    pub id: Uuid,
    pub chat_id: i64,
    pub agent_id: Uuid,
    pub operator_id: String,
    pub mode: BindingMode,
    pub created_at: DateTime<Utc>,
}

impl TelegramBinding {
    pub fn new(chat_id: i64, agent_id: Uuid, operator_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            agent_id,
            operator_id: operator_id.into(),
            mode: BindingMode::Active,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Web,
    Telegram,
    Api,
}

/// An authenticated operator session used for web UI, API, and VS Code launch access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub operator_id: String,
    pub session_type: SessionType,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl Session {
    pub fn new(operator_id: impl Into<String>, session_type: SessionType, token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operator_id: operator_id.into(),
            session_type,
            token: token.into(),
            expires_at,
            scopes: Vec::new(),
        }
    }
}

/// A [`Session`] view with the token withheld -- what `ListSessions` returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedSession {
    pub id: Uuid,
    pub operator_id: String,
    pub session_type: SessionType,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl From<&Session> for ListedSession {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id,
            operator_id: s.operator_id.clone(),
            session_type: s.session_type,
            expires_at: s.expires_at,
            scopes: s.scopes.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Error,
}

/// Append-only record of an operator action, for security and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub operator_id: String,
    pub event_type: String,
    pub agent_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub result: AuditResult,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(operator_id: impl Into<String>, event_type: impl Into<String>, agent_id: Option<Uuid>, result: AuditResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            operator_id: operator_id.into(),
            event_type: event_type.into(),
            agent_id,
            payload: serde_json::Value::Object(serde_json::Map::new()),
            result,
            timestamp: Utc::now(),
        }
    }
}
