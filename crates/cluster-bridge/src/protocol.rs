use std::collections::HashMap;

use cluster_core::models::AgentMetrics;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// An agent entry as reported inside `daemon_register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentEntry {
    pub id: Uuid,
    pub status: String,
    #[serde(default)]
    pub metrics: AgentMetrics,
    pub pty_connection_id: String,
}

/// An agent status update as reported inside `heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAgentEntry {
    pub id: Uuid,
    pub status: String,
    #[serde(default)]
    pub metrics: AgentMetrics,
}

/// The three disjoint id sets returned to a reconnecting daemon in `register_ack`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationPayload {
    pub new_agents: Vec<Uuid>,
    pub stopped_agents: Vec<Uuid>,
    pub existing_agents: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// Inbound (daemon -> cluster), the daemon control channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlInbound {
    DaemonRegister {
        daemon_id: Uuid,
        hostname: String,
        platform: String,
        version: String,
        timestamp: i64,
        #[serde(default)]
        agents: Vec<RegisterAgentEntry>,
    },
    Heartbeat {
        daemon_id: Uuid,
        #[serde(default)]
        agents: Vec<HeartbeatAgentEntry>,
        #[serde(default)]
        pty_connections: Vec<serde_json::Value>,
        timestamp: i64,
    },
    AgentRegister {
        agent_id: Uuid,
        daemon_id: Uuid,
        pid: i64,
        cwd: String,
        command: String,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        capabilities: Vec<String>,
        pty_connection_id: String,
        timestamp: i64,
    },
    AgentStopped {
        agent_id: Uuid,
        exit_code: i32,
        #[serde(default)]
        signal: Option<i32>,
        reason: String,
        #[serde(default)]
        last_output: Vec<String>,
        timestamp: i64,
    },
}

// ---------------------------------------------------------------------------
// Outbound (cluster -> daemon), the daemon control channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlOutbound {
    RegisterAck {
        daemon_id: Uuid,
        session_token: String,
        heartbeat_interval: u64,
        max_agents_per_pty_connection: u32,
        reconciliation: ReconciliationPayload,
    },
    AgentRegisterAck {
        agent_id: Uuid,
        pty_ws_url: String,
    },
    AgentStop {
        agent_id: Uuid,
        force: bool,
        timeout_seconds: u64,
    },
    AgentExec {
        agent_id: Uuid,
        command: String,
        cwd: String,
        #[serde(default)]
        env: HashMap<String, String>,
        timeout_seconds: u64,
    },
    VscodeLaunch {
        agent_id: Uuid,
        port: u16,
        auth_token: String,
    },
    GetScrollback {
        agent_id: Uuid,
        lines: u32,
    },
    TerminalInput {
        agent_id: Uuid,
        /// Hex-encoded raw bytes -- preserves binary content inside the JSON envelope.
        data: String,
    },
}

// ---------------------------------------------------------------------------
// Intent: the operator-facing command set dispatched via ControlSession::dispatch_intent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    AgentStop { agent_id: Uuid, force: bool, timeout_seconds: u64 },
    AgentExec { agent_id: Uuid, command: String, cwd: String, env: HashMap<String, String>, timeout_seconds: u64 },
    VscodeLaunch { agent_id: Uuid, port: u16, auth_token: String },
    GetScrollback { agent_id: Uuid, lines: u32 },
    TerminalInput { agent_id: Uuid, bytes: Vec<u8> },
}

impl Intent {
    pub fn agent_id(&self) -> Uuid {
        match self {
            Intent::AgentStop { agent_id, .. }
            | Intent::AgentExec { agent_id, .. }
            | Intent::VscodeLaunch { agent_id, .. }
            | Intent::GetScrollback { agent_id, .. }
            | Intent::TerminalInput { agent_id, .. } => *agent_id,
        }
    }
}

impl From<Intent> for ControlOutbound {
    fn from(intent: Intent) -> Self {
        match intent {
            Intent::AgentStop { agent_id, force, timeout_seconds } => {
                ControlOutbound::AgentStop { agent_id, force, timeout_seconds }
            }
            Intent::AgentExec { agent_id, command, cwd, env, timeout_seconds } => {
                ControlOutbound::AgentExec { agent_id, command, cwd, env, timeout_seconds }
            }
            Intent::VscodeLaunch { agent_id, port, auth_token } => {
                ControlOutbound::VscodeLaunch { agent_id, port, auth_token }
            }
            Intent::GetScrollback { agent_id, lines } => ControlOutbound::GetScrollback { agent_id, lines },
            Intent::TerminalInput { agent_id, bytes } => {
                ControlOutbound::TerminalInput { agent_id, data: hex::encode(bytes) }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ClusterEvent: the event subscription channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    DaemonConnected { daemon: serde_json::Value },
    DaemonDisconnected { daemon_id: Uuid },
    AgentRegister { agent: serde_json::Value },
    AgentUpdated { agent: serde_json::Value },
    AgentStopped { agent_id: Uuid, exit_code: i32, reason: String },
}

pub fn parse_inbound(text: &str) -> Result<ControlInbound, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

pub fn encode_outbound(msg: &ControlOutbound) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Namespace used to derive a stable pool id from a daemon-chosen
/// `pty_connection_id` string. Registry's `PoolChannels`/`AgentToPool` maps
/// are keyed by `Uuid`, but the wire protocol's pool identifier is an
/// opaque string (e.g. `"p-1"`) -- UUIDv5 gives the same string the same id
/// every time without the registry needing to know about strings at all.
const POOL_ID_NAMESPACE: Uuid = Uuid::from_u128(0x3c1f_0a5e_3a9b_4b7e_9e0d_2f6a7c8e1b4d);

pub fn pool_id_from_connection_id(pty_connection_id: &str) -> Uuid {
    Uuid::new_v5(&POOL_ID_NAMESPACE, pty_connection_id.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_register_round_trips_flat_fields() {
        let msg = ControlInbound::DaemonRegister {
            daemon_id: Uuid::new_v4(),
            hostname: "box".to_string(),
            platform: "linux".to_string(),
            version: "1.0.0".to_string(),
            timestamp: 1_700_000_000,
            agents: Vec::new(),
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"type\":\"daemon_register\""));
        assert!(text.contains("\"hostname\":\"box\""));
        let parsed: ControlInbound = serde_json::from_str(&text).unwrap();
        assert!(matches!(parsed, ControlInbound::DaemonRegister { .. }));
    }

    #[test]
    fn unknown_type_is_malformed() {
        let err = parse_inbound(r#"{"type":"not_a_real_type"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn terminal_input_intent_hex_encodes_bytes() {
        let intent = Intent::TerminalInput { agent_id: Uuid::new_v4(), bytes: vec![0x0a, 0xff] };
        let outbound: ControlOutbound = intent.into();
        match outbound {
            ControlOutbound::TerminalInput { data, .. } => assert_eq!(data, "0aff"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn agent_register_ack_has_flat_pty_ws_url() {
        let msg = ControlOutbound::AgentRegisterAck { agent_id: Uuid::new_v4(), pty_ws_url: "ws://x/ws/pty/pool-1".to_string() };
        let text = encode_outbound(&msg).unwrap();
        assert!(text.contains("\"pty_ws_url\":\"ws://x/ws/pty/pool-1\""));
    }

    #[test]
    fn pool_id_from_connection_id_is_stable() {
        let a = pool_id_from_connection_id("p-1");
        let b = pool_id_from_connection_id("p-1");
        let c = pool_id_from_connection_id("p-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
