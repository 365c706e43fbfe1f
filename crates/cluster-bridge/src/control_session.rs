use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use cluster_core::config::{ControlConfig, NetworkConfig};
use cluster_core::error::StoreError;
use cluster_core::models::{Agent, AuditEvent, AuditResult, Daemon, DaemonStatus};
use cluster_core::store::Store;
use cluster_registry::{ChannelHandle, Registry};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::auth::TokenIssuer;
use crate::event_bus::EventBus;
use crate::protocol::{
    self, ClusterEvent, ControlInbound, ControlOutbound, HeartbeatAgentEntry, Intent,
    ProtocolError, ReconciliationPayload, RegisterAgentEntry,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("ownership conflict: {0}")]
    OwnershipConflict(String),
    #[error("agent not found")]
    AgentNotFound,
    #[error("daemon unavailable")]
    DaemonUnavailable,
    #[error("backpressure: outbound queue is full")]
    BackpressureDrop,
    #[error("store unavailable")]
    StoreUnavailable,
}

impl SessionError {
    /// True for errors that end the channel outright; false for errors that
    /// are reported back on the channel (or to the operator caller) while the
    /// channel stays open. Mirrors the §7 propagation policy: protocol
    /// violations are fatal to the channel, everything else is recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::ProtocolViolation(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitRegister,
    Live,
    Dead,
}

/// The handle `Registry::DaemonControl` stores for a daemon's control
/// channel. Implements `ChannelHandle` for the registry's generic
/// close-on-supersede path, and additionally exposes a bounded outbound
/// queue that `dispatch_intent` writes to after downcasting the handle
/// `Registry::lookup_daemon` hands back.
pub struct ControlChannelHandle {
    outbound_tx: mpsc::Sender<ControlOutbound>,
    closed: AtomicBool,
    close_tx: watch::Sender<Option<String>>,
}

impl ControlChannelHandle {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<ControlOutbound>, watch::Receiver<Option<String>>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = watch::channel(None);
        let handle = Arc::new(Self { outbound_tx, closed: AtomicBool::new(false), close_tx });
        (handle, outbound_rx, close_rx)
    }

    /// Enqueue an outbound message without blocking the caller. A full queue
    /// or a channel that already closed both surface as a typed error rather
    /// than blocking -- see §4.4's writer-never-blocks-the-reader rule.
    pub fn try_send_outbound(&self, msg: ControlOutbound) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::DaemonUnavailable);
        }
        self.outbound_tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::BackpressureDrop,
            mpsc::error::TrySendError::Closed(_) => SessionError::DaemonUnavailable,
        })
    }
}

impl ChannelHandle for ControlChannelHandle {
    fn close(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.close_tx.send(Some(reason.to_string()));
    }
}

enum Classified {
    Known(ControlInbound),
    Unknown(String),
}

/// Split "well-formed JSON we don't recognize" from "not well-formed JSON at
/// all" -- the wire protocol says unknown `type` values are logged and
/// ignored in LIVE, not fatal, which a bare `serde(tag = "type")` decode
/// can't distinguish from a genuinely malformed frame on its own.
fn classify_inbound(raw: &str) -> Result<Classified, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let type_tag = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProtocolError::Malformed("missing \"type\" field".to_string()))?
        .to_string();

    match type_tag.as_str() {
        "daemon_register" | "heartbeat" | "agent_register" | "agent_stopped" => serde_json::from_value(value)
            .map(Classified::Known)
            .map_err(|e| ProtocolError::Malformed(e.to_string())),
        _ => Ok(Classified::Unknown(type_tag)),
    }
}

/// One instance per live daemon control channel; owned exclusively by that
/// channel's read task (see module docs in `ws.rs`). Not `Send`-shared --
/// the only cross-task entry point is the free function [`dispatch_intent`],
/// which goes through `Registry` rather than through a live `ControlSession`.
pub struct ControlSession {
    store: Arc<Store>,
    registry: Arc<Registry>,
    event_bus: Arc<EventBus>,
    token_issuer: Arc<dyn TokenIssuer>,
    control: ControlConfig,
    network: NetworkConfig,
    channel_handle: Arc<ControlChannelHandle>,
    bind_address: String,
    state: State,
    daemon_id: Option<Uuid>,
    daemon: Option<Daemon>,
}

impl ControlSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        registry: Arc<Registry>,
        event_bus: Arc<EventBus>,
        token_issuer: Arc<dyn TokenIssuer>,
        control: ControlConfig,
        network: NetworkConfig,
        bind_address: String,
        channel_handle: Arc<ControlChannelHandle>,
    ) -> Self {
        Self {
            store,
            registry,
            event_bus,
            token_issuer,
            control,
            network,
            channel_handle,
            bind_address,
            state: State::AwaitRegister,
            daemon_id: None,
            daemon: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn daemon_id(&self) -> Option<Uuid> {
        self.daemon_id
    }

    /// Handle one inbound text frame, returning the (at most one) outbound
    /// reply to send back on this same channel. `Err` variants where
    /// [`SessionError::is_fatal`] is false are recoverable: the caller should
    /// report them (e.g. as an inline error frame) and keep reading.
    pub async fn handle_message(&mut self, raw: &str) -> Result<Option<ControlOutbound>, SessionError> {
        let classified = classify_inbound(raw).map_err(|e| SessionError::ProtocolViolation(e.to_string()))?;

        let inbound = match classified {
            Classified::Unknown(type_tag) => {
                if self.state == State::AwaitRegister {
                    return Err(SessionError::ProtocolViolation(format!(
                        "expected daemon_register to open the channel, got unknown type \"{type_tag}\""
                    )));
                }
                tracing::debug!(%type_tag, "ignoring unknown control message type");
                return Ok(None);
            }
            Classified::Known(inbound) => inbound,
        };

        match (self.state, inbound) {
            (State::AwaitRegister, ControlInbound::DaemonRegister { daemon_id, hostname, platform, version, agents, .. }) => {
                self.handle_register(daemon_id, hostname, platform, version, agents).await.map(Some)
            }
            (State::AwaitRegister, _) => {
                Err(SessionError::ProtocolViolation("expected daemon_register to open the channel".to_string()))
            }
            (State::Live, ControlInbound::DaemonRegister { .. }) => {
                Err(SessionError::ProtocolViolation("daemon already registered on this channel".to_string()))
            }
            (State::Live, ControlInbound::Heartbeat { daemon_id, agents, .. }) => {
                self.handle_heartbeat(daemon_id, agents).await?;
                Ok(None)
            }
            (State::Live, ControlInbound::AgentRegister { agent_id, daemon_id, pid, cwd, command, capabilities, pty_connection_id, .. }) => {
                self.handle_agent_register(agent_id, daemon_id, pid, cwd, command, capabilities, pty_connection_id).await.map(Some)
            }
            (State::Live, ControlInbound::AgentStopped { agent_id, exit_code, reason, .. }) => {
                self.handle_agent_stopped(agent_id, exit_code, reason).await?;
                Ok(None)
            }
            (State::Dead, _) => Err(SessionError::ProtocolViolation("channel is dead".to_string())),
        }
    }

    async fn handle_register(
        &mut self,
        daemon_id: Uuid,
        hostname: String,
        platform: String,
        version: String,
        agents: Vec<RegisterAgentEntry>,
    ) -> Result<ControlOutbound, SessionError> {
        let now = Utc::now();
        let daemon = Daemon {
            id: daemon_id,
            hostname,
            platform,
            version,
            bind_address: self.bind_address.clone(),
            status: DaemonStatus::Connected,
            agent_count: agents.len() as i64,
            created_at: now,
            last_seen: now,
        };
        self.store.upsert_daemon(&daemon).await.map_err(|_| SessionError::StoreUnavailable)?;

        let live_ids: Vec<Uuid> = agents.iter().map(|a| a.id).collect();
        let reconciliation = self
            .store
            .reconcile_daemon_agents(daemon_id, &live_ids)
            .await
            .map_err(|_| SessionError::StoreUnavailable)?;

        self.daemon = Some(daemon);
        self.daemon_id = Some(daemon_id);
        self.state = State::Live;

        let handle: Arc<dyn ChannelHandle> = self.channel_handle.clone();
        self.registry.register_daemon_channel(daemon_id, handle);

        let session_token = self.token_issuer.issue_token(daemon_id).await;

        for stopped_id in &reconciliation.stopped_agents {
            self.event_bus
                .publish(ClusterEvent::AgentStopped {
                    agent_id: *stopped_id,
                    exit_code: 0,
                    reason: "reconciliation: daemon no longer reports this agent".to_string(),
                })
                .await;
        }
        self.event_bus
            .publish(ClusterEvent::DaemonConnected {
                daemon: serde_json::to_value(self.daemon.as_ref().expect("just set")).expect("serialize daemon snapshot"),
            })
            .await;

        self.audit(format!("daemon:{daemon_id}"), "daemon_register", None, AuditResult::Success).await;

        Ok(ControlOutbound::RegisterAck {
            daemon_id,
            session_token,
            heartbeat_interval: self.control.heartbeat_interval_secs,
            max_agents_per_pty_connection: self.control.max_agents_per_pty_connection,
            reconciliation: ReconciliationPayload {
                new_agents: reconciliation.new_agents,
                stopped_agents: reconciliation.stopped_agents,
                existing_agents: reconciliation.existing_agents,
            },
        })
    }

    async fn handle_heartbeat(&mut self, daemon_id: Uuid, agents: Vec<HeartbeatAgentEntry>) -> Result<(), SessionError> {
        if Some(daemon_id) != self.daemon_id {
            return Err(SessionError::ProtocolViolation(
                "heartbeat daemon_id does not match this channel's registered daemon".to_string(),
            ));
        }

        if let Some(daemon) = self.daemon.as_mut() {
            daemon.last_seen = Utc::now();
            daemon.status = DaemonStatus::Connected;
            daemon.agent_count = agents.len() as i64;
            if let Err(e) = self.store.upsert_daemon(daemon).await {
                tracing::warn!(%daemon_id, error = %e, "heartbeat: failed to refresh daemon last_seen, continuing");
            }
        }

        for entry in agents {
            match self.store.update_heartbeat(entry.id, &entry.status, entry.metrics).await {
                Ok(()) => match self.store.get_agent(entry.id).await {
                    Ok(agent) => {
                        self.event_bus
                            .publish(ClusterEvent::AgentUpdated { agent: serde_json::to_value(&agent).expect("serialize agent") })
                            .await;
                    }
                    Err(e) => tracing::warn!(agent_id = %entry.id, error = %e, "heartbeat: failed to re-read updated agent"),
                },
                Err(e) => tracing::warn!(agent_id = %entry.id, error = %e, "heartbeat: failed to update agent, skipping"),
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_agent_register(
        &mut self,
        agent_id: Uuid,
        daemon_id: Uuid,
        pid: i64,
        cwd: String,
        command: String,
        capabilities: Vec<String>,
        pty_connection_id: String,
    ) -> Result<ControlOutbound, SessionError> {
        if Some(daemon_id) != self.daemon_id {
            return Err(SessionError::ProtocolViolation(
                "agent_register daemon_id does not match this channel's registered daemon".to_string(),
            ));
        }

        let existing = match self.store.get_agent(agent_id).await {
            Ok(agent) => Some(agent),
            Err(StoreError::NotFound) => None,
            Err(_) => return Err(SessionError::StoreUnavailable),
        };

        if let Some(existing) = &existing {
            if existing.daemon_id != daemon_id {
                self.audit(format!("daemon:{daemon_id}"), "agent_register", Some(agent_id), AuditResult::Error).await;
                return Err(SessionError::OwnershipConflict(format!(
                    "agent {agent_id} is already owned by daemon {}",
                    existing.daemon_id
                )));
            }
        }

        let hostname = self.daemon.as_ref().map(|d| d.hostname.clone()).unwrap_or_default();
        let mut agent = existing.unwrap_or_else(|| Agent::new(daemon_id, hostname, pid, cwd.clone(), command.clone()));
        agent.pid = pid;
        agent.cwd = cwd;
        agent.command = command;
        agent.capabilities = capabilities;
        agent.updated_at = Utc::now();

        self.store.upsert_agent(&agent).await.map_err(|e| match e {
            StoreError::OwnershipConflict => SessionError::OwnershipConflict(format!("agent {agent_id} is owned by a different daemon")),
            _ => SessionError::StoreUnavailable,
        })?;

        let pool_id = protocol::pool_id_from_connection_id(&pty_connection_id);
        self.registry.bind_agent_to_pool(agent_id, pool_id);

        self.event_bus
            .publish(ClusterEvent::AgentRegister { agent: serde_json::to_value(&agent).expect("serialize agent") })
            .await;

        self.audit(format!("daemon:{daemon_id}"), "agent_register", Some(agent_id), AuditResult::Success).await;

        let pty_ws_url = format!("{}/ws/pty/{}", self.network.public_ws_base.trim_end_matches('/'), pty_connection_id);
        Ok(ControlOutbound::AgentRegisterAck { agent_id, pty_ws_url })
    }

    async fn handle_agent_stopped(&mut self, agent_id: Uuid, exit_code: i32, reason: String) -> Result<(), SessionError> {
        let operator_id = self.daemon_id.map(|id| format!("daemon:{id}")).unwrap_or_else(|| "daemon:unknown".to_string());

        match self.store.mark_agent_stopped(agent_id, exit_code, &reason).await {
            Ok(()) => {
                self.registry.unbind_agent(agent_id);
                self.event_bus.publish(ClusterEvent::AgentStopped { agent_id, exit_code, reason }).await;
                self.audit(operator_id, "agent_stop", Some(agent_id), AuditResult::Success).await;
                Ok(())
            }
            Err(StoreError::NotFound) => {
                tracing::warn!(%agent_id, "agent_stopped for an unknown agent, ignoring");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%agent_id, error = %e, "failed to record agent_stopped, continuing");
                self.audit(operator_id, "agent_stop", Some(agent_id), AuditResult::Error).await;
                Ok(())
            }
        }
    }

    async fn audit(&self, operator_id: String, event_type: &str, agent_id: Option<Uuid>, result: AuditResult) {
        let event = AuditEvent::new(operator_id, event_type, agent_id, result);
        if let Err(e) = self.store.append_audit_event(&event).await {
            tracing::warn!(error = %e, event_type, "failed to append audit event");
        }
    }

    /// Run the DEAD-state disconnect hooks: remove the control channel entry,
    /// mark the daemon disconnected, and broadcast the loss. A no-op if the
    /// channel never made it past the handshake.
    pub async fn on_disconnect(&mut self) {
        self.state = State::Dead;
        let Some(daemon_id) = self.daemon_id else { return };

        self.registry.remove_daemon_channel(daemon_id);
        if let Err(e) = self.store.mark_daemon_disconnected(daemon_id).await {
            tracing::warn!(%daemon_id, error = %e, "failed to mark daemon disconnected");
        }
        self.event_bus.publish(ClusterEvent::DaemonDisconnected { daemon_id }).await;
    }
}

/// Resolve the owning daemon's live control channel for `intent` and enqueue
/// it. Called from outside any channel's own read task -- HTTP handlers, the
/// messaging bridge -- never from within [`ControlSession::handle_message`].
pub async fn dispatch_intent(
    store: &Store,
    registry: &Registry,
    operator_id: &str,
    intent: Intent,
) -> Result<(), SessionError> {
    let agent_id = intent.agent_id();

    let result = dispatch_intent_inner(store, registry, intent).await;
    if result.is_err() {
        let event = AuditEvent::new(operator_id, "intent_dispatch", Some(agent_id), AuditResult::Error);
        if let Err(e) = store.append_audit_event(&event).await {
            tracing::warn!(error = %e, "failed to append audit event for a failed intent dispatch");
        }
    }
    result
}

async fn dispatch_intent_inner(store: &Store, registry: &Registry, intent: Intent) -> Result<(), SessionError> {
    let agent = store.get_agent(intent.agent_id()).await.map_err(|e| match e {
        StoreError::NotFound => SessionError::AgentNotFound,
        _ => SessionError::StoreUnavailable,
    })?;

    let handle = registry.lookup_daemon(agent.daemon_id).ok_or(SessionError::DaemonUnavailable)?;
    let handle_ref: &dyn ChannelHandle = handle.as_ref();
    let any_ref: &dyn Any = handle_ref;
    let control_handle = any_ref.downcast_ref::<ControlChannelHandle>().ok_or(SessionError::DaemonUnavailable)?;

    control_handle.try_send_outbound(intent.into())
}
