use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cluster_core::store::Store;
use cluster_registry::{ChannelHandle, Registry};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::control_session::ControlChannelHandle;
use crate::protocol::Intent;

#[derive(Debug, thiserror::Error)]
pub enum PtyRouterError {
    #[error("pty frame shorter than the 16-byte agent id header")]
    FrameTooShort,
    #[error("terminal write failed")]
    TerminalWriteFailed,
    #[error("daemon unavailable")]
    DaemonUnavailable,
}

/// Registered in `Registry::Terminals` for a browser's per-agent PTY socket.
/// Carries raw output bytes from a pool frame to the browser, and signals
/// close the same way `ControlChannelHandle` does.
pub struct TerminalChannelHandle {
    outbound_tx: mpsc::Sender<Vec<u8>>,
    closed: AtomicBool,
    close_tx: watch::Sender<Option<String>>,
}

impl TerminalChannelHandle {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>, watch::Receiver<Option<String>>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = watch::channel(None);
        let handle = Arc::new(Self { outbound_tx, closed: AtomicBool::new(false), close_tx });
        (handle, outbound_rx, close_rx)
    }

    fn try_send(&self, payload: Vec<u8>) -> Result<(), PtyRouterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PtyRouterError::TerminalWriteFailed);
        }
        self.outbound_tx.try_send(payload).map_err(|_| PtyRouterError::TerminalWriteFailed)
    }
}

impl ChannelHandle for TerminalChannelHandle {
    fn close(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.close_tx.send(Some(reason.to_string()));
    }
}

/// Registered in `Registry::PoolChannels` for a daemon's PTY pool socket.
/// Holds no outbound payload path -- browser input reaches the daemon
/// through its control channel as a `terminal_input` intent, never through
/// the pool socket itself. Only `close` is needed, for lifecycle cleanup.
pub struct PoolChannelHandle {
    closed: AtomicBool,
    close_tx: watch::Sender<Option<String>>,
}

impl PoolChannelHandle {
    pub fn new() -> (Arc<Self>, watch::Receiver<Option<String>>) {
        let (close_tx, close_rx) = watch::channel(None);
        (Arc::new(Self { closed: AtomicBool::new(false), close_tx }), close_rx)
    }
}

impl ChannelHandle for PoolChannelHandle {
    fn close(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.close_tx.send(Some(reason.to_string()));
    }
}

/// Split a pool frame into its 16-byte big-endian agent id header and payload.
pub fn parse_pool_frame(frame: &[u8]) -> Result<(Uuid, &[u8]), PtyRouterError> {
    if frame.len() < 16 {
        return Err(PtyRouterError::FrameTooShort);
    }
    let (header, payload) = frame.split_at(16);
    let bytes: [u8; 16] = header.try_into().expect("split_at(16) guarantees 16 bytes");
    Ok((Uuid::from_bytes(bytes), payload))
}

/// Demultiplex one pool-ingress frame to the agent's browser terminal
/// channel, if one is registered. Frames under 16 bytes and frames for an
/// agent with no registered terminal are dropped silently -- neither is
/// protocol-fatal to the pool channel.
pub fn route_pool_frame(registry: &Registry, frame: &[u8]) {
    let (agent_id, payload) = match parse_pool_frame(frame) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(frame_len = frame.len(), error = %e, "dropping undersized pty pool frame");
            return;
        }
    };

    let Some(handle) = registry.lookup_terminal(agent_id) else {
        tracing::trace!(%agent_id, "no terminal registered for pty frame, discarding payload");
        return;
    };

    let handle_ref: &dyn ChannelHandle = handle.as_ref();
    let any_ref: &dyn Any = handle_ref;
    let write_result = any_ref
        .downcast_ref::<TerminalChannelHandle>()
        .ok_or(PtyRouterError::TerminalWriteFailed)
        .and_then(|terminal| terminal.try_send(payload.to_vec()));

    if write_result.is_err() {
        tracing::debug!(%agent_id, "terminal write failed, removing terminal entry");
        if let Some(removed) = registry.remove_terminal(agent_id) {
            removed.close("write failed");
        }
    }
}

/// Wrap one browser-ingress keystroke frame as a `terminal_input` intent and
/// deliver it to the agent's owning daemon. Mirrors
/// [`crate::control_session::dispatch_intent`] but skips the audit-log call
/// -- keystroke volume makes per-frame auditing impractical, and §7 only
/// requires this path to log on drop, not to record an audit event.
pub async fn route_browser_frame(store: &Store, registry: &Registry, agent_id: Uuid, bytes: Vec<u8>) -> Result<(), PtyRouterError> {
    let agent = store.get_agent(agent_id).await.map_err(|_| PtyRouterError::DaemonUnavailable)?;

    let handle = registry.lookup_daemon(agent.daemon_id).ok_or(PtyRouterError::DaemonUnavailable)?;
    let handle_ref: &dyn ChannelHandle = handle.as_ref();
    let any_ref: &dyn Any = handle_ref;
    let control_handle = any_ref.downcast_ref::<ControlChannelHandle>().ok_or(PtyRouterError::DaemonUnavailable)?;

    control_handle
        .try_send_outbound(Intent::TerminalInput { agent_id, bytes }.into())
        .map_err(|_| PtyRouterError::DaemonUnavailable)
}

/// On terminal channel close: drop it from `Terminals`.
pub fn on_terminal_closed(registry: &Registry, agent_id: Uuid) {
    registry.remove_terminal(agent_id);
}

/// On pool channel close: drop it from `PoolChannels`, leaving `AgentToPool`
/// untouched -- the daemon is expected to reconnect a pool with the same id.
pub fn on_pool_closed(registry: &Registry, pool_id: Uuid) {
    registry.remove_pool_channel(pool_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pool_frame_rejects_short_frames() {
        let frame = vec![0u8; 15];
        assert!(matches!(parse_pool_frame(&frame), Err(PtyRouterError::FrameTooShort)));
    }

    #[test]
    fn parse_pool_frame_splits_header_and_payload() {
        let agent_id = Uuid::new_v4();
        let mut frame = agent_id.as_bytes().to_vec();
        frame.extend_from_slice(b"hello");
        let (parsed_id, payload) = parse_pool_frame(&frame).unwrap();
        assert_eq!(parsed_id, agent_id);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn parse_pool_frame_allows_zero_length_payload() {
        let agent_id = Uuid::new_v4();
        let frame = agent_id.as_bytes().to_vec();
        let (parsed_id, payload) = parse_pool_frame(&frame).unwrap();
        assert_eq!(parsed_id, agent_id);
        assert!(payload.is_empty());
    }

    #[test]
    fn route_pool_frame_drops_when_no_terminal_registered() {
        let registry = Registry::new();
        let agent_id = Uuid::new_v4();
        let mut frame = agent_id.as_bytes().to_vec();
        frame.extend_from_slice(b"hello");
        // Must not panic; there is nothing to assert on beyond "it returns".
        route_pool_frame(&registry, &frame);
    }

    #[test]
    fn route_pool_frame_forwards_to_registered_terminal() {
        let registry = Registry::new();
        let agent_id = Uuid::new_v4();
        let (handle, mut rx, _close_rx) = TerminalChannelHandle::new(4);
        registry.register_terminal(agent_id, handle);

        let mut frame = agent_id.as_bytes().to_vec();
        frame.extend_from_slice(b"hello");
        route_pool_frame(&registry, &frame);

        let received = rx.try_recv().unwrap();
        assert_eq!(received, b"hello");
    }

    #[test]
    fn route_pool_frame_removes_terminal_on_write_failure() {
        let registry = Registry::new();
        let agent_id = Uuid::new_v4();
        let (handle, rx, _close_rx) = TerminalChannelHandle::new(4);
        drop(rx);
        registry.register_terminal(agent_id, handle);

        let mut frame = agent_id.as_bytes().to_vec();
        frame.extend_from_slice(b"hello");
        route_pool_frame(&registry, &frame);

        assert!(registry.lookup_terminal(agent_id).is_none());
    }

    #[tokio::test]
    async fn route_browser_frame_errors_when_daemon_unavailable() {
        let store = Store::new_in_memory(cluster_core::config::StalenessConfig::default()).await.unwrap();
        let registry = Registry::new();
        let daemon = cluster_core::models::Daemon::new("box", "linux", "1.0.0");
        store.upsert_daemon(&daemon).await.unwrap();
        let agent = cluster_core::models::Agent::new(daemon.id, "box", 1, "/tmp", "clud");
        store.upsert_agent(&agent).await.unwrap();

        let err = route_browser_frame(&store, &registry, agent.id, b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, PtyRouterError::DaemonUnavailable));
    }

    #[test]
    fn on_terminal_closed_removes_entry() {
        let registry = Registry::new();
        let agent_id = Uuid::new_v4();
        let (handle, _rx, _close_rx) = TerminalChannelHandle::new(4);
        registry.register_terminal(agent_id, handle);
        on_terminal_closed(&registry, agent_id);
        assert!(registry.lookup_terminal(agent_id).is_none());
    }

    #[test]
    fn on_pool_closed_leaves_agent_to_pool_intact() {
        let registry = Registry::new();
        let pool_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        let (handle, _close_rx) = PoolChannelHandle::new();
        registry.register_pool_channel(pool_id, handle);
        registry.bind_agent_to_pool(agent_id, pool_id);

        on_pool_closed(&registry, pool_id);

        assert!(registry.lookup_pool(pool_id).is_none());
        assert_eq!(registry.lookup_agent_pool(agent_id), Some(pool_id));
    }
}
