use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use uuid::Uuid;

/// A live channel the registry can hand back to callers and, when superseded
/// or reaped, tell to close.
///
/// The registry never performs I/O itself -- `close` is expected to be a
/// cheap, non-blocking signal (e.g. dropping a sender, setting a flag the
/// owning task observes) rather than an actual socket shutdown.
///
/// `Any` is a supertrait so callers that stored a handle as `Arc<dyn
/// ChannelHandle>` can downcast it back to its concrete type (via trait
/// upcasting) when they need more than `close` -- e.g. `ControlSession`'s
/// intent dispatch path, which needs the concrete handle's outbound sender.
pub trait ChannelHandle: Send + Sync + std::any::Any {
    fn close(&self, reason: &str);
}

/// In-memory connection registries for the three channel-handle kinds plus
/// the agent->pool routing map (see the component design's Registry
/// section). The fourth map the spec names, `EventSubscribers`, is kept by
/// `EventBus` itself rather than threaded through here -- the design's own
/// ownership summary states EventBus owns that set exclusively, and nothing
/// outside EventBus ever needs to look a subscriber up by id. Each map's
/// writers are documented below; the type system does not enforce exclusive
/// writership -- it is a convention callers must honor.
pub struct Registry {
    /// Exclusive writer: ControlSession.
    daemon_control: Mutex<AHashMap<Uuid, Arc<dyn ChannelHandle>>>,
    /// Exclusive writer: PTYRouter.
    pool_channels: Mutex<AHashMap<Uuid, Arc<dyn ChannelHandle>>>,
    /// Exclusive writer: PTYRouter.
    terminals: Mutex<AHashMap<Uuid, Arc<dyn ChannelHandle>>>,
    /// Exclusive writers: ControlSession (insert on agent_register), PTYRouter (remove on agent_stopped).
    agent_to_pool: Mutex<AHashMap<Uuid, Uuid>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            daemon_control: Mutex::new(AHashMap::new()),
            pool_channels: Mutex::new(AHashMap::new()),
            terminals: Mutex::new(AHashMap::new()),
            agent_to_pool: Mutex::new(AHashMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // DaemonControl
    // -----------------------------------------------------------------------

    /// Register the control channel for a daemon. If one is already
    /// registered, it is closed with reason "superseded" first.
    pub fn register_daemon_channel(&self, daemon_id: Uuid, handle: Arc<dyn ChannelHandle>) {
        let mut map = self.daemon_control.lock().expect("daemon_control lock");
        if let Some(prev) = map.insert(daemon_id, handle) {
            prev.close("superseded");
        }
        tracing::debug!(%daemon_id, "daemon control channel registered");
    }

    pub fn lookup_daemon(&self, daemon_id: Uuid) -> Option<Arc<dyn ChannelHandle>> {
        self.daemon_control.lock().expect("daemon_control lock").get(&daemon_id).cloned()
    }

    pub fn remove_daemon_channel(&self, daemon_id: Uuid) -> Option<Arc<dyn ChannelHandle>> {
        self.daemon_control.lock().expect("daemon_control lock").remove(&daemon_id)
    }

    pub fn daemon_count(&self) -> usize {
        self.daemon_control.lock().expect("daemon_control lock").len()
    }

    /// Snapshot of currently-registered daemon ids, used by graceful shutdown
    /// to mark every live daemon disconnected and close its channel.
    pub fn daemon_ids(&self) -> Vec<Uuid> {
        self.daemon_control.lock().expect("daemon_control lock").keys().copied().collect()
    }

    // -----------------------------------------------------------------------
    // PoolChannels
    // -----------------------------------------------------------------------

    pub fn register_pool_channel(&self, pool_id: Uuid, handle: Arc<dyn ChannelHandle>) {
        let mut map = self.pool_channels.lock().expect("pool_channels lock");
        if let Some(prev) = map.insert(pool_id, handle) {
            prev.close("superseded");
        }
        tracing::debug!(%pool_id, "pty pool channel registered");
    }

    pub fn lookup_pool(&self, pool_id: Uuid) -> Option<Arc<dyn ChannelHandle>> {
        self.pool_channels.lock().expect("pool_channels lock").get(&pool_id).cloned()
    }

    pub fn remove_pool_channel(&self, pool_id: Uuid) -> Option<Arc<dyn ChannelHandle>> {
        self.pool_channels.lock().expect("pool_channels lock").remove(&pool_id)
    }

    pub fn pool_channel_ids(&self) -> Vec<Uuid> {
        self.pool_channels.lock().expect("pool_channels lock").keys().copied().collect()
    }

    // -----------------------------------------------------------------------
    // Terminals
    // -----------------------------------------------------------------------

    pub fn register_terminal(&self, agent_id: Uuid, handle: Arc<dyn ChannelHandle>) {
        let mut map = self.terminals.lock().expect("terminals lock");
        if let Some(prev) = map.insert(agent_id, handle) {
            prev.close("superseded");
        }
        tracing::debug!(%agent_id, "browser terminal channel registered");
    }

    pub fn lookup_terminal(&self, agent_id: Uuid) -> Option<Arc<dyn ChannelHandle>> {
        self.terminals.lock().expect("terminals lock").get(&agent_id).cloned()
    }

    pub fn remove_terminal(&self, agent_id: Uuid) -> Option<Arc<dyn ChannelHandle>> {
        self.terminals.lock().expect("terminals lock").remove(&agent_id)
    }

    pub fn terminal_ids(&self) -> Vec<Uuid> {
        self.terminals.lock().expect("terminals lock").keys().copied().collect()
    }

    // -----------------------------------------------------------------------
    // AgentToPool
    // -----------------------------------------------------------------------

    pub fn bind_agent_to_pool(&self, agent_id: Uuid, pool_id: Uuid) {
        self.agent_to_pool.lock().expect("agent_to_pool lock").insert(agent_id, pool_id);
    }

    pub fn unbind_agent(&self, agent_id: Uuid) -> Option<Uuid> {
        self.agent_to_pool.lock().expect("agent_to_pool lock").remove(&agent_id)
    }

    pub fn lookup_agent_pool(&self, agent_id: Uuid) -> Option<Uuid> {
        self.agent_to_pool.lock().expect("agent_to_pool lock").get(&agent_id).copied()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestHandle {
        closed: Arc<AtomicBool>,
        close_reason: Mutex<Option<String>>,
    }

    impl TestHandle {
        fn new() -> (Arc<Self>, Arc<AtomicBool>) {
            let closed = Arc::new(AtomicBool::new(false));
            (
                Arc::new(Self { closed: closed.clone(), close_reason: Mutex::new(None) }),
                closed,
            )
        }
    }

    impl ChannelHandle for TestHandle {
        fn close(&self, reason: &str) {
            self.closed.store(true, Ordering::SeqCst);
            *self.close_reason.lock().unwrap() = Some(reason.to_string());
        }
    }

    #[test]
    fn register_daemon_channel_closes_superseded_previous() {
        let registry = Registry::new();
        let daemon_id = Uuid::new_v4();
        let (first, first_closed) = TestHandle::new();
        let (second, _) = TestHandle::new();

        registry.register_daemon_channel(daemon_id, first);
        assert!(!first_closed.load(Ordering::SeqCst));

        registry.register_daemon_channel(daemon_id, second);
        assert!(first_closed.load(Ordering::SeqCst));
        assert_eq!(registry.daemon_count(), 1);
    }

    #[test]
    fn lookup_daemon_returns_none_when_absent() {
        let registry = Registry::new();
        assert!(registry.lookup_daemon(Uuid::new_v4()).is_none());
    }

    #[test]
    fn agent_to_pool_bind_lookup_unbind() {
        let registry = Registry::new();
        let agent_id = Uuid::new_v4();
        let pool_id = Uuid::new_v4();

        assert!(registry.lookup_agent_pool(agent_id).is_none());
        registry.bind_agent_to_pool(agent_id, pool_id);
        assert_eq!(registry.lookup_agent_pool(agent_id), Some(pool_id));

        let removed = registry.unbind_agent(agent_id);
        assert_eq!(removed, Some(pool_id));
        assert!(registry.lookup_agent_pool(agent_id).is_none());
    }

    #[test]
    fn daemon_ids_reflects_registered_channels() {
        let registry = Registry::new();
        let d1 = Uuid::new_v4();
        let d2 = Uuid::new_v4();
        let (h1, _) = TestHandle::new();
        let (h2, _) = TestHandle::new();
        registry.register_daemon_channel(d1, h1);
        registry.register_daemon_channel(d2, h2);

        let mut ids = registry.daemon_ids();
        ids.sort();
        let mut expected = vec![d1, d2];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn pool_and_terminal_ids_reflect_registered_channels() {
        let registry = Registry::new();
        let pool_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        let (pool_handle, _) = TestHandle::new();
        let (terminal_handle, _) = TestHandle::new();
        registry.register_pool_channel(pool_id, pool_handle);
        registry.register_terminal(agent_id, terminal_handle);

        assert_eq!(registry.pool_channel_ids(), vec![pool_id]);
        assert_eq!(registry.terminal_ids(), vec![agent_id]);
    }
}
