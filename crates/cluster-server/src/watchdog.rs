use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cluster_bridge::event_bus::EventBus;
use cluster_bridge::protocol::ClusterEvent;
use cluster_core::models::{AgentFilter, Staleness};
use cluster_core::store::Store;
use uuid::Uuid;

use crate::shutdown::ShutdownSignal;

/// How often the sweep recomputes staleness bands for every tracked agent.
/// Shorter than the fresh threshold so a fresh->stale transition is caught
/// within one sweep of crossing the boundary.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Staleness is derived at read time (see [`Store::get_agent`]) and never
/// persisted as ground truth, so a purely time-driven band change -- an
/// agent going quiet without any new write -- would otherwise go
/// unnoticed by anyone already subscribed to [`EventBus`]. This loop polls
/// every non-stopped agent on an interval and publishes
/// [`ClusterEvent::AgentUpdated`] whenever an agent's recomputed band
/// differs from the one observed on the previous sweep.
pub async fn run(store: Arc<Store>, event_bus: Arc<EventBus>, shutdown: ShutdownSignal) {
    let mut last_seen: HashMap<Uuid, Staleness> = HashMap::new();
    let mut shutdown_rx = shutdown.subscribe();
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep(&store, &event_bus, &mut last_seen).await;
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("staleness watchdog stopping");
                break;
            }
        }
    }
}

async fn sweep(store: &Store, event_bus: &EventBus, last_seen: &mut HashMap<Uuid, Staleness>) {
    let filter = AgentFilter { exclude_stopped: true, ..Default::default() };
    let agents = match store.list_agents(filter).await {
        Ok(agents) => agents,
        Err(e) => {
            tracing::warn!(error = %e, "staleness sweep failed to list agents");
            return;
        }
    };

    let mut seen_this_sweep = std::collections::HashSet::new();
    for agent in agents {
        seen_this_sweep.insert(agent.id);
        let previous = last_seen.insert(agent.id, agent.staleness);
        if previous != Some(agent.staleness) {
            tracing::debug!(agent_id = %agent.id, ?previous, current = ?agent.staleness, "agent staleness band changed");
            let value = serde_json::to_value(&agent).unwrap_or_default();
            event_bus.publish(ClusterEvent::AgentUpdated { agent: value }).await;
        }
    }

    last_seen.retain(|id, _| seen_this_sweep.contains(id));
}
