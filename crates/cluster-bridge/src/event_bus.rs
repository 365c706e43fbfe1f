use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

use crate::protocol::ClusterEvent;

/// Per-subscriber deadline: a publish that can't land within this window
/// means the subscriber is slow or stuck, not merely disconnected -- it gets
/// reaped the same as a closed channel.
const PUBLISH_DEADLINE: Duration = Duration::from_millis(200);

#[derive(Clone)]
struct Subscriber {
    id: Uuid,
    tx: flume::Sender<ClusterEvent>,
}

/// Fans cluster events out to every subscribed event channel with
/// best-effort, per-subscriber-ordered delivery.
///
/// Subscriber channels are bounded rather than the teacher's unbounded
/// `Vec<flume::Sender<_>>`: an unbounded sender can never block, so a stuck
/// subscriber could never be detected by a failed/timed-out send. Bounding
/// the channel and racing the send against `PUBLISH_DEADLINE` lets a slow
/// consumer fall behind without ever blocking the publisher, while still
/// getting removed once it's actually stuck.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    queue_depth: usize,
}

impl EventBus {
    pub fn new(queue_depth: usize) -> Self {
        Self { subscribers: Mutex::new(Vec::new()), queue_depth }
    }

    /// Subscribe and receive a handle plus the receiving end of the channel.
    pub fn subscribe(&self) -> (Uuid, flume::Receiver<ClusterEvent>) {
        let id = Uuid::new_v4();
        let (tx, rx) = flume::bounded(self.queue_depth);
        self.subscribers.lock().unwrap_or_else(|e| {
            tracing::warn!("event bus subscriber lock poisoned, recovering");
            e.into_inner()
        }).push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers.lock().unwrap_or_else(|e| {
            tracing::warn!("event bus subscriber lock poisoned, recovering");
            e.into_inner()
        }).retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drain every subscriber by dropping its sender, so each browser's
    /// `rx.recv_async()` resolves to an error and the event channel task
    /// exits. Used during graceful shutdown (§5).
    pub fn shutdown(&self) {
        let drained: Vec<Subscriber> = {
            let mut guard = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        tracing::info!(count = drained.len(), "event bus draining subscribers for shutdown");
    }

    /// Deliver `event` to every current subscriber. A subscriber whose send
    /// fails outright, or who doesn't drain within the publish deadline, is
    /// dropped from the set.
    ///
    /// Subscribers are cloned out under the lock rather than moved out of
    /// it: concurrent `publish` calls (one per control-channel task) must
    /// each see the full current subscriber set, not race each other for an
    /// emptied-out `Vec` and silently drop their event on the floor.
    pub async fn publish(&self, event: ClusterEvent) {
        let targets: Vec<Subscriber> = {
            let guard = self.subscribers.lock().unwrap_or_else(|e| {
                tracing::warn!("event bus subscriber lock poisoned, recovering");
                e.into_inner()
            });
            guard.clone()
        };

        let mut dead = Vec::new();
        for sub in &targets {
            match tokio::time::timeout(PUBLISH_DEADLINE, sub.tx.send_async(event.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    tracing::debug!(subscriber_id = %sub.id, "event subscriber channel closed, dropping");
                    dead.push(sub.id);
                }
                Err(_) => {
                    tracing::warn!(subscriber_id = %sub.id, "event subscriber exceeded publish deadline, dropping");
                    dead.push(sub.id);
                }
            }
        }

        if !dead.is_empty() {
            let mut guard = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            guard.retain(|s| !dead.contains(&s.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> ClusterEvent {
        ClusterEvent::DaemonDisconnected { daemon_id: Uuid::new_v4() }
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus = EventBus::new(8);
        let (_id, rx) = bus.subscribe();
        bus.publish(event()).await;
        let received = rx.recv_async().await.unwrap();
        assert!(matches!(received, ClusterEvent::DaemonDisconnected { .. }));
    }

    #[tokio::test]
    async fn publish_reaps_dropped_receiver() {
        let bus = EventBus::new(8);
        let (_id, rx) = bus.subscribe();
        drop(rx);
        bus.publish(event()).await;
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn publish_reaps_subscriber_past_deadline() {
        let bus = EventBus::new(1);
        let (_id, rx) = bus.subscribe();
        // Fill the bounded channel so the next send would have to wait, and
        // never drain it -- simulates a stuck consumer.
        bus.publish(event()).await;
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(event()).await;
        assert_eq!(bus.subscriber_count(), 0);
        drop(rx);
    }

    #[tokio::test]
    async fn shutdown_drains_subscribers_and_closes_their_channels() {
        let bus = EventBus::new(8);
        let (_id, rx) = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.shutdown();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(rx.recv_async().await.is_err());
    }

    #[tokio::test]
    async fn unsubscribe_removes_from_set() {
        let bus = EventBus::new(8);
        let (id, _rx) = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
