//! Per-session fan-out of outcome events with backpressure.
//!
//! Each session owns one tokio broadcast channel; every participant holds
//! an independent receiver buffering up to `capacity` events. Publishing
//! happens inside the session's serialized unit of work, so subscribers
//! observe outcomes in exactly the order revisions were assigned.
//!
//! Stats are tracked with atomics so the hot path never takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::events::SessionEvent;

/// Snapshot of broadcast health counters.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_published: u64,
    pub subscribers: usize,
}

/// Fan-out channel for one session.
pub struct SessionBroadcast {
    sender: broadcast::Sender<Arc<SessionEvent>>,
    capacity: usize,
    events_published: AtomicU64,
}

impl SessionBroadcast {
    /// Create a broadcast channel buffering `capacity` events per
    /// subscriber. Lagging subscribers drop oldest events (backpressure).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            events_published: AtomicU64::new(0),
        }
    }

    /// Subscribe a new receiver. Receives events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SessionEvent>> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers (author included).
    ///
    /// Returns the number of receivers it reached. Lock-free.
    pub fn publish(&self, event: SessionEvent) -> usize {
        log::trace!("broadcast {}", event.tag());
        let reached = self.sender.send(Arc::new(event)).unwrap_or(0);
        self.events_published.fetch_add(1, Ordering::Relaxed);
        reached
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = SessionBroadcast::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let event = SessionEvent::SessionClosed { session_id: Uuid::new_v4() };
        let reached = bus.publish(event.clone());
        assert_eq!(reached, 2);

        assert_eq!(*rx1.recv().await.unwrap(), event);
        assert_eq!(*rx2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = SessionBroadcast::new(16);
        let reached = bus.publish(SessionEvent::SessionClosed { session_id: Uuid::new_v4() });
        assert_eq!(reached, 0);
        assert_eq!(bus.stats().events_published, 1);
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let bus = SessionBroadcast::new(64);
        let mut rx = bus.subscribe();
        let session_id = Uuid::new_v4();

        for i in 0..10u64 {
            bus.publish(SessionEvent::VersionCreated {
                project_id: session_id,
                version_id: Uuid::new_v4(),
                revision: i,
            });
        }

        for expected in 0..10u64 {
            match &*rx.recv().await.unwrap() {
                SessionEvent::VersionCreated { revision, .. } => {
                    assert_eq!(*revision, expected);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let bus = SessionBroadcast::new(8);
        let _rx = bus.subscribe();
        bus.publish(SessionEvent::SessionClosed { session_id: Uuid::new_v4() });
        bus.publish(SessionEvent::SessionClosed { session_id: Uuid::new_v4() });

        let stats = bus.stats();
        assert_eq!(stats.events_published, 2);
        assert_eq!(stats.subscribers, 1);
        assert_eq!(bus.capacity(), 8);
    }
}
