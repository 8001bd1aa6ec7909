//! Volume-Location Notification Bus
//!
//! Clients (filers, smart clients) subscribe to topology changes instead
//! of polling `/dir/lookup`. Each subscriber gets its own bounded queue;
//! the publisher never blocks. A subscriber that lets its queue fill up is
//! disconnected — it can reconnect and start from a fresh snapshot, which
//! is cheaper for everyone than wedging the heartbeat path behind one
//! slow consumer.

use std::collections::HashMap;

use needlehouse_topology::HeartbeatDelta;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-subscriber queue depth.
const SUBSCRIBER_QUEUE: usize = 64;

#[derive(Default)]
pub struct NotificationBus {
    subscribers: RwLock<HashMap<String, mpsc::Sender<HeartbeatDelta>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; a second subscription under the same name
    /// replaces (and thereby disconnects) the first.
    pub fn subscribe(&self, name: &str) -> mpsc::Receiver<HeartbeatDelta> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let previous = self.subscribers.write().insert(name.to_string(), tx);
        if previous.is_some() {
            debug!(subscriber = name, "replaced existing subscription");
        }
        rx
    }

    pub fn unsubscribe(&self, name: &str) {
        self.subscribers.write().remove(name);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Fan a topology change out to every subscriber without blocking.
    pub fn publish(&self, delta: &HeartbeatDelta) {
        if delta.is_empty() {
            return;
        }
        let mut dropped = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (name, tx) in subscribers.iter() {
                match tx.try_send(delta.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscriber = name, "subscriber queue full, disconnecting");
                        dropped.push(name.clone());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dropped.push(name.clone());
                    }
                }
            }
        }
        if !dropped.is_empty() {
            let mut subscribers = self.subscribers.write();
            for name in dropped {
                subscribers.remove(&name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(vid: u32) -> HeartbeatDelta {
        HeartbeatDelta {
            url: "10.0.0.1:8080".to_string(),
            public_url: "10.0.0.1:8080".to_string(),
            new_vids: vec![vid],
            deleted_vids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe("client-1");
        bus.publish(&delta(7));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.new_vids, vec![7]);
    }

    #[tokio::test]
    async fn test_empty_deltas_are_not_published() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe("client-1");
        bus.publish(&HeartbeatDelta::default());
        bus.publish(&delta(1));
        // Only the non-empty delta arrives.
        assert_eq!(rx.recv().await.unwrap().new_vids, vec![1]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_disconnected() {
        let bus = NotificationBus::new();
        let _rx = bus.subscribe("slow");
        // Overflow the bounded queue without draining it.
        for vid in 0..(SUBSCRIBER_QUEUE as u32 + 8) {
            bus.publish(&delta(vid));
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let bus = NotificationBus::new();
        let rx = bus.subscribe("gone");
        drop(rx);
        bus.publish(&delta(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publisher_survives_mixed_subscribers() {
        let bus = NotificationBus::new();
        let mut healthy = bus.subscribe("healthy");
        let _stuck = bus.subscribe("stuck");
        for vid in 0..(SUBSCRIBER_QUEUE as u32 + 8) {
            bus.publish(&delta(vid));
            // Healthy subscriber keeps draining.
            assert_eq!(healthy.recv().await.unwrap().new_vids, vec![vid]);
        }
        assert_eq!(bus.subscriber_count(), 1);
    }
}
