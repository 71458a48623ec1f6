//! In-process event bus.
//!
//! Subsystems talk through typed topic buses instead of holding references
//! to each other: endpoint clients announce online/offline transitions on
//! `docker-service.<id>`, the node registry publishes attach/detach/health
//! on `node-events`, daemon container events land on `container-events`
//! and every job instance streams progress on `job.<instance-id>`.
//!
//! Each topic is a bounded broadcast ring: delivery within one topic is
//! FIFO, and a subscriber that falls behind loses the oldest events rather
//! than stalling the publisher.

use dashmap::DashMap;
use tokio::sync::broadcast;

/// Default per-topic ring capacity.
const TOPIC_CAPACITY: usize = 512;

/// A family of topics carrying one event type.
pub struct EventBus<T: Clone> {
    topics: DashMap<String, broadcast::Sender<T>>,
    // Fan-in feed for subscribers interested in every topic.
    all: broadcast::Sender<(String, T)>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self::with_capacity(TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            all: broadcast::channel(capacity).0,
            capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<T> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event. Events published to a topic with no subscribers
    /// are dropped.
    pub fn publish(&self, topic: &str, event: T) {
        let _ = self.sender(topic).send(event.clone());
        let _ = self.all.send((topic.to_string(), event));
    }

    /// Subscribe to a single topic.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<T> {
        self.sender(topic).subscribe()
    }

    /// Subscribe to every topic of this bus; events arrive tagged with
    /// their topic name.
    pub fn subscribe_all(&self) -> broadcast::Receiver<(String, T)> {
        self.all.subscribe()
    }

    /// Drop a topic's channel. Existing receivers observe channel close.
    pub fn remove_topic(&self, topic: &str) {
        self.topics.remove(topic);
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus: EventBus<u32> = EventBus::new();
        let mut rx = bus.subscribe("a");

        bus.publish("a", 1);
        bus.publish("a", 2);

        assert_eq!(rx.recv().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_topic_isolation() {
        let bus: EventBus<&'static str> = EventBus::new();
        let mut a = bus.subscribe("a");
        let mut b = bus.subscribe("b");

        bus.publish("a", "for-a");
        bus.publish("b", "for-b");

        assert_eq!(a.recv().await.unwrap(), "for-a");
        assert_eq!(b.recv().await.unwrap(), "for-b");
    }

    #[tokio::test]
    async fn test_subscribe_all() {
        let bus: EventBus<u32> = EventBus::new();
        let mut all = bus.subscribe_all();

        bus.publish("x", 7);
        bus.publish("y", 8);

        assert_eq!(all.recv().await.unwrap(), ("x".to_string(), 7));
        assert_eq!(all.recv().await.unwrap(), ("y".to_string(), 8));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let bus: EventBus<u32> = EventBus::with_capacity(2);
        let mut rx = bus.subscribe("t");

        for i in 0..5 {
            bus.publish("t", i);
        }

        // The ring kept only the newest two; the first read reports the lag.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 1),
            other => panic!("expected lag, got {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap(), 3);
        assert_eq!(rx.recv().await.unwrap(), 4);
    }
}
