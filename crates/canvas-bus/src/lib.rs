//! Topic-based publish/subscribe used to fan canvas change notifications out
//! to every connected session.
//!
//! [`LocalBus`] delivers within a single process. [`RedisBus`] routes every
//! publish through Redis pub/sub so that sessions attached to any server
//! instance observe it; inbound Redis messages are re-delivered through an
//! embedded [`LocalBus`], which keeps per-connection queues decoupled from the
//! cross-instance transport.
//!
//! Subscribers receive [`BusEvent`]s. Besides messages, a transport that may
//! have dropped messages (a Redis resubscribe) emits [`BusEvent::Gap`] in
//! stream order, so consumers know to resynchronize.

mod redis_bus;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

pub use redis_bus::{RedisBus, RedisBusConfig};

/// Default per-topic buffer. Subscribers that fall further behind observe
/// `RecvError::Lagged`.
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// What a subscriber receives on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Message(BusMessage),
    /// Messages on `topic` may have been lost before this point.
    Gap { topic: String },
}

impl BusEvent {
    pub fn topic(&self) -> &str {
        match self {
            BusEvent::Message(message) => &message.topic,
            BusEvent::Gap { topic } => topic,
        }
    }

    pub fn into_message(self) -> Option<BusMessage> {
        match self {
            BusEvent::Message(message) => Some(message),
            BusEvent::Gap { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus transport error: {0}")]
    Transport(String),
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Transport(err.to_string())
    }
}

pub type BusResult<T> = Result<T, BusError>;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Receive every message published on `topic` from now on, in publish order.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusEvent>;

    /// Publish `payload` on `topic`. Returns the number of receivers the
    /// transport reported; zero is not an error.
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize>;
}

/// In-memory bus for single-process deployments and tests.
#[derive(Debug)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusEvent>>>,
    capacity: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: parking_lot::RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusEvent> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Hand a message to local subscribers only.
    pub fn deliver(&self, topic: &str, payload: Bytes) -> usize {
        self.sender_for(topic)
            .send(BusEvent::Message(BusMessage {
                topic: topic.to_string(),
                payload,
            }))
            .unwrap_or(0)
    }

    /// Tell local subscribers that messages on `topic` may have been lost.
    pub fn signal_gap(&self, topic: &str) -> usize {
        self.sender_for(topic)
            .send(BusEvent::Gap {
                topic: topic.to_string(),
            })
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusEvent> {
        self.sender_for(topic).subscribe()
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        Ok(self.deliver(topic, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(event: BusEvent) -> BusMessage {
        event.into_message().expect("message event")
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn local_bus_delivers_to_every_subscriber_in_order() {
        let bus = LocalBus::new();
        let mut first = bus.subscribe("canvas:updates");
        let mut second = bus.subscribe("canvas:updates");

        for payload in [&b"one"[..], b"two", b"three"] {
            let delivered = bus
                .publish("canvas:updates", Bytes::copy_from_slice(payload))
                .await
                .expect("publish ok");
            assert_eq!(delivered, 2);
        }

        for rx in [&mut first, &mut second] {
            let mut seen = Vec::new();
            for _ in 0..3 {
                seen.push(message(rx.recv().await.expect("receive ok")).payload);
            }
            assert_eq!(
                seen,
                vec![
                    Bytes::from_static(b"one"),
                    Bytes::from_static(b"two"),
                    Bytes::from_static(b"three")
                ]
            );
        }
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn publishing_without_subscribers_is_not_an_error() {
        let bus = LocalBus::new();
        let delivered = bus
            .publish("canvas:updates", Bytes::from_static(b"ping"))
            .await
            .expect("publish ok");
        assert_eq!(delivered, 0);
        assert_eq!(bus.subscriber_count("canvas:updates"), 0);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn topics_are_isolated() {
        let bus = LocalBus::new();
        let mut updates = bus.subscribe("canvas:updates");
        bus.publish("canvas:other", Bytes::from_static(b"noise"))
            .await
            .expect("publish ok");
        bus.publish("canvas:updates", Bytes::from_static(b"signal"))
            .await
            .expect("publish ok");
        let msg = message(updates.recv().await.expect("receive ok"));
        assert_eq!(msg.topic, "canvas:updates");
        assert_eq!(msg.payload, Bytes::from_static(b"signal"));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn slow_subscriber_observes_lag() {
        let bus = LocalBus::with_capacity(2);
        let mut rx = bus.subscribe("t");
        for i in 0..5u8 {
            bus.publish("t", Bytes::copy_from_slice(&[i])).await.unwrap();
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert_eq!(missed, 3),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn gaps_arrive_in_stream_order() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("t");
        bus.deliver("t", Bytes::from_static(b"before"));
        assert_eq!(bus.signal_gap("t"), 1);
        bus.deliver("t", Bytes::from_static(b"after"));

        assert_eq!(message(rx.recv().await.unwrap()).payload, Bytes::from_static(b"before"));
        assert_eq!(
            rx.recv().await.unwrap(),
            BusEvent::Gap {
                topic: "t".to_string()
            }
        );
        assert_eq!(message(rx.recv().await.unwrap()).payload, Bytes::from_static(b"after"));
    }
}
