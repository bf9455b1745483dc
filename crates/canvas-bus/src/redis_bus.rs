use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Bus, BusEvent, BusResult, LocalBus, DEFAULT_TOPIC_CAPACITY};

#[derive(Debug, Clone)]
pub struct RedisBusConfig {
    pub redis_url: String,
    /// Channels this instance relays to local subscribers. Redis requires the
    /// subscription up front, so topics outside this list never deliver.
    pub topics: Vec<String>,
    pub topic_capacity: usize,
    pub reconnect_delay: Duration,
}

impl RedisBusConfig {
    pub fn new(redis_url: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            topics,
            topic_capacity: DEFAULT_TOPIC_CAPACITY,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Cross-instance bus. Publishes go to Redis only; local subscribers receive
/// them when Redis echoes them back, so each message reaches each subscriber
/// exactly once regardless of which instance published it.
pub struct RedisBus {
    publisher: ConnectionManager,
    local: Arc<LocalBus>,
    topics: Vec<String>,
    relay: JoinHandle<()>,
}

impl RedisBus {
    pub async fn connect(config: RedisBusConfig) -> BusResult<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let local = Arc::new(LocalBus::with_capacity(config.topic_capacity));

        // Subscribe before returning so nothing published after `connect`
        // resolves can be missed by this instance.
        let pubsub = open_subscription(&client, &config.topics).await?;
        info!(topics = ?config.topics, "redis bus subscribed");

        let relay = tokio::spawn(relay_loop(
            client,
            pubsub,
            config.topics.clone(),
            Arc::clone(&local),
            config.reconnect_delay,
        ));

        Ok(Self {
            publisher,
            local,
            topics: config.topics,
            relay,
        })
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

async fn open_subscription(client: &Client, topics: &[String]) -> redis::RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    for topic in topics {
        pubsub.subscribe(topic).await?;
    }
    Ok(pubsub)
}

async fn relay_loop(
    client: Client,
    mut pubsub: PubSub,
    topics: Vec<String>,
    local: Arc<LocalBus>,
    reconnect_delay: Duration,
) {
    loop {
        {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<Vec<u8>>() {
                    Ok(payload) => {
                        let delivered = local.deliver(&channel, Bytes::from(payload));
                        debug!(%channel, delivered, "relayed redis message");
                    }
                    Err(err) => {
                        warn!(%channel, error = %err, "dropping undecodable redis message");
                    }
                }
            }
        }

        warn!("redis subscription ended; reconnecting");
        pubsub = loop {
            tokio::time::sleep(reconnect_delay).await;
            match open_subscription(&client, &topics).await {
                Ok(pubsub) => {
                    info!(topics = ?topics, "redis bus resubscribed");
                    announce_gap(&local, &topics);
                    break pubsub;
                }
                Err(err) => warn!(error = %err, "redis resubscribe failed"),
            }
        };
    }
}

/// Pub/sub does not replay what was published while the subscription was
/// down, so every relayed topic gets a gap marker.
fn announce_gap(local: &LocalBus, topics: &[String]) {
    for topic in topics {
        let notified = local.signal_gap(topic);
        warn!(%topic, notified, "updates may have been lost while resubscribing");
    }
}

#[async_trait]
impl Bus for RedisBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusEvent> {
        if !self.topics.iter().any(|t| t == topic) {
            warn!(%topic, "subscribing to a topic the redis relay does not carry");
        }
        self.local.subscribe(topic)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        let mut conn = self.publisher.clone();
        let receivers: usize = conn.publish(topic, payload.as_ref()).await?;
        Ok(receivers)
    }
}
