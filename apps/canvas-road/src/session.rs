use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::extract::ws::{close_code, CloseFrame, Message};
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_CHANNEL_DEPTH: usize = 256;

/// Live websocket connections on this instance, each with a bounded outbound
/// queue drained by its own writer task.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

struct SessionRegistryInner {
    connections: DashMap<Uuid, ConnectionEntry>,
    config: SessionConfig,
}

#[derive(Clone)]
pub struct SessionConfig {
    pub per_connection_buffer: usize,
    pub idle_timeout: Duration,
    pub recycle_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            per_connection_buffer: DEFAULT_CHANNEL_DEPTH,
            idle_timeout: Duration::from_secs(600),
            recycle_interval: Duration::from_secs(30),
        }
    }
}

struct ConnectionEntry {
    actor: String,
    sender: mpsc::Sender<Message>,
    last_activity: AtomicU64,
}

pub struct SessionRegistration {
    pub receiver: mpsc::Receiver<Message>,
    pub active_connections: usize,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastMetrics {
    pub delivered: usize,
    pub bytes: usize,
    /// Connections removed because their queue was full.
    pub evicted: usize,
    pub closed: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionSnapshot {
    pub connection_id: Uuid,
    pub actor: String,
    pub idle_ms: u64,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionRegistryInner {
                connections: DashMap::new(),
                config,
            }),
        }
    }

    /// Register a connection. `greeting` is queued ahead of any broadcast.
    pub fn register(&self, connection_id: Uuid, actor: &str, greeting: Message) -> SessionRegistration {
        let (tx, rx) = mpsc::channel(self.inner.config.per_connection_buffer.max(1));
        // Fresh channel, so the first send always has room.
        let _ = tx.try_send(greeting);
        self.inner.connections.insert(
            connection_id,
            ConnectionEntry {
                actor: actor.to_string(),
                sender: tx,
                last_activity: AtomicU64::new(now_millis()),
            },
        );
        let active_connections = self.inner.connections.len();
        counter!("canvas_ws_connections_total", 1);
        gauge!("canvas_ws_active_connections", active_connections as f64);

        SessionRegistration {
            receiver: rx,
            active_connections,
        }
    }

    pub fn unregister(&self, connection_id: Uuid) -> usize {
        self.inner.connections.remove(&connection_id);
        let active = self.inner.connections.len();
        gauge!("canvas_ws_active_connections", active as f64);
        active
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn touch(&self, connection_id: Uuid) {
        if let Some(entry) = self.inner.connections.get(&connection_id) {
            entry.last_activity.store(now_millis(), Ordering::Relaxed);
        }
    }

    /// Queue a reply for one connection. Returns `false` once the
    /// connection is gone, including when this send evicted it.
    pub fn send_to(&self, connection_id: Uuid, message: Message) -> bool {
        let Some(sender) = self
            .inner
            .connections
            .get(&connection_id)
            .map(|entry| entry.sender.clone())
        else {
            return false;
        };
        match sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                counter!("canvas_ws_slow_consumer_evictions_total", 1);
                warn!(%connection_id, "outbound queue full; evicting connection");
                self.unregister(connection_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.unregister(connection_id);
                false
            }
        }
    }

    /// Queue `message` for every connection. A connection whose queue is
    /// full is evicted rather than skipped, so no session ever sees a gap in
    /// the update stream; it must reconnect and reload the snapshot.
    pub fn broadcast(&self, message: Message) -> BroadcastMetrics {
        let mut metrics = BroadcastMetrics::default();
        let bytes = message_len(&message);

        let targets: Vec<(Uuid, mpsc::Sender<Message>)> = self
            .inner
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.sender.clone()))
            .collect();

        for (connection_id, sender) in targets {
            match sender.try_send(message.clone()) {
                Ok(()) => {
                    metrics.delivered += 1;
                    metrics.bytes += bytes;
                }
                Err(TrySendError::Full(_)) => {
                    metrics.evicted += 1;
                    counter!("canvas_ws_slow_consumer_evictions_total", 1);
                    warn!(%connection_id, "outbound queue full; evicting connection");
                    self.unregister(connection_id);
                }
                Err(TrySendError::Closed(_)) => {
                    metrics.closed += 1;
                    self.unregister(connection_id);
                }
            }
        }

        metrics
    }

    /// Close and drop every connection idle for longer than the timeout.
    pub fn force_close_idle(&self, now: u64) -> usize {
        let timeout = self.inner.config.idle_timeout.as_millis() as u64;
        let idle: Vec<(Uuid, mpsc::Sender<Message>)> = self
            .inner
            .connections
            .iter()
            .filter(|entry| now.saturating_sub(entry.last_activity.load(Ordering::Relaxed)) > timeout)
            .map(|entry| (*entry.key(), entry.sender.clone()))
            .collect();

        for (connection_id, sender) in &idle {
            let _ = sender.try_send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: Cow::Owned("idle timeout".into()),
            })));
            self.unregister(*connection_id);
            counter!("canvas_ws_idle_pruned_total", 1);
            debug!(%connection_id, "closed idle connection");
        }

        idle.len()
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let now = now_millis();
        self.inner
            .connections
            .iter()
            .map(|entry| ConnectionSnapshot {
                connection_id: *entry.key(),
                actor: entry.actor.clone(),
                idle_ms: now.saturating_sub(entry.last_activity.load(Ordering::Relaxed)),
            })
            .collect()
    }

    pub fn spawn_recycler(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.recycle_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let _ = registry.force_close_idle(now_millis());
            }
        })
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn message_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(bytes) => bytes.len(),
        _ => 0,
    }
}
