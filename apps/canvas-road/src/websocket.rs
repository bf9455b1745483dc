use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use canvas_bus::{BusEvent, BusMessage};
use canvas_core::PixelUpdate;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::messages::{ClientMessage, ServerMessage};
use crate::session::{BroadcastMetrics, SessionRegistry};
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    actor: Option<String>,
}

pub async fn websocket_handler(
    State(state): State<SharedState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let connection_id = Uuid::new_v4();
    let actor = query
        .actor
        .filter(|actor| !actor.is_empty())
        .unwrap_or_else(|| format!("anon-{}", &connection_id.simple().to_string()[..8]));
    ws.on_upgrade(move |socket| handle_socket(socket, state, connection_id, actor))
}

async fn handle_socket(socket: WebSocket, state: SharedState, connection_id: Uuid, actor: String) {
    let grid = state.canvas.grid();
    let welcome = match (ServerMessage::Welcome {
        connection_id,
        width: grid.width,
        height: grid.height,
    })
    .to_text()
    {
        Ok(text) => Message::Text(text),
        Err(err) => {
            warn!(%connection_id, error = %err, "failed to encode welcome");
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let registration = state.registry.register(connection_id, &actor, welcome);
    let mut rx = registration.receiver;
    debug!(
        %connection_id,
        %actor,
        active = registration.active_connections,
        "websocket connected"
    );

    // The queue closes when the registry drops this connection, which ends
    // the writer and with it the session.
    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_tx.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => {
                debug!(%connection_id, "writer finished; dropping connection");
                break;
            }
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    state.registry.touch(connection_id);
                    let reply = handle_frame(&state, &actor, serde_json::from_str(&text)).await;
                    send_reply(&state, connection_id, reply);
                }
                Some(Ok(Message::Binary(bytes))) => {
                    state.registry.touch(connection_id);
                    let reply = handle_frame(&state, &actor, serde_json::from_slice(&bytes)).await;
                    send_reply(&state, connection_id, reply);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        %connection_id,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "client closed websocket"
                    );
                    break;
                }
                Some(Ok(_)) => state.registry.touch(connection_id),
                Some(Err(err)) => {
                    debug!(%connection_id, error = %err, "error receiving message");
                    break;
                }
                None => break,
            }
        }
    }

    let active = state.registry.unregister(connection_id);
    writer.abort();
    debug!(%connection_id, active, "websocket closed");
}

async fn handle_frame(
    state: &SharedState,
    actor: &str,
    frame: Result<ClientMessage, serde_json::Error>,
) -> ServerMessage {
    let frame = match frame {
        Ok(frame) => frame,
        Err(err) => return ServerMessage::error(format!("unrecognized message: {err}")),
    };
    match frame {
        ClientMessage::PlacePixel { x, y, color } => {
            match state.canvas.place_cell(x, y, color, actor).await {
                Ok(update) => ServerMessage::Placed {
                    x: update.x,
                    y: update.y,
                    color: update.color,
                },
                Err(err) => ServerMessage::error(err.to_string()),
            }
        }
        ClientMessage::GetSnapshot => match state.canvas.get_snapshot().await {
            Ok(snapshot) => ServerMessage::Snapshot(snapshot),
            Err(err) => ServerMessage::error(err.to_string()),
        },
        ClientMessage::Ping => ServerMessage::Pong,
    }
}

fn send_reply(state: &SharedState, connection_id: Uuid, reply: ServerMessage) {
    match reply.to_text() {
        Ok(text) => {
            state.registry.send_to(connection_id, Message::Text(text));
        }
        Err(err) => warn!(%connection_id, error = %err, "failed to encode reply"),
    }
}

/// Forward every bus update on this instance to every local connection.
/// Lost updates, whether from a lagging relay or a bus gap, become a notice
/// telling clients to reload the snapshot.
pub fn spawn_fanout(
    mut updates: broadcast::Receiver<BusEvent>,
    registry: SessionRegistry,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(BusEvent::Message(message)) => {
                    if let Some(metrics) = relay_update(&registry, &message) {
                        counter!("canvas_ws_messages_forwarded_total", metrics.delivered as u64);
                        counter!("canvas_ws_bytes_forwarded_total", metrics.bytes as u64);
                        if metrics.evicted + metrics.closed > 0 {
                            debug!(
                                evicted = metrics.evicted,
                                closed = metrics.closed,
                                "connections dropped during fan-out"
                            );
                        }
                    }
                }
                Ok(BusEvent::Gap { topic }) => {
                    warn!(%topic, "update stream had a gap; asking clients to reload");
                    broadcast_reload_notice(&registry, "updates may have been missed");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "update relay lagged; asking clients to reload");
                    broadcast_reload_notice(&registry, &format!("missed {skipped} updates"));
                }
                Err(RecvError::Closed) => {
                    debug!("update stream closed; fan-out stopped");
                    break;
                }
            }
        }
    })
}

fn broadcast_reload_notice(registry: &SessionRegistry, cause: &str) {
    let notice = ServerMessage::error(format!("{cause}; reload the snapshot"));
    match notice.to_text() {
        Ok(text) => {
            registry.broadcast(Message::Text(text));
        }
        Err(err) => warn!(error = %err, "failed to encode reload notice"),
    }
}

fn relay_update(registry: &SessionRegistry, message: &BusMessage) -> Option<BroadcastMetrics> {
    let update = match PixelUpdate::from_message(message) {
        Ok(update) => update,
        Err(err) => {
            warn!(topic = %message.topic, error = %err, "dropping malformed update");
            return None;
        }
    };
    let text = match ServerMessage::PixelUpdate(update).to_text() {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "failed to encode update");
            return None;
        }
    };
    Some(registry.broadcast(Message::Text(text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use bytes::Bytes;
    use canvas_bus::{Bus, LocalBus};

    fn frame(message: Option<Message>) -> ServerMessage {
        match message {
            Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn update(x: u32, color: u8) -> PixelUpdate {
        PixelUpdate {
            x,
            y: 0,
            color,
            actor: "alice".into(),
            timestamp: 1,
        }
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn fanout_delivers_each_update_to_each_connection() {
        let bus = LocalBus::new();
        let registry = SessionRegistry::new(SessionConfig::default());
        let mut first = registry
            .register(Uuid::new_v4(), "a", Message::Text("{}".into()))
            .receiver;
        let mut second = registry
            .register(Uuid::new_v4(), "b", Message::Text("{}".into()))
            .receiver;
        let pump = spawn_fanout(bus.subscribe("updates"), registry.clone());

        let payload = update(2, 7).to_payload().unwrap();
        bus.publish("updates", payload).await.unwrap();

        for rx in [&mut first, &mut second] {
            rx.recv().await;
            assert_eq!(frame(rx.recv().await), ServerMessage::PixelUpdate(update(2, 7)));
            assert!(rx.try_recv().is_err());
        }
        pump.abort();
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn lagging_relay_tells_clients_to_reload() {
        let bus = LocalBus::with_capacity(1);
        let registry = SessionRegistry::new(SessionConfig::default());
        let mut rx = registry
            .register(Uuid::new_v4(), "a", Message::Text("{}".into()))
            .receiver;
        let updates = bus.subscribe("updates");
        for color in 1..=3 {
            bus.publish("updates", update(0, color).to_payload().unwrap())
                .await
                .unwrap();
        }
        let pump = spawn_fanout(updates, registry.clone());

        rx.recv().await;
        match frame(rx.recv().await) {
            ServerMessage::Error { message } => assert!(message.contains("reload")),
            other => panic!("expected error frame, got {other:?}"),
        }
        assert_eq!(frame(rx.recv().await), ServerMessage::PixelUpdate(update(0, 3)));
        pump.abort();
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn bus_gaps_tell_clients_to_reload() {
        let bus = LocalBus::new();
        let registry = SessionRegistry::new(SessionConfig::default());
        let mut rx = registry
            .register(Uuid::new_v4(), "a", Message::Text("{}".into()))
            .receiver;
        let pump = spawn_fanout(bus.subscribe("updates"), registry.clone());

        bus.deliver("updates", update(0, 1).to_payload().unwrap());
        bus.signal_gap("updates");
        bus.deliver("updates", update(0, 2).to_payload().unwrap());

        rx.recv().await;
        assert_eq!(frame(rx.recv().await), ServerMessage::PixelUpdate(update(0, 1)));
        match frame(rx.recv().await) {
            ServerMessage::Error { message } => assert!(message.contains("reload the snapshot")),
            other => panic!("expected error frame, got {other:?}"),
        }
        assert_eq!(frame(rx.recv().await), ServerMessage::PixelUpdate(update(0, 2)));
        pump.abort();
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn malformed_updates_are_dropped() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let message = BusMessage {
            topic: "updates".into(),
            payload: Bytes::from_static(b"not json"),
        };
        assert!(relay_update(&registry, &message).is_none());
    }
}
