use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::messages::{ClientMessage, ServerMessage};

/// Connect to `/ws` and print every frame the server sends until the
/// connection closes or Ctrl-C is pressed.
pub async fn run_watch_client(url: String, actor: Option<String>, snapshot: bool) -> Result<()> {
    let mut ws_url = format!("{}/ws", url.trim_end_matches('/'));
    if let Some(actor) = actor {
        ws_url.push_str("?actor=");
        ws_url.push_str(&actor);
    }
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", ws_url, e);
            return Err(anyhow!("connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow!(
                "connection timeout - is the canvas server running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    if snapshot {
        let request = serde_json::to_string(&ClientMessage::GetSnapshot)?;
        write.send(Message::Text(request.into())).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => println!("{}", describe(&message)),
                    Err(_) => println!("? {}", text.as_str()),
                },
                Some(Ok(Message::Ping(payload))) => {
                    write.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        println!("closed by server: {}", frame.reason.as_str());
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(anyhow!("websocket error: {}", e)),
                None => break,
            }
        }
    }

    Ok(())
}

fn describe(message: &ServerMessage) -> String {
    match message {
        ServerMessage::Welcome {
            connection_id,
            width,
            height,
        } => format!("connected as {connection_id} to a {width}x{height} canvas"),
        ServerMessage::PixelUpdate(update) => format!(
            "{} ({}, {}) <- {} by {}",
            update.timestamp, update.x, update.y, update.color, update.actor
        ),
        ServerMessage::Snapshot(snapshot) => format!(
            "snapshot: {} painted cells at {}",
            snapshot.cells.len(),
            snapshot.timestamp
        ),
        ServerMessage::Placed { x, y, color } => format!("placed ({x}, {y}) <- {color}"),
        ServerMessage::Error { message } => format!("error: {message}"),
        ServerMessage::Pong => "pong".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_core::PixelUpdate;

    #[test_timeout::timeout]
    fn describes_updates_compactly() {
        let line = describe(&ServerMessage::PixelUpdate(PixelUpdate {
            x: 4,
            y: 9,
            color: 3,
            actor: "bob".into(),
            timestamp: 12,
        }));
        assert_eq!(line, "12 (4, 9) <- 3 by bob");
    }
}
