use canvas_core::{PixelUpdate, Snapshot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frames a browser (or the watch client) sends over `/ws`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    PlacePixel { x: i64, y: i64, color: i64 },
    GetSnapshot,
    Ping,
}

/// Frames the server sends over `/ws`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome {
        connection_id: Uuid,
        width: u32,
        height: u32,
    },
    PixelUpdate(PixelUpdate),
    Snapshot(Snapshot),
    /// Acknowledges the sender's own `place-pixel`.
    Placed { x: u32, y: u32, color: u8 },
    Error { message: String },
    Pong,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn client_frames_use_kebab_case_tags() {
        let parsed: ClientMessage =
            serde_json::from_value(json!({"type": "place-pixel", "x": 3, "y": 4, "color": 9}))
                .unwrap();
        assert_eq!(parsed, ClientMessage::PlacePixel { x: 3, y: 4, color: 9 });
        let parsed: ClientMessage = serde_json::from_value(json!({"type": "get-snapshot"})).unwrap();
        assert_eq!(parsed, ClientMessage::GetSnapshot);
        assert!(serde_json::from_value::<ClientMessage>(json!({"type": "paint"})).is_err());
    }

    #[test_timeout::timeout]
    fn pixel_updates_flatten_into_the_frame() {
        let frame = ServerMessage::PixelUpdate(PixelUpdate {
            x: 1,
            y: 2,
            color: 5,
            actor: "alice".into(),
            timestamp: 1_700_000_000_000,
        });
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "pixel-update",
                "x": 1,
                "y": 2,
                "color": 5,
                "actor": "alice",
                "timestamp": 1_700_000_000_000i64
            })
        );
    }

    #[test_timeout::timeout]
    fn snapshot_frames_carry_cell_triples() {
        let frame = ServerMessage::Snapshot(Snapshot {
            cells: vec![canvas_core::SnapshotCell(1, 1, 5)],
            timestamp: 7,
            width: 4,
            height: 4,
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "snapshot");
        assert_eq!(value["cells"], json!([[1, 1, 5]]));
        let back: ServerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, frame);
    }
}
