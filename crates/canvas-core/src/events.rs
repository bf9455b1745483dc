use async_trait::async_trait;
use bytes::Bytes;
use canvas_bus::BusMessage;
use serde::{Deserialize, Serialize};

/// Change notification published after every successful placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelUpdate {
    pub x: u32,
    pub y: u32,
    pub color: u8,
    pub actor: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl PixelUpdate {
    pub fn to_payload(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_message(message: &BusMessage) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(&message.payload)
    }
}

/// Entry of the placement history, as read back from the activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub id: String,
    #[serde(flatten)]
    pub update: PixelUpdate,
}

pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Downstream collaborator notified after each placement (leaderboards,
/// achievements). Runs detached from the write; failures are only logged.
#[async_trait]
pub trait PlacementObserver: Send + Sync {
    fn name(&self) -> &'static str;
    async fn on_placement(&self, update: &PixelUpdate) -> Result<(), ObserverError>;
}
