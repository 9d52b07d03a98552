//! Binary wire protocol between canvas clients and the server.
//!
//! Every WebSocket binary frame carries one bincode-encoded message:
//! ```text
//! client ──► server   ClientMessage::{Place, Ping}
//! server ──► client   ServerMessage::Snapshot          (always first)
//!                     ServerMessage::{Delta, Placed, RateLimited, Invalid, Pong}
//! ```
//!
//! Colors travel as palette strings. Palette indices stay server-side.

use serde::{Deserialize, Serialize};

use crate::broadcast::{CanvasEvent, CanvasSnapshot, PixelDelta};
use crate::palette::Palette;
use crate::placement::PlacementResult;

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Paint one cell. Signed so off-canvas input survives decoding and is
    /// rejected by validation.
    Place { x: i64, y: i64, color: String },
    Ping,
}

/// One cell as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelUpdate {
    pub x: u16,
    pub y: u16,
    pub color: String,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Canvas state at subscription time. Only painted cells are listed.
    Snapshot {
        size: u16,
        cooldown_secs: u64,
        palette: Vec<String>,
        pixels: Vec<PixelUpdate>,
    },
    /// A committed placement, from any client.
    Delta(PixelUpdate),
    /// This client's placement was committed.
    Placed(PixelUpdate),
    RateLimited { remaining_secs: u64 },
    Invalid { reason: String },
    Pong,
}

impl ClientMessage {
    pub fn place(x: i64, y: i64, color: impl Into<String>) -> Self {
        Self::Place {
            x,
            y,
            color: color.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    /// Build the snapshot message for a freshly subscribed observer.
    ///
    /// Cells whose color index has no palette entry are left out.
    pub fn snapshot(snapshot: &CanvasSnapshot, palette: &Palette, cooldown_secs: u64) -> Self {
        let pixels = snapshot
            .cells
            .iter()
            .filter_map(|(x, y, cell)| {
                let color = palette.color(cell.color?)?;
                Some(PixelUpdate {
                    x: *x,
                    y: *y,
                    color: color.to_string(),
                })
            })
            .collect();

        Self::Snapshot {
            size: snapshot.size,
            cooldown_secs,
            palette: palette.colors().to_vec(),
            pixels,
        }
    }

    /// `None` if the delta's color index has no palette entry.
    pub fn delta(delta: &PixelDelta, palette: &Palette) -> Option<Self> {
        let color = palette.color(delta.color)?;
        Some(Self::Delta(PixelUpdate {
            x: delta.x,
            y: delta.y,
            color: color.to_string(),
        }))
    }

    /// Translate a hub event for the wire.
    pub fn from_event(event: &CanvasEvent, palette: &Palette, cooldown_secs: u64) -> Option<Self> {
        match event {
            CanvasEvent::Snapshot(snapshot) => {
                Some(Self::snapshot(snapshot, palette, cooldown_secs))
            }
            CanvasEvent::Delta(delta) => Self::delta(delta, palette),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl From<PlacementResult> for ServerMessage {
    fn from(result: PlacementResult) -> Self {
        match result {
            PlacementResult::Committed { x, y, color } => Self::Placed(PixelUpdate { x, y, color }),
            PlacementResult::Rejected { remaining_secs } => Self::RateLimited { remaining_secs },
            PlacementResult::Invalid(reason) => Self::Invalid {
                reason: reason.to_string(),
            },
        }
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Bad URL or header, or the server refused the upgrade
    HandshakeFailed(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::HandshakeFailed(e) => write!(f, "Handshake failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
