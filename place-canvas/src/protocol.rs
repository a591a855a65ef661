//! JSON wire protocol between canvas clients and the server.
//!
//! Client → server:
//! ```text
//! {"type":"pxl","x":5,"y":5,"color":"#000000"}   paint a pixel (room coordinates)
//! {"type":"sub","x":0,"y":0}                     follow a chunk (chunk coordinates)
//! {"type":"ping"}
//! ```
//!
//! Server → client:
//! ```text
//! {"type":"init","sizeX":256,"sizeY":256,"colors":[..]|null,"chunkSize":64}
//! {"type":"pxl","status":"ok"|"rejected"|"error"}
//! {"type":"full","x":0,"y":0,"data":"images/room1/f-0-0/1700000000000.qoi"}
//! {"type":"diff","x":0,"y":0,"data":"images/room1/d-0-0/1700000000000.qoi"}
//! {"type":"pong"}
//! ```
//!
//! The base protocol only ever acks `pxl` with `"ok"`. `"rejected"`
//! (validation failed) and `"error"` (no worker applied the write) are
//! extensions; a client that only knows `"ok"` should treat any other
//! status as a dropped pixel.
//!
//! A `full` reference is the chunk's last *saved* state. Pixels accepted
//! after that save reach subscribers through the next `diff`, one throttle
//! window later, so a freshly subscribed client is eventually consistent
//! rather than immediately up to date.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::room::{ChunkCoord, RoomSpec};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Pxl { x: i64, y: i64, color: String },
    Sub { x: i64, y: i64 },
    Ping,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Outcome of a `pxl` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Accepted and applied by the owning worker
    Ok,
    /// Refused by room validation
    Rejected,
    /// The owning worker could not apply it
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Init {
        size_x: u32,
        size_y: u32,
        colors: Option<Vec<String>>,
        chunk_size: u32,
    },
    Pxl { status: AckStatus },
    Full { x: u32, y: u32, data: String },
    Diff { x: u32, y: u32, data: String },
    Pong,
}

impl ServerMessage {
    pub fn init(spec: &RoomSpec) -> Self {
        ServerMessage::Init {
            size_x: spec.width,
            size_y: spec.height,
            colors: spec.palette.clone(),
            chunk_size: spec.chunk_size,
        }
    }

    pub fn ack(status: AckStatus) -> Self {
        ServerMessage::Pxl { status }
    }

    pub fn full(coord: ChunkCoord, url: impl Into<String>) -> Self {
        ServerMessage::Full {
            x: coord.cx,
            y: coord.cy,
            data: url.into(),
        }
    }

    pub fn diff(coord: ChunkCoord, url: impl Into<String>) -> Self {
        ServerMessage::Diff {
            x: coord.cx,
            y: coord.cy,
            data: url.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
