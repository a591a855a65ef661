//! Room definitions and write validation.
//!
//! The room table is built once at startup and shared read-only; only each
//! room's connected-user set changes afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use thiserror::Error;
use uuid::Uuid;

use crate::raster::{parse_hex_color, Rgba};

/// Chunk coordinate inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkCoord {
    pub cx: u32,
    pub cy: u32,
}

impl ChunkCoord {
    pub fn new(cx: u32, cy: u32) -> Self {
        Self { cx, cy }
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.cx, self.cy)
    }
}

/// Global identity of a chunk: room plus coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub room: String,
    pub coord: ChunkCoord,
}

impl ChunkKey {
    pub fn new(room: impl Into<String>, cx: u32, cy: u32) -> Self {
        Self {
            room: room.into(),
            coord: ChunkCoord::new(cx, cy),
        }
    }
}

impl std::fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.room, self.coord)
    }
}

/// Static description of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSpec {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub chunk_size: u32,
    /// Allowed colours; `None` means unrestricted.
    pub palette: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("Room already exists: {0}")]
    DuplicateRoom(String),
    #[error("Invalid geometry for room {id}: {width}x{height} with chunk size {chunk_size}")]
    InvalidGeometry {
        id: String,
        width: u32,
        height: u32,
        chunk_size: u32,
    },
}

/// Reasons a pixel write is refused before reaching a worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unknown room: {0}")]
    UnknownRoom(String),
    #[error("Pixel ({x}, {y}) outside canvas")]
    OutOfBounds { x: i64, y: i64 },
    #[error("Colour {0:?} not in palette")]
    ColorNotAllowed(String),
    #[error("Invalid colour {0:?}")]
    InvalidColor(String),
}

/// A write that passed validation, resolved to its chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedWrite {
    pub key: ChunkKey,
    pub local_x: u32,
    pub local_y: u32,
    pub x: u32,
    pub y: u32,
    pub color: String,
    pub rgba: Rgba,
}

/// A room: its static spec plus the set of connected users.
#[derive(Debug)]
pub struct Room {
    spec: RoomSpec,
    users: Mutex<HashSet<Uuid>>,
}

impl Room {
    fn new(spec: RoomSpec) -> Self {
        Self {
            spec,
            users: Mutex::new(HashSet::new()),
        }
    }

    pub fn spec(&self) -> &RoomSpec {
        &self.spec
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn chunks_x(&self) -> u32 {
        self.spec.width / self.spec.chunk_size
    }

    pub fn chunks_y(&self) -> u32 {
        self.spec.height / self.spec.chunk_size
    }

    pub fn chunk_in_bounds(&self, cx: i64, cy: i64) -> bool {
        cx >= 0 && cy >= 0 && cx < self.chunks_x() as i64 && cy < self.chunks_y() as i64
    }

    fn allows(&self, color: &str) -> bool {
        match &self.spec.palette {
            Some(palette) => palette.iter().any(|c| c == color),
            None => true,
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().map(|u| u.len()).unwrap_or(0)
    }
}

/// All rooms known to the process.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a room. Fails on duplicate ids or a chunk size that does not
    /// evenly tile the canvas.
    pub fn create_room(&mut self, spec: RoomSpec) -> Result<(), RoomError> {
        if self.rooms.contains_key(&spec.id) {
            return Err(RoomError::DuplicateRoom(spec.id));
        }
        let tiles = spec.chunk_size > 0
            && spec.width > 0
            && spec.height > 0
            && spec.width % spec.chunk_size == 0
            && spec.height % spec.chunk_size == 0;
        if !tiles {
            return Err(RoomError::InvalidGeometry {
                id: spec.id,
                width: spec.width,
                height: spec.height,
                chunk_size: spec.chunk_size,
            });
        }
        log::info!(
            "Room {} created: {}x{}, chunk size {}, palette {}",
            spec.id,
            spec.width,
            spec.height,
            spec.chunk_size,
            spec.palette
                .as_ref()
                .map_or("unrestricted".to_string(), |p| format!("{} colours", p.len()))
        );
        self.rooms.insert(spec.id.clone(), Room::new(spec));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Room> {
        self.rooms.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rooms.contains_key(id)
    }

    pub fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Check a pixel write against the room's bounds and palette.
    ///
    /// Palette membership is an exact string match.
    pub fn validate_write(
        &self,
        room_id: &str,
        x: i64,
        y: i64,
        color: &str,
    ) -> Result<ValidatedWrite, ValidationError> {
        let room = self
            .rooms
            .get(room_id)
            .ok_or_else(|| ValidationError::UnknownRoom(room_id.to_string()))?;
        let spec = room.spec();
        if x < 0 || y < 0 || x >= spec.width as i64 || y >= spec.height as i64 {
            return Err(ValidationError::OutOfBounds { x, y });
        }
        if !room.allows(color) {
            return Err(ValidationError::ColorNotAllowed(color.to_string()));
        }
        let rgba =
            parse_hex_color(color).map_err(|_| ValidationError::InvalidColor(color.to_string()))?;

        let (x, y) = (x as u32, y as u32);
        Ok(ValidatedWrite {
            key: ChunkKey::new(room_id, x / spec.chunk_size, y / spec.chunk_size),
            local_x: x % spec.chunk_size,
            local_y: y % spec.chunk_size,
            x,
            y,
            color: color.to_string(),
            rgba,
        })
    }

    /// Resolve a chunk subscription to its key, if the room and coordinate exist.
    pub fn chunk_key(&self, room_id: &str, cx: i64, cy: i64) -> Option<ChunkKey> {
        let room = self.rooms.get(room_id)?;
        if !room.chunk_in_bounds(cx, cy) {
            return None;
        }
        Some(ChunkKey::new(room_id, cx as u32, cy as u32))
    }

    pub fn connect_user(&self, room_id: &str, user: Uuid) -> bool {
        match self.rooms.get(room_id) {
            Some(room) => match room.users.lock() {
                Ok(mut users) => users.insert(user),
                Err(_) => false,
            },
            None => false,
        }
    }

    pub fn disconnect_user(&self, room_id: &str, user: Uuid) -> bool {
        match self.rooms.get(room_id) {
            Some(room) => match room.users.lock() {
                Ok(mut users) => users.remove(&user),
                Err(_) => false,
            },
            None => false,
        }
    }

    pub fn user_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, Room::user_count)
    }
}
