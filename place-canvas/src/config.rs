//! Server configuration, read from a JSON file.
//!
//! ```json
//! {
//!   "bindAddr": "127.0.0.1:3000",
//!   "saveFormat": "qoi",
//!   "workersCount": 4,
//!   "throttleMs": 500,
//!   "rooms": {
//!     "room1": { "sizeX": 256, "sizeY": 256, "chunkSize": 64, "colors": ["#000000", "#ffffff"] }
//!   }
//! }
//! ```
//!
//! Every field is optional; missing fields take their defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::CodecKind;
use crate::room::{RoomError, RoomRegistry, RoomSpec};

/// Palette of the built-in default room.
pub const DEFAULT_PALETTE: [&str; 32] = [
    "#6d001a", "#be0039", "#ff4500", "#ffa800", "#ffd635", "#fff8b8", "#00a368", "#00cc78",
    "#7eed56", "#00756f", "#009eaa", "#00ccc0", "#2450a4", "#3690ea", "#51e9f4", "#493ac1",
    "#6a5cff", "#94b3ff", "#811e9f", "#b44ac0", "#e4abff", "#de107f", "#ff3881", "#ff99aa",
    "#6d482f", "#9c6926", "#ffb470", "#000000", "#515252", "#898d90", "#d4d7d9", "#ffffff",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Room(#[from] RoomError),
}

/// One room entry in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomConfig {
    pub size_x: u32,
    pub size_y: u32,
    pub chunk_size: u32,
    #[serde(default)]
    pub colors: Option<Vec<String>>,
}

impl RoomConfig {
    fn to_spec(&self, id: &str) -> RoomSpec {
        RoomSpec {
            id: id.to_string(),
            width: self.size_x,
            height: self.size_y,
            chunk_size: self.chunk_size,
            palette: self.colors.clone(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener to
    pub bind_addr: String,
    /// Codec used for new snapshots
    pub save_format: CodecKind,
    /// Number of chunk workers, fixed for the process lifetime
    pub workers_count: usize,
    /// Trailing-edge save throttle per chunk, in milliseconds
    pub throttle_ms: u64,
    /// Root of the full/diff snapshot directories
    pub images_dir: PathBuf,
    /// Root of the per-chunk history journals
    pub history_dir: PathBuf,
    /// Prefix of the snapshot URLs sent to clients
    pub image_url_prefix: String,
    /// Room definitions, keyed by room id
    pub rooms: BTreeMap<String, RoomConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut rooms = BTreeMap::new();
        rooms.insert(
            "room1".to_string(),
            RoomConfig {
                size_x: 256,
                size_y: 256,
                chunk_size: 64,
                colors: Some(DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect()),
            },
        );
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            save_format: CodecKind::Qoi,
            workers_count: 4,
            throttle_ms: 500,
            images_dir: PathBuf::from("images"),
            history_dir: PathBuf::from("history"),
            image_url_prefix: "images".to_string(),
            rooms,
        }
    }
}

impl ServerConfig {
    /// Config for testing: storage under `dir`, ephemeral port, short throttle.
    pub fn for_testing(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            workers_count: 2,
            throttle_ms: 50,
            images_dir: dir.join("images"),
            history_dir: dir.join("history"),
            ..Self::default()
        }
    }

    /// Read and parse a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Read a config file, falling back to the defaults when it is missing or invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("{e}; using default config");
                Self::default()
            }
        }
    }

    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    /// Build the room registry from the configured rooms.
    pub fn room_registry(&self) -> Result<RoomRegistry, ConfigError> {
        let mut registry = RoomRegistry::new();
        for (id, room) in &self.rooms {
            registry.create_room(room.to_spec(id))?;
        }
        Ok(registry)
    }

    /// Replace the room table with a single room.
    pub fn with_room(mut self, id: impl Into<String>, room: RoomConfig) -> Self {
        self.rooms.clear();
        self.rooms.insert(id.into(), room);
        self
    }
}
