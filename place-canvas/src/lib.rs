//! # place-canvas: chunked collaborative pixel canvas server
//!
//! Many clients paint single pixels on a shared canvas and watch each
//! other's edits live. The canvas is split into square chunks; each chunk is
//! owned by one worker, saved on a throttle, and streamed to followers as
//! snapshot URLs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket (JSON)   ┌──────────────┐
//! │ CanvasClient │ ◄──────────────────► │ CanvasServer │
//! └──────────────┘                      └──────┬───────┘
//!                                              │ validate (RoomRegistry)
//!                                              ▼
//!                                      ┌───────────────┐
//!                                      │ChunkWorkerPool│  sticky round-robin
//!                                      └───────┬───────┘
//!                                   bridge (request id / events)
//!                                              ▼
//!                                      ┌───────────────┐
//!                                      │ worker task   │  owns ChunkStores
//!                                      └───────┬───────┘
//!                                              │ throttled save
//!                                              ▼
//!                               images/<room>/f-*, d-*   history/<room>/h-*
//! ```
//!
//! ## Modules
//!
//! - [`raster`]: RGBA chunk buffers and colour parsing
//! - [`codec`]: QOI / PNG / LZ4 snapshot codecs
//! - [`room`]: room table and write validation
//! - [`storage`]: snapshot layout, edit journal, per-chunk store
//! - [`throttle`]: trailing-edge save scheduler
//! - [`bridge`], [`worker`], [`pool`]: chunk workers and routing
//! - [`broadcast`]: per-chunk fan-out of save notifications
//! - [`protocol`]: JSON wire messages
//! - [`server`]: WebSocket gateway
//! - [`client`], [`viewport`]: client side helpers
//! - [`config`]: JSON configuration

pub mod bridge;
pub mod broadcast;
pub mod client;
pub mod codec;
pub mod config;
pub mod pool;
pub mod protocol;
pub mod raster;
pub mod room;
pub mod server;
pub mod storage;
pub mod throttle;
pub mod viewport;
pub mod worker;

// Re-exports for convenience
pub use bridge::{BridgeError, ChunkSnapshots, WorkerBridge, WorkerEvent, WorkerRequest};
pub use broadcast::{ChunkFeed, FeedRegistry, FeedStats};
pub use client::{CanvasClient, ClientError, ClientEvent, ConnectionState};
pub use codec::{ChunkCodec, CodecError, CodecKind};
pub use config::{ConfigError, RoomConfig, ServerConfig};
pub use pool::ChunkWorkerPool;
pub use protocol::{AckStatus, ClientMessage, ServerMessage};
pub use raster::{parse_hex_color, Raster, Rgba};
pub use room::{ChunkCoord, ChunkKey, RoomRegistry, RoomSpec, ValidationError};
pub use server::{CanvasServer, ServerError, ServerStats};
pub use storage::{ChunkStore, EditRecord, SaveEvent, SnapshotRef, StoreError};
pub use throttle::SaveThrottle;
pub use viewport::{Viewport, ViewportTracker};
pub use worker::WorkerContext;
