//! WebSocket gateway of the canvas server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                  ┌── Worker 0 ── ChunkStores ── images/, history/
//!             ├── CanvasServer ──┼── Worker 1 ── ChunkStores
//! Client B ──┘   (validation,   └── Worker N ...
//!                 routing)              │
//!                    ▲                  │ ChunkSaved events
//!                    │                  ▼
//!                    └──────────── FeedRegistry (one broadcast per chunk)
//! ```
//!
//! A connection names its room in the query string (`/?id=room1`). Unknown
//! or missing rooms are closed right after the handshake. Otherwise the
//! connection receives `init` and may then paint (`pxl`), follow chunks
//! (`sub`) and heartbeat (`ping`) until it closes.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::bridge::{EventHandler, WorkerEvent};
use crate::broadcast::{ChunkFeed, FeedRegistry};
use crate::config::{ConfigError, ServerConfig};
use crate::pool::ChunkWorkerPool;
use crate::protocol::{AckStatus, ClientMessage, ServerMessage};
use crate::room::{ChunkCoord, ChunkKey, RoomRegistry};
use crate::storage::StorageRoots;
use crate::worker::WorkerContext;

/// Messages buffered per chunk feed before slow subscribers start lagging.
const FEED_CAPACITY: usize = 64;
/// Outbound messages buffered per connection.
const OUTBOX_CAPACITY: usize = 256;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_connections: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
    pub pixels_accepted: u64,
    pub pixels_rejected: u64,
    pub pixels_failed: u64,
    pub subscriptions: u64,
}

/// Everything a connection needs, built once at startup.
pub struct CanvasContext {
    pub config: ServerConfig,
    pub rooms: Arc<RoomRegistry>,
    pub pool: ChunkWorkerPool,
    pub feeds: Arc<FeedRegistry>,
    pub stats: RwLock<ServerStats>,
}

/// The canvas server.
pub struct CanvasServer {
    ctx: Arc<CanvasContext>,
}

impl CanvasServer {
    /// Build the room table, start the worker pool and wire worker events
    /// to the chunk feeds.
    pub async fn start(config: ServerConfig) -> Result<Self, ServerError> {
        let rooms = Arc::new(config.room_registry()?);
        let feeds = Arc::new(FeedRegistry::new(FEED_CAPACITY));

        // Worker events are delivered in order by a single pump task.
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let on_event: EventHandler = Arc::new(move |_, event| {
            let _ = event_tx.send(event);
        });
        let pump_feeds = feeds.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    WorkerEvent::ChunkSaved(saved) => {
                        pump_feeds.on_chunk_saved(&saved).await;
                    }
                }
            }
        });

        let worker_ctx = WorkerContext {
            rooms: rooms.clone(),
            roots: StorageRoots::new(
                config.images_dir.clone(),
                config.history_dir.clone(),
                config.image_url_prefix.clone(),
            ),
            codec: config.save_format,
            throttle: config.throttle_window(),
        };
        let pool = ChunkWorkerPool::start(config.workers_count, worker_ctx, on_event).await;

        Ok(Self {
            ctx: Arc::new(CanvasContext {
                config,
                rooms,
                pool,
                feeds,
                stats: RwLock::new(ServerStats::default()),
            }),
        })
    }

    /// Bind the configured address and serve until ctrl-c, then flush
    /// pending saves.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.ctx.config.bind_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        log::info!("Canvas server listening on {}", listener.local_addr()?);

        tokio::select! {
            result = self.serve(listener) => result,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                let saved = self.ctx.pool.flush_all().await;
                log::info!("Flushed {saved} chunks");
                Ok(())
            }
        }
    }

    /// Accept connections on `listener` forever.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    pub fn context(&self) -> &Arc<CanvasContext> {
        &self.ctx
    }

    pub fn pool(&self) -> &ChunkWorkerPool {
        &self.ctx.pool
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.ctx.rooms
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }
}

/// Value of the `id` query parameter.
fn room_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "id")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<CanvasContext>,
) -> Result<(), BoxError> {
    let mut requested_room: Option<String> = None;
    let capture_room = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        requested_room = room_from_query(req.uri().query());
        Ok(resp)
    };
    let mut ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_room).await?;

    ctx.stats.write().await.total_connections += 1;

    let room = match requested_room {
        Some(id) if ctx.rooms.contains(&id) => id,
        other => {
            log::info!("Refusing {addr}: unknown room {other:?}");
            ctx.stats.write().await.refused_connections += 1;
            ws_stream.close(None).await?;
            return Ok(());
        }
    };
    let conn_id = Uuid::new_v4();
    ctx.rooms.connect_user(&room, conn_id);
    ctx.stats.write().await.active_connections += 1;
    log::info!("Connection {conn_id} from {addr} joined room {room}");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOX_CAPACITY);

    // Writer task: forward the outbox to the socket
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut connection = Connection {
        conn_id,
        room: room.clone(),
        ctx: ctx.clone(),
        outbox: out_tx,
        subscriptions: HashMap::new(),
    };

    if let Some(spec) = ctx.rooms.get(&room).map(|r| r.spec().clone()) {
        connection.send(&ServerMessage::init(&spec)).await;
    }

    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                ctx.stats.write().await.total_messages += 1;
                match ClientMessage::decode(text.as_str()) {
                    Ok(message) => connection.handle(message).await,
                    Err(e) => {
                        log::warn!("Dropping malformed message from {conn_id}: {e}");
                        ctx.stats.write().await.malformed_messages += 1;
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = connection.outbox.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                log::info!("Connection {conn_id} closed");
                break;
            }
            Some(Err(e)) => {
                log::warn!("WebSocket error from {conn_id}: {e}");
                break;
            }
            Some(Ok(_)) => {}
        }
    }

    // Cleanup: stop following chunks, leave the room
    connection.unsubscribe_all();
    drop(connection);
    ctx.stats.write().await.active_connections -= 1;
    ctx.rooms.disconnect_user(&room, conn_id);
    let _ = writer.await;
    Ok(())
}

/// Per-connection state while active.
struct Connection {
    conn_id: Uuid,
    room: String,
    ctx: Arc<CanvasContext>,
    outbox: mpsc::Sender<Message>,
    /// One forwarding task per followed chunk
    subscriptions: HashMap<ChunkCoord, JoinHandle<()>>,
}

impl Connection {
    async fn send(&self, message: &ServerMessage) {
        send_message(&self.outbox, message, self.conn_id).await;
    }

    async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Pxl { x, y, color } => {
                let status = self.paint(x, y, &color).await;
                self.send(&ServerMessage::ack(status)).await;
            }
            ClientMessage::Sub { x, y } => self.subscribe(x, y).await,
            ClientMessage::Ping => self.send(&ServerMessage::Pong).await,
        }
    }

    async fn paint(&self, x: i64, y: i64, color: &str) -> AckStatus {
        let write = match self.ctx.rooms.validate_write(&self.room, x, y, color) {
            Ok(write) => write,
            Err(e) => {
                log::debug!("Rejected pixel from {}: {e}", self.conn_id);
                self.ctx.stats.write().await.pixels_rejected += 1;
                return AckStatus::Rejected;
            }
        };
        match self.ctx.pool.put_pixel(&write).await {
            Ok(()) => {
                self.ctx.stats.write().await.pixels_accepted += 1;
                AckStatus::Ok
            }
            Err(e) => {
                log::warn!("Pixel write to {} failed: {e}", write.key);
                self.ctx.stats.write().await.pixels_failed += 1;
                AckStatus::Error
            }
        }
    }

    async fn subscribe(&mut self, cx: i64, cy: i64) {
        let Some(key) = self.ctx.rooms.chunk_key(&self.room, cx, cy) else {
            log::debug!("Ignoring sub to ({cx}, {cy}) outside room {}", self.room);
            return;
        };
        if self.subscriptions.contains_key(&key.coord) {
            return;
        }

        let feed = self.ctx.feeds.get_or_create(&key).await;
        let ctx = self.ctx.clone();
        let lookup_key = key.clone();
        let lookup = move || {
            let ctx = ctx.clone();
            let key = lookup_key.clone();
            async move { current_full(&ctx, &key).await }
        };
        let task = follow_chunk(feed, self.outbox.clone(), self.conn_id, lookup).await;
        self.subscriptions.insert(key.coord, task);
        self.ctx.stats.write().await.subscriptions += 1;
    }

    fn unsubscribe_all(&mut self) {
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

/// Encode and queue one message. Returns `false` once the outbox is closed.
async fn send_message(outbox: &mpsc::Sender<Message>, message: &ServerMessage, conn_id: Uuid) -> bool {
    match message.encode() {
        Ok(text) => outbox.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            log::error!("Could not encode message for {conn_id}: {e}");
            true
        }
    }
}

/// The `full` message for a chunk's latest snapshot, if it has one.
async fn current_full(ctx: &CanvasContext, key: &ChunkKey) -> Option<ServerMessage> {
    match ctx.pool.get_chunk_paths(key).await {
        Ok(snapshots) => snapshots
            .full
            .map(|full| ServerMessage::full(key.coord, full.url)),
        Err(e) => {
            log::warn!("Could not look up snapshots of {key}: {e}");
            None
        }
    }
}

/// Start following a chunk: send its current `full`, then its `diff`s.
///
/// The feed receiver is taken before `lookup` runs, so a save landing during
/// the lookup is queued behind the `full` instead of racing ahead of it.
async fn follow_chunk<L, Fut>(
    feed: Arc<ChunkFeed>,
    outbox: mpsc::Sender<Message>,
    conn_id: Uuid,
    lookup: L,
) -> JoinHandle<()>
where
    L: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Option<ServerMessage>> + Send + 'static,
{
    let rx = feed.subscribe();
    if let Some(full) = lookup().await {
        send_message(&outbox, &full, conn_id).await;
    }
    tokio::spawn(forward_feed(feed, rx, outbox, conn_id, lookup))
}

/// Pump a chunk feed into a connection's outbox until either side goes away.
///
/// Diffs are incremental, so a receiver that lags and skips some of them is
/// replaced by a fresh one and the connection is resynced with a `full`.
async fn forward_feed<L, Fut>(
    feed: Arc<ChunkFeed>,
    mut rx: broadcast::Receiver<Arc<String>>,
    outbox: mpsc::Sender<Message>,
    conn_id: Uuid,
    lookup: L,
) where
    L: Fn() -> Fut,
    Fut: Future<Output = Option<ServerMessage>>,
{
    loop {
        match rx.recv().await {
            Ok(text) => {
                let message = Message::Text(text.as_str().into());
                if outbox.send(message).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(n)) => {
                log::warn!(
                    "Connection {conn_id} lagged by {n} updates on {}, resyncing",
                    feed.key()
                );
                feed.record_lag(n);
                rx = feed.subscribe();
                if let Some(full) = lookup().await {
                    if !send_message(&outbox, &full, conn_id).await {
                        break;
                    }
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}
