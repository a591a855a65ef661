//! WebSocket client for the canvas server.
//!
//! Used by tools and tests to paint and follow chunks the way a browser
//! client would:
//!
//! ```no_run
//! # async fn demo() -> Result<(), place_canvas::client::ClientError> {
//! use place_canvas::client::{CanvasClient, ClientEvent};
//! use place_canvas::protocol::ServerMessage;
//!
//! let mut client = CanvasClient::new("ws://127.0.0.1:3000", "room1");
//! let mut events = client.take_event_rx().expect("first call");
//! client.connect().await?;
//! client.subscribe(0, 0).await?;
//! client.set_pixel(5, 5, "#000000").await?;
//! while let Some(event) = events.recv().await {
//!     if let ClientEvent::Message(ServerMessage::Diff { data, .. }) = event {
//!         println!("chunk changed: {data}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::viewport::{Viewport, ViewportTracker};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the canvas client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    /// A decoded server message, in arrival order
    Message(ServerMessage),
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct CanvasClient {
    server_url: String,
    room: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl CanvasClient {
    pub fn new(server_url: impl Into<String>, room: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            room: room.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// `<server>/?id=<room>`
    pub fn url(&self) -> String {
        format!("{}/?id={}", self.server_url.trim_end_matches('/'), self.room)
    }

    /// Connect and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.url()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: decode server messages into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(decoded) => {
                            if event_tx.send(ClientEvent::Message(decoded)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    async fn send(&self, message: &ClientMessage) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Message::Text(message.encode()?.into()))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    pub async fn set_pixel(&self, x: i64, y: i64, color: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::Pxl {
            x,
            y,
            color: color.to_string(),
        })
        .await
    }

    /// Follow chunk `(cx, cy)`.
    pub async fn subscribe(&self, cx: i64, cy: i64) -> Result<(), ClientError> {
        self.send(&ClientMessage::Sub { x: cx, y: cy }).await
    }

    /// Subscribe to every chunk newly visible in `viewport`. Returns how many
    /// subscriptions were sent.
    pub async fn follow_viewport(
        &self,
        tracker: &mut ViewportTracker,
        viewport: &Viewport,
    ) -> Result<usize, ClientError> {
        let fresh = tracker.update(viewport);
        for coord in &fresh {
            self.subscribe(coord.cx as i64, coord.cy as i64).await?;
        }
        Ok(fresh.len())
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Send a raw text frame, bypassing message encoding.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Message::Text(text.into().into()))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Close the connection.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn room(&self) -> &str {
        &self.room
    }
}
