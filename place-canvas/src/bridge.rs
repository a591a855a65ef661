//! Request/response bridge between the coordinator and one chunk worker.
//!
//! ```text
//! coordinator                          worker task
//!     │  WorkerEnvelope { id, request }     │
//!     ├────────────────────────────────────►│
//!     │  WorkerMessage::Response { id, .. } │
//!     │◄────────────────────────────────────┤
//!     │  WorkerMessage::Event(ChunkSaved)   │
//!     │◄────────────────────────────────────┤   (unsolicited)
//! ```
//!
//! Every request carries a fresh [`RequestId`]. A reader task matches
//! responses to pending requests and forwards events to the pool callback.
//! When the worker goes away every pending request fails with
//! [`BridgeError::WorkerUnavailable`].

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::room::ChunkKey;
use crate::storage::{SaveEvent, SnapshotRef};

/// Correlation id of one bridge round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
    /// Paint a pixel given in room coordinates.
    PutPixel {
        room: String,
        x: u32,
        y: u32,
        color: String,
    },
    /// Latest snapshot references of a chunk, loading it if needed.
    GetChunkPaths { key: ChunkKey },
    /// Run every pending throttled save now.
    Flush,
}

/// Latest saved snapshots of one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkSnapshots {
    pub full: Option<SnapshotRef>,
    pub diff: Option<SnapshotRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    Drawn,
    ChunkPaths(ChunkSnapshots),
    /// Number of chunks saved by a flush
    Flushed(usize),
}

/// Unsolicited worker traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    ChunkSaved(SaveEvent),
}

#[derive(Debug)]
pub struct WorkerEnvelope {
    pub id: RequestId,
    pub request: WorkerRequest,
}

#[derive(Debug)]
pub enum WorkerMessage {
    Response {
        id: RequestId,
        result: Result<WorkerReply, String>,
    },
    Event(WorkerEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("Worker {0} is unavailable")]
    WorkerUnavailable(usize),
    #[error("Worker {index} failed: {message}")]
    Worker { index: usize, message: String },
    #[error("Worker {index} sent an unexpected reply to {request}")]
    UnexpectedReply { index: usize, request: &'static str },
}

/// Callback receiving worker events on the coordinator side.
pub type EventHandler = Arc<dyn Fn(usize, WorkerEvent) + Send + Sync>;

type PendingMap = HashMap<RequestId, oneshot::Sender<Result<WorkerReply, String>>>;

/// Coordinator-side handle of one worker.
pub struct WorkerBridge {
    index: usize,
    /// `None` when the worker failed to initialize
    inbox: Option<mpsc::UnboundedSender<WorkerEnvelope>>,
    pending: Arc<Mutex<PendingMap>>,
}

impl WorkerBridge {
    /// Wrap the channels of a worker that finished its init handshake.
    pub(crate) fn connected(
        index: usize,
        inbox: mpsc::UnboundedSender<WorkerEnvelope>,
        mut outbox: mpsc::UnboundedReceiver<WorkerMessage>,
        on_event: EventHandler,
    ) -> Self {
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();

        tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                match message {
                    WorkerMessage::Response { id, result } => {
                        let waiter = reader_pending.lock().await.remove(&id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(result);
                            }
                            None => log::warn!("Worker {index} answered unknown request {id}"),
                        }
                    }
                    WorkerMessage::Event(event) => on_event(index, event),
                }
            }

            // Dropping the senders fails every waiter.
            let orphaned = {
                let mut pending = reader_pending.lock().await;
                let count = pending.len();
                pending.clear();
                count
            };
            log::error!("Worker {index} stopped; {orphaned} pending requests failed");
        });

        Self {
            index,
            inbox: Some(inbox),
            pending,
        }
    }

    /// A slot whose worker never came up. Every request fails immediately.
    pub(crate) fn unavailable(index: usize) -> Self {
        Self {
            index,
            inbox: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_available(&self) -> bool {
        self.inbox.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, request: WorkerRequest) -> Result<WorkerReply, BridgeError> {
        let inbox = self
            .inbox
            .as_ref()
            .ok_or(BridgeError::WorkerUnavailable(self.index))?;

        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if inbox.send(WorkerEnvelope { id, request }).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(BridgeError::WorkerUnavailable(self.index));
        }

        match rx.await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(message)) => Err(BridgeError::Worker {
                index: self.index,
                message,
            }),
            Err(_) => Err(BridgeError::WorkerUnavailable(self.index)),
        }
    }

    pub async fn put_pixel(
        &self,
        room: &str,
        x: u32,
        y: u32,
        color: &str,
    ) -> Result<(), BridgeError> {
        let request = WorkerRequest::PutPixel {
            room: room.to_string(),
            x,
            y,
            color: color.to_string(),
        };
        match self.request(request).await? {
            WorkerReply::Drawn => Ok(()),
            _ => Err(self.unexpected("PutPixel")),
        }
    }

    pub async fn get_chunk_paths(&self, key: &ChunkKey) -> Result<ChunkSnapshots, BridgeError> {
        match self.request(WorkerRequest::GetChunkPaths { key: key.clone() }).await? {
            WorkerReply::ChunkPaths(snapshots) => Ok(snapshots),
            _ => Err(self.unexpected("GetChunkPaths")),
        }
    }

    pub async fn flush(&self) -> Result<usize, BridgeError> {
        match self.request(WorkerRequest::Flush).await? {
            WorkerReply::Flushed(saved) => Ok(saved),
            _ => Err(self.unexpected("Flush")),
        }
    }

    fn unexpected(&self, request: &'static str) -> BridgeError {
        BridgeError::UnexpectedReply {
            index: self.index,
            request,
        }
    }
}
