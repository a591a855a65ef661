//! Chunk worker actor.
//!
//! A worker is a long-lived tokio task that exclusively owns the
//! [`ChunkStore`]s of the chunks routed to it. Requests arrive over the
//! bridge one at a time, so a chunk's buffers are only ever touched by one
//! task and need no locking. Throttled saves fire from the same loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::bridge::{
    ChunkSnapshots, EventHandler, WorkerBridge, WorkerEnvelope, WorkerEvent, WorkerMessage,
    WorkerReply, WorkerRequest,
};
use crate::codec::{ChunkCodec, CodecKind};
use crate::room::{ChunkKey, RoomRegistry};
use crate::storage::{ChunkStore, StorageRoots};
use crate::throttle::SaveThrottle;

/// Everything a worker needs, shared by all workers of a pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub rooms: Arc<RoomRegistry>,
    pub roots: StorageRoots,
    pub codec: CodecKind,
    pub throttle: Duration,
}

/// Start worker `index` and wait for its init handshake.
///
/// A worker that fails to initialize yields a bridge that rejects every
/// request with `WorkerUnavailable`.
pub async fn spawn_worker(index: usize, ctx: WorkerContext, on_event: EventHandler) -> WorkerBridge {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    tokio::spawn(run(index, ctx, in_rx, out_tx, ready_tx));

    match ready_rx.await {
        Ok(Ok(())) => {
            log::debug!("Worker {index} ready");
            WorkerBridge::connected(index, in_tx, out_rx, on_event)
        }
        Ok(Err(e)) => {
            log::error!("Worker {index} failed to initialize: {e}");
            WorkerBridge::unavailable(index)
        }
        Err(_) => {
            log::error!("Worker {index} exited during initialization");
            WorkerBridge::unavailable(index)
        }
    }
}

async fn run(
    index: usize,
    ctx: WorkerContext,
    mut inbox: mpsc::UnboundedReceiver<WorkerEnvelope>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
    ready: oneshot::Sender<std::io::Result<()>>,
) {
    let init = async {
        tokio::fs::create_dir_all(&ctx.roots.images).await?;
        tokio::fs::create_dir_all(&ctx.roots.history).await
    }
    .await;
    let failed = init.is_err();
    if ready.send(init).is_err() || failed {
        return;
    }

    let mut worker = ChunkWorker::new(index, ctx, outbox);
    loop {
        let deadline = worker.throttle.next_deadline();
        tokio::select! {
            envelope = inbox.recv() => match envelope {
                Some(envelope) => {
                    if !worker.handle(envelope).await {
                        break;
                    }
                }
                None => break,
            },
            _ = sleep_until(deadline) => worker.save_due().await,
        }
    }

    let saved = worker.save_all().await;
    log::debug!("Worker {index} stopped after saving {saved} chunks");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

struct ChunkWorker {
    index: usize,
    ctx: WorkerContext,
    codec: Arc<dyn ChunkCodec>,
    stores: HashMap<ChunkKey, ChunkStore>,
    throttle: SaveThrottle<ChunkKey>,
    outbox: mpsc::UnboundedSender<WorkerMessage>,
}

impl ChunkWorker {
    fn new(index: usize, ctx: WorkerContext, outbox: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        let throttle = SaveThrottle::new(ctx.throttle);
        Self {
            index,
            codec: Arc::from(ctx.codec.codec()),
            ctx,
            stores: HashMap::new(),
            throttle,
            outbox,
        }
    }

    /// Returns `false` once the coordinator is gone.
    async fn handle(&mut self, envelope: WorkerEnvelope) -> bool {
        let result = match envelope.request {
            WorkerRequest::PutPixel { room, x, y, color } => {
                self.put_pixel(&room, x, y, &color).await.map(|()| WorkerReply::Drawn)
            }
            WorkerRequest::GetChunkPaths { key } => {
                self.chunk_paths(&key).await.map(WorkerReply::ChunkPaths)
            }
            WorkerRequest::Flush => Ok(WorkerReply::Flushed(self.save_all().await)),
        };
        self.outbox
            .send(WorkerMessage::Response {
                id: envelope.id,
                result,
            })
            .is_ok()
    }

    async fn put_pixel(&mut self, room: &str, x: u32, y: u32, color: &str) -> Result<(), String> {
        let write = self
            .ctx
            .rooms
            .validate_write(room, x as i64, y as i64, color)
            .map_err(|e| e.to_string())?;
        let store = self.store(&write.key).await?;
        store
            .draw_pixel(write.local_x, write.local_y, &write.color)
            .map_err(|e| e.to_string())?;
        if self.throttle.request(write.key.clone()) {
            log::trace!("Worker {}: save of {} scheduled", self.index, write.key);
        }
        Ok(())
    }

    async fn chunk_paths(&mut self, key: &ChunkKey) -> Result<ChunkSnapshots, String> {
        let store = self.store(key).await?;
        Ok(ChunkSnapshots {
            full: store.latest_full().cloned(),
            diff: store.latest_diff().cloned(),
        })
    }

    /// The store for `key`, created and loaded on first access.
    async fn store(&mut self, key: &ChunkKey) -> Result<&mut ChunkStore, String> {
        if !self.stores.contains_key(key) {
            let room = self
                .ctx
                .rooms
                .get(&key.room)
                .ok_or_else(|| format!("Unknown room: {}", key.room))?;
            if !room.chunk_in_bounds(key.coord.cx as i64, key.coord.cy as i64) {
                return Err(format!("Chunk {key} outside room"));
            }

            let mut store = ChunkStore::new(
                key.clone(),
                room.spec().chunk_size,
                self.ctx.roots.chunk(key),
                self.codec.clone(),
            );
            if let Err(e) = store.load().await {
                log::error!("Chunk {key} could not be restored, starting empty: {e}");
            }
            let events = self.outbox.clone();
            store.listen_save(move |event| {
                events
                    .send(WorkerMessage::Event(WorkerEvent::ChunkSaved(event.clone())))
                    .map_err(|_| "coordinator is gone".into())
            });
            log::debug!("Worker {} now owns chunk {key}", self.index);
            self.stores.insert(key.clone(), store);
        }
        self.stores
            .get_mut(key)
            .ok_or_else(|| format!("Chunk {key} missing after load"))
    }

    async fn save_due(&mut self) {
        for key in self.throttle.take_due(Instant::now()) {
            self.save(&key).await;
        }
    }

    async fn save_all(&mut self) -> usize {
        let mut saved = 0;
        for key in self.throttle.take_all() {
            if self.save(&key).await {
                saved += 1;
            }
        }
        saved
    }

    async fn save(&mut self, key: &ChunkKey) -> bool {
        let Some(store) = self.stores.get_mut(key) else {
            return false;
        };
        match store.save().await {
            Ok(_) => true,
            Err(e) => {
                log::error!("Save of chunk {key} failed, retrying next window: {e}");
                self.throttle.request(key.clone());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeError;
    use crate::room::RoomSpec;
    use std::sync::Mutex;

    fn context(dir: &std::path::Path, throttle: Duration) -> WorkerContext {
        let mut rooms = RoomRegistry::new();
        rooms
            .create_room(RoomSpec {
                id: "roomA".into(),
                width: 128,
                height: 128,
                chunk_size: 64,
                palette: None,
            })
            .unwrap();
        WorkerContext {
            rooms: Arc::new(rooms),
            roots: StorageRoots::new(dir.join("images"), dir.join("history"), "images"),
            codec: CodecKind::Qoi,
            throttle,
        }
    }

    fn recorder() -> (EventHandler, Arc<Mutex<Vec<WorkerEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handler: EventHandler = Arc::new(move |_, event| sink.lock().unwrap().push(event));
        (handler, events)
    }

    #[tokio::test]
    async fn test_init_creates_storage_roots() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = recorder();
        let bridge = spawn_worker(0, context(dir.path(), Duration::from_secs(60)), handler).await;
        assert!(bridge.is_available());
        assert!(dir.path().join("images").is_dir());
        assert!(dir.path().join("history").is_dir());
    }

    #[tokio::test]
    async fn test_init_failure_makes_slot_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the images directory should go.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let mut ctx = context(dir.path(), Duration::from_secs(60));
        ctx.roots.images = blocker.join("images");

        let (handler, _) = recorder();
        let bridge = spawn_worker(3, ctx, handler).await;
        assert!(!bridge.is_available());
        assert_eq!(
            bridge.put_pixel("roomA", 0, 0, "#000000").await,
            Err(BridgeError::WorkerUnavailable(3))
        );
    }

    #[tokio::test]
    async fn test_put_pixel_then_flush_emits_chunk_saved() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, events) = recorder();
        let bridge = spawn_worker(0, context(dir.path(), Duration::from_secs(60)), handler).await;

        bridge.put_pixel("roomA", 70, 5, "#000000").await.unwrap();
        bridge.put_pixel("roomA", 71, 5, "#ffffff").await.unwrap();
        let key = ChunkKey::new("roomA", 1, 0);
        let before = bridge.get_chunk_paths(&key).await.unwrap();
        assert_eq!(before, ChunkSnapshots::default());

        assert_eq!(bridge.flush().await, Ok(1));
        let after = bridge.get_chunk_paths(&key).await.unwrap();
        assert!(after.full.is_some() && after.diff.is_some());

        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        let WorkerEvent::ChunkSaved(event) = &events[0];
        assert_eq!(event.key, key);
        assert_eq!(event.edits, 2);
        assert_eq!(Some(&event.full), after.full.as_ref());
    }

    #[tokio::test]
    async fn test_throttle_coalesces_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, events) = recorder();
        let bridge = spawn_worker(0, context(dir.path(), Duration::from_millis(50)), handler).await;

        bridge.put_pixel("roomA", 1, 1, "#000000").await.unwrap();
        bridge.put_pixel("roomA", 1, 1, "#000000").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        // Nothing left to flush.
        assert_eq!(bridge.flush().await, Ok(0));
    }

    #[tokio::test]
    async fn test_bad_requests_are_worker_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = recorder();
        let bridge = spawn_worker(1, context(dir.path(), Duration::from_secs(60)), handler).await;

        assert!(matches!(
            bridge.put_pixel("nope", 0, 0, "#000000").await,
            Err(BridgeError::Worker { index: 1, .. })
        ));
        assert!(matches!(
            bridge.get_chunk_paths(&ChunkKey::new("roomA", 9, 9)).await,
            Err(BridgeError::Worker { .. })
        ));
        // Still serving afterwards.
        bridge.put_pixel("roomA", 0, 0, "#000000").await.unwrap();
    }
}
