//! Fixed pool of chunk workers with sticky chunk assignment.
//!
//! A chunk is bound to a worker the first time it is touched, round-robin,
//! and stays there for the lifetime of the process. All operations on that
//! chunk go through the same worker, which serializes them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::bridge::{BridgeError, ChunkSnapshots, EventHandler, WorkerBridge};
use crate::room::{ChunkKey, ValidatedWrite};
use crate::worker::{spawn_worker, WorkerContext};

#[derive(Default)]
struct Assignments {
    by_chunk: HashMap<ChunkKey, usize>,
    next: usize,
}

pub struct ChunkWorkerPool {
    workers: Vec<Arc<WorkerBridge>>,
    assignments: RwLock<Assignments>,
}

impl ChunkWorkerPool {
    /// Spawn `size` workers and wait for each to finish initializing.
    ///
    /// `on_event` receives every unsolicited worker event, tagged with the
    /// worker index.
    pub async fn start(size: usize, ctx: WorkerContext, on_event: EventHandler) -> Self {
        let size = if size == 0 {
            log::warn!("Worker pool size 0 requested, using 1");
            1
        } else {
            size
        };

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let bridge = spawn_worker(index, ctx.clone(), on_event.clone()).await;
            workers.push(Arc::new(bridge));
        }
        let available = workers.iter().filter(|w| w.is_available()).count();
        log::info!("Worker pool started: {available}/{size} workers available");

        Self {
            workers,
            assignments: RwLock::new(Assignments::default()),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The worker owning `key`, assigning one if the chunk is new.
    pub async fn get_worker(&self, key: &ChunkKey) -> Arc<WorkerBridge> {
        let index = self.assign(key).await;
        self.workers[index].clone()
    }

    /// Index of the worker `key` is bound to, if it has been touched.
    pub async fn assignment(&self, key: &ChunkKey) -> Option<usize> {
        self.assignments.read().await.by_chunk.get(key).copied()
    }

    async fn assign(&self, key: &ChunkKey) -> usize {
        // Fast path: read lock
        if let Some(index) = self.assignment(key).await {
            return index;
        }

        let mut assignments = self.assignments.write().await;
        // Double-check after acquiring write lock
        if let Some(index) = assignments.by_chunk.get(key) {
            return *index;
        }
        let index = assignments.next % self.workers.len();
        assignments.next = assignments.next.wrapping_add(1);
        assignments.by_chunk.insert(key.clone(), index);
        log::debug!("Chunk {key} assigned to worker {index}");
        index
    }

    /// Route a validated write to the chunk's worker.
    pub async fn put_pixel(&self, write: &ValidatedWrite) -> Result<(), BridgeError> {
        self.get_worker(&write.key)
            .await
            .put_pixel(&write.key.room, write.x, write.y, &write.color)
            .await
    }

    pub async fn get_chunk_paths(&self, key: &ChunkKey) -> Result<ChunkSnapshots, BridgeError> {
        self.get_worker(key).await.get_chunk_paths(key).await
    }

    /// Force every pending throttled save on every worker. Returns the number
    /// of chunks saved; unavailable workers are skipped.
    pub async fn flush_all(&self) -> usize {
        let mut saved = 0;
        for worker in &self.workers {
            match worker.flush().await {
                Ok(n) => saved += n,
                Err(BridgeError::WorkerUnavailable(_)) => {}
                Err(e) => log::error!("Flush failed: {e}"),
            }
        }
        saved
    }

    pub async fn assigned_chunks(&self) -> usize {
        self.assignments.read().await.by_chunk.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecKind;
    use crate::room::{RoomRegistry, RoomSpec};
    use crate::storage::StorageRoots;
    use std::time::Duration;

    async fn pool(dir: &std::path::Path, size: usize) -> ChunkWorkerPool {
        let mut rooms = RoomRegistry::new();
        rooms
            .create_room(RoomSpec {
                id: "roomA".into(),
                width: 256,
                height: 256,
                chunk_size: 64,
                palette: Some(vec!["#000000".into(), "#ffffff".into()]),
            })
            .unwrap();
        let ctx = WorkerContext {
            rooms: Arc::new(rooms),
            roots: StorageRoots::new(dir.join("images"), dir.join("history"), "images"),
            codec: CodecKind::Qoi,
            throttle: Duration::from_secs(60),
        };
        ChunkWorkerPool::start(size, ctx, Arc::new(|_, _| {})).await
    }

    #[tokio::test]
    async fn test_round_robin_in_first_touch_order() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 4).await;
        assert_eq!(pool.worker_count(), 4);

        let keys: Vec<ChunkKey> = (0..6).map(|i| ChunkKey::new("roomA", i % 4, i / 4)).collect();
        for key in &keys {
            pool.get_worker(key).await;
        }
        let indices: Vec<usize> = futures_util::future::join_all(keys.iter().map(|k| pool.assignment(k)))
            .await
            .into_iter()
            .map(|i| i.unwrap())
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 0, 1]);
    }

    #[tokio::test]
    async fn test_assignment_is_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 4).await;
        let a = ChunkKey::new("roomA", 0, 0);
        let b = ChunkKey::new("roomA", 3, 2);

        let wa = pool.get_worker(&a).await.index();
        let wb = pool.get_worker(&b).await.index();
        assert_ne!(wa, wb);

        for cy in 0..4 {
            for cx in 0..4 {
                pool.get_worker(&ChunkKey::new("roomA", cx, cy)).await;
            }
        }
        assert_eq!(pool.get_worker(&a).await.index(), wa);
        assert_eq!(pool.get_worker(&b).await.index(), wb);
        assert_eq!(pool.assignment(&a).await, Some(wa));
        assert_eq!(pool.assigned_chunks().await, 16);
    }

    #[tokio::test]
    async fn test_untouched_chunk_has_no_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 2).await;
        assert_eq!(pool.assignment(&ChunkKey::new("roomA", 1, 1)).await, None);
    }

    #[tokio::test]
    async fn test_concurrent_first_touch_assigns_once() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(pool(dir.path(), 4).await);
        let key = ChunkKey::new("roomA", 2, 2);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let key = key.clone();
                tokio::spawn(async move { pool.get_worker(&key).await.index() })
            })
            .collect();
        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.dedup();
        assert_eq!(seen.len(), 1);
        assert_eq!(pool.assigned_chunks().await, 1);
    }

    #[tokio::test]
    async fn test_put_pixel_and_flush_all() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 2).await;
        let rooms = {
            let mut rooms = RoomRegistry::new();
            rooms
                .create_room(RoomSpec {
                    id: "roomA".into(),
                    width: 256,
                    height: 256,
                    chunk_size: 64,
                    palette: None,
                })
                .unwrap();
            rooms
        };
        for (x, y) in [(5, 5), (200, 130)] {
            let write = rooms.validate_write("roomA", x, y, "#000000").unwrap();
            pool.put_pixel(&write).await.unwrap();
        }
        assert_eq!(pool.flush_all().await, 2);
        let paths = pool
            .get_chunk_paths(&ChunkKey::new("roomA", 3, 2))
            .await
            .unwrap();
        assert!(paths.full.is_some());
    }

    #[tokio::test]
    async fn test_zero_size_pool_gets_one_worker() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), 0).await;
        assert_eq!(pool.worker_count(), 1);
    }
}
