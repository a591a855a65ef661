//! Raster state of a single chunk.
//!
//! Each chunk keeps two buffers:
//!
//! - **full**: cumulative authoritative pixels
//! - **diff**: only the pixels written since the last save
//!
//! A save encodes both to new timestamp-named snapshot files, clears the
//! diff buffer, moves the pending edit records into the history journal and
//! then notifies save listeners. A `ChunkStore` is owned by exactly one
//! worker, so none of this is locked.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::codec::{ChunkCodec, CodecError, CodecKind};
use crate::raster::{parse_hex_color, ColorError, Raster};
use crate::room::ChunkKey;

use super::journal::{EditRecord, HistoryJournal, JournalError};
use super::layout::{latest_snapshot, now_millis, ChunkPaths, SnapshotClock, SnapshotRef};

/// Error type a save listener may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Handle returned by [`ChunkStore::listen_save`].
pub type ListenerId = u64;

type SaveListener = Box<dyn FnMut(&SaveEvent) -> Result<(), ListenerError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Chunk {0} used before load()")]
    NotLoaded(ChunkKey),
    #[error("Pixel ({x}, {y}) outside chunk {key}")]
    OutOfChunk { key: ChunkKey, x: u32, y: u32 },
    #[error(transparent)]
    Color(#[from] ColorError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Emitted to listeners after a save's files and journal entries are durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveEvent {
    pub key: ChunkKey,
    pub full: SnapshotRef,
    pub diff: SnapshotRef,
    /// Number of edit records flushed to the journal by this save
    pub edits: usize,
}

struct Buffers {
    full: Raster,
    diff: Raster,
}

pub struct ChunkStore {
    key: ChunkKey,
    size: u32,
    paths: ChunkPaths,
    codec: Arc<dyn ChunkCodec>,
    journal: HistoryJournal,
    buffers: Option<Buffers>,
    latest_full: Option<SnapshotRef>,
    latest_diff: Option<SnapshotRef>,
    pending: Vec<EditRecord>,
    listeners: Vec<(ListenerId, SaveListener)>,
    next_listener: ListenerId,
    clock: SnapshotClock,
    saves: u64,
}

impl ChunkStore {
    pub fn new(key: ChunkKey, size: u32, paths: ChunkPaths, codec: Arc<dyn ChunkCodec>) -> Self {
        let journal = HistoryJournal::new(paths.journal_path());
        Self {
            key,
            size,
            paths,
            codec,
            journal,
            buffers: None,
            latest_full: None,
            latest_diff: None,
            pending: Vec::new(),
            listeners: Vec::new(),
            next_listener: 0,
            clock: SnapshotClock::default(),
            saves: 0,
        }
    }

    /// Allocate zeroed buffers and restore the latest full snapshot, if any.
    ///
    /// Buffers are allocated before the snapshot is read, so a corrupt
    /// snapshot leaves the chunk loaded with an empty full buffer and the
    /// error is returned to the caller. Calling again is a no-op.
    pub async fn load(&mut self) -> Result<(), StoreError> {
        if self.buffers.is_some() {
            return Ok(());
        }
        self.buffers = Some(Buffers {
            full: Raster::new(self.size, self.size),
            diff: Raster::new(self.size, self.size),
        });

        let Some((ts, path)) = latest_snapshot(&self.paths.full_dir).await? else {
            return Ok(());
        };
        self.clock.observe(ts);
        if let Some((diff_ts, _)) = latest_snapshot(&self.paths.diff_dir).await? {
            self.clock.observe(diff_ts);
        }

        let raster = Self::decode_snapshot(&path).await?;
        if raster.width() != self.size || raster.height() != self.size {
            return Err(CodecError::CorruptData(format!(
                "{} is {}x{}, expected {}x{}",
                path.display(),
                raster.width(),
                raster.height(),
                self.size,
                self.size
            ))
            .into());
        }
        if let Some(buffers) = self.buffers.as_mut() {
            buffers.full = raster;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.latest_full = Some(self.paths.full_ref(&file_name));
        log::debug!("Chunk {} restored from {}", self.key, path.display());
        Ok(())
    }

    async fn decode_snapshot(path: &Path) -> Result<Raster, StoreError> {
        let kind = CodecKind::for_path(path)?;
        let bytes = tokio::fs::read(path).await?;
        Ok(kind.codec().decode(&bytes)?)
    }

    /// Paint one chunk-local pixel into both buffers and record the edit.
    ///
    /// The caller schedules the throttled save.
    pub fn draw_pixel(&mut self, x: u32, y: u32, color: &str) -> Result<(), StoreError> {
        let buffers = self
            .buffers
            .as_mut()
            .ok_or_else(|| StoreError::NotLoaded(self.key.clone()))?;
        if x >= self.size || y >= self.size {
            return Err(StoreError::OutOfChunk {
                key: self.key.clone(),
                x,
                y,
            });
        }
        let rgba = parse_hex_color(color)?;

        self.pending.push(EditRecord {
            x,
            y,
            color: color.to_string(),
            timestamp: now_millis(),
        });
        buffers.full.put(x, y, rgba);
        buffers.diff.put(x, y, rgba);
        Ok(())
    }

    /// Persist both buffers and the pending journal entries, then notify listeners.
    ///
    /// On failure nothing is cleared: the diff buffer and pending edits stay
    /// in place for the next save.
    pub async fn save(&mut self) -> Result<SaveEvent, StoreError> {
        let buffers = self
            .buffers
            .as_ref()
            .ok_or_else(|| StoreError::NotLoaded(self.key.clone()))?;
        let full_bytes = self.codec.encode(&buffers.full)?;
        let diff_bytes = self.codec.encode(&buffers.diff)?;

        let file_name = format!("{}.{}", self.clock.next(), self.codec.extension());
        let full = self.paths.full_ref(&file_name);
        let diff = self.paths.diff_ref(&file_name);

        tokio::fs::create_dir_all(&self.paths.full_dir).await?;
        tokio::fs::write(&full.path, &full_bytes).await?;
        tokio::fs::create_dir_all(&self.paths.diff_dir).await?;
        tokio::fs::write(&diff.path, &diff_bytes).await?;

        let records = std::mem::take(&mut self.pending);
        let appended = self.journal.append(&records).await;
        if let Err(e) = appended {
            // Put the batch back ahead of anything newer.
            let newer = std::mem::replace(&mut self.pending, records);
            self.pending.extend(newer);
            return Err(e.into());
        }

        if let Some(buffers) = self.buffers.as_mut() {
            buffers.diff.clear();
        }
        self.latest_full = Some(full.clone());
        self.latest_diff = Some(diff.clone());
        self.saves += 1;

        let event = SaveEvent {
            key: self.key.clone(),
            full,
            diff,
            edits: records.len(),
        };
        log::debug!("Chunk {} saved ({} edits) as {file_name}", self.key, event.edits);
        self.notify(&event);
        Ok(event)
    }

    fn notify(&mut self, event: &SaveEvent) {
        for (id, listener) in self.listeners.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("Save listener {id} for chunk {} failed: {e}", event.key);
                }
                Err(_) => {
                    log::error!("Save listener {id} for chunk {} panicked", event.key);
                }
            }
        }
    }

    /// Register a save observer.
    pub fn listen_save<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&SaveEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a save observer. Unknown ids are ignored.
    pub fn unlisten_save(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub fn is_loaded(&self) -> bool {
        self.buffers.is_some()
    }

    pub fn latest_full(&self) -> Option<&SnapshotRef> {
        self.latest_full.as_ref()
    }

    pub fn latest_diff(&self) -> Option<&SnapshotRef> {
        self.latest_diff.as_ref()
    }

    pub fn pending_edits(&self) -> &[EditRecord] {
        &self.pending
    }

    pub fn has_pending_edits(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn full_raster(&self) -> Option<&Raster> {
        self.buffers.as_ref().map(|b| &b.full)
    }

    pub fn diff_raster(&self) -> Option<&Raster> {
        self.buffers.as_ref().map(|b| &b.diff)
    }

    pub fn save_count(&self) -> u64 {
        self.saves
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn journal(&self) -> &HistoryJournal {
        &self.journal
    }
}
