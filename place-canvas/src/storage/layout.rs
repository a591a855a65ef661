//! On-disk layout of chunk snapshots and journals.
//!
//! ```text
//! <images>/<room>/f-<cx>-<cy>/<timestamp>.<ext>    full snapshots
//! <images>/<room>/d-<cx>-<cy>/<timestamp>.<ext>    diff snapshots
//! <history>/<room>/h-<cx>-<cy>/journal.jsonl       edit journal
//! ```
//!
//! Snapshot names are millisecond timestamps; the latest snapshot is the one
//! with the numerically largest name.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::room::ChunkKey;

/// File name of the per-chunk edit journal.
pub const JOURNAL_FILE: &str = "journal.jsonl";

/// Storage roots shared by every chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoots {
    pub images: PathBuf,
    pub history: PathBuf,
    /// Prefix prepended to snapshot URLs handed to clients
    pub url_prefix: String,
}

impl StorageRoots {
    pub fn new(
        images: impl Into<PathBuf>,
        history: impl Into<PathBuf>,
        url_prefix: impl Into<String>,
    ) -> Self {
        Self {
            images: images.into(),
            history: history.into(),
            url_prefix: url_prefix.into(),
        }
    }

    pub fn chunk(&self, key: &ChunkKey) -> ChunkPaths {
        ChunkPaths::new(self, key)
    }
}

/// Directories belonging to one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPaths {
    pub full_dir: PathBuf,
    pub diff_dir: PathBuf,
    pub history_dir: PathBuf,
    full_url: String,
    diff_url: String,
}

impl ChunkPaths {
    pub fn new(roots: &StorageRoots, key: &ChunkKey) -> Self {
        let full_name = format!("f-{}", key.coord);
        let diff_name = format!("d-{}", key.coord);
        let room_images = roots.images.join(&key.room);
        let prefix = roots.url_prefix.trim_end_matches('/');
        Self {
            full_dir: room_images.join(&full_name),
            diff_dir: room_images.join(&diff_name),
            history_dir: roots.history.join(&key.room).join(format!("h-{}", key.coord)),
            full_url: url_join(prefix, &key.room, &full_name),
            diff_url: url_join(prefix, &key.room, &diff_name),
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.history_dir.join(JOURNAL_FILE)
    }

    pub fn full_ref(&self, file_name: &str) -> SnapshotRef {
        SnapshotRef {
            path: self.full_dir.join(file_name),
            url: format!("{}/{file_name}", self.full_url),
        }
    }

    pub fn diff_ref(&self, file_name: &str) -> SnapshotRef {
        SnapshotRef {
            path: self.diff_dir.join(file_name),
            url: format!("{}/{file_name}", self.diff_url),
        }
    }
}

fn url_join(prefix: &str, room: &str, dir: &str) -> String {
    if prefix.is_empty() {
        format!("{room}/{dir}")
    } else {
        format!("{prefix}/{room}/{dir}")
    }
}

/// A saved snapshot: where it lives on disk and the URL clients fetch it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRef {
    pub path: PathBuf,
    pub url: String,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Hands out snapshot timestamps that never repeat or go backwards,
/// even when two saves land in the same millisecond.
#[derive(Debug, Clone, Default)]
pub struct SnapshotClock {
    last: u64,
}

impl SnapshotClock {
    pub fn next(&mut self) -> u64 {
        let now = now_millis();
        self.last = if now > self.last { now } else { self.last + 1 };
        self.last
    }

    /// Never issue a name at or below `ts` (used after loading existing snapshots).
    pub fn observe(&mut self, ts: u64) {
        self.last = self.last.max(ts);
    }
}

/// Timestamp embedded in a snapshot file name, if the stem is numeric.
pub fn snapshot_timestamp(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

/// The snapshot with the numerically largest timestamp in `dir`.
///
/// A missing directory means no snapshot; files with non-numeric names are ignored.
pub async fn latest_snapshot(dir: &Path) -> std::io::Result<Option<(u64, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut latest: Option<(u64, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        if let Some(ts) = snapshot_timestamp(&path) {
            if latest.as_ref().map_or(true, |(best, _)| ts > *best) {
                latest = Some((ts, path));
            }
        }
    }
    Ok(latest)
}
