//! Append-only edit journal.
//!
//! One JSON object per line, in the order the edits were applied:
//!
//! ```text
//! {"x":5,"y":5,"color":"#000000","timestamp":1700000000000}
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// One accepted pixel write, in chunk-local coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRecord {
    pub x: u32,
    pub y: u32,
    pub color: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Journal I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Journal record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Malformed journal line {line} in {path}")]
    Malformed { path: PathBuf, line: usize },
}

/// Per-chunk journal file.
#[derive(Debug, Clone)]
pub struct HistoryJournal {
    path: PathBuf,
}

impl HistoryJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> JournalError {
        JournalError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Append `records` as JSON lines, creating the file and its directory
    /// on first use. Data is flushed before returning.
    pub async fn append(&self, records: &[EditRecord]) -> Result<(), JournalError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(records.len() * 64);
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        file.write_all(&buf).await.map_err(|e| self.io_err(e))?;
        file.flush().await.map_err(|e| self.io_err(e))?;
        Ok(())
    }

    /// Read back every record. A missing file is an empty journal.
    pub async fn read_all(&self) -> Result<Vec<EditRecord>, JournalError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|_| JournalError::Malformed {
                    path: self.path.clone(),
                    line: i + 1,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(x: u32, color: &str, timestamp: u64) -> EditRecord {
        EditRecord {
            x,
            y: 0,
            color: color.into(),
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_append_preserves_order_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        let journal = HistoryJournal::new(dir.path().join("h-0-0").join("journal.jsonl"));

        journal
            .append(&[record(1, "#000000", 10), record(2, "#ffffff", 11)])
            .await
            .unwrap();
        journal.append(&[record(3, "#000000", 12)]).await.unwrap();

        let records = journal.read_all().await.unwrap();
        let xs: Vec<u32> = records.iter().map(|r| r.x).collect();
        assert_eq!(xs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_line_format() {
        let dir = tempfile::tempdir().unwrap();
        let journal = HistoryJournal::new(dir.path().join("journal.jsonl"));
        journal.append(&[record(5, "#000000", 42)]).await.unwrap();

        let raw = tokio::fs::read_to_string(journal.path()).await.unwrap();
        assert_eq!(raw, "{\"x\":5,\"y\":0,\"color\":\"#000000\",\"timestamp\":42}\n");
    }

    #[tokio::test]
    async fn test_empty_append_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let journal = HistoryJournal::new(dir.path().join("sub").join("journal.jsonl"));
        journal.append(&[]).await.unwrap();
        assert!(!journal.path().exists());
        assert!(journal.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_line_reported() {
        let dir = tempfile::tempdir().unwrap();
        let journal = HistoryJournal::new(dir.path().join("journal.jsonl"));
        tokio::fs::write(journal.path(), "{\"x\":1,\"y\":1,\"color\":\"#000000\",\"timestamp\":1}\nnope\n")
            .await
            .unwrap();
        assert!(matches!(
            journal.read_all().await,
            Err(JournalError::Malformed { line: 2, .. })
        ));
    }
}
