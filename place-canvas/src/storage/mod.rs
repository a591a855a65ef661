//! Chunk persistence: snapshot layout, edit journal and the per-chunk store.

pub mod chunk_store;
pub mod journal;
pub mod layout;

pub use chunk_store::{ChunkStore, ListenerError, ListenerId, SaveEvent, StoreError};
pub use journal::{EditRecord, HistoryJournal, JournalError};
pub use layout::{ChunkPaths, SnapshotClock, SnapshotRef, StorageRoots};
