//! Per-chunk fan-out of save notifications.
//!
//! Each chunk that anyone follows gets a [`ChunkFeed`] backed by a tokio
//! broadcast channel. A save is encoded once into a `diff` message and sent
//! to every subscribed connection. Receivers that fall more than `capacity`
//! messages behind skip ahead and the gap is counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ProtocolError, ServerMessage};
use crate::room::ChunkKey;
use crate::storage::SaveEvent;

/// Snapshot of a feed's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub saves: u64,
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub subscribers: usize,
}

#[derive(Default)]
struct AtomicFeedStats {
    saves: AtomicU64,
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

pub struct ChunkFeed {
    key: ChunkKey,
    sender: broadcast::Sender<Arc<String>>,
    stats: AtomicFeedStats,
}

impl ChunkFeed {
    pub fn new(key: ChunkKey, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            key,
            sender,
            stats: AtomicFeedStats::default(),
        }
    }

    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<String>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Send the `diff` for a completed save. Returns the number of receivers.
    pub fn publish_saved(&self, event: &SaveEvent) -> Result<usize, ProtocolError> {
        let encoded = ServerMessage::diff(event.key.coord, event.diff.url.clone()).encode()?;
        self.stats.saves.fetch_add(1, Ordering::Relaxed);
        Ok(self.publish_raw(Arc::new(encoded)))
    }

    /// Send a pre-encoded message to every subscriber.
    pub fn publish_raw(&self, encoded: Arc<String>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats
            .messages_sent
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn record_lag(&self, skipped: u64) {
        self.stats
            .messages_lagged
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            saves: self.stats.saves.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Maps chunks to their feeds.
pub struct FeedRegistry {
    feeds: RwLock<HashMap<ChunkKey, Arc<ChunkFeed>>>,
    capacity: usize,
}

impl FeedRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            feeds: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn get(&self, key: &ChunkKey) -> Option<Arc<ChunkFeed>> {
        self.feeds.read().await.get(key).cloned()
    }

    pub async fn get_or_create(&self, key: &ChunkKey) -> Arc<ChunkFeed> {
        // Fast path: read lock
        if let Some(feed) = self.get(key).await {
            return feed;
        }

        let mut feeds = self.feeds.write().await;
        feeds
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ChunkFeed::new(key.clone(), self.capacity)))
            .clone()
    }

    /// Fan a save out to the chunk's subscribers, if it has a feed.
    pub async fn on_chunk_saved(&self, event: &SaveEvent) -> usize {
        let Some(feed) = self.get(&event.key).await else {
            return 0;
        };
        match feed.publish_saved(event) {
            Ok(count) => {
                log::debug!("Chunk {} saved, notified {count} subscribers", event.key);
                count
            }
            Err(e) => {
                log::error!("Could not encode diff for chunk {}: {e}", event.key);
                0
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.feeds.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.feeds.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SnapshotRef;
    use tokio::sync::broadcast::error::RecvError;

    fn saved(key: &ChunkKey, ts: u64) -> SaveEvent {
        SaveEvent {
            key: key.clone(),
            full: SnapshotRef {
                path: format!("f/{ts}.qoi").into(),
                url: format!("images/{}/f-{}/{ts}.qoi", key.room, key.coord),
            },
            diff: SnapshotRef {
                path: format!("d/{ts}.qoi").into(),
                url: format!("images/{}/d-{}/{ts}.qoi", key.room, key.coord),
            },
            edits: 1,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_feed() {
        let feeds = FeedRegistry::new(8);
        let key = ChunkKey::new("r", 1, 1);
        let a = feeds.get_or_create(&key).await;
        let b = feeds.get_or_create(&key).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(feeds.len().await, 1);
    }

    #[tokio::test]
    async fn test_saved_chunk_reaches_subscribers_as_diff() {
        let feeds = FeedRegistry::new(8);
        let key = ChunkKey::new("r", 2, 3);
        let feed = feeds.get_or_create(&key).await;
        let mut rx1 = feed.subscribe();
        let mut rx2 = feed.subscribe();

        assert_eq!(feeds.on_chunk_saved(&saved(&key, 7)).await, 2);
        for rx in [&mut rx1, &mut rx2] {
            let text = rx.recv().await.unwrap();
            assert_eq!(
                ServerMessage::decode(&text).unwrap(),
                ServerMessage::Diff {
                    x: 2,
                    y: 3,
                    data: "images/r/d-2-3/7.qoi".into()
                }
            );
        }
        let stats = feed.stats();
        assert_eq!((stats.saves, stats.messages_sent, stats.subscribers), (1, 2, 2));
    }

    #[tokio::test]
    async fn test_save_without_feed_is_dropped() {
        let feeds = FeedRegistry::new(8);
        assert_eq!(feeds.on_chunk_saved(&saved(&ChunkKey::new("r", 0, 0), 1)).await, 0);
        assert!(feeds.is_empty().await);
    }

    #[tokio::test]
    async fn test_feeds_are_isolated_per_chunk() {
        let feeds = FeedRegistry::new(8);
        let a = ChunkKey::new("r", 0, 0);
        let b = ChunkKey::new("r", 1, 0);
        let mut rx_a = feeds.get_or_create(&a).await.subscribe();
        let _feed_b = feeds.get_or_create(&b).await;

        feeds.on_chunk_saved(&saved(&b, 1)).await;
        assert!(matches!(rx_a.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_lagging_receiver_skips_ahead() {
        let feeds = FeedRegistry::new(2);
        let key = ChunkKey::new("r", 0, 0);
        let feed = feeds.get_or_create(&key).await;
        let mut rx = feed.subscribe();
        for ts in 0..5 {
            feeds.on_chunk_saved(&saved(&key, ts)).await;
        }
        match rx.recv().await {
            Err(RecvError::Lagged(n)) => feed.record_lag(n),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(feed.stats().messages_lagged, 3);
        assert!(rx.recv().await.is_ok());
    }
}
