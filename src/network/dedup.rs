//! Relay deduplication.
//!
//! The reliable sender may retry a `*Pay` message that was actually delivered
//! (the failure could have been on the response path), so the receiving side
//! must drop replays before they reach session state. Dual-window rotation
//! keeps memory bounded without a gap at the rotation edge.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// Windowed set of already-seen items.
pub struct DedupFilter {
    current: RwLock<HashSet<Vec<u8>>>,
    previous: RwLock<HashSet<Vec<u8>>>,
    rotation_interval: Duration,
    last_rotation: RwLock<Instant>,
}

impl DedupFilter {
    /// Default rotation of 5 minutes comfortably covers the longest retry
    /// schedule a sender can produce.
    pub fn new() -> Self {
        Self::with_rotation(Duration::from_secs(300))
    }

    pub fn with_rotation(rotation_interval: Duration) -> Self {
        Self {
            current: RwLock::new(HashSet::new()),
            previous: RwLock::new(HashSet::new()),
            rotation_interval,
            last_rotation: RwLock::new(Instant::now()),
        }
    }

    /// Returns true if `item` was already seen in either window; otherwise
    /// records it and returns false.
    pub async fn check_and_insert(&self, item: &[u8]) -> bool {
        if self.current.read().await.contains(item) || self.previous.read().await.contains(item) {
            return true;
        }

        let should_rotate = {
            let last = self.last_rotation.read().await;
            last.elapsed() > self.rotation_interval
        };

        if should_rotate {
            let mut last = self.last_rotation.write().await;
            // Re-check after taking the write lock
            if last.elapsed() > self.rotation_interval {
                let mut previous = self.previous.write().await;
                let mut current = self.current.write().await;
                *previous = std::mem::take(&mut *current);
                *last = Instant::now();
            }
        }

        self.current.write().await.insert(item.to_vec());
        false
    }

    pub async fn clear(&self) {
        self.current.write().await.clear();
        self.previous.write().await.clear();
    }
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new()
    }
}
