// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::io::Result;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{block_count, blocks_in_range, Storage};

/// Records which blocks have been written since the last drain.
///
/// Indices are recorded before the write is delegated, so a write is
/// either returned by the drain whose swap it preceded or by the next one;
/// no write is dropped. Overlapping writes coalesce at block granularity.
pub struct DirtyTracker {
    inner: Arc<dyn Storage>,
    block_size: u32,
    dirty: Mutex<BTreeSet<u64>>,
}

impl DirtyTracker {
    pub fn new(inner: Arc<dyn Storage>, block_size: u32) -> Arc<Self> {
        Arc::new(Self { inner, block_size, dirty: Mutex::new(BTreeSet::new()) })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u64 {
        block_count(self.inner.size(), self.block_size)
    }

    /// Atomically take and reset the dirty set.
    pub fn drain(&self) -> BTreeSet<u64> {
        std::mem::take(&mut *self.dirty.lock().unwrap())
    }

    /// Number of currently-dirty blocks, without draining.
    pub fn dirty_len(&self) -> usize {
        self.dirty.lock().unwrap().len()
    }

    /// Mark blocks dirty without a backing write (used when re-arming the
    /// tracker after a failed transfer attempt).
    pub fn mark(&self, blocks: impl IntoIterator<Item = u64>) {
        self.dirty.lock().unwrap().extend(blocks);
    }
}

#[async_trait]
impl Storage for DirtyTracker {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_at(offset, buf).await
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        {
            let mut dirty = self.dirty.lock().unwrap();
            dirty.extend(blocks_in_range(offset, buf.len() as u64, self.block_size));
        }
        self.inner.write_at(offset, buf).await
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;

    fn tracker(name: &str, size: u64, block_size: u32) -> Arc<DirtyTracker> {
        let path = std::env::temp_dir().join(format!(
            "drafter-tracker-{}-{name}",
            std::process::id()
        ));
        DirtyTracker::new(FileStorage::create(path, size).unwrap(), block_size)
    }

    #[tokio::test]
    async fn writes_coalesce_per_block() {
        let tracker = tracker("coalesce", 4096 * 4, 4096);

        tracker.write_at(0, &[1u8; 10]).await.unwrap();
        tracker.write_at(100, &[2u8; 10]).await.unwrap();
        tracker.write_at(4096, &[3u8; 10]).await.unwrap();

        let drained = tracker.drain();
        assert_eq!(drained.into_iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn drain_resets() {
        let tracker = tracker("reset", 4096 * 4, 4096);
        tracker.write_at(0, &[1u8; 1]).await.unwrap();
        assert_eq!(tracker.drain().len(), 1);
        assert!(tracker.drain().is_empty());

        // A re-dirtied block shows up in the next drain.
        tracker.write_at(0, &[1u8; 1]).await.unwrap();
        assert_eq!(tracker.drain().len(), 1);
    }

    #[tokio::test]
    async fn spanning_write_marks_every_block() {
        let tracker = tracker("span", 4096 * 4, 4096);
        tracker.write_at(4000, &vec![0u8; 5000]).await.unwrap();
        let drained = tracker.drain();
        assert_eq!(drained.into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn mark_re_arms_without_a_write() {
        let tracker = tracker("mark", 4096 * 4, 4096);
        tracker.mark([2, 3]);
        assert_eq!(tracker.dirty_len(), 2);
        let drained = tracker.drain();
        assert_eq!(drained.into_iter().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn concurrent_writes_and_drains_lose_nothing() {
        let tracker = tracker("concurrent", 4096 * 64, 4096);

        let writer = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                for block in 0..64u64 {
                    tracker
                        .write_at(block * 4096, &[0xa5u8; 16])
                        .await
                        .unwrap();
                }
            })
        };

        let mut seen = BTreeSet::new();
        loop {
            seen.extend(tracker.drain());
            if writer.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        seen.extend(tracker.drain());

        assert_eq!(seen, (0..64u64).collect::<BTreeSet<_>>());
    }
}
