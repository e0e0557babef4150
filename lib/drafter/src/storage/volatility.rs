// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::io::Result;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{block_count, blocks_in_range, Storage};

/// Per-block history is capped so memory stays
/// O(total_blocks × average_writes_per_window) even for blocks rewritten
/// far faster than the window drains.
const MAX_SAMPLES_PER_BLOCK: usize = 64;

/// Tracks per-block write frequency over a sliding window.
///
/// `score()` is a relative measure used by the block orderer to send cold
/// blocks first; absolute units are not significant.
pub struct VolatilityMonitor {
    inner: Arc<dyn Storage>,
    block_size: u32,
    window: Duration,
    history: Mutex<Vec<VecDeque<Instant>>>,
}

impl VolatilityMonitor {
    pub fn new(
        inner: Arc<dyn Storage>,
        block_size: u32,
        window: Duration,
    ) -> Arc<Self> {
        let blocks = block_count(inner.size(), block_size) as usize;
        Arc::new(Self {
            inner,
            block_size,
            window,
            history: Mutex::new(vec![VecDeque::new(); blocks]),
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u64 {
        block_count(self.inner.size(), self.block_size)
    }

    /// Write count for `block` within the window.
    pub fn score(&self, block: u64) -> usize {
        let mut history = self.history.lock().unwrap();
        let Some(samples) = history.get_mut(block as usize) else {
            return 0;
        };
        Self::evict(samples, self.window);
        samples.len()
    }

    fn record(&self, offset: u64, len: u64) {
        let now = Instant::now();
        let mut history = self.history.lock().unwrap();
        for block in blocks_in_range(offset, len, self.block_size) {
            if let Some(samples) = history.get_mut(block as usize) {
                Self::evict(samples, self.window);
                if samples.len() == MAX_SAMPLES_PER_BLOCK {
                    samples.pop_front();
                }
                samples.push_back(now);
            }
        }
    }

    fn evict(samples: &mut VecDeque<Instant>, window: Duration) {
        let now = Instant::now();
        while let Some(oldest) = samples.front() {
            if now.duration_since(*oldest) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl Storage for VolatilityMonitor {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_at(offset, buf).await
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.record(offset, buf.len() as u64);
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
