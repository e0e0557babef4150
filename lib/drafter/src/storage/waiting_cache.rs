// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Error, ErrorKind, Result};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitvec::vec::BitVec;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use super::{block_count, block_len, blocks_in_range, check_range, Storage};

/// Advisory hints emitted by a [`WaitingCache`] toward the migration
/// source. Expressed as a channel rather than a callback so the cache and
/// the protocol layer stay acyclic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheHint {
    /// A reader is stalled on this byte range; transfer it sooner.
    NeedAt { offset: u64, length: u32 },
    /// This byte range is no longer wanted (readahead cancelled, or
    /// locally overwritten).
    DontNeedAt { offset: u64, length: u32 },
}

struct CacheState {
    /// Arrival bit per block.
    present: BitVec,
    /// Blocks for which a NeedAt hint is already outstanding; cleared when
    /// the block arrives, so each absence episode hints at most once.
    hinted: BitVec,
    closed: bool,
}

/// Destination-side cache that gates reads on block arrival.
///
/// Remote payloads land via [`WaitingCache::present`]; readers of
/// not-yet-arrived blocks emit a [`CacheHint::NeedAt`] upstream and
/// suspend until the arrival bit is set (or the cache is closed).
pub struct WaitingCache {
    inner: Arc<dyn Storage>,
    block_size: u32,
    state: Mutex<CacheState>,
    /// Serializes mutations (remote `present` vs. local writes) so a
    /// residual remote copy can never interleave with, and clobber, a
    /// newer local write to the same block.
    write_serial: tokio::sync::Mutex<()>,
    arrived: Notify,
    hints: mpsc::UnboundedSender<CacheHint>,
}

impl WaitingCache {
    pub fn new(
        inner: Arc<dyn Storage>,
        block_size: u32,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CacheHint>) {
        let blocks = block_count(inner.size(), block_size) as usize;
        let (hints, hints_rx) = mpsc::unbounded_channel();
        let cache = Arc::new(Self {
            inner,
            block_size,
            state: Mutex::new(CacheState {
                present: BitVec::repeat(false, blocks),
                hinted: BitVec::repeat(false, blocks),
                closed: false,
            }),
            write_serial: tokio::sync::Mutex::new(()),
            arrived: Notify::new(),
            hints,
        });
        (cache, hints_rx)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u64 {
        block_count(self.inner.size(), self.block_size)
    }

    /// Whether every block has arrived.
    pub fn complete(&self) -> bool {
        self.state.lock().unwrap().present.all()
    }

    pub fn is_present(&self, block: u64) -> bool {
        self.state
            .lock()
            .unwrap()
            .present
            .get(block as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    /// Install remote data for `block` and wake any waiting readers.
    ///
    /// Idempotent: once a block is present, later copies are ignored, so a
    /// residual remote write can never clobber a newer local one.
    pub async fn present(&self, block: u64, data: &[u8]) -> Result<()> {
        let expected = block_len(self.inner.size(), self.block_size, block);
        if expected == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("block {block} out of range"),
            ));
        }
        if data.len() as u64 != expected {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "block {block} payload {} bytes, expected {expected}",
                    data.len()
                ),
            ));
        }
        let _serial = self.write_serial.lock().await;
        if self.is_present(block) {
            return Ok(());
        }
        self.inner.write_at(block * self.block_size as u64, data).await?;
        let mut state = self.state.lock().unwrap();
        state.present.set(block as usize, true);
        state.hinted.set(block as usize, false);
        drop(state);
        self.arrived.notify_waiters();
        Ok(())
    }

    /// Clear arrival bits for blocks the source reports as re-dirtied; a
    /// fresh copy is on its way.
    pub fn mark_dirty(&self, blocks: impl IntoIterator<Item = u64>) {
        let mut state = self.state.lock().unwrap();
        for block in blocks {
            let idx = block as usize;
            if idx < state.present.len() {
                state.present.set(idx, false);
                state.hinted.set(idx, false);
            }
        }
    }

    /// Forward a readahead-cancellation hint upstream.
    pub fn dont_need_at(&self, offset: u64, length: u32) {
        let _ = self.hints.send(CacheHint::DontNeedAt { offset, length });
    }

    /// Unblock all waiting readers with an error and refuse future waits.
    pub fn close_waiters(&self) {
        self.state.lock().unwrap().closed = true;
        self.arrived.notify_waiters();
    }

    /// Wait until every block covering the range has arrived, hinting
    /// upstream once per absent block.
    async fn wait_range(&self, offset: u64, len: u64) -> Result<()> {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            // Register for wakeups before inspecting the bitmap, so an
            // arrival between the check and the await is not lost.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                let mut missing = false;
                let mut unhinted = false;
                for block in blocks_in_range(offset, len, self.block_size) {
                    if !state.present[block as usize] {
                        missing = true;
                        if !state.hinted[block as usize] {
                            unhinted = true;
                            state.hinted.set(block as usize, true);
                        }
                    }
                }
                if !missing {
                    return Ok(());
                }
                if state.closed {
                    return Err(Error::new(
                        ErrorKind::Interrupted,
                        "waiting cache closed",
                    ));
                }
                if unhinted {
                    let _ = self.hints.send(CacheHint::NeedAt {
                        offset,
                        length: len as u32,
                    });
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Storage for WaitingCache {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.inner.size(), offset, buf.len())?;
        self.wait_range(offset, buf.len() as u64).await?;
        self.inner.read_at(offset, buf).await
    }

    /// A local write that fully covers a block supersedes the remote copy
    /// and marks it present; a partial write must wait for the block to
    /// arrive first (read-modify-write discipline).
    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(self.inner.size(), offset, buf.len())?;
        let size = self.inner.size();
        let bs = self.block_size as u64;

        let mut at = offset;
        let mut remaining = buf.len() as u64;
        let mut cursor = 0usize;
        while remaining > 0 {
            let block = at / bs;
            let within = at % bs;
            let span = remaining.min(bs - within);
            let covers_block =
                within == 0 && span == block_len(size, self.block_size, block);

            if !covers_block {
                self.wait_range(at, span).await?;
            }
            {
                let _serial = self.write_serial.lock().await;
                self.inner
                    .write_at(at, &buf[cursor..cursor + span as usize])
                    .await?;
                if covers_block {
                    let mut state = self.state.lock().unwrap();
                    state.present.set(block as usize, true);
                    state.hinted.set(block as usize, false);
                    drop(state);
                    self.arrived.notify_waiters();
                }
            }

            at += span;
            cursor += span as usize;
            remaining -= span;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn close(&self) -> Result<()> {
        self.close_waiters();
        self.inner.close().await
    }
}
