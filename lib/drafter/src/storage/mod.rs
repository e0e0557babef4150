// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block-addressed storage providers.
//!
//! Every migrated device sits on top of a [`Storage`] implementation: a
//! byte-addressable region of known size partitioned into fixed-size
//! blocks. Offsets and lengths need not be block-aligned; implementations
//! read-modify-write internally where their backing requires it. The
//! region's `size()` is a hard boundary: access past it fails with
//! `InvalidInput`.
//!
//! The wrappers in this module compose: a typical source-side device is
//! `FileStorage` → `Metrics` → `DirtyTracker` → `VolatilityMonitor` →
//! `Lockable`, with the top of the stack exposed to the guest.

use std::io::{Error, ErrorKind, Result};
use std::ops::Range;

use async_trait::async_trait;

mod file;
pub use file::FileStorage;

mod sharded;
pub use sharded::ShardedStorage;

mod lockable;
pub use lockable::Lockable;

mod metrics;
pub use metrics::{Metrics, MetricsSnapshot};

mod tracking;
pub use tracking::DirtyTracker;

mod volatility;
pub use volatility::VolatilityMonitor;

mod waiting_cache;
pub use waiting_cache::{CacheHint, WaitingCache};

/// A block-addressed storage provider.
///
/// Implementations are shared (`Arc`) between the guest-facing exposure
/// path and the migration engine, so all operations take `&self`.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Read `buf.len()` bytes starting at `offset`.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` starting at `offset`.
    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Total size of the region in bytes.
    fn size(&self) -> u64;

    /// Flush buffered writes to stable storage.
    async fn flush(&self) -> Result<()>;

    /// Release the provider. Implementations flush first; the provider is
    /// not usable afterwards.
    async fn close(&self) -> Result<()>;
}

/// Number of blocks covering a region of `size` bytes. The final block may
/// be partial.
pub fn block_count(size: u64, block_size: u32) -> u64 {
    size.div_ceil(block_size as u64)
}

/// Block indices touched by the byte range `[offset, offset + len)`.
pub fn blocks_in_range(offset: u64, len: u64, block_size: u32) -> Range<u64> {
    if len == 0 {
        let b = offset / block_size as u64;
        return b..b;
    }
    let start = offset / block_size as u64;
    let end = (offset + len - 1) / block_size as u64 + 1;
    start..end
}

/// Byte length of block `index` within a region of `size` bytes (short for
/// a partial final block).
pub fn block_len(size: u64, block_size: u32, index: u64) -> u64 {
    let start = index * block_size as u64;
    size.saturating_sub(start).min(block_size as u64)
}

pub(crate) fn check_range(size: u64, offset: u64, len: usize) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "range overflow"))?;
    if end > size {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("access [{offset}, {end}) past region size {size}"),
        ));
    }
    Ok(())
}
