// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Error, ErrorKind, Result};
use std::sync::Arc;

use async_trait::async_trait;

use super::{check_range, Storage};

/// Storage striped across N equal shards.
///
/// Shard `i` covers bytes `[i * shard_size, (i + 1) * shard_size)`; the
/// final shard may be shorter. Each shard is produced by a caller-supplied
/// factory, so destinations can spread a large incoming device across many
/// files.
pub struct ShardedStorage {
    shards: Vec<Arc<dyn Storage>>,
    shard_size: u64,
    size: u64,
}

impl ShardedStorage {
    pub fn new<F>(size: u64, shard_size: u64, mut factory: F) -> Result<Arc<Self>>
    where
        F: FnMut(usize, u64) -> Result<Arc<dyn Storage>>,
    {
        if shard_size == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "zero shard size"));
        }
        let count = size.div_ceil(shard_size);
        let mut shards = Vec::with_capacity(count as usize);
        for index in 0..count {
            let len = (size - index * shard_size).min(shard_size);
            let shard = factory(index as usize, len)?;
            if shard.size() != len {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!(
                        "shard {index} has size {}, expected {len}",
                        shard.size()
                    ),
                ));
            }
            shards.push(shard);
        }
        Ok(Arc::new(Self { shards, shard_size, size }))
    }

    /// Visit each (shard, shard-relative offset, length) triple covering the
    /// byte range.
    fn spans(&self, offset: u64, len: usize) -> Vec<(usize, u64, usize)> {
        let mut spans = Vec::new();
        let mut at = offset;
        let mut remaining = len;
        while remaining > 0 {
            let shard = (at / self.shard_size) as usize;
            let within = at % self.shard_size;
            let take = remaining.min((self.shard_size - within) as usize);
            spans.push((shard, within, take));
            at += take as u64;
            remaining -= take;
        }
        spans
    }
}

#[async_trait]
impl Storage for ShardedStorage {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.size, offset, buf.len())?;
        let mut cursor = 0;
        for (shard, within, take) in self.spans(offset, buf.len()) {
            self.shards[shard]
                .read_at(within, &mut buf[cursor..cursor + take])
                .await?;
            cursor += take;
        }
        Ok(())
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(self.size, offset, buf.len())?;
        let mut cursor = 0;
        for (shard, within, take) in self.spans(offset, buf.len()) {
            self.shards[shard]
                .write_at(within, &buf[cursor..cursor + take])
                .await?;
            cursor += take;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn flush(&self) -> Result<()> {
        for shard in &self.shards {
            shard.flush().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for shard in &self.shards {
            shard.close().await?;
        }
        Ok(())
    }
}
