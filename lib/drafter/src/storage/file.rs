// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::{File, OpenOptions};
use std::io::Result;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::{check_range, Storage};

/// Storage backed by a pre-sized file, using positional I/O so concurrent
/// block transfers never contend on a shared cursor.
pub struct FileStorage {
    fp: File,
    size: u64,
}

impl FileStorage {
    /// Create (or truncate) the file at `path` and size it to `size` bytes.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Arc<Self>> {
        let fp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        fp.set_len(size)?;
        Ok(Arc::new(Self { fp, size }))
    }

    /// Adopt an existing file; the region size is the file's current length.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let fp = OpenOptions::new().read(true).write(true).open(path)?;
        let size = fp.metadata()?.len();
        Ok(Arc::new(Self { fp, size }))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.size, offset, buf.len())?;
        self.fp.read_exact_at(buf, offset)
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(self.size, offset, buf.len())?;
        self.fp.write_all_at(buf, offset)
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn flush(&self) -> Result<()> {
        self.fp.sync_data()
    }

    async fn close(&self) -> Result<()> {
        self.fp.sync_all()
    }
}
