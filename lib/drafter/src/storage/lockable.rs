// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Result;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};

use super::Storage;

/// A wrapper that can stall writes during guest suspension.
///
/// Readers are always admitted. `lock()` blocks new writers and waits for
/// in-flight writers to quiesce; `unlock()` releases. The migration engine
/// locks every device before the final drain so the residual dirty set is
/// consistent with the suspended guest.
pub struct Lockable {
    inner: Arc<dyn Storage>,
    gate: Arc<RwLock<()>>,
    held: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
}

impl Lockable {
    pub fn new(inner: Arc<dyn Storage>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: Arc::new(RwLock::new(())),
            held: Mutex::new(None),
        })
    }

    /// Stall new writers and wait for in-flight writers to finish.
    /// Idempotent; a second `lock()` while held is a no-op.
    pub async fn lock(&self) {
        let mut held = self.held.lock().await;
        if held.is_none() {
            *held = Some(self.gate.clone().write_owned().await);
        }
    }

    /// Re-admit writers. A no-op if not locked.
    pub async fn unlock(&self) {
        self.held.lock().await.take();
    }
}

#[async_trait]
impl Storage for Lockable {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_at(offset, buf).await
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let _permit = self.gate.read().await;
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
