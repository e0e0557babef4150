// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block-device exposure interface.
//!
//! On the destination, every received device is surfaced to the guest
//! kernel as a block device (in production via NBD). Exposed devices are
//! process-wide named resources; the engine shuts each one down on every
//! teardown path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use drafter_types::DeviceName;

use crate::storage::Storage;

/// A device currently exposed to the guest.
#[async_trait]
pub trait ExposedVolume: Send + Sync + 'static {
    /// The device node path handed to the hypervisor (e.g. `/dev/nbd3`).
    fn path(&self) -> &Path;

    /// Release the device. Must be safe to call more than once.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait VolumeExposer: Send + Sync + 'static {
    /// Expose `storage` as a block device with the given device-side block
    /// size. Failure here maps to resource exhaustion (e.g. no free NBD
    /// slots).
    async fn expose(
        &self,
        name: DeviceName,
        storage: Arc<dyn Storage>,
        block_size: u32,
    ) -> anyhow::Result<Box<dyn ExposedVolume>>;
}

/// An exposer for tests and non-NBD deployments: records the exposure and
/// reports a synthetic device path.
pub struct NullExposer;

struct NullVolume {
    path: PathBuf,
}

#[async_trait]
impl ExposedVolume for NullVolume {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl VolumeExposer for NullExposer {
    async fn expose(
        &self,
        name: DeviceName,
        _storage: Arc<dyn Storage>,
        _block_size: u32,
    ) -> anyhow::Result<Box<dyn ExposedVolume>> {
        Ok(Box::new(NullVolume {
            path: PathBuf::from(format!("/dev/null-{name}")),
        }))
    }
}
