// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hypervisor control interface.
//!
//! The hypervisor process lifecycle (spawn, chroot, socket plumbing) lives
//! outside this crate; the migration engine consumes only this contract,
//! typically backed by the hypervisor's snapshot API over a local UNIX
//! socket.

use async_trait::async_trait;
use drafter_types::SnapshotKind;

#[async_trait]
pub trait VmControl: Send + Sync + 'static {
    /// Resume a VM from the named state and memory snapshot files.
    async fn resume_snapshot(
        &self,
        state_name: &str,
        memory_name: &str,
    ) -> anyhow::Result<()>;

    /// Create a snapshot of the given kind. `Msync` flushes guest memory
    /// writes to the backing file without pausing the guest; the engine
    /// issues it between drains so dirty sets reflect settled state.
    async fn create_snapshot(
        &self,
        state_name: &str,
        memory_name: &str,
        kind: SnapshotKind,
    ) -> anyhow::Result<()>;

    /// Pause guest execution. Issued once per migration, after every
    /// device's writes have been stalled.
    async fn suspend(&self) -> anyhow::Result<()>;
}
