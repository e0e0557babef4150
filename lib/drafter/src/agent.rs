// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-guest agent interface.
//!
//! The agent runs inside the guest and is reached over vsock at the port
//! recorded in the package configuration. Both calls are idempotent; the
//! engine applies its own timeout around each and maps expiry to
//! `MigrateError::AgentTimeout`.

use async_trait::async_trait;

#[async_trait]
pub trait GuestAgent: Send + Sync + 'static {
    /// Let the guest quiesce (flush caches, pause clients) before the VM
    /// is suspended.
    async fn before_suspend(&self) -> anyhow::Result<()>;

    /// Let the guest re-establish state (clocks, connections) after the VM
    /// has resumed on the destination.
    async fn after_resume(&self) -> anyhow::Result<()>;
}
