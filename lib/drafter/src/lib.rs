// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drafter: a live-migration engine for micro-VM block devices.
//!
//! A VM's backing artifacts (`state`, `memory`, `disk`, `initramfs`,
//! `kernel`, `config`) are modeled as block-addressed storage providers
//! ([`storage::Storage`]). The source side wraps each device in a dirty
//! tracker and volatility monitor, streams blocks to a peer in
//! priority/coldest-first order while the guest keeps running, converges on
//! the dirty set, suspends the guest, ships the residual, and hands
//! authority over. The destination gates reads on block arrival
//! ([`storage::WaitingCache`]) so the VM can resume before the transfer has
//! fully completed.
//!
//! The hypervisor, in-guest agent, and NBD exposure mechanism are external
//! collaborators behind the [`vmm::VmControl`], [`agent::GuestAgent`], and
//! [`expose::VolumeExposer`] traits.

pub mod agent;
pub mod expose;
pub mod migrate;
pub mod storage;
pub mod vmm;

pub use drafter_types::{
    DeviceName, PackageConfiguration, SnapshotKind, UnknownDeviceName,
};

pub use migrate::destination::{
    migrate_from, DeviceLayout, MigrateFromOptions, MigratedPeer,
};
pub use migrate::source::{migrate_to, MigrateToOptions, SourceDevice};
pub use migrate::{MigrateError, MigrateFromHooks, MigrateRole};
