// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The migration engine.
//!
//! One session per migration, either direction. The source side
//! ([`source::migrate_to`]) drives pre-copy, convergence, suspension, and
//! authority transfer for every device of a VM; the destination side
//! ([`destination::migrate_from`]) admits blocks into waiting caches,
//! exposes devices, and reports readiness for resume.

use std::path::Path;
use std::time::Duration;

use drafter_types::DeviceName;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod codec;
pub mod destination;
mod mux;
pub mod orderer;
pub mod source;

pub use codec::{EventKind, Message, ProtocolError};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MigrateRole {
    Source,
    Destination,
}

impl MigrateRole {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MigrateRole::Source => "source",
            MigrateRole::Destination => "destination",
        }
    }
}

/// Errors which may occur during the course of a migration.
///
/// A session surfaces exactly one of these; failures observed while
/// tearing down after a primary failure are folded into [`MigrateError::Aggregate`].
#[derive(Debug, Error)]
pub enum MigrateError {
    /// The transport closed before the session completed
    #[error("transport closed mid-migration")]
    TransportClosed,

    /// The peer violated the wire protocol
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer announced a device outside the closed name set
    #[error("received unknown device \"{0}\"")]
    UnknownDevice(String),

    /// Received a message out of order for the stream's state
    #[error("received unexpected migration message")]
    UnexpectedMessage,

    /// The `config` device does not hold a valid package configuration
    #[error("invalid package configuration: {0}")]
    Configuration(String),

    /// A storage provider failed
    #[error("storage I/O error: {0}")]
    Storage(#[from] std::io::Error),

    /// A hypervisor control call failed
    #[error("hypervisor RPC failed: {0}")]
    Hypervisor(String),

    /// The in-guest agent did not answer within the allowed time
    #[error("guest agent timed out after {0:?}")]
    AgentTimeout(Duration),

    /// The in-guest agent answered with an error
    #[error("guest agent failed: {0}")]
    Agent(String),

    /// The caller's cancellation token fired
    #[error("migration cancelled")]
    Cancelled,

    /// A device could not be exposed (e.g. NBD device exhaustion)
    #[error("could not expose device: {0}")]
    Exposer(String),

    /// The operation is not legal in the session's current state
    #[error("invalid migration state: {0}")]
    InvalidState(&'static str),

    /// An internal invariant did not hold; this is a bug
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A primary failure plus the sub-failures observed during teardown
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<MigrateError>),
}

fn format_aggregate(errors: &[MigrateError]) -> String {
    let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("migration failed: {}", parts.join("; "))
}

impl MigrateError {
    /// Fold a list of failures into a single terminal error.
    pub fn aggregate(mut errors: Vec<MigrateError>) -> Option<MigrateError> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(MigrateError::Aggregate(errors)),
        }
    }
}

/// Per-device migration phase, source side. Transitions are strictly
/// forward except into `Failed`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceState {
    Init,
    PreCopy,
    Draining,
    AuthorityTransfer,
    Final,
    Done,
    Failed,
}

impl DeviceState {
    /// Advance to `next`, enforcing forward-only transitions.
    pub fn advance(&mut self, next: DeviceState) -> Result<(), MigrateError> {
        if next != DeviceState::Failed && next <= *self {
            return Err(MigrateError::Invariant(format!(
                "device state may not move {:?} -> {:?}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }
}

/// Observer callbacks fired by the destination engine as the migration
/// progresses. All optional; `id` is the device's stream id.
#[derive(Default)]
pub struct MigrateFromHooks {
    pub on_device_received:
        Option<Box<dyn Fn(u32, DeviceName) + Send + Sync>>,
    pub on_device_exposed: Option<Box<dyn Fn(u32, &Path) + Send + Sync>>,
    pub on_device_authority_received: Option<Box<dyn Fn(u32) + Send + Sync>>,
    pub on_device_migration_completed: Option<Box<dyn Fn(u32) + Send + Sync>>,
    pub on_all_devices_received: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_all_migrations_completed: Option<Box<dyn Fn() + Send + Sync>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_is_forward_only() {
        let mut state = DeviceState::Init;
        state.advance(DeviceState::PreCopy).unwrap();
        state.advance(DeviceState::Draining).unwrap();
        assert!(state.advance(DeviceState::PreCopy).is_err());
        state.advance(DeviceState::AuthorityTransfer).unwrap();
        state.advance(DeviceState::Final).unwrap();
        state.advance(DeviceState::Done).unwrap();
    }

    #[test]
    fn any_state_may_fail() {
        let mut state = DeviceState::Done;
        state.advance(DeviceState::Failed).unwrap();
    }

    #[test]
    fn aggregate_folds_to_one_error() {
        assert!(MigrateError::aggregate(vec![]).is_none());

        let single =
            MigrateError::aggregate(vec![MigrateError::TransportClosed])
                .unwrap();
        assert!(matches!(single, MigrateError::TransportClosed));

        let multi = MigrateError::aggregate(vec![
            MigrateError::TransportClosed,
            MigrateError::Cancelled,
        ])
        .unwrap();
        let text = multi.to_string();
        assert!(text.contains("transport closed"));
        assert!(text.contains("cancelled"));
    }
}
