// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the Drafter crates.
//!
//! This crate defines the closed set of migratable device names, the
//! package configuration document carried by the `config` device, and the
//! snapshot kinds understood by the hypervisor control interface, so that
//! the library, test doubles, and any front-ends can agree on them without
//! layering oddities.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The name of a migratable device belonging to one VM.
///
/// The set is closed: every migration session exchanges exactly these
/// devices (or a subset), and the wire protocol rejects anything else.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DeviceName {
    State,
    Memory,
    Disk,
    Initramfs,
    Kernel,
    Config,
}

impl DeviceName {
    /// All device names, in canonical transfer order.
    pub const ALL: [DeviceName; 6] = [
        DeviceName::State,
        DeviceName::Memory,
        DeviceName::Disk,
        DeviceName::Initramfs,
        DeviceName::Kernel,
        DeviceName::Config,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            DeviceName::State => "state",
            DeviceName::Memory => "memory",
            DeviceName::Disk => "disk",
            DeviceName::Initramfs => "initramfs",
            DeviceName::Kernel => "kernel",
            DeviceName::Config => "config",
        }
    }

    /// Canonical on-disk artifact name for this device in a packaged VM.
    pub const fn artifact_name(&self) -> &'static str {
        match self {
            DeviceName::State => "drafter.drftstate",
            DeviceName::Memory => "drafter.drftmemory",
            DeviceName::Disk => "drafter.drftdisk",
            DeviceName::Initramfs => "drafter.drftinitramfs",
            DeviceName::Kernel => "drafter.drftkernel",
            DeviceName::Config => "drafter.drftconfig",
        }
    }
}

impl Display for DeviceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("unknown device name \"{0}\"")]
pub struct UnknownDeviceName(pub String);

impl FromStr for DeviceName {
    type Err = UnknownDeviceName;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceName::ALL
            .iter()
            .find(|n| n.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownDeviceName(s.to_string()))
    }
}

/// The kind of snapshot requested from the hypervisor.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum SnapshotKind {
    /// Full CPU/device state plus a complete memory file.
    Full,
    /// Flush guest memory writes to the backing file without pausing.
    Msync,
    /// Flush guest memory and capture CPU/device state (used at suspend).
    MsyncAndState,
}

/// Configuration document stored on the `config` device as JSON.
///
/// Parsed by the destination before resume to discover the in-guest
/// agent's vsock endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfiguration {
    #[serde(rename = "agentVSockPort")]
    pub agent_vsock_port: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_name_round_trips_via_str() {
        for name in DeviceName::ALL {
            assert_eq!(name.as_str().parse::<DeviceName>().unwrap(), name);
        }
    }

    #[test]
    fn unknown_device_name_rejected() {
        assert!("floppy".parse::<DeviceName>().is_err());
        assert!("".parse::<DeviceName>().is_err());
    }

    #[test]
    fn artifact_names_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for name in DeviceName::ALL {
            assert!(seen.insert(name.artifact_name()));
        }
    }

    #[test]
    fn package_configuration_json() {
        let parsed: PackageConfiguration =
            serde_json::from_str(r#"{"agentVSockPort": 26}"#).unwrap();
        assert_eq!(parsed, PackageConfiguration { agent_vsock_port: 26 });
    }
}
