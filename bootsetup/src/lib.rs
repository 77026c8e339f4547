// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Boot loader configuration and installation
//!
//! Probes the host for installed operating systems and EFI System Partitions,
//! synthesizes the configuration for one of the supported boot loaders and
//! installs it, keeping every mount it makes scoped to the operation.

use std::path::PathBuf;

use thiserror::Error;

pub mod bootloader;
pub use bootloader::{Bootloader, LoaderKind, SupportsEfiInstall};

pub mod config;
pub use config::{BootCandidate, BootMode, BootType, Config, Direction, Disk, EspPartition, Partition};

mod efi;
pub use efi::EfiProbe;

pub mod file_utils;
pub mod framebuffer;
pub mod kernel;

mod install;
pub use install::{Mounted, Phase, Plan, Session};

pub mod mounts;
pub use mounts::{MountBroker, MountHandle};

pub mod prober;

#[cfg(test)]
pub(crate) mod testing;

/// Re-export the topology APIs
pub use topology::{Invocation, System};

/// Core error type for bootsetup
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot mount {0}")]
    CannotMount(String),

    #[error("no boot partition selected")]
    NoBootPartition,

    #[error("no EFI system partition selected")]
    NoEsp,

    #[error("no MBR device selected")]
    NoMbrDevice,

    #[error("no bootloader selected")]
    NoBootloader,

    #[error("{loader} cannot be used in {mode} mode")]
    UnsupportedMode { loader: LoaderKind, mode: BootMode },

    #[error("`{command}` failed")]
    LoaderInstall { command: String },

    #[error("invalid label: {0}")]
    InvalidLabel(String),

    #[error("secure boot requires EFI firmware and an EFI system partition")]
    SecureBootUnavailable,

    #[error("unknown EFI system partition: {0}")]
    UnknownEsp(String),

    #[error("missing file: {0}")]
    MissingFile(PathBuf),

    #[error("no configuration generated at {0}")]
    MissingConfiguration(PathBuf),

    #[error("failed to interact with filesystem properly")]
    InvalidFilesystem,

    #[error("c stdlib: {0}")]
    C(#[from] nix::errno::Errno),

    #[error("generic i/o error")]
    IO(#[from] std::io::Error),

    #[error("topology: {0}")]
    Topology(#[from] topology::disk::Error),

    #[error("glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Core configuration for one bootsetup session
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Where we can find `sys` and the OS probe helpers
    pub vfs: PathBuf,

    /// Log installer commands instead of running them
    pub test_mode: bool,

    /// EFI and secure boot paths enabled for this deployment
    pub efi_support: bool,

    /// Partition the user asked to install for (`/dev/` prefix optional)
    pub target_partition: Option<String>,

    /// Secure boot shims (`PreLoader.efi` & co)
    pub share_dir: PathBuf,

    /// Boot loader EFI binaries
    pub loader_dir: PathBuf,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            vfs: "/".into(),
            test_mode: false,
            efi_support: true,
            target_partition: None,
            share_dir: "/usr/share/bootsetup".into(),
            loader_dir: "/boot".into(),
        }
    }
}
