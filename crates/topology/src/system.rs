// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The host abstraction consumed by bootsetup

use std::{
    fmt::{self, Debug, Display},
    io::{Read, Seek, Write},
    path::{Path, PathBuf},
};

use crate::disk::Error;

/// Raw block access, used for partition table parsing
pub trait RawDisk: Read + Write + Seek + Debug {}

impl<T: Read + Write + Seek + Debug> RawDisk for T {}

/// Whole-disk metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskInfo {
    /// Partition table format, `msdos` or `gpt` (empty when unknown)
    pub table: String,

    /// Vendor model string
    pub model: String,

    /// Size in bytes
    pub size: u64,
}

/// Partition metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Filesystem type as reported by blkid (empty when unknown)
    pub filesystem: String,

    /// Filesystem label
    pub label: String,

    /// Size in bytes
    pub size: u64,
}

/// A command to run on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Direct execution, no shell interpretation
    Exec { program: PathBuf, args: Vec<String> },

    /// Passed verbatim to `sh -c`
    Shell(String),
}

impl Invocation {
    pub fn exec<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Exec {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn shell(script: impl Into<String>) -> Self {
        Self::Shell(script.into())
    }

    /// Name of the program that will be executed
    pub fn program(&self) -> &Path {
        match self {
            Invocation::Exec { program, .. } => program,
            Invocation::Shell(_) => Path::new("sh"),
        }
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Exec { program, args } => {
                write!(f, "{}", program.display())?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
            Invocation::Shell(script) => f.write_str(script),
        }
    }
}

/// Parameters for a single mount operation
#[derive(Debug, Clone, Copy)]
pub struct MountRequest<'a> {
    /// Device (or directory, for bind mounts) to mount
    pub source: &'a Path,

    /// Existing directory to mount onto
    pub target: &'a Path,

    /// Explicit filesystem type, otherwise detected
    pub filesystem: Option<&'a str>,

    /// Bind mount `source` onto `target`
    pub bind: bool,
}

/// Everything bootsetup asks of the running system.
///
/// Device names are passed without the `/dev/` prefix for enumeration and
/// with it for mount operations, matching how they appear in mount tables.
pub trait System {
    /// Whole disks, sorted
    fn disks(&self) -> Result<Vec<String>, Error>;

    fn disk_info(&self, disk: &str) -> Result<DiskInfo, Error>;

    /// Partitions of the given disk, in partition number order
    fn partitions(&self, disk: &str) -> Result<Vec<String>, Error>;

    fn partition_info(&self, partition: &str) -> Result<PartitionInfo, Error>;

    /// Where the device is currently mounted, if anywhere
    fn mount_point(&self, device: &Path) -> Option<PathBuf>;

    /// Whether something is currently mounted on `path`
    fn is_mount_point(&self, path: &Path) -> bool;

    fn mount(&self, request: &MountRequest<'_>) -> Result<(), Error>;

    fn unmount(&self, target: &Path) -> Result<(), Error>;

    /// Run and capture stdout lines. A non-zero exit status is not an error.
    fn output(&self, invocation: &Invocation) -> Result<Vec<String>, Error>;

    /// Run and report success of the exit status
    fn call(&self, invocation: &Invocation) -> Result<bool, Error>;

    fn open_disk(&self, disk: &str) -> Result<Box<dyn RawDisk>, Error>;

    /// Running from a live environment
    fn is_live(&self) -> bool;

    /// The block device backing `/`, in `/dev/<name>` form
    fn root_device(&self) -> Option<PathBuf>;
}
