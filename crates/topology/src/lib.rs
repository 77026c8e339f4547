// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Host topology queries
//!
//! Everything bootsetup needs to know about (or do to) the running host goes
//! through the [`System`] trait: which disks and partitions exist, what is
//! mounted where, mounting and unmounting, running helper commands and raw
//! read access to disks. [`disk::probe::Probe`] is the real implementation.

pub mod disk;

mod system;
pub use system::{DiskInfo, Invocation, MountRequest, PartitionInfo, RawDisk, System};
