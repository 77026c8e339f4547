// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Processing of `/proc/self/mounts`, `/etc/mtab` & `/etc/fstab`

use std::{fs, io, path::Path};

/// Encapsulates one line of a mounts or fstab file, ignoring fstab specific 5&6 columns
#[derive(Debug)]
pub struct Mount<'a> {
    /// Path of device used for mounting (or a `UUID=` style source in fstab)
    pub device: &'a str,

    /// Where the device was (or will be) mounted
    pub mountpoint: &'a str,

    /// The filesystem name
    pub filesystem: &'a str,

    /// Raw mount options
    pub opts: &'a str,
}

impl Mount<'_> {
    /// Kernel escapes whitespace in mountpoints as octal (`\040`)
    pub fn unescaped_mountpoint(&self) -> String {
        self.mountpoint
            .replace("\\040", " ")
            .replace("\\011", "\t")
            .replace("\\134", "\\")
    }
}

/// Table for iterating mount points
#[derive(Debug, Default)]
pub struct Table {
    data: String,
}

impl Table {
    /// New Table parser for string
    ///
    /// Arguments:
    ///
    /// `data` - Some owned string
    pub fn new(data: String) -> Self {
        Self { data }
    }

    /// Iterate all mount points (no copy), skipping comments
    pub fn iter(&self) -> impl Iterator<Item = Mount> {
        self.data
            .lines()
            .map(str::trim)
            .filter(|l| !l.starts_with('#'))
            .filter_map(|i| {
                let mut splits = i.split_ascii_whitespace();
                Some(Mount {
                    device: splits.next()?,
                    mountpoint: splits.next()?,
                    filesystem: splits.next()?,
                    opts: splits.next().unwrap_or("defaults"),
                })
            })
    }

    /// Find the entry for the given mountpoint. Last entry wins, as with stacked mounts
    pub fn find_mountpoint(&self, mountpoint: &str) -> Option<Mount> {
        self.iter().filter(|m| m.unescaped_mountpoint() == mountpoint).last()
    }

    /// New Table parser for file
    ///
    /// Arguments:
    ///
    /// `path` - Path to load the table from (i.e. `/proc/self/mounts`)
    pub fn new_from_path(path: impl AsRef<Path>) -> Result<Self, io::Error> {
        Ok(Self::new(fs::read_to_string(path)?))
    }
}
