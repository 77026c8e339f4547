// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Builder API for constructing the Probe
//!
//! Every host path can be redirected, which is how the fixture trees in the
//! tests stand in for a real machine.

use std::{fs, path::PathBuf};

use crate::disk::probe::Probe;

/// Builder pattern for a Probe
#[derive(Debug, Clone)]
pub struct Builder {
    sysfs: PathBuf,
    devfs: PathBuf,
    procfs: PathBuf,
    live_marker: PathBuf,
}

/// Generate default builder, pointing at the running host
pub fn new() -> Builder {
    Builder {
        sysfs: "/sys".into(),
        devfs: "/dev".into(),
        procfs: "/proc".into(),
        live_marker: "/mnt/salt/tmp/distro_infos".into(),
    }
}

impl Default for Builder {
    fn default() -> Self {
        self::new()
    }
}

impl Builder {
    // sysfs directory
    pub fn with_sysfs(self, sysfs: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
            ..self
        }
    }

    /// devfs directory
    pub fn with_devfs(self, devfs: impl Into<PathBuf>) -> Self {
        Self {
            devfs: devfs.into(),
            ..self
        }
    }

    // procfs directory
    pub fn with_procfs(self, procfs: impl Into<PathBuf>) -> Self {
        Self {
            procfs: procfs.into(),
            ..self
        }
    }

    /// File whose presence denotes a live environment. Not required to exist.
    pub fn with_live_marker(self, live_marker: impl Into<PathBuf>) -> Self {
        Self {
            live_marker: live_marker.into(),
            ..self
        }
    }

    /// Return a newly built Probe
    /// Note: sysfs, devfs and procfs must exist
    pub fn build(self) -> Result<Probe, super::Error> {
        let result = Probe {
            sysfs: fs::canonicalize(&self.sysfs)?,
            devfs: fs::canonicalize(&self.devfs)?,
            procfs: fs::canonicalize(&self.procfs)?,
            live_marker: self.live_marker,
        };
        log::trace!("built probe: {result:?}");
        Ok(result)
    }
}
