// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Scoped mounting of boot candidates
//!
//! The [`MountBroker`] never unmounts something it did not mount itself, and
//! never touches `/`.

use std::{
    fs::{self, create_dir_all},
    path::{Path, PathBuf},
};

use topology::{disk::mounts::Table, MountRequest, System};

use crate::Error;

/// A mounted device, as handed out by the [`MountBroker`]
#[derive(Debug)]
pub struct MountHandle {
    /// `/dev/...` path of the device
    pub device: PathBuf,

    /// Where the device can be accessed
    pub point: PathBuf,

    /// We mounted it, so we unmount it
    owned: bool,

    /// We created the mount point directory
    created: bool,

    /// Extra mounts made below `point`, in mount order
    nested: Vec<MountHandle>,
}

impl MountHandle {
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn nested(&self) -> &[MountHandle] {
        &self.nested
    }
}

/// Turn `sda1` or `/dev/sda1` into `/dev/sda1`
pub fn device_path(device: &str) -> PathBuf {
    if device.starts_with('/') {
        PathBuf::from(device)
    } else {
        Path::new("/dev").join(device)
    }
}

/// Resolve an fstab source (`UUID=`, `LABEL=`, `PARTUUID=`) into a device path
pub fn fstab_source(source: &str) -> PathBuf {
    let tags = [
        ("UUID=", "by-uuid"),
        ("LABEL=", "by-label"),
        ("PARTUUID=", "by-partuuid"),
        ("PARTLABEL=", "by-partlabel"),
    ];
    for (tag, dir) in tags {
        if let Some(value) = source.strip_prefix(tag) {
            return Path::new("/dev/disk").join(dir).join(value.trim_matches('"'));
        }
    }
    PathBuf::from(source)
}

/// Mounts devices below a session owned directory
pub struct MountBroker<'a> {
    system: &'a dyn System,
    mount_root: PathBuf,
}

impl<'a> MountBroker<'a> {
    pub fn new(system: &'a dyn System, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            system,
            mount_root: mount_root.into(),
        }
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Make `device` accessible, mounting it if needed
    pub fn ensure_mounted(&self, device: &str) -> Result<MountHandle, Error> {
        let device = device_path(device);
        let mut handle = match self.system.mount_point(&device) {
            Some(point) => {
                log::debug!("{} already mounted at {}", device.display(), point.display());
                MountHandle {
                    device,
                    point,
                    owned: false,
                    created: false,
                    nested: vec![],
                }
            }
            None => self.mount_fresh(device)?,
        };

        if handle.point != Path::new("/") {
            if let Some(boot) = self.mount_nested_boot(&handle.point) {
                handle.nested.push(boot);
            }
        }
        Ok(handle)
    }

    fn mount_fresh(&self, device: PathBuf) -> Result<MountHandle, Error> {
        let name = device
            .file_name()
            .ok_or_else(|| Error::CannotMount(device.display().to_string()))?;
        let point = self.mount_root.join(name);
        self.mount_at(device, point, None, false)
    }

    fn mount_at(
        &self,
        device: PathBuf,
        point: PathBuf,
        filesystem: Option<&str>,
        bind: bool,
    ) -> Result<MountHandle, Error> {
        let created = !point.exists();
        if created {
            create_dir_all(&point).map_err(|e| {
                log::error!("Cannot create {}: {e}", point.display());
                Error::CannotMount(device.display().to_string())
            })?;
        }

        let request = MountRequest {
            source: &device,
            target: &point,
            filesystem,
            bind,
        };
        if let Err(e) = self.system.mount(&request) {
            log::error!("Failed to mount {}: {e}", device.display());
            if created {
                let _ = fs::remove_dir(&point);
            }
            return Err(Error::CannotMount(device.display().to_string()));
        }

        Ok(MountHandle {
            device,
            point,
            owned: true,
            created,
            nested: vec![],
        })
    }

    /// Best effort mount of a separate `/boot` listed in the target's fstab
    fn mount_nested_boot(&self, point: &Path) -> Option<MountHandle> {
        let table = Table::new_from_path(point.join("etc").join("fstab")).ok()?;
        let entry = table.find_mountpoint("/boot")?;
        let boot = point.join("boot");
        if self.system.is_mount_point(&boot) {
            log::trace!("{} is already mounted", boot.display());
            return None;
        }

        let device = fstab_source(entry.device);
        let filesystem = match entry.filesystem {
            "auto" | "" => None,
            other => Some(other),
        };
        match self.mount_at(device, boot, filesystem, false) {
            Ok(handle) => {
                log::debug!("Mounted separate /boot below {}", point.display());
                Some(handle)
            }
            Err(e) => {
                log::warn!("Skipping /boot of {}: {e}", point.display());
                None
            }
        }
    }

    /// Bind mount a host directory (`/dev`, `/proc`, `/sys`) into `root`
    pub fn bind(&self, source: &Path, root: &Path) -> Result<MountHandle, Error> {
        let relative = source.strip_prefix("/").unwrap_or(source);
        self.mount_at(source.to_path_buf(), root.join(relative), None, true)
    }

    /// Undo whatever [`Self::ensure_mounted`] or [`Self::bind`] did, nested mounts first
    pub fn release(&self, handle: MountHandle) {
        let MountHandle {
            device,
            point,
            owned,
            created,
            nested,
        } = handle;

        for child in nested.into_iter().rev() {
            self.release(child);
        }

        if !owned {
            return;
        }
        if point == Path::new("/") {
            log::warn!("Refusing to unmount /");
            return;
        }

        match self.system.unmount(&point) {
            Ok(()) => {
                log::trace!("Released {} from {}", device.display(), point.display());
                if created {
                    let _ = fs::remove_dir(&point);
                }
            }
            Err(e) => log::error!("Failed to umount {}: {e}", point.display()),
        }
    }
}
