// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Disk probe/query APIs

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    process::Command,
};

use nix::{
    mount::{mount, umount, MsFlags},
    sys::stat,
};

use super::mounts::Table;
use crate::{DiskInfo, Invocation, MountRequest, PartitionInfo, RawDisk, System};

const BLKID: &str = "/sbin/blkid";

/// A Disk probe to query disks
#[derive(Debug)]
pub struct Probe {
    /// location of /sys
    pub(super) sysfs: PathBuf,

    /// location of /dev
    pub(super) devfs: PathBuf,

    /// location of /proc
    pub(super) procfs: PathBuf,

    /// Present only when booted from live media
    pub(super) live_marker: PathBuf,
}

impl Probe {
    /// Fresh copy of the mount table. Never cached, we change it ourselves.
    pub fn mounts(&self) -> Result<Table, super::Error> {
        Ok(Table::new_from_path(self.procfs.join("self").join("mounts"))?)
    }

    /// Map a `/dev/...` path into our devfs
    fn host_path(&self, device: &Path) -> PathBuf {
        match device.strip_prefix("/dev") {
            Ok(relative) => self.devfs.join(relative),
            Err(_) => device.to_path_buf(),
        }
    }

    /// Resolve symlinks (`/dev/disk/by-uuid/..` etc) back into `/dev/<kernel name>`
    pub fn canonical_device(&self, device: &Path) -> PathBuf {
        if let Ok(real) = fs::canonicalize(self.host_path(device)) {
            if let Ok(relative) = real.strip_prefix(&self.devfs) {
                return Path::new("/dev").join(relative);
            }
        }
        device.to_path_buf()
    }

    /// Query a single blkid tag, empty when unknown
    fn blkid(&self, args: &[&str], device: &Path) -> String {
        let invocation = Invocation::exec(
            BLKID,
            args.iter()
                .map(|a| a.to_string())
                .chain(Some(self.host_path(device).to_string_lossy().to_string())),
        );
        self.output(&invocation)
            .ok()
            .and_then(|lines| lines.into_iter().find(|l| !l.is_empty()))
            .unwrap_or_default()
    }

    /// Size in bytes from the sysfs sector count
    fn size(&self, name: &str) -> u64 {
        fs::read_to_string(self.sysfs.join("class").join("block").join(name).join("size"))
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|sectors| sectors * 512)
            .unwrap_or_default()
    }

    fn command(invocation: &Invocation) -> Command {
        match invocation {
            Invocation::Exec { program, args } => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            Invocation::Shell(script) => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(script);
                command
            }
        }
    }

    // Look up the device mounted at `/`
    fn root_device_by_mountpoint(&self) -> Option<PathBuf> {
        let table = self.mounts().ok()?;
        let mount = table.find_mountpoint("/")?;
        // rootfs, overlay, tmpfs.. nothing we can boot from
        let device = Path::new(mount.device);
        if !device.starts_with("/dev") || !self.host_path(device).exists() {
            return None;
        }
        Some(self.canonical_device(device))
    }

    /// Legacy approach to determination of block device by stat
    fn root_device_by_stat(&self) -> Option<PathBuf> {
        let st = stat::stat("/").ok()?;
        let major = stat::major(st.st_dev);
        let minor = stat::minor(st.st_dev);
        let node = fs::canonicalize(self.sysfs.join("dev").join("block").join(format!("{major}:{minor}"))).ok()?;
        Some(Path::new("/dev").join(node.file_name()?))
    }
}

impl System for Probe {
    fn disks(&self) -> Result<Vec<String>, super::Error> {
        // Only devices backed by hardware, skips loop/ram/dm nodes
        let mut disks = fs::read_dir(self.sysfs.join("block"))?
            .filter_map(Result::ok)
            .filter(|e| e.path().join("device").exists())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        disks.sort();
        Ok(disks)
    }

    fn disk_info(&self, disk: &str) -> Result<DiskInfo, super::Error> {
        let node = self.sysfs.join("block").join(disk);
        if !node.exists() {
            return Err(super::Error::UnknownDevice(disk.to_owned()));
        }
        let device = Path::new("/dev").join(disk);
        let table = match self.blkid(&["-p", "-s", "PTTYPE", "-o", "value"], &device).as_str() {
            "dos" => "msdos".to_owned(),
            other => other.to_owned(),
        };
        let model = fs::read_to_string(node.join("device").join("model"))
            .map(|m| m.trim().to_owned())
            .unwrap_or_default();
        Ok(DiskInfo {
            table,
            model,
            size: self.size(disk),
        })
    }

    fn partitions(&self, disk: &str) -> Result<Vec<String>, super::Error> {
        let node = self.sysfs.join("block").join(disk);
        if !node.exists() {
            return Err(super::Error::UnknownDevice(disk.to_owned()));
        }
        let mut partitions = fs::read_dir(&node)?
            .filter_map(Result::ok)
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                let number = fs::read_to_string(e.path().join("partition"))
                    .ok()?
                    .trim()
                    .parse::<u32>()
                    .ok()?;
                name.starts_with(disk).then_some((number, name))
            })
            .collect::<Vec<_>>();
        partitions.sort();
        Ok(partitions.into_iter().map(|(_, name)| name).collect())
    }

    fn partition_info(&self, partition: &str) -> Result<PartitionInfo, super::Error> {
        let device = Path::new("/dev").join(partition);
        if !self.host_path(&device).exists() {
            return Err(super::Error::UnknownDevice(partition.to_owned()));
        }
        Ok(PartitionInfo {
            filesystem: self.blkid(&["-s", "TYPE", "-o", "value"], &device),
            label: self.blkid(&["-s", "LABEL", "-o", "value"], &device),
            size: self.size(partition),
        })
    }

    fn mount_point(&self, device: &Path) -> Option<PathBuf> {
        let wanted = self.canonical_device(device);
        let table = self.mounts().ok()?;
        let point = table
            .iter()
            .filter(|m| m.device.starts_with('/'))
            .find(|m| self.canonical_device(Path::new(m.device)) == wanted)
            .map(|m| PathBuf::from(m.unescaped_mountpoint()));
        point
    }

    fn is_mount_point(&self, path: &Path) -> bool {
        let Ok(table) = self.mounts() else {
            return false;
        };
        let mounted = table.iter().any(|m| Path::new(&m.unescaped_mountpoint()) == path);
        mounted
    }

    fn mount(&self, request: &MountRequest<'_>) -> Result<(), super::Error> {
        let (flags, filesystem) = if request.bind {
            (MsFlags::MS_BIND, None)
        } else {
            let filesystem = match request.filesystem {
                Some(fs) => fs.to_owned(),
                None => self.blkid(&["-s", "TYPE", "-o", "value"], request.source),
            };
            if filesystem.is_empty() {
                return Err(super::Error::UnknownFilesystem(request.source.to_path_buf()));
            }
            (MsFlags::MS_MGC_VAL, Some(filesystem))
        };
        let options: Option<&str> = None;
        mount(
            Some(request.source),
            request.target,
            filesystem.as_deref(),
            flags,
            options,
        )?;
        log::info!(
            "Mounted {} at {} ({})",
            request.source.display(),
            request.target.display(),
            filesystem.as_deref().unwrap_or("bind")
        );
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), super::Error> {
        umount(target)?;
        log::info!("Unmounted {}", target.display());
        Ok(())
    }

    fn output(&self, invocation: &Invocation) -> Result<Vec<String>, super::Error> {
        log::trace!("running: {invocation}");
        let output = Self::command(invocation)
            .output()
            .map_err(|source| super::Error::Spawn {
                command: invocation.to_string(),
                source,
            })?;
        if !output.status.success() {
            log::debug!("`{invocation}` exited with {}", output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim_end().to_owned())
            .collect())
    }

    fn call(&self, invocation: &Invocation) -> Result<bool, super::Error> {
        log::trace!("running: {invocation}");
        let status = Self::command(invocation)
            .status()
            .map_err(|source| super::Error::Spawn {
                command: invocation.to_string(),
                source,
            })?;
        Ok(status.success())
    }

    fn open_disk(&self, disk: &str) -> Result<Box<dyn RawDisk>, super::Error> {
        Ok(Box::new(File::open(self.devfs.join(disk))?))
    }

    fn is_live(&self) -> bool {
        self.live_marker.exists()
    }

    fn root_device(&self) -> Option<PathBuf> {
        self.root_device_by_mountpoint()
            .or_else(|| self.root_device_by_stat())
    }
}
