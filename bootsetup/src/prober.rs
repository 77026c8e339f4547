// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Disk enumeration and OS probing

use std::{
    fs,
    path::{Path, PathBuf},
};

use topology::{DiskInfo, Invocation, PartitionInfo, System};

use crate::config::{device_name, human_size, BootCandidate, BootType, Disk, Partition};

/// Helpers recognizing the distribution mounted at a path
pub const DISTRO_PROBES: [&str; 2] = [
    "usr/lib64/os-probes/mounted/90linux-distro",
    "usr/lib/os-probes/mounted/90linux-distro",
];

pub const OS_PROBERS: [&str; 2] = ["usr/bin/os-prober", "usr/sbin/os-prober"];

/// os-prober caches labels here, stale ones leak into new runs
pub const LABEL_CACHE: &str = "var/lib/os-prober/labels";

/// Parse one `device:os:label:boot-type` line from os-prober
///
/// Lines not starting with a device, and EFI entries, are skipped.
pub fn parse_probe_line(line: &str, partitions: &[Partition]) -> Option<BootCandidate> {
    let line = line.trim();
    if !line.starts_with('/') {
        return None;
    }

    // anything after the boot type is ignored
    let fields = line.split(':').collect::<Vec<_>>();
    let device = device_name(fields.first()?);
    let os = *fields.get(1)?;
    let label = *fields.get(2)?;
    let boot_type = BootType::from(fields.get(3)?.trim());
    if boot_type == BootType::Efi {
        log::trace!("Skipping EFI entry for {device}");
        return None;
    }

    let filesystem = partitions
        .iter()
        .find(|p| p.device == device)
        .map(|p| p.filesystem.clone())
        .unwrap_or_default();
    Some(BootCandidate::new(device, filesystem, boot_type, os, label))
}

pub struct Prober<'a> {
    system: &'a dyn System,
    vfs: &'a Path,
}

impl<'a> Prober<'a> {
    pub fn new(system: &'a dyn System, vfs: &'a Path) -> Self {
        Self { system, vfs }
    }

    /// Every disk and partition, with human readable labels
    pub fn disks_and_partitions(&self) -> (Vec<Disk>, Vec<Partition>) {
        let names = match self.system.disks() {
            Ok(names) => names,
            Err(e) => {
                log::warn!("Cannot enumerate disks: {e}");
                return (vec![], vec![]);
            }
        };

        let mut disks = vec![];
        let mut partitions = vec![];
        for name in names {
            let info = self.system.disk_info(&name).unwrap_or_else(|e| {
                log::warn!("No details for {name}: {e}");
                DiskInfo::default()
            });
            disks.push(Disk {
                device: name.clone(),
                table: info.table,
                label: format!("{} ({})", info.model, human_size(info.size)),
            });

            for partition in self.system.partitions(&name).unwrap_or_default() {
                let info = self.system.partition_info(&partition).unwrap_or_else(|e| {
                    log::warn!("No details for {partition}: {e}");
                    PartitionInfo::default()
                });
                let label = if info.label.is_empty() {
                    partition.clone()
                } else {
                    info.label
                };
                partitions.push(Partition {
                    device: partition,
                    filesystem: info.filesystem,
                    label: format!("{label} ({})", human_size(info.size)),
                });
            }
        }
        (disks, partitions)
    }

    /// Installed operating systems, the running one first
    pub fn boot_candidates(&self, partitions: &[Partition], is_live: bool) -> Vec<BootCandidate> {
        let mut lines = vec![];
        if !is_live {
            lines.extend(self.probe_root(partitions));
        }

        match self.find(&OS_PROBERS) {
            Some(prober) => {
                let invocation = Invocation::exec(prober, Vec::<String>::new());
                match self.system.output(&invocation) {
                    Ok(output) => lines.extend(output),
                    Err(e) => log::warn!("os-prober failed: {e}"),
                }
            }
            None => log::warn!("os-prober is not installed"),
        }

        let candidates = lines
            .iter()
            .filter_map(|l| parse_probe_line(l, partitions))
            .collect::<Vec<_>>();
        log::debug!("Found {} boot candidates", candidates.len());
        candidates
    }

    /// os-prober skips the running system, ask the distro helper about `/`
    fn probe_root(&self, partitions: &[Partition]) -> Vec<String> {
        let Some(helper) = self.find(&DISTRO_PROBES) else {
            log::debug!("No linux-distro probe available");
            return vec![];
        };
        let Some(device) = self.system.root_device() else {
            log::warn!("Cannot determine the root device");
            return vec![];
        };

        let name = device_name(&device.to_string_lossy()).to_owned();
        let filesystem = partitions
            .iter()
            .find(|p| p.device == name)
            .map(|p| p.filesystem.clone())
            .or_else(|| self.system.partition_info(&name).ok().map(|i| i.filesystem))
            .unwrap_or_default();

        if let Err(e) = fs::remove_file(self.vfs.join(LABEL_CACHE)) {
            log::trace!("No label cache removed: {e}");
        }

        let invocation = Invocation::exec(
            helper,
            [device.to_string_lossy().to_string(), "/".to_owned(), filesystem],
        );
        self.system.output(&invocation).unwrap_or_else(|e| {
            log::warn!("Probing / failed: {e}");
            vec![]
        })
    }

    fn find(&self, candidates: &[&str]) -> Option<PathBuf> {
        candidates
            .iter()
            .map(|c| self.vfs.join(c))
            .find(|p| p.exists())
    }
}
