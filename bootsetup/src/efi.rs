// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! EFI firmware and EFI System Partition discovery

use std::{
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use gpt::{partition_types, GptConfig};
use topology::{RawDisk, System};

/// Adapts a [`RawDisk`] for the GPT reader
#[derive(Debug)]
struct GptDevice(Box<dyn RawDisk>);

impl Read for GptDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for GptDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Seek for GptDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

/// Kernel name of partition `number` on `disk`
pub fn partition_device(disk: &str, number: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("/dev/{disk}p{number}")
    } else {
        format!("/dev/{disk}{number}")
    }
}

/// Partition numbers with the ESP type GUID
fn esp_numbers(device: Box<dyn RawDisk>) -> io::Result<Vec<u32>> {
    let table = GptConfig::new()
        .initialized(true)
        .writable(false)
        .open_from_device(Box::new(GptDevice(device)))?;
    Ok(table
        .partitions()
        .iter()
        .filter(|(_, p)| p.part_type_guid == partition_types::EFI)
        .map(|(number, _)| *number)
        .collect())
}

pub struct EfiProbe<'a> {
    system: &'a dyn System,
    vfs: &'a Path,
}

impl<'a> EfiProbe<'a> {
    pub fn new(system: &'a dyn System, vfs: &'a Path) -> Self {
        Self { system, vfs }
    }

    /// Booted via EFI firmware
    pub fn has_efi_firmware(&self) -> bool {
        self.vfs.join("sys").join("firmware").join("efi").exists()
    }

    /// Every ESP on every disk, as sorted `/dev/...` paths
    ///
    /// Disks without a (readable) GPT simply contribute nothing.
    pub fn find_efi_partitions(&self) -> Vec<String> {
        let disks = match self.system.disks() {
            Ok(disks) => disks,
            Err(e) => {
                log::warn!("Cannot enumerate disks: {e}");
                return vec![];
            }
        };

        let mut found = disks
            .iter()
            .flat_map(|disk| {
                let numbers = self
                    .system
                    .open_disk(disk)
                    .map_err(|e| e.to_string())
                    .and_then(|device| esp_numbers(device).map_err(|e| e.to_string()));
                match numbers {
                    Ok(numbers) => numbers
                        .into_iter()
                        .map(|n| partition_device(disk, n))
                        .collect::<Vec<_>>(),
                    Err(e) => {
                        log::trace!("No GPT on {disk}: {e}");
                        vec![]
                    }
                }
            })
            .collect::<Vec<_>>();
        found.sort();
        log::debug!("EFI system partitions: {found:?}");
        found
    }
}
