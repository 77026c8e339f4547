// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The configuration gathered for one bootsetup session
//!
//! [`Config`] owns everything probed from the host (disks, partitions, boot
//! candidates, ESPs) along with the user's current choices, and enforces the
//! invariants between them.

use std::fmt;

use serde::{Serialize, Serializer};
use topology::System;

use crate::{efi::EfiProbe, prober::Prober, Configuration, Error, LoaderKind};

/// Longest label the boot loaders accept
pub const LABEL_MAX: usize = 15;

/// A whole disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Disk {
    /// Kernel name, i.e. `sda`
    pub device: String,

    /// Partition table format, `msdos` or `gpt`
    pub table: String,

    /// Human readable `model (size)`
    pub label: String,
}

/// A partition, belonging to the disk whose name prefixes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    /// Kernel name without the `/dev/` prefix
    pub device: String,

    pub filesystem: String,

    /// Human readable `label (size)`
    pub label: String,
}

/// An EFI System Partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EspPartition {
    pub device: String,
    pub filesystem: String,
    pub label: String,
}

impl EspPartition {
    /// Complete an ESP device path with whatever we know of the partition
    pub fn lookup(device: &str, partitions: &[Partition]) -> Self {
        let device = device.strip_prefix("/dev/").unwrap_or(device);
        match partitions.iter().find(|p| p.device == device) {
            Some(p) => Self {
                device: p.device.clone(),
                filesystem: p.filesystem.clone(),
                label: p.label.clone(),
            },
            None => Self {
                device: device.to_owned(),
                filesystem: String::new(),
                label: String::new(),
            },
        }
    }
}

/// How a candidate gets booted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootType {
    /// Kernel + initrd loaded directly
    Linux,

    /// Hand over to the partition's own boot sector
    Chain,

    /// EFI application, never a BIOS candidate
    Efi,

    /// Anything else os-prober knows about (macosx, hurd..)
    Other(String),
}

impl From<&str> for BootType {
    fn from(value: &str) -> Self {
        match value {
            "linux" => BootType::Linux,
            "chain" => BootType::Chain,
            "efi" => BootType::Efi,
            other => BootType::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for BootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootType::Linux => f.write_str("linux"),
            BootType::Chain => f.write_str("chain"),
            BootType::Efi => f.write_str("efi"),
            BootType::Other(other) => f.write_str(other),
        }
    }
}

impl Serialize for BootType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A detected operating system that may get a boot menu entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootCandidate {
    /// Partition, without the `/dev/` prefix
    pub device: String,

    pub filesystem: String,

    pub boot_type: BootType,

    /// Long OS name from the prober
    pub os: String,

    /// Short label from the prober
    pub label: String,

    /// Accepted menu label. Candidates without one are left out of the menu.
    pub menu_label: Option<String>,
}

impl BootCandidate {
    pub fn new(
        device: impl Into<String>,
        filesystem: impl Into<String>,
        boot_type: BootType,
        os: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            filesystem: filesystem.into(),
            boot_type,
            os: os.into(),
            label: label.into(),
            menu_label: None,
        }
    }

    /// The prober label made palatable to boot loaders
    pub fn sanitized_label(&self) -> String {
        sanitize_label(&self.label)
    }
}

/// Boot loaders do not like spaces (or os-prober decorations) in labels
pub fn sanitize_label(label: &str) -> String {
    label
        .replace(' ', "_")
        .replace("_(loader)", "")
        .replace(['(', ')'], "")
}

/// Check a label is acceptable to every boot loader
pub fn validate_label(label: &str) -> Result<(), Error> {
    if label.is_empty() {
        Err(Error::InvalidLabel("a label cannot be empty".into()))
    } else if label.chars().any(char::is_whitespace) {
        Err(Error::InvalidLabel(format!("`{label}` contains spaces")))
    } else if label.chars().count() > LABEL_MAX {
        Err(Error::InvalidLabel(format!(
            "`{label}` is longer than {LABEL_MAX} characters"
        )))
    } else {
        Ok(())
    }
}

/// Firmware boot mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    Bios,
    Efi,
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootMode::Bios => f.write_str("bios"),
            BootMode::Efi => f.write_str("efi"),
        }
    }
}

/// Menu reordering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// Configuration aggregate for one installation session
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub disks: Vec<Disk>,
    pub partitions: Vec<Partition>,
    pub boot_candidates: Vec<BootCandidate>,

    /// The running firmware is EFI
    efi_firmware: bool,

    /// Known EFI System Partitions, sorted
    esp: Vec<EspPartition>,

    pub is_test: bool,
    pub is_live: bool,

    /// Partition passed in by the user, without `/dev/`
    pub target_partition: Option<String>,

    cur_boot_partition: Option<String>,
    cur_boot_mode: BootMode,
    cur_bootloader: Option<LoaderKind>,
    cur_mbr_device: Option<String>,
    cur_esp: Option<String>,
    secure_boot: bool,
}

/// Strip the `/dev/` prefix from a device
pub(crate) fn device_name(device: &str) -> &str {
    device.strip_prefix("/dev/").unwrap_or(device)
}

impl Config {
    /// Assemble a config from already probed parts, deriving every default
    pub fn from_parts(
        disks: Vec<Disk>,
        partitions: Vec<Partition>,
        boot_candidates: Vec<BootCandidate>,
        efi_firmware: bool,
        mut esp: Vec<EspPartition>,
    ) -> Self {
        esp.sort_by(|a, b| a.device.cmp(&b.device));
        let mut config = Self {
            disks,
            partitions,
            boot_candidates,
            efi_firmware,
            esp,
            is_test: false,
            is_live: false,
            target_partition: None,
            cur_boot_partition: None,
            cur_boot_mode: BootMode::Bios,
            cur_bootloader: None,
            cur_mbr_device: None,
            cur_esp: None,
            secure_boot: false,
        };
        config.assign_default_labels();
        config.set_boot_partition(None);
        if config.efi_available() {
            config.cur_boot_mode = BootMode::Efi;
            config.secure_boot = true;
        }
        config
    }

    /// Gather the current configuration from the host
    pub fn probe(system: &dyn System, configuration: &Configuration) -> Self {
        log::info!("Gathering current configuration");
        let prober = Prober::new(system, &configuration.vfs);
        let (disks, partitions) = prober.disks_and_partitions();

        let is_live = !configuration.test_mode && system.is_live();
        let boot_candidates = prober.boot_candidates(&partitions, is_live);

        let (efi_firmware, esp) = if configuration.efi_support {
            let efi = EfiProbe::new(system, &configuration.vfs);
            let esp = efi
                .find_efi_partitions()
                .iter()
                .map(|device| EspPartition::lookup(device, &partitions))
                .collect();
            (efi.has_efi_firmware(), esp)
        } else {
            log::debug!("EFI support disabled for this deployment");
            (false, vec![])
        };

        let mut config = Self::from_parts(disks, partitions, boot_candidates, efi_firmware, esp);
        config.is_test = configuration.test_mode;
        config.is_live = is_live;
        config.target_partition = configuration
            .target_partition
            .as_deref()
            .map(|t| device_name(t).to_owned());

        // os-prober cannot tell us about `/` in a live environment
        let root = config.target_partition.clone().or_else(|| {
            if is_live {
                None
            } else {
                system
                    .root_device()
                    .map(|d| device_name(&d.to_string_lossy()).to_owned())
            }
        });
        config.set_boot_partition(root);
        log::debug!("{config}");
        config
    }

    /// Pre-filled data for exercising the flow without touching the host
    pub fn test_data() -> Self {
        let disks = vec![
            Disk {
                device: "sda".into(),
                table: "msdos".into(),
                label: "WDC100 (100GB)".into(),
            },
            Disk {
                device: "sdb".into(),
                table: "gpt".into(),
                label: "SGT350 (350GB)".into(),
            },
        ];
        let partitions = [
            ("sda1", "ntfs", "WinVista (20GB)"),
            ("sda5", "ext2", "Salix (80GB)"),
            ("sdb1", "fat32", "Data (300GB)"),
            ("sdb2", "ext4", "Debian (50GB)"),
        ]
        .into_iter()
        .map(|(device, filesystem, label)| Partition {
            device: device.into(),
            filesystem: filesystem.into(),
            label: label.into(),
        })
        .collect();
        let candidates = vec![
            BootCandidate::new("sda5", "ext2", BootType::Linux, "Salix", "Salix 14.0"),
            BootCandidate::new("sda1", "ntfs", BootType::Chain, "Windows", "Vista"),
            BootCandidate::new("sdb2", "ext4", BootType::Linux, "Debian", "Debian 7"),
        ];
        let esp = vec![EspPartition {
            device: "sda2".into(),
            filesystem: "fat32".into(),
            label: "EFI System partition (100MB)".into(),
        }];
        let mut config = Self::from_parts(disks, partitions, candidates, true, esp);
        config.is_test = true;
        config
    }

    // Every candidate starts with its sanitized prober label, when acceptable
    fn assign_default_labels(&mut self) {
        let mut taken: Vec<String> = vec![];
        for candidate in self.boot_candidates.iter_mut() {
            let label = candidate.sanitized_label();
            candidate.menu_label = if validate_label(&label).is_ok() && !taken.contains(&label) {
                taken.push(label.clone());
                Some(label)
            } else {
                None
            };
        }
    }

    /// EFI installs require both firmware support and somewhere to install to
    pub fn efi_available(&self) -> bool {
        self.efi_firmware && !self.esp.is_empty()
    }

    pub fn have_esp(&self) -> bool {
        !self.esp.is_empty()
    }

    pub fn efi_firmware(&self) -> bool {
        self.efi_firmware
    }

    /// Known EFI System Partitions, sorted by device
    pub fn esp_partitions(&self) -> &[EspPartition] {
        &self.esp
    }

    /// The disk holding `partition`
    pub fn disk_of(&self, partition: &str) -> String {
        let partition = device_name(partition);
        let owner = self
            .disks
            .iter()
            .filter(|d| {
                partition.strip_prefix(d.device.as_str()).is_some_and(|rest| {
                    let rest = rest.strip_prefix('p').unwrap_or(rest);
                    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
                })
            })
            .max_by_key(|d| d.device.len());
        if let Some(disk) = owner {
            return disk.device.clone();
        }

        // Unknown disk, strip the partition number (and nvme style `p`)
        let stem = partition.trim_end_matches(|c: char| c.is_ascii_digit());
        match stem.strip_suffix('p') {
            Some(disk) if disk.ends_with(|c: char| c.is_ascii_digit()) => disk.to_owned(),
            _ => stem.to_owned(),
        }
    }

    pub fn cur_boot_partition(&self) -> Option<&str> {
        self.cur_boot_partition.as_deref()
    }

    pub fn cur_mbr_device(&self) -> Option<&str> {
        self.cur_mbr_device.as_deref()
    }

    pub fn cur_esp(&self) -> Option<&str> {
        self.cur_esp.as_deref()
    }

    pub fn cur_boot_mode(&self) -> BootMode {
        self.cur_boot_mode
    }

    pub fn cur_bootloader(&self) -> Option<LoaderKind> {
        self.cur_bootloader
    }

    /// Only ever true with EFI firmware and an ESP to install the shims to
    pub fn secure_boot(&self) -> bool {
        self.secure_boot && self.efi_available()
    }

    /// Choose the root/boot partition, deriving the MBR device and ESP from it
    pub fn set_boot_partition(&mut self, partition: Option<String>) {
        self.cur_boot_partition = partition.map(|p| device_name(&p).to_owned());
        self.cur_mbr_device = match self.cur_boot_partition.as_deref() {
            Some(partition) => Some(self.disk_of(partition)),
            None => self.disks.first().map(|d| d.device.clone()),
        };

        // Prefer the ESP living on the same disk
        let disk = self.cur_mbr_device.clone().unwrap_or_default();
        self.cur_esp = self
            .esp
            .iter()
            .find(|e| self.disk_of(&e.device) == disk)
            .or_else(|| self.esp.first())
            .map(|e| e.device.clone());
    }

    /// Override the disk receiving the first stage loader
    pub fn set_mbr_device(&mut self, disk: &str) -> Result<(), Error> {
        let disk = device_name(disk);
        if !self.disks.iter().any(|d| d.device == disk) {
            return Err(Error::NoMbrDevice);
        }
        self.cur_mbr_device = Some(disk.to_owned());
        Ok(())
    }

    pub fn set_esp(&mut self, esp: &str) -> Result<(), Error> {
        let esp = device_name(esp);
        if !self.esp.iter().any(|e| e.device == esp) {
            return Err(Error::UnknownEsp(esp.to_owned()));
        }
        self.cur_esp = Some(esp.to_owned());
        Ok(())
    }

    /// Switch boot mode. A bootloader from the other mode is deselected.
    pub fn set_boot_mode(&mut self, mode: BootMode) -> Result<(), Error> {
        if mode == BootMode::Efi && !self.efi_available() {
            return Err(Error::NoEsp);
        }
        self.cur_boot_mode = mode;
        if mode == BootMode::Bios {
            self.secure_boot = false;
        }
        if self.cur_bootloader.is_some_and(|l| l.mode() != mode) {
            self.cur_bootloader = None;
        }
        Ok(())
    }

    pub fn set_bootloader(&mut self, loader: LoaderKind) -> Result<(), Error> {
        if loader.mode() != self.cur_boot_mode {
            return Err(Error::UnsupportedMode {
                loader,
                mode: self.cur_boot_mode,
            });
        }
        self.cur_bootloader = Some(loader);
        Ok(())
    }

    /// Secure boot can only be enabled with EFI firmware and a known ESP
    pub fn set_secure_boot(&mut self, enabled: bool) -> Result<(), Error> {
        if enabled && !self.efi_available() {
            return Err(Error::SecureBootUnavailable);
        }
        self.secure_boot = enabled;
        Ok(())
    }

    /// Accept a menu label for the candidate at `index`
    pub fn set_label(&mut self, index: usize, label: &str) -> Result<(), Error> {
        validate_label(label)?;
        if index >= self.boot_candidates.len() {
            return Err(Error::InvalidLabel(format!("no boot entry at {index}")));
        }
        let duplicate = self
            .boot_candidates
            .iter()
            .enumerate()
            .any(|(i, c)| i != index && c.menu_label.as_deref() == Some(label));
        if duplicate {
            return Err(Error::InvalidLabel(format!(
                "`{label}` is already used by another entry"
            )));
        }
        self.boot_candidates[index].menu_label = Some(label.to_owned());
        Ok(())
    }

    /// Leave the candidate at `index` out of the menu
    pub fn clear_label(&mut self, index: usize) {
        if let Some(candidate) = self.boot_candidates.get_mut(index) {
            candidate.menu_label = None;
        }
    }

    /// Move a menu entry, returning its new position. Moves past either end are clamped.
    pub fn move_candidate(&mut self, index: usize, direction: Direction) -> usize {
        let len = self.boot_candidates.len();
        if index >= len {
            return len.saturating_sub(1);
        }
        let target = match direction {
            Direction::Up => index.saturating_sub(1),
            Direction::Down => (index + 1).min(len - 1),
        };
        self.boot_candidates.swap(index, target);
        target
    }

    /// Candidates making it into the boot menu, in menu order, with their label
    pub fn menu_entries(&self) -> impl Iterator<Item = (&BootCandidate, &str)> {
        self.boot_candidates
            .iter()
            .filter_map(|c| Some((c, c.menu_label.as_deref()?)))
    }
}

/// Human readable size, 1024 based
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if size.fract() < 0.05 {
        format!("{:.0}{}", size, UNITS[unit])
    } else {
        format!("{:.1}{}", size, UNITS[unit])
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "BootSetup Config")?;
        writeln!(f, "disks:")?;
        for d in &self.disks {
            writeln!(f, " - {} {} {}", d.device, d.table, d.label)?;
        }
        writeln!(f, "partitions:")?;
        for p in &self.partitions {
            writeln!(f, " - {} {} {}", p.device, p.filesystem, p.label)?;
        }
        writeln!(f, "possible boot partitions:")?;
        for c in &self.boot_candidates {
            writeln!(
                f,
                " - {} {} {} {} {} [{}]",
                c.device,
                c.filesystem,
                c.boot_type,
                c.os,
                c.label,
                c.menu_label.as_deref().unwrap_or("-")
            )?;
        }
        writeln!(f, "possible efi system partitions:")?;
        for e in &self.esp {
            writeln!(f, " - {} {} {}", e.device, e.filesystem, e.label)?;
        }
        let none = || "-".to_owned();
        writeln!(f, "target_partition: {}", self.target_partition.clone().unwrap_or_else(none))?;
        writeln!(f, "cur_boot_partition: {}", self.cur_boot_partition.clone().unwrap_or_else(none))?;
        writeln!(f, "cur_bootmode: {}", self.cur_boot_mode)?;
        writeln!(
            f,
            "cur_bootloader: {}",
            self.cur_bootloader.map(|l| l.to_string()).unwrap_or_else(none)
        )?;
        writeln!(f, "cur_mbr_device: {}", self.cur_mbr_device.clone().unwrap_or_else(none))?;
        writeln!(f, "cur_esp: {}", self.cur_esp.clone().unwrap_or_else(none))?;
        write!(f, "secure_boot: {}", self.secure_boot())
    }
}
