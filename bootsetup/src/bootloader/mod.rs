// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Bootloader APIs

use std::{
    fmt,
    fs::create_dir_all,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Serialize;
use topology::System;

use crate::{
    config::LABEL_MAX,
    file_utils::{sync_vfat, PathExt},
    install::{Mounted, Session},
    kernel::{self, KernelInitrdPair},
    BootMode, BootType, Config, Configuration, Error,
};

pub mod elilo;
pub mod grub2;
pub mod grub2_efi;
pub mod gummiboot;
pub mod lilo;

/// Supported boot loaders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoaderKind {
    Lilo,
    Grub2,
    Grub2Efi,
    Elilo,
    Gummiboot,
}

impl LoaderKind {
    pub const ALL: [LoaderKind; 5] = [
        LoaderKind::Lilo,
        LoaderKind::Grub2,
        LoaderKind::Grub2Efi,
        LoaderKind::Elilo,
        LoaderKind::Gummiboot,
    ];

    /// The firmware mode this loader boots in
    pub fn mode(&self) -> BootMode {
        match self {
            LoaderKind::Lilo | LoaderKind::Grub2 => BootMode::Bios,
            LoaderKind::Grub2Efi | LoaderKind::Elilo | LoaderKind::Gummiboot => BootMode::Efi,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LoaderKind::Lilo => "lilo",
            LoaderKind::Grub2 => "grub2",
            LoaderKind::Grub2Efi => "grub2-efi",
            LoaderKind::Elilo => "elilo",
            LoaderKind::Gummiboot => "gummiboot",
        }
    }
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LoaderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| format!("unknown bootloader `{s}`"))
    }
}

/// A configured boot menu entry
#[derive(Debug, Clone)]
pub(crate) enum Section {
    /// Chain load the boot sector of `device`
    Chain { device: String, label: String },

    /// One kernel of a Linux partition
    Linux {
        filesystem: String,
        /// Reference for `root=`
        root: String,
        mount_point: PathBuf,
        pair: KernelInitrdPair,
    },
}

impl Section {
    /// Kernel + initrd as `(source on the mounted partition, file name)`
    fn images(&self) -> Vec<(PathBuf, &str)> {
        match self {
            Section::Chain { .. } => vec![],
            Section::Linux { mount_point, pair, .. } => {
                let mut images = vec![(on_partition(mount_point, &pair.kernel), pair.kernel_name())];
                if let (Some(initrd), Some(name)) = (pair.initrd.as_ref(), pair.initrd_name()) {
                    images.push((on_partition(mount_point, initrd), name));
                }
                images
            }
        }
    }
}

/// `path` (absolute within the partition) as seen through its mount point
pub(crate) fn on_partition(mount_point: &Path, path: &Path) -> PathBuf {
    mount_point.join(path.strip_prefix("/").unwrap_or(path))
}

/// Partitions whose kernels end up in the menu
pub(crate) fn linux_devices(config: &Config) -> Vec<String> {
    let mut devices: Vec<String> = vec![];
    for (candidate, _) in config.menu_entries() {
        if candidate.boot_type == BootType::Linux && !devices.contains(&candidate.device) {
            devices.push(candidate.device.clone());
        }
    }
    devices
}

/// `label`, or the first `label_N` variant not in `taken`, within [`LABEL_MAX`]
pub(crate) fn unique_label(label: &str, taken: &[String]) -> String {
    if !taken.iter().any(|t| t == label) {
        return label.to_owned();
    }
    let mut ordinal = 2;
    loop {
        let suffix = format!("_{ordinal}");
        let base = label
            .chars()
            .take(LABEL_MAX.saturating_sub(suffix.len()))
            .collect::<String>();
        let candidate = format!("{base}{suffix}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        ordinal += 1;
    }
}

/// Build the menu sections, in menu order. Unsupported entries are skipped.
///
/// Labels are unique across the whole menu: kernels of different partitions
/// may truncate to the same `-N` label, later ones get renamed.
pub(crate) fn collect_sections(system: &dyn System, config: &Config, mounted: &Mounted, chain: bool) -> Vec<Section> {
    let mut sections = vec![];
    let mut taken: Vec<String> = vec![];
    let mut claim = |label: &str| {
        let unique = unique_label(label, &taken);
        if unique != label {
            log::warn!("Label {label} is already in use, using {unique}");
        }
        taken.push(unique.clone());
        unique
    };

    for (candidate, label) in config.menu_entries() {
        match &candidate.boot_type {
            BootType::Chain if chain => sections.push(Section::Chain {
                device: format!("/dev/{}", candidate.device),
                label: claim(label),
            }),
            BootType::Linux => {
                let Some(mount_point) = mounted.dependent(&candidate.device) else {
                    log::warn!("{} is not mounted, skipping", candidate.device);
                    continue;
                };
                let pairs = kernel::discover(mount_point, label).unwrap_or_else(|e| {
                    log::warn!("Cannot search {} for kernels: {e}", candidate.device);
                    vec![]
                });
                if pairs.is_empty() {
                    log::warn!("No kernel found on {}", candidate.device);
                }
                let root = kernel::root_reference(system, &candidate.device);
                for mut pair in pairs {
                    pair.label = claim(&pair.label);
                    sections.push(Section::Linux {
                        filesystem: candidate.filesystem.clone(),
                        root: root.clone(),
                        mount_point: mount_point.to_path_buf(),
                        pair,
                    });
                }
            }
            other => log::warn!("The boot type {other} is not supported, skipping {}", candidate.device),
        }
    }
    sections
}

/// Copy pairs placing every section's images into `EFI/Linux/<label>/`
pub(crate) fn efi_images(sections: &[Section], esp_root: &Path) -> Vec<(PathBuf, PathBuf)> {
    let linux = esp_root.to_path_buf().join_insensitive("EFI").join_insensitive("Linux");
    sections
        .iter()
        .flat_map(|section| {
            let dir = match section {
                Section::Linux { pair, .. } => linux.join(&pair.label),
                Section::Chain { .. } => linux.clone(),
            };
            section
                .images()
                .into_iter()
                .map(move |(source, name)| (source, dir.join(name)))
        })
        .collect()
}

/// `/EFI/Linux/<label>/<file>` as the firmware sees it
pub(crate) fn efi_image_path(label: &str, file: &str) -> String {
    format!("/EFI/Linux/{label}/{file}")
}

/// Capability shared by loaders installing onto an EFI System Partition
pub trait SupportsEfiInstall {
    fn session(&self) -> &Session<'_>;

    /// Loader binary to boot, given where the ESP is mounted
    fn efi_binary(&self, esp_root: &Path) -> PathBuf;

    /// The ESP chosen for this install
    fn esp(&self, config: &Config) -> Result<String, Error> {
        config.cur_esp().map(str::to_owned).ok_or(Error::NoEsp)
    }

    /// `(source, dest)` pairs for the loader and, under secure boot, the shims
    ///
    /// Secure boot boots `PreLoader.efi` as `bootx64.efi`, which in turn
    /// starts the loader as `loader.efi`.
    fn efi_boot_files(&self, config: &Config, esp_root: &Path) -> Vec<(PathBuf, PathBuf)> {
        let configuration: &Configuration = self.session().configuration();
        let boot = esp_root.to_path_buf().join_insensitive("EFI").join_insensitive("Boot");
        let binary = self.efi_binary(esp_root);
        if !config.secure_boot() {
            return vec![(binary, boot.join_insensitive("bootx64.efi"))];
        }

        let share = &configuration.share_dir;
        vec![
            (binary, boot.join_insensitive("loader.efi")),
            (share.join("PreLoader.efi"), boot.join_insensitive("bootx64.efi")),
            (share.join("HashTool.efi"), boot.join_insensitive("HashTool.efi")),
            (share.join("KeyTool.efi"), boot.join_insensitive("KeyTool.efi")),
            (share.join("shellx64.efi"), boot.join_insensitive("shellx64.efi")),
        ]
    }

    /// Lay out `EFI/Boot` and `EFI/Linux` and copy the boot files in
    fn install_boot_files(&self, config: &Config, esp_root: &Path) -> Result<(), Error> {
        let efi = esp_root.to_path_buf().join_insensitive("EFI");
        for dir in ["Boot", "Linux"] {
            create_dir_all(efi.join_insensitive(dir))?;
        }
        let files = self.efi_boot_files(config, esp_root);
        sync_vfat(&files)?;
        Ok(())
    }
}

/// A boot loader bound to one installation session
pub enum Bootloader<'a> {
    Lilo(Box<lilo::Loader<'a>>),
    Grub2(Box<grub2::Loader<'a>>),
    Grub2Efi(Box<grub2_efi::Loader<'a>>),
    Elilo(Box<elilo::Loader<'a>>),
    Gummiboot(Box<gummiboot::Loader<'a>>),
}

impl<'a> Bootloader<'a> {
    /// Construct the manager for `kind`, with its own staging session
    pub fn new(kind: LoaderKind, system: &'a dyn System, configuration: &'a Configuration) -> Result<Self, Error> {
        let session = Session::new(system, configuration, kind)?;
        Ok(match kind {
            LoaderKind::Lilo => Bootloader::Lilo(Box::new(lilo::Loader::new(session))),
            LoaderKind::Grub2 => Bootloader::Grub2(Box::new(grub2::Loader::new(session))),
            LoaderKind::Grub2Efi => Bootloader::Grub2Efi(Box::new(grub2_efi::Loader::new(session))),
            LoaderKind::Elilo => Bootloader::Elilo(Box::new(elilo::Loader::new(session))),
            LoaderKind::Gummiboot => Bootloader::Gummiboot(Box::new(gummiboot::Loader::new(session))),
        })
    }

    pub fn kind(&self) -> LoaderKind {
        match self {
            Bootloader::Lilo(_) => LoaderKind::Lilo,
            Bootloader::Grub2(_) => LoaderKind::Grub2,
            Bootloader::Grub2Efi(_) => LoaderKind::Grub2Efi,
            Bootloader::Elilo(_) => LoaderKind::Elilo,
            Bootloader::Gummiboot(_) => LoaderKind::Gummiboot,
        }
    }

    /// Generated configuration, for review or editing before install
    pub fn configuration_path(&self) -> Option<PathBuf> {
        match self {
            Bootloader::Lilo(l) => Some(l.configuration_path()),
            Bootloader::Grub2(_) | Bootloader::Grub2Efi(_) => None,
            Bootloader::Elilo(l) => Some(l.configuration_path()),
            Bootloader::Gummiboot(l) => Some(l.configuration_path()),
        }
    }

    /// Synthesize the configuration into the staging area
    pub fn create_configuration(&self, config: &Config) -> Result<(), Error> {
        check_mode(self.kind(), config)?;
        match self {
            Bootloader::Lilo(l) => l.create_configuration(config),
            Bootloader::Grub2(_) | Bootloader::Grub2Efi(_) => {
                log::debug!("{} generates its own menu at install", self.kind());
                Ok(())
            }
            Bootloader::Elilo(l) => l.create_configuration(config),
            Bootloader::Gummiboot(l) => l.create_configuration(config),
        }
    }

    /// Install the (previously created) configuration and the loader itself
    pub fn install(&self, config: &Config) -> Result<(), Error> {
        check_mode(self.kind(), config)?;
        if let Some(path) = self.configuration_path() {
            if !path.exists() {
                return Err(Error::MissingConfiguration(path));
            }
        }
        match self {
            Bootloader::Lilo(l) => l.install(config),
            Bootloader::Grub2(l) => l.install(config),
            Bootloader::Grub2Efi(l) => l.install(config),
            Bootloader::Elilo(l) => l.install(config),
            Bootloader::Gummiboot(l) => l.install(config),
        }
    }
}

fn check_mode(kind: LoaderKind, config: &Config) -> Result<(), Error> {
    if kind.mode() != config.cur_boot_mode() {
        return Err(Error::UnsupportedMode {
            loader: kind,
            mode: config.cur_boot_mode(),
        });
    }
    Ok(())
}
