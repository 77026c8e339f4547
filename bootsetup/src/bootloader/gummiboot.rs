// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! gummiboot management
//!
//! Configuration is a `loader.conf` plus one entry file per kernel, staged
//! under `loader/` and copied to the same place on the ESP.

use std::{
    fs::{self, create_dir_all},
    path::{Path, PathBuf},
};

use super::{collect_sections, efi_image_path, efi_images, linux_devices, Section, SupportsEfiInstall};
use crate::{
    file_utils::{join_insensitive_all, sync_vfat, PathExt},
    install::{Phase, Plan, Session},
    Config, Error,
};

const GUMMIBOOT_BINARY: &str = "gummibootx64.efi";

/// Seconds the menu waits
const TIMEOUT: u32 = 5;

/// Generate `loader.conf`, defaulting to the first entry
pub(crate) fn loader_conf(sections: &[Section]) -> String {
    let default = sections.iter().find_map(|s| match s {
        Section::Linux { pair, .. } => Some(pair.label.as_str()),
        Section::Chain { .. } => None,
    });
    match default {
        Some(label) => format!("default {label}\ntimeout {TIMEOUT}\n"),
        None => format!("timeout {TIMEOUT}\n"),
    }
}

/// Generate a usable loader entry, or nothing for sections gummiboot cannot boot
pub(crate) fn generate_entry(section: &Section) -> Option<(String, String)> {
    let Section::Linux {
        filesystem, root, pair, ..
    } = section
    else {
        return None;
    };
    let initrd = pair
        .initrd_name()
        .map(|name| format!("initrd {}\n", efi_image_path(&pair.label, name)))
        .unwrap_or_default();
    let fstype = if filesystem == "ext4" { " rootfstype=ext4" } else { "" };
    let entry = format!(
        r###"title {label}
linux {linux}
{initrd}options root={root} ro{fstype}
"###,
        label = pair.label,
        linux = efi_image_path(&pair.label, pair.kernel_name()),
    );
    Some((format!("{}.conf", pair.label), entry))
}

/// gummiboot specific bootloader behaviours
pub struct Loader<'a> {
    session: Session<'a>,
}

impl<'a> Loader<'a> {
    pub(super) fn new(session: Session<'a>) -> Self {
        Self { session }
    }

    fn staged_root(&self) -> PathBuf {
        self.session.staging_path().join("loader")
    }

    pub fn configuration_path(&self) -> PathBuf {
        self.staged_root().join("loader.conf")
    }

    pub(super) fn create_configuration(&self, config: &Config) -> Result<(), Error> {
        let esp = self.esp(config)?;
        let plan = Plan::new(esp).with_dependents(linux_devices(config));
        self.session.attempt(&plan, |mounted| {
            let sections = collect_sections(self.session.system(), config, mounted, false);

            self.session.phase(Phase::WriteOrCopyConfig);
            let entries = self.staged_root().join("entries");
            if entries.exists() {
                fs::remove_dir_all(&entries)?;
            }
            create_dir_all(&entries)?;
            for (name, entry) in sections.iter().filter_map(generate_entry) {
                fs::write(entries.join(name), entry)?;
            }
            fs::write(self.configuration_path(), loader_conf(&sections))?;
            log::info!("Generated gummiboot configuration with {} entries", sections.len());
            Ok(())
        })
    }

    /// Staged `(source, dest)` pairs for the ESP `loader/` directory
    fn staged_files(&self, esp_root: &Path) -> Result<Vec<(PathBuf, PathBuf)>, Error> {
        let loader = esp_root.to_path_buf().join_insensitive("loader");
        let mut files = vec![(self.configuration_path(), loader.join_insensitive("loader.conf"))];

        let mut entries = fs::read_dir(self.staged_root().join("entries"))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect::<Vec<_>>();
        entries.sort();
        let dest = loader.join_insensitive("entries");
        files.extend(entries.into_iter().filter_map(|p| {
            let name = p.file_name()?.to_owned();
            Some((p, dest.join(name)))
        }));
        Ok(files)
    }

    pub(super) fn install(&self, config: &Config) -> Result<(), Error> {
        let esp = self.esp(config)?;
        let plan = Plan::new(esp).with_dependents(linux_devices(config));

        self.session.attempt(&plan, |mounted| {
            let esp_root = mounted.primary();
            let sections = collect_sections(self.session.system(), config, mounted, false);

            self.session.phase(Phase::WriteOrCopyConfig);
            self.install_boot_files(config, esp_root)?;
            sync_vfat(&efi_images(&sections, esp_root))?;
            let copied = sync_vfat(&self.staged_files(esp_root)?)?;
            log::info!(
                "Updated {copied} loader files in {}",
                join_insensitive_all(esp_root, "loader").display()
            );
            Ok(())
        })
    }
}

impl SupportsEfiInstall for Loader<'_> {
    fn session(&self) -> &Session<'_> {
        &self.session
    }

    fn efi_binary(&self, _: &Path) -> PathBuf {
        self.session.configuration().loader_dir.join(GUMMIBOOT_BINARY)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use super::{generate_entry, loader_conf};
    use crate::{
        bootloader::{Bootloader, Section},
        kernel::KernelInitrdPair,
        testing::FakeSystem,
        BootCandidate, BootType, Config, Configuration, Disk, EspPartition, LoaderKind, Partition,
    };

    fn linux(label: &str, filesystem: &str, initrd: Option<&str>) -> Section {
        Section::Linux {
            filesystem: filesystem.into(),
            root: "/dev/disk/by-uuid/0a1b-2c3d".into(),
            mount_point: PathBuf::from("/mnt"),
            pair: KernelInitrdPair {
                kernel: PathBuf::from("/boot/vmlinuz-6.1"),
                initrd: initrd.map(PathBuf::from),
                label: label.into(),
            },
        }
    }

    #[test]
    fn entries() {
        let (name, entry) = generate_entry(&linux("Salix-1", "ext4", Some("/boot/initrd-6.1.gz"))).unwrap();
        assert_eq!(name, "Salix-1.conf");
        assert_eq!(
            entry,
            "title Salix-1\nlinux /EFI/Linux/Salix-1/vmlinuz-6.1\ninitrd /EFI/Linux/Salix-1/initrd-6.1.gz\n\
             options root=/dev/disk/by-uuid/0a1b-2c3d ro rootfstype=ext4\n"
        );

        let (_, entry) = generate_entry(&linux("Salix-2", "ext2", None)).unwrap();
        assert_eq!(
            entry,
            "title Salix-2\nlinux /EFI/Linux/Salix-2/vmlinuz-6.1\noptions root=/dev/disk/by-uuid/0a1b-2c3d ro\n"
        );

        let chain = Section::Chain {
            device: "/dev/sda1".into(),
            label: "Windows".into(),
        };
        assert!(generate_entry(&chain).is_none());
        assert_eq!(loader_conf(&[chain.clone()]), "timeout 5\n");
        assert_eq!(
            loader_conf(&[chain, linux("Salix-2", "ext2", None)]),
            "default Salix-2\ntimeout 5\n"
        );
    }

    #[test]
    fn install_layout() {
        let system = FakeSystem::new()
            .with_file("/dev/sda5", "boot/vmlinuz", "salix kernel")
            .with_file("/dev/sdb2", "boot/vmlinuz-3.2.0", "debian kernel")
            .with_file("/dev/sdb2", "boot/initrd.img-3.2.0", "debian initrd")
            .with_file("/dev/sda2", "loader/entries/custom.conf", "title mine\n");
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("gummibootx64.efi"), "gummiboot").unwrap();
        let configuration = Configuration {
            loader_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut config = Config::test_data();
        config.set_boot_partition(Some("sda5".into()));
        config.set_secure_boot(false).unwrap();
        config.set_bootloader(LoaderKind::Gummiboot).unwrap();

        let loader = Bootloader::new(LoaderKind::Gummiboot, &system, &configuration).unwrap();
        loader.create_configuration(&config).unwrap();
        let staged = loader.configuration_path().unwrap();
        assert_eq!(fs::read_to_string(&staged).unwrap(), "default Salix_14.0\ntimeout 5\n");
        loader.install(&config).unwrap();

        let esp = system.snapshot("/dev/sda2");
        assert_eq!(esp["EFI/Boot/bootx64.efi"], "gummiboot");
        assert_eq!(esp["EFI/Linux/Debian_7/initrd.img-3.2.0"], "debian initrd");
        assert_eq!(esp["loader/loader.conf"], "default Salix_14.0\ntimeout 5\n");
        assert_eq!(
            esp["loader/entries/Debian_7.conf"],
            "title Debian_7\nlinux /EFI/Linux/Debian_7/vmlinuz-3.2.0\n\
             initrd /EFI/Linux/Debian_7/initrd.img-3.2.0\noptions root=/dev/sdb2 ro rootfstype=ext4\n"
        );
        assert!(esp.contains_key("loader/entries/Salix_14.0.conf"));
        // entries we did not write are left alone
        assert_eq!(esp["loader/entries/custom.conf"], "title mine\n");
        assert!(system.mounted_points().is_empty());
    }

    #[test]
    fn kernels_of_similar_systems() {
        let system = FakeSystem::new()
            .with_file("/dev/sda5", "boot/vmlinuz-1", "a1")
            .with_file("/dev/sda5", "boot/vmlinuz-2", "a2")
            .with_file("/dev/sdb2", "boot/vmlinuz-1", "b1")
            .with_file("/dev/sdb2", "boot/vmlinuz-2", "b2");
        let configuration = Configuration::default();
        let disks = ["sda", "sdb"]
            .map(|device| Disk {
                device: device.into(),
                table: "gpt".into(),
                label: String::new(),
            })
            .to_vec();
        let partitions = [("sda2", "vfat"), ("sda5", "ext4"), ("sdb2", "ext4")]
            .map(|(device, filesystem)| Partition {
                device: device.into(),
                filesystem: filesystem.into(),
                label: String::new(),
            })
            .to_vec();
        let candidates = vec![
            BootCandidate::new("sda5", "ext4", BootType::Linux, "Distribution", "Distribution A"),
            BootCandidate::new("sdb2", "ext4", BootType::Linux, "Distribution", "Distribution B"),
        ];
        let esp = vec![EspPartition::lookup("/dev/sda2", &partitions)];
        let mut config = Config::from_parts(disks, partitions, candidates, true, esp);
        config.set_boot_partition(Some("sda5".into()));
        config.set_bootloader(LoaderKind::Gummiboot).unwrap();

        let loader = Bootloader::new(LoaderKind::Gummiboot, &system, &configuration).unwrap();
        loader.create_configuration(&config).unwrap();
        let entries = loader.configuration_path().unwrap().with_file_name("entries");
        let mut names = fs::read_dir(&entries)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(
            names,
            vec![
                "Distribution_-1.conf",
                "Distribution_-2.conf",
                "Distribution__2.conf",
                "Distribution__3.conf",
            ]
        );
        let renamed = fs::read_to_string(entries.join("Distribution__2.conf")).unwrap();
        assert!(renamed.contains("linux /EFI/Linux/Distribution__2/vmlinuz-1\n"));
        assert!(renamed.contains("root=/dev/sdb2"));
    }
}
