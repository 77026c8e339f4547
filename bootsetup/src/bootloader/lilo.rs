// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! LILO, the chain loading BIOS loader

use std::{
    fs::{self, create_dir_all},
    path::PathBuf,
};

use topology::Invocation;

use super::{collect_sections, linux_devices, on_partition, Section};
use crate::{
    framebuffer::{self, VideoMode},
    install::{Phase, Plan, Session},
    Config, Error,
};

const LILO: &str = "/sbin/lilo";

/// Global section, `boot` and `vga` filled in per install
const GLOBAL: &str = r#"# LILO configuration file
# Generated by BootSetup
#
# Install with "lilo -v -C /etc/bootsetup/lilo.conf", with every
# partition referenced below mounted where this file expects it.
append = "vt.default_utf8=1 "
boot = "{boot}"
lba32
compact

# Bitmap menu, 640x480x8
bitmap = /boot/salix.bmp
bmp-colors = 255,20,255,20,255,20
bmp-table = 60,6,1,16
bmp-timer = 65,29,0,255

prompt
# tenths of a second
timeout = 50
change-rules
reset

vga = {vga}
# End LILO global section
"#;

/// Render a complete lilo.conf
pub(crate) fn render(mbr_device: &str, vga: &VideoMode, sections: &[Section]) -> String {
    let mut out = GLOBAL
        .replace("{boot}", &format!("/dev/{mbr_device}"))
        .replace("{vga}", &vga.to_string());
    for section in sections {
        let text = match section {
            Section::Chain { device, label } => {
                format!("\n# {label} chain section\n  other = {device}\n  label = {label}\n")
            }
            Section::Linux {
                filesystem,
                root,
                mount_point,
                pair,
            } => {
                let initrd = pair
                    .initrd
                    .as_ref()
                    .map(|initrd| format!("  initrd = {}\n", on_partition(mount_point, initrd).display()))
                    .unwrap_or_default();
                let append = if filesystem == "ext4" {
                    "  append = \"rootfstype=ext4 \"\n"
                } else {
                    ""
                };
                format!(
                    r###"
# {label} Linux section
  image = {image}
  root = {root}
{initrd}{append}  read-only
  label = {label}
"###,
                    label = pair.label,
                    image = on_partition(mount_point, &pair.kernel).display(),
                )
            }
        };
        out.push_str(&text);
    }
    out
}

/// LILO specific bootloader behaviours
pub struct Loader<'a> {
    session: Session<'a>,
}

impl<'a> Loader<'a> {
    pub(super) fn new(session: Session<'a>) -> Self {
        Self { session }
    }

    pub fn configuration_path(&self) -> PathBuf {
        self.session.staging_path().join("lilo.conf")
    }

    pub(super) fn create_configuration(&self, config: &Config) -> Result<(), Error> {
        let mbr = config.cur_mbr_device().ok_or(Error::NoMbrDevice)?;
        let boot = config.cur_boot_partition().ok_or(Error::NoBootPartition)?;
        let system = self.session.system();
        let plan = Plan::new(boot).with_dependents(linux_devices(config));

        self.session.attempt(&plan, |mounted| {
            let sections = collect_sections(system, config, mounted, true);
            let vga = framebuffer::resolve(system);

            self.session.phase(Phase::WriteOrCopyConfig);
            let path = self.configuration_path();
            fs::write(&path, render(mbr, &vga, &sections))?;
            log::info!("Generated {} with {} sections", path.display(), sections.len());
            Ok(())
        })
    }

    /// Copy the configuration onto the boot partition and run lilo against it
    pub(super) fn install(&self, config: &Config) -> Result<(), Error> {
        let boot = config.cur_boot_partition().ok_or(Error::NoBootPartition)?;
        let plan = Plan::new(boot)
            .with_dependents(linux_devices(config))
            .with_system_binds();

        self.session.attempt(&plan, |mounted| {
            self.session.phase(Phase::WriteOrCopyConfig);
            let dir = mounted.primary().join("etc").join("bootsetup");
            create_dir_all(&dir)?;
            let installed = dir.join("lilo.conf");
            fs::copy(self.configuration_path(), &installed)?;

            self.session.phase(Phase::InvokeLoaderInstall);
            let lilo = Invocation::exec(
                LILO,
                ["-v".to_owned(), "-C".to_owned(), installed.to_string_lossy().to_string()],
            );
            self.session.run(&lilo)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::{
        bootloader::Bootloader,
        testing::{Call, FakeSystem},
        BootCandidate, BootType, Config, Configuration, Disk, Error, LoaderKind, Partition,
    };

    /// Two disks, Salix on sda5 and Windows on sda1
    fn scenario() -> Config {
        let disks = [("sda", "msdos"), ("sdb", "gpt")]
            .map(|(device, table)| Disk {
                device: device.into(),
                table: table.into(),
                label: String::new(),
            })
            .to_vec();
        let partitions = [("sda1", "ntfs"), ("sda5", "ext2"), ("sdb2", "ext4")]
            .map(|(device, filesystem)| Partition {
                device: device.into(),
                filesystem: filesystem.into(),
                label: String::new(),
            })
            .to_vec();
        let candidates = vec![
            BootCandidate::new("sda5", "ext2", BootType::Linux, "Salix", "Salix"),
            BootCandidate::new("sda1", "ntfs", BootType::Chain, "Windows", "Windows"),
        ];
        let mut config = Config::from_parts(disks, partitions, candidates, false, vec![]);
        config.set_boot_partition(Some("sda5".into()));
        config.set_bootloader(LoaderKind::Lilo).unwrap();
        config
    }

    #[test]
    fn chain_and_linux_sections() {
        let system = FakeSystem::new()
            .with_file("/dev/sda5", "boot/vmlinuz", "kernel")
            .with_file("/dev/sda5", "boot/initrd.gz", "initrd");
        let configuration = Configuration::default();
        let config = scenario();
        assert_eq!(config.cur_mbr_device(), Some("sda"));

        let loader = Bootloader::new(LoaderKind::Lilo, &system, &configuration).unwrap();
        loader.create_configuration(&config).unwrap();
        let path = loader.configuration_path().unwrap();
        let text = fs::read_to_string(&path).unwrap();

        assert!(text.contains("boot = \"/dev/sda\"\n"));
        assert!(text.contains("vga = normal\n"));
        assert_eq!(text.matches("chain section").count(), 1);
        assert!(text.contains("# Windows chain section\n  other = /dev/sda1\n  label = Windows\n"));
        assert_eq!(text.matches("Linux section").count(), 1);
        assert!(text.contains("  root = /dev/sda5\n"));
        assert!(text.contains("/sda5/boot/initrd.gz\n"));
        assert!(text.contains("  read-only\n  label = Salix\n"));
        assert!(!text.contains("rootfstype"));

        // everything mounted for generation is gone again
        assert!(system.mounted_points().is_empty());
    }

    #[test]
    fn multiple_kernels() {
        let system = FakeSystem::new()
            .with_file("/dev/sda5", "boot/vmlinuz-1", "one")
            .with_file("/dev/sda5", "boot/vmlinuz-2", "two")
            .with_file("/dev/sda5", "boot/initrd-2.gz", "initrd")
            .with_output("/sbin/blkid", &["0a1b-2c3d"]);
        let configuration = Configuration::default();
        let mut config = scenario();
        config.boot_candidates[0].filesystem = "ext4".into();

        let loader = Bootloader::new(LoaderKind::Lilo, &system, &configuration).unwrap();
        loader.create_configuration(&config).unwrap();
        let text = fs::read_to_string(loader.configuration_path().unwrap()).unwrap();

        let linux = text.split("\n\n").filter(|s| s.contains("Linux section")).collect::<Vec<_>>();
        assert_eq!(linux.len(), 2);
        assert!(linux[0].starts_with("# Salix-1 Linux section"));
        assert!(!linux[0].contains("initrd"));
        assert!(linux[1].contains("/boot/initrd-2.gz"));
        assert!(linux[1].contains("label = Salix-2"));
        assert_eq!(text.matches("  root = /dev/disk/by-uuid/0a1b-2c3d\n").count(), 2);
        assert_eq!(text.matches("  append = \"rootfstype=ext4 \"\n").count(), 2);
    }

    #[test]
    fn install_runs_lilo() {
        let system = FakeSystem::new().with_file("/dev/sda5", "boot/vmlinuz", "kernel");
        let configuration = Configuration::default();
        let config = scenario();

        let loader = Bootloader::new(LoaderKind::Lilo, &system, &configuration).unwrap();
        assert!(matches!(loader.install(&config), Err(Error::MissingConfiguration(_))));

        loader.create_configuration(&config).unwrap();
        loader.install(&config).unwrap();

        let lilo = system
            .runs()
            .into_iter()
            .find(|r| r.starts_with("/sbin/lilo"))
            .expect("lilo was run");
        assert!(lilo.starts_with("/sbin/lilo -v -C /"));
        assert!(lilo.ends_with("/sda5/etc/bootsetup/lilo.conf"));

        // binds are undone before the boot partition
        let unmounts = system
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Unmount(p) => Some(p.file_name().unwrap().to_string_lossy().to_string()),
                _ => None,
            })
            .collect::<Vec<_>>();
        let last = unmounts.len() - 1;
        assert_eq!(&unmounts[last - 3..], &["sys", "proc", "dev", "sda5"]);
    }

    #[test]
    fn failing_lilo() {
        let system = FakeSystem::new().with_failing_call("/sbin/lilo");
        let configuration = Configuration::default();
        let config = scenario();
        let loader = Bootloader::new(LoaderKind::Lilo, &system, &configuration).unwrap();
        loader.create_configuration(&config).unwrap();
        assert!(matches!(loader.install(&config), Err(Error::LoaderInstall { .. })));
        assert!(system.mounted_points().is_empty());
    }

    #[test]
    fn wrong_mode() {
        let system = FakeSystem::new();
        let configuration = Configuration::default();
        let config = Config::test_data();
        let loader = Bootloader::new(LoaderKind::Lilo, &system, &configuration).unwrap();
        assert!(matches!(
            loader.create_configuration(&config),
            Err(Error::UnsupportedMode { .. })
        ));
    }
}
