// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! ELILO management
//!
//! ELILO can only load images from the ESP, so every kernel and initrd in
//! the menu is copied into `EFI/Linux/<label>/` at install time.

use std::{
    fs,
    path::{Path, PathBuf},
};

use super::{collect_sections, efi_image_path, efi_images, linux_devices, Section, SupportsEfiInstall};
use crate::{
    file_utils::{copy_atomic_vfat, join_insensitive_all, sync_vfat},
    install::{Phase, Plan, Session},
    Config, Error,
};

const ELILO_BINARY: &str = "elilo-x86_64.efi";

const TEMPLATE: &str = r#"# ELILO configuration file
# Generated by BootSetup
chooser=textmenu
prompt
timeout=50
append = "vt.default_utf8=1 "
read-only
"#;

/// Render a complete elilo.conf. Chain sections have no ELILO equivalent.
pub(crate) fn render(sections: &[Section]) -> String {
    let mut out = TEMPLATE.to_owned();
    for section in sections {
        let Section::Linux {
            filesystem, root, pair, ..
        } = section
        else {
            continue;
        };
        let initrd = pair
            .initrd_name()
            .map(|name| format!("  initrd={}\n", efi_image_path(&pair.label, name)))
            .unwrap_or_default();
        let append = if filesystem == "ext4" {
            "  append=\"rootfstype=ext4 \"\n"
        } else {
            ""
        };
        out.push_str(&format!(
            r###"
# {label} Linux section
image={image}
{initrd}  root={root}
{append}  label={label}
"###,
            label = pair.label,
            image = efi_image_path(&pair.label, pair.kernel_name()),
        ));
    }
    out
}

/// ELILO specific bootloader behaviours
pub struct Loader<'a> {
    session: Session<'a>,
}

impl<'a> Loader<'a> {
    pub(super) fn new(session: Session<'a>) -> Self {
        Self { session }
    }

    pub fn configuration_path(&self) -> PathBuf {
        self.session.staging_path().join("elilo.conf")
    }

    pub(super) fn create_configuration(&self, config: &Config) -> Result<(), Error> {
        let esp = self.esp(config)?;
        let plan = Plan::new(esp).with_dependents(linux_devices(config));
        self.session.attempt(&plan, |mounted| {
            let sections = collect_sections(self.session.system(), config, mounted, false);

            self.session.phase(Phase::WriteOrCopyConfig);
            let path = self.configuration_path();
            fs::write(&path, render(&sections))?;
            log::info!("Generated {} with {} sections", path.display(), sections.len());
            Ok(())
        })
    }

    /// Lay out the ESP: loader, shims, images and the configuration
    pub(super) fn install(&self, config: &Config) -> Result<(), Error> {
        let esp = self.esp(config)?;
        let plan = Plan::new(esp).with_dependents(linux_devices(config));

        self.session.attempt(&plan, |mounted| {
            let esp_root = mounted.primary();
            let sections = collect_sections(self.session.system(), config, mounted, false);

            self.session.phase(Phase::WriteOrCopyConfig);
            self.install_boot_files(config, esp_root)?;
            let images = efi_images(&sections, esp_root);
            let copied = sync_vfat(&images)?;
            log::info!("Copied {copied} of {} boot images", images.len());

            let boot = join_insensitive_all(esp_root, "EFI/Boot");
            copy_atomic_vfat(self.configuration_path(), boot.join("elilo.conf"))
        })
    }
}

impl SupportsEfiInstall for Loader<'_> {
    fn session(&self) -> &Session<'_> {
        &self.session
    }

    fn efi_binary(&self, _: &Path) -> PathBuf {
        self.session.configuration().loader_dir.join(ELILO_BINARY)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use crate::{
        bootloader::Bootloader,
        testing::{Call, FakeSystem},
        Config, Configuration, Error, LoaderKind,
    };

    fn system() -> FakeSystem {
        FakeSystem::new()
            .with_file("/dev/sda5", "boot/vmlinuz", "salix kernel")
            .with_file("/dev/sda5", "boot/initrd.gz", "salix initrd")
            .with_file("/dev/sdb2", "boot/vmlinuz-3.2.0", "debian kernel")
    }

    fn efi_config(secure: bool) -> Config {
        let mut config = Config::test_data();
        config.set_boot_partition(Some("sda5".into()));
        config.set_secure_boot(secure).unwrap();
        config.set_bootloader(LoaderKind::Elilo).unwrap();
        config
    }

    fn loader_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("elilo-x86_64.efi"), "elilo").unwrap();
        for shim in ["PreLoader.efi", "HashTool.efi", "KeyTool.efi", "shellx64.efi"] {
            fs::write(dir.path().join(shim), shim).unwrap();
        }
        dir
    }

    #[test]
    fn sections() {
        let system = system();
        let configuration = Configuration::default();
        let config = efi_config(false);

        let loader = Bootloader::new(LoaderKind::Elilo, &system, &configuration).unwrap();
        loader.create_configuration(&config).unwrap();
        let text = fs::read_to_string(loader.configuration_path().unwrap()).unwrap();

        assert!(text.starts_with("# ELILO configuration file\n"));
        assert!(text.contains("chooser=textmenu\nprompt\ntimeout=50\n"));
        assert!(!text.contains("Vista"));
        assert!(text.contains(
            "# Salix_14.0 Linux section\nimage=/EFI/Linux/Salix_14.0/vmlinuz\n  \
             initrd=/EFI/Linux/Salix_14.0/initrd.gz\n  root=/dev/sda5\n  label=Salix_14.0\n"
        ));
        assert!(text.contains(
            "# Debian_7 Linux section\nimage=/EFI/Linux/Debian_7/vmlinuz-3.2.0\n  \
             root=/dev/sdb2\n  append=\"rootfstype=ext4 \"\n  label=Debian_7\n"
        ));
        let mounts = system
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Mount { source, .. } => Some(source),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(mounts[0], PathBuf::from("/dev/sda2"));
        assert!(system.mounted_points().is_empty());
    }

    #[test]
    fn unmountable_esp() {
        let system = system().with_failing_mount("/dev/sda2");
        let configuration = Configuration::default();
        let config = efi_config(false);

        let loader = Bootloader::new(LoaderKind::Elilo, &system, &configuration).unwrap();
        assert!(matches!(
            loader.create_configuration(&config),
            Err(Error::CannotMount(_))
        ));
        assert!(!loader.configuration_path().unwrap().exists());
        assert!(system.mounted_points().is_empty());
    }

    #[test]
    fn install_layout() {
        let system = system();
        let dir = loader_dir();
        let configuration = Configuration {
            loader_dir: dir.path().to_path_buf(),
            share_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let config = efi_config(false);

        let loader = Bootloader::new(LoaderKind::Elilo, &system, &configuration).unwrap();
        assert!(matches!(loader.install(&config), Err(Error::MissingConfiguration(_))));
        loader.create_configuration(&config).unwrap();
        loader.install(&config).unwrap();

        let esp = system.snapshot("/dev/sda2");
        let files = esp.keys().map(String::as_str).collect::<Vec<_>>();
        assert_eq!(
            files,
            vec![
                "EFI/Boot/bootx64.efi",
                "EFI/Boot/elilo.conf",
                "EFI/Linux/Debian_7/vmlinuz-3.2.0",
                "EFI/Linux/Salix_14.0/initrd.gz",
                "EFI/Linux/Salix_14.0/vmlinuz",
            ]
        );
        assert_eq!(esp["EFI/Boot/bootx64.efi"], "elilo");
        assert_eq!(esp["EFI/Linux/Salix_14.0/vmlinuz"], "salix kernel");
        assert!(esp["EFI/Boot/elilo.conf"].contains("label=Debian_7\n"));
        assert!(system.runs().iter().all(|r| r.starts_with("/sbin/blkid")));
        assert!(system.mounted_points().is_empty());
    }

    #[test]
    fn secure_boot_layout() {
        let system = system().with_file("/dev/sda2", "efi/boot/elilo.conf", "stale");
        let dir = loader_dir();
        let configuration = Configuration {
            loader_dir: dir.path().to_path_buf(),
            share_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let config = efi_config(true);

        let loader = Bootloader::new(LoaderKind::Elilo, &system, &configuration).unwrap();
        loader.create_configuration(&config).unwrap();
        loader.install(&config).unwrap();

        let esp = system.snapshot("/dev/sda2");
        assert_eq!(esp["efi/boot/loader.efi"], "elilo");
        assert_eq!(esp["efi/boot/bootx64.efi"], "PreLoader.efi");
        assert_eq!(esp["efi/boot/HashTool.efi"], "HashTool.efi");
        assert_eq!(esp["efi/boot/shellx64.efi"], "shellx64.efi");
        assert!(esp["efi/boot/elilo.conf"].starts_with("# ELILO"));
        assert!(esp.contains_key("efi/Linux/Salix_14.0/vmlinuz"));
    }

    #[test]
    fn bios_is_refused() {
        let system = FakeSystem::new();
        let configuration = Configuration::default();
        let mut config = Config::test_data();
        config.set_boot_mode(crate::BootMode::Bios).unwrap();

        let loader = Bootloader::new(LoaderKind::Elilo, &system, &configuration).unwrap();
        assert!(matches!(
            loader.create_configuration(&config),
            Err(Error::UnsupportedMode { .. })
        ));
        assert!(system.calls().is_empty());
    }
}
