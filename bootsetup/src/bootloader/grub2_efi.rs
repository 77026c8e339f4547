// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! GRUB 2 on the EFI System Partition

use std::path::{Path, PathBuf};

use topology::Invocation;

use super::{
    grub2::{menu_invocation, GRUB_INSTALL},
    SupportsEfiInstall,
};
use crate::{
    file_utils::join_insensitive_all,
    install::{Phase, Plan, Session},
    Config, Error,
};

/// GRUB 2 EFI specific bootloader behaviours
pub struct Loader<'a> {
    session: Session<'a>,
}

impl<'a> Loader<'a> {
    pub(super) fn new(session: Session<'a>) -> Self {
        Self { session }
    }

    pub(super) fn install(&self, config: &Config) -> Result<(), Error> {
        let boot = config.cur_boot_partition().ok_or(Error::NoBootPartition)?;
        let esp = self.esp(config)?;
        let plan = Plan::new(boot).with_target(esp).with_system_binds();

        self.session.attempt(&plan, |mounted| {
            let root = mounted.primary();
            let esp_root = mounted.target(1).ok_or(Error::NoEsp)?;

            self.session.phase(Phase::InvokeLoaderInstall);
            let install = Invocation::exec(
                GRUB_INSTALL,
                [
                    "--target=x86_64-efi".to_owned(),
                    "--efi-directory".to_owned(),
                    esp_root.to_string_lossy().to_string(),
                    "--boot-directory".to_owned(),
                    root.join("boot").to_string_lossy().to_string(),
                    "--bootloader-id".to_owned(),
                    "grub".to_owned(),
                    "--removable".to_owned(),
                ],
            );
            self.session.run(&install)?;
            self.session.run(&menu_invocation(root))?;

            // grub-install only produced the removable binary when it really ran
            if config.secure_boot() && !self.session.configuration().test_mode {
                self.session.phase(Phase::WriteOrCopyConfig);
                self.install_boot_files(config, esp_root)?;
            }
            Ok(())
        })
    }
}

impl SupportsEfiInstall for Loader<'_> {
    fn session(&self) -> &Session<'_> {
        &self.session
    }

    fn efi_binary(&self, esp_root: &Path) -> PathBuf {
        join_insensitive_all(esp_root, "EFI/Boot/bootx64.efi")
    }
}
