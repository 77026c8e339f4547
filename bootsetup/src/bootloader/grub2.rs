// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! GRUB 2 in BIOS mode
//!
//! GRUB writes its own menu, so there is nothing to synthesize. The install
//! step runs `grub-install` and regenerates the menu on the target.

use std::path::Path;

use topology::Invocation;

use crate::{
    install::{Phase, Plan, Session},
    Config, Error,
};

pub(super) const GRUB_INSTALL: &str = "/usr/sbin/grub-install";
const GRUB_MKCONFIG: &str = "/usr/sbin/grub-mkconfig";
const UPDATE_GRUB: &str = "/usr/sbin/update-grub";
const CHROOT: &str = "/usr/sbin/chroot";

/// Whether the system rooted at `root` ships a grub2 configuration
pub fn grub2_available(root: &Path) -> bool {
    root.join("etc").join("default").join("grub").exists()
}

/// Menu regeneration for the system rooted at `root`
///
/// Distributions providing `update-grub` get it run inside the target,
/// otherwise the host's `grub-mkconfig` writes the menu directly.
pub(super) fn menu_invocation(root: &Path) -> Invocation {
    let root_arg = root.to_string_lossy().to_string();
    if grub2_available(root) && root.join(UPDATE_GRUB.trim_start_matches('/')).exists() {
        Invocation::exec(CHROOT, [root_arg, UPDATE_GRUB.to_owned()])
    } else {
        let cfg = root.join("boot").join("grub").join("grub.cfg");
        Invocation::exec(GRUB_MKCONFIG, ["-o".to_owned(), cfg.to_string_lossy().to_string()])
    }
}

/// GRUB 2 specific bootloader behaviours
pub struct Loader<'a> {
    session: Session<'a>,
}

impl<'a> Loader<'a> {
    pub(super) fn new(session: Session<'a>) -> Self {
        Self { session }
    }

    pub(super) fn install(&self, config: &Config) -> Result<(), Error> {
        let mbr = config.cur_mbr_device().ok_or(Error::NoMbrDevice)?;
        let boot = config.cur_boot_partition().ok_or(Error::NoBootPartition)?;
        let plan = Plan::new(boot).with_system_binds();

        self.session.attempt(&plan, |mounted| {
            let root = mounted.primary();
            if !grub2_available(root) {
                log::warn!("{boot} has no /etc/default/grub, using the host defaults");
            }

            self.session.phase(Phase::InvokeLoaderInstall);
            let install = Invocation::exec(
                GRUB_INSTALL,
                [
                    "--boot-directory".to_owned(),
                    root.join("boot").to_string_lossy().to_string(),
                    "--no-floppy".to_owned(),
                    format!("/dev/{mbr}"),
                ],
            );
            self.session.run(&install)?;
            self.session.run(&menu_invocation(root))
        })
    }
}
