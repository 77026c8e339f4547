// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Kernel and initrd discovery on a mounted partition

use std::path::{Path, PathBuf};

use glob::Pattern;
use topology::{Invocation, System};

use crate::{config::LABEL_MAX, mounts::device_path, Error};

const BLKID: &str = "/sbin/blkid";

/// A bootable kernel with its (optional) initrd
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInitrdPair {
    /// Absolute path within the partition, i.e. `/boot/vmlinuz-6.1`
    pub kernel: PathBuf,

    pub initrd: Option<PathBuf>,

    /// Menu label, unique per partition
    pub label: String,
}

impl KernelInitrdPair {
    pub fn kernel_name(&self) -> &str {
        file_name(&self.kernel)
    }

    pub fn initrd_name(&self) -> Option<&str> {
        self.initrd.as_deref().map(file_name)
    }
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|f| f.to_str()).unwrap_or_default()
}

/// Regular files under `mount_point` matching `pattern`, sorted, relative to the partition root
fn images(mount_point: &Path, pattern: &str) -> Result<Vec<PathBuf>, Error> {
    let root = mount_point.to_string_lossy();
    let pattern = format!("{}/{pattern}", Pattern::escape(root.trim_end_matches('/')));
    let mut found = glob::glob(&pattern)?
        .filter_map(Result::ok)
        .filter(|p| p.symlink_metadata().is_ok_and(|m| m.is_file()))
        .filter_map(|p| Some(Path::new("/").join(p.strip_prefix(mount_point).ok()?)))
        .collect::<Vec<_>>();
    found.sort();
    Ok(found)
}

/// Find and pair the kernels of the partition mounted at `mount_point`
pub fn discover(mount_point: &Path, label: &str) -> Result<Vec<KernelInitrdPair>, Error> {
    let kernels = images(mount_point, "boot/vmlinuz*")?;
    let initrds = images(mount_point, "boot/initr*")?;
    log::trace!("{}: kernels {kernels:?}, initrds {initrds:?}", mount_point.display());
    Ok(pair(&kernels, &initrds, label))
}

/// Pair sorted kernels with sorted initrds
///
/// A lone kernel takes the first initrd and keeps `label`. Otherwise each
/// kernel takes the first initrd containing its version suffix, and labels
/// gain a `-N` ordinal, truncating the base to stay within [`LABEL_MAX`].
pub fn pair(kernels: &[PathBuf], initrds: &[PathBuf], label: &str) -> Vec<KernelInitrdPair> {
    match kernels {
        [] => vec![],
        [kernel] => vec![KernelInitrdPair {
            kernel: kernel.clone(),
            initrd: initrds.first().cloned(),
            label: label.to_owned(),
        }],
        _ => kernels
            .iter()
            .enumerate()
            .map(|(index, kernel)| {
                let ordinal = (index + 1).to_string();
                let suffix = file_name(kernel).replacen("vmlinuz", "", 1);
                let initrd = initrds
                    .iter()
                    .find(|i| file_name(i).contains(suffix.as_str()))
                    .cloned();
                let base = label
                    .chars()
                    .take(LABEL_MAX.saturating_sub(ordinal.len() + 1))
                    .collect::<String>();
                KernelInitrdPair {
                    kernel: kernel.clone(),
                    initrd,
                    label: format!("{base}-{ordinal}"),
                }
            })
            .collect(),
    }
}

/// How loader configurations refer to the root partition
///
/// `/dev/disk/by-uuid/...` survives disk reordering, so prefer it when blkid
/// knows the UUID.
pub fn root_reference(system: &dyn System, device: &str) -> String {
    let device = device_path(device);
    let invocation = Invocation::exec(
        BLKID,
        ["-s", "UUID", "-o", "value"]
            .map(String::from)
            .into_iter()
            .chain(Some(device.to_string_lossy().to_string())),
    );
    let uuid = system
        .output(&invocation)
        .ok()
        .and_then(|lines| lines.into_iter().map(|l| l.trim().to_owned()).find(|l| !l.is_empty()));
    match uuid {
        Some(uuid) => format!("/dev/disk/by-uuid/{uuid}"),
        None => device.to_string_lossy().to_string(),
    }
}
