// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! File utilities for writing onto EFI System Partitions

use std::{
    fs::{self, create_dir_all, File},
    io,
    os::{fd::AsRawFd, unix::fs::MetadataExt},
    path::{Path, PathBuf},
};

use crate::Error;

/// Case-insensitive path joining for FAT, respecting existing entries on the filesystem
/// Note, this discards errors, so will require read permissions
pub trait PathExt<P: AsRef<Path>> {
    fn join_insensitive(&self, path: P) -> PathBuf;
}

impl<P: AsRef<Path>> PathExt<P> for PathBuf {
    fn join_insensitive(&self, path: P) -> PathBuf {
        let wanted = path.as_ref().to_string_lossy().to_lowercase();
        let existing = fs::read_dir(self).ok().and_then(|dir| {
            dir.filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .find(|name| name.to_lowercase() == wanted)
        });
        match existing {
            Some(name) => self.join(name),
            None => self.join(path),
        }
    }
}

/// Join a multi component relative path (`EFI/Boot/bootx64.efi`) one
/// case-insensitive component at a time
pub fn join_insensitive_all(root: &Path, relative: impl AsRef<Path>) -> PathBuf {
    relative
        .as_ref()
        .components()
        .fold(root.to_path_buf(), |acc, c| acc.join_insensitive(c.as_os_str()))
}

/// Compare two files with blake3 to see if they differ
fn files_identical(hasher: &mut blake3::Hasher, a: &Path, b: &Path) -> Result<bool, Error> {
    let meta_a = File::open(a)?.metadata()?;
    let meta_b = File::open(b)?.metadata()?;
    if meta_a.size() != meta_b.size() || meta_a.file_type() != meta_b.file_type() {
        return Ok(false);
    }

    hasher.update_mmap_rayon(a)?;
    let hash_a = hasher.finalize();
    hasher.reset();

    hasher.update_mmap_rayon(b)?;
    let hash_b = hasher.finalize();
    hasher.reset();

    Ok(hash_a == hash_b)
}

/// Find out which `(source, dest)` pairs need copying
///
/// Unreadable or missing destinations always count as changed.
pub fn changed_files(files: &[(PathBuf, PathBuf)]) -> Vec<(&PathBuf, &PathBuf)> {
    let mut hasher = blake3::Hasher::new();

    files
        .iter()
        .filter(|(source, dest)| !matches!(files_identical(&mut hasher, source, dest), Ok(true)))
        .map(|(source, dest)| (source, dest))
        .collect()
}

/// Copy source file to dest file, handling vfat oddities.
///
/// We always write a temporary file first, then delete the target file,
/// and finally rename into place. vfat corrupts blocks otherwise.
pub fn copy_atomic_vfat(source: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<(), Error> {
    let source = source.as_ref();
    let dest = dest.as_ref();

    log::trace!("copy_atomic_vfat: {}", dest.display());

    let mut input = File::open(source).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::MissingFile(source.to_path_buf()),
        _ => Error::IO(e),
    })?;

    let dest_temp = dest.with_extension("TmpWrite");
    let dest_exists = dest.exists();

    let dir_leading = dest.parent().ok_or(Error::InvalidFilesystem)?;
    if !dir_leading.exists() {
        create_dir_all(dir_leading)?;
    }

    let mut output = File::options()
        .truncate(true)
        .write(true)
        .create(true)
        .open(&dest_temp)?;
    let output_fd = output.as_raw_fd();

    // Copy *contents* only
    io::copy(&mut input, &mut output)?;
    nix::unistd::syncfs(output_fd)?;

    if dest_exists {
        fs::remove_file(dest)?;
        nix::unistd::syncfs(output_fd)?;
    }

    fs::rename(dest_temp, dest)?;
    nix::unistd::syncfs(output_fd)?;

    log::info!("Updated VFAT file: {}", dest.display());

    Ok(())
}

/// Copy every changed pair onto the vfat target, returning how many were written
pub fn sync_vfat(files: &[(PathBuf, PathBuf)]) -> Result<usize, Error> {
    let changed = changed_files(files);
    for (source, dest) in changed.iter() {
        copy_atomic_vfat(source, dest)?;
    }
    log::debug!("{} of {} files needed updating", changed.len(), files.len());
    Ok(changed.len())
}
