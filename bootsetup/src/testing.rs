// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory [`System`] used by the unit tests

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    fs,
    io::Cursor,
    path::{Path, PathBuf},
};

use nix::errno::Errno;
use topology::{
    disk::Error, DiskInfo, Invocation, MountRequest, PartitionInfo, RawDisk, System,
};

/// Side effects requested from the fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Mount { source: PathBuf, target: PathBuf, bind: bool },
    Unmount(PathBuf),
    Run(String),
}

#[derive(Debug, Default)]
pub struct FakeSystem {
    disks: Vec<(String, DiskInfo)>,
    partitions: Vec<(String, PartitionInfo)>,
    images: HashMap<String, Vec<u8>>,
    outputs: HashMap<PathBuf, Vec<String>>,
    failing_calls: Vec<PathBuf>,
    failing_mounts: Vec<PathBuf>,
    failing_unmounts: Vec<PathBuf>,
    files: HashMap<PathBuf, Vec<(PathBuf, Vec<u8>)>>,
    live: bool,
    root: Option<PathBuf>,
    mounted: RefCell<Vec<(PathBuf, PathBuf)>>,
    calls: RefCell<Vec<Call>>,
    snapshots: RefCell<HashMap<PathBuf, BTreeMap<String, String>>>,
}

/// Every file below `dir`, relative to `root`
fn walk(root: &Path, dir: &Path, files: &mut BTreeMap<String, String>) {
    for entry in fs::read_dir(dir).into_iter().flatten().filter_map(Result::ok) {
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, files);
        } else if let Ok(relative) = path.strip_prefix(root) {
            let contents = fs::read(&path).unwrap_or_default();
            files.insert(
                relative.to_string_lossy().to_string(),
                String::from_utf8_lossy(&contents).to_string(),
            );
        }
    }
}

impl FakeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disk(mut self, name: &str, table: &str, model: &str, size: u64) -> Self {
        self.disks.push((
            name.to_owned(),
            DiskInfo {
                table: table.to_owned(),
                model: model.to_owned(),
                size,
            },
        ));
        self
    }

    pub fn with_partition(mut self, name: &str, filesystem: &str, label: &str, size: u64) -> Self {
        self.partitions.push((
            name.to_owned(),
            PartitionInfo {
                filesystem: filesystem.to_owned(),
                label: label.to_owned(),
                size,
            },
        ));
        self
    }

    pub fn with_image(mut self, disk: &str, image: Vec<u8>) -> Self {
        self.images.insert(disk.to_owned(), image);
        self
    }

    /// Scripted stdout for a program
    pub fn with_output(mut self, program: impl Into<PathBuf>, lines: &[&str]) -> Self {
        self.outputs
            .insert(program.into(), lines.iter().map(|l| l.to_string()).collect());
        self
    }

    /// The program exits non-zero
    pub fn with_failing_call(mut self, program: impl Into<PathBuf>) -> Self {
        self.failing_calls.push(program.into());
        self
    }

    pub fn with_failing_mount(mut self, device: impl Into<PathBuf>) -> Self {
        self.failing_mounts.push(device.into());
        self
    }

    /// Unmounting `device` reports busy and leaves it mounted
    pub fn with_failing_unmount(mut self, device: impl Into<PathBuf>) -> Self {
        self.failing_unmounts.push(device.into());
        self
    }

    pub fn with_mounted(self, device: impl Into<PathBuf>, point: impl Into<PathBuf>) -> Self {
        self.mounted.borrow_mut().push((device.into(), point.into()));
        self
    }

    /// File materialized in the mount point whenever `device` gets mounted
    pub fn with_file(mut self, device: impl Into<PathBuf>, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.files
            .entry(device.into())
            .or_default()
            .push((path.into(), contents.as_bytes().to_vec()));
        self
    }

    pub fn with_root(mut self, device: impl Into<PathBuf>) -> Self {
        self.root = Some(device.into());
        self
    }

    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    /// Every command line run, in order
    pub fn runs(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Run(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Currently mounted points, in mount order
    pub fn mounted_points(&self) -> Vec<PathBuf> {
        self.mounted.borrow().iter().map(|(_, p)| p.clone()).collect()
    }

    /// Files left on `device` when it was last unmounted
    pub fn snapshot(&self, device: impl AsRef<Path>) -> BTreeMap<String, String> {
        self.snapshots
            .borrow()
            .get(device.as_ref())
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }
}

impl System for FakeSystem {
    fn disks(&self) -> Result<Vec<String>, Error> {
        Ok(self.disks.iter().map(|(n, _)| n.clone()).collect())
    }

    fn disk_info(&self, disk: &str) -> Result<DiskInfo, Error> {
        self.disks
            .iter()
            .find(|(n, _)| n == disk)
            .map(|(_, i)| i.clone())
            .ok_or_else(|| Error::UnknownDevice(disk.to_owned()))
    }

    fn partitions(&self, disk: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .partitions
            .iter()
            .map(|(n, _)| n.clone())
            .filter(|n| n.starts_with(disk))
            .collect())
    }

    fn partition_info(&self, partition: &str) -> Result<PartitionInfo, Error> {
        self.partitions
            .iter()
            .find(|(n, _)| n == partition)
            .map(|(_, i)| i.clone())
            .ok_or_else(|| Error::UnknownDevice(partition.to_owned()))
    }

    fn mount_point(&self, device: &Path) -> Option<PathBuf> {
        let mounted = self.mounted.borrow();
        mounted.iter().rev().find(|(d, _)| d == device).map(|(_, p)| p.clone())
    }

    fn is_mount_point(&self, path: &Path) -> bool {
        self.mounted.borrow().iter().any(|(_, p)| p == path)
    }

    fn mount(&self, request: &MountRequest<'_>) -> Result<(), Error> {
        self.record(Call::Mount {
            source: request.source.to_path_buf(),
            target: request.target.to_path_buf(),
            bind: request.bind,
        });
        if self.failing_mounts.iter().any(|d| d == request.source) {
            return Err(Error::Errno(Errno::ENODEV));
        }
        for (path, contents) in self.files.get(request.source).into_iter().flatten() {
            let path = request.target.join(path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, contents)?;
        }
        self.mounted
            .borrow_mut()
            .push((request.source.to_path_buf(), request.target.to_path_buf()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), Error> {
        self.record(Call::Unmount(target.to_path_buf()));
        let mut mounted = self.mounted.borrow_mut();
        let index = mounted
            .iter()
            .rposition(|(_, p)| p == target)
            .ok_or(Error::Errno(Errno::EINVAL))?;
        if self.failing_unmounts.contains(&mounted[index].0) {
            return Err(Error::Errno(Errno::EBUSY));
        }
        let (device, _) = mounted.remove(index);

        let mut files = BTreeMap::new();
        walk(target, target, &mut files);
        self.snapshots.borrow_mut().insert(device, files);

        // The filesystem contents go away with the mount
        for entry in fs::read_dir(target)?.filter_map(Result::ok) {
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir_all(path)?;
            } else {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn output(&self, invocation: &Invocation) -> Result<Vec<String>, Error> {
        self.record(Call::Run(invocation.to_string()));
        Ok(self.outputs.get(invocation.program()).cloned().unwrap_or_default())
    }

    fn call(&self, invocation: &Invocation) -> Result<bool, Error> {
        self.record(Call::Run(invocation.to_string()));
        Ok(!self.failing_calls.iter().any(|p| p == invocation.program()))
    }

    fn open_disk(&self, disk: &str) -> Result<Box<dyn RawDisk>, Error> {
        self.images
            .get(disk)
            .map(|image| Box::new(Cursor::new(image.clone())) as Box<dyn RawDisk>)
            .ok_or_else(|| Error::UnknownDevice(disk.to_owned()))
    }

    fn is_live(&self) -> bool {
        self.live
    }

    fn root_device(&self) -> Option<PathBuf> {
        self.root.clone()
    }
}
