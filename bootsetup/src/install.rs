// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Installation sessions
//!
//! Every loader runs its configuration and install steps through
//! [`Session::attempt`], which mounts what the [`Plan`] asks for and releases
//! all of it again, whatever the outcome.

use std::{
    fmt,
    fs::create_dir_all,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use topology::{Invocation, System};

use crate::{
    mounts::{MountBroker, MountHandle},
    Configuration, Error, LoaderKind,
};

/// Host directories exposed to chrooted installers
const SYSTEM_BINDS: [&str; 3] = ["/dev", "/proc", "/sys"];

/// Steps of every installation attempt, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    MountTargets,
    MountDependents,
    WriteOrCopyConfig,
    InvokeLoaderInstall,
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::MountTargets => "mount targets",
            Phase::MountDependents => "mount dependents",
            Phase::WriteOrCopyConfig => "write configuration",
            Phase::InvokeLoaderInstall => "invoke loader install",
            Phase::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// What needs mounting for one attempt
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Partitions written to, the first being the primary
    pub targets: Vec<String>,

    /// Partitions only read from (kernels of other systems)
    pub dependents: Vec<String>,

    /// Bind `/dev`, `/proc` and `/sys` into the primary target
    pub bind_system: bool,
}

impl Plan {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            targets: vec![primary.into()],
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    pub fn with_dependents<I: IntoIterator<Item = String>>(mut self, dependents: I) -> Self {
        self.dependents.extend(dependents);
        self
    }

    pub fn with_system_binds(mut self) -> Self {
        self.bind_system = true;
        self
    }
}

/// Mount points made available to an attempt
#[derive(Debug, Default)]
pub struct Mounted {
    targets: Vec<PathBuf>,
    dependents: Vec<(String, PathBuf)>,
}

impl Mounted {
    /// Mount point of the first target
    pub fn primary(&self) -> &Path {
        self.targets.first().map(PathBuf::as_path).unwrap_or(Path::new("/"))
    }

    pub fn target(&self, index: usize) -> Option<&Path> {
        self.targets.get(index).map(PathBuf::as_path)
    }

    /// Mount point of a dependent partition (`sda5` form)
    pub fn dependent(&self, device: &str) -> Option<&Path> {
        let device = crate::config::device_name(device);
        self.dependents
            .iter()
            .find(|(d, _)| d == device)
            .map(|(_, p)| p.as_path())
    }
}

/// Handles held by an attempt, released in reverse acquisition order
struct MountSet<'b, 'a> {
    broker: &'b MountBroker<'a>,
    handles: Vec<MountHandle>,
}

impl MountSet<'_, '_> {
    fn push(&mut self, handle: MountHandle) -> PathBuf {
        let point = handle.point.clone();
        self.handles.push(handle);
        point
    }

    fn release_all(&mut self) {
        while let Some(handle) = self.handles.pop() {
            self.broker.release(handle);
        }
    }
}

impl Drop for MountSet<'_, '_> {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// One loader's private workspace: staging directory, mount root and host access
pub struct Session<'a> {
    system: &'a dyn System,
    configuration: &'a Configuration,
    staging: TempDir,
    broker: MountBroker<'a>,
}

impl<'a> Session<'a> {
    pub fn new(system: &'a dyn System, configuration: &'a Configuration, kind: LoaderKind) -> Result<Self, Error> {
        let staging = tempfile::Builder::new()
            .prefix(&format!("bootsetup.{kind}-"))
            .tempdir()?;
        let mount_root = staging.path().join("mounts");
        create_dir_all(&mount_root)?;
        log::debug!("Staging {kind} in {}", staging.path().display());

        Ok(Self {
            system,
            configuration,
            broker: MountBroker::new(system, mount_root),
            staging,
        })
    }

    pub fn system(&self) -> &'a dyn System {
        self.system
    }

    pub fn configuration(&self) -> &'a Configuration {
        self.configuration
    }

    /// Private directory for generated files
    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    pub fn broker(&self) -> &MountBroker<'a> {
        &self.broker
    }

    pub fn phase(&self, phase: Phase) {
        log::debug!("phase: {phase}");
    }

    /// Run an installer command. Test mode only reports what would run.
    pub fn run(&self, invocation: &Invocation) -> Result<(), Error> {
        if self.configuration.test_mode {
            log::info!("Would run: {invocation}");
            return Ok(());
        }
        log::info!("Running: {invocation}");
        if self.system.call(invocation)? {
            Ok(())
        } else {
            Err(Error::LoaderInstall {
                command: invocation.to_string(),
            })
        }
    }

    /// Mount everything in `plan`, run `body`, and always clean up
    pub fn attempt<T>(&self, plan: &Plan, body: impl FnOnce(&Mounted) -> Result<T, Error>) -> Result<T, Error> {
        let mut held = MountSet {
            broker: &self.broker,
            handles: vec![],
        };
        let result = self.mount_all(plan, &mut held).and_then(|mounted| body(&mounted));
        self.phase(Phase::Cleanup);
        held.release_all();
        if let Err(e) = &result {
            log::error!("Attempt failed: {e}");
        }
        result
    }

    fn mount_all(&self, plan: &Plan, held: &mut MountSet<'_, 'a>) -> Result<Mounted, Error> {
        let mut mounted = Mounted::default();

        self.phase(Phase::MountTargets);
        for device in &plan.targets {
            let handle = self.broker.ensure_mounted(device)?;
            mounted.targets.push(held.push(handle));
        }

        self.phase(Phase::MountDependents);
        for device in &plan.dependents {
            let name = crate::config::device_name(device).to_owned();
            if mounted.dependent(&name).is_some() {
                continue;
            }
            let handle = self.broker.ensure_mounted(&name)?;
            mounted.dependents.push((name, held.push(handle)));
        }

        let root = mounted.primary().to_path_buf();
        if plan.bind_system && root != Path::new("/") {
            for dir in SYSTEM_BINDS {
                held.push(self.broker.bind(Path::new(dir), &root)?);
            }
        }

        Ok(mounted)
    }
}
