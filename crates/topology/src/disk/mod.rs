// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Disk probe/query APIs

use std::path::PathBuf;

use thiserror::Error;

pub mod builder;
pub mod mounts;
pub mod probe;

#[derive(Debug, Error)]
pub enum Error {
    #[error("from io: {0}")]
    IO(#[from] std::io::Error),

    #[error("lowlevel C stdlib error: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("unknown block device: {0}")]
    UnknownDevice(String),

    #[error("cannot determine filesystem of {0}")]
    UnknownFilesystem(PathBuf),

    #[error("command `{command}` could not be started: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}
