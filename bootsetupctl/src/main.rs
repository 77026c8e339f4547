// SPDX-FileCopyrightText: Copyright © 2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Command line front-end to configure and install a boot loader

use std::{
    env,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    process::Command,
};

use bootsetup::{BootMode, Bootloader, Config, Configuration, LoaderKind};
use clap::{Parser, Subcommand};
use color_eyre::{
    eyre::{eyre, Context},
    Section,
};
use pretty_env_logger::formatted_builder;

/// Graphical editors first, a terminal one as the last resort
const EDITORS: [&[&str]; 5] = [&["leafpad"], &["gedit"], &["geany"], &["kate"], &["xterm", "-e", "nano"]];

/// Debug log written in test mode
const LOG_FILE: &str = "bootsetup.log";

/// Configure and install LILO, GRUB 2, ELILO or gummiboot
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Log installer commands instead of running them, with a debug log in `bootsetup.log`
    #[arg(short, long, global = true)]
    test: bool,

    /// Use pre-filled test data instead of probing the host
    #[arg(short, long, global = true, requires = "test")]
    data: bool,

    /// Ignore EFI firmware and EFI system partitions
    #[arg(short, long, global = true)]
    no_efi: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Boot loader (`lilo`, `grub2`, `grub2-efi`, `elilo`, `gummiboot`), `_` for none
    loader: Option<String>,

    /// Partition to install for, defaults to the one mounted at `/`
    partition: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the gathered configuration
    Status {
        #[command(flatten)]
        target: Target,

        /// Machine readable output
        #[arg(long)]
        json: bool,
    },

    /// Generate the loader configuration and print it
    Generate {
        #[command(flatten)]
        target: Target,

        /// Open the generated configuration in an editor first
        #[arg(short, long)]
        edit: bool,
    },

    /// Generate the loader configuration and install the loader
    Install {
        #[command(flatten)]
        target: Target,

        /// Review the generated configuration in an editor before installing
        #[arg(short, long)]
        edit: bool,
    },
}

impl Commands {
    fn target(&self) -> &Target {
        match self {
            Commands::Status { target, .. } | Commands::Generate { target, .. } | Commands::Install { target, .. } => {
                target
            }
        }
    }
}

/// Duplicates log records onto stderr and the test mode log file
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logging(cli: &Cli) -> color_eyre::Result<()> {
    let level = if cli.test || cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let mut builder = formatted_builder();
    builder.filter_level(level).parse_default_env();

    if cli.test {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(LOG_FILE)
            .wrap_err(format!("Unable to open {LOG_FILE}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
    }
    builder.init();
    Ok(())
}

/// `_` (or nothing) selects no loader
fn parse_loader(loader: Option<&str>) -> color_eyre::Result<Option<LoaderKind>> {
    match loader {
        None | Some("_") => Ok(None),
        Some(name) => name
            .parse::<LoaderKind>()
            .map(Some)
            .map_err(|e| eyre!(e))
            .with_suggestion(|| "Use one of lilo, grub2, grub2-efi, elilo or gummiboot"),
    }
}

/// First editor found in `PATH`
fn find_editor() -> Option<&'static [&'static str]> {
    let path = env::var_os("PATH")?;
    let dirs = env::split_paths(&path).collect::<Vec<_>>();
    EDITORS
        .into_iter()
        .find(|editor| dirs.iter().any(|dir| dir.join(editor[0]).is_file()))
}

fn edit(path: &Path) -> color_eyre::Result<()> {
    let editor = find_editor()
        .ok_or_else(|| eyre!("no editor available"))
        .with_note(|| format!("Tried: {}", EDITORS.map(|e| e.join(" ")).join(", ")))?;
    log::info!("Editing {} with {}", path.display(), editor.join(" "));
    let status = Command::new(editor[0])
        .args(&editor[1..])
        .arg(path)
        .status()
        .wrap_err(format!("Unable to run {}", editor[0]))?;
    if !status.success() {
        log::warn!("{} exited with {status}", editor[0]);
    }
    Ok(())
}

/// Apply the requested loader (and its boot mode) to the gathered configuration
fn select(config: &mut Config, loader: Option<LoaderKind>) -> color_eyre::Result<()> {
    let Some(kind) = loader else {
        return Ok(());
    };
    if config.cur_boot_mode() != kind.mode() {
        config
            .set_boot_mode(kind.mode())
            .wrap_err(format!("Unable to switch to {} mode", kind.mode()))
            .with_note(|| {
                if kind.mode() == BootMode::Efi {
                    "EFI loaders need EFI firmware and an EFI system partition"
                } else {
                    "BIOS loaders need a disk to install to"
                }
            })?;
    }
    config.set_bootloader(kind)?;
    Ok(())
}

/// Stage the configuration, letting the user review it when asked
fn stage(loader: &Bootloader<'_>, config: &Config, review: bool) -> color_eyre::Result<Option<PathBuf>> {
    loader
        .create_configuration(config)
        .wrap_err(format!("Unable to generate the {} configuration", loader.kind()))?;
    let path = loader.configuration_path();
    if let (true, Some(path)) = (review, path.as_ref()) {
        edit(path)?;
    }
    Ok(path)
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(&cli)?;

    let target = cli.command.target();
    let loader = parse_loader(target.loader.as_deref())?;
    let configuration = Configuration {
        test_mode: cli.test,
        efi_support: !cli.no_efi,
        target_partition: target.partition.clone(),
        ..Default::default()
    };
    log::trace!("Using configuration: {configuration:?}");

    let system = topology::disk::builder::new()
        .build()
        .wrap_err("Unable to inspect the host block devices")
        .with_note(|| "/sys, /dev and /proc must be available")?;

    let mut config = if cli.data {
        Config::test_data()
    } else {
        Config::probe(&system, &configuration)
    };
    if config.is_live {
        log::info!("Running from a live environment, `/` is not a candidate");
    }
    select(&mut config, loader)?;

    match &cli.command {
        Commands::Status { json, .. } => {
            if *json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("{config}");
            }
        }
        Commands::Generate { edit, .. } | Commands::Install { edit, .. } => {
            if cli.data {
                return Err(eyre!("test data describes no real partitions"))
                    .with_suggestion(|| "Use `status` with --data, or drop --data");
            }
            let kind = config
                .cur_bootloader()
                .ok_or(bootsetup::Error::NoBootloader)
                .with_suggestion(|| "Name a loader, i.e. `bootsetupctl generate grub2`")?;
            let loader = Bootloader::new(kind, &system, &configuration)?;
            let staged = stage(&loader, &config, *edit)?;

            if matches!(cli.command, Commands::Generate { .. }) {
                match staged {
                    Some(path) => print!("{}", fs::read_to_string(&path)?),
                    None => log::info!("{kind} writes its own menu during install"),
                }
            } else {
                loader
                    .install(&config)
                    .wrap_err(format!("Unable to install {kind}"))
                    .with_note(|| "Every partition mounted for the install has been released")?;
                log::info!("{kind} installed");
            }
        }
    }

    Ok(())
}
