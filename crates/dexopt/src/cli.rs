use crate::adapters;
use crate::commands;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "On-device dexopt coordinator",
    long_about = "Decides whether, when, and how installed packages get their dex \
containers compiled, driving a lower-level compiler daemon."
)]
pub struct Cli {
    #[command(flatten)]
    pub platform: PlatformArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// How the service reaches the host platform.
#[derive(Args, Debug, Clone)]
pub struct PlatformArgs {
    /// Package metadata snapshot (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    pub snapshot: Option<PathBuf>,

    /// Compiler daemon helper binary
    #[arg(long, global = true, value_name = "PATH")]
    pub daemon: Option<PathBuf>,

    /// Root of the writable data tree
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Override the storage probe's allocatable-bytes answer
    #[arg(long, global = true, value_name = "BYTES")]
    pub allocatable_bytes: Option<i64>,

    /// Device users, comma separated (default: 0)
    #[arg(long, global = true, value_name = "IDS")]
    pub users: Option<String>,

    /// System property override, repeatable (KEY=VALUE)
    #[arg(long = "prop", global = true, value_name = "KEY=VALUE")]
    pub props: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Dexopt one package
    DexoptPackage {
        pkg: String,
        /// Compiler mode, e.g. speed-profile
        #[arg(short = 'm', long)]
        mode: Option<String>,
        /// Priority class in [0, 100]
        #[arg(short = 'p', long)]
        priority: Option<i32>,
        /// Compilation reason
        #[arg(short = 'r', long, default_value = "cmdline")]
        reason: String,
        /// Redo even if artifacts are up to date
        #[arg(short = 'f', long)]
        force: bool,
        /// Include app-dropped secondary containers
        #[arg(long)]
        secondary_dex: bool,
        /// Restrict to one split
        #[arg(long, value_name = "NAME")]
        split: Option<String>,
        /// Reset to the freshly-installed state instead of compiling
        #[arg(long)]
        reset: bool,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Batch dexopt with the reason's default package selection
    DexoptPackages {
        #[arg(short = 'r', long)]
        reason: String,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Control the periodic background job
    BgDexoptJob {
        /// Schedule the periodic job
        #[arg(long)]
        enable: bool,
        /// Unschedule the periodic job
        #[arg(long)]
        disable: bool,
        /// Cancel the in-flight run
        #[arg(long)]
        cancel: bool,
    },

    /// Delete the reference and current profiles of a package
    ClearAppProfiles { pkg: String },

    /// Clear profiles and delete compiled artifacts
    ClearProfilesAndDeleteDexoptArtifacts { pkg: String },

    /// Dump a package's merged profile in text form
    DumpProfiles {
        #[arg(long)]
        dump_classes_and_methods: bool,
        pkg: String,
    },

    /// Merge a package's profiles into a snapshot file
    SnapshotAppProfile {
        pkg: String,
        #[arg(long, value_name = "NAME")]
        split: Option<String>,
        /// Where to write the snapshot (default: <pkg>.prof)
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Merge every boot-classpath-relevant profile into a snapshot file
    SnapshotBootImageProfile {
        /// Where to write the snapshot (default: boot-image.prof)
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Dump dexopt state for one package or the whole device
    Dump { pkg: Option<String> },
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        let service = adapters::build_service(&self.platform)?;
        match self.command {
            Command::DexoptPackage {
                pkg,
                mode,
                priority,
                reason,
                force,
                secondary_dex,
                split,
                reset,
                json,
            } => {
                commands::package::run(
                    &service,
                    commands::package::PackageArgs {
                        pkg,
                        mode,
                        priority,
                        reason,
                        force,
                        secondary_dex,
                        split,
                        reset,
                        json,
                    },
                )
                .await
            }
            Command::DexoptPackages { reason, json } => {
                commands::packages::run(&service, &reason, json).await
            }
            Command::BgDexoptJob {
                enable,
                disable,
                cancel,
            } => commands::bg_job::run(&service, enable, disable, cancel).await,
            Command::ClearAppProfiles { pkg } => {
                commands::profiles::clear(&service, &pkg, false).await
            }
            Command::ClearProfilesAndDeleteDexoptArtifacts { pkg } => {
                commands::profiles::clear(&service, &pkg, true).await
            }
            Command::DumpProfiles {
                dump_classes_and_methods,
                pkg,
            } => commands::profiles::dump(&service, &pkg, dump_classes_and_methods).await,
            Command::SnapshotAppProfile { pkg, split, output } => {
                commands::profiles::snapshot_app(&service, &pkg, split.as_deref(), output).await
            }
            Command::SnapshotBootImageProfile { output } => {
                commands::profiles::snapshot_boot_image(&service, output).await
            }
            Command::Dump { pkg } => commands::dump::run(&service, pkg.as_deref()).await,
        }
    }
}
