//! Backhaul — multi-source backup orchestration CLI.
//!
//! # Usage
//!
//! ```text
//! backhaul run [--source <kind>] [--no-snapshot] [--json]
//! backhaul prune [--dry-run]
//! backhaul snapshot ls
//! backhaul snapshot create
//! backhaul archive [-p <profile>] run [snapshot]
//! backhaul archive [-p <profile>] ls [--sets]
//! backhaul archive [-p <profile>] prune [--dry-run]
//! backhaul archive [-p <profile>] retrieve <snapshot> <unit> <dest-dir>
//! backhaul archive [-p <profile>] cost --gb <n> --rate-gb-hour <n>
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    archive::ArchiveArgs, prune::PruneArgs, run::RunArgs, snapshot::SnapshotCommand,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "backhaul",
    version,
    about = "Pull heterogeneous sources into one snapshotted backup tree",
    long_about = None,
)]
struct Cli {
    /// Config file path (default: ~/.backhaul.yaml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Back up (or scrub) all units, then snapshot and prune the volume.
    Run(RunArgs),

    /// Delete snapshots no longer covered by the retention policy.
    Prune(PruneArgs),

    /// Inspect and manage backup-volume snapshots.
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },

    /// Create, list, prune, and retrieve offsite archive sets.
    Archive(ArchiveArgs),
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_env("BACKHAUL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run(cli.config.as_deref()),
        Commands::Prune(args) => args.run(cli.config.as_deref()),
        Commands::Snapshot { command } => commands::snapshot::run(command, cli.config.as_deref()),
        Commands::Archive(args) => args.run(cli.config.as_deref()),
    }
}
