//! `backhaul archive` — offsite archive sets.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use backhaul_archive::lifecycle::{self, ArchiveOutcome};
use backhaul_archive::{backend_for, cost, Packer};
use backhaul_core::fsutil::humanize_size;
use backhaul_core::lock::RunLock;
use backhaul_core::types::Unit;
use backhaul_engine::retention::SnapshotName;
use backhaul_engine::volume::VolumeProvider;

const GIB: f64 = (1u64 << 30) as f64;

/// Arguments for `backhaul archive`.
#[derive(Args, Debug)]
pub struct ArchiveArgs {
    /// Archiver profile from the `archivers:` config section.
    #[arg(short = 'p', long, default_value = "default", global = true)]
    pub profile: String,

    #[command(subcommand)]
    pub command: ArchiveCommand,
}

#[derive(Subcommand, Debug)]
pub enum ArchiveCommand {
    /// Package and upload every unit as of a snapshot (default: latest).
    /// Units already archived for that snapshot are skipped, so rerunning
    /// resumes an interrupted pass.
    Run {
        /// Snapshot name; defaults to the most recent snapshot.
        snapshot: Option<String>,
    },

    /// List archive sets.
    Ls {
        /// One line per snapshot instead of per set.
        #[arg(long)]
        sets: bool,
    },

    /// Delete archive sets beyond keep-count whose protection elapsed.
    Prune {
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Download one archive set, verified, optionally rate-limited.
    Retrieve {
        snapshot: String,
        unit: String,
        dest_dir: PathBuf,
        /// Bandwidth budget in GiB per hour.
        #[arg(long, value_name = "GIB")]
        rate_gb_hour: Option<f64>,
    },

    /// Estimate the retrieval cost of a download at a given pace.
    Cost {
        /// Data volume in GiB.
        #[arg(long)]
        gb: f64,
        /// Retrieval pace in GiB per hour.
        #[arg(long, value_name = "GIB")]
        rate_gb_hour: f64,
    },
}

#[derive(Tabled)]
struct SetRow {
    #[tabled(rename = "UNIT")]
    unit: String,
    #[tabled(rename = "SNAPSHOT")]
    snapshot: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "CREATED")]
    created: String,
    #[tabled(rename = "PROTECTED-UNTIL")]
    protected_until: String,
}

impl ArchiveArgs {
    pub fn run(self, config_path: Option<&Path>) -> Result<()> {
        let config = super::load_config(config_path)?;
        let profile = config.archiver(&self.profile)?.clone();
        let backend = backend_for(&profile)?;

        match self.command {
            ArchiveCommand::Run { snapshot } => {
                super::ensure_ready(&config)?;
                let volume = super::volume_for(&config)?;
                let _lock = RunLock::acquire(&config.settings.root, "archive")?;

                let snapshot = match snapshot {
                    Some(name) => name,
                    None => latest_snapshot(&volume)?,
                };
                let packer = Packer::from_settings(&config.settings)?;
                let mountpoint = config.settings.root.join("Snapshots").join(&snapshot);
                volume
                    .mount_snapshot(&snapshot, &mountpoint)
                    .with_context(|| format!("failed to mount snapshot {snapshot}"))?;

                let units: Vec<Unit> = backhaul_sources::registry(&config)
                    .iter()
                    .flat_map(|source| source.list_units())
                    .collect();
                let result = lifecycle::archive_snapshot(
                    &units,
                    &snapshot,
                    &mountpoint,
                    &packer,
                    backend.as_ref(),
                    profile.protected_days,
                    profile.workers,
                );
                let unmount = volume.unmount_snapshot(&snapshot, &mountpoint);
                let report = result?;
                unmount.with_context(|| format!("failed to unmount snapshot {snapshot}"))?;

                for (unit, outcome) in &report.outcomes {
                    match outcome {
                        ArchiveOutcome::Archived { size } => {
                            println!("  ✎  {unit} ({})", humanize_size(*size))
                        }
                        ArchiveOutcome::AlreadyArchived => println!("  ·  {unit} (already)"),
                        ArchiveOutcome::NoData => println!("  ·  {unit} (no data)"),
                        ArchiveOutcome::Failed { reason } => println!("  ✗  {unit}: {reason}"),
                    }
                }
                println!(
                    "✓ snapshot {snapshot}: {} archived, {} failed",
                    report.archived(),
                    report.failed()
                );
                if report.failed() > 0 {
                    bail!("archiving failed for {} unit(s); rerun to resume", report.failed());
                }
            }

            ArchiveCommand::Ls { sets } => {
                let records = lifecycle::index(backend.as_ref())?;
                if sets {
                    let mut by_snapshot: Vec<(String, usize, u64)> = Vec::new();
                    for record in &records {
                        match by_snapshot.iter_mut().find(|(s, _, _)| *s == record.snapshot) {
                            Some((_, count, size)) => {
                                *count += 1;
                                *size += record.size;
                            }
                            None => by_snapshot.push((record.snapshot.clone(), 1, record.size)),
                        }
                    }
                    by_snapshot.sort();
                    for (snapshot, count, size) in by_snapshot {
                        println!("{snapshot} {count:5} {:>10}", humanize_size(size));
                    }
                } else {
                    let rows: Vec<SetRow> = records
                        .into_iter()
                        .map(|r| SetRow {
                            unit: r.unit,
                            snapshot: r.snapshot,
                            size: humanize_size(r.size),
                            created: r.created.format("%Y-%m-%d").to_string(),
                            protected_until: r.protected_until.format("%Y-%m-%d").to_string(),
                        })
                        .collect();
                    if rows.is_empty() {
                        println!("No archive sets.");
                    } else {
                        println!("{}", Table::new(rows).with(Style::blank()));
                    }
                }
            }

            ArchiveCommand::Prune { dry_run } => {
                let report = lifecycle::prune_all(
                    backend.as_ref(),
                    profile.keep_count,
                    chrono::Utc::now(),
                    dry_run,
                )?;
                let verb = if dry_run { "would delete" } else { "deleted" };
                for record in &report.deleted {
                    println!("  {verb} {} @ {}", record.unit, record.snapshot);
                }
                println!(
                    "✓ {} set(s) {verb}, {} kept ({} still protected)",
                    report.deleted.len(),
                    report.kept,
                    report.still_protected
                );
                for (key, error) in &report.failed {
                    eprintln!("✗ {key}: {error}");
                }
                if !report.failed.is_empty() {
                    bail!("{} deletion(s) failed", report.failed.len());
                }
            }

            ArchiveCommand::Retrieve {
                snapshot,
                unit,
                dest_dir,
                rate_gb_hour,
            } => {
                let rate = rate_gb_hour.map(|g| (g * GIB) as u64);
                let (path, info) = lifecycle::retrieve(
                    backend.as_ref(),
                    &unit,
                    &snapshot,
                    &dest_dir,
                    rate,
                )?;
                println!(
                    "✓ retrieved {} ({}, {})",
                    path.display(),
                    humanize_size(info.size),
                    info.encryption
                );
            }

            ArchiveCommand::Cost { gb, rate_gb_hour } => {
                let bytes = (gb * GIB) as u64;
                let rate = (rate_gb_hour * GIB) as u64;
                let estimate = cost::estimate_cost(bytes, rate, profile.price_per_gb_month);
                let hours = cost::retrieval_hours(bytes, rate);
                println!(
                    "Retrieving {} at {rate_gb_hour} GiB/hour takes {hours:.1} hour(s) \
                     and costs about ${estimate:.2}.",
                    humanize_size(bytes)
                );
            }
        }
        Ok(())
    }
}

fn latest_snapshot(volume: &dyn VolumeProvider) -> Result<String> {
    let mut snapshots: Vec<SnapshotName> = volume
        .list_snapshots()
        .context("failed to list snapshots")?
        .iter()
        .filter_map(|name| SnapshotName::parse(name))
        .collect();
    snapshots.sort();
    snapshots
        .pop()
        .map(|s| s.name)
        .context("no snapshots exist; run a backup first")
}
