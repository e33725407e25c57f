//! `backhaul prune` — retention pass without a new snapshot.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;

use backhaul_engine::retention::{self, RetentionPolicy, SnapshotName};
use backhaul_engine::volume::VolumeProvider;

/// Arguments for `backhaul prune`.
#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Print the snapshots that would be removed without removing them.
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

impl PruneArgs {
    pub fn run(self, config_path: Option<&Path>) -> Result<()> {
        let config = super::load_config(config_path)?;
        super::ensure_ready(&config)?;
        let volume = super::volume_for(&config)?;
        let policy = RetentionPolicy::from(&config.settings);
        let today = chrono::Local::now().date_naive();

        if self.dry_run {
            let snapshots: Vec<SnapshotName> = volume
                .list_snapshots()
                .context("failed to list snapshots")?
                .iter()
                .filter_map(|name| SnapshotName::parse(name))
                .collect();
            for entry in retention::plan(snapshots, today, &policy) {
                if !entry.class.keeps() {
                    println!("{} ({})", entry.snapshot, entry.class.label());
                }
            }
            return Ok(());
        }

        let report = retention::prune(&volume, today, &policy).context("prune failed")?;
        println!(
            "✓ {} snapshot(s) deleted, {} kept",
            report.deleted.len(),
            report.kept
        );
        for (name, error) in &report.failed {
            eprintln!("✗ {name}: {error}");
        }

        let removed =
            retention::prune_logs(&config.settings.log_root(), config.settings.gc_log_distinct_days)
                .context("log pruning failed")?;
        if removed > 0 {
            println!("✓ {removed} old log file(s) removed");
        }

        if report.failed.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("{} snapshot deletion(s) failed", report.failed.len())
        }
    }
}
