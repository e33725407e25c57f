//! `backhaul snapshot` — inspect and create volume snapshots.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use backhaul_engine::retention::{self, RetentionPolicy, SnapshotName};
use backhaul_engine::volume::VolumeProvider;

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// List snapshots with their current retention class.
    Ls,
    /// Create a snapshot now, without pruning.
    Create,
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "SNAPSHOT")]
    name: String,
    #[tabled(rename = "DATE")]
    date: String,
    #[tabled(rename = "CLASS")]
    class: &'static str,
}

pub fn run(command: SnapshotCommand, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let volume = super::volume_for(&config)?;

    match command {
        SnapshotCommand::Ls => {
            let snapshots: Vec<SnapshotName> = volume
                .list_snapshots()
                .context("failed to list snapshots")?
                .iter()
                .filter_map(|name| SnapshotName::parse(name))
                .collect();
            let policy = RetentionPolicy::from(&config.settings);
            let today = chrono::Local::now().date_naive();
            let rows: Vec<SnapshotRow> = retention::plan(snapshots, today, &policy)
                .into_iter()
                .map(|entry| SnapshotRow {
                    name: entry.snapshot.name.clone(),
                    date: entry.snapshot.date().to_string(),
                    class: entry.class.label(),
                })
                .collect();
            if rows.is_empty() {
                println!("No snapshots.");
            } else {
                println!("{}", Table::new(rows).with(Style::blank()));
            }
        }
        SnapshotCommand::Create => {
            let existing: Vec<SnapshotName> = volume
                .list_snapshots()
                .context("failed to list snapshots")?
                .iter()
                .filter_map(|name| SnapshotName::parse(name))
                .collect();
            let name = retention::next_name(chrono::Local::now().naive_local(), &existing);
            volume
                .create_snapshot(&name)
                .with_context(|| format!("failed to create snapshot {name}"))?;
            println!("✓ created {name}");
        }
    }
    Ok(())
}
