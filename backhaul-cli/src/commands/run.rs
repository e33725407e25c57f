//! `backhaul run` — back up every source, then snapshot and prune.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use backhaul_core::types::{RunReport, SourceKind, UnitOutcome};
use backhaul_engine::retention::{self, RetentionPolicy};
use backhaul_engine::{coordinator, EngineError};

/// Arguments for `backhaul run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run a single source kind (default: every kind with units).
    #[arg(long, value_name = "KIND")]
    pub source: Option<String>,

    /// Skip the post-run snapshot and prune.
    #[arg(long = "no-snapshot")]
    pub no_snapshot: bool,

    /// Emit the run reports as JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn run(self, config_path: Option<&Path>) -> Result<()> {
        let config = super::load_config(config_path)?;
        super::ensure_ready(&config)?;
        let mut rng = rand::thread_rng();

        let results: Vec<Result<RunReport, EngineError>> = match &self.source {
            Some(raw) => {
                let kind: SourceKind = raw.parse().map_err(anyhow::Error::msg)?;
                let source = backhaul_sources::source_for(&config, kind);
                vec![coordinator::run_source(
                    source.as_ref(),
                    &config.settings,
                    &mut rng,
                )]
            }
            None => coordinator::run_all(&config, &mut rng),
        };

        let mut reports = Vec::new();
        let mut run_errors = 0;
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    eprintln!("{} {e}", "✗".red());
                    run_errors += 1;
                }
            }
        }

        if self.json {
            println!("{}", serde_json::to_string_pretty(&reports)?);
        } else {
            for report in &reports {
                print_report(report);
            }
        }

        if !self.no_snapshot {
            let volume = super::volume_for(&config)?;
            let policy = RetentionPolicy::from(&config.settings);
            let now = chrono::Local::now().naive_local();
            let prune = retention::snapshot_and_prune(&volume, now, &policy)
                .context("snapshot and prune failed")?;
            if !self.json {
                if let Some(name) = &prune.created {
                    println!("✓ snapshot {name} created ({} pruned)", prune.deleted.len());
                }
            }
            run_errors += prune.failed.len();
        }

        let failed_units: usize = reports.iter().map(RunReport::failed).sum();
        if failed_units > 0 || run_errors > 0 {
            bail!("{failed_units} unit(s) and {run_errors} operation(s) failed");
        }
        Ok(())
    }
}

fn print_report(report: &RunReport) {
    println!(
        "{} {} — {} ok, {} failed in {:.1}s",
        if report.failed() == 0 {
            "✓".green()
        } else {
            "✗".red()
        },
        report.kind,
        report.succeeded(),
        report.failed(),
        report.elapsed_secs,
    );
    for unit in &report.units {
        let glyph = match &unit.outcome {
            UnitOutcome::Success { .. } => "·".normal(),
            UnitOutcome::ScrubFailed { .. } => "‼".red().bold(),
            _ => "✗".red(),
        };
        let label = if unit.scrubbed { " (scrub)" } else { "" };
        println!("  {glyph}  {}{label}: {}", unit.unit, unit.outcome);
    }
}
