//! Snapshot retention engine.
//!
//! After every run the engine creates one snapshot of the whole backup
//! volume, then evaluates the full snapshot history against a three-tier
//! keep policy. Each tier is computed independently and the results are
//! unioned — a snapshot survives if *any* tier keeps it:
//!
//! - **recent**: everything younger than `gc-duplicate-days`;
//! - **daily**: the latest snapshot of each calendar day, for
//!   `gc-daily-weeks` weeks;
//! - **weekly**: the latest snapshot of each ISO week, for
//!   `gc-weekly-months` 28-day months.
//!
//! Anything older than all tiers is discarded unconditionally. Planning
//! is a pure function of snapshot timestamps and the current date, so
//! re-running with no new snapshots deletes nothing further.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};

use backhaul_core::config::Settings;

use crate::error::{io_err, EngineError};
use crate::volume::VolumeProvider;

const STAMP_FMT: &str = "%Y%m%d-%H%M%S";

// ---------------------------------------------------------------------------
// Snapshot names
// ---------------------------------------------------------------------------

/// A parsed snapshot name: `YYYYMMDD-HHMMSS` with an optional `-N`
/// revision suffix appended when two snapshots land in the same second.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotName {
    pub name: String,
    pub stamp: NaiveDateTime,
    pub revision: u32,
}

impl SnapshotName {
    /// Parse a snapshot name; `None` for names this engine did not mint.
    pub fn parse(name: &str) -> Option<SnapshotName> {
        let mut parts = name.splitn(3, '-');
        let date = NaiveDate::parse_from_str(parts.next()?, "%Y%m%d").ok()?;
        let time = NaiveTime::parse_from_str(parts.next()?, "%H%M%S").ok()?;
        let revision = match parts.next() {
            Some(rev) => rev.parse().ok()?,
            None => 0,
        };
        Some(SnapshotName {
            name: name.to_owned(),
            stamp: date.and_time(time),
            revision,
        })
    }

    pub fn date(&self) -> NaiveDate {
        self.stamp.date()
    }

    fn week_key(&self) -> (i32, u32) {
        let week = self.date().iso_week();
        (week.year(), week.week())
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Ord for SnapshotName {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.stamp, self.revision).cmp(&(other.stamp, other.revision))
    }
}

impl PartialOrd for SnapshotName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Mint the next snapshot name for `now`, suffixing a revision when the
/// second is already taken.
pub fn next_name(now: NaiveDateTime, existing: &[SnapshotName]) -> String {
    let base = now.format(STAMP_FMT).to_string();
    let taken: Vec<&SnapshotName> = existing.iter().filter(|s| s.stamp == now).collect();
    if taken.is_empty() {
        return base;
    }
    let next_rev = taken.iter().map(|s| s.revision).max().unwrap_or(0) + 1;
    format!("{base}-{next_rev}")
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub duplicate_days: u32,
    pub daily_weeks: u32,
    pub weekly_months: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            duplicate_days: 14,
            daily_weeks: 8,
            weekly_months: 12,
        }
    }
}

impl From<&Settings> for RetentionPolicy {
    fn from(settings: &Settings) -> Self {
        RetentionPolicy {
            duplicate_days: settings.gc_duplicate_days,
            daily_weeks: settings.gc_daily_weeks,
            weekly_months: settings.gc_weekly_months,
        }
    }
}

/// Why a snapshot is kept, or why it is not. Derived on every evaluation,
/// never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionClass {
    /// Younger than the duplicate window; kept unconditionally.
    Recent,
    /// The latest snapshot of its calendar day within the daily window.
    Daily,
    /// The latest snapshot of its ISO week within the weekly window.
    Weekly,
    /// Superseded by a later snapshot of the same day; discarded.
    DayDuplicate,
    /// Older than every tier; discarded.
    Expired,
}

impl RetentionClass {
    pub fn keeps(self) -> bool {
        matches!(
            self,
            RetentionClass::Recent | RetentionClass::Daily | RetentionClass::Weekly
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            RetentionClass::Recent => "recent",
            RetentionClass::Daily => "daily",
            RetentionClass::Weekly => "weekly",
            RetentionClass::DayDuplicate => "day-duplicate",
            RetentionClass::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedSnapshot {
    pub snapshot: SnapshotName,
    pub class: RetentionClass,
}

/// Classify every snapshot for `today`. Input order does not matter;
/// output is oldest first.
pub fn plan(
    mut snapshots: Vec<SnapshotName>,
    today: NaiveDate,
    policy: &RetentionPolicy,
) -> Vec<PlannedSnapshot> {
    snapshots.sort();

    let dup_cutoff = today - Duration::days(policy.duplicate_days as i64);
    let daily_cutoff = today - Duration::days(policy.daily_weeks as i64 * 7);
    let weekly_cutoff = today - Duration::days(policy.weekly_months as i64 * 28);

    let classes: Vec<RetentionClass> = {
        let mut latest_of_day: HashMap<NaiveDate, &SnapshotName> = HashMap::new();
        let mut latest_of_week: HashMap<(i32, u32), &SnapshotName> = HashMap::new();
        for snapshot in &snapshots {
            latest_of_day
                .entry(snapshot.date())
                .and_modify(|cur| {
                    if snapshot > *cur {
                        *cur = snapshot;
                    }
                })
                .or_insert(snapshot);
            latest_of_week
                .entry(snapshot.week_key())
                .and_modify(|cur| {
                    if snapshot > *cur {
                        *cur = snapshot;
                    }
                })
                .or_insert(snapshot);
        }

        snapshots
            .iter()
            .map(|snapshot| {
                let date = snapshot.date();
                let day_latest = latest_of_day[&date] == snapshot;
                let week_latest = latest_of_week[&snapshot.week_key()] == snapshot;
                if date >= dup_cutoff {
                    RetentionClass::Recent
                } else if date >= daily_cutoff && day_latest {
                    RetentionClass::Daily
                } else if date >= weekly_cutoff && week_latest {
                    RetentionClass::Weekly
                } else if date >= daily_cutoff {
                    RetentionClass::DayDuplicate
                } else {
                    RetentionClass::Expired
                }
            })
            .collect()
    };
    snapshots
        .into_iter()
        .zip(classes)
        .map(|(snapshot, class)| PlannedSnapshot { snapshot, class })
        .collect()
}

// ---------------------------------------------------------------------------
// Drivers
// ---------------------------------------------------------------------------

/// What one retention pass did.
#[derive(Debug, Default)]
pub struct PruneReport {
    pub created: Option<String>,
    pub kept: usize,
    pub deleted: Vec<String>,
    /// `(snapshot, error)` pairs; a failed deletion never aborts the rest.
    pub failed: Vec<(String, String)>,
}

fn parse_listing(volume: &dyn VolumeProvider) -> Result<Vec<SnapshotName>, EngineError> {
    let mut snapshots = Vec::new();
    for name in volume.list_snapshots()? {
        match SnapshotName::parse(&name) {
            Some(parsed) => snapshots.push(parsed),
            None => tracing::warn!(name, "ignoring snapshot with foreign name"),
        }
    }
    Ok(snapshots)
}

/// Create a snapshot for `now`, then prune per policy.
pub fn snapshot_and_prune(
    volume: &dyn VolumeProvider,
    now: NaiveDateTime,
    policy: &RetentionPolicy,
) -> Result<PruneReport, EngineError> {
    let existing = parse_listing(volume)?;
    let name = next_name(now, &existing);
    let mut report = PruneReport::default();
    match volume.create_snapshot(&name) {
        Ok(()) => {
            tracing::info!(snapshot = %name, "created snapshot");
            report.created = Some(name);
        }
        Err(e) => {
            tracing::error!(snapshot = %name, "snapshot creation failed: {e}");
            report.failed.push((name, e.to_string()));
        }
    }
    prune_into(volume, now.date(), policy, report)
}

/// Re-evaluate and prune without creating a snapshot.
pub fn prune(
    volume: &dyn VolumeProvider,
    today: NaiveDate,
    policy: &RetentionPolicy,
) -> Result<PruneReport, EngineError> {
    prune_into(volume, today, policy, PruneReport::default())
}

fn prune_into(
    volume: &dyn VolumeProvider,
    today: NaiveDate,
    policy: &RetentionPolicy,
    mut report: PruneReport,
) -> Result<PruneReport, EngineError> {
    let planned = plan(parse_listing(volume)?, today, policy);
    for entry in planned {
        if entry.class.keeps() {
            report.kept += 1;
            continue;
        }
        match volume.delete_snapshot(&entry.snapshot.name) {
            Ok(()) => {
                tracing::info!(snapshot = %entry.snapshot, class = entry.class.label(),
                    "deleted snapshot");
                report.deleted.push(entry.snapshot.name);
            }
            Err(e) => {
                tracing::error!(snapshot = %entry.snapshot, "deletion failed: {e}");
                report.failed.push((entry.snapshot.name, e.to_string()));
            }
        }
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Log pruning
// ---------------------------------------------------------------------------

/// Trim every log directory under `log_root` to its most recent
/// `distinct_days` distinct day-stems. Returns the number of files
/// removed.
pub fn prune_logs(log_root: &Path, distinct_days: usize) -> Result<usize, EngineError> {
    if !log_root.exists() {
        return Ok(0);
    }
    prune_log_dir(log_root, distinct_days)
}

fn prune_log_dir(dir: &Path, distinct_days: usize) -> Result<usize, EngineError> {
    let mut removed = 0;
    let mut files: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        if entry.file_type().map_err(|e| io_err(&path, e))?.is_dir() {
            removed += prune_log_dir(&path, distinct_days)?;
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            files.push(name.to_owned());
        }
    }

    files.sort_unstable_by(|a, b| b.cmp(a));
    let mut days: Vec<String> = Vec::new();
    for name in files {
        let day = name.split('.').next().unwrap_or(&name).to_owned();
        if days.contains(&day) {
            continue;
        }
        if days.len() < distinct_days {
            days.push(day);
            continue;
        }
        let path = dir.join(&name);
        std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
        removed += 1;
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
