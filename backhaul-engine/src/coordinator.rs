//! Run coordination: one source type, one lock, one bounded worker pool.
//!
//! A run acquires the source type's lock (failing fast when another
//! invocation holds it), resolves the unit list, draws each unit's action
//! from the scrub scheduler up front, and dispatches the units across
//! `<label>-workers` OS threads pulling from a shared queue. A unit's
//! failure is recorded and never aborts its siblings; the aggregate
//! report distinguishes degraded runs from total failure.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use rand::Rng;

use backhaul_core::config::{Config, Settings};
use backhaul_core::lock::RunLock;
use backhaul_core::types::{RunReport, Unit, UnitOutcome, UnitReport};
use backhaul_sources::{self as sources, JobContext, Source};

use crate::error::EngineError;
use crate::scheduler::{self, UnitAction};

/// Execute one run for `source`, returning the aggregate report. Holds
/// the source type's run lock for the duration.
pub fn run_source<R: Rng>(
    source: &dyn Source,
    settings: &Settings,
    rng: &mut R,
) -> Result<RunReport, EngineError> {
    let kind = source.kind();
    let _lock = RunLock::acquire(&settings.root, kind.label())?;

    let units = source.list_units();
    let ctx = JobContext::from_settings(settings);
    let scrub_p = settings.scrub_probability_for(kind);
    let full_p = settings.full_probability_for(kind);

    // Draw every unit's action before dispatch; decisions are independent,
    // and keeping the RNG on this thread keeps it injectable.
    let queue: Mutex<VecDeque<(Unit, UnitAction)>> = Mutex::new(
        units
            .into_iter()
            .map(|unit| (unit, scheduler::plan_unit(rng, scrub_p, full_p)))
            .collect(),
    );
    let results: Mutex<Vec<UnitReport>> = Mutex::new(Vec::new());

    let worker_count = settings
        .workers_for(kind)
        .min(queue.lock().unwrap().len().max(1));
    let started = Utc::now();
    let run_timer = Instant::now();

    tracing::info!(%kind, workers = worker_count, "starting run");
    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| worker_loop(source, &ctx, &queue, &results));
        }
    });

    let mut units = results.into_inner().unwrap();
    units.sort_by(|a, b| a.unit.relroot.cmp(&b.unit.relroot));
    let mut report = RunReport::new(kind, started, run_timer.elapsed());
    report.units = units;
    tracing::info!(
        %kind,
        succeeded = report.succeeded(),
        failed = report.failed(),
        "run finished"
    );
    Ok(report)
}

fn worker_loop(
    source: &dyn Source,
    ctx: &JobContext,
    queue: &Mutex<VecDeque<(Unit, UnitAction)>>,
    results: &Mutex<Vec<UnitReport>>,
) {
    loop {
        let Some((unit, action)) = queue.lock().unwrap().pop_front() else {
            return;
        };
        let scrubbed = action.is_scrub();
        tracing::info!(unit = %unit, scrub = scrubbed, "starting unit");
        let unit_timer = Instant::now();
        let outcome = match action {
            UnitAction::Scrub => source.scrub(&unit, ctx),
            UnitAction::Backup(depth) => source.backup(&unit, ctx, depth),
        }
        .unwrap_or_else(|e| UnitOutcome::TransferFailed {
            reason: e.to_string(),
        });
        let elapsed = unit_timer.elapsed();
        match &outcome {
            UnitOutcome::Success { .. } => {
                tracing::info!(unit = %unit, ?elapsed, "unit finished: {outcome}")
            }
            _ => tracing::error!(unit = %unit, ?elapsed, "unit failed: {outcome}"),
        }
        results.lock().unwrap().push(UnitReport {
            unit,
            scrubbed,
            outcome,
            elapsed_secs: elapsed.as_secs_f64(),
        });
    }
}

/// Run every source kind that has configured units, in a stable order.
/// Each kind takes (and releases) its own lock; a lock held elsewhere
/// fails that kind's run without affecting the others.
pub fn run_all<R: Rng>(config: &Config, rng: &mut R) -> Vec<Result<RunReport, EngineError>> {
    sources::registry(config)
        .iter()
        .filter(|source| !source.list_units().is_empty())
        .map(|source| run_source(source.as_ref(), &config.settings, rng))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
