//! Probabilistic scrub scheduling.
//!
//! Per unit per run, two independent uniform draws decide what happens:
//! first whether to scrub instead of backing up, then (for backups)
//! whether to force a full resynchronization. Nothing is persisted; the
//! decisions are independent across units and across runs. The RNG is a
//! parameter so tests can pin the outcome with a seeded generator.

use rand::Rng;

use backhaul_sources::Depth;

/// What one unit does this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitAction {
    Backup(Depth),
    Scrub,
}

impl UnitAction {
    pub fn is_scrub(self) -> bool {
        matches!(self, UnitAction::Scrub)
    }
}

/// One uniform draw against `probability`.
pub fn random_do_work<R: Rng>(rng: &mut R, probability: f64) -> bool {
    rng.gen::<f64>() < probability
}

/// Decide a unit's action for this run.
pub fn plan_unit<R: Rng>(rng: &mut R, scrub_probability: f64, full_probability: f64) -> UnitAction {
    if random_do_work(rng, scrub_probability) {
        UnitAction::Scrub
    } else if random_do_work(rng, full_probability) {
        UnitAction::Backup(Depth::Full)
    } else {
        UnitAction::Backup(Depth::Incremental)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn probability_zero_never_scrubs() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            assert!(!plan_unit(&mut rng, 0.0, 0.0).is_scrub());
        }
    }

    #[test]
    fn probability_one_always_scrubs() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            assert!(plan_unit(&mut rng, 1.0, 0.0).is_scrub());
        }
    }

    #[test]
    fn full_probability_one_always_full() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            assert_eq!(
                plan_unit(&mut rng, 0.0, 1.0),
                UnitAction::Backup(Depth::Full)
            );
        }
    }

    #[test]
    fn intermediate_probability_hits_roughly_expected_rate() {
        let mut rng = StdRng::seed_from_u64(42);
        let scrubs = (0..10_000)
            .filter(|_| plan_unit(&mut rng, 0.1, 0.0).is_scrub())
            .count();
        assert!((800..1200).contains(&scrubs), "got {scrubs} scrubs");
    }

    #[test]
    fn seeded_rng_is_deterministic() {
        let run = || {
            let mut rng = StdRng::seed_from_u64(123);
            (0..50)
                .map(|_| plan_unit(&mut rng, 0.3, 0.5))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
