//! # backhaul-engine
//!
//! The orchestration core: per-source-type run coordination over a
//! bounded worker pool, the probabilistic scrub scheduler, and the
//! snapshot retention engine with its volume-provider boundary.

pub mod coordinator;
pub mod error;
pub mod retention;
pub mod scheduler;
pub mod volume;

pub use coordinator::{run_all, run_source};
pub use error::EngineError;
pub use retention::{RetentionPolicy, SnapshotName};
pub use volume::VolumeProvider;
