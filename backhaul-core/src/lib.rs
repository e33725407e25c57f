//! # backhaul-core
//!
//! Domain types, configuration, run locking, and the atomic update
//! primitives shared by every Backhaul crate.
//!
//! Nothing in this crate talks to a source or an archiver backend; it is
//! the vocabulary the rest of the workspace speaks.

pub mod config;
pub mod error;
pub mod fsutil;
pub mod lock;
pub mod types;

pub use config::Config;
pub use error::{ConfigError, LockError};
pub use lock::RunLock;
pub use types::{RunReport, SourceKind, Unit, UnitName, UnitOutcome};
