//! Error types for backhaul-engine.

use thiserror::Error;

use backhaul_core::error::{ConfigError, LockError};
use backhaul_sources::SourceError;

/// All errors that can arise from coordination, retention, or volume
/// operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Lock acquisition failed, including fail-fast contention.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Configuration was missing or invalid. Fatal before any mutation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A plugin failed outside per-unit isolation (e.g. while listing
    /// units).
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// A volume-manager invocation failed.
    #[error("volume operation failed: {detail}")]
    Volume { detail: String },

    /// Creating or deleting one snapshot failed. Reported per snapshot;
    /// never aborts evaluation of the others.
    #[error("snapshot '{name}': {detail}")]
    Snapshot { name: String, detail: String },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn io_err(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.into(),
        source,
    }
}
