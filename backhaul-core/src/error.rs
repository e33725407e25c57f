//! Error types for backhaul-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// Configuration errors are fatal: they abort the invocation before any
/// mutation of the backup tree.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with the offending file path.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A setting required by the requested operation is absent.
    #[error("missing required setting '{key}'")]
    MissingSetting { key: String },

    /// `dirs::home_dir()` returned `None` — cannot locate `~/.backhaul.yaml`.
    #[error("cannot determine home directory; set $HOME or pass --config")]
    HomeNotFound,
}

/// Errors raised while acquiring the per-source-type run lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another invocation holds this source type's lock. Fail fast; the
    /// caller must not retry within the same invocation.
    #[error("another '{name}' run is already in progress")]
    AlreadyRunning { name: String },

    /// The backup root is not a mounted filesystem of its own.
    #[error("backup filesystem is not mounted at {path}")]
    NotMounted { path: PathBuf },

    /// I/O failure creating or locking the lock file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn config_io(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn lock_io(path: impl Into<PathBuf>, source: std::io::Error) -> LockError {
    LockError::Io {
        path: path.into(),
        source,
    }
}
