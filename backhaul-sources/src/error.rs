//! Error types for backhaul-sources.

use std::path::PathBuf;

use thiserror::Error;

/// All errors a source plugin can raise. Anything here is local to one
/// unit; the coordinator reports it and moves on to the next unit.
#[derive(Debug, Error)]
pub enum SourceError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// HTTP failure talking to a gateway or hosting API.
    #[error("http error: {0}")]
    Http(#[from] Box<ureq::Error>),

    /// Malformed JSON from a gateway, API, or state file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An external tool exited unsuccessfully.
    #[error("{tool} failed: {detail}")]
    Tool { tool: String, detail: String },

    /// Malformed block diff stream.
    #[error("bad diff stream: {detail}")]
    Diff { detail: String },

    /// Stored data does not match what was recorded for it. Surfaces as a
    /// scrub failure; never corrected automatically.
    #[error("integrity mismatch: {detail}")]
    Integrity { detail: String },

    /// The unit is not present in this source's manifest.
    #[error("unit '{name}' is not configured for this source")]
    UnknownUnit { name: String },
}

/// Convenience constructor for [`SourceError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SourceError {
    SourceError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn http_err(e: ureq::Error) -> SourceError {
    SourceError::Http(Box::new(e))
}
