//! Error types for backhaul-archive.

use std::path::PathBuf;

use thiserror::Error;

use backhaul_core::error::ConfigError;

/// All errors that can arise from packing, uploading, pruning, or
/// retrieving archive sets.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Configuration was missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A packing subprocess (tar or gpg) exited unsuccessfully.
    #[error("{stage} exited with {code:?}")]
    PipelineFailed { stage: String, code: Option<i32> },

    /// Upload to the backend failed. No metadata record exists for the
    /// attempt, so the next archiving pass retries it from scratch.
    #[error("upload failed for {key}: {detail}")]
    Upload { key: String, detail: String },

    /// Backend HTTP failure outside the upload path.
    #[error("backend error: {0}")]
    Backend(#[from] Box<ureq::Error>),

    /// Record (de)serialization failure.
    #[error("record JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No archive set exists for the requested unit + snapshot.
    #[error("no archive of {unit} for snapshot {snapshot}")]
    NoSuchArchive { unit: String, snapshot: String },

    /// A retrieved blob does not match its record.
    #[error("retrieved archive failed verification: {detail}")]
    Verification { detail: String },

    /// The record's encryption mode differs from local settings; the
    /// archive is not unpacked.
    #[error("archive encryption '{record}' does not match local settings '{local}'")]
    EncryptionMismatch { record: String, local: String },

    /// Refusing to overwrite an existing output file.
    #[error("output file already exists: {path}")]
    OutputExists { path: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ArchiveError {
    ArchiveError::Io {
        path: path.into(),
        source,
    }
}
