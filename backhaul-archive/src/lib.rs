//! # backhaul-archive
//!
//! The offsite archiving pipeline: per-unit tar packaging with optional
//! sign-then-encrypt, upload to an archiver backend, an independent
//! retention policy (protection window + keep-count) per archive set,
//! and a cost-aware, rate-limited retrieval path.

pub mod backend;
pub mod cost;
pub mod error;
pub mod lifecycle;
pub mod packer;

pub use backend::{backend_for, ArchiveRecord, ArchiverBackend};
pub use error::ArchiveError;
pub use packer::{ArchiveInfo, Packer};
