//! Project archives for the deploy link.
//!
//! The controller packs a filtered project tree into a single gzip'd tar
//! ([`build_archive`]) whose SHA-256 digest travels in the `UPLOAD` header.
//! The agent recomputes the digest while receiving ([`Digester`]) and only
//! unpacks ([`unpack_archive`]) an archive whose digest matched.

mod archive;
mod checksum;
mod extract;
mod filter;
mod validation;

pub use archive::{ArchiveBlob, build_archive};
pub use checksum::{Digester, checksum_bytes};
pub use extract::{unpack_archive, unpack_from};
pub use filter::PathFilter;
pub use validation::validate_archive_path;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source tree not found: {0}")]
    SourceMissing(String),

    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
