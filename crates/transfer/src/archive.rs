//! Building the deploy archive from a project tree.

use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use linkdeploy_protocol::DeploymentConfig;
use linkdeploy_protocol::constants::{ARCHIVE_NAME, DESCRIPTOR_NAME};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::TransferError;
use crate::checksum::checksum_bytes;
use crate::filter::PathFilter;

/// An immutable, compressed project archive with its digest.
///
/// The digest is computed once, at construction.
#[derive(Debug, Clone)]
pub struct ArchiveBlob {
    bytes: Vec<u8>,
    digest: String,
    entries: Vec<String>,
}

impl ArchiveBlob {
    fn new(bytes: Vec<u8>, entries: Vec<String>) -> Self {
        let digest = checksum_bytes(&bytes);
        Self {
            bytes,
            digest,
            entries,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Lowercase hex SHA-256 of [`bytes`](Self::bytes).
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Relative paths packed into the archive, in packing order.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

/// Packs `source` into a gzip'd tar according to the config's filters.
///
/// The descriptor (`config.json`) is always packed. Any other file is
/// packed when it passes [`PathFilter::matches`]. A stale staging archive
/// lying in the tree is never packed. Entries are walked in file-name
/// order with normalized headers, so an unchanged tree yields identical
/// bytes.
pub fn build_archive(
    source: &Path,
    config: &DeploymentConfig,
) -> Result<ArchiveBlob, TransferError> {
    if !source.is_dir() {
        return Err(TransferError::SourceMissing(source.display().to_string()));
    }

    let filter = PathFilter::new(&config.include, &config.exclude)?;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    let mut entries = Vec::new();

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel_path = relative_posix(source, entry.path())?;

        if rel_path == ARCHIVE_NAME {
            debug!(path = %rel_path, "skipping staging archive");
            continue;
        }
        if rel_path != DESCRIPTOR_NAME && !filter.matches(&rel_path) {
            debug!(path = %rel_path, "filtered out");
            continue;
        }

        builder.append_path_with_name(entry.path(), &rel_path)?;
        entries.push(rel_path);
    }

    let bytes = builder.into_inner()?.finish()?;
    let blob = ArchiveBlob::new(bytes, entries);

    info!(
        files = blob.entries.len(),
        size = blob.size(),
        digest = %blob.digest,
        "archive built"
    );
    Ok(blob)
}

/// Relative path of `path` under `root`, with `/` separators on every host.
fn relative_posix(root: &Path, path: &Path) -> Result<String, TransferError> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| TransferError::InvalidPath(path.display().to_string()))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}
