//! Unpacking a verified archive into the deploy directory.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::TransferError;
use crate::validation::validate_archive_path;

/// Unpacks the gzip'd tar at `archive` into `dest`.
///
/// Returns the number of entries written.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<usize, TransferError> {
    let file = File::open(archive)?;
    unpack_from(BufReader::new(file), dest)
}

/// Unpacks a gzip'd tar stream into `dest`.
///
/// Every entry path is validated before anything is written for it.
/// Absolute paths, `..` traversal and link entries abort the extraction;
/// entries already written stay on disk.
pub fn unpack_from<R: Read>(reader: R, dest: &Path) -> Result<usize, TransferError> {
    std::fs::create_dir_all(dest)?;

    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        validate_archive_path(&path)?;

        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            return Err(TransferError::InvalidPath(format!(
                "link entries not allowed: {path}"
            )));
        }

        if !entry.unpack_in(dest)? {
            return Err(TransferError::InvalidPath(format!(
                "entry escapes destination: {path}"
            )));
        }
        debug!(%path, "extracted");
        count += 1;
    }

    info!(entries = count, dest = %dest.display(), "archive extracted");
    Ok(count)
}
