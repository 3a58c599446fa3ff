use std::path::{Component, Path};

use crate::TransferError;

/// Checks that an archive entry name lands inside the extraction root.
///
/// Entry names are judged the same way on every host: `/` and `\` both
/// separate segments, so an archive packed on Windows cannot smuggle a
/// `..\` past a Unix agent. Drive-qualified names (`C:...`) are refused
/// everywhere.
pub fn validate_archive_path(entry: &str) -> Result<(), TransferError> {
    let reject = |why: &str| Err(TransferError::InvalidPath(format!("{why}: {entry}")));

    if entry.is_empty() {
        return Err(TransferError::InvalidPath("empty entry name".into()));
    }
    if entry.starts_with(['/', '\\']) || has_drive_letter(entry) {
        return reject("absolute entry");
    }
    if entry.split(['/', '\\']).any(|segment| segment == "..") {
        return reject("entry escapes the archive root");
    }

    // Host-specific forms the segment scan cannot see.
    for component in Path::new(entry).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return reject("entry escapes the archive root"),
            Component::RootDir | Component::Prefix(_) => return reject("absolute entry"),
        }
    }

    Ok(())
}

fn has_drive_letter(entry: &str) -> bool {
    let bytes = entry.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
