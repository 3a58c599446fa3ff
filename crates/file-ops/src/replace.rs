//! Guarded remove-and-recreate of the deploy directory.

use std::path::{Component, Path};

use crate::FileOpsError;

/// Empties the deploy directory by removing it and creating it again.
///
/// Safety checks:
/// 1. Path must not be empty.
/// 2. Path must not be a filesystem root.
/// 3. Path must not be the user's home directory.
/// 4. An existing path must be a directory.
pub fn replace_directory(path: &Path) -> Result<(), FileOpsError> {
    let home = crate::home_dir();
    replace_directory_with_home(path, &home)
}

/// Inner implementation that accepts a home directory for testability.
fn replace_directory_with_home(path: &Path, home: &Path) -> Result<(), FileOpsError> {
    let unsafe_path = |reason| FileOpsError::Unsafe {
        path: path.display().to_string(),
        reason,
    };

    if path.as_os_str().is_empty() {
        return Err(unsafe_path("empty path"));
    }
    if is_root(path) {
        return Err(unsafe_path("filesystem root"));
    }

    let home_canon = std::fs::canonicalize(home).unwrap_or_else(|_| home.to_path_buf());

    if path.exists() {
        let abs = std::fs::canonicalize(path)
            .map_err(|e| FileOpsError::io("failed to resolve", path, e))?;
        if is_root(&abs) {
            return Err(unsafe_path("filesystem root"));
        }
        if abs == home_canon {
            return Err(unsafe_path("home directory"));
        }
        if !abs.is_dir() {
            return Err(FileOpsError::NotADirectory(abs.display().to_string()));
        }

        std::fs::remove_dir_all(&abs).map_err(|e| FileOpsError::io("failed to remove", &abs, e))?;
        tracing::debug!(path = %abs.display(), "removed previous deployment");
    } else if path == home || path == home_canon {
        return Err(unsafe_path("home directory"));
    }

    std::fs::create_dir_all(path).map_err(|e| FileOpsError::io("failed to create", path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| FileOpsError::io("failed to chmod", path, e))?;
    }

    tracing::info!(path = %path.display(), "deploy directory ready");
    Ok(())
}

/// True for `/`, `C:\` and other paths made only of a prefix and root.
fn is_root(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
}
