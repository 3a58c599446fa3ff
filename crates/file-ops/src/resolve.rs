//! Deploy directory and entry-point resolution.

use std::path::{Path, PathBuf};

use crate::FileOpsError;

/// Resolves the deploy directory for a descriptor.
///
/// Priority: the descriptor's `directory` (with `~` expanded; relative
/// paths are anchored at `app_dir`) > `app_dir` itself.
pub fn resolve_deploy_dir(directory: Option<&str>, app_dir: &Path) -> PathBuf {
    match directory.map(str::trim) {
        Some(dir) if !dir.is_empty() => {
            let expanded = expand_home(dir);
            if expanded.is_absolute() {
                expanded
            } else {
                app_dir.join(expanded)
            }
        }
        _ => app_dir.to_path_buf(),
    }
}

/// Resolves `main` under `deploy_dir` and checks that it is a file.
pub fn resolve_entry_point(deploy_dir: &Path, main: &str) -> Result<PathBuf, FileOpsError> {
    let main = main.trim();
    if main.is_empty() {
        return Err(FileOpsError::EntryPointMissing(
            deploy_dir.display().to_string(),
        ));
    }

    let path = deploy_dir.join(main);
    if !path.is_file() {
        return Err(FileOpsError::EntryPointMissing(path.display().to_string()));
    }
    Ok(path)
}

/// Sets a file as executable (Unix only, 755).
pub fn set_executable(path: &Path) -> Result<(), FileOpsError> {
    if !path.exists() {
        return Err(FileOpsError::EntryPointMissing(path.display().to_string()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| FileOpsError::io("chmod", path, e))?;
    }

    Ok(())
}

/// Expands a `~` prefix to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        crate::home_dir().join(rest)
    } else if path == "~" {
        crate::home_dir()
    } else {
        PathBuf::from(path)
    }
}
