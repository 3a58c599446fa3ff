//! Filesystem operations for the agent's deploy directory.
//!
//! Provides path resolution (with `~` expansion), the guarded
//! remove-and-recreate used before every extraction, and entry-point
//! lookup for `RUN`.

use std::path::PathBuf;

mod replace;
mod resolve;

pub use replace::replace_directory;
pub use resolve::{expand_home, resolve_deploy_dir, resolve_entry_point, set_executable};

/// Default application directory name under `$HOME`.
pub const DEFAULT_APP_DIR: &str = "app";

/// Resolves the default application directory.
///
/// Returns `$HOME/app` or `/tmp/app` as fallback.
pub fn default_app_dir() -> PathBuf {
    home_dir().join(DEFAULT_APP_DIR)
}

/// Returns the user's home directory.
pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Errors produced by deploy-directory operations.
#[derive(Debug, thiserror::Error)]
pub enum FileOpsError {
    #[error("refusing to replace {path}: {reason}")]
    Unsafe { path: String, reason: &'static str },

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("main not found: {0}")]
    EntryPointMissing(String),

    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FileOpsError {
    pub(crate) fn io(op: &'static str, path: &std::path::Path, source: std::io::Error) -> Self {
        FileOpsError::Io {
            op,
            path: path.display().to_string(),
            source,
        }
    }
}
