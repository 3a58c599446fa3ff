//! Agent configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/linkdeploy/agent.toml`
//! - Windows: `%APPDATA%/linkdeploy/agent.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use linkdeploy_agent_server::{DEFAULT_MAX_UPLOAD_SIZE, SessionSettings};
use linkdeploy_file_ops::expand_home;
use linkdeploy_protocol::constants::{ARCHIVE_NAME, DEFAULT_BAUD, PROGRESS_INTERVAL};
use serde::{Deserialize, Serialize};

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Endpoint to serve: a serial device or `tcp-listen://host:port`.
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Fallback deploy directory; relative deploy directories hang off it.
    #[serde(default = "default_app_dir")]
    pub app_dir: String,

    /// Application log, appended to on every run. Keep it outside the
    /// deploy directory: a deploy replaces that directory wholesale.
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Where uploads are staged before verification.
    #[serde(default = "default_staging_file")]
    pub staging_file: String,

    /// Bytes between `PROGRESS` replies.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,

    #[serde(default = "default_payload_timeout_secs")]
    pub payload_timeout_secs: u64,

    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
}

fn default_port() -> String {
    "/dev/ttyGS0".into()
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

fn default_app_dir() -> String {
    "~/app".into()
}

fn default_log_file() -> String {
    "~/.local/state/linkdeploy/upload.log".into()
}

fn default_staging_file() -> String {
    format!("~/app/{ARCHIVE_NAME}")
}

fn default_progress_interval() -> u64 {
    PROGRESS_INTERVAL
}

fn default_payload_timeout_secs() -> u64 {
    30
}

fn default_max_upload_size() -> u64 {
    DEFAULT_MAX_UPLOAD_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            app_dir: default_app_dir(),
            log_file: default_log_file(),
            staging_file: default_staging_file(),
            progress_interval: default_progress_interval(),
            payload_timeout_secs: default_payload_timeout_secs(),
            max_upload_size: default_max_upload_size(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the default location), creating
    /// a default file if none exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path(),
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn log_path(&self) -> PathBuf {
        expand_home(&self.log_file)
    }

    /// Whether the log file sits inside the fallback deploy directory,
    /// where the next deploy would delete it.
    pub fn log_inside_app_dir(&self) -> bool {
        self.log_path().starts_with(expand_home(&self.app_dir))
    }

    /// Session knobs with every `~` expanded.
    pub fn to_session_settings(&self) -> SessionSettings {
        SessionSettings {
            app_dir: expand_home(&self.app_dir),
            staging_file: expand_home(&self.staging_file),
            progress_interval: self.progress_interval.max(1),
            payload_timeout: Duration::from_secs(self.payload_timeout_secs.max(1)),
            max_upload_size: self.max_upload_size,
        }
    }
}

/// Returns the platform-specific configuration file path.
pub fn config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("linkdeploy").join("agent.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        linkdeploy_file_ops::home_dir()
            .join(".config")
            .join("linkdeploy")
            .join("agent.toml")
    }
}
