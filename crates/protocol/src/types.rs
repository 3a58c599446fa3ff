use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Deployment descriptor shared by the project's `config.json` and the
/// `CONFIG` payload.
///
/// Absent fields take their defaults at parse time, so `include` and
/// `exclude` are always populated before any filtering happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Deploy directory on the agent (absolute, `~`-prefixed or relative
    /// to the agent's app directory). `None` selects the agent default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    /// Entry point, relative to the deploy directory.
    #[serde(default = "default_main")]
    pub main: String,

    /// Arguments passed to the entry point, in order.
    #[serde(default)]
    pub args: Vec<String>,

    /// Glob patterns a file must match (at least one) to be packed.
    #[serde(default = "default_include")]
    pub include: Vec<String>,

    /// Glob patterns that drop an otherwise included file.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Transport address the controller opens.
    #[serde(default = "default_com_port")]
    pub com_port: String,

    /// Command prefix used to launch the entry point. Empty runs it directly.
    #[serde(default = "default_interpreter")]
    pub interpreter: Vec<String>,

    /// Fields this version does not know about, kept for round-tripping.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_main() -> String {
    "main.py".into()
}

fn default_include() -> Vec<String> {
    vec!["**".into()]
}

fn default_com_port() -> String {
    if cfg!(windows) {
        "COM7".into()
    } else {
        "/dev/ttyACM0".into()
    }
}

fn default_interpreter() -> Vec<String> {
    vec!["python3".into(), "-u".into()]
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            directory: None,
            main: default_main(),
            args: Vec::new(),
            include: default_include(),
            exclude: Vec::new(),
            com_port: default_com_port(),
            interpreter: default_interpreter(),
            extra: serde_json::Map::new(),
        }
    }
}

impl DeploymentConfig {
    /// Parses a descriptor from raw JSON bytes, applying field defaults.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serializes the descriptor into the compact form sent as `CONFIG` payload.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}
