//! Project folder loading and packing.

use std::path::{Path, PathBuf};

use linkdeploy_protocol::DeploymentConfig;
use linkdeploy_protocol::constants::DESCRIPTOR_NAME;
use linkdeploy_transfer::{ArchiveBlob, TransferError, build_archive};
use tracing::info;

use crate::error::DeployError;

/// A project folder and the descriptor found in it.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub config: DeploymentConfig,
}

impl Project {
    /// Reads `config.json` from `folder`.
    ///
    /// A missing folder or descriptor is a configuration error, not
    /// something a retry can fix.
    pub fn load(folder: &Path) -> Result<Self, DeployError> {
        if !folder.is_dir() {
            return Err(TransferError::SourceMissing(folder.display().to_string()).into());
        }
        let root = std::fs::canonicalize(folder)?;

        let descriptor = root.join(DESCRIPTOR_NAME);
        if !descriptor.is_file() {
            return Err(DeployError::DescriptorMissing(root.display().to_string()));
        }

        let raw = std::fs::read(&descriptor)?;
        let config = DeploymentConfig::from_json(&raw)?;
        info!(
            root = %root.display(),
            main = %config.main,
            port = %config.com_port,
            "project loaded"
        );
        Ok(Self { root, config })
    }

    /// Packs the project according to its descriptor.
    pub fn build_archive(&self) -> Result<ArchiveBlob, DeployError> {
        Ok(build_archive(&self.root, &self.config)?)
    }

    /// The `CONFIG` payload: the descriptor with every default filled in.
    pub fn config_payload(&self) -> Result<Vec<u8>, DeployError> {
        Ok(self.config.to_json()?)
    }
}
