//! Device-side half of the deploy link.
//!
//! An [`AgentSession`] owns one [`Link`](linkdeploy_transport::Link) and
//! serves `CONFIG`, `UPLOAD` and `RUN` commands on it one at a time. `RUN`
//! hands the link to the process streamer until the child exits.

mod runner;
mod session;

pub use runner::{ProcessSpec, RunResult, stream_process};
pub use session::{AgentSession, DEFAULT_MAX_UPLOAD_SIZE, DeploymentState, SessionSettings};

use std::time::Duration;

use linkdeploy_file_ops::FileOpsError;
use linkdeploy_transfer::TransferError;
use linkdeploy_transport::LinkError;

/// Pause after a failed command before reading the next header.
pub const COMMAND_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Capacity of the merged stdout/stderr channel.
pub const OUTPUT_CHANNEL_SIZE: usize = 256;

/// Errors produced by the agent session.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    FileOps(#[from] FileOpsError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl AgentError {
    /// Whether the link itself is gone and the session must end.
    pub fn is_link_lost(&self) -> bool {
        matches!(
            self,
            AgentError::Link(LinkError::Closed | LinkError::Io(_) | LinkError::Serial(_))
        )
    }
}
