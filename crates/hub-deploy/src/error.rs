//! Deploy error types.

use linkdeploy_protocol::{ErrorReply, ProtocolError};
use linkdeploy_transfer::TransferError;
use linkdeploy_transport::LinkError;

/// Acknowledgement the controller was waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// `OK_CONFIG` after `CONFIG`.
    Config,
    /// `OK` after the `UPLOAD` header.
    Header,
    /// `DONE` after the payload.
    Result,
}

impl Stage {
    /// Reason token recorded when this wait runs out.
    pub fn timeout_token(self) -> &'static str {
        match self {
            Stage::Config => "TIMEOUT_OK_CONFIG",
            Stage::Header => "TIMEOUT_OK",
            Stage::Result => "TIMEOUT_RESULT",
        }
    }
}

/// Errors produced during deployment.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("descriptor error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("config.json not found in {0}")]
    DescriptorMissing(String),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("agent replied {0}")]
    Rejected(ErrorReply),

    #[error("{}", .0.timeout_token())]
    AckTimeout(Stage),

    #[error("agent closed the link")]
    LinkClosed,

    #[error("cancelled")]
    Cancelled,

    #[error("giving up after {attempts} attempts (last: {last})")]
    Exhausted { attempts: u32, last: String },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DeployError {
    /// Short failure reason for logs and events: the agent's error line or
    /// the timeout token when there is one.
    pub fn reason(&self) -> String {
        match self {
            DeployError::Rejected(reply) => reply.to_string(),
            DeployError::AckTimeout(stage) => stage.timeout_token().to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkdeploy_protocol::{ErrorKind, Reply};

    #[test]
    fn reasons_mirror_wire_tokens() {
        assert_eq!(
            DeployError::AckTimeout(Stage::Config).reason(),
            "TIMEOUT_OK_CONFIG"
        );
        assert_eq!(DeployError::AckTimeout(Stage::Header).reason(), "TIMEOUT_OK");
        assert_eq!(
            DeployError::AckTimeout(Stage::Result).to_string(),
            "TIMEOUT_RESULT"
        );

        let Reply::Err(reply) = Reply::error_with(ErrorKind::Checksum, "ab12") else {
            unreachable!()
        };
        assert_eq!(DeployError::Rejected(reply).reason(), "ERR_CHECKSUM ab12");
    }
}
