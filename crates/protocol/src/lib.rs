//! Wire protocol for the controller/agent deploy link.
//!
//! The link carries newline-terminated ASCII header lines, some of them
//! followed by a raw payload of declared length:
//!
//! ```text
//! Controller -> Agent:
//!   CONFIG <size>\n                  + <size> bytes of JSON descriptor
//!   UPLOAD <size> <digest> <name>\n  + <size> bytes of archive
//!   RUN\n
//!
//! Agent -> Controller (one token per line):
//!   OK_CONFIG | OK | PROGRESS <bytes> | DONE | RUNNING | EXIT <code>
//!   ERR_<REASON> [detail]
//! ```
//!
//! This crate is purely syntactic: it parses and formats lines and the
//! deployment descriptor, and performs no I/O.

pub mod command;
pub mod constants;
pub mod reply;
pub mod types;

// Re-export primary types for convenience.
pub use command::{Command, FrameError, UploadHeader};
pub use reply::{ErrorKind, ErrorReply, Reply};
pub use types::DeploymentConfig;

/// Errors produced while decoding protocol payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}
