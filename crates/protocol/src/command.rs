//! Controller-to-agent command headers.

use std::fmt;

use crate::reply::{ErrorKind, Reply};

/// Header of an `UPLOAD` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHeader {
    /// Archive size in bytes.
    pub size: u64,
    /// Hex digest of the archive as computed by the sender.
    pub digest: String,
    /// Archive file name (informational; may contain spaces).
    pub name: String,
}

/// A command header line sent by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `CONFIG <size>`, followed by `size` bytes of JSON.
    Config { size: usize },
    /// `UPLOAD <size> <digest> <name>`, followed by `size` archive bytes.
    Upload(UploadHeader),
    /// `RUN`, no payload.
    Run,
}

/// Why a header line could not be turned into a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("empty header line")]
    Empty,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("malformed CONFIG header: {0}")]
    ConfigHeader(String),

    #[error("malformed UPLOAD header: {0}")]
    UploadHeader(String),
}

impl FrameError {
    /// The error reply the agent sends for this failure.
    ///
    /// Unknown commands get no reply; they are logged and ignored.
    pub fn reply(&self) -> Option<Reply> {
        match self {
            FrameError::Empty | FrameError::Unknown(_) => None,
            FrameError::ConfigHeader(_) => Some(Reply::error(ErrorKind::ConfigHeader)),
            FrameError::UploadHeader(_) => Some(Reply::error(ErrorKind::Header)),
        }
    }
}

/// Splits the next whitespace-delimited token off `s`.
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some((&s[..end], &s[end..]))
}

impl Command {
    /// Parses a header line (without its trailing newline).
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let line = line.trim();
        let (verb, rest) = next_token(line).ok_or(FrameError::Empty)?;

        match verb {
            "CONFIG" => {
                let (size, tail) =
                    next_token(rest).ok_or_else(|| FrameError::ConfigHeader(line.into()))?;
                if !tail.trim().is_empty() {
                    return Err(FrameError::ConfigHeader(line.into()));
                }
                let size = size
                    .parse::<usize>()
                    .map_err(|_| FrameError::ConfigHeader(line.into()))?;
                Ok(Command::Config { size })
            }
            "UPLOAD" => {
                let bad = || FrameError::UploadHeader(line.into());
                let (size, rest) = next_token(rest).ok_or_else(bad)?;
                let (digest, rest) = next_token(rest).ok_or_else(bad)?;
                let name = rest.trim();
                if name.is_empty() {
                    return Err(bad());
                }
                let size = size.parse::<u64>().map_err(|_| bad())?;
                Ok(Command::Upload(UploadHeader {
                    size,
                    digest: digest.to_string(),
                    name: name.to_string(),
                }))
            }
            "RUN" if rest.trim().is_empty() => Ok(Command::Run),
            _ => Err(FrameError::Unknown(line.into())),
        }
    }

    /// Formats the header as a newline-terminated wire line.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Config { size } => write!(f, "CONFIG {size}"),
            Command::Upload(h) => write!(f, "UPLOAD {} {} {}", h.size, h.digest, h.name),
            Command::Run => f.write_str("RUN"),
        }
    }
}
