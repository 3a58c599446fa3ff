//! Agent-to-controller reply lines.

use std::fmt;

/// Reason carried by an `ERR_*` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// `ERR_CONFIG_HEADER`: CONFIG header could not be parsed.
    ConfigHeader,
    /// `ERR_CONFIG_PARSE`: CONFIG payload is not a valid descriptor.
    ConfigParse,
    /// `ERR_NO_CONFIG`: UPLOAD or RUN before any accepted CONFIG.
    NoConfig,
    /// `ERR_HEADER`: UPLOAD header could not be parsed or was refused.
    Header,
    /// `ERR_CHECKSUM <actual-digest>`: received bytes do not match.
    Checksum,
    /// `ERR_EXTRACT <detail>`: archive verified but could not be unpacked.
    Extract,
    /// `ERR_TIMEOUT`: the payload stalled.
    Timeout,
    /// `ERR_RUN <detail>`: entry point missing or could not be spawned.
    Run,
    /// `ERR_STREAM <detail>`: failure while relaying process output.
    Stream,
    /// `ERR_STORAGE <detail>`: the payload could not be written to disk.
    Storage,
    /// Any other `ERR_*` token, kept verbatim.
    Other(String),
}

impl ErrorKind {
    /// The wire token for this kind.
    pub fn token(&self) -> &str {
        match self {
            ErrorKind::ConfigHeader => "ERR_CONFIG_HEADER",
            ErrorKind::ConfigParse => "ERR_CONFIG_PARSE",
            ErrorKind::NoConfig => "ERR_NO_CONFIG",
            ErrorKind::Header => "ERR_HEADER",
            ErrorKind::Checksum => "ERR_CHECKSUM",
            ErrorKind::Extract => "ERR_EXTRACT",
            ErrorKind::Timeout => "ERR_TIMEOUT",
            ErrorKind::Run => "ERR_RUN",
            ErrorKind::Stream => "ERR_STREAM",
            ErrorKind::Storage => "ERR_STORAGE",
            ErrorKind::Other(token) => token,
        }
    }

    /// Whether the agent sends this kind while answering a `RUN`.
    ///
    /// Program output may start with anything, `ERR_` included; during a
    /// run only these kinds come from the agent itself.
    pub fn concerns_run(&self) -> bool {
        matches!(self, ErrorKind::Run | ErrorKind::Stream | ErrorKind::NoConfig)
    }

    fn from_token(token: &str) -> Self {
        match token {
            "ERR_CONFIG_HEADER" => ErrorKind::ConfigHeader,
            "ERR_CONFIG_PARSE" => ErrorKind::ConfigParse,
            "ERR_NO_CONFIG" => ErrorKind::NoConfig,
            "ERR_HEADER" => ErrorKind::Header,
            "ERR_CHECKSUM" => ErrorKind::Checksum,
            "ERR_EXTRACT" => ErrorKind::Extract,
            "ERR_TIMEOUT" => ErrorKind::Timeout,
            "ERR_RUN" => ErrorKind::Run,
            "ERR_STREAM" => ErrorKind::Stream,
            "ERR_STORAGE" => ErrorKind::Storage,
            other => ErrorKind::Other(other.to_string()),
        }
    }
}

/// An `ERR_*` reply with its optional detail text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub detail: Option<String>,
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.token())?;
        if let Some(detail) = &self.detail {
            write!(f, " {}", single_line(detail))?;
        }
        Ok(())
    }
}

/// A line sent by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    OkConfig,
    Ok,
    Progress(u64),
    Done,
    Running,
    Exit(i32),
    Err(ErrorReply),
    /// Anything else: live process output while a RUN is streaming.
    Line(String),
}

impl Reply {
    /// An error reply without detail.
    pub fn error(kind: ErrorKind) -> Self {
        Reply::Err(ErrorReply { kind, detail: None })
    }

    /// An error reply with detail text.
    pub fn error_with(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Reply::Err(ErrorReply {
            kind,
            detail: Some(detail.into()),
        })
    }

    /// Classifies a received line (without its trailing newline).
    ///
    /// Never fails: unrecognised lines become [`Reply::Line`].
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        match trimmed {
            "OK_CONFIG" => return Reply::OkConfig,
            "OK" => return Reply::Ok,
            "DONE" => return Reply::Done,
            "RUNNING" => return Reply::Running,
            _ => {}
        }

        let (head, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (trimmed, ""),
        };

        match head {
            "PROGRESS" => {
                if let Ok(n) = rest.parse() {
                    return Reply::Progress(n);
                }
            }
            "EXIT" => {
                if let Ok(code) = rest.parse() {
                    return Reply::Exit(code);
                }
            }
            _ if head.starts_with("ERR_") => {
                return Reply::Err(ErrorReply {
                    kind: ErrorKind::from_token(head),
                    detail: (!rest.is_empty()).then(|| rest.to_string()),
                });
            }
            _ => {}
        }

        Reply::Line(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Formats the reply as a newline-terminated wire line.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Err(_))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::OkConfig => f.write_str("OK_CONFIG"),
            Reply::Ok => f.write_str("OK"),
            Reply::Progress(n) => write!(f, "PROGRESS {n}"),
            Reply::Done => f.write_str("DONE"),
            Reply::Running => f.write_str("RUNNING"),
            Reply::Exit(code) => write!(f, "EXIT {code}"),
            Reply::Err(e) => e.fmt(f),
            Reply::Line(text) => f.write_str(&single_line(text)),
        }
    }
}

/// Folds embedded line breaks so a reply always occupies one wire line.
fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}
