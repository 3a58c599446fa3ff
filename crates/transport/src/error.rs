//! Error types for the link.

/// Errors produced by a [`Link`](crate::Link) or while opening one.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("timed out waiting for data")]
    Timeout,

    #[error("link closed by peer")]
    Closed,

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}
