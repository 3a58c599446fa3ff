//! Byte-stream link between controller and agent.
//!
//! A [`Link`] wraps any bidirectional async stream (a serial port, a TCP
//! socket, an in-memory duplex in tests) and offers the two read shapes
//! the protocol needs: newline-terminated header lines and raw payload
//! bytes of declared length. Every read that can stall takes a timeout.
//!
//! Endpoints are described by an address string, see [`Endpoint`].

pub mod endpoint;
pub mod error;
pub mod link;

pub use endpoint::{Endpoint, LinkOpener};
pub use error::LinkError;
pub use link::Link;

use std::time::Duration;

/// Read buffer size for the link (64 KiB).
pub const LINK_BUFFER_SIZE: usize = 64 * 1024;

/// Timeout for an outgoing TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
