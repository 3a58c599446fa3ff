//! Endpoint addresses and link opening.
//!
//! ```text
//! tcp://host:port          connect to a TCP listener (controller over a bridge)
//! tcp-listen://host:port   accept one TCP connection (agent side)
//! anything else            serial device path, e.g. /dev/ttyGS0 or COM7
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::net::{TcpListener, TcpStream};
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

use crate::TCP_CONNECT_TIMEOUT;
use crate::error::LinkError;
use crate::link::Link;

/// Something that can produce a fresh [`Link`] on demand.
///
/// The controller opens one link per attempt; the agent opens one per
/// session. Tests implement this over in-memory streams.
pub trait LinkOpener: Send + Sync {
    fn open(&self) -> Pin<Box<dyn Future<Output = Result<Link, LinkError>> + Send + '_>>;
}

/// A parsed transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Serial { path: String, baud: u32 },
    TcpConnect(String),
    TcpListen(String),
}

impl Endpoint {
    /// Parses an address; `baud` only applies to serial devices.
    pub fn parse(address: &str, baud: u32) -> Result<Self, LinkError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(LinkError::InvalidEndpoint("empty address".into()));
        }

        if let Some(addr) = address.strip_prefix("tcp-listen://") {
            return Ok(Endpoint::TcpListen(non_empty(addr, address)?));
        }
        if let Some(addr) = address.strip_prefix("tcp://") {
            return Ok(Endpoint::TcpConnect(non_empty(addr, address)?));
        }
        if address.contains("://") {
            return Err(LinkError::InvalidEndpoint(format!(
                "unsupported scheme: {address}"
            )));
        }
        if baud == 0 {
            return Err(LinkError::InvalidEndpoint("baud rate must be > 0".into()));
        }

        Ok(Endpoint::Serial {
            path: address.to_string(),
            baud,
        })
    }

    async fn open_link(&self) -> Result<Link, LinkError> {
        match self {
            Endpoint::Serial { path, baud } => {
                let port = tokio_serial::new(path, *baud).open_native_async()?;
                info!(%path, baud, "serial port opened");
                Ok(Link::new(port))
            }
            Endpoint::TcpConnect(addr) => {
                let stream = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr))
                    .await
                    .map_err(|_| LinkError::Timeout)??;
                stream.set_nodelay(true)?;
                info!(%addr, "TCP link connected");
                Ok(Link::new(stream))
            }
            Endpoint::TcpListen(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!(addr = %listener.local_addr()?, "waiting for TCP link");
                let (stream, peer) = listener.accept().await?;
                // One connection per session.
                drop(listener);
                stream.set_nodelay(true)?;
                info!(%peer, "TCP link accepted");
                Ok(Link::new(stream))
            }
        }
    }
}

fn non_empty(addr: &str, full: &str) -> Result<String, LinkError> {
    if addr.is_empty() {
        Err(LinkError::InvalidEndpoint(format!("missing host:port in {full}")))
    } else {
        Ok(addr.to_string())
    }
}

impl LinkOpener for Endpoint {
    fn open(&self) -> Pin<Box<dyn Future<Output = Result<Link, LinkError>> + Send + '_>> {
        Box::pin(self.open_link())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial { path, baud } => write!(f, "{path} @ {baud}"),
            Endpoint::TcpConnect(addr) => write!(f, "tcp://{addr}"),
            Endpoint::TcpListen(addr) => write!(f, "tcp-listen://{addr}"),
        }
    }
}
