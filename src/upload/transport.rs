//! Transport seam: how a connection gets its byte stream.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use super::ServerTarget;

/// A duplex byte stream a connection writes its payload into.
pub trait UploadStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> UploadStream for T {}

pub type BoxedStream = Box<dyn UploadStream>;

/// Establishes outbound streams to a server target.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ServerTarget) -> io::Result<BoxedStream>;
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub nodelay: bool,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &ServerTarget) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        debug!(server = %target, local = ?stream.local_addr().ok(), "tcp connected");
        Ok(Box::new(stream))
    }
}
