use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};

use leap_protocol::ErrorCode;

use crate::config::ClientConfig;

/// Why a request could not be answered by the local service
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Failed to connect to local service: {0}")]
    Unavailable(#[source] io::Error),

    #[error("Local service timed out")]
    Timeout,

    #[error("Local service I/O failed: {0}")]
    Internal(#[source] io::Error),
}

impl ForwardError {
    /// Error code reported back over the channel
    pub fn code(&self) -> ErrorCode {
        match self {
            ForwardError::Unavailable(_) => ErrorCode::Unavailable,
            ForwardError::Timeout => ErrorCode::Timeout,
            ForwardError::Internal(_) => ErrorCode::Internal,
        }
    }
}

/// Forwards raw requests to the local service, one connection per request
#[derive(Debug, Clone)]
pub struct LocalForwarder {
    addr: SocketAddr,
    dial_timeout: Duration,
    io_timeout: Duration,
}

impl LocalForwarder {
    pub fn new(addr: SocketAddr, dial_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            addr,
            dial_timeout,
            io_timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.local_addr(), config.dial_timeout, config.io_timeout)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Write `request` to the local service and collect everything it sends
    /// back until it closes the connection
    pub async fn forward(&self, request: &[u8]) -> Result<Vec<u8>, ForwardError> {
        let mut stream = match timeout(self.dial_timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ForwardError::Unavailable(e)),
            Err(_) => {
                return Err(ForwardError::Unavailable(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.addr),
                )))
            }
        };

        // One deadline covers the write and the whole read
        let deadline = Instant::now() + self.io_timeout;

        match timeout_at(deadline, stream.write_all(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ForwardError::Internal(e)),
            Err(_) => return Err(ForwardError::Timeout),
        }

        let mut response = Vec::new();
        loop {
            match timeout_at(deadline, stream.read_buf(&mut response)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    tracing::trace!("Read {} bytes from {}", n, self.addr);
                }
                Ok(Err(e)) if response.is_empty() => return Err(ForwardError::Internal(e)),
                Ok(Err(e)) => {
                    tracing::debug!("Local read ended early after {} bytes: {}", response.len(), e);
                    break;
                }
                Err(_) => return Err(ForwardError::Timeout),
            }
        }

        tracing::debug!("Local response: {} bytes", response.len());
        Ok(response)
    }
}
