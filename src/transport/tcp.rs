//! Plaintext TCP dialing (server role: the local ORPort)

use super::{Dialer, OpenError};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Dials plaintext TCP targets with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Dialer for TcpDialer {
    type Conn = TcpStream;

    async fn open_to(&self, target: &str) -> Result<TcpStream, OpenError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| OpenError::Timeout)?
            .map_err(|e| OpenError::Unreachable(format!("{}: {}", target, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on connection to {}: {}", target, e);
        }
        Ok(stream)
    }
}
