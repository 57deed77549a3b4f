//! TCP boundary: connecting and listening sockets.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::{Result, SyncError};

/// Connect to `host:port` within `timeout`.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(SyncError::Connect { addr, source }),
        Err(_) => {
            return Err(SyncError::Timeout {
                operation: "connect",
                timeout,
            })
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
    }
    Ok(stream)
}

/// Bind a listening socket on `addr` (`host:port`).
pub async fn listen(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|source| SyncError::Bind {
        addr: addr.to_string(),
        source,
    })
}
