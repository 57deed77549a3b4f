//! Responder - runs when invoked as `treesync serve`
//!
//! Accepts connections forever, one task per connection. The only state
//! shared between sessions is the directory lock table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::protocol::channel::FramedChannel;
use crate::sync::client::expand_tilde;
use crate::sync::lock::DirectoryLockTable;
use crate::sync::session::Session;
use crate::transport;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    config: Arc<SyncConfig>,
    locks: DirectoryLockTable,
}

impl Server {
    /// Bind `addr` and prepare the working root.
    pub async fn bind(addr: &str, mut config: SyncConfig) -> Result<Self> {
        config.validate()?;

        let root = expand_tilde(&config.root);
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| SyncError::io(&root, e))?;
        config.root = tokio::fs::canonicalize(&root)
            .await
            .map_err(|e| SyncError::io(&root, e))?;

        let listener = transport::listen(addr).await?;
        Ok(Self {
            listener,
            config: Arc::new(config),
            locks: DirectoryLockTable::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(SyncError::Transport)
    }

    /// Handle to the lock table shared by this server's sessions.
    pub fn locks(&self) -> DirectoryLockTable {
        self.locks.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Accept loop. Only returns if the listener itself is unusable.
    pub async fn run(self) -> Result<()> {
        info!(
            addr = %self.local_addr()?,
            root = %self.config.root.display(),
            "listening"
        );

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let config = Arc::clone(&self.config);
            let locks = self.locks.clone();
            tokio::spawn(
                serve_connection(stream, config, locks).instrument(info_span!("session", %peer)),
            );
        }
    }
}

async fn serve_connection(stream: TcpStream, config: Arc<SyncConfig>, locks: DirectoryLockTable) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    info!("accepted connection");

    let channel = FramedChannel::from_stream(stream, &config);
    match Session::responder(locks, Arc::clone(&config)).run(channel).await {
        Ok(report) => info!(outcome = ?report.outcome, "connection closed"),
        Err(e) => warn!("Session failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_creates_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().join("srv/data");
        let server = Server::bind(
            "127.0.0.1:0",
            SyncConfig {
                root: root.clone(),
                ..SyncConfig::default()
            },
        )
        .await
        .unwrap();

        assert!(root.is_dir());
        assert!(server.config().root.is_absolute());
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(server.locks().is_empty());
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = Server::bind(
            "127.0.0.1:0",
            SyncConfig {
                root: tmp.path().to_path_buf(),
                write_timeout_secs: 0,
                ..SyncConfig::default()
            },
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
