//! Initiator entry point.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, info_span, Instrument};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::protocol::channel::FramedChannel;
use crate::sync::session::{Session, SessionReport};
use crate::transport;
use crate::tree::LocalTree;

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| path.to_path_buf())
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

/// Synchronize `directory` with the responder at `host:port` as `username`.
///
/// The responder stores the tree as `{username}-{basename(directory)}`.
pub async fn sync_directory(
    host: &str,
    port: u16,
    username: &str,
    directory: &Path,
    config: Arc<SyncConfig>,
) -> Result<SessionReport> {
    let expanded = expand_tilde(directory);
    let root = tokio::fs::canonicalize(&expanded)
        .await
        .map_err(|e| SyncError::io(&expanded, e))?;

    let stream = transport::connect(host, port, config.connect_timeout()).await?;
    let peer = format!("{}:{}", host, port);
    info!(%peer, root = %root.display(), "connected");

    let channel = FramedChannel::from_stream(stream, &config);
    Session::initiator(LocalTree::new(root), username, Arc::clone(&config))
        .run(channel)
        .instrument(info_span!("client", %peer))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
        assert_eq!(expand_tilde(Path::new("notes")), PathBuf::from("notes"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~")), home);
            assert_eq!(expand_tilde(Path::new("~/notes")), home.join("notes"));
        }
    }

    #[tokio::test]
    async fn test_missing_directory_fails_before_connecting() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = sync_directory(
            "127.0.0.1",
            1,
            "alice",
            &tmp.path().join("absent"),
            Arc::new(SyncConfig::default()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Io { .. }));
    }
}
