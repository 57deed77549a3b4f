//! Error types for treesync.
//!
//! Every variant is terminal to the session that produced it. Busy rejection
//! is not an error; it is reported through `SessionOutcome::Busy`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Result type alias for treesync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Short read, reset or unexpected close while a frame was in flight.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SyncError {
    /// Wrap a local filesystem error with the path it concerns.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Wire protocol violations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("{field} is {len} bytes, exceeds the 255 byte wire limit")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("{path} is {size} bytes, exceeds the u32 wire limit")]
    FileTooLarge { path: String, size: u64 },

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("invalid {field} {value:?}")]
    InvalidName { field: &'static str, value: String },

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("unexpected {packet} packet in state {state}")]
    Unexpected {
        packet: &'static str,
        state: &'static str,
    },

    #[error("outbound writer stopped before the session finished")]
    WriterClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_includes_path() {
        let err = SyncError::io(
            "/tmp/missing",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/missing"));
        assert!(msg.contains("gone"));
    }

    #[test]
    fn test_protocol_error_converts() {
        let err: SyncError = ProtocolError::UnknownPacketType(3).into();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::UnknownPacketType(3))
        ));
        assert_eq!(err.to_string(), "protocol error: unknown packet type 3");
    }
}
