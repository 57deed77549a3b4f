//! treesync: two-way directory tree synchronization over TCP.
//!
//! An initiator connects, logs in with its tree listing, and the responder
//! decides per entry whether to pull, push or leave it alone. Newer wins,
//! and only recent changes are transferred.

pub mod config;
pub mod entry;
pub mod error;
pub mod protocol;
pub mod server;
pub mod sync;
pub mod transport;
pub mod tree;

pub use config::SyncConfig;
pub use entry::FileEntry;
pub use error::{ProtocolError, Result, SyncError};
pub use server::Server;
pub use sync::{sync_directory, DirectoryLockTable, SessionOutcome, SessionReport};
