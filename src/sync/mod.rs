//! Synchronization engine: reconciliation, directory locking and the
//! session state machine shared by both roles.

pub mod client;
pub mod lock;
pub mod reconcile;
pub mod session;

pub use client::sync_directory;
pub use lock::{DirectoryLease, DirectoryLockTable};
pub use reconcile::{reconcile, within_window, Plan};
pub use session::{Role, Session, SessionOutcome, SessionReport, SessionState};
