//! Session state machine for both roles.
//!
//! ```text
//! Idle -> LoginExchanged -> Reconciling -> LogoutPending -> Terminated
//! ```
//!
//! Each session splits its connection: this task reads and dispatches frames
//! while a writer task drains an unbounded queue of outbound packets. Neither
//! side can then block the other by writing while its peer is also writing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::entry::{format_timestamp, now_timestamp, FileEntry};
use crate::error::{ProtocolError, Result};
use crate::protocol::channel::{FrameReader, FramedChannel};
use crate::protocol::packet::{Login, Logout, Packet, RequestFile, SendFile};
use crate::sync::lock::{DirectoryLease, DirectoryLockTable};
use crate::sync::reconcile::reconcile;
use crate::tree::{normalize_path, LocalTree};

type Outbox = UnboundedSender<Packet>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects, sends Login, answers requests.
    Initiator,
    /// Accepts, locks the directory, reconciles.
    Responder,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    LoginExchanged,
    Reconciling,
    LogoutPending,
    Terminated,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::LoginExchanged => "LoginExchanged",
            SessionState::Reconciling => "Reconciling",
            SessionState::LogoutPending => "LogoutPending",
            SessionState::Terminated => "Terminated",
        }
    }
}

/// How a session ended when it did not fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The logout exchange completed.
    Completed,
    /// The responder's directory was already being synchronized.
    Busy,
    /// The peer closed the stream between frames.
    PeerClosed,
}

/// Summary of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub files_sent: u64,
    pub bytes_sent: u64,
    pub files_received: u64,
    pub bytes_received: u64,
    pub requests_sent: u64,
}

impl SessionReport {
    fn new() -> Self {
        Self {
            outcome: SessionOutcome::PeerClosed,
            files_sent: 0,
            bytes_sent: 0,
            files_received: 0,
            bytes_received: 0,
            requests_sent: 0,
        }
    }
}

/// Reject names that would resolve outside `{username}-{directory}`.
fn validate_name(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(ProtocolError::InvalidName {
            field,
            value: value.to_string(),
        }
        .into());
    }
    Ok(())
}

fn queue(tx: &Outbox, packet: Packet) -> Result<()> {
    tx.send(packet).map_err(|_| ProtocolError::WriterClosed.into())
}

/// One synchronization session over one connection.
pub struct Session {
    role: Role,
    state: SessionState,
    config: Arc<SyncConfig>,
    tree: Option<LocalTree>,
    username: String,
    locks: Option<DirectoryLockTable>,
    lease: Option<DirectoryLease>,
    report: SessionReport,
}

impl Session {
    /// Session that logs in as `username` and synchronizes `tree`.
    pub fn initiator(tree: LocalTree, username: impl Into<String>, config: Arc<SyncConfig>) -> Self {
        Self {
            role: Role::Initiator,
            state: SessionState::Idle,
            config,
            tree: Some(tree),
            username: username.into(),
            locks: None,
            lease: None,
            report: SessionReport::new(),
        }
    }

    /// Session that waits for a Login and serves `{username}-{directory}`
    /// under `config.root`.
    pub fn responder(locks: DirectoryLockTable, config: Arc<SyncConfig>) -> Self {
        Self {
            role: Role::Responder,
            state: SessionState::Idle,
            config,
            tree: None,
            username: String::new(),
            locks: Some(locks),
            lease: None,
            report: SessionReport::new(),
        }
    }

    /// Run the session to its end. The connection is closed on return.
    pub async fn run<R, W>(self, channel: FramedChannel<R, W>) -> Result<SessionReport>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let span = info_span!("sync", role = self.role.as_str());
        self.run_inner(channel).instrument(span).await
    }

    async fn run_inner<R, W>(mut self, channel: FramedChannel<R, W>) -> Result<SessionReport>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, writer) = channel.into_parts();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut writer_task = tokio::spawn(writer.drain(rx).in_current_span());

        let mut writer_done = false;
        let result = tokio::select! {
            res = self.drive(&mut reader, &tx) => res,
            joined = &mut writer_task => {
                writer_done = true;
                match joined {
                    Ok(Ok(())) => Err(ProtocolError::WriterClosed.into()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(e.into()),
                }
            }
        };
        drop(tx);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if !writer_done {
                    writer_task.abort();
                }
                self.lease.take();
                self.state = SessionState::Terminated;
                return Err(e);
            }
        };

        // Everything queued is flushed before the connection closes
        writer_task.await??;
        self.lease.take();

        self.report.outcome = outcome;
        let r = &self.report;
        info!(
            outcome = ?r.outcome,
            files_sent = r.files_sent,
            bytes_sent = r.bytes_sent,
            files_received = r.files_received,
            bytes_received = r.bytes_received,
            requests_sent = r.requests_sent,
            "session finished"
        );
        Ok(self.report)
    }

    async fn drive<R>(&mut self, reader: &mut FrameReader<R>, tx: &Outbox) -> Result<SessionOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        if self.role == Role::Initiator {
            self.start_login(reader, tx).await?;
        }

        loop {
            let Some(packet) = reader.receive().await? else {
                info!(state = self.state.as_str(), "peer closed the connection");
                self.state = SessionState::Terminated;
                return Ok(SessionOutcome::PeerClosed);
            };

            let finished = match packet {
                Packet::Login(login) => self.on_login(login, reader, tx).await?,
                Packet::RequestFile(request) => {
                    self.on_request(request, tx).await?;
                    None
                }
                Packet::SendFile(send) => {
                    self.on_send_file(send).await?;
                    None
                }
                Packet::Logout(logout) => Some(self.on_logout(logout, tx)?),
            };

            if let Some(outcome) = finished {
                return Ok(outcome);
            }
        }
    }

    fn unexpected(&self, packet: &'static str) -> ProtocolError {
        ProtocolError::Unexpected {
            packet,
            state: self.state.as_str(),
        }
    }

    fn open_tree(&self, packet: &'static str) -> Result<&LocalTree> {
        match (&self.tree, self.state) {
            (Some(tree), SessionState::LoginExchanged)
            | (Some(tree), SessionState::Reconciling)
            | (Some(tree), SessionState::LogoutPending) => Ok(tree),
            _ => Err(self.unexpected(packet).into()),
        }
    }

    async fn start_login<R>(&mut self, reader: &mut FrameReader<R>, tx: &Outbox) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let tree = self.open_tree_idle()?;
        let directory_name = tree
            .root()
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ProtocolError::InvalidName {
                field: "directory name",
                value: tree.root().display().to_string(),
            })?
            .to_string();

        reader.stage_into(tree.staging());
        let files = tree.list().await?;
        info!(
            username = %self.username,
            directory = %directory_name,
            entries = files.len(),
            "logging in"
        );

        queue(
            tx,
            Packet::Login(Login {
                username: self.username.clone(),
                directory_name,
                files,
            }),
        )?;
        self.state = SessionState::LoginExchanged;
        Ok(())
    }

    fn open_tree_idle(&self) -> Result<&LocalTree> {
        match (&self.tree, self.state) {
            (Some(tree), SessionState::Idle) => Ok(tree),
            _ => Err(self.unexpected("Login").into()),
        }
    }

    async fn on_login<R>(
        &mut self,
        login: Login,
        reader: &mut FrameReader<R>,
        tx: &Outbox,
    ) -> Result<Option<SessionOutcome>>
    where
        R: AsyncRead + Unpin + Send,
    {
        let locks = match (&self.locks, self.role, self.state) {
            (Some(locks), Role::Responder, SessionState::Idle) => locks.clone(),
            _ => return Err(self.unexpected("Login").into()),
        };
        validate_name("username", &login.username)?;
        validate_name("directory name", &login.directory_name)?;

        let root = normalize_path(
            &self
                .config
                .root
                .join(format!("{}-{}", login.username, login.directory_name)),
        );

        let Some(lease) = locks.try_acquire(&root) else {
            info!(
                username = %login.username,
                directory = %login.directory_name,
                "directory busy, rejecting login"
            );
            queue(tx, Packet::Logout(Logout::busy()))?;
            self.state = SessionState::Terminated;
            return Ok(Some(SessionOutcome::Busy));
        };
        self.lease = Some(lease);
        self.username = login.username.clone();
        self.state = SessionState::LoginExchanged;
        info!(
            username = %login.username,
            directory = %login.directory_name,
            entries = login.files.len(),
            root = %root.display(),
            "login accepted"
        );

        let tree = LocalTree::new(root);
        tree.ensure_root().await?;
        reader.stage_into(tree.staging());
        let local = tree.list().await?;
        self.tree = Some(tree);
        self.state = SessionState::Reconciling;

        let plan = reconcile(
            &local,
            &login.files,
            now_timestamp(),
            self.config.recency_window(),
        );
        debug!(
            pull = plan.pull.len(),
            push = plan.push.len(),
            "reconciled listings"
        );

        for path in plan.pull {
            debug!(%path, "requesting");
            queue(tx, Packet::RequestFile(RequestFile { path }))?;
            self.report.requests_sent += 1;
        }

        let mut by_path: HashMap<String, FileEntry> =
            local.into_iter().map(|e| (e.path.clone(), e)).collect();
        for path in plan.push {
            let Some(entry) = by_path.remove(&path) else {
                continue;
            };
            self.push(entry, tx)?;
        }

        queue(tx, Packet::Logout(Logout::request()))?;
        self.state = SessionState::LogoutPending;
        Ok(None)
    }

    fn push(&mut self, entry: FileEntry, tx: &Outbox) -> Result<()> {
        debug!(
            path = %entry.path,
            is_dir = entry.is_dir,
            size = entry.size,
            modified = %format_timestamp(entry.last_modified),
            "sending"
        );
        self.report.files_sent += 1;
        self.report.bytes_sent += u64::from(entry.size);
        queue(tx, Packet::SendFile(SendFile { entry }))
    }

    async fn on_request(&mut self, request: RequestFile, tx: &Outbox) -> Result<()> {
        let tree = self.open_tree("RequestFile")?;
        let Some(entry) = tree.entry(&request.path).await? else {
            warn!(path = %request.path, "requested entry no longer exists, skipping");
            return Ok(());
        };
        if self.state == SessionState::LoginExchanged {
            self.state = SessionState::Reconciling;
        }
        self.push(entry, tx)
    }

    async fn on_send_file(&mut self, send: SendFile) -> Result<()> {
        let tree = self.open_tree("SendFile")?;
        let entry = send.entry;
        let (path, size) = (entry.path.clone(), entry.size);
        tree.apply(entry).await?;
        debug!(%path, size, "received");

        self.report.files_received += 1;
        self.report.bytes_received += u64::from(size);
        if self.state == SessionState::LoginExchanged {
            self.state = SessionState::Reconciling;
        }
        Ok(())
    }

    fn on_logout(&mut self, logout: Logout, tx: &Outbox) -> Result<SessionOutcome> {
        let before_login = self.role == Role::Responder && self.state == SessionState::Idle;
        if before_login || self.state == SessionState::Terminated {
            return Err(self.unexpected("Logout").into());
        }
        self.state = SessionState::Terminated;

        if logout.is_reply {
            self.lease.take();
            info!("logout complete");
            return Ok(SessionOutcome::Completed);
        }
        if logout.is_busy {
            warn!("peer is busy synchronizing this directory");
            return Ok(SessionOutcome::Busy);
        }

        queue(tx, Packet::Logout(Logout::reply()))?;
        self.lease.take();
        info!("logout complete");
        Ok(SessionOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(root: &Path) -> Arc<SyncConfig> {
        Arc::new(SyncConfig {
            root: root.to_path_buf(),
            read_timeout_secs: 5,
            write_timeout_secs: 5,
            ..SyncConfig::default()
        })
    }

    fn set_mtime(path: &Path, secs: u32) {
        let t = filetime::FileTime::from_unix_time(i64::from(secs), 0);
        filetime::set_file_times(path, t, t).unwrap();
    }

    async fn pair(
        local_dir: &Path,
        server_root: &Path,
        locks: DirectoryLockTable,
    ) -> (Result<SessionReport>, Result<SessionReport>) {
        let (a, b) = tokio::io::duplex(4096);
        let cfg = config(server_root);
        let initiator = Session::initiator(LocalTree::new(local_dir), "alice", cfg.clone());
        let responder = Session::responder(locks, cfg.clone());
        tokio::join!(
            initiator.run(FramedChannel::from_stream(a, &cfg)),
            responder.run(FramedChannel::from_stream(b, &cfg)),
        )
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("username", "alice").is_ok());
        assert!(validate_name("username", "").is_err());
        assert!(validate_name("username", "..").is_err());
        assert!(validate_name("directory name", "a/b").is_err());
        assert!(validate_name("directory name", "a\\b").is_err());
    }

    #[tokio::test]
    async fn test_pull_and_push_over_duplex() {
        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("notes");
        let server_root = tmp.path().join("srv");
        fs::create_dir_all(&local).unwrap();
        fs::create_dir_all(server_root.join("alice-notes")).unwrap();

        let now = now_timestamp();
        fs::write(local.join("a.txt"), "hello").unwrap();
        set_mtime(&local.join("a.txt"), now - 5);
        fs::write(server_root.join("alice-notes/b.txt"), "from server").unwrap();
        set_mtime(&server_root.join("alice-notes/b.txt"), now - 3);

        let locks = DirectoryLockTable::new();
        let (client, server) = pair(&local, &server_root, locks.clone()).await;
        let client = client.unwrap();
        let server = server.unwrap();

        assert_eq!(client.outcome, SessionOutcome::Completed);
        assert_eq!(server.outcome, SessionOutcome::Completed);
        assert_eq!(server.requests_sent, 1);
        assert_eq!(server.files_received, 1);
        assert_eq!(server.bytes_received, 5);
        assert_eq!(client.files_received, 1);

        assert_eq!(
            fs::read_to_string(server_root.join("alice-notes/a.txt")).unwrap(),
            "hello"
        );
        assert_eq!(
            fs::read_to_string(local.join("b.txt")).unwrap(),
            "from server"
        );
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_busy_directory_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("notes");
        let server_root = tmp.path().join("srv");
        fs::create_dir_all(&local).unwrap();
        fs::write(local.join("a.txt"), "hello").unwrap();

        let locks = DirectoryLockTable::new();
        let _held = locks
            .try_acquire(normalize_path(&server_root.join("alice-notes")))
            .unwrap();

        let (client, server) = pair(&local, &server_root, locks.clone()).await;
        assert_eq!(client.unwrap().outcome, SessionOutcome::Busy);
        assert_eq!(server.unwrap().outcome, SessionOutcome::Busy);
        assert!(!server_root.join("alice-notes").exists());
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_responder_rejects_escaping_names() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let (a, b) = tokio::io::duplex(4096);

        let mut client = FramedChannel::from_stream(a, &cfg);
        client
            .send(&Packet::Login(Login {
                username: "..".to_string(),
                directory_name: "x".to_string(),
                files: vec![],
            }))
            .await
            .unwrap();

        let err = Session::responder(DirectoryLockTable::new(), cfg.clone())
            .run(FramedChannel::from_stream(b, &cfg))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::InvalidName { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_before_login_is_unexpected() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let (a, b) = tokio::io::duplex(4096);

        let mut client = FramedChannel::from_stream(a, &cfg);
        client
            .send(&Packet::RequestFile(RequestFile {
                path: "a.txt".to_string(),
            }))
            .await
            .unwrap();

        let err = Session::responder(DirectoryLockTable::new(), cfg.clone())
            .run(FramedChannel::from_stream(b, &cfg))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::Unexpected {
                packet: "RequestFile",
                state: "Idle"
            })
        ));
    }

    #[tokio::test]
    async fn test_logout_before_login_is_unexpected() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let locks = DirectoryLockTable::new();
        let (a, b) = tokio::io::duplex(4096);

        let mut client = FramedChannel::from_stream(a, &cfg);
        client
            .send(&Packet::Logout(Logout::request()))
            .await
            .unwrap();

        let err = Session::responder(locks.clone(), cfg.clone())
            .run(FramedChannel::from_stream(b, &cfg))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::Unexpected {
                packet: "Logout",
                state: "Idle"
            })
        ));
        assert!(locks.is_empty());
        assert!(client.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logout_request_is_answered() {
        let tmp = TempDir::new().unwrap();
        let cfg = Arc::new(SyncConfig {
            root: tmp.path().to_path_buf(),
            read_timeout_secs: 1,
            ..SyncConfig::default()
        });
        let locks = DirectoryLockTable::new();
        let (a, b) = tokio::io::duplex(4096);

        let mut client = FramedChannel::from_stream(a, &cfg);
        client
            .send(&Packet::Login(Login {
                username: "carol".to_string(),
                directory_name: "docs".to_string(),
                files: vec![],
            }))
            .await
            .unwrap();
        client
            .send(&Packet::Logout(Logout::request()))
            .await
            .unwrap();

        let session = Session::responder(locks.clone(), cfg.clone());
        let handle = tokio::spawn(session.run(FramedChannel::from_stream(b, &cfg)));

        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert!(locks.is_empty());
        assert!(tmp.path().join("carol-docs").is_dir());

        let mut replies = Vec::new();
        while let Some(packet) = client.receive().await.unwrap() {
            replies.push(packet);
        }
        assert!(matches!(
            replies.as_slice(),
            [Packet::Logout(a), Packet::Logout(b)] if *a == Logout::request() && *b == Logout::reply()
        ));
    }

    #[tokio::test]
    async fn test_peer_close_releases_lock() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let locks = DirectoryLockTable::new();
        let (a, b) = tokio::io::duplex(4096);

        let mut client = FramedChannel::from_stream(a, &cfg);
        client
            .send(&Packet::Login(Login {
                username: "dave".to_string(),
                directory_name: "docs".to_string(),
                files: vec![],
            }))
            .await
            .unwrap();
        drop(client);

        let report = Session::responder(locks.clone(), cfg.clone())
            .run(FramedChannel::from_stream(b, &cfg))
            .await;
        // The writer may or may not see the closed pipe first
        match report {
            Ok(r) => assert_eq!(r.outcome, SessionOutcome::PeerClosed),
            Err(e) => assert!(matches!(e, SyncError::Transport(_))),
        }
        assert!(locks.is_empty());
    }
}
