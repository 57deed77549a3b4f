//! Packet types for the sync protocol.
//!
//! Frame format: type:u8 | body. Bodies carry no overall length; every
//! decoder reads exactly the fields of its layout, in order.
//!
//! ```text
//! LOGIN (0)        user_len:u8 dir_len:u8 count:u32 | user dir
//!                  then count x (path_len:u8 is_dir:u8 mtime:u32 | path)
//! REQUEST_FILE (1) path_len:u8 | path
//! SEND_FILE (2)    path_len:u8 is_dir:u8 mtime:u32 [size:u32] | path [content]
//! LOGOUT (4)       is_reply:u8 is_busy:u8
//! ```
//!
//! Type 3 is reserved and must stay unassigned.

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::entry::{format_timestamp, FileEntry, LocalHandle};
use crate::error::{ProtocolError, Result, SyncError};
use crate::protocol::codec::{self, WireReader, WireWriter};
use crate::tree::StagingArea;

/// File content travels in chunks of this many bytes; the last one is shorter.
pub const CHUNK_SIZE: usize = 1024;

/// Upper bound on the up-front allocation for a Login file list.
const MAX_PREALLOCATED_ENTRIES: usize = 4096;

// =============================================================================
// Packet Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Login = 0,
    RequestFile = 1,
    SendFile = 2,
    Logout = 4,
}

impl PacketType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Login),
            1 => Some(Self::RequestFile),
            2 => Some(Self::SendFile),
            4 => Some(Self::Logout),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Login => "Login",
            Self::RequestFile => "RequestFile",
            Self::SendFile => "SendFile",
            Self::Logout => "Logout",
        }
    }
}

/// Lengths of the chunks a payload of `size` bytes is split into.
pub fn chunk_lengths(size: usize) -> impl Iterator<Item = usize> {
    (0..size)
        .step_by(CHUNK_SIZE)
        .map(move |offset| CHUNK_SIZE.min(size - offset))
}

// =============================================================================
// LOGIN (0)
// =============================================================================

#[derive(Debug)]
pub struct Login {
    pub username: String,
    pub directory_name: String,
    /// Path, kind and mtime of every entry; sizes are not transmitted.
    pub files: Vec<FileEntry>,
}

impl Login {
    pub fn encode(&self) -> Result<Bytes> {
        let count = u32::try_from(self.files.len()).map_err(|_| ProtocolError::FieldTooLong {
            field: "file list",
            len: self.files.len(),
        })?;

        let mut buf = BytesMut::with_capacity(
            6 + self.username.len()
                + self.directory_name.len()
                + self.files.iter().map(|f| 6 + f.path.len()).sum::<usize>(),
        );
        codec::put_len(&mut buf, "username", self.username.len())?;
        codec::put_len(&mut buf, "directory name", self.directory_name.len())?;
        codec::put_u32(&mut buf, count);
        codec::put_str(&mut buf, &self.username);
        codec::put_str(&mut buf, &self.directory_name);

        for file in &self.files {
            codec::put_len(&mut buf, "path", file.path.len())?;
            codec::put_bool(&mut buf, file.is_dir);
            codec::put_u32(&mut buf, file.last_modified);
            codec::put_str(&mut buf, &file.path);
        }

        Ok(buf.freeze())
    }

    pub async fn decode<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self> {
        let mut fixed: &[u8] = &r.read_array::<6>().await?;
        let username_len = codec::get_len(&mut fixed);
        let directory_len = codec::get_len(&mut fixed);
        let count = codec::get_u32(&mut fixed) as usize;

        let username = r.read_string(username_len, "username").await?;
        let directory_name = r.read_string(directory_len, "directory name").await?;
        trace!(%username, %directory_name, count, "decoding login");

        let mut files = Vec::with_capacity(count.min(MAX_PREALLOCATED_ENTRIES));
        for _ in 0..count {
            let mut fixed: &[u8] = &r.read_array::<6>().await?;
            let path_len = codec::get_len(&mut fixed);
            let is_dir = codec::get_bool(&mut fixed);
            let last_modified = codec::get_u32(&mut fixed);
            let path = r.read_string(path_len, "path").await?;
            trace!(
                %path,
                is_dir,
                modified = %format_timestamp(last_modified),
                "login entry"
            );
            files.push(FileEntry::new(path, is_dir, last_modified));
        }

        Ok(Self {
            username,
            directory_name,
            files,
        })
    }
}

// =============================================================================
// REQUEST_FILE (1)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFile {
    pub path: String,
}

impl RequestFile {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(1 + self.path.len());
        codec::put_len(&mut buf, "path", self.path.len())?;
        codec::put_str(&mut buf, &self.path);
        Ok(buf.freeze())
    }

    pub async fn decode<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self> {
        let [path_len] = r.read_array::<1>().await?;
        let path = r.read_string(usize::from(path_len), "path").await?;
        trace!(%path, "decoded request");
        Ok(Self { path })
    }
}

// =============================================================================
// SEND_FILE (2)
// =============================================================================

/// One entry plus, for files, its content.
///
/// Outbound content is read from `entry.local` while sending. Inbound content
/// is streamed into a staged temp file that [`crate::tree::LocalTree::apply`]
/// installs.
#[derive(Debug)]
pub struct SendFile {
    pub entry: FileEntry,
}

impl SendFile {
    /// Fixed fields and path, declaring `size` content bytes.
    pub fn encode_header(&self, size: u32) -> Result<Bytes> {
        let entry = &self.entry;
        let mut buf = BytesMut::with_capacity(10 + entry.path.len());
        codec::put_len(&mut buf, "path", entry.path.len())?;
        codec::put_bool(&mut buf, entry.is_dir);
        codec::put_u32(&mut buf, entry.last_modified);
        if !entry.is_dir {
            codec::put_u32(&mut buf, size);
        }
        codec::put_str(&mut buf, &entry.path);
        Ok(buf.freeze())
    }

    /// The declared size is taken from the content as opened now, not from
    /// the listing the entry came from.
    pub async fn send<W: AsyncWrite + Unpin>(&self, w: &mut WireWriter<W>) -> Result<()> {
        if self.entry.is_dir {
            return w.write_all(&self.encode_header(0)?).await;
        }

        let (mut file, source) = self.open_content().await?;
        let len = file
            .metadata()
            .await
            .map_err(|e| SyncError::io(&source, e))?
            .len();
        let size = u32::try_from(len).map_err(|_| ProtocolError::FileTooLarge {
            path: self.entry.path.clone(),
            size: len,
        })?;
        if size != self.entry.size {
            debug!(
                path = %self.entry.path,
                listed = self.entry.size,
                size,
                "size changed since listing"
            );
        }

        w.write_all(&self.encode_header(size)?).await?;
        let mut buf = [0u8; CHUNK_SIZE];
        for len in chunk_lengths(size as usize) {
            file.read_exact(&mut buf[..len])
                .await
                .map_err(|e| SyncError::io(&source, e))?;
            w.write_all(&buf[..len]).await?;
        }
        Ok(())
    }

    async fn open_content(&self) -> Result<(File, std::path::PathBuf)> {
        match &self.entry.local {
            Some(LocalHandle::Path(path)) => {
                let file = File::open(path)
                    .await
                    .map_err(|e| SyncError::io(path, e))?;
                Ok((file, path.clone()))
            }
            Some(LocalHandle::Staged(temp)) => {
                let file = temp.reopen().map_err(|e| SyncError::io(temp.path(), e))?;
                Ok((File::from_std(file), temp.path().to_path_buf()))
            }
            None => Err(SyncError::io(
                &self.entry.path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no local content"),
            )),
        }
    }

    pub async fn decode<R: AsyncRead + Unpin>(
        r: &mut WireReader<R>,
        staging: Option<&StagingArea>,
    ) -> Result<Self> {
        let mut fixed: &[u8] = &r.read_array::<6>().await?;
        let path_len = codec::get_len(&mut fixed);
        let is_dir = codec::get_bool(&mut fixed);
        let last_modified = codec::get_u32(&mut fixed);
        let size = if is_dir {
            0
        } else {
            let mut raw: &[u8] = &r.read_array::<4>().await?;
            codec::get_u32(&mut raw)
        };
        let path = r.read_string(path_len, "path").await?;
        trace!(
            %path,
            is_dir,
            size,
            modified = %format_timestamp(last_modified),
            "decoding send file"
        );

        let mut entry = FileEntry::new(path, is_dir, last_modified).with_size(size);
        if is_dir {
            return Ok(Self { entry });
        }

        let staging = staging.ok_or(ProtocolError::Unexpected {
            packet: PacketType::SendFile.name(),
            state: "Idle",
        })?;
        let (temp, mut file) = staging.create().await?;
        let mut buf = [0u8; CHUNK_SIZE];
        for len in chunk_lengths(size as usize) {
            r.read_exact(&mut buf[..len]).await?;
            file.write_all(&buf[..len])
                .await
                .map_err(|e| SyncError::io(temp.path(), e))?;
        }
        file.flush().await.map_err(|e| SyncError::io(temp.path(), e))?;
        file.sync_all()
            .await
            .map_err(|e| SyncError::io(temp.path(), e))?;

        entry.local = Some(LocalHandle::Staged(temp));
        Ok(Self { entry })
    }
}

// =============================================================================
// LOGOUT (4)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Logout {
    pub is_reply: bool,
    pub is_busy: bool,
}

impl Logout {
    /// Opens the logout exchange after the reconciliation output.
    pub fn request() -> Self {
        Self {
            is_reply: false,
            is_busy: false,
        }
    }

    /// Rejection sent when the directory is already being synchronized.
    pub fn busy() -> Self {
        Self {
            is_reply: false,
            is_busy: true,
        }
    }

    pub fn reply() -> Self {
        Self {
            is_reply: true,
            is_busy: false,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2);
        codec::put_bool(&mut buf, self.is_reply);
        codec::put_bool(&mut buf, self.is_busy);
        buf.freeze()
    }

    pub async fn decode<R: AsyncRead + Unpin>(r: &mut WireReader<R>) -> Result<Self> {
        let mut fixed: &[u8] = &r.read_array::<2>().await?;
        let is_reply = codec::get_bool(&mut fixed);
        let is_busy = codec::get_bool(&mut fixed);
        trace!(is_reply, is_busy, "decoded logout");
        Ok(Self { is_reply, is_busy })
    }
}

// =============================================================================
// Packet
// =============================================================================

#[derive(Debug)]
pub enum Packet {
    Login(Login),
    RequestFile(RequestFile),
    SendFile(SendFile),
    Logout(Logout),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Login(_) => PacketType::Login,
            Self::RequestFile(_) => PacketType::RequestFile,
            Self::SendFile(_) => PacketType::SendFile,
            Self::Logout(_) => PacketType::Logout,
        }
    }

    /// Write the body. The type byte is written by the framed channel.
    pub async fn send_body<W: AsyncWrite + Unpin>(&self, w: &mut WireWriter<W>) -> Result<()> {
        match self {
            Self::Login(p) => w.write_all(&p.encode()?).await,
            Self::RequestFile(p) => w.write_all(&p.encode()?).await,
            Self::SendFile(p) => p.send(w).await,
            Self::Logout(p) => w.write_all(&p.encode()).await,
        }
    }

    pub async fn decode<R: AsyncRead + Unpin>(
        packet_type: PacketType,
        r: &mut WireReader<R>,
        staging: Option<&StagingArea>,
    ) -> Result<Self> {
        Ok(match packet_type {
            PacketType::Login => Self::Login(Login::decode(r).await?),
            PacketType::RequestFile => Self::RequestFile(RequestFile::decode(r).await?),
            PacketType::SendFile => Self::SendFile(SendFile::decode(r, staging).await?),
            PacketType::Logout => Self::Logout(Logout::decode(r).await?),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
