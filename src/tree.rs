//! Local directory tree access.
//!
//! Listing, current metadata, staged writes and mtime handling for one
//! synchronization root. This is the only source of truth for what exists
//! locally.

use std::io;
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use ignore::WalkBuilder;
use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tracing::{debug, warn};

use crate::entry::{clamp_timestamp, FileEntry, LocalHandle};
use crate::error::{ProtocolError, Result, SyncError};
use crate::protocol::codec::MAX_SHORT_LEN;

/// Name prefix of in-flight staged files. Never listed.
pub const STAGING_PREFIX: &str = ".treesync-";

/// Validate that a received relative path is safe and doesn't escape the root.
/// Returns the full path if valid.
pub fn validate_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let invalid = |reason| ProtocolError::InvalidPath {
        path: relative.to_string(),
        reason,
    };

    if relative.is_empty() {
        return Err(invalid("empty path").into());
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() || relative.starts_with('/') {
        return Err(invalid("absolute path").into());
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => return Err(invalid("parent traversal").into()),
            Component::Prefix(_) | Component::RootDir => {
                return Err(invalid("absolute path").into())
            }
            _ => {}
        }
    }

    let full = root.join(rel_path);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        return Err(invalid("escapes root").into());
    }

    Ok(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

/// Directory in which received content is staged before it is installed.
///
/// Staging lives inside the tree so installation is a same-filesystem rename.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create an empty staged file and an async handle for writing it.
    pub async fn create(&self) -> Result<(NamedTempFile, File)> {
        let dir = self.dir.clone();
        let temp = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(STAGING_PREFIX)
                .tempfile_in(&dir)
                .map_err(|e| SyncError::io(&dir, e))
        })
        .await??;
        let file = temp.reopen().map_err(|e| SyncError::io(temp.path(), e))?;
        Ok((temp, File::from_std(file)))
    }
}

/// One synchronization root on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalTree {
    root: PathBuf,
}

impl LocalTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging(&self) -> StagingArea {
        StagingArea::new(&self.root)
    }

    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| SyncError::io(&self.root, e))
    }

    /// Recursively list the tree.
    ///
    /// Order is deterministic (sorted by name) and every directory comes after
    /// all of its descendants.
    pub async fn list(&self) -> Result<Vec<FileEntry>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || list_tree(&root)).await?
    }

    /// Current metadata of one entry, or `None` if it no longer exists.
    pub async fn entry(&self, relative: &str) -> Result<Option<FileEntry>> {
        let full = validate_path(&self.root, relative)?;
        let meta = match fs::symlink_metadata(&full).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::io(&full, e)),
        };
        if !meta.is_dir() && !meta.is_file() {
            return Ok(None);
        }

        let entry = entry_from_metadata(relative, &meta)?;
        Ok(Some(entry.with_local(LocalHandle::Path(full))))
    }

    /// Reject `dest` if its deepest existing ancestor resolves outside the
    /// root, e.g. through a symlinked directory inside the tree.
    async fn ensure_contained(&self, relative: &str, dest: &Path) -> Result<()> {
        let root = fs::canonicalize(&self.root)
            .await
            .map_err(|e| SyncError::io(&self.root, e))?;

        let Some(parent) = dest.parent() else {
            return Ok(());
        };
        for ancestor in parent.ancestors() {
            match fs::canonicalize(ancestor).await {
                Ok(resolved) if resolved.starts_with(&root) => return Ok(()),
                Ok(_) => {
                    return Err(ProtocolError::InvalidPath {
                        path: relative.to_string(),
                        reason: "escapes root",
                    }
                    .into())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SyncError::io(ancestor, e)),
            }
        }
        Ok(())
    }

    /// Install a received entry and set its mtime to the declared value.
    pub async fn apply(&self, entry: FileEntry) -> Result<()> {
        let dest = validate_path(&self.root, &entry.path)?;
        self.ensure_contained(&entry.path, &dest).await?;
        let existing = fs::symlink_metadata(&dest).await.ok();

        if entry.is_dir {
            if existing.as_ref().is_some_and(|m| !m.is_dir()) {
                fs::remove_file(&dest)
                    .await
                    .map_err(|e| SyncError::io(&dest, e))?;
            }
            fs::create_dir_all(&dest)
                .await
                .map_err(|e| SyncError::io(&dest, e))?;
        } else {
            let temp = match entry.local {
                Some(LocalHandle::Staged(temp)) => temp,
                _ => {
                    return Err(SyncError::io(
                        &dest,
                        io::Error::new(io::ErrorKind::InvalidInput, "no staged content"),
                    ))
                }
            };

            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SyncError::io(parent, e))?;
            }
            if existing.as_ref().is_some_and(|m| m.is_dir()) {
                fs::remove_dir(&dest)
                    .await
                    .map_err(|e| SyncError::io(&dest, e))?;
            }

            // Staged files are created owner-only
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o644);
                if let Err(e) = fs::set_permissions(temp.path(), perms).await {
                    warn!("Failed to set permissions on {}: {}", dest.display(), e);
                }
            }

            let target = dest.clone();
            tokio::task::spawn_blocking(move || {
                temp.persist(&target)
                    .map(|_| ())
                    .map_err(|e| SyncError::io(&target, e.error))
            })
            .await??;
        }

        let mtime = FileTime::from_unix_time(i64::from(entry.last_modified), 0);
        let target = dest.clone();
        tokio::task::spawn_blocking(move || {
            filetime::set_file_times(&target, mtime, mtime).map_err(|e| SyncError::io(&target, e))
        })
        .await??;

        debug!(path = %entry.path, is_dir = entry.is_dir, "applied entry");
        Ok(())
    }
}

fn entry_from_metadata(relative: &str, meta: &std::fs::Metadata) -> Result<FileEntry> {
    let last_modified = clamp_timestamp(FileTime::from_last_modification_time(meta).unix_seconds());
    if meta.is_dir() {
        return Ok(FileEntry::new(relative, true, last_modified));
    }

    let size = u32::try_from(meta.len()).map_err(|_| ProtocolError::FileTooLarge {
        path: relative.to_string(),
        size: meta.len(),
    })?;
    Ok(FileEntry::new(relative, false, last_modified).with_size(size))
}

/// Forward-slash relative key for `path`, or `None` if it is not valid UTF-8.
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

fn list_tree(root: &Path) -> Result<Vec<FileEntry>> {
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut entries = Vec::new();
    // Directories wait here until the walk leaves their subtree
    let mut open_dirs: Vec<(usize, FileEntry)> = Vec::new();

    for result in walker {
        let dent = result.map_err(|e| SyncError::io(root, io::Error::new(io::ErrorKind::Other, e)))?;
        let depth = dent.depth();
        if depth == 0 {
            continue;
        }

        while open_dirs.last().is_some_and(|(d, _)| *d >= depth) {
            if let Some((_, dir)) = open_dirs.pop() {
                entries.push(dir);
            }
        }

        if dent
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(STAGING_PREFIX))
        {
            continue;
        }

        let Some(file_type) = dent.file_type() else {
            continue;
        };
        if !file_type.is_dir() && !file_type.is_file() {
            warn!(path = %dent.path().display(), "skipping symlink or special file");
            continue;
        }

        let Some(rel) = relative_key(root, dent.path()) else {
            warn!(path = %dent.path().display(), "skipping non UTF-8 path");
            continue;
        };
        if rel.len() > MAX_SHORT_LEN {
            warn!(path = %rel, "skipping path longer than 255 bytes");
            continue;
        }

        let meta = dent
            .metadata()
            .map_err(|e| SyncError::io(dent.path(), io::Error::new(io::ErrorKind::Other, e)))?;
        let entry = match entry_from_metadata(&rel, &meta) {
            Ok(entry) => entry.with_local(LocalHandle::Path(dent.path().to_path_buf())),
            Err(e) => {
                warn!(path = %rel, error = %e, "skipping entry");
                continue;
            }
        };

        if file_type.is_dir() {
            open_dirs.push((depth, entry));
        } else {
            entries.push(entry);
        }
    }

    while let Some((_, dir)) = open_dirs.pop() {
        entries.push(dir);
    }

    Ok(entries)
}
