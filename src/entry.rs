//! File entries exchanged during a session.

use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

/// Where an entry's content lives on this side. Never transmitted.
#[derive(Debug)]
pub enum LocalHandle {
    /// An existing file or directory in the local tree. Content is read at send time.
    Path(PathBuf),
    /// Content received from the peer, waiting to be installed into the tree.
    Staged(NamedTempFile),
}

/// One file or directory of a tree listing.
///
/// Two entries are equal when they share `(path, is_dir)`. Conflict resolution
/// only looks at `last_modified`: see [`FileEntry::is_newer_than`].
#[derive(Debug)]
pub struct FileEntry {
    /// Relative, forward-slash separated path.
    pub path: String,
    pub is_dir: bool,
    /// Modification time, epoch seconds.
    pub last_modified: u32,
    /// Content length in bytes. Zero for directories.
    pub size: u32,
    pub local: Option<LocalHandle>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, is_dir: bool, last_modified: u32) -> Self {
        Self {
            path: path.into(),
            is_dir,
            last_modified,
            size: 0,
            local: None,
        }
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    pub fn with_local(mut self, local: LocalHandle) -> Self {
        self.local = Some(local);
        self
    }

    /// Identity used to match entries across the two listings.
    pub fn key(&self) -> (&str, bool) {
        (self.path.as_str(), self.is_dir)
    }

    pub fn is_newer_than(&self, other: &FileEntry) -> bool {
        self.last_modified > other.last_modified
    }
}

impl PartialEq for FileEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for FileEntry {}

impl Hash for FileEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Current wall-clock time as wire epoch seconds.
pub fn now_timestamp() -> u32 {
    clamp_timestamp(Utc::now().timestamp())
}

/// Clamp signed epoch seconds into the wire's `u32` range.
pub fn clamp_timestamp(secs: i64) -> u32 {
    secs.clamp(0, i64::from(u32::MAX)) as u32
}

/// Render a wire timestamp for log output.
pub fn format_timestamp(secs: u32) -> String {
    DateTime::<Utc>::from_timestamp(i64::from(secs), 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_ignores_timestamps() {
        let a = FileEntry::new("docs/a.txt", false, 100).with_size(5);
        let b = FileEntry::new("docs/a.txt", false, 200);
        let dir = FileEntry::new("docs/a.txt", true, 100);

        assert_eq!(a, b);
        assert_ne!(a, dir);

        let set: HashSet<_> = [a, b, dir].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_newer_is_strict() {
        let old = FileEntry::new("x", false, 100);
        let new = FileEntry::new("x", false, 101);
        let same = FileEntry::new("x", false, 100);

        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
        assert!(!same.is_newer_than(&old));
    }

    #[test]
    fn test_clamp_timestamp() {
        assert_eq!(clamp_timestamp(-5), 0);
        assert_eq!(clamp_timestamp(1_700_000_000), 1_700_000_000);
        assert_eq!(clamp_timestamp(i64::MAX), u32::MAX);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(1_234_567_890), "2009-02-13 23:31:30");
    }
}
