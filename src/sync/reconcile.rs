// Listing reconciliation
//
// Compares the responder's local listing with the initiator's Login listing
// and decides, per (path, is_dir) key, whether to pull, push or do nothing.
// Strictly newer wins, and only when the winning timestamp is recent.

use std::collections::HashMap;
use std::time::Duration;

use crate::entry::FileEntry;

/// Transfers decided by one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Remote paths to request, in remote listing order.
    pub pull: Vec<String>,
    /// Local paths to send, in local listing order.
    pub push: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.pull.is_empty() && self.push.is_empty()
    }
}

/// Whether `timestamp` lies inside the recency window ending at `now`.
/// Timestamps ahead of `now` count as inside.
pub fn within_window(timestamp: u32, now: u32, window: Duration) -> bool {
    u64::from(now.saturating_sub(timestamp)) <= window.as_secs()
}

fn index(entries: &[FileEntry]) -> HashMap<(&str, bool), &FileEntry> {
    entries.iter().map(|e| (e.key(), e)).collect()
}

/// Decide which entries to pull and which to push.
pub fn reconcile(local: &[FileEntry], remote: &[FileEntry], now: u32, window: Duration) -> Plan {
    let local_index = index(local);
    let remote_index = index(remote);
    let mut plan = Plan::default();

    for theirs in remote {
        let wanted = match local_index.get(&theirs.key()) {
            Some(ours) => theirs.is_newer_than(ours),
            None => true,
        };
        if wanted && within_window(theirs.last_modified, now, window) {
            plan.pull.push(theirs.path.clone());
        }
    }

    for ours in local {
        let wanted = match remote_index.get(&ours.key()) {
            Some(theirs) => ours.is_newer_than(theirs),
            None => true,
        };
        if wanted && within_window(ours.last_modified, now, window) {
            plan.push.push(ours.path.clone());
        }
    }

    plan
}
