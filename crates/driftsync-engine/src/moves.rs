//! Move/rename detection support
//!
//! Move detection keys on stable identifiers: an fsid seen at a new
//! path means the local entry moved, a cloud handle seen under a new
//! parent means the remote node moved. Both lookups live here,
//! together with the guard that keeps us from "moving" a file that is
//! actually still being rewritten by some application (editors often
//! move the original aside as a temporary backup before writing).

use std::collections::HashMap;

use driftsync_core::domain::{FsNode, LocalPath, NodeHandle};
use driftsync_core::ports::Filesystem;
use tracing::{debug, warn};

use crate::tree::{LocalTree, NodeId};

// ============================================================================
// fsid / handle lookups
// ============================================================================

/// Outcome of looking up a filesystem entry's fsid in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsidLookup {
    /// No node carries this fsid.
    NotFound,
    /// A node carries it, but its recorded mtime/size disagree: the
    /// filesystem reissued the id after a delete/create cycle. The
    /// observed fsid must be detached and comparison falls back to
    /// content.
    Mismatch(NodeId),
    /// A plausible move source.
    Found(NodeId),
}

/// Find the node a local move originated from, by fsid.
///
/// The index is per sync, so the volume is already the right one;
/// type must match, and for files mtime and size as well - an fsid
/// match with different content identity is coincidental reuse.
#[must_use]
pub fn find_source_by_fsid(tree: &LocalTree, fs_node: &FsNode) -> FsidLookup {
    let mut mismatch = None;

    for id in tree.nodes_with_fsid(fs_node.fsid) {
        let node = tree.node(id);
        if node.kind != fs_node.kind {
            continue;
        }
        if node.kind.is_file()
            && (node.fingerprint.mtime != fs_node.mtime || node.fingerprint.size != fs_node.size)
        {
            mismatch.get_or_insert(id);
            continue;
        }
        return FsidLookup::Found(id);
    }

    match mismatch {
        Some(id) => FsidLookup::Mismatch(id),
        None => FsidLookup::NotFound,
    }
}

/// Find the node a cloud move originated from, by synced handle.
///
/// Only accepts nodes whose path still exists on disk - a node whose
/// local entry is already gone is a deletion in progress, not a move
/// source.
#[must_use]
pub fn find_source_by_handle(
    tree: &LocalTree,
    fs: &dyn Filesystem,
    handle: NodeHandle,
) -> Option<NodeId> {
    tree.nodes_with_handle(handle)
        .into_iter()
        .find(|&id| fs.exists(&tree.local_path_of(id)))
}

// ============================================================================
// FileChangeGuard
// ============================================================================

/// Stability window: size and mtime must hold still this long.
const STABILITY_WINDOW_SECS: i64 = 3;

/// Give up waiting after this long and proceed.
const MAX_WAIT_SECS: i64 = 60;

/// Three-valued stability verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeState {
    /// Size and mtime held still across the window; safe to act.
    Stable,
    /// Still settling (or too recently observed); defer.
    Waiting,
    /// The absolute timeout elapsed without stability; act anyway,
    /// but loudly.
    TimedOut,
}

#[derive(Debug)]
struct Watch {
    first_seen: i64,
    last_check: i64,
    last_size: u64,
}

/// Process-wide map of paths under observation for stability.
#[derive(Debug, Default)]
pub struct FileChangeGuard {
    watches: HashMap<LocalPath, Watch>,
}

impl FileChangeGuard {
    /// Create an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether the file at `path` has stopped changing.
    ///
    /// Call once per tick while deferring a move; the watch state is
    /// dropped as soon as the file is stable, gone, or timed out.
    pub fn check(
        &mut self,
        fs: &dyn Filesystem,
        path: &LocalPath,
        now_secs: i64,
    ) -> FileChangeState {
        let first_seen = self
            .watches
            .entry(path.clone())
            .or_insert(Watch {
                first_seen: now_secs,
                last_check: 0,
                last_size: u64::MAX,
            })
            .first_seen;

        if now_secs - first_seen > MAX_WAIT_SECS {
            warn!(path = %path, "timeout waiting for file to stop changing");
            self.watches.remove(path);
            return FileChangeState::TimedOut;
        }

        let verdict = match fs.open(path) {
            Ok(handle) => {
                debug!(path = %path, "file detected at the origin of a move");
                let watch = self.watches.get_mut(path).expect("watch just inserted");

                if now_secs - watch.last_check < STABILITY_WINDOW_SECS {
                    debug!(path = %path, "checked too recently, waiting");
                    FileChangeState::Waiting
                } else if handle.size() != watch.last_size {
                    debug!(
                        path = %path,
                        size = handle.size(),
                        last = watch.last_size,
                        "size changed since last check, waiting"
                    );
                    watch.last_size = handle.size();
                    watch.last_check = now_secs;
                    FileChangeState::Waiting
                } else if now_secs - handle.mtime() < STABILITY_WINDOW_SECS {
                    debug!(path = %path, "modified too recently, waiting");
                    FileChangeState::Waiting
                } else {
                    debug!(path = %path, "size and mtime stable");
                    FileChangeState::Stable
                }
            }
            Err(e) if e.is_transient() => {
                debug!(path = %path, "origin temporarily blocked, waiting");
                FileChangeState::Waiting
            }
            Err(_) => {
                debug!(path = %path, "nothing at the origin path");
                FileChangeState::Stable
            }
        };

        if verdict == FileChangeState::Stable {
            self.watches.remove(path);
        }
        verdict
    }

    /// Number of paths currently under observation.
    #[must_use]
    pub fn watched(&self) -> usize {
        self.watches.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
