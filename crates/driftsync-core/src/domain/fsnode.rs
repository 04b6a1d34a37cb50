//! Filesystem snapshots
//!
//! [`FsNode`] is an immutable snapshot of one filesystem entry as seen
//! by the scan service. The reconciler joins these against the synced
//! state and the cloud children to build triplets; it never mutates
//! them except to detach a coincidentally-reused fsid.

use serde::{Deserialize, Serialize};

use super::fingerprint::FileFingerprint;
use super::newtypes::Fsid;

// ============================================================================
// NodeKind
// ============================================================================

/// What kind of entry a node is.
///
/// `Unknown` marks entries the scanner could not stat (blocked by a
/// transient error); they are retried via the scan-blocked back-off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A regular file.
    File,
    /// A directory.
    Dir,
    /// Could not be determined.
    #[default]
    Unknown,
}

impl NodeKind {
    /// Returns true for directories.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self, NodeKind::Dir)
    }

    /// Returns true for regular files.
    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(self, NodeKind::File)
    }

    /// Returns true when the kind could not be determined.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, NodeKind::Unknown)
    }
}

// ============================================================================
// FsNode
// ============================================================================

/// Snapshot of one filesystem entry, produced by the scan service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsNode {
    /// The entry's name on disk.
    pub local_name: String,
    /// Cloud-canonical form of the name.
    pub name: String,
    /// File, directory, or unreadable.
    pub kind: NodeKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    /// Filesystem-stable id, or `UNDEF` when unavailable.
    pub fsid: Fsid,
    /// Legacy secondary ("short") name, when the volume has one.
    pub shortname: Option<String>,
    /// Whether the entry is a symlink.
    pub is_symlink: bool,
    /// Whether the entry could not be read due to a transient error.
    pub is_blocked: bool,
    /// Content fingerprint; valid only for files.
    pub fingerprint: FileFingerprint,
}

impl FsNode {
    /// Snapshot for an entry that could not be opened.
    ///
    /// `blocked` mirrors the filesystem's transient flag: a transient
    /// failure means "retry later", a permanent one means the entry is
    /// simply unreadable.
    #[must_use]
    pub fn unreadable(local_name: String, blocked: bool) -> Self {
        Self {
            name: local_name.clone(),
            local_name,
            kind: NodeKind::Unknown,
            size: 0,
            mtime: 0,
            fsid: Fsid::UNDEF,
            shortname: None,
            is_symlink: false,
            is_blocked: blocked,
            fingerprint: FileFingerprint::invalid(),
        }
    }
}
