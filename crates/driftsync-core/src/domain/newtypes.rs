//! Domain newtypes for identifiers
//!
//! Strongly-typed wrappers for the identifiers the engine juggles:
//! filesystem-stable ids, cloud node handles, sync tags, database row
//! ids, and volume fingerprints. The fsid and handle types carry an
//! explicit `UNDEF` sentinel because "identity unknown" is a normal,
//! persistent state for a node (e.g. restored from an old cache on a
//! filesystem without stable ids).

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

// ============================================================================
// Fsid
// ============================================================================

/// Filesystem-stable identifier for a file or directory (inode-like).
///
/// Used for move/rename detection. May be reissued by the filesystem
/// after a deletion, so a matching fsid alone never proves identity;
/// callers additionally compare type, mtime and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fsid(u64);

impl Fsid {
    /// Sentinel for "no fsid known".
    pub const UNDEF: Fsid = Fsid(u64::MAX);

    /// Create an Fsid from a raw filesystem id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw id value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true if this is the `UNDEF` sentinel.
    #[must_use]
    pub const fn is_undef(&self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for Fsid {
    fn default() -> Self {
        Self::UNDEF
    }
}

impl Display for Fsid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_undef() {
            write!(f, "fsid:undef")
        } else {
            write!(f, "fsid:{:x}", self.0)
        }
    }
}

// ============================================================================
// NodeHandle
// ============================================================================

/// Stable server-assigned identifier for a remote (cloud) node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(u64);

impl NodeHandle {
    /// Sentinel for "no handle known".
    pub const UNDEF: NodeHandle = NodeHandle(u64::MAX);

    /// Create a NodeHandle from a raw server id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw handle value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true if this is the `UNDEF` sentinel.
    #[must_use]
    pub const fn is_undef(&self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for NodeHandle {
    fn default() -> Self {
        Self::UNDEF
    }
}

impl Display for NodeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_undef() {
            write!(f, "handle:undef")
        } else {
            write!(f, "handle:{:x}", self.0)
        }
    }
}

// ============================================================================
// SyncTag
// ============================================================================

/// Stable integer tag identifying one configured sync.
///
/// Assigned by the host when the sync is configured; used to key the
/// sync-config registry and to correlate state changes back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncTag(i32);

impl SyncTag {
    /// Create a SyncTag from a raw tag value.
    #[must_use]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Get the raw tag value.
    #[must_use]
    pub const fn as_i32(&self) -> i32 {
        self.0
    }
}

impl Display for SyncTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// DbId
// ============================================================================

/// Row id inside a keyed state table. Zero means "not stored yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DbId(u32);

impl DbId {
    /// The "not stored" sentinel.
    pub const UNSET: DbId = DbId(0);

    /// Create a DbId from a raw row id.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw row id.
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns true if this row has been assigned an id.
    #[must_use]
    pub const fn is_set(&self) -> bool {
        self.0 != 0
    }
}

impl Display for DbId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// VolumeFingerprint
// ============================================================================

/// Identity of the filesystem volume a sync root lives on.
///
/// fsids are only comparable within one volume; the engine records the
/// volume fingerprint at configuration time and refuses fsid-based move
/// detection when it no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeFingerprint(u64);

impl VolumeFingerprint {
    /// Create a VolumeFingerprint from a raw volume id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw volume id.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for VolumeFingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "vol:{:x}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
