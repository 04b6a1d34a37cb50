//! File fingerprints
//!
//! A fingerprint is the content identity of a file: size, mtime, and a
//! content-derived checksum. Two files with matching fingerprints are
//! treated as identical for sync purposes. Directories never carry a
//! valid fingerprint.

use serde::{Deserialize, Serialize};

/// Content identity of a file: `(size, mtime, checksum)`.
///
/// The checksum is a 32-byte SHA-256 digest of the file contents,
/// computed by the scan service. `valid` is false for directories,
/// unreadable entries, and unknown-type nodes; an invalid fingerprint
/// never matches anything, including another invalid one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// File size in bytes.
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    /// SHA-256 digest of the file content.
    pub checksum: [u8; 32],
    /// Whether this fingerprint was actually computed.
    pub valid: bool,
}

impl FileFingerprint {
    /// A fingerprint that matches nothing.
    #[must_use]
    pub fn invalid() -> Self {
        Self {
            size: 0,
            mtime: 0,
            checksum: [0u8; 32],
            valid: false,
        }
    }

    /// Build a fingerprint from already-computed parts.
    #[must_use]
    pub fn new(size: u64, mtime: i64, checksum: [u8; 32]) -> Self {
        Self {
            size,
            mtime,
            checksum,
            valid: true,
        }
    }

    /// Content equality: both fingerprints valid and size, mtime and
    /// checksum all equal.
    #[must_use]
    pub fn matches(&self, other: &FileFingerprint) -> bool {
        self.valid
            && other.valid
            && self.size == other.size
            && self.mtime == other.mtime
            && self.checksum == other.checksum
    }
}

impl Default for FileFingerprint {
    fn default() -> Self {
        Self::invalid()
    }
}
