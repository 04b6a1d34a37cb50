//! Domain error kinds
//!
//! Classification of the failures the reconciler routes on. Errors
//! from individual rows never abort a directory pass; they set
//! per-node flags and arm back-off timers, so most of these carry just
//! enough context to log and classify.

use thiserror::Error;

/// Errors that can occur during reconciliation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Transient I/O failure; retried with back-off.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Permanent I/O failure; the node is blocked and surfaced.
    #[error("Permanent I/O error: {0}")]
    PermanentIo(String),

    /// The node cannot be read or used right now; a block timer
    /// governs the retry.
    #[error("Node is blocked: {0}")]
    Blocked(String),

    /// Multiple names collapse under the directory's comparator.
    /// Reported, never auto-resolved.
    #[error("Name conflict: {0}")]
    NameConflict(String),

    /// Local and remote entries of the same name have different types.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// The cloud refused a rename for this account.
    #[error("Cloud rename not permitted: {0}")]
    Unauthorized(String),

    /// An fsid was observed on an entry it cannot belong to (inode
    /// reuse); comparison falls back to content.
    #[error("Inconsistent fsid observed: {0}")]
    InconsistentFsid(String),

    /// Scan target missing or not a directory; results are empty.
    #[error("Scan unavailable: {0}")]
    ScanUnavailable(String),

    /// The keyed state table failed.
    #[error("Storage error: {0}")]
    Storage(String),
}
