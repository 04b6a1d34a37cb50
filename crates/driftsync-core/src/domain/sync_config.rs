//! Sync configuration records
//!
//! A [`SyncConfig`] is the persistent description of one configured
//! sync: where it lives locally, which cloud node it mirrors, which
//! volume it was configured on, and its user-visible run state. It is
//! a plain value record; it carries no references back into the
//! engine.

use serde::{Deserialize, Serialize};

use super::newtypes::{DbId, NodeHandle, SyncTag, VolumeFingerprint};
use super::path::LocalPath;

// ============================================================================
// SyncRunState
// ============================================================================

/// User-visible state of a configured sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunState {
    /// Configured but not yet started.
    #[default]
    Pending,
    /// First full reconciliation after startup is still running.
    InitialScan,
    /// Steady-state bidirectional syncing.
    Active,
    /// Stopped due to an unrecoverable error. Terminal.
    Failed,
    /// Canceled by the user. Terminal.
    Canceled,
    /// Disabled by the user. Terminal.
    Disabled,
}

impl SyncRunState {
    /// Terminal states never transition again and suppress cache writes.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncRunState::Failed | SyncRunState::Canceled | SyncRunState::Disabled
        )
    }

    /// States in which the state cache may be flushed.
    #[must_use]
    pub fn allows_caching(&self) -> bool {
        matches!(self, SyncRunState::Active | SyncRunState::InitialScan)
    }
}

// ============================================================================
// SyncErrorCode
// ============================================================================

/// Why a sync left its healthy state, if it did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorCode {
    /// No error.
    #[default]
    NoError,
    /// The local root path is missing or unreadable.
    LocalPathUnavailable,
    /// The persistence layer failed.
    StorageUnavailable,
    /// Anything else.
    Unknown,
}

// ============================================================================
// SyncConfig
// ============================================================================

/// Persistent record describing one configured sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Stable identifier assigned by the host.
    pub tag: SyncTag,
    /// Absolute local root path.
    pub local_path: LocalPath,
    /// Handle of the cloud root node this sync mirrors.
    pub cloud_root: NodeHandle,
    /// Volume identity recorded when the sync was configured; `None`
    /// until first captured from the filesystem.
    pub volume_fingerprint: Option<VolumeFingerprint>,
    /// User-visible run state.
    pub state: SyncRunState,
    /// Row id in the config table; not part of the record's identity.
    #[serde(skip)]
    pub db_id: DbId,
}

impl SyncConfig {
    /// Create a new configuration in the `Pending` state.
    #[must_use]
    pub fn new(tag: SyncTag, local_path: LocalPath, cloud_root: NodeHandle) -> Self {
        Self {
            tag,
            local_path,
            cloud_root,
            volume_fingerprint: None,
            state: SyncRunState::Pending,
            db_id: DbId::UNSET,
        }
    }
}
