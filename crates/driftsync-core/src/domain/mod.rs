//! Domain model
//!
//! Value types shared by the engine and its ports: identifiers, paths,
//! fingerprints, filesystem snapshots, tri-state tree flags, sync
//! configuration records, and domain errors.

pub mod errors;
pub mod fingerprint;
pub mod fsnode;
pub mod newtypes;
pub mod path;
pub mod sync_config;
pub mod treestate;

pub use errors::EngineError;
pub use fingerprint::FileFingerprint;
pub use fsnode::{FsNode, NodeKind};
pub use newtypes::{DbId, Fsid, NodeHandle, SyncTag, VolumeFingerprint};
pub use path::{LocalPath, NameComparison};
pub use sync_config::{SyncConfig, SyncErrorCode, SyncRunState};
pub use treestate::TreeState;
