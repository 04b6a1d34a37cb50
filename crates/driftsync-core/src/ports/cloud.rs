//! Cloud client port (driven/secondary port)
//!
//! Interface to the remote side. All mutations are fire-and-forget
//! from the reconciler's point of view: commands return immediately
//! and completion is observed indirectly, when server-pushed action
//! packets mutate the cloud tree and a later query returns the changed
//! parent or name. The engine therefore re-derives per-row state every
//! tick instead of tracking command futures.

use crate::domain::fingerprint::FileFingerprint;
use crate::domain::fsnode::NodeKind;
use crate::domain::newtypes::NodeHandle;
use crate::domain::path::LocalPath;

// ============================================================================
// CloudNode
// ============================================================================

/// Value snapshot of one remote node.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudNode {
    /// Server-assigned stable identifier.
    pub handle: NodeHandle,
    /// Handle of the parent node (`UNDEF` for the account root).
    pub parent: NodeHandle,
    /// Display name, cloud-canonical (case sensitive).
    pub name: String,
    /// File or folder.
    pub kind: NodeKind,
    /// Content fingerprint; valid only for files.
    pub fingerprint: FileFingerprint,
    /// Whether commands issued against this node are still in flight.
    /// While true, move detection defers rather than stacking commands.
    pub has_pending_commands: bool,
}

// ============================================================================
// Command results
// ============================================================================

/// Outcome of a cloud mutation command at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudOpStatus {
    /// Command accepted; completion arrives via action packets.
    Ok,
    /// The account is not permitted to perform this operation.
    Unauthorized,
    /// Temporarily unable to submit; retry later.
    Transient,
}

/// Direction of a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Local file to cloud.
    Upload,
    /// Cloud file to local disk.
    Download,
}

/// A folder creation request for `put_nodes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCloudFolder {
    /// Cloud-canonical name of the folder to create.
    pub name: String,
}

/// Everything the transfer subsystem needs to move one file.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSpec {
    /// Upload or download.
    pub direction: TransferDirection,
    /// Local source (upload) or sink (download).
    pub local_path: LocalPath,
    /// Cloud node to download (`UNDEF` for uploads).
    pub cloud_node: NodeHandle,
    /// Cloud parent to upload into (`UNDEF` for downloads).
    pub cloud_parent: NodeHandle,
    /// Target name on the receiving side.
    pub name: String,
}

// ============================================================================
// CloudClient
// ============================================================================

/// Port trait for the cloud transport.
///
/// Implementations must be `Send + Sync`; the engine itself calls from
/// a single thread but hosts commonly share the client elsewhere.
pub trait CloudClient: Send + Sync {
    /// Look up a node by handle. `None` if it no longer exists.
    fn node_by_handle(&self, handle: NodeHandle) -> Option<CloudNode>;

    /// Children of a folder node, in no particular order.
    fn children_of(&self, parent: NodeHandle) -> Vec<CloudNode>;

    /// Move `node` under `new_parent`, optionally renaming it.
    fn rename(
        &self,
        node: NodeHandle,
        new_parent: NodeHandle,
        new_name: Option<&str>,
    ) -> CloudOpStatus;

    /// Rename in place (attribute update only, no reparenting).
    fn set_attributes(&self, node: NodeHandle, new_name: &str) -> CloudOpStatus;

    /// Create folders under `parent`.
    fn put_nodes(&self, parent: NodeHandle, folders: Vec<NewCloudFolder>);

    /// Hand a file transfer to the transfer subsystem.
    fn start_transfer(&self, spec: TransferSpec);

    /// Move a node to the server-side sync debris (trash).
    fn move_to_sync_debris(&self, node: NodeHandle);
}
