//! Crash-safe state cache
//!
//! Persists the [`LocalTree`] into a keyed append-update table so a
//! restart resumes from the last synced state instead of re-uploading
//! the world. The reconciler queues additions and deletions as it
//! mutates the tree; a cache tick applies all deletions, then drains
//! additions in repeated sweeps - a node may only be written once its
//! parent has a row id - until a full pass makes no progress. Any
//! residue is a caching failure and is logged as such.
//!
//! Restore walks the stored rows grouped by parent row id and rebuilds
//! the tree depth-first (bounded, to contain a corrupt cache), then
//! re-indexes the fsid and cloud-handle maps. Rows from older caches
//! that never recorded a shortname get one refreshed from the
//! filesystem on first encounter and are queued for rewrite.

use std::collections::{HashMap, HashSet};

use base64::Engine;
use driftsync_core::domain::{
    DbId, EngineError, FileFingerprint, FsNode, Fsid, LocalPath, NodeHandle, NodeKind, SyncRunState,
};
use driftsync_core::ports::{Filesystem, StateTable};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::tree::{LocalNode, LocalTree, NodeId};

/// Restore refuses to build deeper than this; a well-formed cache
/// never gets close.
const MAX_RESTORE_DEPTH: u32 = 100;

// ============================================================================
// Table naming
// ============================================================================

/// Name of the node table for one sync: base64 of
/// `(local root fsid ‖ cloud root handle ‖ user id)`.
#[must_use]
pub fn state_table_name(root_fsid: Fsid, cloud_root: NodeHandle, user_id: u64) -> String {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&root_fsid.as_u64().to_le_bytes());
    key[8..16].copy_from_slice(&cloud_root.as_u64().to_le_bytes());
    key[16..].copy_from_slice(&user_id.to_le_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key)
}

// ============================================================================
// Row codec
// ============================================================================

/// Serialized form of one [`LocalNode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedNodeRow {
    /// Row id of the parent (0 for children of the root).
    pub parent_db_id: u32,
    /// Name on disk.
    pub local_name: String,
    /// Shortname, when recorded.
    #[serde(default)]
    pub shortname: Option<String>,
    /// Whether the writing version recorded shortnames at all; older
    /// caches did not, and absent means "refresh from disk".
    #[serde(default)]
    pub shortname_recorded: bool,
    /// File or directory.
    pub kind: NodeKind,
    /// Filesystem-stable id at last sync.
    pub fsid: Fsid,
    /// Modification time at last sync.
    pub mtime: i64,
    /// Size at last sync.
    pub size: u64,
    /// Content checksum; `None` for directories.
    pub checksum: Option<[u8; 32]>,
    /// Cloud handle this node was last synced against.
    pub synced_handle: NodeHandle,
}

impl CachedNodeRow {
    fn from_node(node: &LocalNode, parent_db_id: DbId) -> Self {
        Self {
            parent_db_id: parent_db_id.as_u32(),
            local_name: node.local_name.clone(),
            shortname: node.shortname.clone(),
            shortname_recorded: true,
            kind: node.kind,
            fsid: node.fsid,
            mtime: node.fingerprint.mtime,
            size: node.fingerprint.size,
            checksum: node.fingerprint.valid.then_some(node.fingerprint.checksum),
            synced_handle: node.synced_handle,
        }
    }

    fn fingerprint(&self) -> FileFingerprint {
        match self.checksum {
            Some(checksum) => FileFingerprint::new(self.size, self.mtime, checksum),
            None => FileFingerprint::invalid(),
        }
    }
}

fn encode_row(row: &CachedNodeRow) -> Vec<u8> {
    serde_json::to_vec(row).expect("cached node row serializes")
}

fn decode_row(bytes: &[u8]) -> Result<CachedNodeRow, EngineError> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::Storage(e.to_string()))
}

// ============================================================================
// StateCache
// ============================================================================

/// Pending cache work for one sync.
pub struct StateCache {
    table: Option<Box<dyn StateTable>>,
    insertq: HashSet<NodeId>,
    deleteq: HashSet<DbId>,
}

impl StateCache {
    /// Create a cache over `table`; `None` disables persistence (the
    /// queues become no-ops).
    #[must_use]
    pub fn new(table: Option<Box<dyn StateTable>>) -> Self {
        Self {
            table,
            insertq: HashSet::new(),
            deleteq: HashSet::new(),
        }
    }

    /// Whether a backing table is attached.
    #[must_use]
    pub fn has_table(&self) -> bool {
        self.table.is_some()
    }

    /// Pending addition count (for diagnostics and tests).
    #[must_use]
    pub fn pending_additions(&self) -> usize {
        self.insertq.len()
    }

    /// Queue a node for (re)write. No-op in terminal states.
    pub fn add(&mut self, state: SyncRunState, tree: &LocalTree, id: NodeId) {
        if state.is_terminal() {
            return;
        }
        let db_id = tree.node(id).db_id;
        if db_id.is_set() {
            self.deleteq.remove(&db_id);
        }
        self.insertq.insert(id);
    }

    /// Queue stored rows for deletion (from a removed subtree).
    /// No-op in terminal states.
    pub fn queue_row_deletions(
        &mut self,
        state: SyncRunState,
        rows: impl IntoIterator<Item = DbId>,
    ) {
        if state.is_terminal() {
            return;
        }
        for row in rows {
            self.deleteq.insert(row);
        }
    }

    /// Apply queued work to the table.
    ///
    /// Deletions first, then additions in repeated parent-gated
    /// sweeps. Residual additions (an orphan whose parent never got a
    /// row) are kept queued and reported.
    pub fn flush(&mut self, state: SyncRunState, tree: &mut LocalTree) {
        let Some(table) = self.table.as_mut() else {
            return;
        };
        if !state.allows_caching() {
            return;
        }
        if self.insertq.is_empty() && self.deleteq.is_empty() {
            return;
        }

        debug!(
            additions = self.insertq.len(),
            deletions = self.deleteq.len(),
            "saving local-node database"
        );

        table.begin();

        for row in self.deleteq.drain() {
            if let Err(e) = table.del(row) {
                warn!(row = %row, error = %e, "failed to delete cached row");
            }
        }

        let root = tree.root();
        let mut remaining: Vec<NodeId> = self
            .insertq
            .drain()
            .filter(|&id| tree.contains(id))
            .collect();

        loop {
            let mut progressed = false;
            let mut next = Vec::new();

            for id in remaining {
                let node = tree.node(id);
                if node.kind.is_unknown() {
                    // Never persist a node we couldn't even stat.
                    continue;
                }
                let Some(parent) = node.parent else {
                    // The root itself is implicit; it has no row.
                    continue;
                };

                let parent_db = if parent == root {
                    DbId::UNSET
                } else {
                    tree.node(parent).db_id
                };
                if parent != root && !parent_db.is_set() {
                    next.push(id);
                    continue;
                }

                let db_id = if node.db_id.is_set() {
                    node.db_id
                } else {
                    table.next_id()
                };
                let row = CachedNodeRow::from_node(node, parent_db);
                if let Err(e) = table.put(db_id, &encode_row(&row)) {
                    error!(row = %db_id, error = %e, "incomplete database put");
                    table.abort();
                    self.insertq.extend(next);
                    self.insertq.insert(id);
                    return;
                }

                let node = tree.node_mut(id);
                node.db_id = db_id;
                node.parent_db_id = parent_db;
                progressed = true;
            }

            remaining = next;
            if remaining.is_empty() || !progressed {
                break;
            }
        }

        table.commit();

        if !remaining.is_empty() {
            error!(residue = remaining.len(), "local-node caching did not complete");
            self.insertq.extend(remaining);
        }
    }

    /// Rebuild the tree from stored rows.
    ///
    /// Returns the number of nodes restored. `stable_fsids` false
    /// drops stored fsids (they are meaningless after a remount on
    /// such volumes); the initial scan re-assigns them by content.
    pub fn restore(
        &mut self,
        tree: &mut LocalTree,
        fs: &dyn Filesystem,
        stable_fsids: bool,
    ) -> usize {
        let Some(table) = self.table.as_mut() else {
            return 0;
        };

        table.rewind();
        let mut by_parent: HashMap<u32, Vec<(DbId, CachedNodeRow)>> = HashMap::new();
        while let Some((id, bytes)) = table.next() {
            match decode_row(&bytes) {
                Ok(row) => by_parent.entry(row.parent_db_id).or_default().push((id, row)),
                Err(e) => error!(row = %id, error = %e, "unable to deserialize cached node"),
            }
        }

        let root = tree.root();
        let root_path = LocalPath::from(tree.node(root).local_name.clone());
        let mut refresh = Vec::new();
        let count = build_children(
            tree,
            root,
            0,
            &root_path,
            &mut by_parent,
            fs,
            stable_fsids,
            MAX_RESTORE_DEPTH,
            &mut refresh,
        );

        for id in refresh {
            self.insertq.insert(id);
        }

        if !by_parent.is_empty() {
            let orphans: usize = by_parent.values().map(Vec::len).sum();
            warn!(orphans, "cached rows unreachable from the root were ignored");
        }

        count
    }
}

#[allow(clippy::too_many_arguments)]
fn build_children(
    tree: &mut LocalTree,
    parent: NodeId,
    parent_db_key: u32,
    parent_path: &LocalPath,
    by_parent: &mut HashMap<u32, Vec<(DbId, CachedNodeRow)>>,
    fs: &dyn Filesystem,
    stable_fsids: bool,
    depth_left: u32,
    refresh: &mut Vec<NodeId>,
) -> usize {
    if depth_left == 0 {
        warn!("state cache restore hit the depth bound");
        return 0;
    }
    let Some(rows) = by_parent.remove(&parent_db_key) else {
        return 0;
    };

    let mut count = 0;
    for (db_id, row) in rows {
        let path = parent_path.append_name(&row.local_name);

        // If the stored row predates shortname recording, look the
        // shortname up now and queue the row for rewrite.
        let (shortname, recorded) = if row.shortname_recorded {
            (row.shortname.clone(), true)
        } else {
            (fs.shortname(&path), false)
        };

        let mut node = LocalNode::new(
            row.kind,
            row.local_name.clone(),
            row.local_name.clone(),
            shortname,
        );
        node.fingerprint = row.fingerprint();
        node.fsid = if stable_fsids { row.fsid } else { Fsid::UNDEF };
        node.synced_handle = row.synced_handle;
        node.db_id = db_id;
        node.parent_db_id = DbId::new(parent_db_key);
        node.shortname_from_store = recorded;

        let id = tree.insert(node, parent);
        if !recorded {
            refresh.push(id);
        }
        count += 1;

        count += build_children(
            tree,
            id,
            db_id.as_u32(),
            &path,
            by_parent,
            fs,
            stable_fsids,
            depth_left - 1,
            refresh,
        );
    }
    count
}

/// Reconstruct `FsNode` views for a node's children with known fsids.
///
/// This is the filesystem picture the reconciler falls back to when no
/// fresh scan is pending and only the cloud side changed.
#[must_use]
pub fn known_children(tree: &LocalTree, parent: NodeId) -> Vec<FsNode> {
    tree.children_of(parent)
        .into_iter()
        .filter(|&id| !tree.node(id).fsid.is_undef())
        .map(|id| tree.node(id).known_fs_details())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
