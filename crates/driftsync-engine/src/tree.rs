//! Local synced-state tree
//!
//! [`LocalTree`] is the in-memory mirror of the last synced state for
//! one sync: an arena of [`LocalNode`]s with stable generational ids,
//! children keyed by cloud-canonical name, a secondary shortname
//! index, and the two identity multimaps (`fsid -> nodes`,
//! `cloud handle -> nodes`) that drive move/rename detection.
//!
//! The tree is only ever touched from the reconciler thread. Parent
//! links are plain [`NodeId`]s; removing a node removes its whole
//! subtree and detaches every removed node from both identity indices,
//! returning the database row ids so the caller can queue their
//! deletion.

use std::collections::{BTreeMap, HashMap};

use driftsync_core::domain::{
    DbId, FileFingerprint, FsNode, Fsid, LocalPath, NodeHandle, NodeKind, TreeState,
};

use crate::backoff::{BackoffTimer, Ds};

// ============================================================================
// NodeId
// ============================================================================

/// Stable handle to a node in the arena.
///
/// Generation-checked: ids of removed nodes never alias a later
/// occupant of the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

// ============================================================================
// LocalNode
// ============================================================================

/// Back-off timers are rare; they live behind one lazily allocated box
/// so idle nodes stay small.
#[derive(Debug, Default)]
pub struct RareFields {
    /// Governs retry of a node that cannot be used (type clash,
    /// symlink, failed local operation).
    pub use_blocked_timer: Option<BackoffTimer>,
    /// Governs retry of a node that could not be scanned.
    pub scan_blocked_timer: Option<BackoffTimer>,
}

/// One node of the last-known synced state.
#[derive(Debug)]
pub struct LocalNode {
    /// File, directory, or not-yet-determined (blocked at scan time).
    pub kind: NodeKind,
    /// Cloud-canonical name. Children are keyed by this, case
    /// sensitively: the cloud is the source of truth for names.
    pub name: String,
    /// Name on the local disk. For the root this is the absolute root
    /// path.
    pub local_name: String,
    /// Legacy secondary name, when the volume has one and it differs.
    pub shortname: Option<String>,
    /// Filesystem-stable id, or `UNDEF`.
    pub fsid: Fsid,
    /// Handle of the cloud node this was last synced against, or
    /// `UNDEF` if it has never reached the cloud.
    pub synced_handle: NodeHandle,
    /// Content fingerprint at last sync; valid only for files.
    pub fingerprint: FileFingerprint,

    /// Parent node; `None` only for the root.
    pub parent: Option<NodeId>,
    /// Children by cloud-canonical name (sorted, case sensitive).
    pub children: BTreeMap<String, NodeId>,
    /// Children by shortname; populated only for children whose
    /// shortname differs from their name.
    pub shortname_children: HashMap<String, NodeId>,

    /// Another scan is needed at/below this node.
    pub scan_again: TreeState,
    /// Another sync pass is needed at/below this node.
    pub sync_again: TreeState,
    /// Name clashes or unresolvable rows were seen at/below this node.
    pub conflicts: TreeState,
    /// The node cannot currently be used; retried on a timer.
    pub use_blocked: TreeState,
    /// The node could not be scanned; retried on a timer.
    pub scan_blocked: TreeState,

    /// fsids were back-filled for all known children (initial scan).
    pub assigned: bool,
    /// Cloud removal is in progress; descent is suppressed.
    pub deleting: bool,
    /// An upload for this file has been handed to the transfer layer.
    pub upload_in_flight: bool,

    /// Completed scan results awaiting reconciliation. Present only
    /// between scan completion and the next successful pass over the
    /// folder.
    pub last_folder_scan: Option<Vec<FsNode>>,
    /// When this folder was last scanned (engine deciseconds).
    pub last_scan_time: Ds,

    /// Row id in the state table; `UNSET` until first written.
    pub db_id: DbId,
    /// Parent's row id at the time this node was written.
    pub parent_db_id: DbId,
    /// Whether the stored row carried the shortname (older caches did
    /// not; those get refreshed from the filesystem on first
    /// encounter).
    pub shortname_from_store: bool,

    rare: Option<Box<RareFields>>,
}

impl LocalNode {
    /// Create a detached node. Attach it with [`LocalTree::insert`].
    #[must_use]
    pub fn new(kind: NodeKind, name: String, local_name: String, shortname: Option<String>) -> Self {
        Self {
            kind,
            name,
            local_name,
            shortname,
            fsid: Fsid::UNDEF,
            synced_handle: NodeHandle::UNDEF,
            fingerprint: FileFingerprint::invalid(),
            parent: None,
            children: BTreeMap::new(),
            shortname_children: HashMap::new(),
            scan_again: TreeState::Resolved,
            sync_again: TreeState::Resolved,
            conflicts: TreeState::Resolved,
            use_blocked: TreeState::Resolved,
            scan_blocked: TreeState::Resolved,
            assigned: false,
            deleting: false,
            upload_in_flight: false,
            last_folder_scan: None,
            last_scan_time: 0,
            db_id: DbId::UNSET,
            parent_db_id: DbId::UNSET,
            shortname_from_store: true,
            rare: None,
        }
    }

    /// The rare-field block, allocated on first use.
    pub fn rare_mut(&mut self) -> &mut RareFields {
        self.rare.get_or_insert_with(Box::default)
    }

    /// The rare-field block, if it was ever allocated.
    #[must_use]
    pub fn rare(&self) -> Option<&RareFields> {
        self.rare.as_deref()
    }

    /// Drop the rare-field block if both timers are gone.
    pub fn shrink_rare(&mut self) {
        if let Some(r) = &self.rare {
            if r.use_blocked_timer.is_none() && r.scan_blocked_timer.is_none() {
                self.rare = None;
            }
        }
    }

    /// True if this subtree needs scanning.
    #[must_use]
    pub fn scan_required(&self) -> bool {
        self.scan_again.is_set()
    }

    /// True if this subtree needs syncing.
    #[must_use]
    pub fn sync_required(&self) -> bool {
        self.sync_again.is_set()
    }

    /// Reconstruct the filesystem view of this node from its synced
    /// state; used when no fresh scan is available.
    #[must_use]
    pub fn known_fs_details(&self) -> FsNode {
        FsNode {
            local_name: self.local_name.clone(),
            name: self.name.clone(),
            kind: self.kind,
            size: self.fingerprint.size,
            mtime: self.fingerprint.mtime,
            fsid: self.fsid,
            shortname: self.shortname.clone(),
            is_symlink: false,
            is_blocked: false,
            fingerprint: self.fingerprint,
        }
    }

    /// Complete the initialization of a node that was created blocked
    /// (kind unknown) once a later scan learned the real details.
    pub fn init_from(&mut self, fs: &FsNode) {
        self.kind = fs.kind;
        self.local_name = fs.local_name.clone();
        if self.name.is_empty() {
            self.name = fs.name.clone();
        }
        if fs.kind.is_file() {
            self.fingerprint = fs.fingerprint;
        }
    }
}

// ============================================================================
// LocalTree
// ============================================================================

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<LocalNode>,
}

/// Arena-backed tree of [`LocalNode`]s plus the identity indices.
#[derive(Debug, Default)]
pub struct LocalTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: Option<NodeId>,
    by_fsid: HashMap<Fsid, Vec<NodeId>>,
    by_handle: HashMap<NodeHandle, Vec<NodeId>>,
}

impl LocalTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the root node. `local_name` must be the absolute root
    /// path so every descendant path can be rebuilt from the tree.
    pub fn set_root(&mut self, node: LocalNode) -> NodeId {
        debug_assert!(self.root.is_none(), "root installed twice");
        let id = self.alloc(node);
        self.register_identity(id);
        self.root = Some(id);
        id
    }

    /// The root node id.
    ///
    /// # Panics
    /// Panics if no root has been installed.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root.expect("tree has no root")
    }

    /// Whether `id` still refers to a live node.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|s| s.generation == id.generation && s.node.is_some())
    }

    /// Borrow a node.
    ///
    /// # Panics
    /// Panics on a stale id; the engine never holds ids across
    /// removals.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &LocalNode {
        let slot = &self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "stale node id");
        slot.node.as_ref().expect("stale node id")
    }

    /// Mutably borrow a node.
    ///
    /// # Panics
    /// Panics on a stale id.
    pub fn node_mut(&mut self, id: NodeId) -> &mut LocalNode {
        let slot = &mut self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "stale node id");
        slot.node.as_mut().expect("stale node id")
    }

    /// Number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    /// True if the tree holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all live nodes, in arena order.
    #[must_use]
    pub fn ids(&self) -> Vec<NodeId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.node.is_some())
            .map(|(i, s)| NodeId {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Attach a new node under `parent`.
    pub fn insert(&mut self, mut node: LocalNode, parent: NodeId) -> NodeId {
        node.parent = Some(parent);
        let id = self.alloc(node);
        self.attach_to_parent(id, parent);
        self.register_identity(id);
        id
    }

    /// Remove a node and its whole subtree.
    ///
    /// Every removed node is detached from both identity indices;
    /// the returned row ids are the stored rows that must be deleted
    /// from the state table.
    pub fn remove_subtree(&mut self, id: NodeId) -> Vec<DbId> {
        // Collect the subtree first; mutation happens afterwards.
        let mut stack = vec![id];
        let mut doomed = Vec::new();
        while let Some(current) = stack.pop() {
            doomed.push(current);
            stack.extend(self.node(current).children.values().copied());
        }

        self.detach_from_parent(id);

        let mut removed_rows = Vec::new();
        for victim in doomed {
            self.unregister_identity(victim);
            let slot = &mut self.slots[victim.index as usize];
            let node = slot.node.take().expect("doomed node vanished");
            if node.db_id.is_set() {
                removed_rows.push(node.db_id);
            }
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(victim.index);
        }
        if self.root == Some(id) {
            self.root = None;
        }
        removed_rows
    }

    /// Move/rename a node within the tree: detach from the old parent,
    /// update names, attach under the new parent.
    pub fn set_name_parent(
        &mut self,
        id: NodeId,
        new_parent: NodeId,
        name: String,
        local_name: String,
        shortname: Option<String>,
    ) {
        self.detach_from_parent(id);
        {
            let node = self.node_mut(id);
            node.name = name;
            node.local_name = local_name;
            node.shortname = shortname;
            node.parent = Some(new_parent);
        }
        self.attach_to_parent(id, new_parent);
    }

    /// Replace a node's shortname, keeping the parent's secondary
    /// index consistent.
    pub fn update_shortname(&mut self, id: NodeId, shortname: Option<String>) {
        let (parent, old) = {
            let node = self.node(id);
            (node.parent, node.shortname.clone())
        };
        if let Some(parent) = parent {
            if let Some(old) = &old {
                self.node_mut(parent).shortname_children.remove(old);
            }
        }
        {
            let node = self.node_mut(id);
            node.shortname = shortname.clone();
            node.shortname_from_store = true;
        }
        if let (Some(parent), Some(new)) = (parent, shortname) {
            let differs = new != self.node(id).name;
            if differs {
                self.node_mut(parent).shortname_children.insert(new, id);
            }
        }
    }

    /// Children of `id`, ordered by cloud-canonical name.
    #[must_use]
    pub fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id).children.values().copied().collect()
    }

    /// Child lookup by cloud-canonical name (case sensitive).
    #[must_use]
    pub fn child_by_name(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.node(id).children.get(name).copied()
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Re-key a node's fsid, keeping the index consistent.
    pub fn set_fsid(&mut self, id: NodeId, fsid: Fsid) {
        let old = self.node(id).fsid;
        if old == fsid {
            return;
        }
        if !old.is_undef() {
            remove_index_entry(&mut self.by_fsid, old, id);
        }
        self.node_mut(id).fsid = fsid;
        if !fsid.is_undef() {
            self.by_fsid.entry(fsid).or_default().push(id);
        }
    }

    /// Re-key a node's synced cloud handle, keeping the index
    /// consistent.
    pub fn set_synced_handle(&mut self, id: NodeId, handle: NodeHandle) {
        let old = self.node(id).synced_handle;
        if old == handle {
            return;
        }
        if !old.is_undef() {
            remove_index_entry(&mut self.by_handle, old, id);
        }
        self.node_mut(id).synced_handle = handle;
        if !handle.is_undef() {
            self.by_handle.entry(handle).or_default().push(id);
        }
    }

    /// Nodes currently known under `fsid`.
    #[must_use]
    pub fn nodes_with_fsid(&self, fsid: Fsid) -> Vec<NodeId> {
        if fsid.is_undef() {
            return Vec::new();
        }
        self.by_fsid.get(&fsid).cloned().unwrap_or_default()
    }

    /// Nodes currently known under a cloud handle.
    #[must_use]
    pub fn nodes_with_handle(&self, handle: NodeHandle) -> Vec<NodeId> {
        if handle.is_undef() {
            return Vec::new();
        }
        self.by_handle.get(&handle).cloned().unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------

    /// Absolute local path of a node, rebuilt from the root.
    #[must_use]
    pub fn local_path_of(&self, id: NodeId) -> LocalPath {
        let mut names = Vec::new();
        let mut current = id;
        loop {
            let node = self.node(current);
            match node.parent {
                Some(parent) => {
                    names.push(node.local_name.clone());
                    current = parent;
                }
                None => {
                    let mut path = LocalPath::from(node.local_name.clone());
                    for name in names.iter().rev() {
                        path = path.append_name(name);
                    }
                    return path;
                }
            }
        }
    }

    /// Walk a path down from the root, matching children by local
    /// name and falling back to the shortname index.
    ///
    /// Returns the matched node (if the full path resolved), the
    /// deepest node visited, and whether any components were left
    /// unresolved.
    #[must_use]
    pub fn node_by_path(&self, path: &LocalPath) -> PathLookup {
        let root = self.root();
        let root_path = LocalPath::from(self.node(root).local_name.clone());
        let Some(components) = path.components_below(&root_path) else {
            return PathLookup {
                matched: None,
                deepest: root,
                residual: true,
            };
        };

        let mut current = root;
        for (i, component) in components.iter().enumerate() {
            match self.child_by_local_name(current, component) {
                Some(child) => current = child,
                None => {
                    return PathLookup {
                        matched: None,
                        deepest: current,
                        residual: i + 1 < components.len(),
                    }
                }
            }
        }
        PathLookup {
            matched: Some(current),
            deepest: current,
            residual: false,
        }
    }

    fn child_by_local_name(&self, id: NodeId, component: &str) -> Option<NodeId> {
        let node = self.node(id);
        if let Some(&child) = node.children.get(component) {
            if self.node(child).local_name == component {
                return Some(child);
            }
        }
        if let Some(child) = node
            .children
            .values()
            .find(|&&c| self.node(c).local_name == component)
        {
            return Some(*child);
        }
        node.shortname_children.get(component).copied()
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    /// Request a future sync at this node (`below` extends it to the
    /// whole subtree); ancestors learn via `DescendantFlagged`.
    pub fn set_future_sync(&mut self, id: NodeId, here: bool, below: bool) {
        let target = flag_for(here, below);
        let node = self.node_mut(id);
        node.sync_again = node.sync_again.max(target);
        self.roll_up(id, |n| &mut n.sync_again);
    }

    /// Request a future scan at this node (`below` extends it to the
    /// whole subtree); scanning implies syncing afterwards.
    pub fn set_future_scan(&mut self, id: NodeId, here: bool, below: bool) {
        let target = flag_for(here, below);
        let node = self.node_mut(id);
        node.scan_again = node.scan_again.max(target);
        self.roll_up(id, |n| &mut n.scan_again);
        self.set_future_sync(id, here, below);
    }

    /// Mark a node unusable and arm (or extend) its back-off timer.
    pub fn set_use_blocked(&mut self, id: NodeId, now: Ds) {
        let node = self.node_mut(id);
        node.use_blocked = node.use_blocked.max(TreeState::ActionHere);
        match &mut node.rare_mut().use_blocked_timer {
            Some(timer) => timer.rearm(now),
            slot => *slot = Some(BackoffTimer::new(now)),
        }
        self.roll_up(id, |n| &mut n.use_blocked);
    }

    /// Mark a node unscannable and arm (or extend) its back-off timer.
    pub fn set_scan_blocked(&mut self, id: NodeId, now: Ds) {
        let node = self.node_mut(id);
        node.scan_blocked = node.scan_blocked.max(TreeState::ActionHere);
        match &mut node.rare_mut().scan_blocked_timer {
            Some(timer) => timer.rearm(now),
            slot => *slot = Some(BackoffTimer::new(now)),
        }
        self.roll_up(id, |n| &mut n.scan_blocked);
    }

    /// Record a name conflict at this node and propagate to ancestors.
    pub fn set_conflict(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        node.conflicts = node.conflicts.max(TreeState::ActionHere);
        self.roll_up(id, |n| &mut n.conflicts);
    }

    fn roll_up(&mut self, id: NodeId, field: impl Fn(&mut LocalNode) -> &mut TreeState) {
        let mut current = self.node(id).parent;
        while let Some(ancestor) = current {
            let node = self.node_mut(ancestor);
            let flag = field(node);
            if *flag >= TreeState::DescendantFlagged {
                break;
            }
            *flag = TreeState::DescendantFlagged;
            current = node.parent;
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn alloc(&mut self, node: LocalNode) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn attach_to_parent(&mut self, id: NodeId, parent: NodeId) {
        let (name, shortname) = {
            let node = self.node(id);
            (node.name.clone(), node.shortname.clone())
        };
        let parent_node = self.node_mut(parent);
        parent_node.children.insert(name.clone(), id);
        if let Some(short) = shortname {
            if short != name {
                parent_node.shortname_children.insert(short, id);
            }
        }
    }

    fn detach_from_parent(&mut self, id: NodeId) {
        let (parent, name, shortname) = {
            let node = self.node(id);
            (node.parent, node.name.clone(), node.shortname.clone())
        };
        if let Some(parent) = parent {
            let parent_node = self.node_mut(parent);
            if parent_node.children.get(&name) == Some(&id) {
                parent_node.children.remove(&name);
            }
            if let Some(short) = shortname {
                if parent_node.shortname_children.get(&short) == Some(&id) {
                    parent_node.shortname_children.remove(&short);
                }
            }
        }
    }

    fn register_identity(&mut self, id: NodeId) {
        let (fsid, handle) = {
            let node = self.node(id);
            (node.fsid, node.synced_handle)
        };
        if !fsid.is_undef() {
            self.by_fsid.entry(fsid).or_default().push(id);
        }
        if !handle.is_undef() {
            self.by_handle.entry(handle).or_default().push(id);
        }
    }

    fn unregister_identity(&mut self, id: NodeId) {
        let (fsid, handle) = {
            let node = self.node(id);
            (node.fsid, node.synced_handle)
        };
        if !fsid.is_undef() {
            remove_index_entry(&mut self.by_fsid, fsid, id);
        }
        if !handle.is_undef() {
            remove_index_entry(&mut self.by_handle, handle, id);
        }
    }
}

/// Result of resolving a path against the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathLookup {
    /// The node at exactly this path, if the walk resolved fully.
    pub matched: Option<NodeId>,
    /// The deepest node the walk reached.
    pub deepest: NodeId,
    /// True if more than one trailing component was unresolved.
    pub residual: bool,
}

fn flag_for(here: bool, below: bool) -> TreeState {
    if below {
        TreeState::ActionSubtree
    } else if here {
        TreeState::ActionHere
    } else {
        TreeState::Resolved
    }
}

fn remove_index_entry<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, Vec<NodeId>>,
    key: K,
    id: NodeId,
) {
    if let Some(entries) = map.get_mut(&key) {
        entries.retain(|&e| e != id);
        if entries.is_empty() {
            map.remove(&key);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
