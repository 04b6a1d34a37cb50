//! The reconciler
//!
//! [`Sync`] drives a top-down recursion over one synced tree. At each
//! directory it may (a) request a scan and return (work deferred),
//! (b) consume a completed scan, (c) build triplets, (d) apply per-row
//! decisions, (e) recurse into child directories. Writes to the cloud
//! and the filesystem are delegated through the ports; the engine
//! resumes on the next tick once the side effects have propagated back
//! into the views it reads.
//!
//! ## Tick protocol
//!
//! The host calls [`EngineContext::begin_tick`], then [`Sync::tick`]
//! for each sync, then [`EngineContext::end_tick`]. The context
//! carries the process-wide flags; in particular, a tick that
//! performed scans or issued moves/renames prevents the *next* tick
//! from concluding that scans and moves are complete, which is the
//! barrier that keeps deletions from running ahead of in-flight
//! moves.
//!
//! ## Per-row decisions
//!
//! `sync_item` routes each row through the eight presence
//! combinations of `(cloud, sync, fs)`; move/rename detection runs
//! first on both sides so a moved entry is never mistaken for a
//! delete-plus-create. Errors on individual rows never abort the
//! directory - they set per-node flags and arm timers.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Local;
use driftsync_core::domain::{
    EngineError, FsNode, Fsid, LocalPath, NameComparison, NodeHandle, NodeKind, SyncConfig,
    SyncErrorCode, SyncRunState, TreeState,
};
use driftsync_core::ports::{
    CloudClient, CloudNode, CloudOpStatus, Filesystem, FsErrorKind, NewCloudFolder,
    PathNotification, StateTable, TransferDirection, TransferSpec,
};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Ds;
use crate::cache::{known_children, StateCache};
use crate::debris::move_to_local_debris;
use crate::moves::{
    find_source_by_fsid, find_source_by_handle, FileChangeGuard, FileChangeState, FsidLookup,
};
use crate::scan::{ScanCookie, ScanRequest, ScanService};
use crate::tree::{LocalNode, LocalTree, NodeId};
use crate::triplet::{compute_sync_triplets, SyncRow};

/// A folder is scanned at most once per this window.
pub const SCAN_DEBOUNCE_DS: Ds = 20;

// ============================================================================
// SyncFlags / EngineContext
// ============================================================================

/// Process-wide reconciliation flags, recomputed every tick.
#[derive(Debug, Clone, Default)]
pub struct SyncFlags {
    /// No scans ran and no moves/renames were issued last tick; it is
    /// safe to treat absences as deletions.
    pub scans_and_moves_complete: bool,
    /// A move/rename command was issued this tick; the next tick must
    /// wait for action packets before concluding anything.
    pub actioned_moves_renames: bool,
    /// A scan gate was active somewhere this tick.
    pub performed_scans: bool,
    /// The pending scan request's target was reached this tick.
    pub scan_target_reachable: bool,
}

/// Process-wide engine state shared by every [`Sync`].
#[derive(Debug, Default)]
pub struct EngineContext {
    /// Engine clock, deciseconds.
    pub now_ds: Ds,
    /// Wall clock, seconds since the Unix epoch.
    pub now_secs: i64,
    /// Cross-sync reconciliation flags.
    pub flags: SyncFlags,
    /// Stability guard for move sources that may still be written to.
    pub file_changes: FileChangeGuard,
    downloads: HashSet<NodeHandle>,
}

impl EngineContext {
    /// Create a context with the clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a tick: advance the clocks and reset the per-tick
    /// observations.
    pub fn begin_tick(&mut self, now_ds: Ds, now_secs: i64) {
        self.now_ds = now_ds;
        self.now_secs = now_secs;
        self.flags.performed_scans = false;
        self.flags.scan_target_reachable = false;
    }

    /// End a tick: fold this tick's observations into the barrier for
    /// the next one.
    pub fn end_tick(&mut self) {
        self.flags.scans_and_moves_complete =
            !self.flags.performed_scans && !self.flags.actioned_moves_renames;
        self.flags.actioned_moves_renames = false;
    }

    fn download_in_flight(&self, handle: NodeHandle) -> bool {
        self.downloads.contains(&handle)
    }

    fn note_download(&mut self, handle: NodeHandle) {
        self.downloads.insert(handle);
    }

    fn download_done(&mut self, handle: NodeHandle) {
        self.downloads.remove(&handle);
    }
}

/// Parent context handed down to per-row processing.
struct ParentCtx {
    node: NodeId,
    cloud: Option<CloudNode>,
}

// ============================================================================
// Sync
// ============================================================================

/// One configured sync: a local root kept in step with a cloud root.
pub struct Sync {
    config: SyncConfig,
    state: SyncRunState,
    error_code: SyncErrorCode,

    fs: Arc<dyn Filesystem>,
    cloud: Arc<dyn CloudClient>,
    scan_service: ScanService,
    scan_cookie: Arc<ScanCookie>,
    current_scan: Option<(NodeId, Arc<ScanRequest>)>,

    tree: LocalTree,
    cache: StateCache,
    debris_path: LocalPath,
    comparison: NameComparison,
    follow_symlinks: bool,

    // Row-level failures observed since the host last drained them.
    // None of these abort a directory pass; they are reported so the
    // host can show them.
    row_errors: Vec<EngineError>,
}

impl Sync {
    /// Create a sync from its configuration.
    ///
    /// Restores the last-known state from `state_table` (when given)
    /// and schedules a full scan of the tree; the sync starts in
    /// `InitialScan` and flips to `Active` once the first full
    /// reconciliation settles.
    ///
    /// # Errors
    /// Fails if the local root is missing or not a directory.
    pub fn new(
        mut config: SyncConfig,
        debris_name: &str,
        follow_symlinks: bool,
        fs: Arc<dyn Filesystem>,
        cloud: Arc<dyn CloudClient>,
        scan_service: ScanService,
        state_table: Option<Box<dyn StateTable>>,
    ) -> Result<Self, EngineError> {
        let root_path = config.local_path.clone();

        let root_handle = fs
            .open(&root_path)
            .map_err(|e| EngineError::PermanentIo(format!("sync root unavailable: {e}")))?;
        if !root_handle.kind().is_dir() {
            return Err(EngineError::PermanentIo(format!(
                "sync root is not a directory: {root_path}"
            )));
        }

        if config.volume_fingerprint.is_none() {
            config.volume_fingerprint = fs.volume_fingerprint(&root_path);
        }
        let stable_fsids = fs.fsids_are_stable(&root_path);
        info!(stable = stable_fsids, "filesystem id stability");

        let comparison = if fs.is_case_sensitive(&root_path) {
            NameComparison::CaseSensitive
        } else {
            NameComparison::CaseInsensitive
        };

        let debris_path = root_path.append_name(debris_name);

        let mut tree = LocalTree::new();
        let root = tree.set_root(LocalNode::new(
            NodeKind::Dir,
            String::new(),
            root_path.to_string(),
            None,
        ));
        tree.set_synced_handle(root, config.cloud_root);

        let mut cache = StateCache::new(state_table);
        let restored = cache.restore(&mut tree, fs.as_ref(), stable_fsids);
        if restored > 0 {
            info!(nodes = restored, "state cache restored");
        }

        // First full reconciliation covers the whole tree.
        tree.set_future_scan(root, true, true);

        Ok(Self {
            config,
            state: SyncRunState::InitialScan,
            error_code: SyncErrorCode::NoError,
            fs,
            cloud,
            scan_service,
            scan_cookie: ScanCookie::new(),
            current_scan: None,
            tree,
            cache,
            debris_path,
            comparison,
            follow_symlinks,
            row_errors: Vec::new(),
        })
    }

    /// The sync's configuration (volume fingerprint filled in).
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current run state.
    #[must_use]
    pub fn state(&self) -> SyncRunState {
        self.state
    }

    /// Current error code.
    #[must_use]
    pub fn error_code(&self) -> SyncErrorCode {
        self.error_code
    }

    /// The synced-state tree (read access for hosts and tests).
    #[must_use]
    pub fn tree(&self) -> &LocalTree {
        &self.tree
    }

    /// Where local deletions are quarantined.
    #[must_use]
    pub fn debris_path(&self) -> &LocalPath {
        &self.debris_path
    }

    /// The cookie scan workers signal; hosts may poll it to tick
    /// promptly after a background scan completes.
    #[must_use]
    pub fn wake_cookie(&self) -> &Arc<ScanCookie> {
        &self.scan_cookie
    }

    /// Whether a background scan is currently outstanding.
    #[must_use]
    pub fn scan_pending(&self) -> bool {
        self.current_scan.is_some()
    }

    /// Drain the row-level failures observed since the last call.
    pub fn take_row_errors(&mut self) -> Vec<EngineError> {
        std::mem::take(&mut self.row_errors)
    }

    /// Transition the sync's user-visible state.
    ///
    /// Transitions into `Canceled`, `Failed` or `Disabled` are
    /// terminal: ticks become no-ops and cache writes are suppressed.
    pub fn change_state(&mut self, new_state: SyncRunState, new_error: SyncErrorCode) {
        if self.state.is_terminal() {
            return;
        }
        if new_state != self.state || new_error != self.error_code {
            info!(
                from = ?self.state,
                to = ?new_state,
                error = ?new_error,
                "sync state changing"
            );
            self.state = new_state;
            self.error_code = new_error;
            self.config.state = new_state;
        }
    }

    /// Mark the subtree around a notified path for a future scan.
    pub fn note_path_changed(&mut self, path: &LocalPath) {
        let lookup = self.tree.node_by_path(path);
        let deepest = match lookup.matched {
            Some(id) => self.tree.node(id).parent.unwrap_or(id),
            None => lookup.deepest,
        };
        trace!(path = %path, "filesystem notification");
        self.tree.set_future_scan(deepest, true, lookup.residual);
    }

    /// Drain a batch of platform notifications into scan flags.
    pub fn process_notifications(
        &mut self,
        notifications: impl IntoIterator<Item = PathNotification>,
    ) {
        for notification in notifications {
            self.note_path_changed(&notification.path);
        }
    }

    /// Flag re-reconciliation after a server action packet touched a
    /// cloud node.
    ///
    /// A known node gets its own row and its parent's rows revisited;
    /// an unknown handle (a node created somewhere we have not synced
    /// yet) falls back to a whole-tree sync pass.
    pub fn note_cloud_changed(&mut self, node: NodeHandle) {
        let ids = self.tree.nodes_with_handle(node);
        if ids.is_empty() {
            let root = self.tree.root();
            self.tree.set_future_sync(root, true, true);
            return;
        }
        for id in ids {
            self.tree.set_future_sync(id, true, false);
            if let Some(parent) = self.tree.node(id).parent {
                self.tree.set_future_sync(parent, true, false);
            }
        }
    }

    /// Run one reconciliation pass. Returns true when the whole tree
    /// reconciled without leftover work.
    pub fn tick(&mut self, ctx: &mut EngineContext) -> bool {
        if self.state.is_terminal() {
            return false;
        }

        // A scan whose target node has since been removed would pin
        // the scan slot forever; drop it, results and all.
        if let Some((target, _)) = &self.current_scan {
            if !self.tree.contains(*target) {
                debug!("discarding scan for a removed folder");
                self.current_scan = None;
            }
        }

        let root = self.tree.root();
        let root_path = self.tree.local_path_of(root);

        // A vanished local root is fatal for the whole sync; nothing
        // row-level can recover it.
        if !self.fs.exists(&root_path) {
            warn!(path = %root_path, "local sync root is unavailable");
            self.row_errors
                .push(EngineError::ScanUnavailable(root_path.to_string()));
            self.change_state(SyncRunState::Failed, SyncErrorCode::LocalPathUnavailable);
            return false;
        }

        let cloud_root = self.cloud.node_by_handle(self.config.cloud_root);
        if cloud_root.is_none() {
            warn!("cloud root is unavailable");
        }

        let synced = self.recursive_sync(ctx, root, cloud_root, &root_path);

        if synced && self.state == SyncRunState::InitialScan && ctx.flags.scans_and_moves_complete
        {
            self.change_state(SyncRunState::Active, SyncErrorCode::NoError);
        }

        self.cache.flush(self.state, &mut self.tree);
        synced
    }

    // ========================================================================
    // recursive_sync
    // ========================================================================

    fn recursive_sync(
        &mut self,
        ctx: &mut EngineContext,
        node: NodeId,
        cloud: Option<CloudNode>,
        local_path: &LocalPath,
    ) -> bool {
        trace!(
            path = %local_path,
            sync_again = ?self.tree.node(node).sync_again,
            scan_again = ?self.tree.node(node).scan_again,
            "entering folder"
        );

        // Nothing to do for this subtree? Skip traversal.
        {
            let n = self.tree.node(node);
            if !(n.scan_required() || n.sync_required()) {
                return true;
            }
        }

        // Push any subtree flags down to directory children so the
        // flag can be cleared at this level.
        let (parent_scan, parent_sync) = {
            let n = self.tree.node(node);
            (n.scan_again, n.sync_again)
        };
        for child in self.tree.children_of(node) {
            let c = self.tree.node_mut(child);
            if !c.kind.is_file() {
                c.scan_again = parent_scan.propagate_subtree(c.scan_again);
                c.sync_again = parent_sync.propagate_subtree(c.sync_again);
            }
        }

        let was_synced = self.tree.node(node).sync_again < TreeState::ActionHere;
        let mut sync_here = !was_synced;

        // Scan gate.
        if self.tree.node(node).scan_again.action_here() {
            ctx.flags.performed_scans = true;

            let elapsed = ctx.now_ds.saturating_sub(self.tree.node(node).last_scan_time);
            let pending_here = self
                .current_scan
                .as_ref()
                .is_some_and(|(target, _)| *target == node);

            if self.current_scan.is_none() && elapsed >= SCAN_DEBOUNCE_DS {
                debug!(path = %local_path, "requesting scan");
                let known = self
                    .tree
                    .children_of(node)
                    .into_iter()
                    .filter(|&c| !self.tree.node(c).fsid.is_undef())
                    .map(|c| {
                        let n = self.tree.node(c);
                        (n.local_name.clone(), n.known_fs_details())
                    })
                    .collect();
                let request = self.scan_service.scan(
                    &self.scan_cookie,
                    Arc::clone(&self.fs),
                    local_path.clone(),
                    self.debris_path.clone(),
                    self.follow_symlinks,
                    known,
                );
                self.current_scan = Some((node, request));
                sync_here = false;
            } else if pending_here && self.current_scan.as_ref().is_some_and(|(_, r)| r.completed())
            {
                debug!(path = %local_path, "received scan results");
                let (_, request) = self.current_scan.take().expect("pending scan");
                let n = self.tree.node_mut(node);
                n.last_folder_scan = Some(request.take_results());
                n.last_scan_time = ctx.now_ds;
                n.scan_again = TreeState::Resolved;
                self.tree.set_future_sync(node, true, false);
                sync_here = true;
            } else {
                sync_here = false;
            }
        } else {
            // Restored at the end of the pass if any child still
            // needs it.
            self.tree.node_mut(node).scan_again = TreeState::Resolved;
        }

        ctx.flags.scan_target_reachable |= self
            .current_scan
            .as_ref()
            .is_some_and(|(target, _)| *target == node);

        // Effective children come from the last scan when present;
        // otherwise reconstructed from the tree (cloud-only pass).
        let effective: Vec<FsNode> = match &self.tree.node(node).last_folder_scan {
            Some(results) => results.clone(),
            None => known_children(&self.tree, node),
        };

        let cloud_children = cloud
            .as_ref()
            .map(|c| self.cloud.children_of(c.handle))
            .unwrap_or_default();
        let mut child_rows =
            compute_sync_triplets(cloud_children, &self.tree, node, &effective, self.comparison);

        let mut folder_synced = sync_here;
        let mut fsids_assigned = false;
        let mut subfolders_synced = true;

        self.tree.node_mut(node).conflicts = TreeState::Resolved;

        // A parent with commands in flight is left alone this tick.
        sync_here &= cloud.as_ref().map_or(true, |c| !c.has_pending_commands);

        let parent_ctx = ParentCtx {
            node,
            cloud: cloud.clone(),
        };

        for first_pass in [true, false] {
            for row in child_rows.iter_mut() {
                let child_name = row_child_name(row, &self.tree);

                // Clash rows flag the folder but still process the
                // incumbent, so an in-progress sync can finish.
                if first_pass && row.has_clashes() {
                    self.tree.set_conflict(node);
                    self.row_errors
                        .push(EngineError::NameConflict(child_name.clone()));
                }
                let child_path = local_path.append_name(&child_name);

                // Initial scan: re-associate restored nodes with their
                // current fsids.
                if self.state == SyncRunState::InitialScan && !self.tree.node(node).assigned {
                    if let (Some(fsnode), Some(sync_id)) = (&row.fs, row.sync) {
                        let s = self.tree.node(sync_id);
                        if s.fsid.is_undef()
                            && !fsnode.fsid.is_undef()
                            && sync_equal_fs(fsnode, s)
                        {
                            self.tree.set_fsid(sync_id, fsnode.fsid);
                            self.cache.add(self.state, &self.tree, sync_id);
                            fsids_assigned = true;
                        }
                    }
                }

                if first_pass {
                    if sync_here && !self.sync_item(ctx, row, &parent_ctx, &child_path) {
                        folder_synced = false;
                    }
                } else if let Some(child) = row.sync {
                    // Recurse after all items, so renames within the
                    // folder land before descent.
                    if self.tree.contains(child)
                        && self.tree.node(child).kind.is_dir()
                        && !row.suppress_recursion
                        && !self.tree.node(child).deleting
                        && !self.recursive_sync(ctx, child, row.cloud.clone(), &child_path)
                    {
                        subfolders_synced = false;
                    }
                }
            }
        }

        self.tree.node_mut(node).assigned |= fsids_assigned;

        if folder_synced {
            // The tree is now consistent with the last scan.
            self.tree.node_mut(node).last_folder_scan = None;
        }

        if ctx.flags.scans_and_moves_complete
            && ((sync_here && folder_synced) || (!sync_here && was_synced))
        {
            self.tree.node_mut(node).sync_again = TreeState::Resolved;
        }

        // Recompute this folder's flags from its children.
        let conflicts_here = self.tree.node(node).conflicts >= TreeState::ActionHere;
        for child in self.tree.children_of(node) {
            let (c_scan, c_sync, c_conflicts, c_kind) = {
                let c = self.tree.node(child);
                (c.scan_again, c.sync_again, c.conflicts, c.kind)
            };
            if !c_kind.is_file() {
                let n = self.tree.node_mut(node);
                if !conflicts_here {
                    n.scan_again = n.scan_again.update_from_child(c_scan);
                    n.sync_again = n.sync_again.update_from_child(c_sync);
                }
                n.conflicts = n.conflicts.update_from_child(c_conflicts);
            }
        }

        trace!(
            path = %local_path,
            synced = folder_synced,
            subsync = subfolders_synced,
            "exiting folder"
        );

        folder_synced && subfolders_synced
    }

    // ========================================================================
    // sync_item
    // ========================================================================

    fn sync_item(
        &mut self,
        ctx: &mut EngineContext,
        row: &mut SyncRow,
        parent: &ParentCtx,
        full_path: &LocalPath,
    ) -> bool {
        // Shortname records can be stale after a sync restart; adjust
        // as directories are scanned.
        if let (Some(sync_id), Some(fsnode)) = (row.sync, &row.fs) {
            if let Some(short) = &fsnode.shortname {
                if self.tree.node(sync_id).shortname.as_ref() != Some(short) {
                    warn!(path = %full_path, shortname = %short, "updating stale shortname");
                    self.tree.update_shortname(sync_id, Some(short.clone()));
                    self.cache.add(self.state, &self.tree, sync_id);
                }
            }
        }

        // Blocked nodes wait out their timers.
        if let Some(sync_id) = row.sync {
            if self.tree.node(sync_id).use_blocked.action_here() {
                let timer_armed = self
                    .tree
                    .node(sync_id)
                    .rare()
                    .and_then(|r| r.use_blocked_timer.as_ref())
                    .map_or(true, |t| t.armed(ctx.now_ds));
                if !timer_armed {
                    trace!(path = %full_path, "waiting on use-blocked timer");
                    return false;
                }
            }

            if self.tree.node(sync_id).scan_blocked.action_here() {
                let timer_armed = self
                    .tree
                    .node(sync_id)
                    .rare()
                    .and_then(|r| r.scan_blocked_timer.as_ref())
                    .map_or(true, |t| t.armed(ctx.now_ds));
                if timer_armed {
                    trace!(path = %full_path, "scan-blocked timer elapsed, rescan parent");
                    self.tree.set_future_scan(parent.node, true, false);
                } else {
                    trace!(path = %full_path, "waiting on scan-blocked timer");
                    return false;
                }
            }
        }

        // A node created blocked completes its initialization once a
        // scan learns what it actually is.
        if let Some(sync_id) = row.sync {
            if self.tree.node(sync_id).kind.is_unknown() {
                if let Some(fsnode) = &row.fs {
                    if !fsnode.kind.is_unknown() {
                        self.tree.node_mut(sync_id).init_from(fsnode);
                    }
                }
            }
        }

        // Reset the blocked flags; anything still blocked below will
        // set them again.
        if let Some(sync_id) = row.sync {
            let n = self.tree.node_mut(sync_id);
            if n.use_blocked >= TreeState::DescendantFlagged {
                n.use_blocked = TreeState::Resolved;
                n.rare_mut().use_blocked_timer = None;
            }
            if n.scan_blocked >= TreeState::DescendantFlagged {
                n.scan_blocked = TreeState::Resolved;
                n.rare_mut().scan_blocked_timer = None;
            }
            n.shrink_rare();
        }

        // Entries the scanner could not read: block and retry later.
        if let Some(fsnode) = &row.fs {
            if fsnode.kind.is_unknown() || fsnode.is_blocked {
                debug!(path = %full_path, "entry was unreadable during scan, retrying later");
                if row.sync.is_none() {
                    self.resolve_make_sync_node_from_fs(row, parent, full_path);
                }
                if let Some(sync_id) = row.sync {
                    self.tree.set_scan_blocked(sync_id, ctx.now_ds);
                }
                return false;
            }

            // Symlink contents are not synced; quarantine the node.
            if fsnode.is_symlink {
                debug!(path = %full_path, "path is a symlink, blocking");
                self.row_errors
                    .push(EngineError::Blocked(format!("symlink: {full_path}")));
                if row.sync.is_none() {
                    self.resolve_make_sync_node_from_fs(row, parent, full_path);
                }
                if let Some(sync_id) = row.sync {
                    self.tree.set_use_blocked(sync_id, ctx.now_ds);
                }
                return false;
            }
        }

        // Local move/rename detection, before the presence table so a
        // move is never misread as delete-plus-create.
        if let Some(fsnode) = &row.fs {
            let fsid_differs = match row.sync {
                None => true,
                Some(s) => {
                    let n = self.tree.node(s);
                    !n.fsid.is_undef() && n.fsid != fsnode.fsid
                }
            };
            if fsid_differs {
                if let Some(row_result) = self.check_local_moves(ctx, row, parent, full_path) {
                    return row_result;
                }
            }
        }

        // Cloud-side move/rename detection, symmetric.
        if row.cloud.is_some() {
            let handle_differs = match row.sync {
                None => true,
                Some(s) => {
                    let n = self.tree.node(s);
                    let handle = row.cloud.as_ref().expect("checked above").handle;
                    !n.synced_handle.is_undef() && n.synced_handle != handle
                }
            };
            if handle_differs {
                if let Some(row_result) = self.check_cloud_moves(ctx, row, parent, full_path) {
                    return row_result;
                }
            }
        }

        // The eight presence combinations.
        match (row.cloud.clone(), row.sync, row.fs.clone()) {
            (Some(c), Some(s), Some(f)) => {
                let cloud_equal = sync_equal_cloud(&c, self.tree.node(s));
                let fs_equal = sync_equal_fs(&f, self.tree.node(s));

                if cloud_equal && fs_equal {
                    let (fsid, handle) = {
                        let n = self.tree.node(s);
                        (n.fsid, n.synced_handle)
                    };
                    if fsid != f.fsid || handle != c.handle {
                        debug!(path = %full_path, "row is synced, recording fsid and handle");
                        self.tree.set_fsid(s, f.fsid);
                        self.tree.set_synced_handle(s, c.handle);
                        self.cache.add(self.state, &self.tree, s);
                    } else {
                        trace!(path = %full_path, "row was already synced");
                    }
                    self.tree.node_mut(s).upload_in_flight = false;
                    ctx.download_done(c.handle);
                    true
                } else if fs_equal_cloud(&f, &c) {
                    // Both outer views agree with each other but not
                    // with the recorded state: a transfer or move has
                    // landed. Adopt it.
                    debug!(path = %full_path, "filesystem and cloud agree, adopting as synced");
                    self.tree.node_mut(s).fingerprint = f.fingerprint;
                    self.tree.set_fsid(s, f.fsid);
                    self.tree.set_synced_handle(s, c.handle);
                    self.tree.node_mut(s).upload_in_flight = false;
                    ctx.download_done(c.handle);
                    self.cache.add(self.state, &self.tree, s);
                    true
                } else if cloud_equal {
                    self.resolve_upsync(ctx, row, parent, full_path)
                } else if fs_equal {
                    self.resolve_downsync(ctx, row, parent, full_path, true)
                } else {
                    self.resolve_user_intervention(row, parent, full_path)
                }
            }
            (None, Some(s), Some(_)) => {
                if self.tree.node(s).synced_handle.is_undef() {
                    // Cloud item never existed: upsync.
                    self.resolve_upsync(ctx, row, parent, full_path)
                } else {
                    // Cloud item disappeared: quarantine locally.
                    self.resolve_cloud_node_gone(ctx, row, parent, full_path)
                }
            }
            (Some(_), Some(s), None) => {
                if !self.tree.node(s).fsid.is_undef() {
                    // Was synced locally: remove in the cloud.
                    self.resolve_fs_node_gone(ctx, row, parent, full_path)
                } else {
                    // Never existed locally: downsync.
                    self.resolve_downsync(ctx, row, parent, full_path, false)
                }
            }
            (None, Some(_), None) => self.resolve_del_sync_node(ctx, row, full_path),
            (Some(c), None, Some(f)) => {
                // Untracked pair: join when identical, else report.
                if f.kind != c.kind {
                    self.row_errors
                        .push(EngineError::TypeMismatch(full_path.to_string()));
                    self.resolve_user_intervention(row, parent, full_path)
                } else if !f.kind.is_file() || f.fingerprint.matches(&c.fingerprint) {
                    self.resolve_make_sync_node_from_fs(row, parent, full_path)
                } else {
                    self.resolve_pick_winner(row, parent, full_path)
                }
            }
            (None, None, Some(_)) => self.resolve_make_sync_node_from_fs(row, parent, full_path),
            (Some(_), None, None) => self.resolve_make_sync_node_from_cloud(row, parent, full_path),
            (None, None, None) => {
                debug_assert!(false, "row with no entries");
                true
            }
        }
    }

    // ========================================================================
    // Move/rename detection
    // ========================================================================

    /// Local-side move check. `Some(result)` means the row is fully
    /// handled this tick; `None` falls through to normal processing.
    fn check_local_moves(
        &mut self,
        ctx: &mut EngineContext,
        row: &mut SyncRow,
        parent: &ParentCtx,
        full_path: &LocalPath,
    ) -> Option<bool> {
        let fsnode = row.fs.clone().expect("caller checked fs presence");

        if let Some(sync_id) = row.sync {
            if self.tree.node(sync_id).kind != fsnode.kind {
                debug!(path = %full_path, "entry changed type, blocking");
                self.row_errors
                    .push(EngineError::TypeMismatch(full_path.to_string()));
                self.tree.set_use_blocked(sync_id, ctx.now_ds);
                return Some(false);
            }
        }

        let source = match find_source_by_fsid(&self.tree, &fsnode) {
            FsidLookup::NotFound => return None,
            FsidLookup::Mismatch(_) => {
                // fsid reuse after a delete/create cycle; force
                // comparison by content instead.
                debug!(path = %full_path, "detaching coincidentally reused fsid");
                self.row_errors
                    .push(EngineError::InconsistentFsid(full_path.to_string()));
                if let Some(f) = &mut row.fs {
                    f.fsid = Fsid::UNDEF;
                }
                return None;
            }
            FsidLookup::Found(source) => source,
        };

        // Editors move the original aside before rewriting; wait for
        // the source to hold still.
        if self.tree.node(source).kind.is_file() {
            let source_path = self.tree.local_path_of(source);
            match ctx
                .file_changes
                .check(self.fs.as_ref(), &source_path, ctx.now_secs)
            {
                FileChangeState::Waiting => return Some(false),
                FileChangeState::TimedOut => {
                    warn!(path = %source_path, "proceeding with move after stability timeout");
                }
                FileChangeState::Stable => {}
            }
        }

        info!(
            path = %full_path,
            source = %self.tree.local_path_of(source),
            "move detected by fsid"
        );

        let source_cloud = self
            .cloud
            .node_by_handle(self.tree.node(source).synced_handle);
        let target_cloud = self
            .cloud
            .node_by_handle(self.tree.node(parent.node).synced_handle);

        if let Some(sc) = &source_cloud {
            if sc.has_pending_commands {
                // Come back when the in-flight command has landed.
                debug!(path = %full_path, "commands already in progress for move source");
                ctx.flags.actioned_moves_renames = true;
                return Some(false);
            }
        }

        let (Some(sc), Some(tc)) = (source_cloud, target_cloud) else {
            debug!(path = %full_path, "source/target unavailable for move");
            return None;
        };

        let new_name = fsnode.name.clone();
        let renaming = new_name != sc.name;

        if sc.parent == tc.handle && !renaming {
            debug!(path = %full_path, "move/rename has completed");
            return None;
        }

        // An unrelated node already occupies the target name: replace.
        if let Some(rc) = &row.cloud {
            if rc.handle != sc.handle {
                debug!(replaced = %rc.name, "moving replaced node to cloud debris");
                self.cloud.move_to_sync_debris(rc.handle);
            }
        }

        if sc.parent == tc.handle {
            debug!(from = %sc.name, to = %new_name, "renaming cloud node");
            match self.cloud.set_attributes(sc.handle, &new_name) {
                CloudOpStatus::Unauthorized => {
                    warn!(path = %full_path, "rename not permitted");
                    self.row_errors
                        .push(EngineError::Unauthorized(full_path.to_string()));
                    None
                }
                CloudOpStatus::Ok | CloudOpStatus::Transient => {
                    ctx.flags.actioned_moves_renames = true;
                    Some(false)
                }
            }
        } else {
            debug!(
                node = %sc.name,
                target = %tc.name,
                renaming,
                "moving cloud node"
            );
            match self
                .cloud
                .rename(sc.handle, tc.handle, renaming.then_some(new_name.as_str()))
            {
                CloudOpStatus::Unauthorized => {
                    warn!(path = %full_path, "move not permitted");
                    self.row_errors
                        .push(EngineError::Unauthorized(full_path.to_string()));
                    None
                }
                CloudOpStatus::Ok | CloudOpStatus::Transient => {
                    ctx.flags.actioned_moves_renames = true;
                    Some(false)
                }
            }
        }
    }

    /// Cloud-side move check: a known cloud node shows up in a new
    /// location, so mirror the move locally.
    fn check_cloud_moves(
        &mut self,
        ctx: &mut EngineContext,
        row: &mut SyncRow,
        parent: &ParentCtx,
        full_path: &LocalPath,
    ) -> Option<bool> {
        let cloudnode = row.cloud.clone().expect("caller checked cloud presence");

        if let Some(sync_id) = row.sync {
            if self.tree.node(sync_id).kind != cloudnode.kind {
                debug!(path = %full_path, "cloud node changed type, blocking");
                self.row_errors
                    .push(EngineError::TypeMismatch(full_path.to_string()));
                self.tree.set_use_blocked(sync_id, ctx.now_ds);
                return Some(false);
            }
        }

        let source = find_source_by_handle(&self.tree, self.fs.as_ref(), cloudnode.handle)?;
        if Some(source) == row.sync {
            return None;
        }

        let source_path = self.tree.local_path_of(source);
        debug!(from = %source_path, to = %full_path, "mirroring cloud move locally");

        match self.fs.rename(&source_path, full_path) {
            Ok(()) => {
                ctx.flags.actioned_moves_renames = true;
                // New LocalNodes form at the new location, the old
                // ones dissolve; scan both ends.
                if let Some(source_parent) = self.tree.node(source).parent {
                    self.tree.set_future_scan(source_parent, true, false);
                }
                self.tree.set_future_scan(parent.node, true, true);
                Some(false)
            }
            Err(e) if e.is_transient() => {
                debug!(path = %full_path, error = %e, "transient error mirroring move");
                if let Some(sync_id) = row.sync {
                    self.tree.set_use_blocked(sync_id, ctx.now_ds);
                }
                Some(false)
            }
            Err(e) => {
                warn!(path = %full_path, error = %e, "failed to mirror cloud move");
                None
            }
        }
    }

    // ========================================================================
    // Resolvers
    // ========================================================================

    fn resolve_make_sync_node_from_fs(
        &mut self,
        row: &mut SyncRow,
        parent: &ParentCtx,
        full_path: &LocalPath,
    ) -> bool {
        let Some(fsnode) = &row.fs else {
            return false;
        };
        debug!(path = %full_path, "creating LocalNode from filesystem");

        let mut node = LocalNode::new(
            fsnode.kind,
            fsnode.name.clone(),
            fsnode.local_name.clone(),
            fsnode.shortname.clone(),
        );
        if fsnode.kind.is_file() {
            node.fingerprint = fsnode.fingerprint;
        }
        node.fsid = fsnode.fsid;

        let id = self.tree.insert(node, parent.node);
        if !fsnode.kind.is_file() {
            self.tree.set_future_scan(id, true, true);
        }
        self.cache.add(self.state, &self.tree, id);
        self.tree.set_future_scan(parent.node, true, false);

        row.sync = Some(id);
        false
    }

    fn resolve_make_sync_node_from_cloud(
        &mut self,
        row: &mut SyncRow,
        parent: &ParentCtx,
        full_path: &LocalPath,
    ) -> bool {
        let Some(cloudnode) = &row.cloud else {
            return false;
        };
        debug!(path = %full_path, "creating LocalNode from cloud");

        let mut node = LocalNode::new(
            cloudnode.kind,
            cloudnode.name.clone(),
            cloudnode.name.clone(),
            None,
        );
        if cloudnode.kind.is_file() {
            node.fingerprint = cloudnode.fingerprint;
        }
        node.synced_handle = cloudnode.handle;

        let id = self.tree.insert(node, parent.node);
        if !cloudnode.kind.is_file() {
            self.tree.set_future_scan(id, true, true);
        }
        self.cache.add(self.state, &self.tree, id);
        self.tree.set_future_scan(parent.node, true, false);

        row.sync = Some(id);
        false
    }

    fn resolve_del_sync_node(
        &mut self,
        ctx: &mut EngineContext,
        row: &mut SyncRow,
        full_path: &LocalPath,
    ) -> bool {
        if ctx.flags.scans_and_moves_complete {
            if let Some(sync_id) = row.sync.take() {
                // Both sides gone and nothing in flight: the node and
                // its rows go too.
                debug!(path = %full_path, "removing LocalNode");
                let removed_rows = self.tree.remove_subtree(sync_id);
                self.cache.queue_row_deletions(self.state, removed_rows);
            }
        }
        false
    }

    fn resolve_upsync(
        &mut self,
        _ctx: &mut EngineContext,
        row: &mut SyncRow,
        parent: &ParentCtx,
        full_path: &LocalPath,
    ) -> bool {
        let Some(fsnode) = &row.fs else {
            return false;
        };
        let Some(sync_id) = row.sync else {
            return false;
        };

        if fsnode.kind.is_file() {
            if self.tree.node(sync_id).upload_in_flight {
                trace!(path = %full_path, "upload already in progress");
            } else if let Some(parent_cloud) = &parent.cloud {
                debug!(path = %full_path, "uploading file");
                self.tree.node_mut(sync_id).upload_in_flight = true;
                self.cloud.start_transfer(TransferSpec {
                    direction: TransferDirection::Upload,
                    local_path: full_path.clone(),
                    cloud_node: NodeHandle::UNDEF,
                    cloud_parent: parent_cloud.handle,
                    name: fsnode.name.clone(),
                });
            } else {
                trace!(path = %full_path, "parent cloud folder does not exist yet");
            }
        } else if let Some(parent_cloud) = &parent.cloud {
            debug!(path = %full_path, "creating cloud folder");
            self.cloud.put_nodes(
                parent_cloud.handle,
                vec![NewCloudFolder {
                    name: self.tree.node(sync_id).name.clone(),
                }],
            );
        } else {
            trace!(path = %full_path, "parent cloud folder does not exist yet");
        }
        false
    }

    fn resolve_downsync(
        &mut self,
        ctx: &mut EngineContext,
        row: &mut SyncRow,
        parent: &ParentCtx,
        full_path: &LocalPath,
        already_exists: bool,
    ) -> bool {
        let Some(cloudnode) = &row.cloud else {
            return false;
        };

        if cloudnode.kind.is_file() {
            if ctx.download_in_flight(cloudnode.handle) {
                trace!(path = %full_path, "download already in progress");
            } else {
                debug!(path = %full_path, replacing = already_exists, "start fetching file");
                ctx.note_download(cloudnode.handle);
                self.cloud.start_transfer(TransferSpec {
                    direction: TransferDirection::Download,
                    local_path: full_path.clone(),
                    cloud_node: cloudnode.handle,
                    cloud_parent: NodeHandle::UNDEF,
                    name: cloudnode.name.clone(),
                });
            }
        } else {
            debug!(path = %full_path, "creating local folder");
            match self.fs.mkdir(full_path) {
                Ok(()) => {
                    self.tree.set_future_scan(parent.node, true, false);
                }
                Err(e) if e.kind == FsErrorKind::AlreadyExists => {
                    // Appeared on its own; the rescan will join it.
                    self.tree.set_future_scan(parent.node, true, false);
                }
                Err(e) => {
                    debug!(
                        path = %full_path,
                        error = %e,
                        transient = e.is_transient(),
                        "error creating folder, blocking"
                    );
                    self.row_errors.push(if e.is_transient() {
                        EngineError::TransientIo(e.to_string())
                    } else {
                        EngineError::PermanentIo(e.to_string())
                    });
                    if let Some(sync_id) = row.sync {
                        self.tree.set_use_blocked(sync_id, ctx.now_ds);
                    }
                }
            }
        }
        false
    }

    fn resolve_user_intervention(
        &mut self,
        _row: &mut SyncRow,
        parent: &ParentCtx,
        full_path: &LocalPath,
    ) -> bool {
        // Both sides changed (or the types disagree); not resolvable
        // without a user decision. Report and leave both sides alone.
        warn!(path = %full_path, "conflicting changes require user intervention");
        self.tree.set_conflict(parent.node);
        false
    }

    fn resolve_pick_winner(
        &mut self,
        row: &mut SyncRow,
        parent: &ParentCtx,
        full_path: &LocalPath,
    ) -> bool {
        // Untracked pair with differing content. Auto-resolution is a
        // user policy; record which side is newer and report.
        let local_mtime = row.fs.as_ref().map_or(0, |f| f.mtime);
        let cloud_mtime = row.cloud.as_ref().map_or(0, |c| c.fingerprint.mtime);
        warn!(
            path = %full_path,
            local_mtime,
            cloud_mtime,
            newer = if local_mtime >= cloud_mtime { "local" } else { "cloud" },
            "untracked pair differs, reporting"
        );
        self.tree.set_conflict(parent.node);
        false
    }

    fn resolve_cloud_node_gone(
        &mut self,
        ctx: &mut EngineContext,
        row: &mut SyncRow,
        parent: &ParentCtx,
        full_path: &LocalPath,
    ) -> bool {
        if ctx.flags.scans_and_moves_complete {
            // Had the node moved anywhere visible, the local move
            // would already have been mirrored; this is a deletion.
            debug!(path = %full_path, "moving local item to local debris");
            let now = Local::now();
            match move_to_local_debris(self.fs.as_ref(), &self.debris_path, full_path, &now) {
                Ok(resting) => {
                    debug!(path = %resting, "local item quarantined");
                    row.suppress_recursion = true;
                    self.tree.set_future_scan(parent.node, true, false);
                }
                Err(e) => {
                    error!(path = %full_path, error = %e, "failed to move to local debris");
                }
            }
        }
        false
    }

    fn resolve_fs_node_gone(
        &mut self,
        ctx: &mut EngineContext,
        row: &mut SyncRow,
        _parent: &ParentCtx,
        full_path: &LocalPath,
    ) -> bool {
        let Some(sync_id) = row.sync else {
            return false;
        };

        if ctx.flags.scans_and_moves_complete && !self.tree.node(sync_id).deleting {
            if let Some(cloudnode) = &row.cloud {
                debug!(path = %full_path, node = %cloudnode.name, "moving cloud item to cloud debris");
                self.cloud.move_to_sync_debris(cloudnode.handle);
                self.tree.node_mut(sync_id).deleting = true;
            }
        }

        if self.tree.node(sync_id).deleting {
            row.suppress_recursion = true;
        }
        false
    }
}

// ============================================================================
// Equality helpers
// ============================================================================

/// Name-matched cloud node vs synced state: same type, and for files
/// the same fingerprint.
fn sync_equal_cloud(cloud: &CloudNode, node: &LocalNode) -> bool {
    if cloud.kind != node.kind {
        return false;
    }
    if !cloud.kind.is_file() {
        return true;
    }
    cloud.fingerprint.matches(&node.fingerprint)
}

/// Name-matched filesystem entry vs synced state: same type, and for
/// files the same fingerprint.
fn sync_equal_fs(fs: &FsNode, node: &LocalNode) -> bool {
    if fs.kind != node.kind {
        return false;
    }
    if !fs.kind.is_file() {
        return true;
    }
    fs.fingerprint.matches(&node.fingerprint)
}

/// Filesystem entry vs cloud node, used to recognize a landed
/// transfer or move.
fn fs_equal_cloud(fs: &FsNode, cloud: &CloudNode) -> bool {
    if fs.kind != cloud.kind {
        return false;
    }
    if !fs.kind.is_file() {
        return true;
    }
    fs.fingerprint.matches(&cloud.fingerprint)
}

/// The name a row's child path is built from. The filesystem view
/// wins (it is what is actually on disk at this position).
fn row_child_name(row: &SyncRow, tree: &LocalTree) -> String {
    if let Some(fs) = &row.fs {
        return fs.local_name.clone();
    }
    if let Some(sync) = row.sync {
        return tree.node(sync).local_name.clone();
    }
    if let Some(fs) = row.fs_clashing.first() {
        return fs.local_name.clone();
    }
    if let Some(cloud) = &row.cloud {
        return cloud.name.clone();
    }
    if let Some(cloud) = row.cloud_clashing.first() {
        return cloud.name.clone();
    }
    String::new()
}

// ============================================================================
// Tests
// ============================================================================
