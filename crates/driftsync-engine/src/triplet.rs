//! Triplet builder
//!
//! Joins the three views of one directory - cloud children, synced
//! state children, fresh filesystem entries - into an ordered sequence
//! of [`SyncRow`]s, one per local-name equivalence class.
//!
//! Two different comparators are involved, deliberately:
//!
//! - filesystem entries pair with sync nodes by cloud-canonical name,
//!   **case sensitively** (the cloud is the source of truth for
//!   names);
//! - cloud children pair with rows under the **filesystem's** name
//!   comparison (case insensitive on a case-insensitive volume), since
//!   multiple cloud names may collapse onto one local name.
//!
//! Tie-runs longer than one on either side are *name clashes*: the row
//! captures every clashing entry, and its primary `fs`/`cloud` slot is
//! filled only when exactly one clashing entry matches the incumbent
//! sync node's fsid (respectively synced cloud handle), so an
//! in-progress sync survives a clash appearing around it.

use std::cmp::Ordering;

use driftsync_core::domain::{FsNode, NameComparison};
use driftsync_core::ports::CloudNode;

use crate::tree::{LocalTree, NodeId};

// ============================================================================
// SyncRow
// ============================================================================

/// Up to three aligned views of one name under one directory.
#[derive(Debug, Clone, Default)]
pub struct SyncRow {
    /// The cloud child, if present and unambiguous.
    pub cloud: Option<CloudNode>,
    /// The synced-state node, if one exists.
    pub sync: Option<NodeId>,
    /// The filesystem entry, if present and unambiguous.
    pub fs: Option<FsNode>,
    /// Filesystem entries whose names clash for this row.
    pub fs_clashing: Vec<FsNode>,
    /// Cloud children whose names clash for this row.
    pub cloud_clashing: Vec<CloudNode>,
    /// Set when a resolver has already dealt with this subtree this
    /// tick (deletion in progress, moved to debris); blocks descent.
    pub suppress_recursion: bool,
}

impl SyncRow {
    /// True if any name clash was recorded on this row.
    #[must_use]
    pub fn has_clashes(&self) -> bool {
        !self.fs_clashing.is_empty() || !self.cloud_clashing.is_empty()
    }

    /// The name this row sorts under (the filesystem comparator's
    /// input).
    #[must_use]
    pub fn sort_name<'a>(&'a self, tree: &'a LocalTree) -> &'a str {
        if let Some(sync) = self.sync {
            return &tree.node(sync).local_name;
        }
        if let Some(fs) = &self.fs {
            return &fs.local_name;
        }
        if let Some(fs) = self.fs_clashing.first() {
            return &fs.local_name;
        }
        if let Some(cloud) = &self.cloud {
            return &cloud.name;
        }
        if let Some(cloud) = self.cloud_clashing.first() {
            return &cloud.name;
        }
        ""
    }
}

// ============================================================================
// compute_sync_triplets
// ============================================================================

/// Join `(cloud_children, sync children of parent, fs_children)` into
/// rows.
///
/// Postconditions: every input element appears in exactly one row,
/// either as a primary or as a clashing-name entry; rows are totally
/// ordered by `comparison` over their sort names.
#[must_use]
pub fn compute_sync_triplets(
    cloud_children: Vec<CloudNode>,
    tree: &LocalTree,
    parent: NodeId,
    fs_children: &[FsNode],
    comparison: NameComparison,
) -> Vec<SyncRow> {
    let mut rows = pair_fs_with_sync(tree, parent, fs_children);

    // Rows and cloud children both ordered by the filesystem
    // comparator for the second join.
    rows.sort_by(|a, b| comparison.compare(a.sort_name(tree), b.sort_name(tree)));
    let mut cloud_sorted = cloud_children;
    cloud_sorted.sort_by(|a, b| comparison.compare(&a.name, &b.name));

    link_cloud_children(&mut rows, cloud_sorted, tree, comparison);

    // Appended cloud-only rows go back into place so the row order is
    // a total order under the filesystem comparator.
    rows.sort_by(|a, b| comparison.compare(a.sort_name(tree), b.sort_name(tree)));
    rows
}

/// First sweep: pair filesystem entries with sync nodes by
/// cloud-canonical name, case sensitively.
fn pair_fs_with_sync(tree: &LocalTree, parent: NodeId, fs_children: &[FsNode]) -> Vec<SyncRow> {
    let mut fs_sorted: Vec<FsNode> = fs_children.to_vec();
    fs_sorted.sort_by(|a, b| a.local_name.cmp(&b.local_name));

    // children is a name-keyed map, so this side is already sorted and
    // clash-free.
    let locals: Vec<NodeId> = tree.children_of(parent);

    let mut rows = Vec::with_capacity(fs_sorted.len().max(locals.len()));
    let mut i = 0;
    let mut j = 0;

    while i < fs_sorted.len() || j < locals.len() {
        let mut fs_run_end = i;
        if i < fs_sorted.len() {
            fs_run_end = i + 1;
            while fs_run_end < fs_sorted.len()
                && fs_sorted[fs_run_end].local_name == fs_sorted[i].local_name
            {
                fs_run_end += 1;
            }
        }

        let (take_fs, take_local) = match (i < fs_sorted.len(), j < locals.len()) {
            (true, true) => {
                match fs_sorted[i].local_name.as_str().cmp(tree.node(locals[j]).name.as_str()) {
                    Ordering::Less => (true, false),
                    Ordering::Greater => (false, true),
                    Ordering::Equal => (true, true),
                }
            }
            (true, false) => (true, false),
            (false, true) => (false, true),
            (false, false) => break,
        };

        let mut row = SyncRow {
            sync: take_local.then(|| locals[j]),
            ..SyncRow::default()
        };

        if take_fs {
            let run = &fs_sorted[i..fs_run_end];
            if run.len() > 1 {
                tracing::debug!(
                    name = %run[0].local_name,
                    count = run.len(),
                    "conflicting filesystem names"
                );
                row.fs_clashing = run.to_vec();
                // Keep syncing the incumbent despite the clash.
                if let Some(sync) = row.sync {
                    let incumbent_fsid = tree.node(sync).fsid;
                    if !incumbent_fsid.is_undef() {
                        row.fs = run.iter().find(|f| f.fsid == incumbent_fsid).cloned();
                    }
                }
            } else {
                row.fs = Some(run[0].clone());
            }
        }

        rows.push(row);

        if take_fs {
            i = fs_run_end;
        }
        if take_local {
            j += 1;
        }
    }

    rows
}

/// Second sweep: attach cloud children to rows under the filesystem
/// comparator; unmatched cloud children become fresh rows.
fn link_cloud_children(
    rows: &mut Vec<SyncRow>,
    cloud_sorted: Vec<CloudNode>,
    tree: &LocalTree,
    comparison: NameComparison,
) {
    let mut extra: Vec<SyncRow> = Vec::new();
    let mut r = 0;
    let mut t = 0;
    let row_count = rows.len();

    while r < cloud_sorted.len() || t < row_count {
        let mut cloud_run_end = r;
        if r < cloud_sorted.len() {
            cloud_run_end = r + 1;
            while cloud_run_end < cloud_sorted.len()
                && comparison.eq(&cloud_sorted[cloud_run_end].name, &cloud_sorted[r].name)
            {
                cloud_run_end += 1;
            }
        }

        let (take_cloud, take_row) = match (r < cloud_sorted.len(), t < row_count) {
            (true, true) => {
                match comparison.compare(&cloud_sorted[r].name, rows[t].sort_name(tree)) {
                    Ordering::Less => (true, false),
                    Ordering::Greater => (false, true),
                    Ordering::Equal => (true, true),
                }
            }
            (true, false) => (true, false),
            (false, true) => (false, true),
            (false, false) => break,
        };

        if take_cloud {
            let run = &cloud_sorted[r..cloud_run_end];
            if take_row {
                let row = &mut rows[t];
                if run.len() > 1 {
                    for clash in run {
                        tracing::debug!(name = %clash.name, "conflicting cloud name");
                    }
                    row.cloud_clashing = run.to_vec();
                    // Keep syncing the incumbent despite the clash.
                    if let Some(sync) = row.sync {
                        let incumbent = tree.node(sync).synced_handle;
                        if !incumbent.is_undef() {
                            row.cloud = run.iter().find(|c| c.handle == incumbent).cloned();
                        }
                    }
                } else {
                    row.cloud = Some(run[0].clone());
                }
            } else if run.len() > 1 {
                // Clashing cloud names with nothing local: still
                // surfaced as one row so the clash is reported.
                extra.push(SyncRow {
                    cloud_clashing: run.to_vec(),
                    ..SyncRow::default()
                });
            } else {
                extra.push(SyncRow {
                    cloud: Some(run[0].clone()),
                    ..SyncRow::default()
                });
            }
            r = cloud_run_end;
        }
        if take_row {
            t += 1;
        }
    }

    rows.append(&mut extra);
}

// ============================================================================
// Tests
// ============================================================================
