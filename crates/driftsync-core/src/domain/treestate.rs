//! Tri-state tree flags
//!
//! Several per-node conditions (scan needed, sync needed, conflicts,
//! blocked) are tracked with a four-valued flag that distinguishes
//! "action needed here" from "some descendant needs action", so the
//! reconciler can skip whole subtrees cheaply and still find its way
//! down to the nodes that need work.
//!
//! The propagation rules are pure functions kept here so flag math is
//! not scattered across the reconciler:
//!
//! - rolling up: a parent whose child has any non-resolved flag is at
//!   least `DescendantFlagged`;
//! - pushing down: `ActionSubtree` on a parent overrides whatever the
//!   child had.

use serde::{Deserialize, Serialize};

/// Four-valued per-node flag.
///
/// Ordering is meaningful: higher values demand more work.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TreeState {
    /// Nothing to do at this node or below.
    #[default]
    Resolved = 0,
    /// Some descendant needs action; nothing at this node itself.
    DescendantFlagged = 1,
    /// Action needed at this node (children may also have flags set).
    ActionHere = 2,
    /// Action needed at this node and every descendant.
    ActionSubtree = 3,
}

impl TreeState {
    /// True when this flag requires a visit to this node itself.
    #[must_use]
    pub fn action_here(&self) -> bool {
        *self >= TreeState::ActionHere
    }

    /// True when anything in this subtree still needs work.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self != TreeState::Resolved
    }

    /// Roll-up rule: combine a parent's flag with one child's flag.
    ///
    /// A resolved parent becomes `DescendantFlagged` as soon as any
    /// child carries a flag; an already-flagged parent is unchanged.
    #[must_use]
    pub fn update_from_child(self, child: TreeState) -> TreeState {
        if self == TreeState::Resolved && child != TreeState::Resolved {
            TreeState::DescendantFlagged
        } else {
            self
        }
    }

    /// Push-down rule: what a child's flag becomes under this parent.
    ///
    /// `ActionSubtree` overrides the child so the whole subtree is
    /// processed; anything else leaves the child flag alone.
    #[must_use]
    pub fn propagate_subtree(self, child: TreeState) -> TreeState {
        if self == TreeState::ActionSubtree {
            TreeState::ActionSubtree
        } else {
            child
        }
    }
}
