//! Keyed state table port (driven/secondary port)
//!
//! The persistence layer the engine writes its crash-safe state into:
//! an append-update store of opaque byte rows keyed by small integer
//! ids, with explicit transaction bracketing and a forward cursor for
//! bulk restore. Values are opaque to the engine; hosts that encrypt
//! rows with a session key do so inside their implementation.
//!
//! [`MemoryTable`] is a reference implementation used by the engine's
//! tests and useful to hosts that want volatile state.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::domain::newtypes::DbId;

// ============================================================================
// StoreError
// ============================================================================

/// A failed table operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("State table error: {0}")]
pub struct StoreError(pub String);

// ============================================================================
// StateTable
// ============================================================================

/// Port trait for one keyed append-update table.
///
/// `put` either inserts or updates. Writes between `begin` and
/// `commit` must become durable atomically; `abort` discards them.
/// `next_id` hands out monotonically increasing, never-reused row ids
/// starting at 1 (0 is the "unsaved" sentinel).
pub trait StateTable: Send {
    /// Start a write transaction.
    fn begin(&mut self);

    /// Insert or update a row.
    ///
    /// # Errors
    /// Returns a [`StoreError`] if the write cannot be staged.
    fn put(&mut self, id: DbId, value: &[u8]) -> Result<(), StoreError>;

    /// Delete a row. Deleting an absent row is not an error.
    ///
    /// # Errors
    /// Returns a [`StoreError`] if the delete cannot be staged.
    fn del(&mut self, id: DbId) -> Result<(), StoreError>;

    /// Commit the current transaction.
    fn commit(&mut self);

    /// Discard the current transaction.
    fn abort(&mut self);

    /// Delete every row and reset the id allocator.
    fn truncate(&mut self);

    /// Reset the read cursor to the first row.
    fn rewind(&mut self);

    /// Read the next row, advancing the cursor.
    fn next(&mut self) -> Option<(DbId, Vec<u8>)>;

    /// Allocate the next unused row id.
    fn next_id(&mut self) -> DbId;
}

// ============================================================================
// MemoryTable
// ============================================================================

/// In-memory [`StateTable`] for tests and volatile hosts.
#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: BTreeMap<u32, Vec<u8>>,
    staged: Vec<Op>,
    in_tx: bool,
    cursor: u32,
    next_id: u32,
}

#[derive(Debug, Clone)]
enum Op {
    Put(u32, Vec<u8>),
    Del(u32),
}

impl MemoryTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if no rows are committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Put(id, value) => {
                self.rows.insert(id, value);
            }
            Op::Del(id) => {
                self.rows.remove(&id);
            }
        }
    }
}

impl StateTable for MemoryTable {
    fn begin(&mut self) {
        self.in_tx = true;
    }

    fn put(&mut self, id: DbId, value: &[u8]) -> Result<(), StoreError> {
        if self.in_tx {
            self.staged.push(Op::Put(id.as_u32(), value.to_vec()));
        } else {
            self.apply(Op::Put(id.as_u32(), value.to_vec()));
        }
        Ok(())
    }

    fn del(&mut self, id: DbId) -> Result<(), StoreError> {
        if self.in_tx {
            self.staged.push(Op::Del(id.as_u32()));
        } else {
            self.apply(Op::Del(id.as_u32()));
        }
        Ok(())
    }

    fn commit(&mut self) {
        let staged = std::mem::take(&mut self.staged);
        for op in staged {
            self.apply(op);
        }
        self.in_tx = false;
    }

    fn abort(&mut self) {
        self.staged.clear();
        self.in_tx = false;
    }

    fn truncate(&mut self) {
        self.rows.clear();
        self.staged.clear();
        self.in_tx = false;
        self.next_id = 0;
    }

    fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn next(&mut self) -> Option<(DbId, Vec<u8>)> {
        let (&id, value) = self.rows.range(self.cursor.saturating_add(1)..).next()?;
        self.cursor = id;
        Some((DbId::new(id), value.clone()))
    }

    fn next_id(&mut self) -> DbId {
        // Never hand out an id at or below an existing row, even after
        // a restart-style reload.
        let floor = self.rows.keys().next_back().copied().unwrap_or(0);
        if self.next_id < floor {
            self.next_id = floor;
        }
        self.next_id += 1;
        DbId::new(self.next_id)
    }
}

// ============================================================================
// Tests
// ============================================================================
