//! Sync configuration store
//!
//! Persistent registry of configured syncs, keyed by tag, over one
//! process-wide keyed table. Loaded fully on open; `insert` either
//! adds a new record (allocating the next row id) or updates the
//! existing one in place, keeping its row id.

use std::collections::BTreeMap;

use driftsync_core::domain::{NodeHandle, SyncConfig, SyncTag};
use driftsync_core::ports::StateTable;
use tracing::{debug, error};

/// Registry of [`SyncConfig`] records backed by a keyed table.
pub struct SyncConfigStore {
    table: Box<dyn StateTable>,
    configs: BTreeMap<SyncTag, SyncConfig>,
}

impl SyncConfigStore {
    /// Open the store, loading every stored record.
    ///
    /// Unreadable rows are logged and skipped; the registry keeps
    /// working with whatever could be read.
    #[must_use]
    pub fn open(mut table: Box<dyn StateTable>) -> Self {
        let mut configs = BTreeMap::new();

        table.rewind();
        while let Some((id, bytes)) = table.next() {
            match serde_json::from_slice::<SyncConfig>(&bytes) {
                Ok(mut config) => {
                    config.db_id = id;
                    configs.insert(config.tag, config);
                }
                Err(e) => {
                    error!(row = %id, error = %e, "unable to deserialize sync config");
                }
            }
        }

        debug!(count = configs.len(), "sync configs loaded");
        Self { table, configs }
    }

    /// Add a new config or update the stored record in place.
    pub fn insert(&mut self, mut config: SyncConfig) {
        let db_id = match self.configs.get(&config.tag) {
            Some(existing) => existing.db_id,
            None => self.table.next_id(),
        };
        config.db_id = db_id;

        let bytes = serde_json::to_vec(&config).expect("sync config serializes");
        self.table.begin();
        if let Err(e) = self.table.put(db_id, &bytes) {
            error!(row = %db_id, error = %e, "incomplete sync config put");
            self.table.abort();
            return;
        }
        self.table.commit();

        self.configs.insert(config.tag, config);
    }

    /// Remove a config by tag. Returns whether one existed.
    pub fn remove_by_tag(&mut self, tag: SyncTag) -> bool {
        let Some(config) = self.configs.remove(&tag) else {
            return false;
        };
        self.table.begin();
        if let Err(e) = self.table.del(config.db_id) {
            error!(row = %config.db_id, error = %e, "incomplete sync config delete");
            self.table.abort();
        } else {
            self.table.commit();
        }
        true
    }

    /// Look up by tag.
    #[must_use]
    pub fn get_by_tag(&self, tag: SyncTag) -> Option<&SyncConfig> {
        self.configs.get(&tag)
    }

    /// Look up by the cloud root handle the sync mirrors.
    #[must_use]
    pub fn get_by_cloud_root(&self, handle: NodeHandle) -> Option<&SyncConfig> {
        self.configs.values().find(|c| c.cloud_root == handle)
    }

    /// All configs, ordered by tag.
    #[must_use]
    pub fn all(&self) -> Vec<SyncConfig> {
        self.configs.values().cloned().collect()
    }

    /// Drop every config and truncate the table.
    pub fn clear(&mut self) {
        self.table.truncate();
        self.configs.clear();
    }

    /// Close the store, handing the backing table back to the caller.
    #[must_use]
    pub fn into_table(self) -> Box<dyn StateTable> {
        self.table
    }
}

// ============================================================================
// Tests
// ============================================================================
