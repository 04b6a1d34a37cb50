//! Driftsync Engine - bidirectional tree reconciliation
//!
//! The engine keeps a local filesystem subtree in sync with a remote
//! cloud subtree. For each pair of corresponding directories it:
//!
//! 1. scans the filesystem off the hot path (a shared worker pool),
//! 2. joins the three views - filesystem entries, last-known synced
//!    state, cloud children - into *triplets* keyed by name,
//! 3. decides per triplet whether the row is synced or needs upload,
//!    download, move/rename propagation, conflict signalling, or
//!    deletion,
//! 4. persists the last-known state so a restart resumes correctly.
//!
//! ## Threading
//!
//! Exactly one reconciler thread per process drives all tree mutation,
//! triplet building, cache I/O, and command issuance. Scan workers
//! never touch the tree; they hand value batches back through their
//! request objects. The reconciler never blocks on I/O: enumeration is
//! deferred to the pool, cloud commands return immediately, transfers
//! go to the transfer subsystem.
//!
//! ## Entry points
//!
//! [`Sync`](engine::Sync) is one configured sync;
//! [`EngineContext`](engine::EngineContext) holds the process-wide
//! pieces shared by every sync in the process.

pub mod backoff;
pub mod cache;
pub mod config_store;
pub mod debris;
pub mod engine;
pub mod fs_std;
pub mod moves;
pub mod scan;
pub mod tree;
pub mod triplet;

pub use engine::{EngineContext, Sync, SyncFlags};
pub use fs_std::StdFilesystem;
pub use scan::ScanService;
