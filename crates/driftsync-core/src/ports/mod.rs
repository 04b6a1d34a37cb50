//! Ports (driven/secondary interfaces)
//!
//! The engine never talks to the outside world directly; it consumes
//! these traits. Hosts provide the cloud transport and the persistence
//! tables; `driftsync-engine` ships a standard-library filesystem
//! adapter and an in-memory state table for tests.

pub mod cloud;
pub mod filesystem;
pub mod notification;
pub mod state_table;

pub use cloud::{CloudClient, CloudNode, CloudOpStatus, NewCloudFolder, TransferDirection, TransferSpec};
pub use filesystem::{FileHandle, Filesystem, FsError, FsErrorKind};
pub use notification::PathNotification;
pub use state_table::{MemoryTable, StateTable, StoreError};
