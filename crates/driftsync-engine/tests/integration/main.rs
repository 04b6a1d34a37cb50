//! Integration tests for the reconciliation engine
//!
//! These drive a [`driftsync_engine::Sync`] against in-memory
//! filesystem / cloud / state-table fakes, simulating filesystem
//! events and server action packets over multiple ticks.

mod common;
mod test_scenarios;
