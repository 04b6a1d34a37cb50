//! Filesystem notification port
//!
//! Platform watchers (inotify and friends) run on their own producer
//! thread and only enqueue path notifications; the reconciler drains
//! the queue on its own thread and marks the affected subtrees for a
//! future scan. The engine never learns *what* changed from a
//! notification, only *where* - the scan re-derives the rest.

use crate::domain::path::LocalPath;

/// One "something changed at or below this path" event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathNotification {
    /// Absolute path the platform watcher reported.
    pub path: LocalPath,
}

impl PathNotification {
    /// Create a notification for `path`.
    #[must_use]
    pub fn new(path: LocalPath) -> Self {
        Self { path }
    }
}
