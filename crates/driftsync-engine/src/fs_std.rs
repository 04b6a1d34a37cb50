//! Standard-library filesystem adapter
//!
//! Implements the [`Filesystem`] port over `std::fs`. fsids map to
//! inode numbers on Unix; volumes are fingerprinted by device id.
//! Error mapping follows the port's transient/permanent split:
//! would-block and interrupted are transient, permission and
//! not-a-directory are permanent.

use std::fs::{File, Metadata};
use std::io::{ErrorKind, Read};

use driftsync_core::domain::{Fsid, LocalPath, NodeKind, VolumeFingerprint};
use driftsync_core::ports::{FileHandle, Filesystem, FsError};
use tracing::debug;

/// Filesystem adapter over the standard library.
///
/// Zero-sized: all context comes from the path arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFilesystem;

impl StdFilesystem {
    /// Create a new adapter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn map_io_error(e: &std::io::Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::not_found(e.to_string()),
        ErrorKind::AlreadyExists => FsError::already_exists(e.to_string()),
        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::TimedOut => {
            FsError::transient(e.to_string())
        }
        _ => FsError::permanent(e.to_string()),
    }
}

fn mtime_secs(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn fsid_of(metadata: &Metadata) -> Fsid {
    use std::os::unix::fs::MetadataExt;
    Fsid::new(metadata.ino())
}

#[cfg(not(unix))]
fn fsid_of(_metadata: &Metadata) -> Fsid {
    Fsid::UNDEF
}

#[cfg(unix)]
fn device_of(metadata: &Metadata) -> Option<VolumeFingerprint> {
    use std::os::unix::fs::MetadataExt;
    Some(VolumeFingerprint::new(metadata.dev()))
}

#[cfg(not(unix))]
fn device_of(_metadata: &Metadata) -> Option<VolumeFingerprint> {
    None
}

// ============================================================================
// StdFileHandle
// ============================================================================

/// Opened entry: stat snapshot plus a readable file for content.
struct StdFileHandle {
    kind: NodeKind,
    size: u64,
    mtime: i64,
    fsid: Fsid,
    is_symlink: bool,
    file: Option<File>,
}

impl Read for StdFileHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.file {
            Some(f) => f.read(buf),
            None => Ok(0),
        }
    }
}

impl FileHandle for StdFileHandle {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mtime(&self) -> i64 {
        self.mtime
    }

    fn fsid(&self) -> Fsid {
        self.fsid
    }

    fn is_symlink(&self) -> bool {
        self.is_symlink
    }
}

// ============================================================================
// Filesystem implementation
// ============================================================================

impl Filesystem for StdFilesystem {
    fn open(&self, path: &LocalPath) -> Result<Box<dyn FileHandle>, FsError> {
        // Symlink status comes from the entry itself, not its target.
        let symlink_meta = std::fs::symlink_metadata(path.as_path()).map_err(|e| map_io_error(&e))?;
        let is_symlink = symlink_meta.file_type().is_symlink();

        let metadata = std::fs::metadata(path.as_path()).unwrap_or_else(|_| symlink_meta.clone());
        let kind = if metadata.is_dir() {
            NodeKind::Dir
        } else if metadata.is_file() {
            NodeKind::File
        } else {
            NodeKind::Unknown
        };

        let file = if kind.is_file() && !is_symlink {
            Some(File::open(path.as_path()).map_err(|e| map_io_error(&e))?)
        } else {
            None
        };

        Ok(Box::new(StdFileHandle {
            kind,
            size: if kind.is_file() { metadata.len() } else { 0 },
            mtime: mtime_secs(&metadata),
            fsid: fsid_of(&metadata),
            is_symlink,
            file,
        }))
    }

    fn list_dir(&self, path: &LocalPath, _follow_symlinks: bool) -> Result<Vec<String>, FsError> {
        let entries = std::fs::read_dir(path.as_path()).map_err(|e| map_io_error(&e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| map_io_error(&e))?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => {
                    debug!(name = ?raw, "skipping non-UTF-8 directory entry");
                }
            }
        }
        Ok(names)
    }

    fn shortname(&self, _path: &LocalPath) -> Option<String> {
        // Legacy 8.3 shortnames exist only on Windows volumes.
        None
    }

    fn rename(&self, from: &LocalPath, to: &LocalPath) -> Result<(), FsError> {
        if to.as_path().exists() {
            return Err(FsError::already_exists(format!(
                "rename target exists: {to}"
            )));
        }
        std::fs::rename(from.as_path(), to.as_path()).map_err(|e| map_io_error(&e))
    }

    fn mkdir(&self, path: &LocalPath) -> Result<(), FsError> {
        std::fs::create_dir(path.as_path()).map_err(|e| map_io_error(&e))
    }

    fn exists(&self, path: &LocalPath) -> bool {
        path.as_path().exists()
    }

    fn volume_fingerprint(&self, path: &LocalPath) -> Option<VolumeFingerprint> {
        std::fs::metadata(path.as_path()).ok().and_then(|m| device_of(&m))
    }

    fn fsids_are_stable(&self, _path: &LocalPath) -> bool {
        // Inode numbers are stable on the local filesystems we target;
        // network mounts would need a per-volume probe.
        cfg!(unix)
    }

    fn is_case_sensitive(&self, _path: &LocalPath) -> bool {
        cfg!(not(any(target_os = "windows", target_os = "macos")))
    }
}

// ============================================================================
// Tests
// ============================================================================
