//! Local debris mover
//!
//! Local deletions are never destructive: the doomed path is renamed
//! into a dated quarantine folder under the sync's debris root
//! (`<debris>/YYYY-MM-DD/<leaf>`), creating the root and day folders
//! on demand. Collisions - same leaf deleted twice in one day, or
//! mid-second races - retry with progressively appended
//! ` HH.MM.SS.NN` suffixes for up to 100 attempts.
//!
//! Transient errors abort the operation so the caller retries on a
//! later tick; permanent errors leave the path in place.

use chrono::{DateTime, Local, Timelike};
use driftsync_core::domain::LocalPath;
use driftsync_core::ports::{Filesystem, FsError, FsErrorKind};
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 100;

/// Name of today's debris day folder.
#[must_use]
pub fn debris_day_name(now: &DateTime<Local>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Suffix appended on collision attempt `n` (n >= 1).
#[must_use]
fn collision_suffix(now: &DateTime<Local>, attempt: u32) -> String {
    format!(
        " {:02}.{:02}.{:02}.{:02}",
        now.hour(),
        now.minute(),
        now.second(),
        attempt
    )
}

/// Move `path` into the dated debris folder.
///
/// Returns the final resting path on success.
///
/// # Errors
/// A transient [`FsError`] means "try again next tick"; anything else
/// means the path was left in place.
pub fn move_to_local_debris(
    fs: &dyn Filesystem,
    debris_root: &LocalPath,
    path: &LocalPath,
    now: &DateTime<Local>,
) -> Result<LocalPath, FsError> {
    let Some(leaf) = path.leaf_name().map(str::to_string) else {
        return Err(FsError::permanent(format!("path has no leaf: {path}")));
    };

    ensure_dir(fs, debris_root)?;
    let day_dir = debris_root.append_name(&debris_day_name(now));
    ensure_dir(fs, &day_dir)?;

    for attempt in 0..MAX_ATTEMPTS {
        let target_name = if attempt == 0 {
            leaf.clone()
        } else {
            format!("{leaf}{}", collision_suffix(now, attempt))
        };
        let target = day_dir.append_name(&target_name);

        match fs.rename(path, &target) {
            Ok(()) => {
                debug!(from = %path, to = %target, "moved to local debris");
                return Ok(target);
            }
            Err(e) if e.kind == FsErrorKind::AlreadyExists => {
                // Taken; try the next suffix.
                continue;
            }
            Err(e) => {
                warn!(path = %path, error = %e, "failed to move to local debris");
                return Err(e);
            }
        }
    }

    Err(FsError::permanent(format!(
        "no free debris name for {path} after {MAX_ATTEMPTS} attempts"
    )))
}

fn ensure_dir(fs: &dyn Filesystem, dir: &LocalPath) -> Result<(), FsError> {
    match fs.mkdir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind == FsErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Tests
// ============================================================================
