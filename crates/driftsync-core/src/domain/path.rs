//! Local path model
//!
//! [`LocalPath`] is the platform path value used throughout the engine:
//! append/leaf/parent operations, containment checks (for the debris
//! subtree), and name comparison under the volume's case sensitivity.
//!
//! Name comparison matters because the cloud side is case sensitive
//! while many local filesystems are not: two distinct cloud names may
//! collapse onto one local name, and the triplet builder joins the
//! cloud view with the local view using the *filesystem's* notion of
//! equality.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

// ============================================================================
// NameComparison
// ============================================================================

/// How names compare on a given volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameComparison {
    /// Names differing only in case are distinct (typical Linux).
    CaseSensitive,
    /// Names differing only in case collapse (typical FAT/NTFS/APFS).
    CaseInsensitive,
}

impl NameComparison {
    /// Compare two names under this volume's sensitivity.
    #[must_use]
    pub fn compare(&self, lhs: &str, rhs: &str) -> Ordering {
        match self {
            NameComparison::CaseSensitive => lhs.cmp(rhs),
            NameComparison::CaseInsensitive => lhs
                .chars()
                .flat_map(char::to_lowercase)
                .cmp(rhs.chars().flat_map(char::to_lowercase)),
        }
    }

    /// Returns true if the two names are equal under this comparison.
    #[must_use]
    pub fn eq(&self, lhs: &str, rhs: &str) -> bool {
        self.compare(lhs, rhs) == Ordering::Equal
    }
}

// ============================================================================
// LocalPath
// ============================================================================

/// An owned local filesystem path.
///
/// Thin value wrapper over [`PathBuf`]; the engine never interprets
/// path contents beyond component-wise operations, so no normalization
/// is applied here. Construction from a cloud name goes through
/// [`LocalPath::append_name`], which rejects separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalPath(PathBuf);

impl LocalPath {
    /// Create a LocalPath from any path-like value.
    #[must_use]
    pub fn from(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Borrow as a standard [`Path`].
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Consume into the inner [`PathBuf`].
    #[must_use]
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// Append one name component, returning the extended path.
    ///
    /// The component must not contain a path separator; a name coming
    /// from the cloud that does is a host bug, and we keep the path
    /// well-formed by substituting the separator out.
    #[must_use]
    pub fn append_name(&self, name: &str) -> Self {
        if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
            let sanitized: String = name
                .chars()
                .map(|c| {
                    if c == std::path::MAIN_SEPARATOR || c == '/' {
                        '_'
                    } else {
                        c
                    }
                })
                .collect();
            return Self(self.0.join(sanitized));
        }
        Self(self.0.join(name))
    }

    /// The final path component, if any.
    #[must_use]
    pub fn leaf_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|n| n.to_str())
    }

    /// The parent path, if any.
    #[must_use]
    pub fn parent(&self) -> Option<LocalPath> {
        self.0.parent().map(|p| Self(p.to_path_buf()))
    }

    /// True if `other` equals this path or lies underneath it.
    ///
    /// Component-wise prefix check; no filesystem access.
    #[must_use]
    pub fn is_containing_path_of(&self, other: &LocalPath) -> bool {
        let mut ours = self.0.components();
        let mut theirs = other.0.components();

        loop {
            match (ours.next(), theirs.next()) {
                (None, _) => return true,
                (Some(_), None) => return false,
                (Some(a), Some(b)) => {
                    if a != b {
                        return false;
                    }
                }
            }
        }
    }

    /// Components of `self` below `base`, as strings.
    ///
    /// Returns `None` if `self` is not underneath `base` or a
    /// component is not valid UTF-8.
    #[must_use]
    pub fn components_below(&self, base: &LocalPath) -> Option<Vec<String>> {
        let rest = self.0.strip_prefix(&base.0).ok()?;
        let mut out = Vec::new();
        for component in rest.components() {
            match component {
                Component::Normal(c) => out.push(c.to_str()?.to_string()),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(out)
    }
}

impl Display for LocalPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for LocalPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl From<PathBuf> for LocalPath {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

// ============================================================================
// Tests
// ============================================================================
