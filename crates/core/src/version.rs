//! Placement versions
//!
//! A placement version is the fencing token attached to every chunk in the
//! routing table. Versions only ever grow: a commit moves a range to
//! `(collection_major + 1, 0)` and bumps the donor's remaining chunks to
//! the same major with increasing minors. Stale owners are rejected by
//! comparing against the version they last observed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic `(major, minor)` fencing token, ordered lexicographically
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct PlacementVersion {
    /// Bumped once per ownership change
    pub major: u64,
    /// Distinguishes chunks produced by the same change
    pub minor: u64,
}

impl PlacementVersion {
    /// Version assigned to a freshly created collection
    pub const INITIAL: PlacementVersion = PlacementVersion { major: 1, minor: 0 };

    /// Create a version
    pub const fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// First version of the next major generation
    pub fn next_major(&self) -> Self {
        Self {
            major: self.major.saturating_add(1),
            minor: 0,
        }
    }

    /// Same major, next minor
    pub fn next_minor(&self) -> Self {
        Self {
            major: self.major,
            minor: self.minor.saturating_add(1),
        }
    }
}

impl fmt::Display for PlacementVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.major, self.minor)
    }
}
