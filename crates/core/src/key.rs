//! Shard keys and half-open key ranges
//!
//! A partitioned collection is split on a single shard key. Keys are
//! totally ordered: `MinKey < Int(_) < Str(_) < MaxKey`, so `MinKey` and
//! `MaxKey` bound every collection.
//!
//! A [`KeyRange`] is the half-open interval `[min, max)` used for chunks,
//! pending ranges and range deletion tasks.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FerryError, FerryResult};

/// Value of a document's shard key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShardKey {
    /// Sorts below every other key
    MinKey,
    /// Integer key
    Int(i64),
    /// String key
    Str(String),
    /// Sorts above every other key
    MaxKey,
}

impl ShardKey {
    /// True for the `MinKey`/`MaxKey` sentinels
    pub fn is_sentinel(&self) -> bool {
        matches!(self, ShardKey::MinKey | ShardKey::MaxKey)
    }
}

impl From<i64> for ShardKey {
    fn from(v: i64) -> Self {
        ShardKey::Int(v)
    }
}

impl From<&str> for ShardKey {
    fn from(v: &str) -> Self {
        ShardKey::Str(v.to_string())
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::MinKey => f.write_str("MinKey"),
            ShardKey::Int(v) => write!(f, "{}", v),
            ShardKey::Str(s) => write!(f, "{:?}", s),
            ShardKey::MaxKey => f.write_str("MaxKey"),
        }
    }
}

/// Half-open key interval `[min, max)`
///
/// Construction guarantees `min < max`, so a range is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRange {
    min: ShardKey,
    max: ShardKey,
}

impl KeyRange {
    /// Create a range, rejecting empty or inverted bounds
    pub fn new(min: impl Into<ShardKey>, max: impl Into<ShardKey>) -> FerryResult<Self> {
        let min = min.into();
        let max = max.into();
        if min >= max {
            return Err(FerryError::invalid_input(format!(
                "range min {} must be below max {}",
                min, max
            )));
        }
        if min == ShardKey::MaxKey || max == ShardKey::MinKey {
            return Err(FerryError::invalid_input("range bounds out of key space"));
        }
        Ok(Self { min, max })
    }

    /// Range covering the whole key space `[MinKey, MaxKey)`
    pub fn full() -> Self {
        Self {
            min: ShardKey::MinKey,
            max: ShardKey::MaxKey,
        }
    }

    /// Convenience constructor for integer bounds
    pub fn ints(min: i64, max: i64) -> FerryResult<Self> {
        Self::new(ShardKey::Int(min), ShardKey::Int(max))
    }

    /// Inclusive lower bound
    pub fn start(&self) -> &ShardKey {
        &self.min
    }

    /// Exclusive upper bound
    pub fn end(&self) -> &ShardKey {
        &self.max
    }

    /// True if `key` lies in `[min, max)`
    pub fn contains(&self, key: &ShardKey) -> bool {
        &self.min <= key && key < &self.max
    }

    /// True if the two ranges share at least one key
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// True if `other` lies entirely inside `self`
    pub fn covers(&self, other: &KeyRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    /// Overlapping part of two ranges, if any
    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        if !self.overlaps(other) {
            return None;
        }
        let min = std::cmp::max(&self.min, &other.min).clone();
        let max = std::cmp::min(&self.max, &other.max).clone();
        Some(KeyRange { min, max })
    }

    /// Parts of `self` not covered by any of `holes`, in key order
    pub fn subtract(&self, holes: &[KeyRange]) -> Vec<KeyRange> {
        let mut sorted: Vec<&KeyRange> = holes.iter().filter(|h| h.overlaps(self)).collect();
        sorted.sort();

        let mut gaps = Vec::new();
        let mut cursor = self.min.clone();
        for hole in sorted {
            if hole.min > cursor {
                gaps.push(KeyRange {
                    min: cursor.clone(),
                    max: hole.min.clone(),
                });
            }
            if hole.max > cursor {
                cursor = hole.max.clone();
            }
            if cursor >= self.max {
                return gaps;
            }
        }
        if cursor < self.max {
            gaps.push(KeyRange {
                min: cursor,
                max: self.max.clone(),
            });
        }
        gaps
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}
