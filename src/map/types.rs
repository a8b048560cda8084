//! Identifier types for map entities.
//!
//! Ids are allocated by process-wide counters at entity construction and
//! are never reused, so they remain valid as lookup keys even after an
//! entity has been replaced or marked outlier.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_KEYFRAME_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_MAPPOINT_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    /// Allocate the next keyframe id.
    pub fn next() -> Self {
        Self(NEXT_KEYFRAME_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a mappoint (3D landmark).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapPointId(pub u64);

impl MapPointId {
    /// Allocate the next mappoint id.
    pub fn next() -> Self {
        Self(NEXT_MAPPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let a = KeyFrameId::next();
        let b = KeyFrameId::next();
        assert!(b.0 > a.0);

        let ids: HashSet<MapPointId> = (0..100).map(|_| MapPointId::next()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", KeyFrameId(7)), "KF7");
        assert_eq!(format!("{}", MapPointId(123)), "MP123");
    }
}
