//! MapPoint - a 3D landmark observed by keyframes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Vector3;
use parking_lot::Mutex;

use crate::features::Descriptor;
use crate::map::map_manager::MapManager;
use crate::map::types::{KeyFrameId, MapPointId};

/// A 3D landmark with a representative binary descriptor and the set of
/// keyframes observing it.
///
/// Keyframes are referenced by id only; the map manager is the single
/// source of truth for entity existence. Mutable fields carry their own
/// locks so the tracking thread and the mapping backend can touch
/// different landmarks concurrently.
pub struct MapPoint {
    id: MapPointId,

    /// Position in world coordinates.
    position: Mutex<Vector3<f64>>,

    /// Representative descriptor, re-derived from observations.
    descriptor: Mutex<Descriptor>,

    /// Observing keyframe id -> keypoint index within that keyframe.
    observations: Mutex<HashMap<KeyFrameId, usize>>,

    /// Id of the surviving mappoint that subsumed this one, if any.
    replacement: Mutex<Option<MapPointId>>,

    outlier: AtomicBool,
    triangulated: AtomicBool,
    optimized: AtomicBool,
}

impl MapPoint {
    /// Create a landmark candidate at a world position. It becomes
    /// map-resident only once registered with the map manager.
    pub fn new(position: Vector3<f64>, descriptor: Descriptor) -> Self {
        Self {
            id: MapPointId::next(),
            position: Mutex::new(position),
            descriptor: Mutex::new(descriptor),
            observations: Mutex::new(HashMap::new()),
            replacement: Mutex::new(None),
            outlier: AtomicBool::new(false),
            triangulated: AtomicBool::new(false),
            optimized: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> MapPointId {
        self.id
    }

    pub fn position(&self) -> Vector3<f64> {
        *self.position.lock()
    }

    pub fn set_position(&self, position: Vector3<f64>) {
        *self.position.lock() = position;
    }

    pub fn descriptor(&self) -> Descriptor {
        *self.descriptor.lock()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Observations
    // ─────────────────────────────────────────────────────────────────────

    /// Register the landmark side of an observation. Idempotent on the
    /// same (keyframe, keypoint) pair.
    pub fn add_observation(&self, kf_id: KeyFrameId, keypoint_index: usize) {
        self.observations.lock().insert(kf_id, keypoint_index);
    }

    /// Remove the observation from a keyframe; no-op if absent. A
    /// landmark left with zero observations is marked outlier and will
    /// be skipped by the optimizer.
    pub fn remove_observation(&self, kf_id: KeyFrameId) {
        let mut observations = self.observations.lock();
        if observations.remove(&kf_id).is_some() && observations.is_empty() {
            self.outlier.store(true, Ordering::SeqCst);
        }
    }

    /// Observations as (keyframe id, keypoint index), ordered by
    /// keyframe id.
    pub fn observations(&self) -> Vec<(KeyFrameId, usize)> {
        let mut entries: Vec<_> = self
            .observations
            .lock()
            .iter()
            .map(|(&kf_id, &idx)| (kf_id, idx))
            .collect();
        entries.sort_by_key(|(kf_id, _)| *kf_id);
        entries
    }

    pub fn observer_ids(&self) -> Vec<KeyFrameId> {
        self.observations.lock().keys().copied().collect()
    }

    pub fn keypoint_index_in(&self, kf_id: KeyFrameId) -> Option<usize> {
        self.observations.lock().get(&kf_id).copied()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.lock().len()
    }

    /// Drain all observations, returning them ordered by keyframe id.
    /// Used when this landmark is merged into a survivor.
    pub(crate) fn take_observations(&self) -> Vec<(KeyFrameId, usize)> {
        let mut entries: Vec<_> = self.observations.lock().drain().collect();
        entries.sort_by_key(|(kf_id, _)| *kf_id);
        entries
    }

    /// Merge another landmark's observations into this one; existing
    /// entries of this landmark win on conflict.
    pub(crate) fn merge_observations(&self, other: &[(KeyFrameId, usize)]) {
        let mut observations = self.observations.lock();
        for &(kf_id, keypoint_index) in other {
            observations.entry(kf_id).or_insert(keypoint_index);
        }
    }

    /// Re-derive the representative descriptor as the median descriptor:
    /// the observing keypoint descriptor minimizing the sum of Hamming
    /// distances to all others. Ties break towards the lowest keyframe id.
    pub fn recompute_descriptor(&self, map: &MapManager) {
        let observations = self.observations();

        let mut descriptors = Vec::with_capacity(observations.len());
        for (kf_id, keypoint_index) in observations {
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            if let Some(kp) = kf.keypoints.get(keypoint_index) {
                descriptors.push(kp.descriptor);
            }
        }
        if descriptors.is_empty() {
            return;
        }

        let mut best = 0;
        let mut best_sum = u64::MAX;
        for (i, candidate) in descriptors.iter().enumerate() {
            let sum: u64 = descriptors
                .iter()
                .map(|other| u64::from(candidate.distance(other)))
                .sum();
            if sum < best_sum {
                best_sum = sum;
                best = i;
            }
        }

        *self.descriptor.lock() = descriptors[best];
    }

    // ─────────────────────────────────────────────────────────────────────
    // Flags and replacement
    // ─────────────────────────────────────────────────────────────────────

    pub fn is_outlier(&self) -> bool {
        self.outlier.load(Ordering::SeqCst)
    }

    pub fn set_outlier(&self, value: bool) {
        self.outlier.store(value, Ordering::SeqCst);
    }

    pub fn is_triangulated(&self) -> bool {
        self.triangulated.load(Ordering::SeqCst)
    }

    pub fn set_triangulated(&self, value: bool) {
        self.triangulated.store(value, Ordering::SeqCst);
    }

    pub fn is_optimized(&self) -> bool {
        self.optimized.load(Ordering::SeqCst)
    }

    pub fn set_optimized(&self, value: bool) {
        self.optimized.store(value, Ordering::SeqCst);
    }

    pub fn replacement(&self) -> Option<MapPointId> {
        *self.replacement.lock()
    }

    pub(crate) fn set_replacement(&self, survivor: MapPointId) {
        *self.replacement.lock() = Some(survivor);
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position())
            .field("observations", &self.num_observations())
            .field("outlier", &self.is_outlier())
            .field("triangulated", &self.is_triangulated())
            .field("optimized", &self.is_optimized())
            .field("replacement", &self.replacement())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mappoint() -> MapPoint {
        MapPoint::new(Vector3::new(1.0, 2.0, 3.0), Descriptor::zeros())
    }

    #[test]
    fn test_add_remove_observation() {
        let mp = test_mappoint();

        mp.add_observation(KeyFrameId(1), 5);
        mp.add_observation(KeyFrameId(2), 10);
        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.keypoint_index_in(KeyFrameId(1)), Some(5));

        // Idempotent on the same pair.
        mp.add_observation(KeyFrameId(1), 5);
        assert_eq!(mp.num_observations(), 2);

        mp.remove_observation(KeyFrameId(1));
        assert_eq!(mp.num_observations(), 1);
        assert!(!mp.is_outlier());

        // Removing an absent observation is a no-op.
        mp.remove_observation(KeyFrameId(1));
        assert_eq!(mp.num_observations(), 1);
    }

    #[test]
    fn test_zero_observations_marks_outlier() {
        let mp = test_mappoint();
        mp.add_observation(KeyFrameId(3), 0);
        mp.remove_observation(KeyFrameId(3));
        assert!(mp.is_outlier());
    }

    #[test]
    fn test_merge_keeps_existing_entries() {
        let mp = test_mappoint();
        mp.add_observation(KeyFrameId(1), 4);

        mp.merge_observations(&[(KeyFrameId(1), 9), (KeyFrameId(2), 7)]);
        assert_eq!(mp.keypoint_index_in(KeyFrameId(1)), Some(4));
        assert_eq!(mp.keypoint_index_in(KeyFrameId(2)), Some(7));
    }

    #[test]
    fn test_observations_sorted_by_keyframe_id() {
        let mp = test_mappoint();
        mp.add_observation(KeyFrameId(9), 0);
        mp.add_observation(KeyFrameId(2), 1);
        mp.add_observation(KeyFrameId(5), 2);

        let kf_ids: Vec<u64> = mp.observations().iter().map(|(id, _)| id.0).collect();
        assert_eq!(kf_ids, vec![2, 5, 9]);
    }
}
