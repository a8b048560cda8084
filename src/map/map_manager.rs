//! MapManager - the shared registry of keyframes and mappoints.
//!
//! One instance is shared (behind `Arc`) by the tracking frontend and the
//! mapping backend. The top-level registries are guarded by reader-writer
//! locks; mutable entity fields carry their own per-entity locks. The
//! registries own the live storage: deletion is soft (outlier flags and
//! replacement markers), so id lookups stay valid for the lifetime of the
//! map.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::map::keyframe::KeyFrame;
use crate::map::map_point::MapPoint;
use crate::map::types::{KeyFrameId, MapPointId};

/// Snapshot of mappoints handed to the tracking frontend.
pub type TrackingMap = HashMap<MapPointId, Arc<MapPoint>>;

pub struct MapManager {
    keyframes: RwLock<HashMap<KeyFrameId, Arc<KeyFrame>>>,
    mappoints: RwLock<HashMap<MapPointId, Arc<MapPoint>>>,

    /// First keyframe ever registered: the world anchor whose pose stays
    /// fixed during optimization.
    anchor: Mutex<Option<KeyFrameId>>,

    min_covisibility_weight: usize,
}

impl MapManager {
    pub fn new(min_covisibility_weight: usize) -> Arc<Self> {
        Arc::new(Self {
            keyframes: RwLock::new(HashMap::new()),
            mappoints: RwLock::new(HashMap::new()),
            anchor: Mutex::new(None),
            min_covisibility_weight,
        })
    }

    pub fn min_covisibility_weight(&self) -> usize {
        self.min_covisibility_weight
    }

    // ─────────────────────────────────────────────────────────────────────
    // Insertion and lookup
    // ─────────────────────────────────────────────────────────────────────

    /// Insert a keyframe; idempotent on id. The first keyframe becomes
    /// the world anchor.
    pub fn add_keyframe(&self, keyframe: Arc<KeyFrame>) {
        let id = keyframe.id();
        self.keyframes.write().entry(id).or_insert(keyframe);
        self.anchor.lock().get_or_insert(id);
    }

    /// Insert a mappoint; idempotent on id.
    pub fn add_mappoint(&self, mappoint: Arc<MapPoint>) {
        self.mappoints.write().entry(mappoint.id()).or_insert(mappoint);
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<Arc<KeyFrame>> {
        self.keyframes.read().get(&id).cloned()
    }

    pub fn mappoint(&self, id: MapPointId) -> Option<Arc<MapPoint>> {
        self.mappoints.read().get(&id).cloned()
    }

    /// Whether a keyframe is the world anchor (the first ever added).
    pub fn is_anchor(&self, id: KeyFrameId) -> bool {
        *self.anchor.lock() == Some(id)
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.read().len()
    }

    pub fn num_mappoints(&self) -> usize {
        self.mappoints.read().len()
    }

    /// Snapshot of all mappoints, including outliers and replaced ones.
    pub fn all_mappoints(&self) -> TrackingMap {
        self.mappoints
            .read()
            .iter()
            .map(|(&id, mpt)| (id, Arc::clone(mpt)))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Replacement
    // ─────────────────────────────────────────────────────────────────────

    /// Merge `old_id` into `new_id`: the old mappoint is marked outlier
    /// with a replacement marker, every keyframe observation of the old
    /// id is rewritten to the new id, and the old observation set is
    /// merged into the new one (existing entries of the survivor win).
    /// Covisibility of the affected keyframes is rebuilt afterwards.
    pub fn replace_mappoint(&self, old_id: MapPointId, new_id: MapPointId) {
        if old_id == new_id {
            return;
        }

        let affected: Vec<Arc<KeyFrame>> = {
            let keyframes = self.keyframes.write();
            let mappoints = self.mappoints.write();

            let (Some(old), Some(new)) = (mappoints.get(&old_id), mappoints.get(&new_id)) else {
                debug!("replace {} -> {}: entity missing, skipped", old_id, new_id);
                return;
            };

            old.set_outlier(true);
            old.set_replacement(new_id);

            let old_observations = old.take_observations();
            let mut affected = Vec::with_capacity(old_observations.len());
            for &(kf_id, _) in &old_observations {
                let Some(kf) = keyframes.get(&kf_id) else {
                    continue;
                };
                kf.rewrite_observation(old_id, new_id);
                affected.push(Arc::clone(kf));
            }

            new.merge_observations(&old_observations);
            affected
        };

        for keyframe in &affected {
            keyframe.compute_covisibility(self);
        }
    }

    /// Follow the replacement chain transitively and return the surviving
    /// mappoint. The chain is compressed on read.
    pub fn resolve_replacement(&self, id: MapPointId) -> Option<Arc<MapPoint>> {
        let mappoints = self.mappoints.read();

        let mut visited: Vec<MapPointId> = Vec::new();
        let mut seen: HashSet<MapPointId> = HashSet::new();
        let mut current = id;
        let survivor = loop {
            if !seen.insert(current) {
                warn!("replacement cycle at {}, lookup aborted", current);
                return None;
            }
            let mappoint = mappoints.get(&current)?;
            match mappoint.replacement() {
                None => break Arc::clone(mappoint),
                Some(next) => {
                    visited.push(current);
                    current = next;
                }
            }
        };

        // Path compression: everything visited now points at the survivor.
        for intermediate in visited {
            if let Some(mappoint) = mappoints.get(&intermediate) {
                mappoint.set_replacement(survivor.id());
            }
        }

        Some(survivor)
    }
}

impl std::fmt::Debug for MapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapManager")
            .field("keyframes", &self.num_keyframes())
            .field("mappoints", &self.num_mappoints())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Camera, CameraConfig};
    use crate::features::{Descriptor, ImageBuffer, Keypoint};
    use crate::geometry::SE3;
    use nalgebra::Vector3;

    fn test_camera() -> Arc<Camera> {
        Arc::new(Camera::new(CameraConfig {
            fx: 100.0,
            fy: 100.0,
            cx: 32.0,
            cy: 24.0,
            depth_scale: 1000.0,
        }))
    }

    fn make_keyframe(num_keypoints: usize) -> Arc<KeyFrame> {
        let keypoints = (0..num_keypoints)
            .map(|i| Keypoint::new(1.0 + i as f64, 1.0, Descriptor::zeros()))
            .collect();
        Arc::new(KeyFrame::new(
            0.0,
            test_camera(),
            ImageBuffer::filled(64, 48, [0u8; 3]),
            ImageBuffer::filled(64, 48, 2000u16),
            keypoints,
            SE3::identity(),
        ))
    }

    fn make_mappoint() -> Arc<MapPoint> {
        Arc::new(MapPoint::new(Vector3::new(0.0, 0.0, 2.0), Descriptor::zeros()))
    }

    #[test]
    fn test_insertion_is_idempotent_and_anchor_is_first() {
        let map = MapManager::new(15);
        let kf_a = make_keyframe(1);
        let kf_b = make_keyframe(1);

        map.add_keyframe(Arc::clone(&kf_a));
        map.add_keyframe(Arc::clone(&kf_a));
        map.add_keyframe(Arc::clone(&kf_b));

        assert_eq!(map.num_keyframes(), 2);
        assert!(map.is_anchor(kf_a.id()));
        assert!(!map.is_anchor(kf_b.id()));
        assert!(map.keyframe(kf_a.id()).is_some());
        assert!(map.keyframe(KeyFrameId(u64::MAX)).is_none());
    }

    #[test]
    fn test_replace_mappoint_rewrites_and_merges() {
        let map = MapManager::new(15);
        let kfs: Vec<_> = (0..3).map(|_| make_keyframe(2)).collect();
        let old = make_mappoint();
        let new = make_mappoint();

        for kf in &kfs {
            map.add_keyframe(Arc::clone(kf));
            kf.add_observing_mappoint(&old, 0);
        }
        map.add_mappoint(Arc::clone(&old));
        map.add_mappoint(Arc::clone(&new));
        // The survivor is already observed elsewhere.
        kfs[0].add_observing_mappoint(&new, 1);

        map.replace_mappoint(old.id(), new.id());

        // No keyframe references the old id.
        for kf in &kfs {
            assert_eq!(kf.keypoint_index_of(old.id()), None);
        }
        // kfs[0] keeps its own observation of the survivor (keypoint 1);
        // the others were rewritten in place (keypoint 0).
        assert_eq!(kfs[0].keypoint_index_of(new.id()), Some(1));
        assert_eq!(kfs[1].keypoint_index_of(new.id()), Some(0));
        assert_eq!(kfs[2].keypoint_index_of(new.id()), Some(0));

        // Old is soft-deleted, survivor holds the merged observations.
        assert!(old.is_outlier());
        assert_eq!(old.replacement(), Some(new.id()));
        for kf in &kfs {
            assert_eq!(
                new.keypoint_index_in(kf.id()),
                kf.keypoint_index_of(new.id())
            );
        }

        let survivor = map.resolve_replacement(old.id()).unwrap();
        assert_eq!(survivor.id(), new.id());
    }

    #[test]
    fn test_resolve_replacement_compresses_chain() {
        let map = MapManager::new(15);
        let a = make_mappoint();
        let b = make_mappoint();
        let c = make_mappoint();
        for mpt in [&a, &b, &c] {
            map.add_mappoint(Arc::clone(mpt));
        }

        map.replace_mappoint(a.id(), b.id());
        map.replace_mappoint(b.id(), c.id());

        let survivor = map.resolve_replacement(a.id()).unwrap();
        assert_eq!(survivor.id(), c.id());
        // Path compression: a now points directly at the survivor.
        assert_eq!(a.replacement(), Some(c.id()));

        // A mappoint with no replacement resolves to itself.
        assert_eq!(map.resolve_replacement(c.id()).unwrap().id(), c.id());
    }

    #[test]
    fn test_covisibility_link_appears_at_threshold() {
        let map = MapManager::new(15);
        let kf_a = make_keyframe(15);
        let kf_b = make_keyframe(15);
        map.add_keyframe(Arc::clone(&kf_a));
        map.add_keyframe(Arc::clone(&kf_b));

        // Exactly 14 shared mappoints: no link on either side.
        let mut shared = Vec::new();
        for i in 0..14 {
            let mpt = make_mappoint();
            map.add_mappoint(Arc::clone(&mpt));
            kf_a.add_observing_mappoint(&mpt, i);
            kf_b.add_observing_mappoint(&mpt, i);
            shared.push(mpt);
        }
        kf_a.compute_covisibility(&map);
        assert_eq!(kf_a.covisible_weight(kf_b.id()), 0);
        assert_eq!(kf_b.covisible_weight(kf_a.id()), 0);

        // One more shared mappoint: the link appears with weight 15 on
        // both sides.
        let mpt = make_mappoint();
        map.add_mappoint(Arc::clone(&mpt));
        kf_a.add_observing_mappoint(&mpt, 14);
        kf_b.add_observing_mappoint(&mpt, 14);
        kf_a.compute_covisibility(&map);

        assert_eq!(kf_a.covisible_weight(kf_b.id()), 15);
        assert_eq!(kf_b.covisible_weight(kf_a.id()), 15);
    }

    #[test]
    fn test_compute_covisibility_skips_while_observations_unchanged() {
        let map = MapManager::new(15);
        let kf_a = make_keyframe(16);
        let kf_b = make_keyframe(16);
        map.add_keyframe(Arc::clone(&kf_a));
        map.add_keyframe(Arc::clone(&kf_b));

        for i in 0..15 {
            let mpt = make_mappoint();
            map.add_mappoint(Arc::clone(&mpt));
            kf_a.add_observing_mappoint(&mpt, i);
            kf_b.add_observing_mappoint(&mpt, i);
        }
        kf_a.compute_covisibility(&map);
        assert_eq!(kf_b.covisible_weight(kf_a.id()), 15);

        // With observations unchanged the rebuild is skipped entirely: a
        // stale reverse link is left as-is.
        kf_b.remove_covisible_link(kf_a.id());
        kf_a.compute_covisibility(&map);
        assert_eq!(kf_b.covisible_weight(kf_a.id()), 0);

        // A new observation invalidates the cache; the next rebuild
        // writes both sides again.
        let extra = make_mappoint();
        map.add_mappoint(Arc::clone(&extra));
        kf_a.add_observing_mappoint(&extra, 15);
        kf_a.compute_covisibility(&map);
        assert_eq!(kf_a.covisible_weight(kf_b.id()), 15);
        assert_eq!(kf_b.covisible_weight(kf_a.id()), 15);
    }

    #[test]
    fn test_removing_shared_observation_drops_link_symmetrically() {
        let map = MapManager::new(15);
        let kf_a = make_keyframe(16);
        let kf_b = make_keyframe(16);
        map.add_keyframe(Arc::clone(&kf_a));
        map.add_keyframe(Arc::clone(&kf_b));

        let mut mappoints = Vec::new();
        for i in 0..15 {
            let mpt = make_mappoint();
            map.add_mappoint(Arc::clone(&mpt));
            kf_a.add_observing_mappoint(&mpt, i);
            kf_b.add_observing_mappoint(&mpt, i);
            mappoints.push(mpt);
        }
        kf_a.compute_covisibility(&map);
        assert_eq!(kf_b.covisible_weight(kf_a.id()), 15);

        // Weight falls below the threshold: link removed on both sides.
        kf_a.remove_observing_mappoint(&map, mappoints[0].id());
        assert_eq!(kf_a.covisible_weight(kf_b.id()), 0);
        assert_eq!(kf_b.covisible_weight(kf_a.id()), 0);
        // The mappoint side was updated too.
        assert_eq!(mappoints[0].keypoint_index_in(kf_a.id()), None);
        assert_eq!(mappoints[0].keypoint_index_in(kf_b.id()), Some(0));
    }
}

