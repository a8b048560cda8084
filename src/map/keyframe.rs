//! KeyFrame - a frame selected for inclusion in the map.
//!
//! Keyframes are the nodes of the covisibility graph. They carry the
//! immutable sensor payload (images, keypoints) plus guarded mutable
//! state: the pose, the keypoint <-> mappoint observation bookkeeping and
//! the covisibility weights. Other entities are referenced by id and
//! resolved through the [`MapManager`].

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::Mutex;
use tracing::debug;

use crate::camera::Camera;
use crate::features::{ColorImage, DepthImage, Keypoint};
use crate::geometry::SE3;
use crate::map::map_manager::MapManager;
use crate::map::map_point::MapPoint;
use crate::map::types::{KeyFrameId, MapPointId};

/// Valid metric depth range for depth-image samples (meters).
const MIN_VALID_DEPTH: f64 = 0.1;
const MAX_VALID_DEPTH: f64 = 14.0;

/// Pixel radius of the window searched when re-matching a mappoint
/// descriptor against a keyframe's keypoints.
const MATCH_SEARCH_RADIUS: f64 = 20.0;

/// Result of [`KeyFrame::matched_keypoint`]: the best keypoint match for
/// a mappoint descriptor, and whether the mappoint projected into view at
/// all.
#[derive(Debug, Clone, Copy)]
pub struct KeypointQuery {
    /// Best match as (keypoint index, Hamming distance), if any keypoint
    /// fell inside the search window.
    pub matched: Option<(usize, u32)>,
    /// Whether the mappoint projection landed inside the image with
    /// positive depth.
    pub may_observe: bool,
}

/// Guarded graph state: observations and covisibility.
#[derive(Default)]
struct GraphState {
    /// Keypoint index -> observed mappoint id (sparse, injective).
    mappoint_by_keypoint: HashMap<usize, MapPointId>,
    /// Reverse index, kept injective as well.
    keypoint_by_mappoint: HashMap<MapPointId, usize>,
    /// Covisible keyframe id -> number of shared mappoints (>= threshold).
    covisible_weights: HashMap<KeyFrameId, usize>,
    /// Set when observations changed since the last covisibility rebuild.
    covisibility_dirty: bool,
}

pub struct KeyFrame {
    id: KeyFrameId,
    pub timestamp: f64,
    pub camera: Arc<Camera>,
    pub color: ColorImage,
    pub depth: DepthImage,
    /// Detected feature points with descriptors, immutable after
    /// construction. Keypoint indices index into this sequence.
    pub keypoints: Vec<Keypoint>,

    /// World-to-camera transform (T_c_w).
    pose: Mutex<SE3>,
    graph: Mutex<GraphState>,
}

impl KeyFrame {
    pub fn new(
        timestamp: f64,
        camera: Arc<Camera>,
        color: ColorImage,
        depth: DepthImage,
        keypoints: Vec<Keypoint>,
        pose: SE3,
    ) -> Self {
        Self {
            id: KeyFrameId::next(),
            timestamp,
            camera,
            color,
            depth,
            keypoints,
            pose: Mutex::new(pose),
            graph: Mutex::new(GraphState::default()),
        }
    }

    pub fn id(&self) -> KeyFrameId {
        self.id
    }

    pub fn pose(&self) -> SE3 {
        self.pose.lock().clone()
    }

    pub fn set_pose(&self, pose: SE3) {
        *self.pose.lock() = pose;
    }

    /// Camera center in world coordinates.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.lock().inverse().translation
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sensor queries
    // ─────────────────────────────────────────────────────────────────────

    /// Bilinearly sample the depth image under a keypoint, in meters.
    /// Returns `None` when the sample is non-positive or outside the
    /// valid sensor range.
    pub fn depth_at(&self, keypoint: &Keypoint) -> Option<f64> {
        let u = keypoint.position.x;
        let v = keypoint.position.y;
        if u < 0.0 || v < 0.0 {
            return None;
        }

        let x0 = u.floor() as usize;
        let y0 = v.floor() as usize;
        let x1 = x0 + 1;
        let y1 = y0 + 1;
        if x1 >= self.depth.width() || y1 >= self.depth.height() {
            return None;
        }

        let fx = u - x0 as f64;
        let fy = v - y0 as f64;
        let sample = |x: usize, y: usize| self.depth.get(x, y).unwrap_or(0) as f64;

        let raw = (1.0 - fx) * (1.0 - fy) * sample(x0, y0)
            + fx * (1.0 - fy) * sample(x1, y0)
            + (1.0 - fx) * fy * sample(x0, y1)
            + fx * fy * sample(x1, y1);

        let depth = raw / self.camera.depth_scale;
        if depth <= 0.0 || !(MIN_VALID_DEPTH..=MAX_VALID_DEPTH).contains(&depth) {
            return None;
        }
        Some(depth)
    }

    /// Whether a world point projects into this keyframe's image with
    /// positive depth, under the current pose.
    pub fn is_in_view(&self, p_world: &Vector3<f64>) -> bool {
        let pose = self.pose();
        let p_cam = self.camera.world_to_camera(p_world, &pose);
        if p_cam.z <= 0.0 {
            return false;
        }
        let pixel = self.camera.camera_to_pixel(&p_cam);
        pixel.x >= 0.0
            && pixel.x < self.color.width() as f64
            && pixel.y >= 0.0
            && pixel.y < self.color.height() as f64
    }

    // ─────────────────────────────────────────────────────────────────────
    // Observations
    // ─────────────────────────────────────────────────────────────────────

    /// Record both sides of an observation and invalidate the cached
    /// covisibility. Idempotent on the same (mappoint, keypoint) pair;
    /// a pair conflicting with an existing observation is skipped so the
    /// keypoint<->mappoint maps stay injective.
    pub fn add_observing_mappoint(&self, mappoint: &Arc<MapPoint>, keypoint_index: usize) {
        if keypoint_index >= self.keypoints.len() {
            debug!(
                "{}: keypoint index {} out of range, observation of {} dropped",
                self.id,
                keypoint_index,
                mappoint.id()
            );
            return;
        }

        {
            let mut graph = self.graph.lock();
            match (
                graph.mappoint_by_keypoint.get(&keypoint_index),
                graph.keypoint_by_mappoint.get(&mappoint.id()),
            ) {
                (Some(&existing), _) if existing == mappoint.id() => return,
                (Some(&existing), _) => {
                    debug!(
                        "{}: keypoint {} already observes {}, skipping {}",
                        self.id,
                        keypoint_index,
                        existing,
                        mappoint.id()
                    );
                    return;
                }
                (None, Some(&existing_idx)) => {
                    debug!(
                        "{}: {} already observed at keypoint {}, skipping keypoint {}",
                        self.id,
                        mappoint.id(),
                        existing_idx,
                        keypoint_index
                    );
                    return;
                }
                (None, None) => {}
            }
            graph.mappoint_by_keypoint.insert(keypoint_index, mappoint.id());
            graph.keypoint_by_mappoint.insert(mappoint.id(), keypoint_index);
            graph.covisibility_dirty = true;
        }

        mappoint.add_observation(self.id, keypoint_index);
    }

    /// Remove both sides of an observation, then decrement the recorded
    /// covisibility weight towards every remaining observer of the
    /// mappoint. Links dropping below the map's threshold are removed
    /// symmetrically. No-op if this keyframe does not observe the
    /// mappoint.
    pub fn remove_observing_mappoint(&self, map: &MapManager, mappoint_id: MapPointId) {
        let removed = {
            let mut graph = self.graph.lock();
            match graph.keypoint_by_mappoint.remove(&mappoint_id) {
                Some(keypoint_index) => {
                    graph.mappoint_by_keypoint.remove(&keypoint_index);
                    graph.covisibility_dirty = true;
                    true
                }
                None => false,
            }
        };
        if !removed {
            return;
        }

        let Some(mappoint) = map.mappoint(mappoint_id) else {
            return;
        };
        mappoint.remove_observation(self.id);

        // The shared count with every remaining observer just dropped by
        // one; mirror that in the covisibility weights on both sides.
        let min_weight = map.min_covisibility_weight();
        for other_id in mappoint.observer_ids() {
            if other_id == self.id {
                continue;
            }
            let new_weight = {
                let mut graph = self.graph.lock();
                match graph.covisible_weights.get_mut(&other_id) {
                    Some(weight) => {
                        *weight = weight.saturating_sub(1);
                        let w = *weight;
                        if w < min_weight {
                            graph.covisible_weights.remove(&other_id);
                        }
                        Some(w)
                    }
                    None => None,
                }
            };
            let Some(new_weight) = new_weight else {
                continue;
            };
            if let Some(other) = map.keyframe(other_id) {
                if new_weight < min_weight {
                    other.remove_covisible_link(self.id);
                } else {
                    other.set_covisible_weight(self.id, new_weight);
                }
            }
        }
    }

    /// Rewrite an observation of a replaced mappoint to its survivor,
    /// dropping the slot instead when the survivor is already observed at
    /// another keypoint (the maps stay injective). Used only by
    /// [`MapManager::replace_mappoint`].
    pub(crate) fn rewrite_observation(&self, old_id: MapPointId, new_id: MapPointId) {
        let mut graph = self.graph.lock();
        let Some(keypoint_index) = graph.keypoint_by_mappoint.remove(&old_id) else {
            return;
        };
        graph.mappoint_by_keypoint.remove(&keypoint_index);
        if !graph.keypoint_by_mappoint.contains_key(&new_id) {
            graph.mappoint_by_keypoint.insert(keypoint_index, new_id);
            graph.keypoint_by_mappoint.insert(new_id, keypoint_index);
        }
        graph.covisibility_dirty = true;
    }

    /// Mappoint id observed at a keypoint index, if any.
    pub fn mappoint_id_at(&self, keypoint_index: usize) -> Option<MapPointId> {
        self.graph.lock().mappoint_by_keypoint.get(&keypoint_index).copied()
    }

    /// Keypoint index observing a mappoint, if any.
    pub fn keypoint_index_of(&self, mappoint_id: MapPointId) -> Option<usize> {
        self.graph.lock().keypoint_by_mappoint.get(&mappoint_id).copied()
    }

    /// All observed mappoint ids, ordered by id.
    pub fn observed_mappoint_ids(&self) -> Vec<MapPointId> {
        let mut ids: Vec<_> = self.graph.lock().keypoint_by_mappoint.keys().copied().collect();
        ids.sort();
        ids
    }

    /// All observations as (keypoint index, mappoint id), ordered by
    /// keypoint index.
    pub fn observations(&self) -> Vec<(usize, MapPointId)> {
        let mut entries: Vec<_> = self
            .graph
            .lock()
            .mappoint_by_keypoint
            .iter()
            .map(|(&idx, &id)| (idx, id))
            .collect();
        entries.sort_by_key(|(idx, _)| *idx);
        entries
    }

    pub fn num_observations(&self) -> usize {
        self.graph.lock().keypoint_by_mappoint.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Covisibility graph
    // ─────────────────────────────────────────────────────────────────────

    /// Rebuild the covisibility weights from current observations: a
    /// histogram over all other keyframes observing the same mappoints,
    /// kept where the shared count reaches the map's threshold. Weights
    /// are written to both sides of every link; stale reverse links are
    /// pruned. The rebuild is skipped while no observation of this
    /// keyframe changed since the last one (mutations mark the cache
    /// dirty).
    pub fn compute_covisibility(&self, map: &MapManager) {
        if !self.graph.lock().covisibility_dirty {
            return;
        }

        let min_weight = map.min_covisibility_weight();

        let mut histogram: HashMap<KeyFrameId, usize> = HashMap::new();
        for mappoint_id in self.observed_mappoint_ids() {
            let Some(mappoint) = map.mappoint(mappoint_id) else {
                continue;
            };
            for observer in mappoint.observer_ids() {
                if observer != self.id {
                    *histogram.entry(observer).or_insert(0) += 1;
                }
            }
        }
        histogram.retain(|_, weight| *weight >= min_weight);

        let removed: Vec<KeyFrameId> = {
            let mut graph = self.graph.lock();
            let removed = graph
                .covisible_weights
                .keys()
                .filter(|id| !histogram.contains_key(*id))
                .copied()
                .collect();
            graph.covisible_weights = histogram.clone();
            graph.covisibility_dirty = false;
            removed
        };

        for (&other_id, &weight) in &histogram {
            if let Some(other) = map.keyframe(other_id) {
                other.set_covisible_weight(self.id, weight);
            }
        }
        for other_id in removed {
            if let Some(other) = map.keyframe(other_id) {
                other.remove_covisible_link(self.id);
            }
        }
    }

    /// Covisible keyframe ids, ordered by id.
    pub fn covisible_keyframe_ids(&self) -> Vec<KeyFrameId> {
        let mut ids: Vec<_> = self.graph.lock().covisible_weights.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Shared-observation weight towards another keyframe (0 when not
    /// linked).
    pub fn covisible_weight(&self, kf_id: KeyFrameId) -> usize {
        self.graph.lock().covisible_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub(crate) fn set_covisible_weight(&self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.graph.lock().covisible_weights.insert(kf_id, weight);
    }

    pub(crate) fn remove_covisible_link(&self, kf_id: KeyFrameId) {
        self.graph.lock().covisible_weights.remove(&kf_id);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Matching
    // ─────────────────────────────────────────────────────────────────────

    /// Search this keyframe's keypoints for the nearest descriptor to the
    /// mappoint's descriptor, within a window around the mappoint's
    /// projection under the current pose. Ties keep the first keypoint
    /// encountered.
    pub fn matched_keypoint(&self, mappoint: &MapPoint) -> KeypointQuery {
        let position = mappoint.position();
        if !self.is_in_view(&position) {
            return KeypointQuery {
                matched: None,
                may_observe: false,
            };
        }

        let pixel = self.camera.world_to_pixel(&position, &self.pose());
        let descriptor = mappoint.descriptor();
        let radius_sq = MATCH_SEARCH_RADIUS * MATCH_SEARCH_RADIUS;

        let mut best: Option<(usize, u32)> = None;
        for (index, keypoint) in self.keypoints.iter().enumerate() {
            let offset = keypoint.position - pixel;
            if offset.norm_squared() > radius_sq {
                continue;
            }
            let distance = descriptor.distance(&keypoint.descriptor);
            if best.map_or(true, |(_, best_distance)| distance < best_distance) {
                best = Some((index, distance));
            }
        }

        KeypointQuery {
            matched: best,
            may_observe: true,
        }
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = self.graph.lock();
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("keypoints", &self.keypoints.len())
            .field("observations", &graph.keypoint_by_mappoint.len())
            .field("covisible", &graph.covisible_weights.len())
            .finish()
    }
}
