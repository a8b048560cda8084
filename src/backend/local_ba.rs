//! Local bundle adjustment over the covisible window of a new keyframe.
//!
//! The window contains the keyframe and its covisible keyframes; their
//! poses are optimized (the world anchor stays fixed). Every non-outlier
//! mappoint observed in the window becomes a marginalized landmark
//! vertex, and out-of-window observers contribute fixed pose vertices.
//! Two optimization rounds bracket a χ² outlier sweep; observations
//! failing the sweep are removed from their keyframes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::BackendConfig;
use crate::geometry::triangulate;
use crate::map::{KeyFrame, MapManager, MapPoint};
use crate::optimizer::{BundleAdjuster, EdgeHandle, PointVertexHandle, PoseVertexHandle};

/// Vertex bookkeeping carried from the optimization into the publish
/// step.
pub(crate) struct LocalBaOutcome {
    /// Optimized (in-window) poses.
    pub pose_entries: Vec<(Arc<KeyFrame>, PoseVertexHandle)>,
    /// Out-of-window observers, fixed at their current poses.
    pub fixed_entries: Vec<(Arc<KeyFrame>, PoseVertexHandle)>,
    /// Landmark vertices.
    pub point_entries: Vec<(Arc<MapPoint>, PointVertexHandle)>,
    pub num_edges: usize,
    pub triangulated: usize,
    pub outlier_edges: usize,
}

pub(crate) fn run_local_bundle_adjustment(
    adjuster: &mut BundleAdjuster,
    map: &MapManager,
    keyframe: &Arc<KeyFrame>,
    config: &BackendConfig,
) -> LocalBaOutcome {
    // Window: the new keyframe plus its covisible keyframes.
    let mut window = keyframe.covisible_keyframe_ids();
    window.push(keyframe.id());
    window.sort();
    window.dedup();

    let mut pose_handles: HashMap<_, PoseVertexHandle> = HashMap::new();
    let mut pose_entries = Vec::new();
    for kf_id in window {
        let Some(kf) = map.keyframe(kf_id) else {
            continue;
        };
        let handle = adjuster.add_pose_vertex(kf_id, kf.pose(), map.is_anchor(kf_id));
        pose_handles.insert(kf_id, handle);
        pose_entries.push((kf, handle));
    }

    // Every non-outlier mappoint observed in the window.
    let mut point_handles: HashMap<_, PointVertexHandle> = HashMap::new();
    let mut point_entries = Vec::new();
    for (kf, _) in &pose_entries {
        for mappoint_id in kf.observed_mappoint_ids() {
            if point_handles.contains_key(&mappoint_id) {
                continue;
            }
            let Some(mappoint) = map.mappoint(mappoint_id) else {
                continue;
            };
            if mappoint.is_outlier() {
                continue;
            }
            let handle = adjuster.add_mappoint_vertex(mappoint_id, mappoint.position(), true);
            point_handles.insert(mappoint_id, handle);
            point_entries.push((mappoint, handle));
        }
    }

    // Edges over all observations of the window's mappoints; observers
    // outside the window enter as fixed pose vertices. Landmarks never
    // yet triangulated get a DLT estimate from their observations.
    let mut fixed_handles: HashMap<_, PoseVertexHandle> = HashMap::new();
    let mut fixed_entries = Vec::new();
    let mut edges: Vec<(EdgeHandle, Arc<KeyFrame>, Arc<MapPoint>)> = Vec::new();
    let mut triangulated = 0;

    for (mappoint, point_handle) in &point_entries {
        let needs_triangulation = !mappoint.is_triangulated() && !mappoint.is_optimized();
        let mut observation_poses = Vec::new();
        let mut observation_rays = Vec::new();

        for (kf_id, keypoint_index) in mappoint.observations() {
            let Some(observer) = map.keyframe(kf_id) else {
                continue;
            };
            let Some(keypoint) = observer.keypoints.get(keypoint_index) else {
                continue;
            };

            let pose_handle = match pose_handles.get(&kf_id).or_else(|| fixed_handles.get(&kf_id))
            {
                Some(&handle) => handle,
                None => {
                    let handle = adjuster.add_pose_vertex(kf_id, observer.pose(), true);
                    fixed_handles.insert(kf_id, handle);
                    fixed_entries.push((Arc::clone(&observer), handle));
                    handle
                }
            };

            let edge = adjuster.add_projection_edge(pose_handle, *point_handle, keypoint.position);
            edges.push((edge, Arc::clone(&observer), Arc::clone(mappoint)));

            if needs_triangulation {
                observation_poses.push(observer.pose());
                observation_rays.push(observer.camera.pixel_to_camera(&keypoint.position, 1.0));
            }
        }

        if needs_triangulation && observation_poses.len() >= 2 {
            if let Some(p_world) = triangulate(&observation_poses, &observation_rays) {
                if p_world.z > 0.0 {
                    adjuster.set_point_estimate(*point_handle, p_world);
                    mappoint.set_triangulated(true);
                    triangulated += 1;
                }
            }
            // On failure the landmark stays untriangulated and keeps its
            // observations.
        }
    }

    let num_edges = edges.len();

    // First round, then sweep residuals: observations over the threshold
    // are removed and their edges excluded; robust kernels come off for
    // the refinement round.
    adjuster.optimize(config.bundle_iterations);

    let mut outlier_edges = 0;
    for (edge, observer, mappoint) in &edges {
        if adjuster.chi2(*edge) > config.chi2_th {
            observer.remove_observing_mappoint(map, mappoint.id());
            adjuster.set_level(*edge, 1);
            outlier_edges += 1;
        }
        adjuster.clear_robust_kernel(*edge);
    }

    adjuster.optimize(config.bundle_iterations);

    // Second sweep over the still-active edges; every landmark that held
    // a vertex in this round is marked optimized.
    for (edge, observer, mappoint) in &edges {
        if adjuster.is_active(*edge) && adjuster.chi2(*edge) > config.chi2_th {
            observer.remove_observing_mappoint(map, mappoint.id());
            outlier_edges += 1;
        }
        mappoint.set_optimized(true);
    }

    LocalBaOutcome {
        pose_entries,
        fixed_entries,
        point_entries,
        num_edges,
        triangulated,
        outlier_edges,
    }
}
