//! Fusion of newly created mappoints into covisible keyframes.
//!
//! A new keyframe's fresh mappoints may duplicate landmarks that nearby
//! keyframes already observe. Each new mappoint is re-matched against the
//! keyframes covisible with the new keyframe (expanded by one more hop
//! through each neighbor's own covisible set): a match onto an empty
//! keypoint becomes a new observation, a match onto an already-matched
//! keypoint nominates the old mappoint for replacement by the new one.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::config::BackendConfig;
use crate::map::{KeyFrame, MapManager, MapPoint, MapPointId};

#[derive(Debug, Default)]
pub(crate) struct FusionStats {
    pub observations_added: usize,
    pub replacements: usize,
}

/// Sweep all new mappoints over the two-hop covisible neighborhood of
/// `keyframe`. Candidate bookkeeping keeps the smallest re-match distance
/// per target (ties keep the candidate encountered first).
pub(crate) fn fuse_new_mappoints(
    map: &MapManager,
    keyframe: &Arc<KeyFrame>,
    new_mappoints: &[(Arc<MapPoint>, usize)],
    config: &BackendConfig,
) -> FusionStats {
    let mut stats = FusionStats::default();
    if new_mappoints.is_empty() {
        return stats;
    }

    // Covisible keyframes plus their covisible keyframes, minus self.
    let mut candidates: BTreeSet<_> = keyframe.covisible_keyframe_ids().into_iter().collect();
    for neighbor_id in keyframe.covisible_keyframe_ids() {
        if let Some(neighbor) = map.keyframe(neighbor_id) {
            candidates.extend(neighbor.covisible_keyframe_ids());
        }
    }
    candidates.remove(&keyframe.id());

    // Old mappoint id -> (new mappoint id, distance): best replacement
    // candidate across all keyframes.
    let mut replacements: HashMap<MapPointId, (MapPointId, u32)> = HashMap::new();

    for candidate_id in candidates {
        let Some(candidate_kf) = map.keyframe(candidate_id) else {
            continue;
        };

        // Keypoint index -> (new mappoint, distance): best match per
        // still-empty keypoint of this keyframe.
        let mut empty_matches: HashMap<usize, (Arc<MapPoint>, u32)> = HashMap::new();

        for (mappoint, _) in new_mappoints {
            let query = candidate_kf.matched_keypoint(mappoint);
            let Some((keypoint_index, distance)) = query.matched else {
                continue;
            };
            if f64::from(distance) > config.re_match_descriptor_distance {
                continue;
            }

            match candidate_kf.mappoint_id_at(keypoint_index) {
                Some(old_id) if old_id == mappoint.id() => {}
                Some(old_id) => {
                    let better = replacements
                        .get(&old_id)
                        .map_or(true, |&(_, best)| distance < best);
                    if better {
                        replacements.insert(old_id, (mappoint.id(), distance));
                    }
                }
                None => {
                    let better = empty_matches
                        .get(&keypoint_index)
                        .map_or(true, |&(_, best)| distance < best);
                    if better {
                        empty_matches.insert(keypoint_index, (Arc::clone(mappoint), distance));
                    }
                }
            }
        }

        // Commit this keyframe's empty-keypoint matches as observations.
        let mut committed: Vec<_> = empty_matches.into_iter().collect();
        committed.sort_by_key(|(keypoint_index, _)| *keypoint_index);
        for (keypoint_index, (mappoint, distance)) in committed {
            debug!(
                "{}: new observation of {} at keypoint {} (distance {})",
                candidate_id,
                mappoint.id(),
                keypoint_index,
                distance
            );
            candidate_kf.add_observing_mappoint(&mappoint, keypoint_index);
            stats.observations_added += 1;
        }
    }

    // Replace merged mappoints by their duplicates.
    let mut replacements: Vec<_> = replacements.into_iter().collect();
    replacements.sort_by_key(|(old_id, _)| *old_id);
    stats.replacements = replacements.len();
    for (old_id, (new_id, _)) in replacements {
        map.replace_mappoint(old_id, new_id);
    }

    // New mappoints may now carry several observations.
    for (mappoint, _) in new_mappoints {
        mappoint.recompute_descriptor(map);
    }

    stats
}
