//! The asynchronous mapping backend.
//!
//! A single worker thread consumes keyframe submissions from the tracking
//! frontend through a one-slot input buffer: a submission *replaces* any
//! unconsumed one, and the worker processes whichever input is present
//! when it wakes. Per accepted keyframe the worker registers it with the
//! map, attaches tracked and newly created mappoints, fuses duplicates
//! into covisible keyframes, runs a two-pass local bundle adjustment and
//! publishes the results back to the frontend through a registered
//! callback.

mod fusion;
mod local_ba;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{ensure, Context, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::camera::Camera;
use crate::config::BackendConfig;
use crate::map::{KeyFrame, MapManager, MapPoint, MapPointId, TrackingMap};
use crate::optimizer::BundleAdjuster;

use fusion::fuse_new_mappoints;
use local_ba::{run_local_bundle_adjustment, LocalBaOutcome};

/// Minimum number of surviving per-round mappoints before the frontend
/// tracking map falls back to a full-map snapshot.
const MIN_TRACKING_MAP_SIZE: usize = 100;

/// Mutator applied to the frontend's reference keyframe and tracking map.
/// The frontend runs it while holding its own lock on both.
pub type FrontendMapUpdate<'a> = dyn FnMut(&mut Option<Arc<KeyFrame>>, &mut TrackingMap) + 'a;

/// Callback registered by the frontend at backend construction. Invoked
/// on the worker thread once per processed keyframe.
pub type FrontendHandler = Box<dyn Fn(&mut FrontendMapUpdate<'_>) + Send>;

/// One frontend submission: a fully constructed keyframe plus the
/// mappoint matches the frontend produced for it.
#[derive(Clone)]
struct PendingKeyframe {
    keyframe: Arc<KeyFrame>,
    /// Existing mappoint id -> keypoint index matched during tracking.
    tracked_mappoints: HashMap<MapPointId, usize>,
    /// Candidate mappoints created from unmatched keypoints with depth.
    new_mappoints: Vec<(Arc<MapPoint>, usize)>,
}

/// Shared state between the backend handle and its worker thread.
struct BackendShared {
    input: Mutex<Option<PendingKeyframe>>,
    trigger: Condvar,
    running: AtomicBool,
}

/// Handle to the mapping backend. Owns the worker thread; dropping the
/// handle stops and joins it.
pub struct Backend {
    shared: Arc<BackendShared>,
    worker: Option<JoinHandle<()>>,
}

impl Backend {
    /// Validate the configuration and spawn the worker thread.
    pub fn new(
        map: Arc<MapManager>,
        camera: Arc<Camera>,
        config: BackendConfig,
        handler: FrontendHandler,
    ) -> Result<Self> {
        config
            .validate()
            .context("backend configuration rejected")?;
        ensure!(
            config.min_covisibility_weight == map.min_covisibility_weight(),
            "covisibility threshold mismatch: backend {} vs map {}",
            config.min_covisibility_weight,
            map.min_covisibility_weight()
        );

        let shared = Arc::new(BackendShared {
            input: Mutex::new(None),
            trigger: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let mut worker = Worker::new(map, camera, config, handler);
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("mapping-backend".into())
            .spawn(move || worker.run(&worker_shared))
            .context("failed to spawn backend worker")?;

        Ok(Self {
            shared,
            worker: Some(handle),
        })
    }

    /// Hand a new keyframe to the backend. Replaces any pending
    /// submission; the frontend is expected to submit again only after
    /// results were published.
    pub fn process_new_keyframe(
        &self,
        keyframe: Arc<KeyFrame>,
        tracked_mappoints: HashMap<MapPointId, usize>,
        new_mappoints: Vec<(Arc<MapPoint>, usize)>,
    ) {
        let mut slot = self.shared.input.lock();
        if let Some(previous) = slot.take() {
            warn!(
                "{}: unconsumed submission replaced by {}",
                previous.keyframe.id(),
                keyframe.id()
            );
        }
        *slot = Some(PendingKeyframe {
            keyframe,
            tracked_mappoints,
            new_mappoints,
        });
        self.shared.trigger.notify_one();
    }

    /// Request shutdown and join the worker. Partial work already
    /// committed to the map stays committed.
    pub fn stop(&mut self) {
        {
            // Flag and signal under the input lock so the worker cannot
            // miss the wakeup between its run-flag check and the wait.
            let _slot = self.shared.input.lock();
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.trigger.notify_one();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker-thread state: everything the pipeline touches, including the
/// optimizer, which lives on this thread only.
struct Worker {
    map: Arc<MapManager>,
    config: BackendConfig,
    handler: FrontendHandler,
    adjuster: BundleAdjuster,
}

impl Worker {
    fn new(
        map: Arc<MapManager>,
        camera: Arc<Camera>,
        config: BackendConfig,
        handler: FrontendHandler,
    ) -> Self {
        Self {
            map,
            config,
            handler,
            adjuster: BundleAdjuster::new(camera),
        }
    }

    /// Block on the trigger until a submission or shutdown arrives.
    fn run(&mut self, shared: &BackendShared) {
        loop {
            let pending = {
                let mut slot = shared.input.lock();
                loop {
                    if !shared.running.load(Ordering::SeqCst) {
                        // Final cleanup on the shutdown path.
                        slot.take();
                        self.adjuster.clear();
                        return;
                    }
                    match slot.take() {
                        Some(pending) => break pending,
                        None => shared.trigger.wait(&mut slot),
                    }
                }
            };
            self.process(pending);
        }
    }

    /// One full backend iteration for an accepted keyframe.
    fn process(&mut self, pending: PendingKeyframe) {
        let PendingKeyframe {
            keyframe,
            tracked_mappoints,
            new_mappoints,
        } = pending;
        info!(
            "{}: backend processing ({} tracked, {} new mappoints)",
            keyframe.id(),
            tracked_mappoints.len(),
            new_mappoints.len()
        );

        self.map.add_keyframe(Arc::clone(&keyframe));
        self.attach_tracked_observations(&keyframe, &tracked_mappoints);
        self.attach_new_mappoints(&keyframe, &new_mappoints);
        keyframe.compute_covisibility(&self.map);

        let fusion = fuse_new_mappoints(&self.map, &keyframe, &new_mappoints, &self.config);
        debug!(
            "{}: fusion added {} observations, replaced {} mappoints",
            keyframe.id(),
            fusion.observations_added,
            fusion.replacements
        );

        let outcome =
            run_local_bundle_adjustment(&mut self.adjuster, &self.map, &keyframe, &self.config);
        info!(
            "{}: local BA over {} poses ({} fixed), {} mappoints, {} edges; \
             {} triangulated, {} outlier edges",
            keyframe.id(),
            outcome.pose_entries.len(),
            outcome.fixed_entries.len(),
            outcome.point_entries.len(),
            outcome.num_edges,
            outcome.triangulated,
            outcome.outlier_edges
        );

        self.publish(&keyframe, &outcome);
        self.adjuster.clear();
    }

    /// Attach observations of mappoints the frontend matched against
    /// existing map content. Replaced mappoints resolve to their
    /// survivors; missing ids are skipped.
    fn attach_tracked_observations(
        &self,
        keyframe: &Arc<KeyFrame>,
        tracked: &HashMap<MapPointId, usize>,
    ) {
        let mut entries: Vec<_> = tracked.iter().map(|(&id, &idx)| (id, idx)).collect();
        entries.sort_by_key(|(id, _)| *id);

        for (mappoint_id, keypoint_index) in entries {
            let Some(mappoint) = self.map.resolve_replacement(mappoint_id) else {
                debug!(
                    "{}: tracked {} no longer in map, skipped",
                    keyframe.id(),
                    mappoint_id
                );
                continue;
            };
            keyframe.add_observing_mappoint(&mappoint, keypoint_index);
            // The mappoint gained an observation; refresh its descriptor.
            mappoint.recompute_descriptor(&self.map);
        }
    }

    /// Register the frontend's candidate mappoints and their first
    /// observations.
    fn attach_new_mappoints(
        &self,
        keyframe: &Arc<KeyFrame>,
        new_mappoints: &[(Arc<MapPoint>, usize)],
    ) {
        for (mappoint, keypoint_index) in new_mappoints {
            self.map.add_mappoint(Arc::clone(mappoint));
            keyframe.add_observing_mappoint(mappoint, *keypoint_index);
        }
    }

    /// Publish optimized state through the frontend callback, per the
    /// handoff protocol: reset the reference keyframe and tracking map
    /// when the reference changed, then write back every optimized pose
    /// and position.
    fn publish(&self, keyframe: &Arc<KeyFrame>, outcome: &LocalBaOutcome) {
        let adjuster = &self.adjuster;
        let map = &self.map;

        (self.handler)(&mut |reference_keyframe, tracking_map| {
            let reset = reference_keyframe
                .as_ref()
                .map_or(true, |reference| reference.id() != keyframe.id());
            if reset {
                *reference_keyframe = Some(Arc::clone(keyframe));
                tracking_map.clear();
                for (mappoint, _) in &outcome.point_entries {
                    if !mappoint.is_outlier() {
                        tracking_map.insert(mappoint.id(), Arc::clone(mappoint));
                    }
                }
                if tracking_map.len() < MIN_TRACKING_MAP_SIZE {
                    info!(
                        "{}: only {} active mappoints, tracking map reset to full snapshot",
                        keyframe.id(),
                        tracking_map.len()
                    );
                    *tracking_map = map.all_mappoints();
                }
            }

            for (kf, handle) in outcome
                .pose_entries
                .iter()
                .chain(outcome.fixed_entries.iter())
            {
                kf.set_pose(adjuster.pose_estimate(*handle));
            }
            for (mappoint, handle) in &outcome.point_entries {
                mappoint.set_position(adjuster.point_estimate(*handle));
            }
        });
    }
}
