//! The shared SLAM map: keyframes, mappoints and their registry.

pub mod keyframe;
pub mod map_manager;
pub mod map_point;
pub mod types;

pub use keyframe::{KeyFrame, KeypointQuery};
pub use map_manager::{MapManager, TrackingMap};
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};
