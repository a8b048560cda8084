//! Graph optimization for bundle adjustment.

pub mod bundle_adjuster;

pub use bundle_adjuster::{
    BundleAdjuster, EdgeHandle, PointVertexHandle, PoseVertexHandle, HUBER_DELTA,
};
