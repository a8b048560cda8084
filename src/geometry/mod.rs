//! Geometry utilities: SE(3) transforms, multi-view triangulation.

pub mod se3;
pub mod triangulation;

pub use se3::SE3;
pub use triangulation::triangulate;
