//! Pinhole RGB-D camera model.
//!
//! Pure coordinate conversions between world, camera and pixel frames.
//! Poses are world-to-camera transforms (T_c_w).

use nalgebra::{Vector2, Vector3};
use serde::Deserialize;

use crate::geometry::SE3;

/// Camera intrinsics as recognized by an external configuration loader.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CameraConfig {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Divisor converting raw depth-image values to meters.
    pub depth_scale: f64,
}

/// Pinhole RGB-D camera model.
#[derive(Debug, Clone)]
pub struct Camera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub depth_scale: f64,
}

impl Camera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            fx: config.fx,
            fy: config.fy,
            cx: config.cx,
            cy: config.cy,
            depth_scale: config.depth_scale,
        }
    }

    pub fn world_to_camera(&self, p_w: &Vector3<f64>, pose_cw: &SE3) -> Vector3<f64> {
        pose_cw.transform_point(p_w)
    }

    pub fn camera_to_world(&self, p_c: &Vector3<f64>, pose_cw: &SE3) -> Vector3<f64> {
        pose_cw.inverse().transform_point(p_c)
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Z ≤ 0 yields a finite but meaningless pixel; callers pre-filter.
    pub fn camera_to_pixel(&self, p_c: &Vector3<f64>) -> Vector2<f64> {
        Vector2::new(
            self.fx * p_c.x / p_c.z + self.cx,
            self.fy * p_c.y / p_c.z + self.cy,
        )
    }

    /// Back-project a pixel to the camera frame at the given depth.
    pub fn pixel_to_camera(&self, p_p: &Vector2<f64>, depth: f64) -> Vector3<f64> {
        Vector3::new(
            (p_p.x - self.cx) * depth / self.fx,
            (p_p.y - self.cy) * depth / self.fy,
            depth,
        )
    }

    pub fn pixel_to_world(&self, p_p: &Vector2<f64>, pose_cw: &SE3, depth: f64) -> Vector3<f64> {
        self.camera_to_world(&self.pixel_to_camera(p_p, depth), pose_cw)
    }

    pub fn world_to_pixel(&self, p_w: &Vector3<f64>, pose_cw: &SE3) -> Vector2<f64> {
        self.camera_to_pixel(&self.world_to_camera(p_w, pose_cw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    pub fn test_camera() -> Camera {
        Camera::new(CameraConfig {
            fx: 520.9,
            fy: 521.0,
            cx: 325.1,
            cy: 249.7,
            depth_scale: 1000.0,
        })
    }

    #[test]
    fn test_principal_point_projects_on_axis() {
        let camera = test_camera();
        let pixel = camera.camera_to_pixel(&Vector3::new(0.0, 0.0, 2.0));
        assert_relative_eq!(pixel.x, camera.cx, epsilon = 1e-12);
        assert_relative_eq!(pixel.y, camera.cy, epsilon = 1e-12);
    }

    #[test]
    fn test_pixel_camera_round_trip() {
        let camera = test_camera();
        let pixel = Vector2::new(400.0, 120.0);
        let depth = 3.2;

        let p_c = camera.pixel_to_camera(&pixel, depth);
        let back = camera.camera_to_pixel(&p_c);
        assert_relative_eq!(back, pixel, epsilon = 1e-9);
    }

    #[test]
    fn test_world_camera_round_trip() {
        let camera = test_camera();
        let pose = SE3::from_axis_angle(
            Vector3::new(0.0, 0.3, 0.1),
            Vector3::new(0.5, -0.2, 1.0),
        );
        let p_w = Vector3::new(1.0, 0.5, 4.0);

        let p_c = camera.world_to_camera(&p_w, &pose);
        let back = camera.camera_to_world(&p_c, &pose);
        assert_relative_eq!(back, p_w, epsilon = 1e-9);
    }

    #[test]
    fn test_world_pixel_composition() {
        let camera = test_camera();
        let pose = SE3::identity();
        let p_w = Vector3::new(0.4, -0.1, 5.0);

        let direct = camera.world_to_pixel(&p_w, &pose);
        let composed = camera.camera_to_pixel(&camera.world_to_camera(&p_w, &pose));
        assert_relative_eq!(direct, composed, epsilon = 1e-12);

        let back = camera.pixel_to_world(&direct, &pose, p_w.z);
        assert_relative_eq!(back, p_w, epsilon = 1e-9);
    }
}
