//! SE(3) rigid transforms.
//!
//! Poses throughout the crate are world-to-camera transforms (T_c_w):
//! `p_cam = pose.transform_point(&p_world)`.

use nalgebra::{UnitQuaternion, Vector3};

/// A rigid transform in SE(3), stored as rotation + translation.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from an axis-angle rotation vector and a translation.
    pub fn from_axis_angle(axis_angle: Vector3<f64>, translation: Vector3<f64>) -> Self {
        let angle = axis_angle.norm();
        let rotation = if angle > 1e-12 {
            UnitQuaternion::from_axis_angle(&nalgebra::Unit::new_normalize(axis_angle), angle)
        } else {
            UnitQuaternion::identity()
        };
        Self {
            rotation,
            translation,
        }
    }

    /// The inverse transform: (R, t)⁻¹ = (Rᵀ, −Rᵀ t).
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            translation: -(rotation * self.translation),
            rotation,
        }
    }

    /// Composition `self ∘ other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotation angle (radians) of the transform, for convergence checks.
    pub fn rotation_angle(&self) -> f64 {
        self.rotation.angle()
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_identity_leaves_points_unchanged() {
        let p = Vector3::new(1.0, -2.0, 3.0);
        assert_relative_eq!(SE3::identity().transform_point(&p), p, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_round_trip() {
        let t = SE3::from_axis_angle(
            Vector3::new(0.1, -0.2, 0.3),
            Vector3::new(1.0, 2.0, -0.5),
        );
        let p = Vector3::new(0.4, 0.8, 2.5);
        let back = t.inverse().transform_point(&t.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_sequential_application() {
        let a = SE3::from_axis_angle(Vector3::new(0.0, FRAC_PI_2, 0.0), Vector3::new(1.0, 0.0, 0.0));
        let b = SE3::from_axis_angle(Vector3::new(0.2, 0.0, 0.0), Vector3::new(0.0, -1.0, 2.0));
        let p = Vector3::new(0.3, 0.6, 0.9);

        let composed = a.compose(&b).transform_point(&p);
        let sequential = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(composed, sequential, epsilon = 1e-12);
    }
}
