//! Sparse Levenberg-Marquardt bundle adjustment.
//!
//! A graph-style adapter over a hand-rolled solver: pose vertices on
//! SE(3), landmark vertices in R³, binary reprojection edges with robust
//! Huber kernels. Landmark blocks are marginalized with the Schur
//! complement so the reduced camera system stays small; the reduced
//! system is solved with a dense Cholesky factorization (LU fallback).
//!
//! Conventions follow g2o: poses are world-to-camera transforms, the
//! residual is `measurement − π(T_c_w · P)`, pose increments are
//! `[ω, υ]` applied by left multiplication `T ← exp(δ) · T`, and edges
//! with level ≠ 0 are ignored by subsequent optimization rounds.

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Matrix2, Matrix2x3, Matrix2x6, Matrix3, Vector2, Vector3};
use tracing::trace;

use crate::camera::Camera;
use crate::geometry::SE3;
use crate::map::{KeyFrameId, MapPointId};

/// Default Huber kernel delta for RGB-D reprojection edges.
pub const HUBER_DELTA: f64 = 2.7955321496988725; // sqrt(7.815)

/// Minimum camera-frame depth for a valid projection.
const MIN_PROJECTION_DEPTH: f64 = 1e-3;

/// Residual substitute for points that project behind the camera; large
/// enough that the edge is always swept as an outlier.
const INVALID_RESIDUAL: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoseVertexHandle(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointVertexHandle(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeHandle(usize);

struct PoseVertex {
    id: KeyFrameId,
    estimate: SE3,
    fixed: bool,
}

struct PointVertex {
    id: MapPointId,
    estimate: Vector3<f64>,
    /// Landmarks are eliminated via the Schur complement. The flag is
    /// recorded for parity with the graph API; all landmark blocks take
    /// the marginalized path.
    #[allow(dead_code)]
    marginalized: bool,
}

struct ProjectionEdge {
    pose: usize,
    point: usize,
    measurement: Vector2<f64>,
    information: Matrix2<f64>,
    robust_delta: Option<f64>,
    level: u32,
}

pub struct BundleAdjuster {
    camera: Arc<Camera>,
    pose_vertices: Vec<PoseVertex>,
    point_vertices: Vec<PointVertex>,
    edges: Vec<ProjectionEdge>,
}

impl BundleAdjuster {
    pub fn new(camera: Arc<Camera>) -> Self {
        Self {
            camera,
            pose_vertices: Vec::new(),
            point_vertices: Vec::new(),
            edges: Vec::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Graph construction
    // ─────────────────────────────────────────────────────────────────────

    pub fn add_pose_vertex(&mut self, id: KeyFrameId, estimate: SE3, fixed: bool) -> PoseVertexHandle {
        self.pose_vertices.push(PoseVertex {
            id,
            estimate,
            fixed,
        });
        PoseVertexHandle(self.pose_vertices.len() - 1)
    }

    pub fn add_mappoint_vertex(
        &mut self,
        id: MapPointId,
        estimate: Vector3<f64>,
        marginalized: bool,
    ) -> PointVertexHandle {
        self.point_vertices.push(PointVertex {
            id,
            estimate,
            marginalized,
        });
        PointVertexHandle(self.point_vertices.len() - 1)
    }

    /// Add a reprojection edge with identity information and a Huber
    /// kernel of delta [`HUBER_DELTA`].
    pub fn add_projection_edge(
        &mut self,
        pose: PoseVertexHandle,
        point: PointVertexHandle,
        measurement: Vector2<f64>,
    ) -> EdgeHandle {
        self.edges.push(ProjectionEdge {
            pose: pose.0,
            point: point.0,
            measurement,
            information: Matrix2::identity(),
            robust_delta: Some(HUBER_DELTA),
            level: 0,
        });
        EdgeHandle(self.edges.len() - 1)
    }

    pub fn pose_vertex_id(&self, handle: PoseVertexHandle) -> KeyFrameId {
        self.pose_vertices[handle.0].id
    }

    pub fn point_vertex_id(&self, handle: PointVertexHandle) -> MapPointId {
        self.point_vertices[handle.0].id
    }

    pub fn pose_estimate(&self, handle: PoseVertexHandle) -> SE3 {
        self.pose_vertices[handle.0].estimate.clone()
    }

    pub fn point_estimate(&self, handle: PointVertexHandle) -> Vector3<f64> {
        self.point_vertices[handle.0].estimate
    }

    /// Overwrite a landmark vertex estimate (used after triangulation).
    pub fn set_point_estimate(&mut self, handle: PointVertexHandle, estimate: Vector3<f64>) {
        self.point_vertices[handle.0].estimate = estimate;
    }

    pub fn num_pose_vertices(&self) -> usize {
        self.pose_vertices.len()
    }

    pub fn num_point_vertices(&self) -> usize {
        self.point_vertices.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Release all vertices and edges.
    pub fn clear(&mut self) {
        self.pose_vertices.clear();
        self.point_vertices.clear();
        self.edges.clear();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Edge queries
    // ─────────────────────────────────────────────────────────────────────

    /// Raw χ² of an edge under the current estimates (no robust
    /// reweighting).
    pub fn chi2(&self, handle: EdgeHandle) -> f64 {
        let edge = &self.edges[handle.0];
        let residual = self.residual(edge);
        (residual.transpose() * edge.information * residual)[0]
    }

    /// Edges with level ≠ 0 are excluded from subsequent optimization.
    pub fn set_level(&mut self, handle: EdgeHandle, level: u32) {
        self.edges[handle.0].level = level;
    }

    pub fn is_active(&self, handle: EdgeHandle) -> bool {
        self.edges[handle.0].level == 0
    }

    pub fn clear_robust_kernel(&mut self, handle: EdgeHandle) {
        self.edges[handle.0].robust_delta = None;
    }

    fn residual(&self, edge: &ProjectionEdge) -> Vector2<f64> {
        let pose = &self.pose_vertices[edge.pose].estimate;
        let point = &self.point_vertices[edge.point].estimate;
        let p_cam = pose.transform_point(point);
        if p_cam.z <= MIN_PROJECTION_DEPTH {
            return Vector2::new(INVALID_RESIDUAL, INVALID_RESIDUAL);
        }
        edge.measurement - self.camera.camera_to_pixel(&p_cam)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Optimization
    // ─────────────────────────────────────────────────────────────────────

    /// Run Levenberg-Marquardt for at most `iterations` outer steps over
    /// all level-0 edges.
    pub fn optimize(&mut self, iterations: usize) {
        let active: Vec<usize> = self
            .edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.level == 0)
            .map(|(i, _)| i)
            .collect();
        if active.is_empty() {
            return;
        }

        // Parameter layout: 6 dof per free pose, 3 dof per landmark that
        // participates in an active edge.
        let free_poses: Vec<usize> = self
            .pose_vertices
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.fixed)
            .map(|(i, _)| i)
            .collect();
        let pose_param: HashMap<usize, usize> = free_poses
            .iter()
            .enumerate()
            .map(|(param, &vertex)| (vertex, param))
            .collect();

        let mut used_points: Vec<usize> = active.iter().map(|&i| self.edges[i].point).collect();
        used_points.sort_unstable();
        used_points.dedup();
        let point_param: HashMap<usize, usize> = used_points
            .iter()
            .enumerate()
            .map(|(param, &vertex)| (vertex, param))
            .collect();

        let np = free_poses.len() * 6;
        let nl = used_points.len() * 3;
        if np == 0 && nl == 0 {
            return;
        }

        let mut lambda = 1e-4;
        let mut current_cost = self.total_cost(&active);

        for iteration in 0..iterations {
            let (h_pp, h_ll, h_pl, b_p, b_l) =
                self.build_normal_equations(&active, &pose_param, &point_param, np, nl);

            let Some((delta_p, delta_l)) = solve_schur(&h_pp, &h_ll, &h_pl, &b_p, &b_l, lambda)
            else {
                lambda *= 10.0;
                continue;
            };

            // Apply the candidate step.
            let pose_backup: Vec<SE3> = free_poses
                .iter()
                .map(|&i| self.pose_vertices[i].estimate.clone())
                .collect();
            let point_backup: Vec<Vector3<f64>> = used_points
                .iter()
                .map(|&i| self.point_vertices[i].estimate)
                .collect();

            for (param, &vertex) in free_poses.iter().enumerate() {
                let omega = Vector3::new(
                    delta_p[param * 6],
                    delta_p[param * 6 + 1],
                    delta_p[param * 6 + 2],
                );
                let upsilon = Vector3::new(
                    delta_p[param * 6 + 3],
                    delta_p[param * 6 + 4],
                    delta_p[param * 6 + 5],
                );
                let current = &self.pose_vertices[vertex].estimate;
                self.pose_vertices[vertex].estimate =
                    SE3::from_axis_angle(omega, upsilon).compose(current);
            }
            for (param, &vertex) in used_points.iter().enumerate() {
                self.point_vertices[vertex].estimate += Vector3::new(
                    delta_l[param * 3],
                    delta_l[param * 3 + 1],
                    delta_l[param * 3 + 2],
                );
            }

            let new_cost = self.total_cost(&active);
            if new_cost.is_finite() && new_cost <= current_cost {
                trace!(iteration, cost = new_cost, lambda, "step accepted");
                let converged = (current_cost - new_cost) <= 1e-12 * current_cost.max(1.0);
                current_cost = new_cost;
                lambda = (lambda * 0.5).max(1e-12);
                if converged {
                    break;
                }
            } else {
                trace!(iteration, cost = new_cost, lambda, "step rejected");
                for (param, &vertex) in free_poses.iter().enumerate() {
                    self.pose_vertices[vertex].estimate = pose_backup[param].clone();
                }
                for (param, &vertex) in used_points.iter().enumerate() {
                    self.point_vertices[vertex].estimate = point_backup[param];
                }
                lambda *= 10.0;
            }
        }
    }

    /// Total robustified cost over the given edges.
    fn total_cost(&self, active: &[usize]) -> f64 {
        active
            .iter()
            .map(|&i| {
                let edge = &self.edges[i];
                let residual = self.residual(edge);
                let chi2 = (residual.transpose() * edge.information * residual)[0];
                match edge.robust_delta {
                    Some(delta) if chi2 > delta * delta => 2.0 * delta * chi2.sqrt() - delta * delta,
                    _ => chi2,
                }
            })
            .sum()
    }

    /// Assemble the damped normal equations `H δ = b` with `b = −Jᵀ W e`,
    /// split into pose/landmark blocks for Schur elimination.
    #[allow(clippy::type_complexity)]
    fn build_normal_equations(
        &self,
        active: &[usize],
        pose_param: &HashMap<usize, usize>,
        point_param: &HashMap<usize, usize>,
        np: usize,
        nl: usize,
    ) -> (DMatrix<f64>, DMatrix<f64>, DMatrix<f64>, DVector<f64>, DVector<f64>) {
        let mut h_pp = DMatrix::zeros(np, np);
        let mut h_ll = DMatrix::zeros(nl, nl);
        let mut h_pl = DMatrix::zeros(np, nl);
        let mut b_p = DVector::zeros(np);
        let mut b_l = DVector::zeros(nl);

        for &edge_index in active {
            let edge = &self.edges[edge_index];
            let residual = self.residual(edge);
            let chi2 = (residual.transpose() * edge.information * residual)[0];

            // Huber reweighting (iteratively reweighted least squares).
            let robust_weight = match edge.robust_delta {
                Some(delta) if chi2 > delta * delta => delta / chi2.sqrt(),
                _ => 1.0,
            };
            let information = edge.information * robust_weight;

            let (j_pose, j_point) = self.jacobians(edge);

            let lp = point_param[&edge.point];
            let h_ll_block = j_point.transpose() * information * j_point;
            let b_l_block = -(j_point.transpose() * information * residual);
            for r in 0..3 {
                for c in 0..3 {
                    h_ll[(lp * 3 + r, lp * 3 + c)] += h_ll_block[(r, c)];
                }
                b_l[lp * 3 + r] += b_l_block[r];
            }

            if let Some(&pp) = pose_param.get(&edge.pose) {
                let h_pp_block = j_pose.transpose() * information * j_pose;
                let b_p_block = -(j_pose.transpose() * information * residual);
                for r in 0..6 {
                    for c in 0..6 {
                        h_pp[(pp * 6 + r, pp * 6 + c)] += h_pp_block[(r, c)];
                    }
                    b_p[pp * 6 + r] += b_p_block[r];
                }

                let h_pl_block = j_pose.transpose() * information * j_point;
                for r in 0..6 {
                    for c in 0..3 {
                        h_pl[(pp * 6 + r, lp * 3 + c)] += h_pl_block[(r, c)];
                    }
                }
            }
        }

        (h_pp, h_ll, h_pl, b_p, b_l)
    }

    /// Analytical Jacobians of the residual w.r.t. the pose increment
    /// `[ω, υ]` (left multiplication on T_c_w) and the landmark position.
    fn jacobians(&self, edge: &ProjectionEdge) -> (Matrix2x6<f64>, Matrix2x3<f64>) {
        let pose = &self.pose_vertices[edge.pose].estimate;
        let point = &self.point_vertices[edge.point].estimate;
        let p_cam = pose.transform_point(point);

        let x = p_cam.x;
        let y = p_cam.y;
        let z = p_cam.z;
        if z <= MIN_PROJECTION_DEPTH {
            return (Matrix2x6::zeros(), Matrix2x3::zeros());
        }
        let invz = 1.0 / z;
        let invz2 = invz * invz;

        let fx = self.camera.fx;
        let fy = self.camera.fy;

        #[rustfmt::skip]
        let j_pose = Matrix2x6::new(
            x * y * invz2 * fx, -(1.0 + x * x * invz2) * fx,  y * invz * fx, -invz * fx,  0.0,        x * invz2 * fx,
            (1.0 + y * y * invz2) * fy, -x * y * invz2 * fy, -x * invz * fy,  0.0,       -invz * fy,  y * invz2 * fy,
        );

        // d(residual)/dP = −(1/z) · [[fx, 0, −fx·x/z], [0, fy, −fy·y/z]] · R_c_w
        let r_cw = pose.rotation.to_rotation_matrix().into_inner();
        let tmp = Matrix2x3::new(fx, 0.0, -fx * x * invz, 0.0, fy, -fy * y * invz);
        let j_point = -invz * tmp * r_cw;

        (j_pose, j_point)
    }
}

/// Solve the damped system via the Schur complement on the landmark
/// blocks: `δp = S⁻¹ (b_p − H_pl H_ll⁻¹ b_l)` with
/// `S = H_pp − H_pl H_ll⁻¹ H_plᵀ`, then back-substitute the landmarks.
fn solve_schur(
    h_pp: &DMatrix<f64>,
    h_ll: &DMatrix<f64>,
    h_pl: &DMatrix<f64>,
    b_p: &DVector<f64>,
    b_l: &DVector<f64>,
    lambda: f64,
) -> Option<(DVector<f64>, DVector<f64>)> {
    let np = h_pp.nrows();
    let nl = h_ll.nrows();
    let num_points = nl / 3;

    // H_ll is block diagonal: invert the damped 3x3 blocks directly.
    let mut h_ll_inv = DMatrix::zeros(nl, nl);
    for i in 0..num_points {
        let mut block: Matrix3<f64> = h_ll.fixed_view::<3, 3>(i * 3, i * 3).into_owned();
        for d in 0..3 {
            block[(d, d)] += lambda;
        }
        let inv = block.try_inverse()?;
        h_ll_inv.view_mut((i * 3, i * 3), (3, 3)).copy_from(&inv);
    }

    if np == 0 {
        let delta_l = &h_ll_inv * b_l;
        return Some((DVector::zeros(0), delta_l));
    }

    let mut h_pp_damped = h_pp.clone();
    for d in 0..np {
        h_pp_damped[(d, d)] += lambda;
    }

    let h_pl_h_ll_inv = h_pl * &h_ll_inv;
    let schur = h_pp_damped - &h_pl_h_ll_inv * h_pl.transpose();
    let rhs = b_p - &h_pl_h_ll_inv * b_l;

    let delta_p = match schur.clone().cholesky() {
        Some(factorization) => factorization.solve(&rhs),
        None => schur.lu().solve(&rhs)?,
    };

    let delta_l = &h_ll_inv * (b_l - h_pl.transpose() * &delta_p);
    Some((delta_p, delta_l))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraConfig;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn test_camera() -> Arc<Camera> {
        Arc::new(Camera::new(CameraConfig {
            fx: 520.0,
            fy: 520.0,
            cx: 320.0,
            cy: 240.0,
            depth_scale: 1000.0,
        }))
    }

    /// Deterministic grid of landmarks in front of the origin camera.
    fn landmark_grid(count: usize) -> Vec<Vector3<f64>> {
        (0..count)
            .map(|i| {
                let row = (i / 10) as f64;
                let col = (i % 10) as f64;
                Vector3::new(
                    -0.9 + 0.2 * col,
                    -0.9 + 0.2 * row,
                    4.0 + 0.1 * ((i % 7) as f64),
                )
            })
            .collect()
    }

    fn project(camera: &Camera, pose: &SE3, p: &Vector3<f64>) -> Vector2<f64> {
        camera.world_to_pixel(p, pose)
    }

    #[test]
    fn test_two_view_ba_converges_to_ground_truth() {
        let camera = test_camera();
        let points = landmark_grid(100);
        let pose0 = SE3::identity();
        let pose1_gt = SE3::new(
            nalgebra::UnitQuaternion::identity(),
            Vector3::new(-0.3, 0.0, 0.0),
        );

        let mut rng = StdRng::seed_from_u64(7);
        let perturbed_pose = SE3::from_axis_angle(
            Vector3::new(0.01, -0.02, 0.015),
            Vector3::new(0.05, -0.04, 0.03),
        )
        .compose(&pose1_gt);

        let mut ba = BundleAdjuster::new(Arc::clone(&camera));
        let v0 = ba.add_pose_vertex(KeyFrameId(1000), pose0.clone(), true);
        let v1 = ba.add_pose_vertex(KeyFrameId(1001), perturbed_pose, false);

        let mut point_handles = Vec::new();
        for (i, p) in points.iter().enumerate() {
            let jitter = Vector3::new(
                rng.gen_range(-0.02..0.02),
                rng.gen_range(-0.02..0.02),
                rng.gen_range(-0.02..0.02),
            );
            let h = ba.add_mappoint_vertex(MapPointId(i as u64), p + jitter, true);
            ba.add_projection_edge(v0, h, project(&camera, &pose0, p));
            ba.add_projection_edge(v1, h, project(&camera, &pose1_gt, p));
            point_handles.push(h);
        }

        ba.optimize(10);

        let estimate = ba.pose_estimate(v1);
        let pose_error = estimate.compose(&pose1_gt.inverse());
        assert!(pose_error.translation.norm() < 1e-3);
        assert!(pose_error.rotation_angle() < 1e-3);
        for (h, p) in point_handles.iter().zip(&points) {
            assert!((ba.point_estimate(*h) - p).norm() < 1e-3);
        }
    }

    #[test]
    fn test_fixed_pose_vertex_is_not_moved() {
        let camera = test_camera();
        let points = landmark_grid(30);
        let pose = SE3::identity();

        let mut ba = BundleAdjuster::new(Arc::clone(&camera));
        let v = ba.add_pose_vertex(KeyFrameId(2000), pose.clone(), true);
        for (i, p) in points.iter().enumerate() {
            let h = ba.add_mappoint_vertex(MapPointId(1000 + i as u64), *p, true);
            // Shifted measurements would pull a free pose away.
            ba.add_projection_edge(v, h, project(&camera, &pose, p) + Vector2::new(3.0, 0.0));
        }

        ba.optimize(5);

        let estimate = ba.pose_estimate(v);
        assert_relative_eq!(estimate.translation, pose.translation, epsilon = 1e-12);
        assert_relative_eq!(estimate.rotation_angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_chi2_reports_squared_pixel_error() {
        let camera = test_camera();
        let pose = SE3::identity();
        let p = Vector3::new(0.2, -0.1, 5.0);

        let mut ba = BundleAdjuster::new(Arc::clone(&camera));
        let v = ba.add_pose_vertex(KeyFrameId(3000), pose.clone(), true);
        let h = ba.add_mappoint_vertex(MapPointId(3000), p, true);
        let edge = ba.add_projection_edge(v, h, project(&camera, &pose, &p) + Vector2::new(3.0, 4.0));

        assert_relative_eq!(ba.chi2(edge), 25.0, epsilon = 1e-9);
    }

    #[test]
    fn test_excluded_edge_does_not_affect_optimization() {
        let camera = test_camera();
        let points = landmark_grid(40);
        let pose0 = SE3::identity();

        let mut ba = BundleAdjuster::new(Arc::clone(&camera));
        let v0 = ba.add_pose_vertex(KeyFrameId(4000), pose0.clone(), true);
        let v1 = ba.add_pose_vertex(
            KeyFrameId(4001),
            SE3::from_axis_angle(Vector3::zeros(), Vector3::new(0.02, 0.0, 0.0)),
            false,
        );

        let mut bad_edge = None;
        for (i, p) in points.iter().enumerate() {
            let h = ba.add_mappoint_vertex(MapPointId(4000 + i as u64), *p, true);
            ba.add_projection_edge(v0, h, project(&camera, &pose0, p));
            let mut measurement = project(&camera, &pose0, p);
            if i == 0 {
                measurement += Vector2::new(50.0, 0.0);
                bad_edge = Some(ba.add_projection_edge(v1, h, measurement));
            } else {
                ba.add_projection_edge(v1, h, measurement);
            }
        }

        let bad_edge = bad_edge.unwrap();
        ba.set_level(bad_edge, 1);
        assert!(!ba.is_active(bad_edge));
        ba.optimize(10);

        let estimate = ba.pose_estimate(v1);
        assert!(estimate.translation.norm() < 1e-4);
        assert!(estimate.rotation_angle() < 1e-4);
    }

    #[test]
    fn test_point_only_optimization_with_all_poses_fixed() {
        let camera = test_camera();
        let p_gt = Vector3::new(0.3, 0.2, 4.0);
        let pose0 = SE3::identity();
        let pose1 = SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(-0.4, 0.0, 0.0));

        let mut ba = BundleAdjuster::new(Arc::clone(&camera));
        let v0 = ba.add_pose_vertex(KeyFrameId(5000), pose0.clone(), true);
        let v1 = ba.add_pose_vertex(KeyFrameId(5001), pose1.clone(), true);
        let h = ba.add_mappoint_vertex(MapPointId(5000), p_gt + Vector3::new(0.05, -0.05, 0.1), true);
        ba.add_projection_edge(v0, h, project(&camera, &pose0, &p_gt));
        ba.add_projection_edge(v1, h, project(&camera, &pose1, &p_gt));

        ba.optimize(10);
        assert!((ba.point_estimate(h) - p_gt).norm() < 1e-6);
    }

    #[test]
    fn test_clear_releases_graph() {
        let camera = test_camera();
        let mut ba = BundleAdjuster::new(camera);
        let v = ba.add_pose_vertex(KeyFrameId(6000), SE3::identity(), true);
        let h = ba.add_mappoint_vertex(MapPointId(6000), Vector3::new(0.0, 0.0, 2.0), true);
        ba.add_projection_edge(v, h, Vector2::new(320.0, 240.0));

        ba.clear();
        assert_eq!(ba.num_pose_vertices(), 0);
        assert_eq!(ba.num_point_vertices(), 0);
        assert_eq!(ba.num_edges(), 0);
    }
}
