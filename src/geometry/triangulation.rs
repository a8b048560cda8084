//! Multi-view linear triangulation (DLT).

use nalgebra::{DMatrix, Matrix3x4, Vector3};

use super::SE3;

/// Build the 3x4 projection matrix [R | t] for a world-to-camera pose.
fn projection_matrix(pose_cw: &SE3) -> Matrix3x4<f64> {
    let r = pose_cw.rotation.to_rotation_matrix();
    let t = &pose_cw.translation;

    let mut p = Matrix3x4::zeros();
    p.fixed_view_mut::<3, 3>(0, 0).copy_from(r.matrix());
    p.fixed_view_mut::<3, 1>(0, 3).copy_from(t);
    p
}

/// Triangulate a world point from two or more observations.
///
/// `poses` are world-to-camera transforms, `normalized` the matching
/// back-projected observation directions on the normalized image plane
/// (z = 1). Each observation contributes the two DLT rows
/// `x·P[2] − P[0]` and `y·P[2] − P[1]`; the stacked system is solved by
/// SVD. Returns `None` when fewer than two views are given or the
/// solution is degenerate.
pub fn triangulate(poses: &[SE3], normalized: &[Vector3<f64>]) -> Option<Vector3<f64>> {
    if poses.len() < 2 || poses.len() != normalized.len() {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros(2 * poses.len(), 4);
    for (i, (pose, xn)) in poses.iter().zip(normalized).enumerate() {
        let p = projection_matrix(pose);
        for j in 0..4 {
            a[(2 * i, j)] = xn.x * p[(2, j)] - p[(0, j)];
            a[(2 * i + 1, j)] = xn.y * p[(2, j)] - p[(1, j)];
        }
    }

    let svd = a.svd(false, true);

    // Solution is the right singular vector of the smallest singular value;
    // reject rank-deficient systems (no baseline) and solutions that are
    // not well separated from the next singular value.
    let s = &svd.singular_values;
    if s[2] < 1e-10 * s[0].max(1.0) || s[3] > 1e-2 * s[2] {
        return None;
    }

    let v_t = svd.v_t.as_ref()?;

    let h = v_t.row(3);
    if h[3].abs() < 1e-10 {
        return None;
    }

    Some(Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}
