//! Multi-view geometry used by calibration: rotations, plane homographies,
//! closed-form intrinsics and planar poses.

use crate::camera::{CameraModelError, Intrinsics};
use nalgebra::{DMatrix, Matrix3, RealField, Rotation3, SVector, Vector2, Vector3};

/// Rigid transform from board coordinates to camera coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl BoardPose {
    /// `[rx, ry, rz, tx, ty, tz]` with the rotation as an axis-angle vector.
    pub fn to_params(&self) -> [f64; 6] {
        let r = rotation_to_vector(&self.rotation);
        let t = self.translation;
        [r.x, r.y, r.z, t.x, t.y, t.z]
    }

    pub fn from_params(params: &[f64]) -> Self {
        BoardPose {
            rotation: rodrigues(&Vector3::new(params[0], params[1], params[2])),
            translation: Vector3::new(params[3], params[4], params[5]),
        }
    }

    pub fn transform(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }
}

/// Rotation matrix of an axis-angle vector.
pub fn rodrigues(rvec: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::new(*rvec).into_inner()
}

/// Axis-angle vector of a rotation matrix.
pub fn rotation_to_vector(rotation: &Matrix3<f64>) -> Vector3<f64> {
    Rotation3::from_matrix(rotation).scaled_axis()
}

/// Rotates `point` by the axis-angle vector `rvec`.
pub(crate) fn rotate_point<T: RealField>(rvec: &[T], point: [T; 3]) -> [T; 3] {
    let [px, py, pz] = point;
    let rx = rvec[0].clone();
    let ry = rvec[1].clone();
    let rz = rvec[2].clone();
    let theta2 = rx.clone() * rx.clone() + ry.clone() * ry.clone() + rz.clone() * rz.clone();

    // r x p
    let cx = ry.clone() * pz.clone() - rz.clone() * py.clone();
    let cy = rz.clone() * px.clone() - rx.clone() * pz.clone();
    let cz = rx.clone() * py.clone() - ry.clone() * px.clone();

    let epsilon: T = nalgebra::convert(1e-14);
    if theta2 < epsilon {
        return [px + cx, py + cy, pz + cz];
    }

    let theta = theta2.sqrt();
    let (sin, cos) = theta.clone().sin_cos();
    let a = sin / theta.clone();
    let b = (T::one() - cos.clone()) / (theta.clone() * theta);
    let dot = rx.clone() * px.clone() + ry.clone() * py.clone() + rz.clone() * pz.clone();

    [
        px * cos.clone() + cx * a.clone() + rx * dot.clone() * b.clone(),
        py * cos.clone() + cy * a.clone() + ry * dot.clone() * b.clone(),
        pz * cos + cz * a + rz * dot * b,
    ]
}

/// Similarity that moves the centroid to the origin and the mean distance to `sqrt(2)`.
fn normalization_transform(points: &[Vector2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_dist = points.iter().map(|p| (p - mean).norm()).sum::<f64>() / n;
    let s = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(
        s,
        0.0,
        -s * mean.x, //
        0.0,
        s,
        -s * mean.y, //
        0.0,
        0.0,
        1.0,
    )
}

/// Estimates `H` with `dst ~ H src` using the normalized DLT.
///
/// # Errors
///
/// * [`CameraModelError::InvalidParams`] with fewer than 4 correspondences.
/// * [`CameraModelError::NumericalError`] if the system is degenerate.
pub fn find_homography(
    src: &[Vector2<f64>],
    dst: &[Vector2<f64>],
) -> Result<Matrix3<f64>, CameraModelError> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return Err(CameraModelError::InvalidParams(format!(
            "homography needs at least 4 matched points, got {} and {}",
            n,
            dst.len()
        )));
    }

    let t_src = normalization_transform(src);
    let t_dst = normalization_transform(dst);

    // Zero rows keep the SVD full when only four points are given.
    let mut a = DMatrix::<f64>::zeros((2 * n).max(9), 9);
    for (i, (ps, pd)) in src.iter().zip(dst.iter()).enumerate() {
        let s = t_src * ps.push(1.0);
        let d = t_dst * pd.push(1.0);
        let (x, y) = (s.x, s.y);
        let (u, v) = (d.x, d.y);

        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| CameraModelError::NumericalError("homography SVD failed".to_string()))?;
    let h = v_t.row(v_t.nrows() - 1);
    let h_norm = Matrix3::from_fn(|r, c| h[3 * r + c]);

    let t_dst_inv = t_dst.try_inverse().ok_or_else(|| {
        CameraModelError::NumericalError("degenerate point normalization".to_string())
    })?;
    let mut h_mat = t_dst_inv * h_norm * t_src;

    let scale = h_mat[(2, 2)];
    if scale.abs() > f64::EPSILON {
        h_mat /= scale;
    }
    Ok(h_mat)
}

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> SVector<f64, 6> {
    let hi = h.column(i);
    let hj = h.column(j);
    SVector::<f64, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

/// Closed-form pinhole intrinsics from three or more plane homographies.
///
/// # Errors
///
/// [`CameraModelError::NumericalError`] when the views do not constrain the
/// image of the absolute conic, e.g. all boards parallel to the image plane.
pub fn estimate_intrinsics(homographies: &[Matrix3<f64>]) -> Result<Intrinsics, CameraModelError> {
    let m = homographies.len();
    if m < 3 {
        return Err(CameraModelError::InvalidParams(format!(
            "need at least 3 homographies for intrinsics estimation, got {m}"
        )));
    }

    let mut vmtx = DMatrix::<f64>::zeros(2 * m, 6);
    for (k, h) in homographies.iter().enumerate() {
        let v11 = v_ij(h, 0, 0);
        let v22 = v_ij(h, 1, 1);
        let v12 = v_ij(h, 0, 1);
        vmtx.row_mut(2 * k).copy_from(&v12.transpose());
        vmtx.row_mut(2 * k + 1).copy_from(&(v11 - v22).transpose());
    }

    let svd = vmtx.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| CameraModelError::NumericalError("intrinsics SVD failed".to_string()))?;
    let b = v_t.row(v_t.nrows() - 1);
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() <= 1e-12 * (b11 * b11 + b22 * b22) {
        return Err(CameraModelError::NumericalError(
            "degenerate configuration in intrinsics estimation".to_string(),
        ));
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    let alpha2 = lambda / b11;
    let beta2 = lambda * b11 / denom;
    if !(alpha2 > 0.0 && beta2 > 0.0) {
        return Err(CameraModelError::NumericalError(
            "homographies yield a non positive definite conic".to_string(),
        ));
    }

    let alpha = alpha2.sqrt();
    let beta = beta2.sqrt();
    let gamma = -b12 * alpha2 * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha2 / lambda;

    Ok(Intrinsics {
        fx: alpha,
        fy: beta,
        cx: u0,
        cy: v0,
    })
}

/// Pose of a `Z = 0` board from its homography and the camera matrix.
pub fn pose_from_homography(
    k: &Matrix3<f64>,
    h: &Matrix3<f64>,
) -> Result<BoardPose, CameraModelError> {
    let k_inv = k
        .try_inverse()
        .ok_or_else(|| CameraModelError::NumericalError("K is not invertible".to_string()))?;

    let k_inv_h1 = k_inv * h.column(0);
    let k_inv_h2 = k_inv * h.column(1);
    let k_inv_h3 = k_inv * h.column(2);

    let mut lambda = 2.0 / (k_inv_h1.norm() + k_inv_h2.norm());
    // The board lies in front of the camera.
    if k_inv_h3.z < 0.0 {
        lambda = -lambda;
    }

    let r1 = k_inv_h1 * lambda;
    let r2 = k_inv_h2 * lambda;
    let r3 = r1.cross(&r2);
    let r_mat = Matrix3::from_columns(&[r1, r2, r3]);

    Ok(BoardPose {
        rotation: nearest_rotation(&r_mat)?,
        translation: k_inv_h3 * lambda,
    })
}

/// Projects a 3x3 matrix onto SO(3).
pub fn nearest_rotation(m: &Matrix3<f64>) -> Result<Matrix3<f64>, CameraModelError> {
    let svd = m.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(CameraModelError::NumericalError(
                "rotation SVD failed".to_string(),
            ))
        }
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r = u_flipped * v_t;
    }
    Ok(r)
}

/// Averages the right-from-left transform over views seen by both cameras.
///
/// For each view `R_i = R_right R_left^T`; the sum is projected back onto
/// SO(3) and the translation is the mean of `t_right - R t_left`.
pub fn average_relative_pose(
    left: &[BoardPose],
    right: &[BoardPose],
) -> Result<(Matrix3<f64>, Vector3<f64>), CameraModelError> {
    if left.is_empty() || left.len() != right.len() {
        return Err(CameraModelError::InvalidParams(
            "relative pose needs the same non-zero number of left and right poses".to_string(),
        ));
    }
    let sum = left
        .iter()
        .zip(right)
        .fold(Matrix3::zeros(), |acc, (l, r)| {
            acc + r.rotation * l.rotation.transpose()
        });
    let rotation = nearest_rotation(&sum)?;
    let translation = left
        .iter()
        .zip(right)
        .fold(Vector3::zeros(), |acc, (l, r)| {
            acc + r.translation - rotation * l.translation
        })
        / left.len() as f64;
    Ok((rotation, translation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn k() -> Matrix3<f64> {
        Matrix3::new(820.0, 0.0, 330.0, 0.0, 810.0, 235.0, 0.0, 0.0, 1.0)
    }

    fn synthetic_poses() -> Vec<BoardPose> {
        [
            ([0.2, -0.1, 0.05], [-100.0, -80.0, 600.0]),
            ([-0.25, 0.15, -0.1], [-120.0, -60.0, 650.0]),
            ([0.1, 0.3, 0.2], [-90.0, -100.0, 700.0]),
            ([-0.3, -0.25, 0.0], [-110.0, -70.0, 550.0]),
        ]
        .iter()
        .map(|(r, t)| BoardPose {
            rotation: rodrigues(&Vector3::from(*r)),
            translation: Vector3::from(*t),
        })
        .collect()
    }

    fn board() -> Vec<Vector2<f64>> {
        let mut points = Vec::new();
        for r in 0..6 {
            for c in 0..9 {
                points.push(Vector2::new(c as f64 * 25.0, r as f64 * 25.0));
            }
        }
        points
    }

    fn project(k: &Matrix3<f64>, pose: &BoardPose, board: &[Vector2<f64>]) -> Vec<Vector2<f64>> {
        board
            .iter()
            .map(|p| {
                let pc = pose.transform(&Vector3::new(p.x, p.y, 0.0));
                let h = k * pc;
                Vector2::new(h.x / h.z, h.y / h.z)
            })
            .collect()
    }

    #[test]
    fn test_rodrigues_round_trip() {
        let rvec = Vector3::new(0.3, -0.2, 0.1);
        let r = rodrigues(&rvec);
        assert_relative_eq!(r.transpose() * r, Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(rotation_to_vector(&r), rvec, epsilon = 1e-12);
    }

    #[test]
    fn test_rotate_point_matches_matrix() {
        let p = Vector3::new(1.0, -2.0, 3.0);
        for rvec in [Vector3::new(0.3, -0.2, 0.1), Vector3::new(1e-9, 0.0, -1e-9)] {
            let expected = rodrigues(&rvec) * p;
            let [x, y, z] = rotate_point(rvec.as_slice(), [p.x, p.y, p.z]);
            assert_relative_eq!(Vector3::new(x, y, z), expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_homography_maps_points() {
        let board = board();
        let pose = &synthetic_poses()[0];
        let image = project(&k(), pose, &board);
        let h = find_homography(&board, &image).unwrap();
        for (b, i) in board.iter().zip(&image) {
            let m = h * b.push(1.0);
            assert_relative_eq!(Vector2::new(m.x / m.z, m.y / m.z), *i, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_homography_needs_four_points() {
        let p = vec![Vector2::new(0.0, 0.0); 3];
        assert!(matches!(
            find_homography(&p, &p),
            Err(CameraModelError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_zhang_and_planar_pose() {
        let board = board();
        let poses = synthetic_poses();
        let homographies: Vec<_> = poses
            .iter()
            .map(|pose| find_homography(&board, &project(&k(), pose, &board)).unwrap())
            .collect();

        let intrinsics = estimate_intrinsics(&homographies).unwrap();
        assert_relative_eq!(intrinsics.fx, 820.0, max_relative = 1e-6);
        assert_relative_eq!(intrinsics.fy, 810.0, max_relative = 1e-6);
        assert_relative_eq!(intrinsics.cx, 330.0, epsilon = 1e-3);
        assert_relative_eq!(intrinsics.cy, 235.0, epsilon = 1e-3);

        for (pose, h) in poses.iter().zip(&homographies) {
            let estimated = pose_from_homography(&k(), h).unwrap();
            assert_relative_eq!(estimated.rotation, pose.rotation, epsilon = 1e-6);
            assert_relative_eq!(estimated.translation, pose.translation, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_average_relative_pose() {
        let rel_r = rodrigues(&Vector3::new(0.01, -0.02, 0.005));
        let rel_t = Vector3::new(-60.0, 0.5, 1.0);
        let left = synthetic_poses();
        let right: Vec<_> = left
            .iter()
            .map(|l| BoardPose {
                rotation: rel_r * l.rotation,
                translation: rel_r * l.translation + rel_t,
            })
            .collect();
        let (r, t) = average_relative_pose(&left, &right).unwrap();
        assert_relative_eq!(r, rel_r, epsilon = 1e-10);
        assert_relative_eq!(t, rel_t, epsilon = 1e-8);
    }
}
