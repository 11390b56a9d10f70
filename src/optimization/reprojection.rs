//! Reprojection residual shared by the mono and stereo calibration problems.

use crate::camera::distort_point;
use crate::geometry::rotate_point;
use nalgebra::{DVector, Vector2, Vector3};
use tiny_solver::factors::Factor;

/// Lens parameters held constant during optimization.
#[derive(Debug, Clone)]
pub struct FixedLens {
    /// `[fx, fy, cx, cy]`
    pub intrinsics: [f64; 4],
    pub distortion: Vec<f64>,
}

/// Residual of one board view in one camera.
///
/// Parameter blocks, in order:
/// 1. `intrinsics` `[fx, fy, cx, cy]` and `distortion`, unless the lens is fixed,
/// 2. the board pose `[rx, ry, rz, tx, ty, tz]`,
/// 3. for the right camera, the right-from-left transform in the same layout.
#[derive(Debug, Clone)]
pub struct ReprojectionFactor {
    object_points: Vec<Vector3<f64>>,
    observations: Vec<Vector2<f64>>,
    is_fisheye: bool,
    through_extrinsic: bool,
    fixed_lens: Option<FixedLens>,
}

impl ReprojectionFactor {
    pub fn new(
        object_points: &[Vector3<f64>],
        observations: &[Vector2<f64>],
        is_fisheye: bool,
    ) -> Self {
        ReprojectionFactor {
            object_points: object_points.to_vec(),
            observations: observations.to_vec(),
            is_fisheye,
            through_extrinsic: false,
            fixed_lens: None,
        }
    }

    /// Chains the right-from-left transform after the board pose.
    pub fn through_extrinsic(mut self) -> Self {
        self.through_extrinsic = true;
        self
    }

    pub fn with_fixed_lens(mut self, lens: FixedLens) -> Self {
        self.fixed_lens = Some(lens);
        self
    }

    pub fn residual_dim(&self) -> usize {
        self.observations.len() * 2
    }
}

fn constant<T: nalgebra::RealField>(values: &[f64]) -> Vec<T> {
    values.iter().map(|v| nalgebra::convert(*v)).collect()
}

fn transform<T: nalgebra::RealField>(params: &[T], point: [T; 3]) -> [T; 3] {
    let [x, y, z] = rotate_point(&params[0..3], point);
    [
        x + params[3].clone(),
        y + params[4].clone(),
        z + params[5].clone(),
    ]
}

impl<T: nalgebra::RealField> Factor<T> for ReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let (intrinsics, distortion, rest) = match &self.fixed_lens {
            Some(lens) => (
                constant::<T>(&lens.intrinsics),
                constant::<T>(&lens.distortion),
                params,
            ),
            None => (
                params[0].as_slice().to_vec(),
                params[1].as_slice().to_vec(),
                &params[2..],
            ),
        };
        let pose = rest[0].as_slice();
        let extrinsic = if self.through_extrinsic {
            Some(rest[1].as_slice())
        } else {
            None
        };

        let fx = intrinsics[0].clone();
        let fy = intrinsics[1].clone();
        let cx = intrinsics[2].clone();
        let cy = intrinsics[3].clone();

        let mut residuals = DVector::zeros(self.observations.len() * 2);

        for (i, (p3d, p2d)) in self.object_points.iter().zip(&self.observations).enumerate() {
            let board_point: [T; 3] = [
                nalgebra::convert(p3d.x),
                nalgebra::convert(p3d.y),
                nalgebra::convert(p3d.z),
            ];
            let mut camera_point = transform(pose, board_point);
            if let Some(extrinsic) = extrinsic {
                camera_point = transform(extrinsic, camera_point);
            }

            let (xd, yd) = distort_point(self.is_fisheye, camera_point, &distortion);
            let gt_u: T = nalgebra::convert(p2d.x);
            let gt_v: T = nalgebra::convert(p2d.y);

            residuals[i * 2] = fx.clone() * xd + cx.clone() - gt_u;
            residuals[i * 2 + 1] = fy.clone() * yd + cy.clone() - gt_v;
        }
        residuals
    }
}
