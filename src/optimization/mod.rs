//! The `optimization` module refines camera parameters from checkerboard
//! observations.
//!
//! This module defines the [`Optimizer`] trait, which outlines the common
//! interface of the calibration problems. Two problems are provided:
//!
//! * [`MonoCalibrationCost`]: intrinsics, distortion and one board pose per
//!   image for a single camera.
//! * [`StereoCalibrationCost`]: board poses relative to the left camera, the
//!   right-from-left transform and, unless held fixed, both lenses.
//!
//! Each problem follows the same two steps:
//! 1. A linear estimation step for a rough initial guess.
//! 2. A non-linear Levenberg-Marquardt refinement with `tiny_solver`.

use crate::camera::{CameraModelError, Lens, LensModel};
use crate::geometry::{find_homography, pose_from_homography, BoardPose};
use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod mono;
pub mod reprojection;
pub mod stereo;

pub use mono::MonoCalibrationCost;
pub use stereo::StereoCalibrationCost;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

impl ProjectionError {
    /// Summary statistics of per-point reprojection distances in pixels.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::NumericalError`] if `errors` is empty.
    pub fn from_errors(errors: &[f64]) -> Result<Self, CameraModelError> {
        if errors.is_empty() {
            return Err(CameraModelError::NumericalError(
                "no points could be projected".to_string(),
            ));
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
        let min = errors.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = errors.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        let mut sorted = errors.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Ok(ProjectionError {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

/// A trait for calibration problems.
///
/// Types implementing `Optimizer` own their current parameter estimate and
/// refine it in place from the observations they were built with.
pub trait Optimizer {
    /// Performs non-linear optimization to refine the parameters.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, progress is logged at `info` level.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If the optimization was successful and the parameters
    ///   have been updated.
    /// * `Err(CameraModelError)` - If the problem is empty or the solver
    ///   failed to converge.
    fn optimize(&mut self, verbose: bool) -> Result<(), CameraModelError>;

    /// Computes the initial guess the non-linear step starts from.
    fn linear_estimation(&mut self) -> Result<(), CameraModelError>
    where
        Self: Sized;

    /// Reprojection statistics of the current estimate over all observations.
    fn reprojection_error(&self) -> Result<ProjectionError, CameraModelError>;
}

/// Initial board poses for one camera.
///
/// Observations are undistorted with `lens` and a homography is fitted from
/// the board plane to the normalized image plane, so the pose follows with
/// an identity camera matrix.
pub fn initial_poses(
    lens: &Lens,
    object_points: &[Vector3<f64>],
    views: &[Vec<Vector2<f64>>],
) -> Result<Vec<BoardPose>, CameraModelError> {
    let board: Vec<Vector2<f64>> = object_points.iter().map(|p| p.xy()).collect();
    views
        .iter()
        .map(|view| {
            let normalized = view
                .iter()
                .map(|pixel| {
                    let ray = lens.unproject_pixel(pixel)?;
                    Ok(Vector2::new(ray.x / ray.z, ray.y / ray.z))
                })
                .collect::<Result<Vec<_>, CameraModelError>>()?;
            let h = find_homography(&board, &normalized)?;
            pose_from_homography(&Matrix3::identity(), &h)
        })
        .collect()
}

/// Pixel distances between observations and projections of the board seen
/// from `pose`, after the optional right-from-left transform.
pub(crate) fn view_errors(
    lens: &Lens,
    pose: &BoardPose,
    extrinsic: Option<(&Matrix3<f64>, &Vector3<f64>)>,
    object_points: &[Vector3<f64>],
    observations: &[Vector2<f64>],
    errors: &mut Vec<f64>,
) {
    for (point, observed) in object_points.iter().zip(observations) {
        let mut p = pose.transform(point);
        if let Some((r, t)) = extrinsic {
            p = r * p + t;
        }
        if let Ok(projected) = lens.project_ray(&p) {
            errors.push((projected - observed).norm());
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::camera::{Intrinsics, Resolution};
    use crate::geometry::rodrigues;

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };

    pub fn board_points(rows: usize, columns: usize, square: f64) -> Vec<Vector3<f64>> {
        (0..rows)
            .flat_map(|r| (0..columns).map(move |c| Vector3::new(c as f64 * square, r as f64 * square, 0.0)))
            .collect()
    }

    pub fn left_lens() -> Lens {
        Lens::new(
            false,
            Intrinsics {
                fx: 520.0,
                fy: 515.0,
                cx: 322.0,
                cy: 238.0,
            },
            &[-0.12, 0.05, 0.0008, -0.0004, 0.0],
            VGA,
        )
        .unwrap()
    }

    pub fn right_lens() -> Lens {
        Lens::new(
            false,
            Intrinsics {
                fx: 510.0,
                fy: 512.0,
                cx: 316.0,
                cy: 244.0,
            },
            &[-0.1, 0.03, -0.0005, 0.0006, 0.0],
            VGA,
        )
        .unwrap()
    }

    pub const FISHEYE_SIZE: Resolution = Resolution {
        width: 512,
        height: 512,
    };

    /// Kannala-Brandt lens with the given focal length.
    pub fn fisheye_lens(fx: f64) -> Lens {
        Lens::new(
            true,
            Intrinsics {
                fx,
                fy: fx - 0.005,
                cx: 254.932,
                cy: 256.897,
            },
            &[0.0034823, 0.000715, -0.0020532, 0.0002029],
            FISHEYE_SIZE,
        )
        .unwrap()
    }

    /// Board poses in front of the left camera, covering the central part of the frame.
    pub fn board_poses() -> Vec<BoardPose> {
        [
            ([0.15, -0.1, 0.02], [-130.0, -85.0, 480.0]),
            ([-0.2, 0.12, -0.05], [-120.0, -90.0, 450.0]),
            ([0.05, 0.25, 0.1], [-140.0, -80.0, 520.0]),
            ([-0.25, -0.2, 0.0], [-110.0, -95.0, 430.0]),
            ([0.3, 0.05, -0.1], [-135.0, -70.0, 500.0]),
            ([0.0, -0.3, 0.05], [-100.0, -100.0, 470.0]),
            ([-0.1, 0.3, 0.15], [-150.0, -75.0, 540.0]),
            ([0.22, 0.2, -0.02], [-125.0, -105.0, 460.0]),
            ([-0.3, 0.0, 0.08], [-115.0, -85.0, 440.0]),
            ([0.1, -0.2, -0.12], [-130.0, -90.0, 490.0]),
        ]
        .iter()
        .map(|(r, t)| BoardPose {
            rotation: rodrigues(&Vector3::from(*r)),
            translation: Vector3::from(*t),
        })
        .collect()
    }

    pub fn stereo_extrinsic() -> (Matrix3<f64>, Vector3<f64>) {
        (
            rodrigues(&Vector3::new(0.004, -0.012, 0.003)),
            Vector3::new(-60.0, 0.4, -0.6),
        )
    }

    pub fn observe(
        lens: &Lens,
        pose: &BoardPose,
        extrinsic: Option<(&Matrix3<f64>, &Vector3<f64>)>,
        object_points: &[Vector3<f64>],
    ) -> Vec<Vector2<f64>> {
        object_points
            .iter()
            .map(|p| {
                let mut pc = pose.transform(p);
                if let Some((r, t)) = extrinsic {
                    pc = r * pc + t;
                }
                lens.project(&pc).unwrap()
            })
            .collect()
    }
}
