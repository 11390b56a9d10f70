//! Joint calibration of both cameras of the rig.
//!
//! Board poses are expressed in the left camera frame; the right camera sees
//! each board through the right-from-left transform `x_r = R x_l + t`.

use crate::camera::{CameraModelError, Intrinsics, Lens, LensModel};
use crate::geometry::{average_relative_pose, BoardPose};
use crate::optimization::reprojection::{FixedLens, ReprojectionFactor};
use crate::optimization::{initial_poses, view_errors, Optimizer, ProjectionError};

use log::info;
use nalgebra::{DVector, Matrix3, Vector2, Vector3};
use std::collections::HashMap;
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Calibration problem for the stereo rig.
#[derive(Debug, Clone)]
pub struct StereoCalibrationCost {
    left: Lens,
    right: Lens,
    object_points: Vec<Vector3<f64>>,
    left_views: Vec<Vec<Vector2<f64>>>,
    right_views: Vec<Vec<Vector2<f64>>>,
    /// Board poses relative to the left camera.
    poses: Vec<BoardPose>,
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
    /// When false both lenses are held exactly at their initial values.
    refine_intrinsics: bool,
    max_iterations: usize,
}

impl StereoCalibrationCost {
    /// Creates a new problem.
    ///
    /// # Arguments
    ///
    /// * `left`, `right` - Lens estimates, used as starting point or held fixed.
    /// * `object_points` - Board corners in board coordinates.
    /// * `left_views`, `right_views` - Corners of the same images in both cameras.
    /// * `refine_intrinsics` - Whether the lenses take part in the optimization.
    pub fn new(
        left: Lens,
        right: Lens,
        object_points: Vec<Vector3<f64>>,
        left_views: Vec<Vec<Vector2<f64>>>,
        right_views: Vec<Vec<Vector2<f64>>>,
        refine_intrinsics: bool,
    ) -> Self {
        StereoCalibrationCost {
            left,
            right,
            object_points,
            left_views,
            right_views,
            poses: Vec::new(),
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
            refine_intrinsics,
            max_iterations: 100,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn left(&self) -> &Lens {
        &self.left
    }

    pub fn right(&self) -> &Lens {
        &self.right
    }

    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.rotation
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    /// Reprojection statistics of one camera.
    pub fn side_error(&self, right: bool) -> Result<ProjectionError, CameraModelError> {
        let mut errors = Vec::new();
        self.collect_errors(right, &mut errors);
        ProjectionError::from_errors(&errors)
    }

    fn collect_errors(&self, right: bool, errors: &mut Vec<f64>) {
        let (lens, views, extrinsic) = if right {
            (
                &self.right,
                &self.right_views,
                Some((&self.rotation, &self.translation)),
            )
        } else {
            (&self.left, &self.left_views, None)
        };
        for (view, pose) in views.iter().zip(&self.poses) {
            view_errors(lens, pose, extrinsic, &self.object_points, view, errors);
        }
    }

    fn check_inputs(&self) -> Result<(), CameraModelError> {
        if self.left_views.is_empty() || self.left_views.len() != self.right_views.len() {
            return Err(CameraModelError::InvalidParams(
                "stereo calibration needs the same non-zero number of views per camera"
                    .to_string(),
            ));
        }
        let n = self.object_points.len();
        if self
            .left_views
            .iter()
            .chain(&self.right_views)
            .any(|view| view.len() != n)
        {
            return Err(CameraModelError::InvalidParams(
                "Number of 2D and 3D points must match".to_string(),
            ));
        }
        Ok(())
    }
}

fn lens_blocks(lens: &Lens) -> (DVector<f64>, DVector<f64>) {
    let k = lens.get_intrinsics();
    (
        DVector::from_vec(vec![k.fx, k.fy, k.cx, k.cy]),
        DVector::from_vec(lens.get_distortion()),
    )
}

fn fixed_lens(lens: &Lens) -> FixedLens {
    let k = lens.get_intrinsics();
    FixedLens {
        intrinsics: [k.fx, k.fy, k.cx, k.cy],
        distortion: lens.get_distortion(),
    }
}

impl Optimizer for StereoCalibrationCost {
    fn optimize(&mut self, verbose: bool) -> Result<(), CameraModelError> {
        self.check_inputs()?;
        if self.poses.len() != self.left_views.len() {
            self.linear_estimation()?;
        }
        let is_fisheye = self.left.is_fisheye();

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();

        if self.refine_intrinsics {
            let (k, d) = lens_blocks(&self.left);
            initial_values.insert("left_intrinsics".to_string(), k);
            initial_values.insert("left_distortion".to_string(), d);
            let (k, d) = lens_blocks(&self.right);
            initial_values.insert("right_intrinsics".to_string(), k);
            initial_values.insert("right_distortion".to_string(), d);
        }
        let extrinsic = BoardPose {
            rotation: self.rotation,
            translation: self.translation,
        };
        initial_values.insert(
            "extrinsic".to_string(),
            DVector::from_row_slice(&extrinsic.to_params()),
        );

        for (i, pose) in self.poses.iter().enumerate() {
            let pose_name = format!("pose_{i}");
            initial_values.insert(pose_name.clone(), DVector::from_row_slice(&pose.to_params()));

            let left = ReprojectionFactor::new(&self.object_points, &self.left_views[i], is_fisheye);
            let right =
                ReprojectionFactor::new(&self.object_points, &self.right_views[i], is_fisheye)
                    .through_extrinsic();

            if self.refine_intrinsics {
                problem.add_residual_block(
                    left.residual_dim(),
                    &["left_intrinsics", "left_distortion", pose_name.as_str()],
                    Box::new(left),
                    None,
                );
                problem.add_residual_block(
                    right.residual_dim(),
                    &[
                        "right_intrinsics",
                        "right_distortion",
                        pose_name.as_str(),
                        "extrinsic",
                    ],
                    Box::new(right),
                    None,
                );
            } else {
                let left = left.with_fixed_lens(fixed_lens(&self.left));
                let right = right.with_fixed_lens(fixed_lens(&self.right));
                problem.add_residual_block(
                    left.residual_dim(),
                    &[pose_name.as_str()],
                    Box::new(left),
                    None,
                );
                problem.add_residual_block(
                    right.residual_dim(),
                    &[pose_name.as_str(), "extrinsic"],
                    Box::new(right),
                    None,
                );
            }
        }

        if verbose {
            info!(
                "Starting stereo calibration with {} image pairs ({} intrinsics)...",
                self.poses.len(),
                if self.refine_intrinsics { "refining" } else { "fixed" }
            );
        }

        let options = OptimizerOptions {
            max_iteration: self.max_iterations,
            ..OptimizerOptions::default()
        };
        let result = LevenbergMarquardtOptimizer::default()
            .optimize(&problem, &initial_values, Some(options))
            .ok_or_else(|| CameraModelError::NumericalError("Optimization failed".to_string()))?;

        let block = |name: &str| {
            result.get(name).ok_or_else(|| {
                CameraModelError::NumericalError(format!("solver returned no value for {name}"))
            })
        };

        if self.refine_intrinsics {
            let rebuild = |side: &str, resolution| -> Result<Lens, CameraModelError> {
                let k = block(&format!("{side}_intrinsics"))?;
                let d = block(&format!("{side}_distortion"))?;
                Lens::new(
                    is_fisheye,
                    Intrinsics {
                        fx: k[0],
                        fy: k[1],
                        cx: k[2],
                        cy: k[3],
                    },
                    d.as_slice(),
                    resolution,
                )
            };
            let left = rebuild("left", self.left.get_resolution())?;
            let right = rebuild("right", self.right.get_resolution())?;
            self.left = left;
            self.right = right;
        }

        let extrinsic = BoardPose::from_params(block("extrinsic")?.as_slice());
        self.rotation = extrinsic.rotation;
        self.translation = extrinsic.translation;
        self.poses = (0..self.poses.len())
            .map(|i| Ok(BoardPose::from_params(block(&format!("pose_{i}"))?.as_slice())))
            .collect::<Result<Vec<_>, CameraModelError>>()?;

        if verbose {
            info!(
                "Optimization finished: baseline {:.4}, translation {:?}",
                self.translation.norm(),
                self.translation.as_slice()
            );
        }
        Ok(())
    }

    /// Per-camera poses from the current lenses, then the averaged relative pose.
    fn linear_estimation(&mut self) -> Result<(), CameraModelError> {
        self.check_inputs()?;
        let left_poses = initial_poses(&self.left, &self.object_points, &self.left_views)?;
        let right_poses = initial_poses(&self.right, &self.object_points, &self.right_views)?;
        let (rotation, translation) = average_relative_pose(&left_poses, &right_poses)?;
        self.rotation = rotation;
        self.translation = translation;
        self.poses = left_poses;
        Ok(())
    }

    fn reprojection_error(&self) -> Result<ProjectionError, CameraModelError> {
        let mut errors = Vec::new();
        self.collect_errors(false, &mut errors);
        self.collect_errors(true, &mut errors);
        ProjectionError::from_errors(&errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Intrinsics;
    use crate::optimization::test_support::*;
    use approx::assert_relative_eq;

    fn views(
        lens: &Lens,
        extrinsic: Option<(&Matrix3<f64>, &Vector3<f64>)>,
        object_points: &[Vector3<f64>],
    ) -> Vec<Vec<Vector2<f64>>> {
        board_poses()
            .iter()
            .map(|pose| observe(lens, pose, extrinsic, object_points))
            .collect()
    }

    #[test]
    fn test_stereo_fixed_intrinsics_recovers_extrinsic() {
        let object_points = board_points(8, 11, 25.0);
        let (r, t) = stereo_extrinsic();
        let left_views = views(&left_lens(), None, &object_points);
        let right_views = views(&right_lens(), Some((&r, &t)), &object_points);

        let mut cost = StereoCalibrationCost::new(
            left_lens(),
            right_lens(),
            object_points,
            left_views,
            right_views,
            false,
        );
        cost.linear_estimation().unwrap();
        assert_relative_eq!(*cost.translation(), t, epsilon = 1e-3);

        cost.optimize(false).unwrap();
        assert_relative_eq!(*cost.rotation(), r, epsilon = 1e-6);
        assert_relative_eq!(*cost.translation(), t, epsilon = 1e-4);
        assert_eq!(cost.left(), &left_lens());
        assert_eq!(cost.right(), &right_lens());
        assert!(cost.reprojection_error().unwrap().rmse < 1e-3);
    }

    #[test]
    fn test_stereo_refines_perturbed_intrinsics() {
        let object_points = board_points(8, 11, 25.0);
        let (r, t) = stereo_extrinsic();
        let left_views = views(&left_lens(), None, &object_points);
        let right_views = views(&right_lens(), Some((&r, &t)), &object_points);

        let perturb = |lens: &Lens| {
            let k = lens.get_intrinsics();
            Lens::new(
                false,
                Intrinsics {
                    fx: k.fx * 1.02,
                    fy: k.fy * 0.98,
                    cx: k.cx + 3.0,
                    cy: k.cy - 2.0,
                },
                &[0.0; 5],
                VGA,
            )
            .unwrap()
        };

        let mut cost = StereoCalibrationCost::new(
            perturb(&left_lens()),
            perturb(&right_lens()),
            object_points,
            left_views,
            right_views,
            true,
        );
        cost.optimize(false).unwrap();

        assert_relative_eq!(cost.left().get_intrinsics().fx, 520.0, max_relative = 1e-3);
        assert_relative_eq!(cost.right().get_intrinsics().fy, 512.0, max_relative = 1e-3);
        assert_relative_eq!(*cost.translation(), t, epsilon = 0.1);
        assert!(cost.side_error(true).unwrap().rmse < 1e-2);
    }

    #[test]
    fn test_stereo_rejects_unpaired_views() {
        let mut cost = StereoCalibrationCost::new(
            left_lens(),
            right_lens(),
            board_points(8, 11, 25.0),
            vec![],
            vec![],
            false,
        );
        assert!(cost.optimize(false).is_err());
    }
}
