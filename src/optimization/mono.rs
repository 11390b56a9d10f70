//! Single-camera calibration from planar board views.
//!
//! Estimates the camera matrix, the distortion coefficients of the chosen
//! lens family and one board pose per view, minimizing the pixel
//! reprojection error over all corners.

use crate::camera::{CameraModelError, Intrinsics, Lens, LensModel, Resolution};
use crate::geometry::{estimate_intrinsics, find_homography, BoardPose};
use crate::optimization::reprojection::ReprojectionFactor;
use crate::optimization::{initial_poses, view_errors, Optimizer, ProjectionError};

use log::{info, warn};
use nalgebra::{DVector, Vector2, Vector3};
use std::collections::HashMap;
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Calibration problem for one camera.
#[derive(Debug, Clone)]
pub struct MonoCalibrationCost {
    /// Current lens estimate.
    lens: Lens,
    /// Board corners in board coordinates (`z = 0`).
    object_points: Vec<Vector3<f64>>,
    /// Detected corners per view, in the same order as `object_points`.
    views: Vec<Vec<Vector2<f64>>>,
    /// Board pose per view, filled by the linear estimation.
    poses: Vec<BoardPose>,
    max_iterations: usize,
}

impl MonoCalibrationCost {
    /// Creates a new problem starting from an undistorted lens guess.
    ///
    /// # Arguments
    ///
    /// * `is_fisheye` - Lens family to fit.
    /// * `resolution` - Image size of the camera.
    /// * `object_points` - Board corners in board coordinates.
    /// * `views` - Detected corners of every accepted image.
    pub fn new(
        is_fisheye: bool,
        resolution: Resolution,
        object_points: Vec<Vector3<f64>>,
        views: Vec<Vec<Vector2<f64>>>,
    ) -> Result<Self, CameraModelError> {
        let lens = Lens::ideal(is_fisheye, default_intrinsics(resolution), resolution)?;
        Ok(MonoCalibrationCost {
            lens,
            object_points,
            views,
            poses: Vec::new(),
            max_iterations: 100,
        })
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn lens(&self) -> &Lens {
        &self.lens
    }

    pub fn poses(&self) -> &[BoardPose] {
        &self.poses
    }

    fn check_inputs(&self) -> Result<(), CameraModelError> {
        if self.views.is_empty() {
            return Err(CameraModelError::InvalidParams(
                "no views to calibrate from".to_string(),
            ));
        }
        if self
            .views
            .iter()
            .any(|view| view.len() != self.object_points.len())
        {
            return Err(CameraModelError::InvalidParams(
                "Number of 2D and 3D points must match".to_string(),
            ));
        }
        Ok(())
    }
}

/// Focal length of the image's larger side, principal point at the center.
fn default_intrinsics(resolution: Resolution) -> Intrinsics {
    let f = resolution.width.max(resolution.height) as f64;
    Intrinsics {
        fx: f,
        fy: f,
        cx: resolution.width as f64 / 2.0,
        cy: resolution.height as f64 / 2.0,
    }
}

impl Optimizer for MonoCalibrationCost {
    /// Refines `[fx, fy, cx, cy]`, the distortion and all board poses.
    fn optimize(&mut self, verbose: bool) -> Result<(), CameraModelError> {
        self.check_inputs()?;
        if self.poses.len() != self.views.len() {
            self.linear_estimation()?;
        }

        let intrinsics = self.lens.get_intrinsics();
        let is_fisheye = self.lens.is_fisheye();

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        initial_values.insert(
            "intrinsics".to_string(),
            DVector::from_vec(vec![
                intrinsics.fx,
                intrinsics.fy,
                intrinsics.cx,
                intrinsics.cy,
            ]),
        );
        initial_values.insert(
            "distortion".to_string(),
            DVector::from_vec(self.lens.get_distortion()),
        );

        for (i, (view, pose)) in self.views.iter().zip(&self.poses).enumerate() {
            let pose_name = format!("pose_{i}");
            let factor = ReprojectionFactor::new(&self.object_points, view, is_fisheye);
            problem.add_residual_block(
                factor.residual_dim(),
                &["intrinsics", "distortion", pose_name.as_str()],
                Box::new(factor),
                None,
            );
            initial_values.insert(pose_name, DVector::from_row_slice(&pose.to_params()));
        }

        if verbose {
            info!(
                "Starting mono calibration with {} views using tiny-solver Levenberg-Marquardt...",
                self.views.len()
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

        let k = block("intrinsics")?;
        let distortion = block("distortion")?;
        let lens = Lens::new(
            is_fisheye,
            Intrinsics {
                fx: k[0],
                fy: k[1],
                cx: k[2],
                cy: k[3],
            },
            distortion.as_slice(),
            self.lens.get_resolution(),
        )?;
        let poses = (0..self.views.len())
            .map(|i| Ok(BoardPose::from_params(block(&format!("pose_{i}"))?.as_slice())))
            .collect::<Result<Vec<_>, CameraModelError>>()?;

        self.lens = lens;
        self.poses = poses;

        if verbose {
            info!("Optimization finished: {:?}", self.lens);
        }
        Ok(())
    }

    /// Zhang's closed-form camera matrix followed by per-view poses.
    ///
    /// Distortion is assumed zero at this stage. With fewer than three views,
    /// or when the closed form is degenerate, the camera matrix falls back to
    /// the image-size guess.
    fn linear_estimation(&mut self) -> Result<(), CameraModelError> {
        self.check_inputs()?;
        let resolution = self.lens.get_resolution();
        let board: Vec<Vector2<f64>> = self.object_points.iter().map(|p| p.xy()).collect();

        let intrinsics = if self.views.len() >= 3 {
            let homographies = self
                .views
                .iter()
                .map(|view| find_homography(&board, view))
                .collect::<Result<Vec<_>, _>>()?;
            match estimate_intrinsics(&homographies) {
                Ok(k)
                    if k.fx.is_finite()
                        && k.fy.is_finite()
                        && resolution.contains(&Vector2::new(k.cx, k.cy)) =>
                {
                    k
                }
                Ok(k) => {
                    warn!("Closed-form intrinsics {k:?} are implausible, using defaults");
                    default_intrinsics(resolution)
                }
                Err(e) => {
                    warn!("Closed-form intrinsics failed ({e}), using defaults");
                    default_intrinsics(resolution)
                }
            }
        } else {
            default_intrinsics(resolution)
        };

        self.lens = Lens::ideal(self.lens.is_fisheye(), intrinsics, resolution)?;
        self.poses = initial_poses(&self.lens, &self.object_points, &self.views)?;
        Ok(())
    }

    fn reprojection_error(&self) -> Result<ProjectionError, CameraModelError> {
        let mut errors = Vec::new();
        for (view, pose) in self.views.iter().zip(&self.poses) {
            view_errors(&self.lens, pose, None, &self.object_points, view, &mut errors);
        }
        ProjectionError::from_errors(&errors)
    }
}
