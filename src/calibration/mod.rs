//! Checkerboard calibration of the stereo rig.
//!
//! The [`Calibrator`] runs corner detection over every sample pair once,
//! caches the detections, and fits either one camera at a time
//! ([`Calibrator::calibrate_single`]) or the whole rig
//! ([`Calibrator::calibrate_stereo`]). Results are written back into the
//! owned [`CameraModel`] through its two update operations only.

pub mod chessboard;

pub use chessboard::{corner_subpix, ChessboardDetector, CornerDetector};

use crate::camera::{CameraModel, CameraModelError, Lens, LensModel};
use crate::dataset::StereoSample;
use crate::optimization::{
    MonoCalibrationCost, Optimizer, ProjectionError, StereoCalibrationCost,
};

use log::{info, warn};
use nalgebra::{Matrix3, Vector2, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Insufficient calibration data: {0}")]
    InsufficientCalibrationData(String),
    #[error("Invalid board geometry: {0}")]
    InvalidBoard(String),
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Corner detection failed: {0}")]
    DetectionFailed(String),
    #[error("Numerical error: {0}")]
    NumericalError(String),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

/// Interior-corner grid of the calibration board.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoardGeometry {
    pub rows: usize,
    pub columns: usize,
    /// Edge length of one square, in the unit every measurement is reported in.
    pub square_size: f64,
}

impl BoardGeometry {
    pub fn new(rows: usize, columns: usize, square_size: f64) -> Result<Self, CalibrationError> {
        let board = BoardGeometry {
            rows,
            columns,
            square_size,
        };
        board.validate()?;
        Ok(board)
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.rows < 2 || self.columns < 2 {
            return Err(CalibrationError::InvalidBoard(format!(
                "need at least 2x2 interior corners, got {}x{}",
                self.rows, self.columns
            )));
        }
        if !(self.square_size.is_finite() && self.square_size > 0.0) {
            return Err(CalibrationError::InvalidBoard(format!(
                "square size must be positive, got {}",
                self.square_size
            )));
        }
        Ok(())
    }

    pub fn corner_count(&self) -> usize {
        self.rows * self.columns
    }

    /// Corner positions on the board plane, row-major.
    pub fn object_points(&self) -> Vec<Vector3<f64>> {
        (0..self.rows)
            .flat_map(|r| {
                (0..self.columns).map(move |c| {
                    Vector3::new(
                        c as f64 * self.square_size,
                        r as f64 * self.square_size,
                        0.0,
                    )
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraSide {
    Left,
    Right,
}

impl CameraSide {
    pub fn index(self) -> usize {
        match self {
            CameraSide::Left => 0,
            CameraSide::Right => 1,
        }
    }
}

impl TryFrom<usize> for CameraSide {
    type Error = CalibrationError;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        match index {
            0 => Ok(CameraSide::Left),
            1 => Ok(CameraSide::Right),
            other => Err(CalibrationError::InvalidParams(format!(
                "camera index {other} does not exist, use 0 (left) or 1 (right)"
            ))),
        }
    }
}

impl fmt::Display for CameraSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSide::Left => write!(f, "left"),
            CameraSide::Right => write!(f, "right"),
        }
    }
}

/// What stereo calibration does with the lenses it starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntrinsicsHandling {
    /// Lenses are held exactly; only board poses and the extrinsics move.
    Fixed,
    /// Lenses are the initial guess and are refined jointly.
    Refine,
}

impl IntrinsicsHandling {
    pub fn from_fix_flag(fix_intrinsic: bool) -> Self {
        if fix_intrinsic {
            IntrinsicsHandling::Fixed
        } else {
            IntrinsicsHandling::Refine
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationOptions {
    pub max_iterations: usize,
    pub verbose: bool,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        CalibrationOptions {
            max_iterations: 100,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonoCalibration {
    pub side: CameraSide,
    pub lens: Lens,
    pub error: ProjectionError,
    /// Sample indices that contributed corners.
    pub used_images: Vec<usize>,
    /// Sample indices without usable corners.
    pub rejected_images: Vec<usize>,
}

impl MonoCalibration {
    pub fn rms(&self) -> f64 {
        self.error.rmse
    }
}

#[derive(Debug, Clone)]
pub struct StereoCalibration {
    pub handling: IntrinsicsHandling,
    /// Statistics over the corners of both cameras.
    pub error: ProjectionError,
    pub left_error: ProjectionError,
    pub right_error: ProjectionError,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub used_images: Vec<usize>,
    pub rejected_images: Vec<usize>,
}

impl StereoCalibration {
    pub fn rms(&self) -> f64 {
        self.error.rmse
    }

    pub fn baseline(&self) -> f64 {
        self.translation.norm()
    }
}

/// Corners found in one sample pair.
#[derive(Debug, Clone)]
struct PairDetections {
    index: usize,
    left: Option<Vec<Vector2<f64>>>,
    right: Option<Vec<Vector2<f64>>>,
}

impl PairDetections {
    fn side(&self, side: CameraSide) -> Option<&Vec<Vector2<f64>>> {
        match side {
            CameraSide::Left => self.left.as_ref(),
            CameraSide::Right => self.right.as_ref(),
        }
    }
}

pub struct Calibrator {
    model: CameraModel,
    board: BoardGeometry,
    samples: Vec<StereoSample>,
    detector: Box<dyn CornerDetector>,
    options: CalibrationOptions,
    detections: Option<Vec<PairDetections>>,
    mono: [Option<MonoCalibration>; 2],
}

impl Calibrator {
    /// Creates a calibrator using the default [`ChessboardDetector`].
    pub fn new(model: CameraModel, board: BoardGeometry, samples: Vec<StereoSample>) -> Self {
        Calibrator {
            model,
            board,
            samples,
            detector: Box::new(ChessboardDetector::default()),
            options: CalibrationOptions::default(),
            detections: None,
            mono: [None, None],
        }
    }

    pub fn with_detector(mut self, detector: Box<dyn CornerDetector>) -> Self {
        self.detector = detector;
        self.detections = None;
        self
    }

    pub fn with_options(mut self, options: CalibrationOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the board geometry, dropping cached detections and mono results.
    pub fn set_board(&mut self, board: BoardGeometry) -> Result<(), CalibrationError> {
        board.validate()?;
        self.board = board;
        self.detections = None;
        self.mono = [None, None];
        Ok(())
    }

    pub fn board(&self) -> &BoardGeometry {
        &self.board
    }

    pub fn model(&self) -> &CameraModel {
        &self.model
    }

    pub fn into_model(self) -> CameraModel {
        self.model
    }

    pub fn mono_result(&self, side: CameraSide) -> Option<&MonoCalibration> {
        self.mono[side.index()].as_ref()
    }

    /// Fits the lens of one camera and stores it for that side.
    ///
    /// The rig's intrinsics are updated once both sides are known, either
    /// from this calibrator or from the lenses already in the model.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InsufficientCalibrationData`] if no sample has
    /// corners in this camera.
    pub fn calibrate_single(
        &mut self,
        side: CameraSide,
    ) -> Result<MonoCalibration, CalibrationError> {
        self.board.validate()?;
        let (used_images, rejected_images, views) = {
            let detections = self.detections();
            let mut used = Vec::new();
            let mut rejected = Vec::new();
            let mut views = Vec::new();
            for pair in detections {
                match pair.side(side) {
                    Some(corners) => {
                        used.push(pair.index);
                        views.push(corners.clone());
                    }
                    None => rejected.push(pair.index),
                }
            }
            (used, rejected, views)
        };

        if views.is_empty() {
            return Err(CalibrationError::InsufficientCalibrationData(format!(
                "no image has detected corners in the {side} camera"
            )));
        }

        let (lens, error) = self.fit_lens(views)?;
        info!(
            "{side} camera calibrated from {} images ({} rejected), RMS {:.4} px",
            used_images.len(),
            rejected_images.len(),
            error.rmse
        );

        let result = MonoCalibration {
            side,
            lens,
            error,
            used_images,
            rejected_images,
        };
        self.mono[side.index()] = Some(result.clone());
        self.commit_intrinsics()?;
        Ok(result)
    }

    /// Calibrates the left camera, then the right one.
    pub fn calibrate_mono(
        &mut self,
    ) -> Result<(MonoCalibration, MonoCalibration), CalibrationError> {
        let left = self.calibrate_single(CameraSide::Left)?;
        let right = self.calibrate_single(CameraSide::Right)?;
        Ok((left, right))
    }

    /// Stereo calibration; `fix_intrinsic` selects [`IntrinsicsHandling::Fixed`].
    pub fn calibrate_stereo(
        &mut self,
        fix_intrinsic: bool,
    ) -> Result<StereoCalibration, CalibrationError> {
        self.calibrate_stereo_with(IntrinsicsHandling::from_fix_flag(fix_intrinsic))
    }

    /// Fits the right-from-left transform from samples with corners in both
    /// cameras.
    ///
    /// Starting lenses come from the mono results of this calibrator, then
    /// from the model. With [`IntrinsicsHandling::Refine`] a missing lens is
    /// estimated from the paired samples first.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::InsufficientCalibrationData`] if no sample has
    ///   corners in both cameras.
    /// * [`CameraModelError::NotCalibrated`] for [`IntrinsicsHandling::Fixed`]
    ///   without known lenses.
    pub fn calibrate_stereo_with(
        &mut self,
        handling: IntrinsicsHandling,
    ) -> Result<StereoCalibration, CalibrationError> {
        self.board.validate()?;
        let (used_images, rejected_images, left_views, right_views) = {
            let detections = self.detections();
            let mut used = Vec::new();
            let mut rejected = Vec::new();
            let mut left_views = Vec::new();
            let mut right_views = Vec::new();
            for pair in detections {
                match (&pair.left, &pair.right) {
                    (Some(l), Some(r)) => {
                        used.push(pair.index);
                        left_views.push(l.clone());
                        right_views.push(r.clone());
                    }
                    _ => rejected.push(pair.index),
                }
            }
            (used, rejected, left_views, right_views)
        };

        if left_views.is_empty() {
            return Err(CalibrationError::InsufficientCalibrationData(
                "no image has detected corners in both cameras".to_string(),
            ));
        }

        let (left, right) = match (handling, self.known_lens(CameraSide::Left), self.known_lens(CameraSide::Right)) {
            (_, Some(left), Some(right)) => (left, right),
            (IntrinsicsHandling::Fixed, _, _) => {
                return Err(CameraModelError::NotCalibrated.into());
            }
            (IntrinsicsHandling::Refine, left, right) => {
                info!("No prior intrinsics for both cameras, estimating them from the stereo set");
                let left = match left {
                    Some(lens) => lens,
                    None => self.fit_lens(left_views.clone())?.0,
                };
                let right = match right {
                    Some(lens) => lens,
                    None => self.fit_lens(right_views.clone())?.0,
                };
                (left, right)
            }
        };

        let refine = handling == IntrinsicsHandling::Refine;
        let mut cost = StereoCalibrationCost::new(
            left,
            right,
            self.board.object_points(),
            left_views,
            right_views,
            refine,
        )
        .with_max_iterations(self.options.max_iterations);
        cost.linear_estimation()?;
        cost.optimize(self.options.verbose)?;

        let error = cost.reprojection_error()?;
        let left_error = cost.side_error(false)?;
        let right_error = cost.side_error(true)?;

        let refined = refine.then(|| (cost.left(), cost.right()));
        self.commit_stereo(refined, cost.rotation(), cost.translation())?;

        info!(
            "Stereo calibration ({handling:?} intrinsics) from {} pairs ({} rejected), RMS {:.4} px, baseline {:.4}",
            used_images.len(),
            rejected_images.len(),
            error.rmse,
            cost.translation().norm()
        );

        Ok(StereoCalibration {
            handling,
            error,
            left_error,
            right_error,
            rotation: *cost.rotation(),
            translation: *cost.translation(),
            used_images,
            rejected_images,
        })
    }

    /// Writes the stereo result into the model. Nothing is written unless
    /// every update succeeds.
    fn commit_stereo(
        &mut self,
        lenses: Option<(&Lens, &Lens)>,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) -> Result<(), CalibrationError> {
        let mut updated = self.model.clone();
        if let Some((left, right)) = lenses {
            updated.update_intrinsic(
                &left.camera_matrix(),
                &left.get_distortion(),
                &right.camera_matrix(),
                &right.get_distortion(),
            )?;
        }
        updated.update_extrinsic(rotation, translation)?;
        self.model = updated;
        Ok(())
    }

    fn fit_lens(
        &self,
        views: Vec<Vec<Vector2<f64>>>,
    ) -> Result<(Lens, ProjectionError), CalibrationError> {
        let mut cost = MonoCalibrationCost::new(
            self.model.is_fisheye(),
            self.model.image_size(),
            self.board.object_points(),
            views,
        )?
        .with_max_iterations(self.options.max_iterations);
        cost.linear_estimation()?;
        cost.optimize(self.options.verbose)?;
        let error = cost.reprojection_error()?;
        Ok((cost.lens().clone(), error))
    }

    fn known_lens(&self, side: CameraSide) -> Option<Lens> {
        if let Some(mono) = &self.mono[side.index()] {
            return Some(mono.lens.clone());
        }
        self.model.intrinsics().map(|intrinsics| match side {
            CameraSide::Left => intrinsics.left.clone(),
            CameraSide::Right => intrinsics.right.clone(),
        })
    }

    fn commit_intrinsics(&mut self) -> Result<(), CalibrationError> {
        match (
            self.known_lens(CameraSide::Left),
            self.known_lens(CameraSide::Right),
        ) {
            (Some(left), Some(right)) => {
                self.model.update_intrinsic(
                    &left.camera_matrix(),
                    &left.get_distortion(),
                    &right.camera_matrix(),
                    &right.get_distortion(),
                )?;
                Ok(())
            }
            _ => {
                info!("Intrinsics are written once both cameras are calibrated");
                Ok(())
            }
        }
    }

    /// Runs detection once per sample pair, in parallel, sorted by index.
    fn detections(&mut self) -> &[PairDetections] {
        let samples = &self.samples;
        let detector = self.detector.as_ref();
        let board = &self.board;
        let size = self.model.image_size();
        self.detections.get_or_insert_with(|| {
            let mut found: Vec<PairDetections> = samples
                .par_iter()
                .map(|sample| {
                    let detect = |side: CameraSide| {
                        let image = match side {
                            CameraSide::Left => &sample.left,
                            CameraSide::Right => &sample.right,
                        };
                        if image.width() != size.width || image.height() != size.height {
                            warn!(
                                "Image {} ({side}): size {}x{} differs from the rig's {}x{}, skipped",
                                sample.name,
                                image.width(),
                                image.height(),
                                size.width,
                                size.height
                            );
                            return None;
                        }
                        match detector.detect(image, board) {
                            Ok(corners) if corners.len() == board.corner_count() => Some(corners),
                            Ok(corners) => {
                                warn!(
                                    "Image {} ({side}): {} corners found, expected {}, skipped",
                                    sample.name,
                                    corners.len(),
                                    board.corner_count()
                                );
                                None
                            }
                            Err(e) => {
                                warn!("Image {} ({side}): {e}, skipped", sample.name);
                                None
                            }
                        }
                    };
                    PairDetections {
                        index: sample.index,
                        left: detect(CameraSide::Left),
                        right: detect(CameraSide::Right),
                    }
                })
                .collect();
            found.sort_by_key(|pair| pair.index);
            found
        })
    }
}

/// Calibration quality summary written next to the camera model.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub board: BoardGeometry,
    pub cameras: Vec<CameraReport>,
    pub stereo: Option<StereoReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraReport {
    pub side: CameraSide,
    pub rms: f64,
    pub error: ProjectionError,
    pub used_images: Vec<usize>,
    pub rejected_images: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StereoReport {
    pub intrinsics: IntrinsicsHandling,
    pub rms: f64,
    pub error: ProjectionError,
    pub left_rms: f64,
    pub right_rms: f64,
    pub baseline: f64,
    pub used_images: Vec<usize>,
    pub rejected_images: Vec<usize>,
}

impl CalibrationReport {
    pub fn new(
        board: BoardGeometry,
        mono: &[MonoCalibration],
        stereo: Option<&StereoCalibration>,
    ) -> Self {
        CalibrationReport {
            board,
            cameras: mono
                .iter()
                .map(|m| CameraReport {
                    side: m.side,
                    rms: m.rms(),
                    error: m.error.clone(),
                    used_images: m.used_images.clone(),
                    rejected_images: m.rejected_images.clone(),
                })
                .collect(),
            stereo: stereo.map(|s| StereoReport {
                intrinsics: s.handling,
                rms: s.rms(),
                error: s.error.clone(),
                left_rms: s.left_error.rmse,
                right_rms: s.right_error.rmse,
                baseline: s.baseline(),
                used_images: s.used_images.clone(),
                rejected_images: s.rejected_images.clone(),
            }),
        }
    }
}
