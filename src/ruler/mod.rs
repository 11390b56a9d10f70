//! Point-to-point measurement on a rectified stereo pair.
//!
//! A session moves through [`RulerState::Idle`], [`RulerState::PointsSelected`]
//! and [`RulerState::Measured`]. Every call to [`Ruler::click_segment`]
//! starts over from `Idle`.

use crate::calibration::corner_subpix;
use crate::matching::{CorrespondenceMatcher, MatchError};
use crate::rectification::{RectificationBundle, RectificationError, Rectifier};
use crate::util::{concat_horizontal, draw_circle, draw_line, save_image, UtilError};

use image::{DynamicImage, GrayImage, Rgb};
use log::{info, warn};
use nalgebra::{Vector2, Vector3};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum MeasureError {
    #[error("Two point pairs are needed, {0} selected")]
    IncompleteSelection(usize),
    #[error("Disparity {0:.3} px is not positive")]
    DegenerateDisparity(f64),
    #[error(transparent)]
    NoMatch(#[from] MatchError),
    #[error("Point selection was cancelled")]
    SelectionCancelled,
    #[error("Image error: {0}")]
    Image(String),
}

impl From<UtilError> for MeasureError {
    fn from(e: UtilError) -> Self {
        MeasureError::Image(e.to_string())
    }
}

impl From<RectificationError> for MeasureError {
    fn from(e: RectificationError) -> Self {
        MeasureError::Image(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulerState {
    Idle,
    PointsSelected,
    Measured,
}

/// One physical point seen in both rectified images.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointPair {
    pub left: Vector2<f64>,
    pub right: Vector2<f64>,
}

impl PointPair {
    pub fn disparity(&self) -> f64 {
        self.left.x - self.right.x
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Segment length in board units.
    pub distance: f64,
    /// Endpoints in the rectified left camera frame.
    pub points: [Vector3<f64>; 2],
    pub pairs: [PointPair; 2],
}

/// Source of user-selected image points.
pub trait PointPicker {
    /// Returns `None` when the user gives up.
    fn pick(&mut self, image: &GrayImage, prompt: &str) -> Option<Vector2<f64>>;
}

/// Replays a fixed list of points.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPicker {
    points: VecDeque<Vector2<f64>>,
}

impl ScriptedPicker {
    pub fn new<I: IntoIterator<Item = Vector2<f64>>>(points: I) -> Self {
        ScriptedPicker {
            points: points.into_iter().collect(),
        }
    }
}

impl PointPicker for ScriptedPicker {
    fn pick(&mut self, _image: &GrayImage, prompt: &str) -> Option<Vector2<f64>> {
        let point = self.points.pop_front();
        if let Some(p) = &point {
            info!("{prompt}: ({:.2}, {:.2})", p.x, p.y);
        }
        point
    }
}

/// Receives the measured endpoints for display.
pub trait EndpointSink {
    fn show(
        &mut self,
        left: &GrayImage,
        right: &GrayImage,
        measurement: &Measurement,
    ) -> Result<(), MeasureError>;
}

/// Writes the rectified pair side by side with the segment drawn on both
/// halves.
#[derive(Debug, Clone)]
pub struct AnnotatedImageWriter {
    path: PathBuf,
}

impl AnnotatedImageWriter {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        AnnotatedImageWriter { path: path.into() }
    }
}

impl EndpointSink for AnnotatedImageWriter {
    fn show(
        &mut self,
        left: &GrayImage,
        right: &GrayImage,
        measurement: &Measurement,
    ) -> Result<(), MeasureError> {
        let mut left_rgb = DynamicImage::ImageLuma8(left.clone()).to_rgb8();
        let mut right_rgb = DynamicImage::ImageLuma8(right.clone()).to_rgb8();
        let [a, b] = measurement.pairs;

        draw_line(&mut left_rgb, &a.left, &b.left, Rgb([255, 255, 0]));
        draw_line(&mut right_rgb, &a.right, &b.right, Rgb([255, 255, 0]));
        for (pair, color) in [(a, Rgb([0, 255, 0])), (b, Rgb([255, 0, 255]))] {
            draw_circle(&mut left_rgb, &pair.left, 3, color);
            draw_circle(&mut right_rgb, &pair.right, 3, color);
        }

        let combined = concat_horizontal(&left_rgb, &right_rgb)?;
        save_image(&combined, &self.path)?;
        Ok(())
    }
}

pub struct Ruler {
    bundle: Arc<RectificationBundle>,
    left: GrayImage,
    right: GrayImage,
    state: RulerState,
    pairs: Vec<PointPair>,
    measurement: Option<Measurement>,
    corner_snap: Option<usize>,
}

impl Ruler {
    /// Starts a session on an already rectified pair.
    ///
    /// # Errors
    ///
    /// [`MeasureError::Image`] if the images do not match the rectified size.
    pub fn new(
        bundle: Arc<RectificationBundle>,
        left: GrayImage,
        right: GrayImage,
    ) -> Result<Self, MeasureError> {
        let size = bundle.image_size;
        for image in [&left, &right] {
            if image.width() != size.width || image.height() != size.height {
                return Err(MeasureError::Image(format!(
                    "expected {}x{} rectified images, got {}x{}",
                    size.width,
                    size.height,
                    image.width(),
                    image.height()
                )));
            }
        }
        Ok(Ruler {
            bundle,
            left,
            right,
            state: RulerState::Idle,
            pairs: Vec::new(),
            measurement: None,
            corner_snap: None,
        })
    }

    /// Rectifies a raw side-by-side frame and starts a session on it.
    pub fn from_frame(rectifier: &Rectifier, frame: &GrayImage) -> Result<Self, MeasureError> {
        let (left, right) = rectifier.rectify_frame(frame)?;
        Self::new(rectifier.bundle(), left, right)
    }

    /// Refines every picked point to the nearest corner within `radius`.
    pub fn with_corner_snap(mut self, radius: usize) -> Self {
        self.corner_snap = Some(radius);
        self
    }

    pub fn state(&self) -> RulerState {
        self.state
    }

    pub fn pairs(&self) -> &[PointPair] {
        &self.pairs
    }

    pub fn measurement(&self) -> Option<&Measurement> {
        self.measurement.as_ref()
    }

    pub fn left(&self) -> &GrayImage {
        &self.left
    }

    pub fn right(&self) -> &GrayImage {
        &self.right
    }

    /// Selects the two endpoints of a segment.
    ///
    /// Both endpoints are picked in the left image. With `automatch` the
    /// right image locations come from `matcher`, otherwise they are picked
    /// as well.
    ///
    /// # Errors
    ///
    /// * [`MeasureError::SelectionCancelled`] if the picker runs out.
    /// * [`MeasureError::NoMatch`] if automatic matching fails.
    ///
    /// Points selected before the error are kept, the state stays `Idle`.
    pub fn click_segment(
        &mut self,
        picker: &mut dyn PointPicker,
        automatch: bool,
        matcher: &CorrespondenceMatcher,
    ) -> Result<(), MeasureError> {
        self.state = RulerState::Idle;
        self.pairs.clear();
        self.measurement = None;

        for label in ["A", "B"] {
            let left = self.pick(picker, true, &format!("Point {label} in the left image"))?;
            let right = if automatch {
                matcher.find_match(&self.left, &self.right, &left)?.point
            } else {
                self.pick(picker, false, &format!("Point {label} in the right image"))?
            };
            self.pairs.push(PointPair { left, right });
        }

        self.state = RulerState::PointsSelected;
        Ok(())
    }

    fn pick(
        &self,
        picker: &mut dyn PointPicker,
        left: bool,
        prompt: &str,
    ) -> Result<Vector2<f64>, MeasureError> {
        let image = if left { &self.left } else { &self.right };
        let mut point = picker
            .pick(image, prompt)
            .ok_or(MeasureError::SelectionCancelled)?;
        if let Some(radius) = self.corner_snap {
            let mut refined = [point];
            corner_subpix(image, &mut refined, radius, 20, 1e-3);
            point = refined[0];
        }
        Ok(point)
    }

    /// Triangulates both endpoints and returns their distance.
    ///
    /// # Errors
    ///
    /// * [`MeasureError::IncompleteSelection`] before two pairs exist.
    /// * [`MeasureError::DegenerateDisparity`] if a right point is not
    ///   strictly left of its left point.
    pub fn measure_segment(&mut self) -> Result<Measurement, MeasureError> {
        if self.state == RulerState::Idle || self.pairs.len() < 2 {
            return Err(MeasureError::IncompleteSelection(self.pairs.len()));
        }
        let pairs = [self.pairs[0], self.pairs[1]];

        let mut points = [Vector3::zeros(); 2];
        for (point, pair) in points.iter_mut().zip(&pairs) {
            let disparity = pair.disparity();
            if !(disparity > 0.0) {
                warn!(
                    "Left ({:.2}, {:.2}) and right ({:.2}, {:.2}) give disparity {disparity:.3}",
                    pair.left.x, pair.left.y, pair.right.x, pair.right.y
                );
                return Err(MeasureError::DegenerateDisparity(disparity));
            }
            *point = self
                .bundle
                .triangulate(&pair.left, disparity)
                .ok_or(MeasureError::DegenerateDisparity(disparity))?;
        }

        let distance = (points[0] - points[1]).norm();
        info!(
            "Segment from ({:.2}, {:.2}, {:.2}) to ({:.2}, {:.2}, {:.2}): {distance:.3}",
            points[0].x, points[0].y, points[0].z, points[1].x, points[1].y, points[1].z
        );

        let measurement = Measurement {
            distance,
            points,
            pairs,
        };
        self.measurement = Some(measurement.clone());
        self.state = RulerState::Measured;
        Ok(measurement)
    }

    /// Hands the last measurement to `sink`. May be called repeatedly.
    pub fn show_endpoints(&self, sink: &mut dyn EndpointSink) -> Result<(), MeasureError> {
        match &self.measurement {
            Some(measurement) => sink.show(&self.left, &self.right, measurement),
            None => Err(MeasureError::IncompleteSelection(self.pairs.len())),
        }
    }
}
