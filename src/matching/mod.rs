//! Left-to-right correspondence search on rectified images.
//!
//! A query point in the left image is described by the square [`Patch`]
//! around it. Candidates are restricted to the [`SearchBand`] of the right
//! image: the same row give or take `vertical_tolerance`, and columns whose
//! disparity lies in `[min_disparity, max_disparity]`. How a candidate is
//! scored is up to the [`MatchStrategy`].

pub mod strategies;

pub use strategies::{BriefStrategy, NccStrategy, SadStrategy};

use image::GrayImage;
use log::debug;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("No match above confidence {min_confidence} (best {best:.3})")]
    NoMatch { best: f64, min_confidence: f64 },
    #[error("Point ({x:.1}, {y:.1}) is too close to the image border for a {size}x{size} patch")]
    OutOfBounds { x: f64, y: f64, size: usize },
}

/// Square window of intensities, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    radius: usize,
    values: Vec<f32>,
}

impl Patch {
    /// Window of `image` centred on pixel `(x, y)`, or `None` if it leaves
    /// the image.
    pub fn extract(image: &GrayImage, x: i64, y: i64, radius: usize) -> Option<Self> {
        let r = radius as i64;
        if x - r < 0 || y - r < 0 || x + r >= image.width() as i64 || y + r >= image.height() as i64
        {
            return None;
        }
        let mut values = Vec::with_capacity((2 * radius + 1) * (2 * radius + 1));
        for yy in (y - r)..=(y + r) {
            for xx in (x - r)..=(x + r) {
                values.push(image.get_pixel(xx as u32, yy as u32)[0] as f32);
            }
        }
        Some(Patch { radius, values })
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Side length in pixels.
    pub fn size(&self) -> usize {
        2 * self.radius + 1
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

/// Candidate window centres in the right image.
#[derive(Debug, Clone)]
pub struct SearchBand<'a> {
    pub image: &'a GrayImage,
    pub rows: RangeInclusive<i64>,
    pub columns: RangeInclusive<i64>,
}

impl SearchBand<'_> {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.columns.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Matched location in the right image, sub-pixel in x.
    pub point: Vector2<f64>,
    /// Strategy score normalised to `[0, 1]`, higher is better.
    pub confidence: f64,
    /// Strategy-specific dissimilarity of the match.
    pub distance: f64,
}

/// A way of scoring candidate windows against a query patch.
pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Best candidate of the band. The caller applies the confidence
    /// threshold.
    fn find_match(&self, patch: &Patch, band: &SearchBand<'_>) -> Result<Correspondence, MatchError>;
}

/// Scans every window of the band, keeps the highest `score` and refines its
/// column with a parabola through the neighbouring scores.
///
/// `score` returns `(confidence, distance)`.
pub(crate) fn best_in_band<F>(
    radius: usize,
    band: &SearchBand<'_>,
    score: F,
) -> Result<Correspondence, MatchError>
where
    F: Fn(&Patch) -> (f64, f64),
{
    let mut best: Option<(i64, i64, f64, f64)> = None;
    let at = |x: i64, y: i64| Patch::extract(band.image, x, y, radius).map(|w| score(&w));

    for y in band.rows.clone() {
        for x in band.columns.clone() {
            if let Some((confidence, distance)) = at(x, y) {
                if best.map_or(true, |(_, _, c, _)| confidence > c) {
                    best = Some((x, y, confidence, distance));
                }
            }
        }
    }

    let (x, y, confidence, distance) = best.ok_or(MatchError::NoMatch {
        best: 0.0,
        min_confidence: 0.0,
    })?;

    let mut offset = 0.0;
    if let (Some((left, _)), Some((right, _))) = (at(x - 1, y), at(x + 1, y)) {
        let curvature = left - 2.0 * confidence + right;
        if curvature < 0.0 {
            offset = (0.5 * (left - right) / curvature).clamp(-0.5, 0.5);
        }
    }

    Ok(Correspondence {
        point: Vector2::new(x as f64 + offset, y as f64),
        confidence,
        distance,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Ncc,
    Sad,
    Brief,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn MatchStrategy> {
        match self {
            StrategyKind::Ncc => Box::new(NccStrategy),
            StrategyKind::Sad => Box::new(SadStrategy),
            StrategyKind::Brief => Box::new(BriefStrategy::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub strategy: StrategyKind,
    /// Half size of the compared windows.
    pub patch_radius: usize,
    /// Rows above and below the query row that are searched.
    pub vertical_tolerance: usize,
    pub min_disparity: usize,
    pub max_disparity: usize,
    pub min_confidence: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig {
            strategy: StrategyKind::Ncc,
            patch_radius: 7,
            vertical_tolerance: 2,
            min_disparity: 0,
            max_disparity: 256,
            min_confidence: 0.8,
        }
    }
}

pub struct CorrespondenceMatcher {
    config: MatcherConfig,
    strategy: Box<dyn MatchStrategy>,
}

impl CorrespondenceMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        let strategy = config.strategy.build();
        CorrespondenceMatcher { config, strategy }
    }

    /// Uses `strategy` instead of the one named in `config`.
    pub fn with_strategy(config: MatcherConfig, strategy: Box<dyn MatchStrategy>) -> Self {
        CorrespondenceMatcher { config, strategy }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// The epipolar band of `point`, clipped to valid window centres.
    pub fn search_band<'a>(&self, point: &Vector2<f64>, right: &'a GrayImage) -> SearchBand<'a> {
        let r = self.config.patch_radius as i64;
        let x = point.x.round() as i64;
        let y = point.y.round() as i64;
        let tol = self.config.vertical_tolerance as i64;
        let rows = (y - tol).max(r)..=(y + tol).min(right.height() as i64 - 1 - r);
        let columns = (x - self.config.max_disparity as i64).max(r)
            ..=(x - self.config.min_disparity as i64).min(right.width() as i64 - 1 - r);
        SearchBand {
            image: right,
            rows,
            columns,
        }
    }

    /// Finds the right-image location of `point` from the left image.
    ///
    /// # Errors
    ///
    /// * [`MatchError::OutOfBounds`] if the query patch leaves the left image.
    /// * [`MatchError::NoMatch`] if the band is empty or the best candidate
    ///   scores below `min_confidence`.
    pub fn find_match(
        &self,
        left: &GrayImage,
        right: &GrayImage,
        point: &Vector2<f64>,
    ) -> Result<Correspondence, MatchError> {
        let radius = self.config.patch_radius;
        let patch = Patch::extract(left, point.x.round() as i64, point.y.round() as i64, radius)
            .ok_or(MatchError::OutOfBounds {
                x: point.x,
                y: point.y,
                size: 2 * radius + 1,
            })?;

        let band = self.search_band(point, right);
        let no_match = |best: f64| MatchError::NoMatch {
            best,
            min_confidence: self.config.min_confidence,
        };
        if band.is_empty() {
            return Err(no_match(0.0));
        }

        let found = self
            .strategy
            .find_match(&patch, &band)
            .map_err(|_| no_match(0.0))?;
        debug!(
            "{} match for ({:.1}, {:.1}): ({:.2}, {:.2}) confidence {:.3}",
            self.strategy.name(),
            point.x,
            point.y,
            found.point.x,
            found.point.y,
            found.confidence
        );
        if found.confidence < self.config.min_confidence {
            return Err(no_match(found.confidence));
        }
        Ok(found)
    }
}
