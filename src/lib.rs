//! Stereo Ruler Library
//!
//! Metric point-to-point measurement with a calibrated two-camera rig. The
//! pipeline runs from checkerboard images to distances:
//! - Corner detection and single/stereo calibration of the rig
//!   (pinhole with radial-tangential distortion, or Kannala-Brandt fisheye)
//! - Rectification maps and the disparity-to-depth matrix `Q`
//! - Correspondence search along rectified scanlines
//! - Triangulation of a user-selected segment
//!
//! Non-linear refinement uses the tiny-solver optimization framework.

pub mod calibration;
pub mod camera;
pub mod dataset;
pub mod geometry;
pub mod matching;
pub mod optimization;
pub mod rectification;
pub mod ruler;
pub mod util;

// Re-export commonly used types
pub use calibration::{
    BoardGeometry, CalibrationError, CalibrationOptions, Calibrator, CameraSide,
    IntrinsicsHandling,
};
pub use camera::{
    CalibratedRig, CameraModel, CameraModelError, Intrinsics, Lens, LensModel, LoadedModel,
    Resolution,
};
pub use matching::{CorrespondenceMatcher, MatchError, MatchStrategy, MatcherConfig};
pub use optimization::Optimizer;
pub use rectification::{RectificationBundle, RectificationError, Rectifier};
pub use ruler::{MeasureError, Measurement, Ruler, RulerState};
