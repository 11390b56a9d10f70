//! Per-camera lens models and the stereo rig record.
//!
//! A single camera is described by its [`Intrinsics`] (focal lengths and
//! principal point), its [`Resolution`] and a set of distortion coefficients
//! whose meaning depends on the lens family. Two families are supported:
//!
//! * [`RadTanModel`]: pinhole with polynomial radial-tangential distortion
//!   `[k1, k2, p1, p2, k3]`.
//! * [`KannalaBrandtModel`]: fisheye / equidistant distortion `[k1, k2, k3, k4]`.
//!
//! Both implement [`LensModel`], and [`Lens`] selects one of them at runtime
//! from the `is_fisheye` flag of the rig. The rig itself ([`CameraModel`])
//! lives in [`rig`].

use nalgebra::{Matrix3, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod kannala_brandt;
pub mod rad_tan;
pub mod rig;

pub use kannala_brandt::KannalaBrandtModel;
pub use rad_tan::RadTanModel;
pub use rig::{
    CalibratedRig, CalibrationState, CameraModel, Extrinsics, LoadedModel, StereoIntrinsics,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Reads `fx, fy, cx, cy` from a 3x3 camera matrix. Skew is ignored.
    pub fn from_matrix(k: &Matrix3<f64>) -> Self {
        Intrinsics {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        }
    }

    /// The 3x3 camera matrix `K`.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn contains(&self, point: &Vector2<f64>) -> bool {
        point.x >= 0.0
            && point.x < self.width as f64
            && point.y >= 0.0
            && point.y < self.height as f64
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("Projection is outside the image")]
    ProjectionOutSideImage,
    #[error("Input point is outside the image")]
    PointIsOutSideImage,
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error: {0}")]
    NumericalError(String),
    #[error("Camera model record is missing mandatory field `{0}`")]
    MissingCameraInfo(String),
    #[error("Camera model is not fully calibrated")]
    NotCalibrated,
    #[error("Failed to parse YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CameraModelError {
    fn from(err: serde_yaml::Error) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

/// Behaviour shared by every lens family.
pub trait LensModel {
    /// Projects a camera-frame point to pixel coordinates without checking the
    /// image bounds. Used by the remap tables, which sample outside the frame.
    fn project_ray(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Removes the lens distortion of a pixel and returns the ray `(x, y, 1)`
    /// on the normalized image plane. No bounds check is performed.
    fn unproject_pixel(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_resolution(&self) -> Resolution;

    fn get_intrinsics(&self) -> Intrinsics;

    fn get_distortion(&self) -> Vec<f64>;

    /// Project a 3D point to 2D image coordinates
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let pixel = self.project_ray(point_3d)?;
        if !self.get_resolution().contains(&pixel) {
            return Err(CameraModelError::ProjectionOutSideImage);
        }
        Ok(pixel)
    }

    /// Unproject 2D image coordinates to a unit-length 3D ray
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if !self.get_resolution().contains(point_2d) {
            return Err(CameraModelError::PointIsOutSideImage);
        }
        Ok(self.unproject_pixel(point_2d)?.normalize())
    }
}

/// The lens of one camera of the rig, chosen by the rig's `is_fisheye` flag.
#[derive(Debug, Clone, PartialEq)]
pub enum Lens {
    RadTan(RadTanModel),
    KannalaBrandt(KannalaBrandtModel),
}

impl Lens {
    /// Builds a lens of the family selected by `is_fisheye` and validates it.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidParams`] if `distortion` does not hold 5
    ///   (pinhole) or 4 (fisheye) coefficients.
    /// * Intrinsic validation errors from [`validation::validate_intrinsics`].
    pub fn new(
        is_fisheye: bool,
        intrinsics: Intrinsics,
        distortion: &[f64],
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let lens = if is_fisheye {
            let distortions: [f64; 4] = distortion.try_into().map_err(|_| {
                CameraModelError::InvalidParams(format!(
                    "fisheye lens expects 4 distortion coefficients, got {}",
                    distortion.len()
                ))
            })?;
            Lens::KannalaBrandt(KannalaBrandtModel {
                intrinsics,
                resolution,
                distortions,
            })
        } else {
            let distortions: [f64; 5] = distortion.try_into().map_err(|_| {
                CameraModelError::InvalidParams(format!(
                    "pinhole lens expects 5 distortion coefficients, got {}",
                    distortion.len()
                ))
            })?;
            Lens::RadTan(RadTanModel {
                intrinsics,
                resolution,
                distortions,
            })
        };
        lens.validate_params()?;
        Ok(lens)
    }

    /// An undistorted lens with the given intrinsics.
    pub fn ideal(
        is_fisheye: bool,
        intrinsics: Intrinsics,
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let zeros = vec![0.0; distortion_len(is_fisheye)];
        Lens::new(is_fisheye, intrinsics, &zeros, resolution)
    }

    pub fn is_fisheye(&self) -> bool {
        matches!(self, Lens::KannalaBrandt(_))
    }

    /// Camera matrix `K` of this lens.
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.get_intrinsics().matrix()
    }

    fn inner(&self) -> &dyn LensModel {
        match self {
            Lens::RadTan(model) => model,
            Lens::KannalaBrandt(model) => model,
        }
    }
}

impl LensModel for Lens {
    fn project_ray(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        self.inner().project_ray(point_3d)
    }

    fn unproject_pixel(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        self.inner().unproject_pixel(point_2d)
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        self.inner().validate_params()
    }

    fn get_resolution(&self) -> Resolution {
        self.inner().get_resolution()
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.inner().get_intrinsics()
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.inner().get_distortion()
    }
}

/// Number of distortion coefficients used by a lens family.
pub fn distortion_len(is_fisheye: bool) -> usize {
    if is_fisheye {
        4
    } else {
        5
    }
}

/// Maps a camera-frame point to distorted normalized image coordinates.
///
/// Generic over the scalar so the same expression drives both the `f64`
/// lens models and the automatic differentiation inside the optimizer.
pub(crate) fn distort_point<T: RealField>(
    is_fisheye: bool,
    point: [T; 3],
    distortion: &[T],
) -> (T, T) {
    if is_fisheye {
        kannala_brandt::distort_point(point, distortion)
    } else {
        rad_tan::distort_point(point, distortion)
    }
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0) {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    pub fn validate_distortion(distortion: &[f64]) -> Result<(), CameraModelError> {
        if distortion.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 500.0,
            fy: 505.0,
            cx: 320.0,
            cy: 240.0,
        }
    }

    const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };

    #[test]
    fn test_lens_selects_family_from_flag() {
        let pinhole = Lens::new(false, intrinsics(), &[0.1, 0.0, 0.0, 0.0, 0.0], VGA).unwrap();
        assert!(!pinhole.is_fisheye());
        let fisheye = Lens::new(true, intrinsics(), &[0.1, 0.0, 0.0, 0.0], VGA).unwrap();
        assert!(fisheye.is_fisheye());
    }

    #[test]
    fn test_lens_rejects_wrong_distortion_length() {
        let err = Lens::new(true, intrinsics(), &[0.0; 5], VGA).unwrap_err();
        assert!(matches!(err, CameraModelError::InvalidParams(_)));
        let err = Lens::new(false, intrinsics(), &[0.0; 4], VGA).unwrap_err();
        assert!(matches!(err, CameraModelError::InvalidParams(_)));
    }

    #[test]
    fn test_lens_rejects_bad_focal_length() {
        let mut bad = intrinsics();
        bad.fx = 0.0;
        let err = Lens::ideal(false, bad, VGA).unwrap_err();
        assert!(matches!(err, CameraModelError::FocalLengthMustBePositive));
    }

    #[test]
    fn test_intrinsics_matrix_round_trip() {
        let k = intrinsics().matrix();
        assert_eq!(Intrinsics::from_matrix(&k), intrinsics());
    }

    #[test]
    fn test_bounded_projection() {
        let lens = Lens::ideal(false, intrinsics(), VGA).unwrap();
        assert!(lens.project(&Vector3::new(0.0, 0.0, 1.0)).is_ok());
        let far_left = Vector3::new(-10.0, 0.0, 1.0);
        assert!(matches!(
            lens.project(&far_left),
            Err(CameraModelError::ProjectionOutSideImage)
        ));
        assert!(lens.project_ray(&far_left).is_ok());
        assert!(matches!(
            lens.unproject(&Vector2::new(-1.0, 10.0)),
            Err(CameraModelError::PointIsOutSideImage)
        ));
    }
}
