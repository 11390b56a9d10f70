//! Implements the Radial-Tangential (RadTan) lens model.
//!
//! This is the standard pinhole camera with polynomial lens distortion, used
//! by the rig whenever `is_fisheye` is false. The coefficient order follows
//! the common `[k1, k2, p1, p2, k3]` convention.

use crate::camera::{validation, CameraModelError, Intrinsics, LensModel, Resolution};
use nalgebra::{Matrix2, RealField, Vector2, Vector3};
use std::fmt;

/// A pinhole camera with radial and tangential distortion.
///
/// *   `k1`, `k2`, `k3`: Radial distortion coefficients.
/// *   `p1`, `p2`: Tangential distortion coefficients.
///
/// # Examples
///
/// ```rust
/// use nalgebra::Vector3;
/// use stereo_ruler::camera::rad_tan::RadTanModel;
/// use stereo_ruler::camera::{Intrinsics, LensModel, Resolution};
///
/// let model = RadTanModel {
///     intrinsics: Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 },
///     resolution: Resolution { width: 640, height: 480 },
///     distortions: [0.1, -0.05, 0.001, 0.001, 0.02],
/// };
/// let pixel = model.project(&Vector3::new(0.1, 0.2, 1.0)).unwrap();
/// assert!(pixel.x > 320.0 && pixel.y > 240.0);
/// ```
#[derive(Clone, PartialEq)]
pub struct RadTanModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// The 5 distortion coefficients: `[k1, k2, p1, p2, k3]`.
    pub distortions: [f64; 5],
}

/// Provides a debug string representation for [`RadTanModel`].
impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

/// Applies radial-tangential distortion to a camera-frame point and returns
/// the distorted normalized coordinates.
pub(crate) fn distort_point<T: RealField>(point: [T; 3], distortion: &[T]) -> (T, T) {
    let [x, y, z] = point;
    let k1 = distortion[0].clone();
    let k2 = distortion[1].clone();
    let p1 = distortion[2].clone();
    let p2 = distortion[3].clone();
    let k3 = distortion[4].clone();

    let xp = x / z.clone();
    let yp = y / z;
    let two = T::one() + T::one();

    let r2 = xp.clone() * xp.clone() + yp.clone() * yp.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();
    let radial = T::one() + k1 * r2.clone() + k2 * r4 + k3 * r6;
    let xy = xp.clone() * yp.clone();

    let xd = xp.clone() * radial.clone()
        + two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * xp.clone() * xp);
    let yd = yp.clone() * radial
        + p1 * (r2 + two.clone() * yp.clone() * yp)
        + two * p2 * xy;
    (xd, yd)
}

impl LensModel for RadTanModel {
    /// Projects a 3D point to pixel coordinates, applying distortion.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: If the 3D point's Z-coordinate is too close to zero.
    fn project_ray(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        // If z is very small, the point is at the camera center
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let (xd, yd) = distort_point([point_3d.x, point_3d.y, point_3d.z], &self.distortions);
        Ok(Vector2::new(
            self.intrinsics.fx * xd + self.intrinsics.cx,
            self.intrinsics.fy * yd + self.intrinsics.cy,
        ))
    }

    /// Removes distortion from a pixel with Newton's method.
    ///
    /// Starting from the distorted normalized point, the undistorted estimate
    /// is refined with the analytic 2x2 Jacobian of the distortion function
    /// until either the residual or the step falls below `1e-10`.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::NumericalError`]: If the Jacobian becomes singular
    ///   or the iteration does not converge.
    fn unproject_pixel(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let [k1, k2, p1, p2, k3] = self.distortions;

        // This is the target point in the normalized image plane we want to match
        let target = Vector2::new(
            (point_2d.x - self.intrinsics.cx) / self.intrinsics.fx,
            (point_2d.y - self.intrinsics.cy) / self.intrinsics.fy,
        );

        let mut point = target;

        const EPS: f64 = 1e-10;
        const MAX_ITERATIONS: u32 = 100;

        let mut converged = false;
        for _ in 0..MAX_ITERATIONS {
            let x = point.x;
            let y = point.y;
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

            let estimate = Vector2::new(
                x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
                y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
            );
            let error = estimate - target;
            if error.norm() < EPS {
                converged = true;
                break;
            }

            // d(radial)/dx = (k1 + 2 k2 r^2 + 3 k3 r^4) * 2x
            let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;
            let d_radial_dx = d_radial * 2.0 * x;
            let d_radial_dy = d_radial * 2.0 * y;

            let j00 = radial + x * d_radial_dx + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = x * d_radial_dy + 2.0 * p1 * x + 2.0 * p2 * y;
            let j10 = y * d_radial_dx + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + y * d_radial_dy + 6.0 * p1 * y + 2.0 * p2 * x;
            let jacobian = Matrix2::new(j00, j01, j10, j11);

            let inv_jacobian = jacobian.try_inverse().ok_or_else(|| {
                CameraModelError::NumericalError("Jacobian is singular".to_string())
            })?;
            let delta = inv_jacobian * error;
            point -= delta;

            if delta.norm() < EPS {
                converged = true;
                break;
            }
        }

        if !converged {
            return Err(CameraModelError::NumericalError(format!(
                "Unprojection did not converge after {MAX_ITERATIONS} iterations."
            )));
        }

        Ok(Vector3::new(point.x, point.y, 1.0))
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_distortion(&self.distortions)
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics.clone()
    }

    /// The coefficients are returned in the order: `[k1, k2, p1, p2, k3]`.
    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn model() -> RadTanModel {
        RadTanModel {
            intrinsics: Intrinsics {
                fx: 461.629,
                fy: 460.152,
                cx: 362.680,
                cy: 246.049,
            },
            resolution: Resolution {
                width: 752,
                height: 480,
            },
            distortions: [-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05, 0.0],
        }
    }

    #[test]
    fn test_radtan_project_unproject() {
        let model = model();
        let point_3d = Vector3::new(0.5, -0.3, 2.0);
        let norm_3d = point_3d.normalize();

        let point_2d = model.project(&point_3d).unwrap();
        assert!(point_2d.x >= 0.0 && point_2d.x < model.resolution.width as f64);
        assert!(point_2d.y >= 0.0 && point_2d.y < model.resolution.height as f64);

        let ray = model.unproject(&point_2d).unwrap();
        assert_relative_eq!(ray, norm_3d, epsilon = 1e-6);
    }

    #[test]
    fn test_radtan_multiple_points() {
        let model = model();
        let test_points = [
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.4, 0.0, 1.0),
            Vector3::new(-0.4, 0.0, 1.0),
            Vector3::new(0.0, 0.4, 1.0),
            Vector3::new(0.3, -0.3, 1.0),
            Vector3::new(0.1, 0.1, 2.0),
        ];

        for original in &test_points {
            let pixel = model.project(original).unwrap();
            let ray = model.unproject(&pixel).unwrap();
            let dot = original.normalize().dot(&ray);
            assert!(dot > 0.999999, "direction mismatch for {original:?}: {dot}");
        }
    }

    #[test]
    fn test_radtan_tangential_only() {
        let mut model = model();
        model.distortions = [0.0, 0.0, 0.01, -0.02, 0.0];
        let pixel = Vector2::new(100.0, 50.0);
        let ray = model.unproject_pixel(&pixel).unwrap();
        let back = model.project_ray(&ray).unwrap();
        assert_relative_eq!(back, pixel, epsilon = 1e-6);
    }

    #[test]
    fn test_radtan_point_behind_camera() {
        let result = model().project(&Vector3::new(0.1, 0.1, 0.0));
        assert!(matches!(result, Err(CameraModelError::PointAtCameraCenter)));
    }
}
