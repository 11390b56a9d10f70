//! Implements the Kannala-Brandt fisheye lens model.
//!
//! The model maps the angle of incidence `theta` to a distorted radius
//! `theta_d = theta (1 + k1 theta^2 + k2 theta^4 + k3 theta^6 + k4 theta^8)`
//! on the normalized image plane. It is used by the rig whenever
//! `is_fisheye` is set.

use crate::camera::{validation, CameraModelError, Intrinsics, LensModel, Resolution};
use nalgebra::{RealField, Vector2, Vector3};
use std::fmt;

/// A fisheye camera following the Kannala-Brandt (equidistant) projection.
#[derive(Clone, PartialEq)]
pub struct KannalaBrandtModel {
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
    /// `[k1, k2, k3, k4]`
    pub distortions: [f64; 4],
}

impl fmt::Debug for KannalaBrandtModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KannalaBrandtModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

/// Distorted normalized coordinates of a camera-frame point.
pub(crate) fn distort_point<T: RealField>(point: [T; 3], distortion: &[T]) -> (T, T) {
    let [x, y, z] = point;
    let r2 = x.clone() * x.clone() + y.clone() * y.clone();

    // Near the optical axis theta_d / r tends to 1 / z.
    let epsilon: T = nalgebra::convert(f64::EPSILON);
    if r2 < epsilon {
        return (x / z.clone(), y / z);
    }

    let r = r2.sqrt();
    let theta = r.clone().atan2(z);
    let theta2 = theta.clone() * theta.clone();

    let k1 = distortion[0].clone();
    let k2 = distortion[1].clone();
    let k3 = distortion[2].clone();
    let k4 = distortion[3].clone();
    let poly = T::one()
        + theta2.clone()
            * (k1 + theta2.clone() * (k2 + theta2.clone() * (k3 + theta2 * k4)));
    let theta_d = theta * poly;

    (theta_d.clone() * x / r.clone(), theta_d * y / r)
}

impl KannalaBrandtModel {
    /// Inverts `theta_d(theta)` with Newton's method.
    fn solve_theta(&self, theta_d: f64) -> Result<f64, CameraModelError> {
        let [k1, k2, k3, k4] = self.distortions;
        const EPS: f64 = 1e-12;
        const MAX_ITERATIONS: u32 = 50;

        let mut theta = theta_d;
        for _ in 0..MAX_ITERATIONS {
            let t2 = theta * theta;
            let t4 = t2 * t2;
            let t6 = t4 * t2;
            let t8 = t4 * t4;
            let f = theta * (1.0 + k1 * t2 + k2 * t4 + k3 * t6 + k4 * t8) - theta_d;
            let df = 1.0 + 3.0 * k1 * t2 + 5.0 * k2 * t4 + 7.0 * k3 * t6 + 9.0 * k4 * t8;
            if df.abs() < EPS {
                return Err(CameraModelError::NumericalError(
                    "fisheye distortion is not invertible at this radius".to_string(),
                ));
            }
            let step = f / df;
            theta -= step;
            if step.abs() < EPS {
                return Ok(theta);
            }
        }
        Err(CameraModelError::NumericalError(format!(
            "fisheye unprojection did not converge after {MAX_ITERATIONS} iterations"
        )))
    }
}

impl LensModel for KannalaBrandtModel {
    fn project_ray(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        let (xd, yd) = distort_point([point_3d.x, point_3d.y, point_3d.z], &self.distortions);
        Ok(Vector2::new(
            self.intrinsics.fx * xd + self.intrinsics.cx,
            self.intrinsics.fy * yd + self.intrinsics.cy,
        ))
    }

    /// Returns the undistorted ray scaled to `z = 1`.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::NumericalError`] if the angle cannot be recovered
    ///   or lies at or beyond 90 degrees, where no point with positive depth exists.
    fn unproject_pixel(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let mx = (point_2d.x - self.intrinsics.cx) / self.intrinsics.fx;
        let my = (point_2d.y - self.intrinsics.cy) / self.intrinsics.fy;
        let theta_d = (mx * mx + my * my).sqrt();
        if theta_d < f64::EPSILON {
            return Ok(Vector3::new(0.0, 0.0, 1.0));
        }

        let theta = self.solve_theta(theta_d)?;
        if !(0.0..std::f64::consts::FRAC_PI_2).contains(&theta) {
            return Err(CameraModelError::NumericalError(format!(
                "incidence angle {theta} has no forward-facing ray"
            )));
        }
        let scale = theta.tan() / theta_d;
        Ok(Vector3::new(mx * scale, my * scale, 1.0))
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

    /// The coefficients are returned in the order: `[k1, k2, k3, k4]`.
    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn model() -> KannalaBrandtModel {
        KannalaBrandtModel {
            intrinsics: Intrinsics {
                fx: 190.978,
                fy: 190.973,
                cx: 254.932,
                cy: 256.897,
            },
            resolution: Resolution {
                width: 512,
                height: 512,
            },
            distortions: [0.0034823, 0.000715, -0.0020532, 0.0002029],
        }
    }

    #[test]
    fn test_kb_project_unproject() {
        let model = model();
        let points = [
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.5, -0.3, 2.0),
            Vector3::new(1.5, 0.2, 1.0),
            Vector3::new(-0.8, -0.9, 0.6),
        ];
        for point in &points {
            let pixel = model.project(point).unwrap();
            let ray = model.unproject(&pixel).unwrap();
            assert_relative_eq!(ray, point.normalize(), epsilon = 1e-8);
        }
    }

    #[test]
    fn test_kb_axis_point_projects_to_principal_point() {
        let model = model();
        let pixel = model.project(&Vector3::new(0.0, 0.0, 3.0)).unwrap();
        assert_relative_eq!(pixel.x, model.intrinsics.cx);
        assert_relative_eq!(pixel.y, model.intrinsics.cy);
    }

    #[test]
    fn test_kb_zero_distortion_is_equidistant() {
        let mut model = model();
        model.distortions = [0.0; 4];
        let angle: f64 = 0.7;
        let pixel = model
            .project_ray(&Vector3::new(angle.tan(), 0.0, 1.0))
            .unwrap();
        assert_relative_eq!(
            pixel.x,
            model.intrinsics.fx * angle + model.intrinsics.cx,
            epsilon = 1e-9
        );
    }
}
