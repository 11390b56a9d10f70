//! Stereo rectification.
//!
//! Both cameras are rotated half-way towards each other and then about the
//! baseline so that it becomes the rectified x axis (Bouguet's method). The
//! rectified views share one focal length and one principal point, so a
//! scene point lands on the same row in both images and its depth follows
//! from the column difference through `Q`.
//!
//! A [`RectificationBundle`] is an immutable snapshot. [`Rectifier`] holds it
//! behind an [`Arc`] and swaps it wholesale on rebuild.

use crate::camera::{CalibratedRig, CameraModel, CameraModelError, Lens, LensModel, Resolution};
use crate::calibration::CameraSide;
use crate::geometry::{rodrigues, rotation_to_vector};
use crate::util::{save_image, split_side_by_side, load_gray_image, UtilError};

use image::{GrayImage, ImageBuffer, Pixel};
use log::{debug, info};
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector2, Vector3, Vector4};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum RectificationError {
    #[error("Camera model is not calibrated")]
    NotCalibrated,
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    #[error("Image error: {0}")]
    Image(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

impl From<UtilError> for RectificationError {
    fn from(e: UtilError) -> Self {
        match e {
            UtilError::InvalidParams(msg) => RectificationError::InvalidFrame(msg),
            UtilError::Io(e) => RectificationError::Io(e),
            UtilError::Image(e) => RectificationError::Image(e.to_string()),
        }
    }
}

/// Source pixel of every destination pixel. Entries outside the source
/// image, including `-1` for rays the lens cannot image, sample as zero.
#[derive(Debug, Clone, PartialEq)]
pub struct RemapTable {
    width: u32,
    height: u32,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
}

impl RemapTable {
    /// Fills the table row-parallel from a destination-to-source mapping.
    pub fn from_fn<F>(resolution: Resolution, f: F) -> Self
    where
        F: Fn(u32, u32) -> Option<Vector2<f64>> + Sync,
    {
        let width = resolution.width;
        let height = resolution.height;
        let mut map_x = vec![-1.0f32; (width * height) as usize];
        let mut map_y = vec![-1.0f32; (width * height) as usize];
        map_x
            .par_chunks_mut(width as usize)
            .zip(map_y.par_chunks_mut(width as usize))
            .enumerate()
            .for_each(|(v, (row_x, row_y))| {
                for u in 0..width {
                    if let Some(source) = f(u, v as u32) {
                        row_x[u as usize] = source.x as f32;
                        row_y[u as usize] = source.y as f32;
                    }
                }
            });
        RemapTable {
            width,
            height,
            map_x,
            map_y,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn source(&self, u: u32, v: u32) -> (f32, f32) {
        let idx = (v * self.width + u) as usize;
        (self.map_x[idx], self.map_y[idx])
    }

    /// Warps `src` with bilinear sampling and a constant-zero border.
    pub fn remap<P>(&self, src: &ImageBuffer<P, Vec<u8>>) -> ImageBuffer<P, Vec<u8>>
    where
        P: Pixel<Subpixel = u8>,
    {
        let channels = P::CHANNEL_COUNT as usize;
        let (src_w, src_h) = src.dimensions();
        let raw = src.as_raw();
        let mut out: ImageBuffer<P, Vec<u8>> = ImageBuffer::new(self.width, self.height);
        let row_len = self.width as usize * channels;
        out.par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(v, row)| {
                for u in 0..self.width as usize {
                    let idx = v * self.width as usize + u;
                    let sx = self.map_x[idx];
                    let sy = self.map_y[idx];
                    if !(sx >= 0.0
                        && sy >= 0.0
                        && sx <= (src_w - 1) as f32
                        && sy <= (src_h - 1) as f32)
                    {
                        continue;
                    }
                    let x0 = sx.floor() as usize;
                    let y0 = sy.floor() as usize;
                    let x1 = (x0 + 1).min(src_w as usize - 1);
                    let y1 = (y0 + 1).min(src_h as usize - 1);
                    let ax = sx - x0 as f32;
                    let ay = sy - y0 as f32;
                    for c in 0..channels {
                        let at = |x: usize, y: usize| {
                            raw[(y * src_w as usize + x) * channels + c] as f32
                        };
                        let top = at(x0, y0) * (1.0 - ax) + at(x1, y0) * ax;
                        let bottom = at(x0, y1) * (1.0 - ax) + at(x1, y1) * ax;
                        let value = top * (1.0 - ay) + bottom * ay;
                        row[u * channels + c] = value.round().clamp(0.0, 255.0) as u8;
                    }
                }
            });
        out
    }
}

/// Everything derived from a calibrated rig for rectification.
#[derive(Debug, Clone, PartialEq)]
pub struct RectificationBundle {
    pub image_size: Resolution,
    /// Rotation from the raw to the rectified left camera frame.
    pub r1: Matrix3<f64>,
    pub r2: Matrix3<f64>,
    /// Projection of rectified left camera coordinates.
    pub p1: Matrix3x4<f64>,
    /// Projection of rectified left camera coordinates into the right image.
    pub p2: Matrix3x4<f64>,
    /// Maps `(x, y, disparity, 1)` to homogeneous rectified left coordinates.
    pub q: Matrix4<f64>,
    pub left_map: RemapTable,
    pub right_map: RemapTable,
    left: Lens,
    right: Lens,
}

impl RectificationBundle {
    pub fn focal_length(&self) -> f64 {
        self.p1[(0, 0)]
    }

    pub fn principal_point(&self) -> Vector2<f64> {
        Vector2::new(self.p1[(0, 2)], self.p1[(1, 2)])
    }

    /// Signed baseline along the rectified x axis.
    pub fn baseline(&self) -> f64 {
        self.p2[(0, 3)] / self.p2[(0, 0)]
    }

    /// Maps a raw pixel of one camera into its rectified image.
    pub fn rectify_point(
        &self,
        side: CameraSide,
        pixel: &Vector2<f64>,
    ) -> Result<Vector2<f64>, RectificationError> {
        let (lens, rotation) = match side {
            CameraSide::Left => (&self.left, &self.r1),
            CameraSide::Right => (&self.right, &self.r2),
        };
        let ray = rotation * lens.unproject_pixel(pixel)?;
        if ray.z <= f64::EPSILON {
            return Err(CameraModelError::PointAtCameraCenter.into());
        }
        let f = self.focal_length();
        let c = self.principal_point();
        Ok(Vector2::new(f * ray.x / ray.z + c.x, f * ray.y / ray.z + c.y))
    }

    /// Rectified left camera coordinates of a left pixel with the given
    /// disparity. Returns `None` for a zero disparity.
    pub fn triangulate(&self, left: &Vector2<f64>, disparity: f64) -> Option<Vector3<f64>> {
        let h = self.q * Vector4::new(left.x, left.y, disparity, 1.0);
        if h.w.abs() <= f64::EPSILON {
            return None;
        }
        Some(Vector3::new(h.x / h.w, h.y / h.w, h.z / h.w))
    }
}

/// Computes the rectification of a calibrated rig.
///
/// # Errors
///
/// [`RectificationError::NotCalibrated`] unless the model holds intrinsics
/// and extrinsics.
pub fn build_rectification(model: &CameraModel) -> Result<RectificationBundle, RectificationError> {
    let rig = model
        .calibrated()
        .map_err(|_| RectificationError::NotCalibrated)?;
    rectify_rig(&rig)
}

/// Largest half field of view kept in the rectified image of a fisheye rig.
const FISHEYE_MAX_HALF_FOV: f64 = std::f64::consts::FRAC_PI_3;

/// Computes the rectification of a rig whose geometry is complete.
///
/// Pinhole rigs keep the smallest focal length of both cameras. Fisheye rigs
/// pick the focal length that fits the field of view seen at the image edge
/// midpoints, bounded by [`FISHEYE_MAX_HALF_FOV`], into the rectified image.
///
/// # Errors
///
/// [`CameraModelError::InvalidParams`] for an empty image size, a zero
/// baseline or a baseline that is mostly vertical.
pub fn rectify_rig(rig: &CalibratedRig) -> Result<RectificationBundle, RectificationError> {
    let size = rig.image_size;
    if size.width < 2 || size.height < 2 {
        return Err(CameraModelError::InvalidParams(format!(
            "image size {}x{} is too small to rectify",
            size.width, size.height
        ))
        .into());
    }

    // Split the relative rotation between both cameras.
    let om = rotation_to_vector(&rig.rotation);
    let r_half = rodrigues(&(-om * 0.5));
    let t = r_half * rig.translation;
    if t.y.abs() >= t.x.abs() {
        return Err(CameraModelError::InvalidParams(
            "only horizontal stereo baselines can be rectified".to_string(),
        )
        .into());
    }

    // Rotate the baseline onto the x axis.
    let uu = Vector3::new(t.x.signum(), 0.0, 0.0);
    let mut ww = t.cross(&uu);
    let nw = ww.norm();
    if nw > 0.0 {
        ww *= (t.x.abs() / t.norm()).acos() / nw;
    }
    let w_r = rodrigues(&ww);
    let r1 = w_r * r_half.transpose();
    let r2 = w_r * r_half;
    let tx = (r2 * rig.translation).x;
    if tx.abs() <= f64::EPSILON {
        return Err(CameraModelError::InvalidParams(
            "stereo baseline has zero length".to_string(),
        )
        .into());
    }

    let w = (size.width - 1) as f64;
    let h = (size.height - 1) as f64;
    let border = [
        Vector2::new(0.0, 0.0),
        Vector2::new(w / 2.0, 0.0),
        Vector2::new(w, 0.0),
        Vector2::new(w, h / 2.0),
        Vector2::new(w, h),
        Vector2::new(w / 2.0, h),
        Vector2::new(0.0, h),
        Vector2::new(0.0, h / 2.0),
    ];

    let (f, max_angle) = if rig.is_fisheye {
        let half_fov = |lens: &Lens, pixel: Vector2<f64>| {
            lens.unproject_pixel(&pixel)
                .map(|ray| incidence_angle(&ray))
                .unwrap_or(std::f64::consts::FRAC_PI_2)
                .min(FISHEYE_MAX_HALF_FOV)
        };
        let mut f = f64::INFINITY;
        for lens in [&rig.left, &rig.right] {
            let c = lens.get_intrinsics();
            for (pixel, half_extent) in [
                (Vector2::new(0.0, c.cy), c.cx),
                (Vector2::new(w, c.cy), w - c.cx),
                (Vector2::new(c.cx, 0.0), c.cy),
                (Vector2::new(c.cx, h), h - c.cy),
            ] {
                let angle = half_fov(lens, pixel);
                if angle > f64::EPSILON && half_extent > 0.0 {
                    f = f.min(half_extent / angle.tan());
                }
            }
        }
        if !f.is_finite() {
            return Err(CameraModelError::InvalidParams(
                "fisheye lenses leave no field of view to rectify".to_string(),
            )
            .into());
        }
        (f, FISHEYE_MAX_HALF_FOV)
    } else {
        let kl = rig.left.get_intrinsics();
        let kr = rig.right.get_intrinsics();
        (kl.fx.min(kl.fy).min(kr.fx).min(kr.fy), std::f64::consts::FRAC_PI_2)
    };

    // Principal point centring the rectified image border of both cameras.
    // Border pixels without a forward-facing ray are left out.
    let mut centroid = Vector2::zeros();
    let mut count = 0usize;
    for (lens, rotation) in [(&rig.left, &r1), (&rig.right, &r2)] {
        for pixel in &border {
            let Ok(ray) = lens.unproject_pixel(pixel) else {
                debug!("Border pixel {pixel:?} has no forward ray, skipped");
                continue;
            };
            let ray = rotation * clamp_incidence(&ray, max_angle);
            if ray.z <= f64::EPSILON {
                continue;
            }
            centroid += Vector2::new(f * ray.x / ray.z, f * ray.y / ray.z);
            count += 1;
        }
    }
    if count > 0 {
        centroid /= count as f64;
    }
    let cx = w / 2.0 - centroid.x;
    let cy = h / 2.0 - centroid.y;

    let mut p1 = Matrix3x4::zeros();
    p1[(0, 0)] = f;
    p1[(1, 1)] = f;
    p1[(0, 2)] = cx;
    p1[(1, 2)] = cy;
    p1[(2, 2)] = 1.0;
    let mut p2 = p1;
    p2[(0, 3)] = tx * f;

    let q = Matrix4::new(
        1.0, 0.0, 0.0, -cx, //
        0.0, 1.0, 0.0, -cy, //
        0.0, 0.0, 0.0, f, //
        0.0, 0.0, -1.0 / tx, 0.0,
    );

    debug!("R1: {r1}");
    debug!("R2: {r2}");
    info!(
        "Rectification: f {:.3}, principal point ({:.3}, {:.3}), baseline {:.4}",
        f, cx, cy, tx
    );

    let left_map = build_map(&rig.left, &r1, f, cx, cy, size);
    let right_map = build_map(&rig.right, &r2, f, cx, cy, size);

    Ok(RectificationBundle {
        image_size: size,
        r1,
        r2,
        p1,
        p2,
        q,
        left_map,
        right_map,
        left: rig.left.clone(),
        right: rig.right.clone(),
    })
}

/// Angle between a ray and the optical axis.
fn incidence_angle(ray: &Vector3<f64>) -> f64 {
    ray.xy().norm().atan2(ray.z)
}

/// Tilts `ray` towards the optical axis until its incidence angle is at most `max_angle`.
fn clamp_incidence(ray: &Vector3<f64>, max_angle: f64) -> Vector3<f64> {
    let lateral = ray.xy().norm();
    if incidence_angle(ray) <= max_angle || lateral <= f64::EPSILON {
        return *ray;
    }
    let scale = max_angle.tan() / lateral;
    Vector3::new(ray.x * scale, ray.y * scale, 1.0)
}

fn build_map(
    lens: &Lens,
    rotation: &Matrix3<f64>,
    f: f64,
    cx: f64,
    cy: f64,
    size: Resolution,
) -> RemapTable {
    let back = rotation.transpose();
    RemapTable::from_fn(size, |u, v| {
        let ray = back * Vector3::new((u as f64 - cx) / f, (v as f64 - cy) / f, 1.0);
        lens.project_ray(&ray).ok()
    })
}

/// Applies the current rectification snapshot to frames.
#[derive(Debug, Clone)]
pub struct Rectifier {
    bundle: Arc<RectificationBundle>,
}

impl Rectifier {
    pub fn new(model: &CameraModel) -> Result<Self, RectificationError> {
        Ok(Rectifier {
            bundle: Arc::new(build_rectification(model)?),
        })
    }

    pub fn from_rig(rig: &CalibratedRig) -> Result<Self, RectificationError> {
        Ok(Rectifier {
            bundle: Arc::new(rectify_rig(rig)?),
        })
    }

    /// Replaces the snapshot. Bundles handed out earlier stay valid.
    pub fn rebuild(&mut self, model: &CameraModel) -> Result<(), RectificationError> {
        self.bundle = Arc::new(build_rectification(model)?);
        Ok(())
    }

    pub fn bundle(&self) -> Arc<RectificationBundle> {
        Arc::clone(&self.bundle)
    }

    /// Splits a side-by-side frame and rectifies both halves.
    pub fn rectify_frame(&self, frame: &GrayImage) -> Result<(GrayImage, GrayImage), RectificationError> {
        let size = self.bundle.image_size;
        if frame.width() != 2 * size.width || frame.height() != size.height {
            return Err(RectificationError::InvalidFrame(format!(
                "expected a {}x{} side-by-side frame, got {}x{}",
                2 * size.width,
                size.height,
                frame.width(),
                frame.height()
            )));
        }
        let (left, right) = split_side_by_side(frame)?;
        self.rectify_pair(&left, &right)
    }

    pub fn rectify_pair(
        &self,
        left: &GrayImage,
        right: &GrayImage,
    ) -> Result<(GrayImage, GrayImage), RectificationError> {
        let size = self.bundle.image_size;
        for image in [left, right] {
            if image.width() != size.width || image.height() != size.height {
                return Err(RectificationError::InvalidFrame(format!(
                    "expected {}x{} images, got {}x{}",
                    size.width,
                    size.height,
                    image.width(),
                    image.height()
                )));
            }
        }
        Ok((
            self.bundle.left_map.remap(left),
            self.bundle.right_map.remap(right),
        ))
    }

    /// Rectifies stored side-by-side frames into `out_dir` as
    /// `<stem>_left.png` and `<stem>_right.png`.
    pub fn rectify_batch<P: AsRef<Path> + Sync>(
        &self,
        frames: &[P],
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, RectificationError> {
        let written = frames
            .par_iter()
            .map(|path| {
                let path = path.as_ref();
                let frame = load_gray_image(path)?;
                let (left, right) = self.rectify_frame(&frame)?;
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "frame".to_string());
                let left_path = out_dir.join(format!("{stem}_left.png"));
                let right_path = out_dir.join(format!("{stem}_right.png"));
                save_image(&left, &left_path)?;
                save_image(&right, &right_path)?;
                Ok(vec![left_path, right_path])
            })
            .collect::<Result<Vec<_>, RectificationError>>()?;
        info!("Rectified {} frames into {}", frames.len(), out_dir.display());
        Ok(written.into_iter().flatten().collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::optimization::test_support::*;
    use approx::assert_relative_eq;
    use image::Luma;

    pub(crate) fn calibrated_model() -> CameraModel {
        let (r, t) = stereo_extrinsic();
        let left = left_lens();
        let right = right_lens();
        let mut model = CameraModel::new(VGA, false);
        model
            .update_intrinsic(
                &left.camera_matrix(),
                &left.get_distortion(),
                &right.camera_matrix(),
                &right.get_distortion(),
            )
            .unwrap();
        model.update_extrinsic(&r, &t).unwrap();
        model
    }

    pub(crate) fn scene_points() -> Vec<Vector3<f64>> {
        let mut points = Vec::new();
        for z in [400.0, 800.0, 1500.0] {
            for x in [-120.0, 0.0, 90.0] {
                for y in [-80.0, 10.0, 70.0] {
                    points.push(Vector3::new(x * z / 600.0, y * z / 600.0, z));
                }
            }
        }
        points
    }

    #[test]
    fn test_requires_calibrated_model() {
        let mut model = CameraModel::new(VGA, false);
        assert!(matches!(
            build_rectification(&model),
            Err(RectificationError::NotCalibrated)
        ));
        let (r, t) = stereo_extrinsic();
        model.update_extrinsic(&r, &t).unwrap();
        assert!(matches!(
            Rectifier::new(&model),
            Err(RectificationError::NotCalibrated)
        ));
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let model = calibrated_model();
        let first = build_rectification(&model).unwrap();
        let second = build_rectification(&model).unwrap();
        assert_relative_eq!(first.q, second.q, epsilon = 1e-12);
        assert_relative_eq!(first.r1, second.r1, epsilon = 1e-12);
        assert_relative_eq!(first.r2, second.r2, epsilon = 1e-12);
        assert_eq!(first.left_map, second.left_map);
        assert_eq!(first.right_map, second.right_map);

        let mut rectifier = Rectifier::new(&model).unwrap();
        let before = rectifier.bundle();
        rectifier.rebuild(&model).unwrap();
        assert!(!Arc::ptr_eq(&before, &rectifier.bundle()));
        assert_eq!(*before, *rectifier.bundle());
    }

    #[test]
    fn test_rectified_rotations() {
        let bundle = build_rectification(&calibrated_model()).unwrap();
        let (r, t) = stereo_extrinsic();
        for rotation in [&bundle.r1, &bundle.r2] {
            assert_relative_eq!(
                rotation.transpose() * rotation,
                Matrix3::identity(),
                epsilon = 1e-9
            );
        }
        // Both rectified frames differ by a pure translation along x.
        assert_relative_eq!(bundle.r2 * r, bundle.r1, epsilon = 1e-9);
        let shift = bundle.r2 * t;
        assert!(shift.y.abs() < 1e-9 && shift.z.abs() < 1e-9);
        assert_relative_eq!(bundle.baseline(), -t.norm(), epsilon = 1e-9);
        assert_relative_eq!(bundle.focal_length(), 510.0, epsilon = 1e-12);
    }

    #[test]
    fn test_epipolar_alignment() {
        let bundle = build_rectification(&calibrated_model()).unwrap();
        let (r, t) = stereo_extrinsic();
        for point in scene_points() {
            let left = left_lens().project(&point).unwrap();
            let right = right_lens().project(&(r * point + t)).unwrap();
            let rl = bundle.rectify_point(CameraSide::Left, &left).unwrap();
            let rr = bundle.rectify_point(CameraSide::Right, &right).unwrap();
            assert!((rl.y - rr.y).abs() < 0.5, "rows {} vs {}", rl.y, rr.y);
            assert!(rl.x - rr.x > 0.0);
        }
    }

    fn fisheye_rig(fx: f64) -> CalibratedRig {
        let (rotation, translation) = stereo_extrinsic();
        CalibratedRig {
            image_size: FISHEYE_SIZE,
            is_fisheye: true,
            left: fisheye_lens(fx),
            right: fisheye_lens(fx + 0.4),
            rotation,
            translation,
        }
    }

    #[test]
    fn test_fisheye_epipolar_alignment() {
        for fx in [190.978, 250.0, 300.0] {
            let rig = fisheye_rig(fx);
            let bundle = rectify_rig(&rig).unwrap();
            let f = bundle.focal_length();
            assert!(f > 0.0 && f < fx, "rectified focal length {f} for fx {fx}");

            for point in scene_points() {
                let left = rig.left.project(&point).unwrap();
                let right = rig
                    .right
                    .project(&(rig.rotation * point + rig.translation))
                    .unwrap();
                let rl = bundle.rectify_point(CameraSide::Left, &left).unwrap();
                let rr = bundle.rectify_point(CameraSide::Right, &right).unwrap();
                assert!((rl.y - rr.y).abs() < 0.5, "rows {} vs {}", rl.y, rr.y);
                assert!(rl.x - rr.x > 0.0);
            }

            let (sx, sy) = bundle.left_map.source(256, 256);
            assert!(FISHEYE_SIZE.contains(&Vector2::new(sx as f64, sy as f64)));
        }
    }

    #[test]
    fn test_fisheye_view_is_bounded() {
        let bundle = rectify_rig(&fisheye_rig(190.978)).unwrap();
        let half = (FISHEYE_SIZE.width - 1) as f64 / 2.0;
        let widest = (half / bundle.focal_length()).atan();
        assert!(widest <= FISHEYE_MAX_HALF_FOV + 0.2, "half field of view {widest}");
    }

    #[test]
    fn test_rejects_vertical_baseline_and_empty_size() {
        let rig = calibrated_model().calibrated().unwrap();

        let mut vertical = rig.clone();
        vertical.translation = Vector3::new(0.5, -60.0, 0.2);
        assert!(matches!(
            rectify_rig(&vertical),
            Err(RectificationError::Camera(CameraModelError::InvalidParams(_)))
        ));

        let mut empty = rig;
        empty.image_size = Resolution {
            width: 0,
            height: 0,
        };
        assert!(matches!(
            rectify_rig(&empty),
            Err(RectificationError::Camera(CameraModelError::InvalidParams(_)))
        ));
    }

    #[test]
    fn test_triangulation_recovers_point() {
        let bundle = build_rectification(&calibrated_model()).unwrap();
        let (r, t) = stereo_extrinsic();
        for point in scene_points() {
            let left = left_lens().project(&point).unwrap();
            let right = right_lens().project(&(r * point + t)).unwrap();
            let rl = bundle.rectify_point(CameraSide::Left, &left).unwrap();
            let rr = bundle.rectify_point(CameraSide::Right, &right).unwrap();
            let triangulated = bundle.triangulate(&rl, rl.x - rr.x).unwrap();
            assert_relative_eq!(
                triangulated,
                bundle.r1 * point,
                epsilon = 1e-6,
                max_relative = 1e-6
            );
        }
        assert!(bundle.triangulate(&Vector2::new(10.0, 10.0), 0.0).is_none());
    }

    #[test]
    fn test_remap_table_matches_rectify_point() {
        let bundle = build_rectification(&calibrated_model()).unwrap();
        let raw = Vector2::new(300.0, 200.0);
        let rectified = bundle.rectify_point(CameraSide::Left, &raw).unwrap();
        let (sx, sy) = bundle
            .left_map
            .source(rectified.x.round() as u32, rectified.y.round() as u32);
        assert!((sx as f64 - raw.x).abs() < 1.5);
        assert!((sy as f64 - raw.y).abs() < 1.5);
    }

    #[test]
    fn test_rectify_frame() {
        let rectifier = Rectifier::new(&calibrated_model()).unwrap();
        let frame = GrayImage::from_fn(2 * VGA.width, VGA.height, |x, _| {
            Luma([if x < VGA.width { 100 } else { 200 }])
        });
        let (left, right) = rectifier.rectify_frame(&frame).unwrap();
        assert_eq!(left.dimensions(), (VGA.width, VGA.height));
        assert_eq!(left.get_pixel(320, 240)[0], 100);
        assert_eq!(right.get_pixel(320, 240)[0], 200);

        assert!(matches!(
            rectifier.rectify_frame(&GrayImage::new(VGA.width, VGA.height)),
            Err(RectificationError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_remap_border_is_zero() {
        let table = RemapTable::from_fn(
            Resolution {
                width: 4,
                height: 2,
            },
            |u, v| {
                if u == 0 {
                    None
                } else {
                    Some(Vector2::new(u as f64 - 0.5, v as f64))
                }
            },
        );
        let src = GrayImage::from_fn(4, 2, |x, _| Luma([(x * 10) as u8]));
        let out = table.remap(&src);
        assert_eq!(out.get_pixel(0, 0)[0], 0);
        assert_eq!(out.get_pixel(1, 0)[0], 5);
        assert_eq!(out.get_pixel(3, 1)[0], 25);
    }
}
