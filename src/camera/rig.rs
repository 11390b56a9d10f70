//! The stereo rig record: image size, lens family, both lenses and the pose
//! of the right camera relative to the left one.
//!
//! A [`CameraModel`] starts out uncalibrated and is only ever changed through
//! [`CameraModel::update_intrinsic`] and [`CameraModel::update_extrinsic`].
//! It is persisted as a single YAML record with the fields `image_size`,
//! `is_fisheye`, `intrinsic_left`, `distortion_left`, `intrinsic_right`,
//! `distortion_right`, `rotation` and `translation`. Only the first two are
//! mandatory.

use crate::camera::{CameraModelError, Intrinsics, Lens, LensModel, Resolution};
use log::{info, warn};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Left and right lenses, always set together.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoIntrinsics {
    pub left: Lens,
    pub right: Lens,
}

/// Pose of the right camera relative to the left: `x_right = R x_left + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct Extrinsics {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Uncalibrated,
    /// Intrinsics known, extrinsics missing.
    MonoCalibrated,
    /// Extrinsics known, intrinsics missing.
    ExtrinsicsOnly,
    Calibrated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraModel {
    image_size: Resolution,
    is_fisheye: bool,
    intrinsics: Option<StereoIntrinsics>,
    extrinsics: Option<Extrinsics>,
}

/// A rig with every geometry field present.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedRig {
    pub image_size: Resolution,
    pub is_fisheye: bool,
    pub left: Lens,
    pub right: Lens,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

/// Outcome of loading a record, decided once at load time.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadedModel {
    /// Anything short of full calibration, including mono-calibrated rigs.
    Uncalibrated(CameraModel),
    Calibrated(CalibratedRig),
}

/// On-disk layout. Every field is optional so that missing mandatory fields
/// can be reported by name instead of as a generic parse failure.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CameraModelRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image_size: Option<[u32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    is_fisheye: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    intrinsic_left: Option<[[f64; 3]; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    distortion_left: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    intrinsic_right: Option<[[f64; 3]; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    distortion_right: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rotation: Option<[[f64; 3]; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    translation: Option<[f64; 3]>,
}

fn matrix_to_rows(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    [
        [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
        [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
        [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
    ]
}

fn rows_to_matrix(rows: &[[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::from_fn(|r, c| rows[r][c])
}

impl CameraModel {
    /// Creates an uncalibrated rig.
    pub fn new(image_size: Resolution, is_fisheye: bool) -> Self {
        CameraModel {
            image_size,
            is_fisheye,
            intrinsics: None,
            extrinsics: None,
        }
    }

    pub fn image_size(&self) -> Resolution {
        self.image_size
    }

    pub fn is_fisheye(&self) -> bool {
        self.is_fisheye
    }

    pub fn intrinsics(&self) -> Option<&StereoIntrinsics> {
        self.intrinsics.as_ref()
    }

    pub fn extrinsics(&self) -> Option<&Extrinsics> {
        self.extrinsics.as_ref()
    }

    /// Sets both lenses at once.
    ///
    /// # Arguments
    ///
    /// * `intrinsic_left`, `intrinsic_right` - 3x3 camera matrices.
    /// * `distortion_left`, `distortion_right` - 5 coefficients for the
    ///   pinhole model or 4 for the fisheye model.
    ///
    /// # Errors
    ///
    /// Nothing is modified if either lens fails validation.
    pub fn update_intrinsic(
        &mut self,
        intrinsic_left: &Matrix3<f64>,
        distortion_left: &[f64],
        intrinsic_right: &Matrix3<f64>,
        distortion_right: &[f64],
    ) -> Result<(), CameraModelError> {
        let left = Lens::new(
            self.is_fisheye,
            Intrinsics::from_matrix(intrinsic_left),
            distortion_left,
            self.image_size,
        )?;
        let right = Lens::new(
            self.is_fisheye,
            Intrinsics::from_matrix(intrinsic_right),
            distortion_right,
            self.image_size,
        )?;
        self.intrinsics = Some(StereoIntrinsics { left, right });
        Ok(())
    }

    /// Sets the relative pose of the right camera.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::InvalidParams`] if `rotation` is not a proper
    /// rotation matrix or `translation` is not finite.
    pub fn update_extrinsic(
        &mut self,
        rotation: &Matrix3<f64>,
        translation: &Vector3<f64>,
    ) -> Result<(), CameraModelError> {
        let orthogonality = (rotation.transpose() * rotation - Matrix3::identity()).norm();
        if !(orthogonality < 1e-6) || (rotation.determinant() - 1.0).abs() > 1e-6 {
            return Err(CameraModelError::InvalidParams(
                "rotation must be orthonormal with determinant 1".to_string(),
            ));
        }
        if translation.iter().any(|t| !t.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "translation must be finite".to_string(),
            ));
        }
        self.extrinsics = Some(Extrinsics {
            rotation: *rotation,
            translation: *translation,
        });
        Ok(())
    }

    /// True iff every geometry field is present.
    pub fn is_calibrated(&self) -> bool {
        self.calibration_state() == CalibrationState::Calibrated
    }

    pub fn calibration_state(&self) -> CalibrationState {
        match (self.intrinsics.is_some(), self.extrinsics.is_some()) {
            (false, false) => CalibrationState::Uncalibrated,
            (true, false) => CalibrationState::MonoCalibrated,
            (false, true) => CalibrationState::ExtrinsicsOnly,
            (true, true) => CalibrationState::Calibrated,
        }
    }

    /// Snapshot of a fully calibrated rig.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::NotCalibrated`] unless [`Self::is_calibrated`] holds.
    pub fn calibrated(&self) -> Result<CalibratedRig, CameraModelError> {
        match (&self.intrinsics, &self.extrinsics) {
            (Some(intrinsics), Some(extrinsics)) => Ok(CalibratedRig {
                image_size: self.image_size,
                is_fisheye: self.is_fisheye,
                left: intrinsics.left.clone(),
                right: intrinsics.right.clone(),
                rotation: extrinsics.rotation,
                translation: extrinsics.translation,
            }),
            _ => Err(CameraModelError::NotCalibrated),
        }
    }

    /// Loads a rig from a YAML record.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::MissingCameraInfo`] if `image_size` or
    ///   `is_fisheye` is absent.
    /// * [`CameraModelError::YamlError`] / [`CameraModelError::IOError`] on
    ///   unreadable input.
    /// * Validation errors for present but invalid geometry.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let record: CameraModelRecord = serde_yaml::from_str(&contents)?;
        let model = Self::from_record(record)?;
        info!(
            "Loaded camera model from {} ({:?})",
            path.as_ref().display(),
            model.calibration_state()
        );
        Ok(model)
    }

    /// Loads a rig and classifies it as calibrated or not.
    pub fn load_rig<P: AsRef<Path>>(path: P) -> Result<LoadedModel, CameraModelError> {
        let model = Self::load(path)?;
        Ok(match model.calibrated() {
            Ok(rig) => LoadedModel::Calibrated(rig),
            Err(_) => LoadedModel::Uncalibrated(model),
        })
    }

    /// Writes the record, creating parent directories as needed.
    ///
    /// The record is serialized in full before anything touches the disk and
    /// is then moved into place with a rename.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CameraModelError> {
        let path = path.as_ref();
        let yaml_string = serde_yaml::to_string(&self.to_record())?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        fs::write(&tmp_name, yaml_string)?;
        fs::rename(&tmp_name, path)?;
        info!("Saved camera model to {}", path.display());
        Ok(())
    }

    fn to_record(&self) -> CameraModelRecord {
        let mut record = CameraModelRecord {
            image_size: Some([self.image_size.width, self.image_size.height]),
            is_fisheye: Some(self.is_fisheye),
            ..Default::default()
        };
        if let Some(intrinsics) = &self.intrinsics {
            record.intrinsic_left = Some(matrix_to_rows(&intrinsics.left.camera_matrix()));
            record.distortion_left = Some(intrinsics.left.get_distortion());
            record.intrinsic_right = Some(matrix_to_rows(&intrinsics.right.camera_matrix()));
            record.distortion_right = Some(intrinsics.right.get_distortion());
        }
        if let Some(extrinsics) = &self.extrinsics {
            record.rotation = Some(matrix_to_rows(&extrinsics.rotation));
            record.translation = Some(extrinsics.translation.into());
        }
        record
    }

    fn from_record(record: CameraModelRecord) -> Result<Self, CameraModelError> {
        let [width, height] = record
            .image_size
            .ok_or_else(|| CameraModelError::MissingCameraInfo("image_size".to_string()))?;
        let is_fisheye = record
            .is_fisheye
            .ok_or_else(|| CameraModelError::MissingCameraInfo("is_fisheye".to_string()))?;

        let mut model = CameraModel::new(Resolution { width, height }, is_fisheye);

        match (
            record.intrinsic_left,
            record.distortion_left,
            record.intrinsic_right,
            record.distortion_right,
        ) {
            (Some(kl), Some(dl), Some(kr), Some(dr)) => {
                model.update_intrinsic(&rows_to_matrix(&kl), &dl, &rows_to_matrix(&kr), &dr)?;
            }
            (None, None, None, None) => {}
            _ => warn!("Camera model record has incomplete intrinsics; ignoring them"),
        }

        match (record.rotation, record.translation) {
            (Some(r), Some(t)) => {
                model.update_extrinsic(&rows_to_matrix(&r), &Vector3::from(t))?;
            }
            (None, None) => {}
            _ => warn!("Camera model record has incomplete extrinsics; ignoring them"),
        }

        Ok(model)
    }
}

impl fmt::Display for CameraModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "image_size: {}x{}", self.image_size.width, self.image_size.height)?;
        writeln!(f, "is_fisheye: {}", self.is_fisheye)?;
        match &self.intrinsics {
            Some(intrinsics) => {
                writeln!(f, "intrinsic_left:{}", intrinsics.left.camera_matrix())?;
                writeln!(f, "distortion_left: {:?}", intrinsics.left.get_distortion())?;
                writeln!(f, "intrinsic_right:{}", intrinsics.right.camera_matrix())?;
                writeln!(f, "distortion_right: {:?}", intrinsics.right.get_distortion())?;
            }
            None => writeln!(f, "intrinsics: none")?,
        }
        match &self.extrinsics {
            Some(extrinsics) => {
                writeln!(f, "rotation:{}", extrinsics.rotation)?;
                write!(f, "translation:{}", extrinsics.translation.transpose())
            }
            None => write!(f, "extrinsics: none"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::rodrigues;

    const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };

    fn k(fx: f64, cx: f64) -> Matrix3<f64> {
        Matrix3::new(fx, 0.0, cx, 0.0, fx + 2.0, 241.5, 0.0, 0.0, 1.0)
    }

    fn calibrated_model() -> CameraModel {
        let mut model = CameraModel::new(VGA, false);
        model
            .update_intrinsic(
                &k(500.25, 320.5),
                &[-0.1, 0.02, 0.001, -0.0005, 0.0],
                &k(498.75, 318.25),
                &[-0.09, 0.015, 0.0, 0.0002, 0.001],
            )
            .unwrap();
        model
            .update_extrinsic(
                &rodrigues(&Vector3::new(0.01, -0.02, 0.005)),
                &Vector3::new(-60.0, 0.3, -0.2),
            )
            .unwrap();
        model
    }

    #[test]
    fn test_save_load_round_trip_calibrated() {
        let model = calibrated_model();
        let path = "output/rig_round_trip_calibrated/camera_model.yaml";
        model.save(path).unwrap();
        let loaded = CameraModel::load(path).unwrap();
        assert_eq!(model, loaded);
        assert!(loaded.is_calibrated());
        fs::remove_dir_all("output/rig_round_trip_calibrated").unwrap();
    }

    #[test]
    fn test_save_load_round_trip_uncalibrated() {
        let model = CameraModel::new(VGA, true);
        let path = "output/rig_round_trip_uncalibrated/camera_model.yaml";
        model.save(path).unwrap();
        let loaded = CameraModel::load(path).unwrap();
        assert_eq!(model, loaded);
        assert_eq!(loaded.calibration_state(), CalibrationState::Uncalibrated);
        assert!(matches!(
            CameraModel::load_rig(path).unwrap(),
            LoadedModel::Uncalibrated(_)
        ));
        fs::remove_dir_all("output/rig_round_trip_uncalibrated").unwrap();
    }

    #[test]
    fn test_save_load_round_trip_fisheye() {
        let size = Resolution {
            width: 512,
            height: 512,
        };
        let kb = |fx: f64, cx: f64| Matrix3::new(fx, 0.0, cx, 0.0, fx - 0.005, 256.897, 0.0, 0.0, 1.0);
        let mut model = CameraModel::new(size, true);
        model
            .update_intrinsic(
                &kb(190.978, 254.932),
                &[0.0034823, 0.000715, -0.0020532, 0.0002029],
                &kb(191.25, 256.125),
                &[0.0031, 0.0009, -0.0018, 0.0001],
            )
            .unwrap();
        model
            .update_extrinsic(
                &rodrigues(&Vector3::new(0.002, 0.01, -0.004)),
                &Vector3::new(-64.0, 0.5, 0.1),
            )
            .unwrap();

        let path = "output/rig_round_trip_fisheye/camera_model.yaml";
        model.save(path).unwrap();
        let loaded = CameraModel::load(path).unwrap();
        assert_eq!(model, loaded);
        match CameraModel::load_rig(path).unwrap() {
            LoadedModel::Calibrated(rig) => {
                assert!(rig.is_fisheye);
                assert!(rig.left.is_fisheye() && rig.right.is_fisheye());
                assert_eq!(rig.left.get_distortion().len(), 4);
            }
            other => panic!("expected calibrated rig, got {other:?}"),
        }
        fs::remove_dir_all("output/rig_round_trip_fisheye").unwrap();
    }

    #[test]
    fn test_load_rig_classifies_calibrated() {
        let path = "output/rig_classify/camera_model.yaml";
        calibrated_model().save(path).unwrap();
        match CameraModel::load_rig(path).unwrap() {
            LoadedModel::Calibrated(rig) => assert_eq!(rig.image_size, VGA),
            other => panic!("expected calibrated rig, got {other:?}"),
        }
        fs::remove_dir_all("output/rig_classify").unwrap();
    }

    #[test]
    fn test_load_missing_mandatory_fields() {
        let record = "intrinsic_left: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]\n";
        let parsed: CameraModelRecord = serde_yaml::from_str(record).unwrap();
        match CameraModel::from_record(parsed) {
            Err(CameraModelError::MissingCameraInfo(field)) => assert_eq!(field, "image_size"),
            other => panic!("expected MissingCameraInfo, got {other:?}"),
        }

        let parsed: CameraModelRecord = serde_yaml::from_str("image_size: [640, 480]\n").unwrap();
        match CameraModel::from_record(parsed) {
            Err(CameraModelError::MissingCameraInfo(field)) => assert_eq!(field, "is_fisheye"),
            other => panic!("expected MissingCameraInfo, got {other:?}"),
        }
    }

    #[test]
    fn test_is_calibrated_over_update_sequences() {
        let source = calibrated_model();
        let intrinsics = source.intrinsics().unwrap().clone();
        let extrinsics = source.extrinsics().unwrap().clone();

        // Every subset and ordering of the two updates.
        let sequences: [&[u8]; 6] = [&[], &[0], &[1], &[0, 1], &[1, 0], &[1, 1, 0, 0]];
        for sequence in sequences {
            let mut model = CameraModel::new(VGA, false);
            for step in sequence {
                if *step == 0 {
                    model
                        .update_intrinsic(
                            &intrinsics.left.camera_matrix(),
                            &intrinsics.left.get_distortion(),
                            &intrinsics.right.camera_matrix(),
                            &intrinsics.right.get_distortion(),
                        )
                        .unwrap();
                } else {
                    model
                        .update_extrinsic(&extrinsics.rotation, &extrinsics.translation)
                        .unwrap();
                }
            }
            let expected = sequence.contains(&0) && sequence.contains(&1);
            assert_eq!(model.is_calibrated(), expected, "sequence {sequence:?}");
            assert_eq!(model.calibrated().is_ok(), expected);
        }
    }

    #[test]
    fn test_failed_update_leaves_model_untouched() {
        let mut model = CameraModel::new(VGA, false);
        let err = model
            .update_intrinsic(&k(500.0, 320.0), &[0.0; 5], &k(500.0, 320.0), &[0.0; 4])
            .unwrap_err();
        assert!(matches!(err, CameraModelError::InvalidParams(_)));
        assert_eq!(model.calibration_state(), CalibrationState::Uncalibrated);

        let not_rotation = Matrix3::new(2.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        assert!(model
            .update_extrinsic(&not_rotation, &Vector3::zeros())
            .is_err());
        assert!(model.extrinsics().is_none());
    }

    #[test]
    fn test_mono_calibrated_is_not_calibrated() {
        let mut model = CameraModel::new(VGA, false);
        model
            .update_intrinsic(&k(500.0, 320.0), &[0.0; 5], &k(500.0, 320.0), &[0.0; 5])
            .unwrap();
        assert_eq!(model.calibration_state(), CalibrationState::MonoCalibrated);
        assert!(!model.is_calibrated());
        assert!(matches!(
            model.calibrated(),
            Err(CameraModelError::NotCalibrated)
        ));
    }

    #[test]
    fn test_display_lists_all_fields() {
        let text = calibrated_model().to_string();
        for field in [
            "image_size",
            "is_fisheye",
            "intrinsic_left",
            "distortion_left",
            "intrinsic_right",
            "distortion_right",
            "rotation",
            "translation",
        ] {
            assert!(text.contains(field), "missing {field} in\n{text}");
        }
    }
}
