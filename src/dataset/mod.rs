//! Operation folder layout.
//!
//! ```text
//! <root>/<operation>/
//!     calib/                      side-by-side checkerboard frames
//!     test/ or scenes/            side-by-side measurement frames
//!     calibration_data/
//!         camera_model.yaml
//!         calibration_report.json
//!     rectified/                  output of batch rectification
//! ```

use crate::util::{load_gray_image, split_side_by_side, UtilError};
use image::GrayImage;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tif"];

#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("Missing directory: {0}")]
    MissingDirectory(PathBuf),
    #[error("Sample index {index} out of range, {count} samples available")]
    SampleOutOfRange { index: usize, count: usize },
    #[error("Image error: {0}")]
    Image(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<UtilError> for DatasetError {
    fn from(e: UtilError) -> Self {
        match e {
            UtilError::Io(e) => DatasetError::Io(e),
            other => DatasetError::Image(other.to_string()),
        }
    }
}

/// Both halves of one side-by-side frame.
#[derive(Debug, Clone)]
pub struct StereoSample {
    /// Position in the sorted file listing.
    pub index: usize,
    pub name: String,
    pub left: GrayImage,
    pub right: GrayImage,
}

impl StereoSample {
    pub fn from_frame(index: usize, name: String, frame: &GrayImage) -> Result<Self, DatasetError> {
        let (left, right) = split_side_by_side(frame)?;
        Ok(StereoSample {
            index,
            name,
            left,
            right,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    operation_dir: PathBuf,
}

impl Dataset {
    /// # Errors
    ///
    /// [`DatasetError::MissingDirectory`] if `root/operation` does not exist.
    pub fn new<P: AsRef<Path>>(root: P, operation: &str) -> Result<Self, DatasetError> {
        let operation_dir = root.as_ref().join(operation);
        if !operation_dir.is_dir() {
            return Err(DatasetError::MissingDirectory(operation_dir));
        }
        Ok(Dataset { operation_dir })
    }

    pub fn operation_dir(&self) -> &Path {
        &self.operation_dir
    }

    pub fn calibration_dir(&self) -> PathBuf {
        self.operation_dir.join("calib")
    }

    /// `test/`, or `scenes/` when there is no `test/` folder.
    pub fn scenes_dir(&self) -> PathBuf {
        let test = self.operation_dir.join("test");
        if test.is_dir() {
            test
        } else {
            self.operation_dir.join("scenes")
        }
    }

    pub fn calibration_data_dir(&self) -> PathBuf {
        self.operation_dir.join("calibration_data")
    }

    pub fn model_path(&self) -> PathBuf {
        self.calibration_data_dir().join("camera_model.yaml")
    }

    pub fn report_path(&self) -> PathBuf {
        self.calibration_data_dir().join("calibration_report.json")
    }

    pub fn rectified_dir(&self) -> PathBuf {
        self.operation_dir.join("rectified")
    }

    pub fn calibration_images(&self) -> Result<Vec<PathBuf>, DatasetError> {
        list_images(self.calibration_dir())
    }

    pub fn scene_images(&self) -> Result<Vec<PathBuf>, DatasetError> {
        list_images(self.scenes_dir())
    }

    /// Loads every calibration frame. Unreadable frames are skipped with a
    /// warning and keep their slot in the numbering.
    pub fn calibration_samples(&self) -> Result<Vec<StereoSample>, DatasetError> {
        let paths = self.calibration_images()?;
        let samples: Vec<StereoSample> = paths
            .iter()
            .enumerate()
            .filter_map(|(index, path)| match load_sample(index, path) {
                Ok(sample) => Some(sample),
                Err(e) => {
                    warn!("Skipping calibration frame {}: {e}", path.display());
                    None
                }
            })
            .collect();
        info!(
            "Loaded {} of {} calibration frames from {}",
            samples.len(),
            paths.len(),
            self.calibration_dir().display()
        );
        Ok(samples)
    }

    /// Loads the measurement frame at `index` of the sorted scene listing.
    pub fn scene_sample(&self, index: usize) -> Result<StereoSample, DatasetError> {
        let paths = self.scene_images()?;
        let path = paths.get(index).ok_or(DatasetError::SampleOutOfRange {
            index,
            count: paths.len(),
        })?;
        load_sample(index, path)
    }
}

/// Image files of `dir`, sorted by file name.
pub fn list_images<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>, DatasetError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(DatasetError::MissingDirectory(dir.to_path_buf()));
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

pub fn load_sample<P: AsRef<Path>>(index: usize, path: P) -> Result<StereoSample, DatasetError> {
    let path = path.as_ref();
    let frame = load_gray_image(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{index}"));
    StereoSample::from_frame(index, name, &frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = PathBuf::from("output").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_layout_and_listing() {
        let root = scratch_dir("dataset_layout");
        let calib = root.join("op").join("calib");
        fs::create_dir_all(&calib).unwrap();
        fs::create_dir_all(root.join("op").join("scenes")).unwrap();

        let frame = GrayImage::from_fn(16, 4, |x, _| Luma([if x < 8 { 0 } else { 255 }]));
        frame.save(calib.join("b.png")).unwrap();
        frame.save(calib.join("a.png")).unwrap();
        fs::write(calib.join("notes.txt"), "not an image").unwrap();

        let dataset = Dataset::new(&root, "op").unwrap();
        assert!(dataset.scenes_dir().ends_with("scenes"));
        assert!(dataset.model_path().ends_with("calibration_data/camera_model.yaml"));

        let images = dataset.calibration_images().unwrap();
        assert_eq!(images.len(), 2);
        assert!(images[0].ends_with("a.png"));

        let samples = dataset.calibration_samples().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].index, 1);
        assert_eq!(samples[1].name, "b.png");
        assert_eq!(samples[0].left.dimensions(), (8, 4));
        assert!(samples[0].right.pixels().all(|p| p[0] == 255));

        assert!(matches!(
            dataset.scene_sample(0),
            Err(DatasetError::SampleOutOfRange { index: 0, count: 0 })
        ));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_missing_operation() {
        assert!(matches!(
            Dataset::new("output/does_not_exist", "op"),
            Err(DatasetError::MissingDirectory(_))
        ));
    }
}
