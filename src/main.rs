//! Stereo ruler command line tool.
//!
//! Usage:
//! ```bash
//! stereo-ruler -o 0617_IMX477_5000 calibrate --rows 8 --columns 11 --square-size 25
//! stereo-ruler -o 0617_IMX477_5000 rectify
//! stereo-ruler -o 0617_IMX477_5000 measure -i 3 --automatch --point 410,288 --point 655,301
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::{info, warn};
use nalgebra::Vector2;
use std::fs;
use std::path::PathBuf;

use stereo_ruler::calibration::CalibrationReport;
use stereo_ruler::dataset::Dataset;
use stereo_ruler::matching::StrategyKind;
use stereo_ruler::ruler::{AnnotatedImageWriter, ScriptedPicker};
use stereo_ruler::util::ensure_dir;
use stereo_ruler::{
    BoardGeometry, CalibrationOptions, Calibrator, CameraModel, CorrespondenceMatcher,
    LoadedModel, MatcherConfig, RectificationError, Rectifier, Ruler,
};

/// Stereo rig calibration, rectification and measurement
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the operation folders
    #[arg(short = 'r', long, default_value = "datasets")]
    root: PathBuf,

    /// Operation folder inside the root
    #[arg(short = 'o', long)]
    operation: String,

    /// Log filter, e.g. "info" or "debug"
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate both cameras and the rig from the calib/ frames
    Calibrate {
        /// Interior corners per board column
        #[arg(long, default_value_t = 8)]
        rows: usize,

        /// Interior corners per board row
        #[arg(long, default_value_t = 11)]
        columns: usize,

        /// Edge length of one board square; sets the unit of every measurement
        #[arg(long, default_value_t = 25.0)]
        square_size: f64,

        /// Use the Kannala-Brandt fisheye lens model
        #[arg(long)]
        fisheye: bool,

        /// Hold the per-camera intrinsics fixed during stereo calibration
        #[arg(long)]
        fix_intrinsic: bool,

        /// Reuse the intrinsics of the stored camera model instead of
        /// calibrating each camera first
        #[arg(long)]
        stereo_only: bool,

        #[arg(long, default_value_t = 100)]
        max_iterations: usize,
    },
    /// Rectify every scene frame into rectified/
    Rectify,
    /// Measure a segment on one scene frame
    Measure {
        /// Zero-based index of the frame in the sorted scene listing
        /// (the first frame is 0)
        #[arg(short, long)]
        index: usize,

        /// Endpoints as x,y in rectified pixels: left A, right A, left B,
        /// right B. Right points are omitted with --automatch.
        #[arg(long = "point", value_parser = parse_point)]
        points: Vec<Vector2<f64>>,

        /// Find the right image points with the correspondence matcher
        #[arg(long)]
        automatch: bool,

        /// Matching strategy, overrides the matcher config
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,

        /// YAML file with matcher settings
        #[arg(long)]
        matcher_config: Option<PathBuf>,

        /// Where to write the annotated pair
        #[arg(long)]
        annotate: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StrategyArg {
    Ncc,
    Sad,
    Brief,
}

impl From<StrategyArg> for StrategyKind {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Ncc => StrategyKind::Ncc,
            StrategyArg::Sad => StrategyKind::Sad,
            StrategyArg::Brief => StrategyKind::Brief,
        }
    }
}

fn parse_point(s: &str) -> Result<Vector2<f64>, String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected x,y but got '{s}'"))?;
    let x: f64 = x.trim().parse().map_err(|e| format!("invalid x '{x}': {e}"))?;
    let y: f64 = y.trim().parse().map_err(|e| format!("invalid y '{y}': {e}"))?;
    Ok(Vector2::new(x, y))
}

fn load_rectifier(dataset: &Dataset) -> Result<Rectifier, Box<dyn std::error::Error>> {
    match CameraModel::load_rig(dataset.model_path())? {
        LoadedModel::Calibrated(rig) => Ok(Rectifier::from_rig(&rig)?),
        LoadedModel::Uncalibrated(model) => {
            warn!("Camera model is {:?}", model.calibration_state());
            Err(RectificationError::NotCalibrated.into())
        }
    }
}

fn calibrate(
    dataset: &Dataset,
    board: BoardGeometry,
    fisheye: bool,
    fix_intrinsic: bool,
    stereo_only: bool,
    max_iterations: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let samples = dataset.calibration_samples()?;
    let first = samples
        .first()
        .ok_or("no readable calibration frames in calib/")?;
    let image_size = stereo_ruler::Resolution {
        width: first.left.width(),
        height: first.left.height(),
    };

    let model = if stereo_only {
        CameraModel::load(dataset.model_path())?
    } else {
        CameraModel::new(image_size, fisheye)
    };

    let mut calibrator = Calibrator::new(model, board, samples).with_options(CalibrationOptions {
        max_iterations,
        verbose: true,
    });

    let mono = if stereo_only {
        Vec::new()
    } else {
        let (left, right) = calibrator.calibrate_mono()?;
        vec![left, right]
    };
    let stereo = calibrator.calibrate_stereo(fix_intrinsic)?;

    let model = calibrator.model();
    model.save(dataset.model_path())?;
    info!("{model}");

    let report = CalibrationReport::new(board, &mono, Some(&stereo));
    ensure_dir(dataset.calibration_data_dir())?;
    fs::write(dataset.report_path(), serde_json::to_string_pretty(&report)?)?;
    info!("Calibration report written to {}", dataset.report_path().display());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    Logger::try_with_str(&cli.log_level)?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    let dataset = Dataset::new(&cli.root, &cli.operation)?;
    info!("Operation folder: {}", dataset.operation_dir().display());

    match cli.command {
        Command::Calibrate {
            rows,
            columns,
            square_size,
            fisheye,
            fix_intrinsic,
            stereo_only,
            max_iterations,
        } => {
            let board = BoardGeometry::new(rows, columns, square_size)?;
            calibrate(
                &dataset,
                board,
                fisheye,
                fix_intrinsic,
                stereo_only,
                max_iterations,
            )?;
        }
        Command::Rectify => {
            let rectifier = load_rectifier(&dataset)?;
            let frames = dataset.scene_images()?;
            let written = rectifier.rectify_batch(&frames, &dataset.rectified_dir())?;
            info!("Wrote {} rectified images", written.len());
        }
        Command::Measure {
            index,
            points,
            automatch,
            strategy,
            matcher_config,
            annotate,
        } => {
            let mut config = match matcher_config {
                Some(path) => serde_yaml::from_str::<MatcherConfig>(&fs::read_to_string(path)?)?,
                None => MatcherConfig::default(),
            };
            if let Some(strategy) = strategy {
                config.strategy = strategy.into();
            }
            let matcher = CorrespondenceMatcher::new(config);

            let rectifier = load_rectifier(&dataset)?;
            let sample = dataset.scene_sample(index)?;
            let (left, right) = rectifier.rectify_pair(&sample.left, &sample.right)?;
            let mut ruler = Ruler::new(rectifier.bundle(), left, right)?;

            let mut picker = ScriptedPicker::new(points);
            ruler.click_segment(&mut picker, automatch, &matcher)?;
            let measurement = ruler.measure_segment()?;
            println!(
                "Distance on {}: {:.3} (board units)",
                sample.name, measurement.distance
            );

            let path = annotate.unwrap_or_else(|| {
                dataset
                    .operation_dir()
                    .join("measurements")
                    .join(format!("{index:03}.png"))
            });
            ruler.show_endpoints(&mut AnnotatedImageWriter::new(path))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_measure_index_is_zero_based() {
        let cli = Cli::try_parse_from([
            "stereo-ruler",
            "-o",
            "op",
            "measure",
            "-i",
            "0",
            "--point",
            "410,288",
        ])
        .unwrap();
        match cli.command {
            Command::Measure { index, points, .. } => {
                assert_eq!(index, 0);
                assert_eq!(points, vec![Vector2::new(410.0, 288.0)]);
            }
            other => panic!("expected measure, got {other:?}"),
        }

        let mut cli = Cli::command();
        let help = cli
            .find_subcommand_mut("measure")
            .unwrap()
            .render_long_help()
            .to_string();
        assert!(help.contains("Zero-based index"));
    }
}
