//! Checkerboard corner detection.
//!
//! Corners are found with a Harris response, kept only if the intensity ring
//! around them alternates four times (an X-junction, which rejects the
//! L-shaped corners on the outer border of the board), assigned to the board
//! grid by walking from corner to neighbouring corner and finally refined to
//! sub-pixel accuracy.

use crate::calibration::{BoardGeometry, CalibrationError};
use image::GrayImage;
use nalgebra::Vector2;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

/// Locates the interior corners of a calibration board.
///
/// Implementations return the `rows * columns` corners in row-major order,
/// matching [`BoardGeometry::object_points`].
pub trait CornerDetector: Send + Sync {
    fn detect(
        &self,
        image: &GrayImage,
        board: &BoardGeometry,
    ) -> Result<Vec<Vector2<f64>>, CalibrationError>;
}

/// Harris-based checkerboard detector.
#[derive(Debug, Clone)]
pub struct ChessboardDetector {
    /// Harris sensitivity `k`.
    pub harris_k: f64,
    /// Candidates below this fraction of the strongest response are dropped.
    pub relative_threshold: f64,
    /// Radius of the intensity ring used by the X-junction test.
    pub ring_radius: f64,
    /// Minimum intensity spread on the ring.
    pub min_contrast: u8,
    /// Half size of the sub-pixel refinement window.
    pub subpix_radius: usize,
}

impl Default for ChessboardDetector {
    fn default() -> Self {
        ChessboardDetector {
            harris_k: 0.04,
            relative_threshold: 0.01,
            ring_radius: 4.0,
            min_contrast: 40,
            subpix_radius: 3,
        }
    }
}

struct Candidate {
    position: Vector2<f64>,
    response: f64,
}

impl CornerDetector for ChessboardDetector {
    fn detect(
        &self,
        image: &GrayImage,
        board: &BoardGeometry,
    ) -> Result<Vec<Vector2<f64>>, CalibrationError> {
        let need = board.corner_count();
        if image.width() < 16 || image.height() < 16 {
            return Err(CalibrationError::DetectionFailed(
                "image too small for chessboard detection".to_string(),
            ));
        }

        let (response, width, height) = harris_response(image, self.harris_k, 1);
        let max_r = response
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
            .max(0.0);
        if max_r <= 0.0 {
            return Err(CalibrationError::DetectionFailed(
                "no chessboard-like corners found".to_string(),
            ));
        }

        let mut candidates =
            non_max_suppression(&response, width, height, max_r * self.relative_threshold);
        candidates.sort_by(|a, b| b.response.partial_cmp(&a.response).unwrap_or(Ordering::Equal));
        candidates.truncate(need * 10);

        let margin = self.ring_radius.ceil() + 1.0;
        let saddles: Vec<Candidate> = candidates
            .into_par_iter()
            .filter(|c| {
                c.position.x >= margin
                    && c.position.y >= margin
                    && c.position.x < width as f64 - margin
                    && c.position.y < height as f64 - margin
                    && self.is_x_junction(image, &c.position)
            })
            .collect();
        let corners = merge_close(saddles, self.ring_radius);

        if corners.len() < need {
            return Err(CalibrationError::DetectionFailed(format!(
                "insufficient corner candidates: found {}, need {need}",
                corners.len()
            )));
        }

        let mut ordered = assign_grid_points(&corners, board.columns, board.rows)?;
        corner_subpix(image, &mut ordered, self.subpix_radius, 25, 1e-3);
        Ok(ordered)
    }
}

impl ChessboardDetector {
    /// Samples a ring around `center` and counts dark/bright alternations.
    fn is_x_junction(&self, image: &GrayImage, center: &Vector2<f64>) -> bool {
        const SAMPLES: usize = 16;
        let values: Vec<u8> = (0..SAMPLES)
            .map(|i| {
                let angle = i as f64 * std::f64::consts::TAU / SAMPLES as f64;
                let x = (center.x + self.ring_radius * angle.cos()).round() as u32;
                let y = (center.y + self.ring_radius * angle.sin()).round() as u32;
                image.get_pixel(x, y)[0]
            })
            .collect();

        let lo = values.iter().copied().min().unwrap_or(0);
        let hi = values.iter().copied().max().unwrap_or(0);
        if hi - lo < self.min_contrast {
            return false;
        }
        let mid = (lo as u16 + hi as u16) / 2;
        let bright: Vec<bool> = values.iter().map(|v| *v as u16 > mid).collect();
        let transitions = (0..SAMPLES)
            .filter(|&i| bright[i] != bright[(i + 1) % SAMPLES])
            .count();
        transitions == 4
    }
}

/// Refine corner positions to sub-pixel accuracy.
///
/// Each corner moves to the gradient-magnitude weighted centroid of its
/// `(2 win_radius + 1)^2` neighbourhood until the shift drops below `eps`.
pub fn corner_subpix(
    image: &GrayImage,
    corners: &mut [Vector2<f64>],
    win_radius: usize,
    max_iters: usize,
    eps: f64,
) {
    let w = image.width() as i32;
    let h = image.height() as i32;
    let r = win_radius.max(1) as i32;
    corners.par_iter_mut().for_each(|p| {
        let mut x = p.x;
        let mut y = p.y;
        for _ in 0..max_iters {
            let mut sw = 0.0f64;
            let mut sx = 0.0f64;
            let mut sy = 0.0f64;
            let cx = x.round() as i32;
            let cy = y.round() as i32;
            for dy in -r..=r {
                for dx in -r..=r {
                    let xx = cx + dx;
                    let yy = cy + dy;
                    if xx <= 0 || yy <= 0 || xx >= w - 1 || yy >= h - 1 {
                        continue;
                    }
                    let gx = (image.get_pixel((xx + 1) as u32, yy as u32)[0] as f64
                        - image.get_pixel((xx - 1) as u32, yy as u32)[0] as f64)
                        * 0.5;
                    let gy = (image.get_pixel(xx as u32, (yy + 1) as u32)[0] as f64
                        - image.get_pixel(xx as u32, (yy - 1) as u32)[0] as f64)
                        * 0.5;
                    let wgt = (gx * gx + gy * gy).sqrt();
                    if wgt <= 1e-9 {
                        continue;
                    }
                    sw += wgt;
                    sx += wgt * xx as f64;
                    sy += wgt * yy as f64;
                }
            }
            if sw <= 1e-9 {
                break;
            }
            let nx = sx / sw;
            let ny = sy / sw;
            let shift = ((nx - x) * (nx - x) + (ny - y) * (ny - y)).sqrt();
            x = nx;
            y = ny;
            if shift < eps {
                break;
            }
        }
        p.x = x.clamp(0.0, (w - 1) as f64);
        p.y = y.clamp(0.0, (h - 1) as f64);
    });
}

fn harris_response(image: &GrayImage, k: f64, win_radius: usize) -> (Vec<f64>, usize, usize) {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let mut ix = vec![0.0f64; width * height];
    let mut iy = vec![0.0f64; width * height];

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = image.get_pixel((x + 1) as u32, y as u32)[0] as f64
                - image.get_pixel((x - 1) as u32, y as u32)[0] as f64;
            let gy = image.get_pixel(x as u32, (y + 1) as u32)[0] as f64
                - image.get_pixel(x as u32, (y - 1) as u32)[0] as f64;
            ix[y * width + x] = gx * 0.5;
            iy[y * width + x] = gy * 0.5;
        }
    }

    let mut resp = vec![0.0f64; width * height];
    let r = win_radius as i32;
    resp.par_chunks_mut(width)
        .enumerate()
        .skip(win_radius)
        .take(height - 2 * win_radius)
        .for_each(|(y, row)| {
            for x in win_radius..(width - win_radius) {
                let mut sxx = 0.0;
                let mut sxy = 0.0;
                let mut syy = 0.0;
                for dy in -r..=r {
                    for dx in -r..=r {
                        let idx = (y as i32 + dy) as usize * width + (x as i32 + dx) as usize;
                        sxx += ix[idx] * ix[idx];
                        sxy += ix[idx] * iy[idx];
                        syy += iy[idx] * iy[idx];
                    }
                }
                let det = sxx * syy - sxy * sxy;
                let trace = sxx + syy;
                row[x] = det - k * trace * trace;
            }
        });
    (resp, width, height)
}

fn non_max_suppression(
    response: &[f64],
    width: usize,
    height: usize,
    threshold: f64,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let r = response[y * width + x];
            if r <= threshold {
                continue;
            }
            let is_max = (y - 1..=y + 1).all(|yy| {
                (x - 1..=x + 1).all(|xx| (xx == x && yy == y) || response[yy * width + xx] <= r)
            });
            if is_max {
                out.push(Candidate {
                    position: Vector2::new(x as f64, y as f64),
                    response: r,
                });
            }
        }
    }
    out
}

/// Keeps the strongest candidate among those closer than `radius`.
fn merge_close(mut candidates: Vec<Candidate>, radius: f64) -> Vec<Vector2<f64>> {
    candidates.sort_by(|a, b| b.response.partial_cmp(&a.response).unwrap_or(Ordering::Equal));
    let mut kept: Vec<Vector2<f64>> = Vec::new();
    for c in candidates {
        if kept.iter().all(|k| (k - c.position).norm() >= radius) {
            kept.push(c.position);
        }
    }
    kept
}

type Cell = (i32, i32);

/// Orders corner candidates into the `columns x rows` grid, row-major.
///
/// The lattice is grown outwards from the candidate nearest the centroid.
/// Every new node is predicted from the step to an already placed
/// neighbour, so the square size may change across a tilted board.
fn assign_grid_points(
    points: &[Vector2<f64>],
    columns: usize,
    rows: usize,
) -> Result<Vec<Vector2<f64>>, CalibrationError> {
    let irregular =
        || CalibrationError::DetectionFailed("corners do not form a regular grid".to_string());

    let mean = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / points.len() as f64;
    let seed = nearest(points, &mean, |_| true)
        .map(|(idx, _)| idx)
        .ok_or_else(irregular)?;
    let (axis_a, axis_b) = seed_axes(points, seed).ok_or_else(irregular)?;

    let mut nodes: HashMap<Cell, usize> = HashMap::from([((0, 0), seed)]);
    let mut used = vec![false; points.len()];
    used[seed] = true;
    let mut queue = VecDeque::from([(0, 0)]);
    while let Some(cell) = queue.pop_front() {
        let here = points[nodes[&cell]];
        for delta in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
            let next = (cell.0 + delta.0, cell.1 + delta.1);
            if nodes.contains_key(&next) {
                continue;
            }
            let step = local_step(points, &nodes, cell, delta)
                .unwrap_or_else(|| axis_a * delta.0 as f64 + axis_b * delta.1 as f64);
            let predicted = here + step;
            let found = nearest(points, &predicted, |idx| !used[idx])
                .filter(|(_, distance)| *distance < 0.35 * step.norm());
            if let Some((idx, _)) = found {
                used[idx] = true;
                nodes.insert(next, idx);
                queue.push_back(next);
            }
        }
    }

    let (mut i_min, mut i_max, mut j_min, mut j_max) = (0, 0, 0, 0);
    for (i, j) in nodes.keys() {
        i_min = i_min.min(*i);
        i_max = i_max.max(*i);
        j_min = j_min.min(*j);
        j_max = j_max.max(*j);
    }
    let extent = ((i_max - i_min + 1) as usize, (j_max - j_min + 1) as usize);
    if nodes.len() != columns * rows {
        return Err(irregular());
    }
    let i_is_column = match (extent == (columns, rows), extent == (rows, columns)) {
        (true, true) => axis_a.x.abs() >= axis_a.y.abs(),
        (true, false) => true,
        (false, true) => false,
        (false, false) => return Err(irregular()),
    };

    let mut grid: Vec<Option<Vector2<f64>>> = vec![None; columns * rows];
    for (&(i, j), &idx) in &nodes {
        let (i, j) = ((i - i_min) as usize, (j - j_min) as usize);
        let (c, r) = if i_is_column { (i, j) } else { (j, i) };
        grid[r * columns + c] = Some(points[idx]);
    }
    let grid: Vec<Vector2<f64>> = grid.into_iter().collect::<Option<_>>().ok_or_else(irregular)?;

    // Columns grow to the right and rows downwards in the image.
    let along_row = grid[columns - 1] - grid[0];
    let along_column = grid[(rows - 1) * columns] - grid[0];
    let flip_c = along_row.x < 0.0 || (along_row.x == 0.0 && along_row.y < 0.0);
    let flip_r = along_column.y < 0.0 || (along_column.y == 0.0 && along_column.x < 0.0);

    let mut out = Vec::with_capacity(columns * rows);
    for r in 0..rows {
        let r = if flip_r { rows - 1 - r } else { r };
        for c in 0..columns {
            let c = if flip_c { columns - 1 - c } else { c };
            out.push(grid[r * columns + c]);
        }
    }
    Ok(out)
}

/// Closest point to `target` among those accepted by `keep`, with its distance.
fn nearest<F>(points: &[Vector2<f64>], target: &Vector2<f64>, keep: F) -> Option<(usize, f64)>
where
    F: Fn(usize) -> bool,
{
    points
        .iter()
        .enumerate()
        .filter(|(idx, _)| keep(*idx))
        .map(|(idx, p)| (idx, (p - target).norm()))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
}

/// Offsets from the seed to its nearest neighbour and to the nearest one
/// along a clearly different direction.
fn seed_axes(points: &[Vector2<f64>], seed: usize) -> Option<(Vector2<f64>, Vector2<f64>)> {
    let origin = points[seed];
    let mut offsets: Vec<Vector2<f64>> = points
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != seed)
        .map(|(_, p)| p - origin)
        .collect();
    offsets.sort_by(|a, b| a.norm().partial_cmp(&b.norm()).unwrap_or(Ordering::Equal));
    let first = *offsets.first()?;
    let second = offsets.iter().skip(1).find(|d| {
        let cos = first.dot(d) / (first.norm() * d.norm());
        cos.abs() < 0.6
    })?;
    Some((first, *second))
}

/// Step from `cell` towards `cell + delta`, taken from placed neighbours:
/// the step into `cell` along the same direction, or the same step in an
/// adjacent row.
fn local_step(
    points: &[Vector2<f64>],
    nodes: &HashMap<Cell, usize>,
    cell: Cell,
    delta: Cell,
) -> Option<Vector2<f64>> {
    let at = |c: Cell| nodes.get(&c).map(|&idx| points[idx]);
    let here = at(cell)?;
    if let Some(previous) = at((cell.0 - delta.0, cell.1 - delta.1)) {
        return Some(here - previous);
    }
    let side = (delta.1, delta.0);
    [1, -1].into_iter().find_map(|s| {
        let from = at((cell.0 + s * side.0, cell.1 + s * side.1))?;
        let to = at((cell.0 + s * side.0 + delta.0, cell.1 + s * side.1 + delta.1))?;
        Some(to - from)
    })
}
