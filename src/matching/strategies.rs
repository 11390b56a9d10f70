//! Patch similarity measures for the correspondence search.
//!
//! NCC and SAD compare raw intensities, BRIEF compares binary descriptors by
//! Hamming distance. Each reports a confidence in `[0, 1]`.

use crate::matching::{best_in_band, Correspondence, MatchError, MatchStrategy, Patch, SearchBand};

/// Zero-mean normalised cross-correlation.
///
/// Confidence is the correlation clamped to `[0, 1]`; windows without
/// texture score zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NccStrategy;

fn zero_mean(values: &[f32]) -> (Vec<f64>, f64) {
    let n = values.len() as f64;
    let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
    let centred: Vec<f64> = values.iter().map(|v| *v as f64 - mean).collect();
    let norm = centred.iter().map(|v| v * v).sum::<f64>().sqrt();
    (centred, norm)
}

impl MatchStrategy for NccStrategy {
    fn name(&self) -> &'static str {
        "ncc"
    }

    fn find_match(&self, patch: &Patch, band: &SearchBand<'_>) -> Result<Correspondence, MatchError> {
        let (query, query_norm) = zero_mean(patch.values());
        best_in_band(patch.radius(), band, |window| {
            let (candidate, norm) = zero_mean(window.values());
            if query_norm <= f64::EPSILON || norm <= f64::EPSILON {
                return (0.0, 1.0);
            }
            let ncc = query
                .iter()
                .zip(&candidate)
                .map(|(a, b)| a * b)
                .sum::<f64>()
                / (query_norm * norm);
            (ncc.clamp(0.0, 1.0), 1.0 - ncc)
        })
    }
}

/// Mean absolute intensity difference.
///
/// Confidence is `1 - mad / 255`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SadStrategy;

impl MatchStrategy for SadStrategy {
    fn name(&self) -> &'static str {
        "sad"
    }

    fn find_match(&self, patch: &Patch, band: &SearchBand<'_>) -> Result<Correspondence, MatchError> {
        let query = patch.values();
        best_in_band(patch.radius(), band, |window| {
            let mad = query
                .iter()
                .zip(window.values())
                .map(|(a, b)| (a - b).abs() as f64)
                .sum::<f64>()
                / query.len() as f64;
            (1.0 - mad / 255.0, mad)
        })
    }
}

/// Binary descriptor of pairwise intensity comparisons, compared by Hamming
/// distance.
///
/// The comparison pattern is drawn from a fixed seed so that descriptors are
/// reproducible. Confidence is `1 - hamming / bits`.
#[derive(Debug, Clone)]
pub struct BriefStrategy {
    pub bits: usize,
    pub seed: u64,
}

impl Default for BriefStrategy {
    fn default() -> Self {
        BriefStrategy {
            bits: 256,
            seed: 0x2545_f491_4f6c_dd1d,
        }
    }
}

impl BriefStrategy {
    /// Index pairs into a patch of `len` values.
    fn pattern(&self, len: usize) -> Vec<(usize, usize)> {
        let mut state = self.seed;
        let mut next = || {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            ((state >> 33) % len as u64) as usize
        };
        (0..self.bits).map(|_| (next(), next())).collect()
    }

    fn describe(pattern: &[(usize, usize)], values: &[f32]) -> Vec<u64> {
        let mut words = vec![0u64; pattern.len().div_ceil(64)];
        for (i, (a, b)) in pattern.iter().enumerate() {
            if values[*a] < values[*b] {
                words[i / 64] |= 1 << (i % 64);
            }
        }
        words
    }
}

impl MatchStrategy for BriefStrategy {
    fn name(&self) -> &'static str {
        "brief"
    }

    fn find_match(&self, patch: &Patch, band: &SearchBand<'_>) -> Result<Correspondence, MatchError> {
        let pattern = self.pattern(patch.values().len());
        let query = Self::describe(&pattern, patch.values());
        let bits = self.bits.max(1) as f64;
        best_in_band(patch.radius(), band, |window| {
            let descriptor = Self::describe(&pattern, window.values());
            let hamming: u32 = query
                .iter()
                .zip(&descriptor)
                .map(|(a, b)| (a ^ b).count_ones())
                .sum();
            (1.0 - hamming as f64 / bits, hamming as f64)
        })
    }
}
