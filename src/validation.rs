//! Numerical comparison of kernel outputs against a reference.
//!
//! An element passes when `|actual - expected| <= atol + rtol * |expected|`.
//! Drift is reported, never corrected.

use std::fmt;

/// Absolute and relative tolerance of a comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub atol: f32,
    pub rtol: f32,
}

impl Tolerance {
    pub const fn new(atol: f32, rtol: f32) -> Self {
        Self { atol, rtol }
    }

    /// Relative tolerance with a small absolute floor for values near zero.
    pub const fn relative(rtol: f32) -> Self {
        Self { atol: 1e-5, rtol }
    }

    /// FP32 kernels computing the same arithmetic in a different order.
    pub const fn f32_default() -> Self {
        Self {
            atol: 1e-6,
            rtol: 1e-5,
        }
    }

    #[inline]
    pub fn allows(&self, actual: f32, expected: f32) -> bool {
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self::f32_default()
    }
}

/// Outcome of [`compare_buffers`].
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonReport {
    pub passed: bool,
    pub max_abs_error: f32,
    pub mean_abs_error: f32,
    pub rms_error: f32,
    pub max_rel_error: f32,
    /// Elements outside tolerance. Non-finite values and length differences count.
    pub mismatches: usize,
    /// Index of the largest absolute error.
    pub worst_index: Option<usize>,
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (mismatches={}, max_abs={:.3e}, mean_abs={:.3e}, rms={:.3e}, max_rel={:.3e}",
            if self.passed { "passed" } else { "FAILED" },
            self.mismatches,
            self.max_abs_error,
            self.mean_abs_error,
            self.rms_error,
            self.max_rel_error
        )?;
        if let Some(i) = self.worst_index {
            write!(f, ", worst at {i}")?;
        }
        write!(f, ")")
    }
}

pub fn compare_buffers(actual: &[f32], expected: &[f32], tolerance: Tolerance) -> ComparisonReport {
    let n = actual.len().min(expected.len());
    let mut mismatches = actual.len().abs_diff(expected.len());
    let mut max_abs = 0.0f32;
    let mut max_rel = 0.0f32;
    let mut sum_abs = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut worst_index = None;

    for i in 0..n {
        let (a, e) = (actual[i], expected[i]);
        if !a.is_finite() || !e.is_finite() {
            mismatches += 1;
            continue;
        }
        let diff = (a - e).abs();
        if !tolerance.allows(a, e) {
            mismatches += 1;
        }
        if diff > max_abs || worst_index.is_none() {
            max_abs = max_abs.max(diff);
            worst_index = Some(i);
        }
        if e != 0.0 {
            max_rel = max_rel.max(diff / e.abs());
        }
        sum_abs += diff as f64;
        sum_sq += (diff as f64) * (diff as f64);
    }

    let denom = n.max(1) as f64;
    ComparisonReport {
        passed: mismatches == 0,
        max_abs_error: max_abs,
        mean_abs_error: (sum_abs / denom) as f32,
        rms_error: (sum_sq / denom).sqrt() as f32,
        max_rel_error: max_rel,
        mismatches,
        worst_index,
    }
}

/// Summary statistics of one buffer, for spotting degenerate outputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistributionStats {
    pub len: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std_dev: f32,
    pub non_finite: usize,
}

impl DistributionStats {
    pub fn of(data: &[f32]) -> Self {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f64;
        let mut non_finite = 0;
        for &v in data {
            if !v.is_finite() {
                non_finite += 1;
                continue;
            }
            min = min.min(v);
            max = max.max(v);
            sum += v as f64;
        }
        let finite = data.len() - non_finite;
        if finite == 0 {
            return Self {
                len: data.len(),
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                std_dev: 0.0,
                non_finite,
            };
        }
        let mean = sum / finite as f64;
        let var = data
            .iter()
            .filter(|v| v.is_finite())
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / finite as f64;
        Self {
            len: data.len(),
            min,
            max,
            mean: mean as f32,
            std_dev: var.sqrt() as f32,
            non_finite,
        }
    }

    /// Every value finite and not all equal.
    pub fn is_informative(&self) -> bool {
        self.non_finite == 0 && self.len > 1 && self.max > self.min
    }
}
