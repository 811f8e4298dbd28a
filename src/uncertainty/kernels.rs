//! Numeric kernels: entropy, ensemble variance, uncertainty decomposition,
//! and calibration metrics (Brier, ECE, NLL).
//!
//! All kernels operate on plain `f64` slices. Probabilities are clipped to
//! `[EPS, 1 - EPS]` before any logarithm.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use crate::core::errors::{PsnError, Result};

/// Probability clipping epsilon applied before logarithms.
pub const EPS: f64 = 1e-15;

#[inline]
fn clip(p: f64) -> f64 {
    p.clamp(EPS, 1.0 - EPS)
}

/// Entropy of a single probability row: `H(p) = -sum p_i ln p_i`.
#[must_use]
pub fn entropy(probs: &[f64]) -> f64 {
    probs.iter().map(|&p| {
        let p = clip(p);
        -p * p.ln()
    }).sum()
}

/// Mean entropy over a batch of probability rows.
#[must_use]
pub fn predictive_entropy(probs: &[Vec<f64>]) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    probs.iter().map(|row| entropy(row)).sum::<f64>() / probs.len() as f64
}

/// Element-wise variance of predictions across an ensemble of K members.
///
/// Population variance (divide by K), matching the decomposition identity's
/// expectation over members.
#[must_use]
pub fn ensemble_variance(predictions: &[Vec<f64>]) -> Vec<f64> {
    let k = predictions.len();
    if k == 0 {
        return Vec::new();
    }
    let dim = predictions[0].len();
    let mut mean = vec![0.0; dim];
    for member in predictions {
        for (m, &v) in mean.iter_mut().zip(member) {
            *m += v;
        }
    }
    for m in &mut mean {
        *m /= k as f64;
    }
    let mut var = vec![0.0; dim];
    for member in predictions {
        for ((v, &x), &m) in var.iter_mut().zip(member).zip(&mean) {
            let d = x - m;
            *v += d * d;
        }
    }
    for v in &mut var {
        *v /= k as f64;
    }
    var
}

/// Decomposition of predictive uncertainty into aleatoric and epistemic parts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UncertaintyDecomposition {
    /// `H(E_k[p_k])` — entropy of the mean prediction.
    pub total: f64,
    /// `E_k[H(p_k)]` — mean of member entropies.
    pub aleatoric: f64,
    /// `total - aleatoric` — mutual information between label and member.
    pub epistemic: f64,
}

/// Decompose ensemble uncertainty via mutual information.
///
/// `ensemble_probs` is K members × N samples × C classes. The identity
/// `total = aleatoric + epistemic` holds exactly by construction; callers
/// relying on it may assume 1e-5 relative tolerance.
pub fn decompose_uncertainty(
    ensemble_probs: &[Vec<Vec<f64>>],
) -> Result<UncertaintyDecomposition> {
    let k = ensemble_probs.len();
    if k == 0 {
        return Err(PsnError::InsufficientData {
            context: "decompose_uncertainty",
            needed: 1,
            got: 0,
        });
    }
    let n = ensemble_probs[0].len();
    for member in ensemble_probs {
        if member.len() != n {
            return Err(PsnError::DimensionMismatch {
                context: "decompose_uncertainty",
                expected: n,
                got: member.len(),
            });
        }
    }
    if n == 0 {
        return Ok(UncertaintyDecomposition {
            total: 0.0,
            aleatoric: 0.0,
            epistemic: 0.0,
        });
    }

    let classes = ensemble_probs[0][0].len();
    // Total: entropy of the member-mean prediction, averaged over samples.
    let mut mean_rows = vec![vec![0.0; classes]; n];
    for member in ensemble_probs {
        for (mean_row, row) in mean_rows.iter_mut().zip(member) {
            if row.len() != classes {
                return Err(PsnError::DimensionMismatch {
                    context: "decompose_uncertainty",
                    expected: classes,
                    got: row.len(),
                });
            }
            for (m, &p) in mean_row.iter_mut().zip(row) {
                *m += p;
            }
        }
    }
    for row in &mut mean_rows {
        for m in row.iter_mut() {
            *m /= k as f64;
        }
    }
    let total = predictive_entropy(&mean_rows);

    // Aleatoric: member entropies averaged over members and samples.
    let aleatoric = ensemble_probs
        .iter()
        .map(|member| predictive_entropy(member))
        .sum::<f64>()
        / k as f64;

    Ok(UncertaintyDecomposition {
        total,
        aleatoric,
        epistemic: total - aleatoric,
    })
}

/// Brier score: mean squared error between probabilities and targets.
#[must_use]
pub fn brier_score(probs: &[f64], targets: &[f64]) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    probs
        .iter()
        .zip(targets)
        .map(|(&p, &t)| (p - t) * (p - t))
        .sum::<f64>()
        / probs.len() as f64
}

/// Expected calibration error with equal-width left-open bins on (0, 1].
///
/// Each bin contributes `|accuracy - confidence|` weighted by its population
/// fraction. `labels` are 0/1 correctness indicators matching `probs`.
#[must_use]
pub fn expected_calibration_error(probs: &[f64], labels: &[f64], n_bins: usize) -> f64 {
    let n = probs.len();
    if n == 0 || n_bins == 0 {
        return 0.0;
    }
    let mut ece = 0.0;
    for bin in 0..n_bins {
        let lower = bin as f64 / n_bins as f64;
        let upper = (bin + 1) as f64 / n_bins as f64;
        let mut count = 0usize;
        let mut acc = 0.0;
        let mut conf = 0.0;
        for (&p, &y) in probs.iter().zip(labels) {
            if p > lower && p <= upper {
                count += 1;
                acc += y;
                conf += p;
            }
        }
        if count > 0 {
            let weight = count as f64 / n as f64;
            ece += (acc / count as f64 - conf / count as f64).abs() * weight;
        }
    }
    ece
}

/// Negative log-likelihood with probability clipping.
#[must_use]
pub fn negative_log_likelihood(probs: &[f64], targets: &[f64]) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }
    -probs
        .iter()
        .zip(targets)
        .map(|(&p, &t)| t * clip(p).ln())
        .sum::<f64>()
        / probs.len() as f64
}

/// Percentile with linear interpolation between order statistics, `p` in
/// [0, 100]. Matches the interpolation used throughout the crate (conformal
/// quantiles, rolling stats, threshold calibration).
#[must_use]
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile_of_sorted(&sorted, p)
}

/// Percentile of an already-sorted slice. See [`percentile`].
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn percentile_of_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n == 1 {
        return sorted[0];
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

// ──────────────────── tests ────────────────────
