//! Out-of-distribution detectors: Mahalanobis distance, energy score,
//! label-shift KL, and dynamics-residual z-score.
//!
//! Detectors share one contract: `fit` ingests reference data and may fail;
//! `score` returns a scalar where higher means more OOD. A detector that
//! cannot score the given inputs returns an error, which the ensemble turns
//! into graceful degradation (score 0, weight 0) rather than a raised fault.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use crate::core::errors::{PsnError, Result};

// ──────────────────── detector inputs ────────────────────

/// Inputs offered to detectors at score time. Each detector routes to the
/// slice it needs; absent inputs make that detector's `score` fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectorInputs<'a> {
    /// Feature/embedding vector for the current sample (also read as logits
    /// by the energy detector).
    pub features: &'a [f64],
    /// Batch of prediction probability rows (N x C), for label-shift.
    pub prediction_probs: Option<&'a [Vec<f64>]>,
    /// Batch of predicted labels, alternative label-shift input.
    pub predicted_labels: Option<&'a [usize]>,
    /// Current dynamics-model residual vector.
    pub dynamics_residual: Option<&'a [f64]>,
}

impl<'a> DetectorInputs<'a> {
    #[must_use]
    pub fn from_features(features: &'a [f64]) -> Self {
        Self {
            features,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_prediction_probs(mut self, probs: &'a [Vec<f64>]) -> Self {
        self.prediction_probs = Some(probs);
        self
    }

    #[must_use]
    pub fn with_predicted_labels(mut self, labels: &'a [usize]) -> Self {
        self.predicted_labels = Some(labels);
        self
    }

    #[must_use]
    pub fn with_dynamics_residual(mut self, residual: &'a [f64]) -> Self {
        self.dynamics_residual = Some(residual);
        self
    }
}

/// An out-of-distribution detector. Higher score means more OOD.
pub trait OodDetector: Send + Sync {
    /// Stable detector name used for component attribution.
    fn name(&self) -> &'static str;

    /// Fit on reference (in-distribution) data.
    fn fit(&mut self, data: &[Vec<f64>], labels: Option<&[usize]>) -> Result<()>;

    /// Score the current inputs. Fails when unfitted or when the inputs the
    /// detector needs are absent.
    fn score(&self, inputs: &DetectorInputs<'_>) -> Result<f64>;
}

// ──────────────────── small dense linear algebra ────────────────────

fn column_mean(data: &[Vec<f64>]) -> Vec<f64> {
    let n = data.len();
    let dim = data[0].len();
    let mut mean = vec![0.0; dim];
    for row in data {
        for (m, &v) in mean.iter_mut().zip(row) {
            *m += v;
        }
    }
    for m in &mut mean {
        *m /= n as f64;
    }
    mean
}

/// Sample covariance (denominator n - 1) of row-major data.
fn covariance(data: &[Vec<f64>], mean: &[f64]) -> Vec<Vec<f64>> {
    let n = data.len();
    let dim = mean.len();
    let mut cov = vec![vec![0.0; dim]; dim];
    for row in data {
        for i in 0..dim {
            let di = row[i] - mean[i];
            for j in 0..dim {
                cov[i][j] += di * (row[j] - mean[j]);
            }
        }
    }
    let denom = (n - 1).max(1) as f64;
    for row in &mut cov {
        for v in row.iter_mut() {
            *v /= denom;
        }
    }
    cov
}

/// Gauss-Jordan inversion with partial pivoting. A vanishing pivot after
/// regularization surfaces as `NumericalFailure`.
fn invert_matrix(mut m: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>> {
    let n = m.len();
    let mut inv: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| f64::from(u8::from(i == j))).collect())
        .collect();

    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))
            .unwrap_or(col);
        if m[pivot_row][col].abs() < 1e-12 {
            return Err(PsnError::NumericalFailure {
                context: "invert_matrix",
                details: format!("singular matrix at column {col}"),
            });
        }
        m.swap(col, pivot_row);
        inv.swap(col, pivot_row);

        let pivot = m[col][col];
        for j in 0..n {
            m[col][j] /= pivot;
            inv[col][j] /= pivot;
        }
        let pivot_m = m[col].clone();
        let pivot_inv = inv[col].clone();
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = m[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                m[row][j] -= factor * pivot_m[j];
                inv[row][j] -= factor * pivot_inv[j];
            }
        }
    }
    Ok(inv)
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|&x| x * x).sum::<f64>().sqrt()
}

// ──────────────────── mahalanobis ────────────────────

/// Mahalanobis-distance detector over a fitted mean and regularized inverse
/// covariance (`Sigma + 1e-6 I`).
#[derive(Debug, Clone, Default)]
pub struct MahalanobisDetector {
    mean: Vec<f64>,
    precision: Vec<Vec<f64>>,
    fitted: bool,
}

impl MahalanobisDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OodDetector for MahalanobisDetector {
    fn name(&self) -> &'static str {
        "mahalanobis"
    }

    fn fit(&mut self, data: &[Vec<f64>], _labels: Option<&[usize]>) -> Result<()> {
        if data.len() < 2 {
            return Err(PsnError::InsufficientData {
                context: "mahalanobis_fit",
                needed: 2,
                got: data.len(),
            });
        }
        let mean = column_mean(data);
        let mut cov = covariance(data, &mean);
        for (i, row) in cov.iter_mut().enumerate() {
            row[i] += 1e-6;
        }
        self.precision = invert_matrix(cov)?;
        self.mean = mean;
        self.fitted = true;
        Ok(())
    }

    fn score(&self, inputs: &DetectorInputs<'_>) -> Result<f64> {
        if !self.fitted {
            return Err(PsnError::NotCalibrated {
                component: "mahalanobis",
            });
        }
        let x = inputs.features;
        if x.len() != self.mean.len() {
            return Err(PsnError::DimensionMismatch {
                context: "mahalanobis_score",
                expected: self.mean.len(),
                got: x.len(),
            });
        }
        let diff: Vec<f64> = x.iter().zip(&self.mean).map(|(&a, &b)| a - b).collect();
        let mut quad = 0.0;
        for (i, &di) in diff.iter().enumerate() {
            for (j, &dj) in diff.iter().enumerate() {
                quad += di * self.precision[i][j] * dj;
            }
        }
        Ok(quad.max(0.0).sqrt())
    }
}

// ──────────────────── energy ────────────────────

/// Energy-based detector: `-T * logsumexp(logits / T)`, computed with
/// row-max subtraction. Lower energy = more in-distribution, so the score
/// (negative energy convention inverted by the formula itself) rises with
/// OOD-ness. `fit` is a no-op.
#[derive(Debug, Clone)]
pub struct EnergyDetector {
    temperature: f64,
}

impl EnergyDetector {
    #[must_use]
    pub fn new(temperature: f64) -> Self {
        Self {
            temperature: temperature.max(1e-9),
        }
    }
}

impl Default for EnergyDetector {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl OodDetector for EnergyDetector {
    fn name(&self) -> &'static str {
        "energy"
    }

    fn fit(&mut self, _data: &[Vec<f64>], _labels: Option<&[usize]>) -> Result<()> {
        Ok(())
    }

    fn score(&self, inputs: &DetectorInputs<'_>) -> Result<f64> {
        let logits = inputs.features;
        if logits.is_empty() {
            return Err(PsnError::InsufficientData {
                context: "energy_score",
                needed: 1,
                got: 0,
            });
        }
        let t = self.temperature;
        let max = logits
            .iter()
            .map(|&l| l / t)
            .fold(f64::NEG_INFINITY, f64::max);
        let sum_exp: f64 = logits.iter().map(|&l| (l / t - max).exp()).sum();
        Ok(-t * (max + sum_exp.ln()))
    }
}

// ──────────────────── label shift ────────────────────

/// Label-shift detector: KL divergence from the current prediction
/// distribution to the training-label reference distribution.
#[derive(Debug, Clone, Default)]
pub struct LabelShiftDetector {
    reference: Vec<f64>,
}

impl LabelShiftDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn current_distribution(&self, inputs: &DetectorInputs<'_>) -> Result<Vec<f64>> {
        if let Some(probs) = inputs.prediction_probs {
            if probs.is_empty() {
                return Err(PsnError::InsufficientData {
                    context: "label_shift_score",
                    needed: 1,
                    got: 0,
                });
            }
            let classes = probs[0].len();
            let mut dist = vec![0.0; classes];
            for row in probs {
                for (d, &p) in dist.iter_mut().zip(row) {
                    *d += p;
                }
            }
            for d in &mut dist {
                *d /= probs.len() as f64;
            }
            return Ok(dist);
        }
        if let Some(labels) = inputs.predicted_labels {
            if labels.is_empty() {
                return Err(PsnError::InsufficientData {
                    context: "label_shift_score",
                    needed: 1,
                    got: 0,
                });
            }
            let classes = self.reference.len();
            let mut counts = vec![0.0; classes];
            for &label in labels {
                if label < classes {
                    counts[label] += 1.0;
                }
            }
            let total: f64 = counts.iter().sum::<f64>() + 1e-10;
            for c in &mut counts {
                *c /= total;
            }
            return Ok(counts);
        }
        Err(PsnError::external(
            "label_shift",
            "no prediction batch supplied",
        ))
    }
}

impl OodDetector for LabelShiftDetector {
    fn name(&self) -> &'static str {
        "label_shift"
    }

    fn fit(&mut self, _data: &[Vec<f64>], labels: Option<&[usize]>) -> Result<()> {
        let Some(labels) = labels else {
            return Err(PsnError::InvalidConfig {
                details: "label-shift detector requires labels for fitting".to_string(),
            });
        };
        if labels.is_empty() {
            return Err(PsnError::InsufficientData {
                context: "label_shift_fit",
                needed: 1,
                got: 0,
            });
        }
        let classes = labels.iter().max().copied().unwrap_or(0) + 1;
        let mut counts = vec![0.0; classes];
        for &label in labels {
            counts[label] += 1.0;
        }
        let total: f64 = counts.iter().sum();
        for c in &mut counts {
            *c /= total;
        }
        self.reference = counts;
        Ok(())
    }

    fn score(&self, inputs: &DetectorInputs<'_>) -> Result<f64> {
        if self.reference.is_empty() {
            return Err(PsnError::NotCalibrated {
                component: "label_shift",
            });
        }
        let mut current = self.current_distribution(inputs)?;
        let mut reference = self.reference.clone();

        // Zero-pad when class counts mismatch.
        let len = current.len().max(reference.len());
        current.resize(len, 0.0);
        reference.resize(len, 0.0);

        let kl = current
            .iter()
            .zip(&reference)
            .map(|(&p, &q)| {
                let p = p.clamp(1e-10, 1.0);
                let q = q.clamp(1e-10, 1.0);
                p * (p / q).ln()
            })
            .sum();
        Ok(kl)
    }
}

// ──────────────────── dynamics residual ────────────────────

/// Dynamics-shift detector: positive-side z-score of the current residual
/// norm against the fitted residual-norm distribution.
#[derive(Debug, Clone)]
pub struct DynamicsResidualDetector {
    mean_residual: f64,
    std_residual: f64,
    fitted: bool,
}

impl DynamicsResidualDetector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mean_residual: 0.0,
            std_residual: 1.0,
            fitted: false,
        }
    }
}

impl Default for DynamicsResidualDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl OodDetector for DynamicsResidualDetector {
    fn name(&self) -> &'static str {
        "dynamics_residual"
    }

    fn fit(&mut self, data: &[Vec<f64>], _labels: Option<&[usize]>) -> Result<()> {
        if data.is_empty() {
            return Err(PsnError::InsufficientData {
                context: "dynamics_residual_fit",
                needed: 1,
                got: 0,
            });
        }
        let norms: Vec<f64> = data.iter().map(|r| norm(r)).collect();
        let mean = norms.iter().sum::<f64>() / norms.len() as f64;
        let var =
            norms.iter().map(|&x| (x - mean) * (x - mean)).sum::<f64>() / norms.len() as f64;
        self.mean_residual = mean;
        self.std_residual = var.sqrt() + 1e-6;
        self.fitted = true;
        Ok(())
    }

    fn score(&self, inputs: &DetectorInputs<'_>) -> Result<f64> {
        if !self.fitted {
            return Err(PsnError::NotCalibrated {
                component: "dynamics_residual",
            });
        }
        let residual = inputs.dynamics_residual.ok_or_else(|| {
            PsnError::external("dynamics_residual", "no residual supplied")
        })?;
        let z = (norm(residual) - self.mean_residual) / self.std_residual;
        Ok(z.max(0.0))
    }
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn standard_normal_ish(n: usize, dim: usize) -> Vec<Vec<f64>> {
        // Deterministic spread with zero mean and ~unit scale per dim.
        (0..n)
            .map(|i| {
                (0..dim)
                    .map(|d| {
                        let t = (i * dim + d) as f64;
                        ((t * 0.7368).sin() * 1.7).clamp(-3.0, 3.0)
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn invert_matrix_identity() {
        let m = vec![vec![2.0, 0.0], vec![0.0, 4.0]];
        let inv = invert_matrix(m).unwrap();
        assert!((inv[0][0] - 0.5).abs() < 1e-12);
        assert!((inv[1][1] - 0.25).abs() < 1e-12);
        assert!(inv[0][1].abs() < 1e-12);
    }

    #[test]
    fn invert_matrix_rejects_singular() {
        let m = vec![vec![1.0, 2.0], vec![2.0, 4.0]];
        let err = invert_matrix(m).unwrap_err();
        assert_eq!(err.code(), "PSN-2004");
    }

    #[test]
    fn mahalanobis_zero_at_mean() {
        let data = standard_normal_ish(200, 2);
        let mut detector = MahalanobisDetector::new();
        detector.fit(&data, None).unwrap();

        let mean = column_mean(&data);
        let score = detector
            .score(&DetectorInputs::from_features(&mean))
            .unwrap();
        assert!(score < 1e-6);
    }

    #[test]
    fn mahalanobis_grows_with_distance() {
        let data = standard_normal_ish(200, 2);
        let mut detector = MahalanobisDetector::new();
        detector.fit(&data, None).unwrap();

        let near = detector
            .score(&DetectorInputs::from_features(&[0.5, 0.5]))
            .unwrap();
        let far = detector
            .score(&DetectorInputs::from_features(&[10.0, 10.0]))
            .unwrap();
        assert!(far > near);
    }

    #[test]
    fn mahalanobis_unfitted_and_mismatched() {
        let detector = MahalanobisDetector::new();
        assert_eq!(
            detector
                .score(&DetectorInputs::from_features(&[0.0]))
                .unwrap_err()
                .code(),
            "PSN-2002"
        );

        let mut detector = MahalanobisDetector::new();
        detector.fit(&standard_normal_ish(50, 2), None).unwrap();
        assert_eq!(
            detector
                .score(&DetectorInputs::from_features(&[0.0, 0.0, 0.0]))
                .unwrap_err()
                .code(),
            "PSN-2003"
        );
    }

    #[test]
    fn energy_matches_logsumexp() {
        let detector = EnergyDetector::new(1.0);
        let logits = [1.0, 2.0, 3.0];
        let expect = -((1.0_f64.exp() + 2.0_f64.exp() + 3.0_f64.exp()).ln());
        let score = detector
            .score(&DetectorInputs::from_features(&logits))
            .unwrap();
        assert!((score - expect).abs() < 1e-9);
    }

    #[test]
    fn energy_stable_for_large_logits() {
        let detector = EnergyDetector::new(1.0);
        let logits = [1000.0, 999.0];
        let score = detector
            .score(&DetectorInputs::from_features(&logits))
            .unwrap();
        assert!(score.is_finite());
        // Confident (large) logits mean low energy, i.e. strongly negative.
        assert!(score < -998.0);
    }

    #[test]
    fn energy_higher_for_flat_logits() {
        let detector = EnergyDetector::default();
        let confident = detector
            .score(&DetectorInputs::from_features(&[10.0, 0.0, 0.0]))
            .unwrap();
        let flat = detector
            .score(&DetectorInputs::from_features(&[0.1, 0.1, 0.1]))
            .unwrap();
        assert!(flat > confident);
    }

    #[test]
    fn label_shift_zero_for_matching_distribution() {
        let mut detector = LabelShiftDetector::new();
        let labels: Vec<usize> = (0..100).map(|i| i % 2).collect();
        detector.fit(&[], Some(&labels)).unwrap();

        let probs = vec![vec![0.5, 0.5]; 10];
        let inputs = DetectorInputs::from_features(&[]).with_prediction_probs(&probs);
        let score = detector.score(&inputs).unwrap();
        assert!(score.abs() < 1e-9);
    }

    #[test]
    fn label_shift_detects_skew() {
        let mut detector = LabelShiftDetector::new();
        let labels: Vec<usize> = (0..100).map(|i| i % 2).collect();
        detector.fit(&[], Some(&labels)).unwrap();

        let skewed = vec![vec![0.99, 0.01]; 10];
        let inputs = DetectorInputs::from_features(&[]).with_prediction_probs(&skewed);
        assert!(detector.score(&inputs).unwrap() > 0.3);
    }

    #[test]
    fn label_shift_from_predicted_labels_pads_classes() {
        let mut detector = LabelShiftDetector::new();
        let labels: Vec<usize> = (0..90).map(|i| i % 3).collect();
        detector.fit(&[], Some(&labels)).unwrap();

        // Only class 0 predicted: heavy shift.
        let predicted = vec![0usize; 30];
        let inputs = DetectorInputs::from_features(&[]).with_predicted_labels(&predicted);
        assert!(detector.score(&inputs).unwrap() > 0.5);
    }

    #[test]
    fn label_shift_requires_labels_on_fit() {
        let mut detector = LabelShiftDetector::new();
        assert_eq!(detector.fit(&[], None).unwrap_err().code(), "PSN-1001");
    }

    #[test]
    fn dynamics_residual_z_score() {
        let mut detector = DynamicsResidualDetector::new();
        // Residual norms all 1.0 -> mean 1.0, std ~0.
        let history = vec![vec![1.0, 0.0]; 50];
        detector.fit(&history, None).unwrap();

        let nominal = detector
            .score(&DetectorInputs::from_features(&[]).with_dynamics_residual(&[1.0, 0.0]))
            .unwrap();
        assert!(nominal < 1e-3);

        let shifted = detector
            .score(&DetectorInputs::from_features(&[]).with_dynamics_residual(&[5.0, 0.0]))
            .unwrap();
        assert!(shifted > 1.0);
    }

    #[test]
    fn dynamics_residual_clamps_negative_z() {
        let mut detector = DynamicsResidualDetector::new();
        let history: Vec<Vec<f64>> = (1..=50).map(|i| vec![f64::from(i) * 0.1]).collect();
        detector.fit(&history, None).unwrap();

        let below_mean = detector
            .score(&DetectorInputs::from_features(&[]).with_dynamics_residual(&[0.0]))
            .unwrap();
        assert!(below_mean.abs() < f64::EPSILON);
    }

    #[test]
    fn dynamics_residual_requires_residual_input() {
        let mut detector = DynamicsResidualDetector::new();
        detector.fit(&[vec![1.0]], None).unwrap();
        let err = detector
            .score(&DetectorInputs::from_features(&[1.0]))
            .unwrap_err();
        assert_eq!(err.code(), "PSN-3101");
    }
}
