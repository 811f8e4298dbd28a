//! OOD ensemble: fuses heterogeneous detectors into one calibrated scalar.
//!
//! Detectors that fail at score time contribute score 0 with weight 0; the
//! ensemble itself never raises on the hot path.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::errors::{PsnError, Result};
use crate::ood::detectors::{DetectorInputs, OodDetector};
use crate::uncertainty::kernels::percentile;

// ──────────────────── configuration ────────────────────

/// How component scores are fused into the ensemble scalar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OodCombination {
    #[default]
    WeightedMean,
    Max,
    /// Fraction of detectors whose score exceeds the threshold.
    Vote,
}

/// Ensemble-level configuration (config keys `ood.threshold`,
/// `ood.combination`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OodConfig {
    /// Scalar above which `is_ood = true`.
    pub threshold: f64,
    pub combination: OodCombination,
}

impl Default for OodConfig {
    fn default() -> Self {
        Self {
            threshold: 2.0,
            combination: OodCombination::WeightedMean,
        }
    }
}

// ──────────────────── result ────────────────────

/// Fused OOD decision with per-detector attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OodResult {
    pub ensemble_score: f64,
    pub component_scores: BTreeMap<String, f64>,
    pub is_ood: bool,
    /// Detector with the largest component score.
    pub dominant_detector: String,
    pub threshold: f64,
}

// ──────────────────── ensemble ────────────────────

/// Weighted ensemble over an ordered list of detectors.
pub struct OodEnsemble {
    detectors: Vec<Box<dyn OodDetector>>,
    weights: Vec<f64>,
    threshold: f64,
    combination: OodCombination,
}

impl std::fmt::Debug for OodEnsemble {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OodEnsemble")
            .field("n_detectors", &self.detectors.len())
            .field("weights", &self.weights)
            .field("threshold", &self.threshold)
            .field("combination", &self.combination)
            .finish()
    }
}

impl OodEnsemble {
    /// Build an ensemble. `weights = None` means uniform. Weights are
    /// normalized to sum to one; a length mismatch is a configuration error.
    pub fn new(
        detectors: Vec<Box<dyn OodDetector>>,
        weights: Option<Vec<f64>>,
        config: &OodConfig,
    ) -> Result<Self> {
        if detectors.is_empty() {
            return Err(PsnError::InvalidConfig {
                details: "OOD ensemble requires at least one detector".to_string(),
            });
        }
        let weights = match weights {
            Some(w) => {
                if w.len() != detectors.len() {
                    return Err(PsnError::InvalidConfig {
                        details: format!(
                            "{} weights for {} detectors",
                            w.len(),
                            detectors.len()
                        ),
                    });
                }
                w
            }
            None => vec![1.0; detectors.len()],
        };
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Err(PsnError::InvalidConfig {
                details: "detector weights must sum to a positive value".to_string(),
            });
        }
        Ok(Self {
            detectors,
            weights: weights.into_iter().map(|w| w / total).collect(),
            threshold: config.threshold,
            combination: config.combination,
        })
    }

    /// Current OOD threshold.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score the current inputs through every detector and fuse.
    ///
    /// Never fails: detectors that error contribute score 0 with weight 0.
    #[must_use]
    pub fn score(&self, inputs: &DetectorInputs<'_>) -> OodResult {
        let mut component_scores = BTreeMap::new();
        let mut weighted: Vec<(f64, f64)> = Vec::with_capacity(self.detectors.len());

        for (detector, &weight) in self.detectors.iter().zip(&self.weights) {
            match detector.score(inputs) {
                Ok(score) => {
                    component_scores.insert(detector.name().to_string(), score);
                    weighted.push((weight, score));
                }
                Err(_) => {
                    component_scores.insert(detector.name().to_string(), 0.0);
                    weighted.push((0.0, 0.0));
                }
            }
        }

        let ensemble_score = match self.combination {
            OodCombination::WeightedMean => {
                let total: f64 = weighted.iter().map(|(w, _)| w).sum();
                if total > 0.0 {
                    weighted.iter().map(|(w, s)| w * s).sum::<f64>() / total
                } else {
                    0.0
                }
            }
            OodCombination::Max => weighted
                .iter()
                .map(|&(_, s)| s)
                .fold(f64::NEG_INFINITY, f64::max),
            OodCombination::Vote => {
                let votes = weighted.iter().filter(|&&(_, s)| s > self.threshold).count();
                votes as f64 / self.detectors.len() as f64
            }
        };

        let dominant_detector = component_scores
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or_else(|| "none".to_string(), |(name, _)| name.clone());

        OodResult {
            ensemble_score,
            is_ood: ensemble_score > self.threshold,
            component_scores,
            dominant_detector,
            threshold: self.threshold,
        }
    }

    /// Calibrate the threshold at the `1 - target_fpr` percentile of a
    /// reference (in-distribution) score sample. Returns the new threshold.
    pub fn calibrate_threshold(&mut self, reference_scores: &[f64], target_fpr: f64) -> f64 {
        self.threshold = percentile(reference_scores, 100.0 * (1.0 - target_fpr));
        self.threshold
    }
}

// ──────────────────── tests ────────────────────
