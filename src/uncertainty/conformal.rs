//! Conformal prediction engine: split, adaptive (ACI), and mondrian
//! (class-conditional) predictors with finite-sample coverage guarantees.
//!
//! All predictors share one contract: `fit` may fail (insufficient
//! calibration, missing labels), `predict` never fails — an uncalibrated
//! predictor emits results with `valid = false` and an explanatory message.
//! Calibration state is published behind an internal mutex so predictors can
//! be shared across worker threads.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::contracts::unix_now;
use crate::core::errors::{PsnError, Result};
use crate::uncertainty::kernels::{EPS, percentile};

// ──────────────────── configuration ────────────────────

/// Configuration shared by the conformal predictors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConformalConfig {
    /// Target coverage probability of the prediction set (e.g. 0.9).
    pub coverage: f64,
    /// Minimum calibration samples required by `fit`.
    pub min_calibration_size: usize,
    /// Calibration scores above this percentile are clipped before the
    /// quantile is taken, bounding sensitivity to outliers.
    pub score_clip_percentile: f64,
    /// Online quantile step size for the adaptive predictor.
    pub gamma: f64,
    /// Optional upper clamp on the adaptive quantile. `None` leaves the
    /// quantile unbounded above under drift.
    pub max_quantile: Option<f64>,
    /// Window length for the adaptive predictor's running coverage.
    pub coverage_window: usize,
}

impl Default for ConformalConfig {
    fn default() -> Self {
        Self {
            coverage: 0.9,
            min_calibration_size: 100,
            score_clip_percentile: 99.0,
            gamma: 0.01,
            max_quantile: None,
            coverage_window: 100,
        }
    }
}

// ──────────────────── results and calibration data ────────────────────

/// Result of conformal prediction for one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformalResult {
    /// Class indices whose nonconformity clears the quantile.
    pub prediction_set: Vec<usize>,
    pub set_size: usize,
    /// Target coverage probability used.
    pub coverage: f64,
    /// Nonconformity quantile threshold applied.
    pub quantile: f64,
    pub valid: bool,
    pub message: String,
}

impl ConformalResult {
    fn invalid(coverage: f64, message: &str) -> Self {
        Self {
            prediction_set: Vec::new(),
            set_size: 0,
            coverage,
            quantile: f64::INFINITY,
            valid: false,
            message: message.to_string(),
        }
    }

    fn valid(prediction_set: Vec<usize>, coverage: f64, quantile: f64) -> Self {
        Self {
            set_size: prediction_set.len(),
            prediction_set,
            coverage,
            quantile,
            valid: true,
            message: String::new(),
        }
    }
}

/// Published calibration state. Immutable once stored; only the adaptive
/// predictor mutates its quantile in place (and it does not publish
/// `CalibrationData`s per update).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    pub id: String,
    pub quantile: f64,
    pub coverage: f64,
    pub n_samples: usize,
    /// `split` | `adaptive` | `mondrian`.
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_class_quantiles: Option<BTreeMap<usize, f64>>,
    /// Unix seconds at publication.
    pub created_at: f64,
}

fn new_calibration_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ──────────────────── quantile math ────────────────────

/// Quantile of nonconformity scores at the finite-sample adjusted level
/// `min((1 - alpha)(1 + 1/n), 1)`, guaranteeing coverage >= `1 - alpha`
/// under exchangeability.
#[must_use]
pub fn conformal_quantile(scores: &[f64], coverage: f64) -> f64 {
    let n = scores.len();
    if n == 0 {
        return f64::INFINITY;
    }
    let adjusted = (coverage * (1.0 + 1.0 / n as f64)).min(1.0);
    percentile(scores, adjusted * 100.0)
}

fn clip_scores(scores: &[f64], clip_percentile: f64) -> Vec<f64> {
    let cap = percentile(scores, clip_percentile);
    scores.iter().map(|&s| s.min(cap)).collect()
}

fn sets_from_rows(rows: &[Vec<f64>], quantile: f64, coverage: f64) -> Vec<ConformalResult> {
    rows.iter()
        .map(|row| {
            let set: Vec<usize> = row
                .iter()
                .enumerate()
                .filter(|&(_, &s)| s <= quantile)
                .map(|(c, _)| c)
                .collect();
            ConformalResult::valid(set, coverage, quantile)
        })
        .collect()
}

// ──────────────────── predictor trait ────────────────────

/// Common interface over the three conformal variants.
pub trait ConformalPredictor: Send + Sync {
    /// Calibrate on held-out nonconformity scores. Labels are required only
    /// by the mondrian variant. Returns a calibration id.
    fn fit(&self, scores: &[f64], labels: Option<&[usize]>) -> Result<String>;

    /// Emit one result per sample row of per-class nonconformity scores.
    /// Never fails; an uncalibrated predictor returns `valid = false`.
    fn predict(&self, scores_per_class: &[Vec<f64>]) -> Vec<ConformalResult>;

    /// Stable method name (`split` | `adaptive` | `mondrian`).
    fn method(&self) -> &'static str;
}

// ──────────────────── split conformal ────────────────────

/// Split conformal prediction over a held-out calibration set.
pub struct SplitConformalPredictor {
    config: ConformalConfig,
    calibration: Mutex<Option<CalibrationData>>,
}

impl SplitConformalPredictor {
    #[must_use]
    pub fn new(config: ConformalConfig) -> Self {
        Self {
            config,
            calibration: Mutex::new(None),
        }
    }

    /// Snapshot of the current calibration, if fitted.
    #[must_use]
    pub fn calibration(&self) -> Option<CalibrationData> {
        self.calibration.lock().clone()
    }
}

impl ConformalPredictor for SplitConformalPredictor {
    fn fit(&self, scores: &[f64], _labels: Option<&[usize]>) -> Result<String> {
        if scores.len() < self.config.min_calibration_size {
            return Err(PsnError::InsufficientData {
                context: "split_conformal_fit",
                needed: self.config.min_calibration_size,
                got: scores.len(),
            });
        }

        let clipped = clip_scores(scores, self.config.score_clip_percentile);
        let quantile = conformal_quantile(&clipped, self.config.coverage);

        let data = CalibrationData {
            id: new_calibration_id(),
            quantile,
            coverage: self.config.coverage,
            n_samples: clipped.len(),
            method: "split".to_string(),
            per_class_quantiles: None,
            created_at: unix_now(),
        };
        let id = data.id.clone();
        *self.calibration.lock() = Some(data);
        Ok(id)
    }

    fn predict(&self, scores_per_class: &[Vec<f64>]) -> Vec<ConformalResult> {
        let (quantile, coverage) = {
            let guard = self.calibration.lock();
            match guard.as_ref() {
                Some(c) => (c.quantile, c.coverage),
                None => {
                    return vec![ConformalResult::invalid(
                        self.config.coverage,
                        "predictor not calibrated; call fit() first",
                    )];
                }
            }
        };
        sets_from_rows(scores_per_class, quantile, coverage)
    }

    fn method(&self) -> &'static str {
        "split"
    }
}

// ──────────────────── adaptive conformal (ACI) ────────────────────

#[derive(Debug)]
struct AdaptiveState {
    quantile: f64,
    fitted: bool,
    n_updates: u64,
    coverage_history: VecDeque<bool>,
}

/// Adaptive conformal inference: the quantile tracks observed coverage
/// online, maintaining target coverage asymptotically under arbitrary
/// distribution drift.
pub struct AdaptiveConformalPredictor {
    config: ConformalConfig,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveConformalPredictor {
    #[must_use]
    pub fn new(config: ConformalConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AdaptiveState {
                quantile: 0.0,
                fitted: false,
                n_updates: 0,
                coverage_history: VecDeque::new(),
            }),
        }
    }

    /// Online quantile update from one observed outcome. Covered steps
    /// shrink the quantile by `gamma * (1 - coverage)`; misses grow it by
    /// `gamma * coverage`. The quantile is floored at zero and clamped at
    /// `max_quantile` when configured.
    pub fn update(&self, true_label: usize, prediction_set: &[usize]) {
        let covered = prediction_set.contains(&true_label);
        let target = self.config.coverage;

        let mut state = self.state.lock();
        if covered {
            state.quantile -= self.config.gamma * (1.0 - target);
        } else {
            state.quantile += self.config.gamma * target;
        }
        state.quantile = state.quantile.max(0.0);
        if let Some(cap) = self.config.max_quantile {
            state.quantile = state.quantile.min(cap);
        }
        state.n_updates += 1;
        state.coverage_history.push_back(covered);
        while state.coverage_history.len() > self.config.coverage_window {
            state.coverage_history.pop_front();
        }
    }

    /// Empirical coverage over the most recent update window.
    #[must_use]
    pub fn running_coverage(&self) -> f64 {
        let state = self.state.lock();
        if state.coverage_history.is_empty() {
            return 0.0;
        }
        let covered = state.coverage_history.iter().filter(|&&c| c).count();
        covered as f64 / state.coverage_history.len() as f64
    }

    /// Current quantile value.
    #[must_use]
    pub fn quantile(&self) -> f64 {
        self.state.lock().quantile
    }

    /// Number of online updates applied since `fit`.
    #[must_use]
    pub fn update_count(&self) -> u64 {
        self.state.lock().n_updates
    }
}

impl ConformalPredictor for AdaptiveConformalPredictor {
    fn fit(&self, scores: &[f64], _labels: Option<&[usize]>) -> Result<String> {
        if scores.len() < self.config.min_calibration_size {
            return Err(PsnError::InsufficientData {
                context: "adaptive_conformal_fit",
                needed: self.config.min_calibration_size,
                got: scores.len(),
            });
        }

        let quantile = conformal_quantile(scores, self.config.coverage);
        let mut state = self.state.lock();
        state.quantile = quantile;
        state.fitted = true;
        state.n_updates = 0;
        state.coverage_history.clear();
        Ok(new_calibration_id())
    }

    fn predict(&self, scores_per_class: &[Vec<f64>]) -> Vec<ConformalResult> {
        let quantile = {
            let state = self.state.lock();
            if !state.fitted {
                return vec![ConformalResult::invalid(
                    self.config.coverage,
                    "predictor not calibrated; call fit() first",
                )];
            }
            state.quantile
        };
        sets_from_rows(scores_per_class, quantile, self.config.coverage)
    }

    fn method(&self) -> &'static str {
        "adaptive"
    }
}

// ──────────────────── mondrian conformal ────────────────────

/// Mondrian (class-conditional) conformal prediction: a separate quantile
/// per class, falling back to the global quantile for thin classes.
pub struct MondrianConformalPredictor {
    config: ConformalConfig,
    class_quantiles: Mutex<Option<BTreeMap<usize, f64>>>,
}

/// Minimum calibration samples a class needs for its own quantile.
const MIN_PER_CLASS: usize = 10;

impl MondrianConformalPredictor {
    #[must_use]
    pub fn new(config: ConformalConfig) -> Self {
        Self {
            config,
            class_quantiles: Mutex::new(None),
        }
    }

    /// Per-class quantiles, if fitted.
    #[must_use]
    pub fn class_quantiles(&self) -> Option<BTreeMap<usize, f64>> {
        self.class_quantiles.lock().clone()
    }
}

impl ConformalPredictor for MondrianConformalPredictor {
    fn fit(&self, scores: &[f64], labels: Option<&[usize]>) -> Result<String> {
        let Some(labels) = labels else {
            return Err(PsnError::InvalidConfig {
                details: "mondrian conformal requires labels for class-conditional calibration"
                    .to_string(),
            });
        };
        if labels.len() != scores.len() {
            return Err(PsnError::DimensionMismatch {
                context: "mondrian_conformal_fit",
                expected: scores.len(),
                got: labels.len(),
            });
        }
        if scores.len() < self.config.min_calibration_size {
            return Err(PsnError::InsufficientData {
                context: "mondrian_conformal_fit",
                needed: self.config.min_calibration_size,
                got: scores.len(),
            });
        }

        let clipped = clip_scores(scores, self.config.score_clip_percentile);
        let global = conformal_quantile(&clipped, self.config.coverage);

        let mut per_class: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
        for (&score, &label) in clipped.iter().zip(labels) {
            per_class.entry(label).or_default().push(score);
        }

        let quantiles: BTreeMap<usize, f64> = per_class
            .into_iter()
            .map(|(class, class_scores)| {
                let q = if class_scores.len() < MIN_PER_CLASS {
                    global
                } else {
                    conformal_quantile(&class_scores, self.config.coverage)
                };
                (class, q)
            })
            .collect();

        *self.class_quantiles.lock() = Some(quantiles);
        Ok(new_calibration_id())
    }

    fn predict(&self, scores_per_class: &[Vec<f64>]) -> Vec<ConformalResult> {
        let quantiles = {
            let guard = self.class_quantiles.lock();
            match guard.as_ref() {
                Some(q) => q.clone(),
                None => {
                    return vec![ConformalResult::invalid(
                        self.config.coverage,
                        "predictor not calibrated; call fit() first",
                    )];
                }
            }
        };
        let mean_quantile =
            quantiles.values().sum::<f64>() / quantiles.len().max(1) as f64;

        scores_per_class
            .iter()
            .map(|row| {
                let set: Vec<usize> = row
                    .iter()
                    .enumerate()
                    .filter(|&(c, &s)| s <= quantiles.get(&c).copied().unwrap_or(mean_quantile))
                    .map(|(c, _)| c)
                    .collect();
                // Report the mean quantile over the emitted set.
                let q = if set.is_empty() {
                    0.0
                } else {
                    set.iter()
                        .map(|c| quantiles.get(c).copied().unwrap_or(0.0))
                        .sum::<f64>()
                        / set.len() as f64
                };
                ConformalResult::valid(set, self.config.coverage, q)
            })
            .collect()
    }

    fn method(&self) -> &'static str {
        "mondrian"
    }
}

// ──────────────────── calibration store ────────────────────

/// Bounded, thread-safe store for published calibrations. At capacity the
/// oldest calibration (by `created_at`) is evicted.
pub struct CalibrationStore {
    max_calibrations: usize,
    calibrations: Mutex<BTreeMap<String, CalibrationData>>,
}

impl CalibrationStore {
    #[must_use]
    pub fn new(max_calibrations: usize) -> Self {
        Self {
            max_calibrations: max_calibrations.max(1),
            calibrations: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn store(&self, calibration: CalibrationData) {
        let mut map = self.calibrations.lock();
        if map.len() >= self.max_calibrations {
            let oldest = map
                .iter()
                .min_by(|a, b| a.1.created_at.total_cmp(&b.1.created_at))
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                map.remove(&id);
            }
        }
        map.insert(calibration.id.clone(), calibration);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<CalibrationData> {
        self.calibrations.lock().get(id).cloned()
    }

    #[must_use]
    pub fn list_ids(&self) -> Vec<String> {
        self.calibrations.lock().keys().cloned().collect()
    }
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::new(100)
    }
}

// ──────────────────── nonconformity scoring ────────────────────

/// Methods for deriving nonconformity scores from ensemble probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonconformityMethod {
    /// `1 - mean_k p_k[c]`
    OneMinusProb,
    /// `-ln(mean_k p_k[c])`
    NegLogProb,
}

/// Compute per-sample per-class nonconformity scores from K ensemble members'
/// probabilities (K x N x C). Lower score = more conforming.
pub fn nonconformity_from_ensemble(
    ensemble_probs: &[Vec<Vec<f64>>],
    method: NonconformityMethod,
) -> Result<Vec<Vec<f64>>> {
    let k = ensemble_probs.len();
    if k == 0 {
        return Err(PsnError::InsufficientData {
            context: "nonconformity_from_ensemble",
            needed: 1,
            got: 0,
        });
    }
    let n = ensemble_probs[0].len();
    for member in ensemble_probs {
        if member.len() != n {
            return Err(PsnError::DimensionMismatch {
                context: "nonconformity_from_ensemble",
                expected: n,
                got: member.len(),
            });
        }
    }

    let mut scores = Vec::with_capacity(n);
    for i in 0..n {
        let classes = ensemble_probs[0][i].len();
        let mut row = vec![0.0; classes];
        for member in ensemble_probs {
            for (acc, &p) in row.iter_mut().zip(&member[i]) {
                *acc += p;
            }
        }
        for p in &mut row {
            *p /= k as f64;
            *p = match method {
                NonconformityMethod::OneMinusProb => 1.0 - *p,
                NonconformityMethod::NegLogProb => -(p.clamp(EPS, 1.0 - EPS)).ln(),
            };
        }
        scores.push(row);
    }
    Ok(scores)
}

// ──────────────────── tests ────────────────────
