//! Diversity-aware active-learning selection: acquisition scoring plus
//! top-k, greedy DPP, and k-medoids batch selection over embeddings.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use serde::{Deserialize, Serialize};

use crate::core::contracts::{RiskAssessment, UncertaintyEstimate};

// ──────────────────── configuration ────────────────────

/// Acquisition score weights and selection knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub weight_uncertainty: f64,
    pub weight_risk: f64,
    pub weight_novelty: f64,
    /// k-medoids balance: quality weight is `1 - diversity_weight`.
    pub diversity_weight: f64,
    /// RBF bandwidth of the DPP similarity kernel.
    pub kernel_sigma: f64,
    /// Radius for embedding-space coverage.
    pub coverage_radius: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            weight_uncertainty: 1.0,
            weight_risk: 2.0,
            weight_novelty: 0.5,
            diversity_weight: 0.5,
            kernel_sigma: 1.0,
            coverage_radius: 1.0,
        }
    }
}

/// Batch selection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    /// Sort by score, take the best k. The fallback when no embeddings
    /// exist.
    #[default]
    TopK,
    Dpp,
    KMedoids,
}

// ──────────────────── sample metadata ────────────────────

/// A candidate sample for labeling/training prioritization.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMetadata {
    pub id: String,
    pub uncertainty: UncertaintyEstimate,
    pub risk: RiskAssessment,
    pub novelty_score: f64,
    pub embedding: Option<Vec<f64>>,
}

/// Result of a batch selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSelectionResult {
    pub selected_ids: Vec<String>,
    pub selected_indices: Vec<usize>,
    /// `log det(E E^T + 1e-6 I)` of the selected embeddings; 0 without
    /// embeddings or below two selections.
    pub diversity_score: f64,
    /// Fraction of all candidates within `coverage_radius` of a selection.
    pub coverage_score: f64,
    pub method: SelectionMethod,
}

// ──────────────────── dense helpers ────────────────────

fn sq_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| (x - y) * (x - y)).sum()
}

/// Cholesky factor of a symmetric positive-definite matrix; `None` when the
/// matrix is not PD.
fn cholesky(m: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = m.len();
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = m[i][j];
            for k in 0..j {
                sum -= l[i][k] * l[j][k];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[i][j] = sum.sqrt();
            } else {
                l[i][j] = sum / l[j][j];
            }
        }
    }
    Some(l)
}

/// `log det` of a symmetric PD matrix via its Cholesky factor.
fn log_det_pd(m: &[Vec<f64>]) -> Option<f64> {
    let l = cholesky(m)?;
    Some(2.0 * l.iter().enumerate().map(|(i, row)| row[i].ln()).sum::<f64>())
}

// ──────────────────── DPP ────────────────────

/// DPP L-kernel: `L = diag(q) S diag(q)` with normalized quality
/// `q = scores / max(scores)` and RBF similarity
/// `S_ij = exp(-||e_i - e_j||^2 / (2 sigma^2)) + 1e-6 I`.
#[must_use]
pub fn dpp_kernel(embeddings: &[Vec<f64>], scores: &[f64], sigma: f64) -> Vec<Vec<f64>> {
    let n = embeddings.len();
    let max_score = scores
        .iter()
        .fold(0.0_f64, |acc, &s| acc.max(s.max(1e-10)));
    let quality: Vec<f64> = scores
        .iter()
        .map(|&s| s.max(1e-10) / max_score)
        .collect();

    let denom = 2.0 * sigma * sigma;
    let mut kernel = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let mut s = (-sq_distance(&embeddings[i], &embeddings[j]) / denom).exp();
            if i == j {
                s += 1e-6;
            }
            let value = quality[i] * quality[j] * s;
            kernel[i][j] = value;
            kernel[j][i] = value;
        }
    }
    kernel
}

/// Greedy MAP inference for a DPP: seed with the largest diagonal entry,
/// then grow the set by the candidate with the best log-determinant gain.
/// Candidates whose augmented submatrix is not positive-definite are
/// skipped.
#[must_use]
pub fn greedy_dpp_map(kernel: &[Vec<f64>], k: usize) -> Vec<usize> {
    let n = kernel.len();
    let k = k.min(n);
    if k == 0 {
        return Vec::new();
    }

    let first = (0..n)
        .max_by(|&a, &b| kernel[a][a].total_cmp(&kernel[b][b]))
        .unwrap_or(0);
    let mut selected = vec![first];
    let mut remaining: Vec<usize> = (0..n).filter(|&i| i != first).collect();

    while selected.len() < k && !remaining.is_empty() {
        let mut best: Option<(usize, f64)> = None;
        for (pos, &candidate) in remaining.iter().enumerate() {
            let mut trial = selected.clone();
            trial.push(candidate);
            let sub: Vec<Vec<f64>> = trial
                .iter()
                .map(|&i| trial.iter().map(|&j| kernel[i][j]).collect())
                .collect();
            let Some(gain) = log_det_pd(&sub) else {
                continue;
            };
            if best.is_none_or(|(_, g)| gain > g) {
                best = Some((pos, gain));
            }
        }
        let Some((pos, _)) = best else {
            break;
        };
        selected.push(remaining.swap_remove(pos));
    }
    selected
}

// ──────────────────── k-medoids ────────────────────

/// K-medoids style diverse selection: seed with the best score, then pick
/// items maximizing `quality_weight * score + (1 - quality_weight) *
/// min-distance-to-selected` (both normalized).
#[must_use]
pub fn kmedoids_diverse_select(
    embeddings: &[Vec<f64>],
    scores: &[f64],
    k: usize,
    quality_weight: f64,
) -> Vec<usize> {
    let n = embeddings.len();
    let k = k.min(n);
    if k == 0 {
        return Vec::new();
    }

    let (min_s, max_s) = scores
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &s| {
            (lo.min(s), hi.max(s))
        });
    let norm_scores: Vec<f64> = if max_s > min_s {
        scores.iter().map(|&s| (s - min_s) / (max_s - min_s)).collect()
    } else {
        vec![1.0; n]
    };

    let mut distances = vec![vec![0.0; n]; n];
    let mut max_dist = 0.0_f64;
    for i in 0..n {
        for j in 0..i {
            let d = sq_distance(&embeddings[i], &embeddings[j]).sqrt();
            distances[i][j] = d;
            distances[j][i] = d;
            max_dist = max_dist.max(d);
        }
    }

    let first = (0..n)
        .max_by(|&a, &b| norm_scores[a].total_cmp(&norm_scores[b]))
        .unwrap_or(0);
    let mut selected = vec![first];
    let mut remaining: Vec<usize> = (0..n).filter(|&i| i != first).collect();

    while selected.len() < k && !remaining.is_empty() {
        let mut best: Option<(usize, f64)> = None;
        for (pos, &candidate) in remaining.iter().enumerate() {
            let min_dist = selected
                .iter()
                .map(|&s| distances[candidate][s])
                .fold(f64::INFINITY, f64::min);
            let norm_dist = if max_dist > 0.0 { min_dist / max_dist } else { 0.0 };
            let combined =
                quality_weight * norm_scores[candidate] + (1.0 - quality_weight) * norm_dist;
            if best.is_none_or(|(_, b)| combined > b) {
                best = Some((pos, combined));
            }
        }
        let Some((pos, _)) = best else {
            break;
        };
        selected.push(remaining.swap_remove(pos));
    }
    selected
}

/// Fraction of all candidate embeddings within `radius` of at least one
/// selected embedding.
#[must_use]
pub fn compute_coverage(
    selected: &[Vec<f64>],
    all_embeddings: &[Vec<f64>],
    radius: f64,
) -> f64 {
    if selected.is_empty() || all_embeddings.is_empty() {
        return 0.0;
    }
    let covered = all_embeddings
        .iter()
        .filter(|e| {
            selected
                .iter()
                .any(|s| sq_distance(e, s).sqrt() <= radius)
        })
        .count();
    covered as f64 / all_embeddings.len() as f64
}

// ──────────────────── acquisition policy ────────────────────

/// Scores candidates and selects the next batch to label.
pub struct AcquisitionPolicy {
    config: AcquisitionConfig,
}

impl AcquisitionPolicy {
    #[must_use]
    pub fn new(config: AcquisitionConfig) -> Self {
        Self { config }
    }

    /// Base acquisition score:
    /// `w_u * epistemic + w_r * expected_risk + w_n * novelty`.
    #[must_use]
    pub fn compute_scores(&self, samples: &[SampleMetadata]) -> Vec<f64> {
        samples
            .iter()
            .map(|s| {
                self.config.weight_uncertainty * s.uncertainty.epistemic
                    + self.config.weight_risk * s.risk.expected_risk
                    + self.config.weight_novelty * s.novelty_score
            })
            .collect()
    }

    /// Select a batch. A diversity method without complete embeddings falls
    /// back to top-k.
    #[must_use]
    pub fn select_batch(
        &self,
        samples: &[SampleMetadata],
        batch_size: usize,
        method: SelectionMethod,
    ) -> BatchSelectionResult {
        if samples.is_empty() {
            return BatchSelectionResult {
                selected_ids: Vec::new(),
                selected_indices: Vec::new(),
                diversity_score: 0.0,
                coverage_score: 0.0,
                method: SelectionMethod::TopK,
            };
        }

        let scores = self.compute_scores(samples);
        let embeddings: Option<Vec<Vec<f64>>> = samples
            .iter()
            .map(|s| s.embedding.clone())
            .collect();

        let (indices, method) = match (method, &embeddings) {
            (SelectionMethod::Dpp, Some(embeddings)) => {
                let kernel = dpp_kernel(embeddings, &scores, self.config.kernel_sigma);
                (greedy_dpp_map(&kernel, batch_size), SelectionMethod::Dpp)
            }
            (SelectionMethod::KMedoids, Some(embeddings)) => (
                kmedoids_diverse_select(
                    embeddings,
                    &scores,
                    batch_size,
                    1.0 - self.config.diversity_weight,
                ),
                SelectionMethod::KMedoids,
            ),
            _ => (top_k_indices(&scores, batch_size), SelectionMethod::TopK),
        };

        let (diversity_score, coverage_score) = embeddings.as_ref().map_or((0.0, 0.0), |all| {
            let chosen: Vec<Vec<f64>> = indices.iter().map(|&i| all[i].clone()).collect();
            let diversity = if chosen.len() > 1 {
                let mut gram = vec![vec![0.0; chosen.len()]; chosen.len()];
                for (i, a) in chosen.iter().enumerate() {
                    for (j, b) in chosen.iter().enumerate() {
                        gram[i][j] = a.iter().zip(b).map(|(&x, &y)| x * y).sum();
                        if i == j {
                            gram[i][j] += 1e-6;
                        }
                    }
                }
                log_det_pd(&gram).unwrap_or(0.0)
            } else {
                0.0
            };
            (
                diversity,
                compute_coverage(&chosen, all, self.config.coverage_radius),
            )
        });

        BatchSelectionResult {
            selected_ids: indices.iter().map(|&i| samples[i].id.clone()).collect(),
            selected_indices: indices,
            diversity_score,
            coverage_score,
            method,
        }
    }
}

fn top_k_indices(scores: &[f64], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    indices.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    indices.truncate(k);
    indices
}

// ──────────────────── tests ────────────────────
