//! Progressive deployment: shadow execution, sticky A/B splits, and
//! criteria-gated automatic promotion.
//!
//! Candidate policies are evaluated without ever holding a lock across a
//! policy call; metric aggregates live behind their own mutexes with
//! bounded retention.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::contracts::{Observation, Policy};
use crate::core::errors::{PsnError, Result};
use crate::uncertainty::kernels::percentile;

/// Bounded retention for divergence/latency/metric histories.
const HISTORY_LIMIT: usize = 10_000;

/// Number of hash buckets for sticky A/B assignment.
const BUCKETS: u64 = 10_000;

// ──────────────────── configuration ────────────────────

/// Deployment knobs (config keys `shadow_fraction`, `sticky_key`,
/// `allocation` — the allocation itself is passed at A/B start).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeploymentConfig {
    pub shadow_fraction: f64,
    pub sticky_key: String,
    /// Seed for shadow sampling and missing-sticky-key bucketing.
    pub seed: Option<u64>,
    pub promotion: PromotionCriteria,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            shadow_fraction: 1.0,
            sticky_key: "session_id".to_string(),
            seed: None,
            promotion: PromotionCriteria::default(),
        }
    }
}

/// Criteria for promoting a candidate out of an A/B test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromotionCriteria {
    pub min_samples: u64,
    pub max_latency_increase_pct: f64,
    /// Custom metrics that must stay within 10% of control.
    pub required_metrics: Vec<String>,
}

impl Default for PromotionCriteria {
    fn default() -> Self {
        Self {
            min_samples: 1000,
            max_latency_increase_pct: 20.0,
            required_metrics: Vec::new(),
        }
    }
}

fn new_rng(seed: Option<u64>) -> StdRng {
    seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64)
}

// ──────────────────── shadow runner ────────────────────

/// Result of one shadow-mode step.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowResult {
    pub production_action: Vec<f64>,
    /// Candidate action when the shadow ran and succeeded.
    pub shadow_action: Option<Vec<f64>>,
    /// `||a_prod - a_shadow||` when the shadow ran and succeeded.
    pub divergence: Option<f64>,
    pub production_latency_ms: f64,
    pub shadow_latency_ms: f64,
    pub shadow_error: Option<String>,
}

/// Shadow-mode statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShadowStatistics {
    pub n_runs: u64,
    pub n_errors: u64,
    pub error_rate: f64,
    pub mean_divergence: f64,
    pub max_divergence: f64,
    pub std_divergence: f64,
    pub p50_divergence: f64,
    pub p95_divergence: f64,
}

#[derive(Default)]
struct ShadowState {
    divergences: Vec<f64>,
    n_runs: u64,
    n_errors: u64,
}

/// Executes production on every step and the candidate, in shadow, with
/// probability `shadow_fraction`. The candidate runs inside an error
/// boundary; its output never affects the returned action.
pub struct ShadowRunner {
    production: Arc<dyn Policy>,
    candidate: Arc<dyn Policy>,
    shadow_fraction: f64,
    rng: Mutex<StdRng>,
    state: Mutex<ShadowState>,
}

impl ShadowRunner {
    #[must_use]
    pub fn new(
        production: Arc<dyn Policy>,
        candidate: Arc<dyn Policy>,
        shadow_fraction: f64,
        seed: Option<u64>,
    ) -> Self {
        Self {
            production,
            candidate,
            shadow_fraction: shadow_fraction.clamp(0.0, 1.0),
            rng: Mutex::new(new_rng(seed)),
            state: Mutex::new(ShadowState::default()),
        }
    }

    /// Run one step. A production failure propagates (the caller owns that
    /// contract); a shadow failure is captured in the result.
    pub fn run(&self, observation: &Observation) -> Result<ShadowResult> {
        let start = Instant::now();
        let production_action = self
            .production
            .act(observation)
            .map_err(|e| PsnError::external("production_policy", e.to_string()))?;
        let production_latency_ms = start.elapsed().as_secs_f64() * 1e3;

        let sample: f64 = self.rng.lock().random();
        if sample >= self.shadow_fraction {
            return Ok(ShadowResult {
                production_action,
                shadow_action: None,
                divergence: None,
                production_latency_ms,
                shadow_latency_ms: 0.0,
                shadow_error: None,
            });
        }

        let start = Instant::now();
        let shadow_outcome = self.candidate.act(observation);
        let shadow_latency_ms = start.elapsed().as_secs_f64() * 1e3;

        match shadow_outcome {
            Ok(shadow_action) => {
                let divergence = l2_distance(&production_action, &shadow_action);
                let mut state = self.state.lock();
                state.n_runs += 1;
                state.divergences.push(divergence);
                if state.divergences.len() > HISTORY_LIMIT {
                    state.divergences.remove(0);
                }
                drop(state);
                Ok(ShadowResult {
                    production_action,
                    shadow_action: Some(shadow_action),
                    divergence: Some(divergence),
                    production_latency_ms,
                    shadow_latency_ms,
                    shadow_error: None,
                })
            }
            Err(err) => {
                let mut state = self.state.lock();
                state.n_runs += 1;
                state.n_errors += 1;
                drop(state);
                Ok(ShadowResult {
                    production_action,
                    shadow_action: None,
                    divergence: None,
                    production_latency_ms,
                    shadow_latency_ms,
                    shadow_error: Some(err.to_string()),
                })
            }
        }
    }

    #[must_use]
    pub fn statistics(&self) -> ShadowStatistics {
        let state = self.state.lock();
        let d = &state.divergences;
        let (mean, max, std) = if d.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let mean = d.iter().sum::<f64>() / d.len() as f64;
            let max = d.iter().fold(0.0_f64, |acc, &x| acc.max(x));
            let var = d.iter().map(|&x| (x - mean) * (x - mean)).sum::<f64>() / d.len() as f64;
            (mean, max, var.sqrt())
        };
        ShadowStatistics {
            n_runs: state.n_runs,
            n_errors: state.n_errors,
            error_rate: if state.n_runs == 0 {
                0.0
            } else {
                state.n_errors as f64 / state.n_runs as f64
            },
            mean_divergence: mean,
            max_divergence: max,
            std_divergence: std,
            p50_divergence: percentile(d, 50.0),
            p95_divergence: percentile(d, 95.0),
        }
    }
}

fn l2_distance(a: &[f64], b: &[f64]) -> f64 {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or(0.0);
            let y = b.get(i).copied().unwrap_or(0.0);
            (x - y) * (x - y)
        })
        .sum::<f64>()
        .sqrt()
}

// ──────────────────── A/B test runner ────────────────────

/// Assignment context: arbitrary string keys, one of which is the sticky
/// key.
pub type AbContext = BTreeMap<String, String>;

#[derive(Default)]
struct VariantMetrics {
    n_samples: u64,
    errors: u64,
    latencies_ms: Vec<f64>,
    custom: BTreeMap<String, Vec<f64>>,
}

/// Mean/std pair for a custom metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub std: f64,
}

/// Per-variant aggregate view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantSummary {
    pub n_samples: u64,
    pub errors: u64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub custom_metrics: BTreeMap<String, MetricSummary>,
}

/// Splits traffic between policy variants by hashing the sticky key into
/// 10 000 buckets against declared allocation ranges.
pub struct AbTestRunner {
    policies: BTreeMap<String, Arc<dyn Policy>>,
    ranges: Vec<(String, f64, f64)>,
    sticky_key: String,
    rng: Mutex<StdRng>,
    metrics: Mutex<BTreeMap<String, VariantMetrics>>,
}

impl std::fmt::Debug for AbTestRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbTestRunner")
            .field("policies", &self.policies.keys().collect::<Vec<_>>())
            .field("ranges", &self.ranges)
            .field("sticky_key", &self.sticky_key)
            .finish()
    }
}

impl AbTestRunner {
    /// Allocations must sum to `1 +/- 0.01` and name existing policies;
    /// violations are configuration errors raised here, at construction.
    pub fn new(
        policies: BTreeMap<String, Arc<dyn Policy>>,
        allocation: &BTreeMap<String, f64>,
        sticky_key: &str,
        seed: Option<u64>,
    ) -> Result<Self> {
        let total: f64 = allocation.values().sum();
        if !(0.99..=1.01).contains(&total) {
            return Err(PsnError::InvalidConfig {
                details: format!("allocation must sum to 1.0, got {total}"),
            });
        }
        let mut ranges = Vec::with_capacity(allocation.len());
        let mut cursor = 0.0;
        for (name, &fraction) in allocation {
            if !policies.contains_key(name) {
                return Err(PsnError::InvalidConfig {
                    details: format!("allocation names unknown variant {name}"),
                });
            }
            ranges.push((name.clone(), cursor, cursor + fraction));
            cursor += fraction;
        }

        let metrics = policies
            .keys()
            .map(|name| (name.clone(), VariantMetrics::default()))
            .collect();

        Ok(Self {
            policies,
            ranges,
            sticky_key: sticky_key.to_string(),
            rng: Mutex::new(new_rng(seed)),
            metrics: Mutex::new(metrics),
        })
    }

    /// Deterministic variant assignment for a context. A missing sticky key
    /// falls back to a random (seeded) bucket.
    #[must_use]
    pub fn assign_variant(&self, context: &AbContext) -> String {
        let bucket = context.get(&self.sticky_key).map_or_else(
            || self.rng.lock().random::<f64>(),
            |key| {
                let digest = Sha256::digest(key.as_bytes());
                let hash = u64::from_be_bytes([
                    digest[0], digest[1], digest[2], digest[3], digest[4], digest[5],
                    digest[6], digest[7],
                ]);
                (hash % BUCKETS) as f64 / BUCKETS as f64
            },
        );
        self.ranges
            .iter()
            .find(|(_, low, high)| bucket >= *low && bucket < *high)
            .map_or_else(|| self.ranges[0].0.clone(), |(name, _, _)| name.clone())
    }

    /// Execute the assigned variant. Policy errors are counted against the
    /// variant and propagated.
    pub fn run(
        &self,
        observation: &Observation,
        context: &AbContext,
    ) -> Result<(Vec<f64>, String)> {
        let variant = self.assign_variant(context);
        let policy = Arc::clone(&self.policies[&variant]);

        let start = Instant::now();
        match policy.act(observation) {
            Ok(action) => {
                let latency_ms = start.elapsed().as_secs_f64() * 1e3;
                let mut metrics = self.metrics.lock();
                let m = metrics.entry(variant.clone()).or_default();
                m.n_samples += 1;
                m.latencies_ms.push(latency_ms);
                if m.latencies_ms.len() > HISTORY_LIMIT {
                    m.latencies_ms.remove(0);
                }
                drop(metrics);
                Ok((action, variant))
            }
            Err(err) => {
                self.metrics.lock().entry(variant).or_default().errors += 1;
                Err(PsnError::external("ab_variant_policy", err.to_string()))
            }
        }
    }

    /// Record a custom metric observation for a variant.
    pub fn record_metric(&self, variant: &str, metric: &str, value: f64) {
        let mut metrics = self.metrics.lock();
        if let Some(m) = metrics.get_mut(variant) {
            let series = m.custom.entry(metric.to_string()).or_default();
            series.push(value);
            if series.len() > HISTORY_LIMIT {
                series.remove(0);
            }
        }
    }

    /// Aggregate view over all variants.
    #[must_use]
    pub fn metrics_summary(&self) -> BTreeMap<String, VariantSummary> {
        let metrics = self.metrics.lock();
        metrics
            .iter()
            .map(|(name, m)| {
                let mean_latency = if m.latencies_ms.is_empty() {
                    0.0
                } else {
                    m.latencies_ms.iter().sum::<f64>() / m.latencies_ms.len() as f64
                };
                let custom = m
                    .custom
                    .iter()
                    .filter(|(_, values)| !values.is_empty())
                    .map(|(metric, values)| {
                        let mean = values.iter().sum::<f64>() / values.len() as f64;
                        let var = values
                            .iter()
                            .map(|&v| (v - mean) * (v - mean))
                            .sum::<f64>()
                            / values.len() as f64;
                        (
                            metric.clone(),
                            MetricSummary {
                                mean,
                                std: var.sqrt(),
                            },
                        )
                    })
                    .collect();
                (
                    name.clone(),
                    VariantSummary {
                        n_samples: m.n_samples,
                        errors: m.errors,
                        mean_latency_ms: mean_latency,
                        p95_latency_ms: percentile(&m.latencies_ms, 95.0),
                        custom_metrics: custom,
                    },
                )
            })
            .collect()
    }
}

// ──────────────────── auto promoter ────────────────────

/// One promotion check's verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub note: String,
}

/// Full promotion decision with per-check attribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionReport {
    pub approved: bool,
    pub checks: BTreeMap<String, CheckOutcome>,
}

/// Applies [`PromotionCriteria`] to A/B metrics.
pub struct AutoPromoter {
    criteria: PromotionCriteria,
    control_variant: String,
}

impl AutoPromoter {
    #[must_use]
    pub fn new(criteria: PromotionCriteria, control_variant: &str) -> Self {
        Self {
            criteria,
            control_variant: control_variant.to_string(),
        }
    }

    /// Evaluate whether `candidate` should be promoted. Checks stop at the
    /// first failure; every executed check appears in the report.
    #[must_use]
    pub fn evaluate(
        &self,
        metrics: &BTreeMap<String, VariantSummary>,
        candidate: &str,
    ) -> PromotionReport {
        let mut checks = BTreeMap::new();

        let (Some(control), Some(cand)) =
            (metrics.get(&self.control_variant), metrics.get(candidate))
        else {
            checks.insert(
                "variants_present".to_string(),
                CheckOutcome {
                    passed: false,
                    note: "missing variant metrics".to_string(),
                },
            );
            return PromotionReport {
                approved: false,
                checks,
            };
        };

        if cand.n_samples < self.criteria.min_samples {
            checks.insert(
                "min_samples".to_string(),
                CheckOutcome {
                    passed: false,
                    note: format!(
                        "{} < required {}",
                        cand.n_samples, self.criteria.min_samples
                    ),
                },
            );
            return PromotionReport {
                approved: false,
                checks,
            };
        }
        checks.insert(
            "min_samples".to_string(),
            CheckOutcome {
                passed: true,
                note: format!("{} samples", cand.n_samples),
            },
        );

        let latency_increase_pct = if control.p95_latency_ms > 0.0 {
            (cand.p95_latency_ms - control.p95_latency_ms) / control.p95_latency_ms * 100.0
        } else {
            0.0
        };
        let latency_ok = latency_increase_pct <= self.criteria.max_latency_increase_pct;
        checks.insert(
            "latency".to_string(),
            CheckOutcome {
                passed: latency_ok,
                note: format!(
                    "p95 {:.2}ms vs control {:.2}ms ({latency_increase_pct:+.1}%)",
                    cand.p95_latency_ms, control.p95_latency_ms
                ),
            },
        );
        if !latency_ok {
            return PromotionReport {
                approved: false,
                checks,
            };
        }

        for metric in &self.criteria.required_metrics {
            let (Some(control_m), Some(cand_m)) = (
                control.custom_metrics.get(metric),
                cand.custom_metrics.get(metric),
            ) else {
                checks.insert(
                    metric.clone(),
                    CheckOutcome {
                        passed: true,
                        note: "missing data, skipped".to_string(),
                    },
                );
                continue;
            };
            // Safety metrics are lower-is-better with a 10% tolerance.
            let regressed = cand_m.mean > control_m.mean * 1.1;
            checks.insert(
                metric.clone(),
                CheckOutcome {
                    passed: !regressed,
                    note: format!(
                        "candidate {:.4} vs control {:.4}",
                        cand_m.mean, control_m.mean
                    ),
                },
            );
            if regressed {
                return PromotionReport {
                    approved: false,
                    checks,
                };
            }
        }

        let error_rate = if cand.n_samples == 0 {
            0.0
        } else {
            cand.errors as f64 / cand.n_samples as f64
        };
        let error_ok = error_rate < 0.01;
        checks.insert(
            "error_rate".to_string(),
            CheckOutcome {
                passed: error_ok,
                note: format!("{error_rate:.4}"),
            },
        );

        PromotionReport {
            approved: error_ok,
            checks,
        }
    }
}

// ──────────────────── deployment manager ────────────────────

/// Current stage of the progressive rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStage {
    Production,
    Shadow,
    AbTest,
}

/// Status snapshot of the rollout.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    pub stage: DeploymentStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow: Option<ShadowStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ab_metrics: Option<BTreeMap<String, VariantSummary>>,
}

/// Sequences production -> shadow -> A/B -> promotion, owning the candidate
/// for the duration of the rollout.
pub struct DeploymentManager {
    production: Arc<dyn Policy>,
    config: DeploymentConfig,
    stage: DeploymentStage,
    candidate: Option<Arc<dyn Policy>>,
    shadow: Option<ShadowRunner>,
    ab: Option<AbTestRunner>,
}

impl DeploymentManager {
    #[must_use]
    pub fn new(production: Arc<dyn Policy>, config: DeploymentConfig) -> Self {
        Self {
            production,
            config,
            stage: DeploymentStage::Production,
            candidate: None,
            shadow: None,
            ab: None,
        }
    }

    #[must_use]
    pub fn stage(&self) -> DeploymentStage {
        self.stage
    }

    /// Begin shadow-mode evaluation of a candidate.
    pub fn start_shadow(&mut self, candidate: Arc<dyn Policy>) {
        self.shadow = Some(ShadowRunner::new(
            Arc::clone(&self.production),
            Arc::clone(&candidate),
            self.config.shadow_fraction,
            self.config.seed,
        ));
        self.candidate = Some(candidate);
        self.ab = None;
        self.stage = DeploymentStage::Shadow;
    }

    /// Graduate the candidate from shadow into an A/B split with
    /// `candidate_allocation` of the traffic.
    pub fn start_ab_test(&mut self, candidate_allocation: f64) -> Result<()> {
        let Some(candidate) = self.candidate.as_ref() else {
            return Err(PsnError::InvalidConfig {
                details: "no candidate staged; call start_shadow first".to_string(),
            });
        };
        let mut policies: BTreeMap<String, Arc<dyn Policy>> = BTreeMap::new();
        policies.insert("control".to_string(), Arc::clone(&self.production));
        policies.insert("candidate".to_string(), Arc::clone(candidate));
        let mut allocation = BTreeMap::new();
        allocation.insert("control".to_string(), 1.0 - candidate_allocation);
        allocation.insert("candidate".to_string(), candidate_allocation);

        self.ab = Some(AbTestRunner::new(
            policies,
            &allocation,
            &self.config.sticky_key,
            self.config.seed,
        )?);
        self.shadow = None;
        self.stage = DeploymentStage::AbTest;
        Ok(())
    }

    /// Run one step of the current stage; the returned action always comes
    /// from production or the A/B-assigned variant.
    pub fn run(&self, observation: &Observation, context: &AbContext) -> Result<Vec<f64>> {
        match (self.stage, self.shadow.as_ref(), self.ab.as_ref()) {
            (DeploymentStage::Shadow, Some(runner), _) => {
                Ok(runner.run(observation)?.production_action)
            }
            (DeploymentStage::AbTest, _, Some(runner)) => {
                Ok(runner.run(observation, context)?.0)
            }
            _ => self.production.act(observation),
        }
    }

    #[must_use]
    pub fn status(&self) -> DeploymentStatus {
        DeploymentStatus {
            stage: self.stage,
            shadow: self.shadow.as_ref().map(ShadowRunner::statistics),
            ab_metrics: self.ab.as_ref().map(AbTestRunner::metrics_summary),
        }
    }

    /// Evaluate the promotion criteria against the running A/B test.
    pub fn check_promotion(&self) -> Result<PromotionReport> {
        let Some(ab) = self.ab.as_ref() else {
            return Err(PsnError::InvalidConfig {
                details: "not in A/B stage".to_string(),
            });
        };
        let promoter = AutoPromoter::new(self.config.promotion.clone(), "control");
        Ok(promoter.evaluate(&ab.metrics_summary(), "candidate"))
    }

    /// Atomically swap the candidate into production and tear down the
    /// runners.
    pub fn promote(&mut self) -> Result<()> {
        let Some(candidate) = self.candidate.take() else {
            return Err(PsnError::InvalidConfig {
                details: "no candidate to promote".to_string(),
            });
        };
        self.production = candidate;
        self.shadow = None;
        self.ab = None;
        self.stage = DeploymentStage::Production;
        Ok(())
    }
}

// ──────────────────── tests ────────────────────
