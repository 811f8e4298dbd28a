//! Statistical evaluation with rigorous confidence intervals: percentile
//! bootstrap, Wilson and Clopper-Pearson proportion intervals, power
//! analysis, stratified aggregation, and regression detection.
//!
//! The inverse normal CDF and the regularized incomplete beta function are
//! implemented here directly (rational approximation and continued
//! fraction); no external special-function dependency exists in this stack.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::many_single_char_names)]

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::uncertainty::kernels::percentile;

// ──────────────────── configuration ────────────────────

/// Evaluator knobs (config keys `n_bootstrap`, `confidence_level`,
/// `min_stratum_size`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvalConfig {
    pub n_bootstrap: usize,
    pub confidence_level: f64,
    /// Strata smaller than this use a normal approximation instead of the
    /// bootstrap.
    pub min_stratum_size: usize,
    /// Seed for bootstrap resampling. `None` draws from the OS.
    pub seed: Option<u64>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            n_bootstrap: 10_000,
            confidence_level: 0.95,
            min_stratum_size: 30,
            seed: None,
        }
    }
}

// ──────────────────── result types ────────────────────

/// A metric value with its confidence interval.
///
/// Invariant: `ci_lower <= value <= ci_upper` unless `degenerate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricWithCi {
    pub value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// `bootstrap` | `wilson` | `clopper_pearson` | `normal_approx` |
    /// `degenerate` | `none`.
    pub method: String,
    pub n_samples: usize,
    pub degenerate: bool,
}

impl MetricWithCi {
    fn point(value: f64, method: &str, n_samples: usize, degenerate: bool) -> Self {
        Self {
            value,
            ci_lower: value,
            ci_upper: value,
            method: method.to_string(),
            n_samples,
            degenerate,
        }
    }
}

/// Metrics broken out along one tag dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratifiedMetrics {
    pub dimension: String,
    pub strata: BTreeMap<String, BTreeMap<String, MetricWithCi>>,
    pub sample_sizes: BTreeMap<String, usize>,
}

/// Complete aggregated evaluation results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResults {
    pub total_scenarios: usize,
    pub pass_rate: MetricWithCi,
    pub mean_metrics: BTreeMap<String, MetricWithCi>,
    pub stratified: BTreeMap<String, StratifiedMetrics>,
    /// Minimum per-group sample size to resolve each thresholded metric.
    pub power_analysis: BTreeMap<String, Option<usize>>,
}

/// One scenario's evaluation outcome, the unit `aggregate_results`
/// consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub scenario_id: String,
    pub passed: bool,
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

// ──────────────────── special functions ────────────────────

/// Inverse standard normal CDF (Acklam's rational approximation, absolute
/// error < 1.15e-9 on (0, 1)).
#[must_use]
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_690e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// Natural log of the gamma function (Lanczos approximation).
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        1.208_650_973_866_179e-3,
        -5.395_239_384_953e-6,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut series = 1.000_000_000_190_015;
    for c in COEFFS {
        y += 1.0;
        series += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * series / x).ln()
}

/// Continued fraction for the incomplete beta function (Lentz's method).
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 200;
    const EPS: f64 = 3e-14;
    const FPMIN: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Regularized incomplete beta function `I_x(a, b)`.
#[must_use]
pub fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front =
        ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// Inverse of the regularized incomplete beta in `x` (bisection; the CDF is
/// monotone in x).
fn beta_quantile(p: f64, a: f64, b: f64) -> f64 {
    if p <= 0.0 {
        return 0.0;
    }
    if p >= 1.0 {
        return 1.0;
    }
    let (mut lo, mut hi) = (0.0_f64, 1.0_f64);
    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        if regularized_incomplete_beta(a, b, mid) < p {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

// ──────────────────── interval estimators ────────────────────

/// Percentile-bootstrap confidence interval for an arbitrary statistic.
/// Returns `(estimate, ci_lower, ci_upper)`. Degenerate (constant) data
/// short-circuits to `(v, v, v)`.
pub fn bootstrap_ci<F>(
    data: &[f64],
    stat: F,
    n_bootstrap: usize,
    alpha: f64,
    seed: Option<u64>,
) -> (f64, f64, f64)
where
    F: Fn(&[f64]) -> f64,
{
    let n = data.len();
    if n == 0 {
        return (f64::NAN, f64::NAN, f64::NAN);
    }
    let estimate = stat(data);
    if n == 1 || data.iter().all(|&v| v == data[0]) {
        return (estimate, estimate, estimate);
    }

    let mut rng = seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
    let mut stats = Vec::with_capacity(n_bootstrap);
    let mut resample = vec![0.0; n];
    for _ in 0..n_bootstrap {
        for slot in &mut resample {
            *slot = data[rng.random_range(0..n)];
        }
        stats.push(stat(&resample));
    }

    let lower = percentile(&stats, 100.0 * (alpha / 2.0));
    let upper = percentile(&stats, 100.0 * (1.0 - alpha / 2.0));
    (estimate, lower, upper)
}

/// Arithmetic mean (the default bootstrap statistic).
#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Wilson score interval for a binomial proportion. Returns
/// `(p_hat, ci_lower, ci_upper)`.
#[must_use]
pub fn wilson_ci(successes: u64, n: u64, alpha: f64) -> (f64, f64, f64) {
    if n == 0 {
        return (0.0, 0.0, 0.0);
    }
    let z = normal_quantile(1.0 - alpha / 2.0);
    let n_f = n as f64;
    let p_hat = successes as f64 / n_f;

    let denominator = 1.0 + z * z / n_f;
    let center = (p_hat + z * z / (2.0 * n_f)) / denominator;
    let margin =
        z * ((p_hat * (1.0 - p_hat) + z * z / (4.0 * n_f)) / n_f).sqrt() / denominator;

    (
        p_hat,
        (center - margin).max(0.0),
        (center + margin).min(1.0),
    )
}

/// Exact Clopper-Pearson interval for a binomial proportion, used for small
/// samples where Wilson is inaccurate.
#[must_use]
pub fn clopper_pearson_ci(successes: u64, n: u64, alpha: f64) -> (f64, f64, f64) {
    if n == 0 {
        return (0.0, 0.0, 0.0);
    }
    let s = successes as f64;
    let n_f = n as f64;
    let p_hat = s / n_f;

    let lower = if successes == 0 {
        0.0
    } else {
        beta_quantile(alpha / 2.0, s, n_f - s + 1.0)
    };
    let upper = if successes == n {
        1.0
    } else {
        beta_quantile(1.0 - alpha / 2.0, s + 1.0, n_f - s)
    };
    (p_hat, lower, upper)
}

/// Minimum per-group sample size to detect a Cohen's-d effect:
/// `n = ceil(2 ((z_alpha + z_beta) / d)^2)`. `None` for a non-positive
/// effect size.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn power_analysis_n(effect_size: f64, alpha: f64, power: f64) -> Option<usize> {
    if effect_size <= 0.0 {
        return None;
    }
    let z_alpha = normal_quantile(1.0 - alpha / 2.0);
    let z_beta = normal_quantile(power);
    let n = 2.0 * ((z_alpha + z_beta) / effect_size).powi(2);
    Some(n.ceil() as usize)
}

// ──────────────────── evaluator ────────────────────

/// Regression verdict from [`StatisticalEvaluator::detect_regression`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegressionReport {
    pub has_regression: bool,
    /// Per-metric verdict text (`REGRESSION: ...` or `WARNING: ...`).
    pub details: BTreeMap<String, String>,
}

/// Evaluator combining interval estimation, stratified aggregation, power
/// analysis, and regression gating.
pub struct StatisticalEvaluator {
    acceptance_thresholds: BTreeMap<String, f64>,
    config: EvalConfig,
    /// Metrics where a larger value is the safer direction (Open Question
    /// 2); everything else is treated as lower-is-safer.
    higher_is_safer: BTreeSet<String>,
    alpha: f64,
}

impl StatisticalEvaluator {
    #[must_use]
    pub fn new(acceptance_thresholds: BTreeMap<String, f64>, config: EvalConfig) -> Self {
        let alpha = 1.0 - config.confidence_level;
        Self {
            acceptance_thresholds,
            config,
            higher_is_safer: BTreeSet::new(),
            alpha,
        }
    }

    /// Flag metrics whose safer direction is up rather than down.
    #[must_use]
    pub fn with_higher_is_safer(mut self, metrics: impl IntoIterator<Item = String>) -> Self {
        self.higher_is_safer = metrics.into_iter().collect();
        self
    }

    /// Bootstrap CI for the mean of `values`.
    #[must_use]
    pub fn metric_with_ci(&self, values: &[f64]) -> MetricWithCi {
        let n = values.len();
        if n == 0 {
            return MetricWithCi::point(f64::NAN, "none", 0, true);
        }
        if values.iter().all(|&v| v == values[0]) {
            return MetricWithCi::point(values[0], "degenerate", n, true);
        }
        let (value, ci_lower, ci_upper) = bootstrap_ci(
            values,
            mean,
            self.config.n_bootstrap,
            self.alpha,
            self.config.seed,
        );
        MetricWithCi {
            value,
            ci_lower,
            ci_upper,
            method: "bootstrap".to_string(),
            n_samples: n,
            degenerate: false,
        }
    }

    /// Proportion CI: Clopper-Pearson below 30 trials, Wilson otherwise.
    #[must_use]
    pub fn proportion_with_ci(&self, successes: u64, n: u64) -> MetricWithCi {
        if n == 0 {
            return MetricWithCi::point(0.0, "none", 0, true);
        }
        let (value, ci_lower, ci_upper, method) = if n < 30 {
            let (v, lo, hi) = clopper_pearson_ci(successes, n, self.alpha);
            (v, lo, hi, "clopper_pearson")
        } else {
            let (v, lo, hi) = wilson_ci(successes, n, self.alpha);
            (v, lo, hi, "wilson")
        };
        MetricWithCi {
            value,
            ci_lower,
            ci_upper,
            method: method.to_string(),
            n_samples: usize::try_from(n).unwrap_or(usize::MAX),
            degenerate: false,
        }
    }

    /// Aggregate scenario outcomes: pass rate, per-metric mean CIs,
    /// per-dimension stratifications, and power analysis against each
    /// acceptance threshold.
    #[must_use]
    pub fn aggregate_results(
        &self,
        outcomes: &[ScenarioOutcome],
        stratify_by: &[String],
    ) -> AggregatedResults {
        let total = outcomes.len();
        if total == 0 {
            return AggregatedResults {
                total_scenarios: 0,
                pass_rate: MetricWithCi::point(0.0, "none", 0, true),
                mean_metrics: BTreeMap::new(),
                stratified: BTreeMap::new(),
                power_analysis: BTreeMap::new(),
            };
        }

        let passed = outcomes.iter().filter(|o| o.passed).count() as u64;
        let pass_rate = self.proportion_with_ci(passed, total as u64);

        let mut by_metric: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for outcome in outcomes {
            for (name, &value) in &outcome.metrics {
                by_metric.entry(name.clone()).or_default().push(value);
            }
        }

        let mean_metrics: BTreeMap<String, MetricWithCi> = by_metric
            .iter()
            .map(|(name, values)| (name.clone(), self.metric_with_ci(values)))
            .collect();

        let mut stratified = BTreeMap::new();
        for dimension in stratify_by {
            stratified.insert(
                dimension.clone(),
                self.stratify_dimension(outcomes, dimension),
            );
        }

        let power_analysis: BTreeMap<String, Option<usize>> = by_metric
            .iter()
            .map(|(name, values)| {
                let n = self.acceptance_thresholds.get(name).and_then(|&threshold| {
                    let mu = mean(values);
                    let sd = std_dev(values);
                    if values.len() > 1 && sd > 0.0 {
                        power_analysis_n((threshold - mu).abs() / sd, self.alpha, 0.80)
                    } else {
                        None
                    }
                });
                (name.clone(), n)
            })
            .collect();

        AggregatedResults {
            total_scenarios: total,
            pass_rate,
            mean_metrics,
            stratified,
            power_analysis,
        }
    }

    fn stratify_dimension(
        &self,
        outcomes: &[ScenarioOutcome],
        dimension: &str,
    ) -> StratifiedMetrics {
        let mut groups: BTreeMap<String, Vec<&ScenarioOutcome>> = BTreeMap::new();
        for outcome in outcomes {
            let stratum = outcome
                .tags
                .get(dimension)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            groups.entry(stratum).or_default().push(outcome);
        }

        let mut strata = BTreeMap::new();
        let mut sample_sizes = BTreeMap::new();
        for (stratum, members) in groups {
            sample_sizes.insert(stratum.clone(), members.len());
            let mut by_metric: BTreeMap<String, Vec<f64>> = BTreeMap::new();
            for outcome in &members {
                for (name, &value) in &outcome.metrics {
                    by_metric.entry(name.clone()).or_default().push(value);
                }
            }
            let metrics: BTreeMap<String, MetricWithCi> = by_metric
                .into_iter()
                .map(|(name, values)| {
                    let ci = if values.len() < self.config.min_stratum_size {
                        self.normal_approx_ci(&values)
                    } else {
                        self.metric_with_ci(&values)
                    };
                    (name, ci)
                })
                .collect();
            strata.insert(stratum, metrics);
        }

        StratifiedMetrics {
            dimension: dimension.to_string(),
            strata,
            sample_sizes,
        }
    }

    /// Normal-approximation CI for thin strata.
    fn normal_approx_ci(&self, values: &[f64]) -> MetricWithCi {
        let n = values.len();
        if n == 0 {
            return MetricWithCi::point(f64::NAN, "none", 0, true);
        }
        let mu = mean(values);
        let se = if n > 1 {
            std_dev(values) / (n as f64).sqrt()
        } else {
            0.0
        };
        let z = normal_quantile(1.0 - self.alpha / 2.0);
        MetricWithCi {
            value: mu,
            ci_lower: mu - z * se,
            ci_upper: mu + z * se,
            method: "normal_approx".to_string(),
            n_samples: n,
            degenerate: false,
        }
    }

    /// Compare candidate results against a baseline over safety metrics.
    ///
    /// A definite regression needs the candidate's whole CI past the
    /// baseline's in the unsafe direction; a worse point estimate with
    /// overlapping CIs is only a warning.
    #[must_use]
    pub fn detect_regression(
        &self,
        old: &AggregatedResults,
        new: &AggregatedResults,
        safety_metrics: Option<&[String]>,
    ) -> RegressionReport {
        let metric_names: Vec<String> = safety_metrics.map_or_else(
            || self.acceptance_thresholds.keys().cloned().collect(),
            <[String]>::to_vec,
        );

        let mut has_regression = false;
        let mut details = BTreeMap::new();

        for name in metric_names {
            let (Some(old_ci), Some(new_ci)) =
                (old.mean_metrics.get(&name), new.mean_metrics.get(&name))
            else {
                continue;
            };

            let higher_safer = self.higher_is_safer.contains(&name);
            let definite = if higher_safer {
                new_ci.ci_upper < old_ci.ci_lower
            } else {
                new_ci.ci_lower > old_ci.ci_upper
            };
            let point_worse = if higher_safer {
                new_ci.value < old_ci.value
            } else {
                new_ci.value > old_ci.value
            };

            if definite {
                has_regression = true;
                details.insert(
                    name,
                    format!(
                        "REGRESSION: new [{:.4}, {:.4}] clear of old [{:.4}, {:.4}]",
                        new_ci.ci_lower, new_ci.ci_upper, old_ci.ci_lower, old_ci.ci_upper
                    ),
                );
            } else if point_worse {
                details.insert(
                    name,
                    format!(
                        "WARNING: new mean {:.4} worse than old mean {:.4} (CIs overlap, inconclusive)",
                        new_ci.value, old_ci.value
                    ),
                );
            }
        }

        RegressionReport {
            has_regression,
            details,
        }
    }
}

fn std_dev(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mu = mean(values);
    (values.iter().map(|&v| (v - mu) * (v - mu)).sum::<f64>() / n as f64).sqrt()
}

// ──────────────────── tests ────────────────────
