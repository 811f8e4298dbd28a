//! Scenario evaluation harness: acceptance thresholds, a replay buffer for
//! continual learning, and the update gate that ties them together.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::eval::statistics::ScenarioOutcome;

// ──────────────────── scenarios ────────────────────

/// A named evaluation scenario with stratification tags (e.g.
/// `lighting=night`, `density=high`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Threshold-based evaluator: every acceptance threshold is an upper bound
/// (e.g. maximum collision rate); a scenario passes when no thresholded
/// metric exceeds its bound.
pub struct Evaluator {
    acceptance_thresholds: BTreeMap<String, f64>,
}

impl Evaluator {
    #[must_use]
    pub fn new(acceptance_thresholds: BTreeMap<String, f64>) -> Self {
        Self {
            acceptance_thresholds,
        }
    }

    #[must_use]
    pub fn thresholds(&self) -> &BTreeMap<String, f64> {
        &self.acceptance_thresholds
    }

    /// Evaluate one scenario's metrics against the thresholds.
    #[must_use]
    pub fn evaluate_scenario(
        &self,
        scenario: &Scenario,
        metrics: BTreeMap<String, f64>,
    ) -> ScenarioOutcome {
        let passed = metrics.iter().all(|(name, &value)| {
            self.acceptance_thresholds
                .get(name)
                .is_none_or(|&threshold| value <= threshold)
        });
        ScenarioOutcome {
            scenario_id: scenario.id.clone(),
            passed,
            metrics,
            tags: scenario.tags.clone(),
        }
    }

    /// Plain pass rate over a batch of outcomes.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn pass_rate(outcomes: &[ScenarioOutcome]) -> f64 {
        if outcomes.is_empty() {
            return 0.0;
        }
        outcomes.iter().filter(|o| o.passed).count() as f64 / outcomes.len() as f64
    }
}

// ──────────────────── replay buffer ────────────────────

/// Bounded FIFO buffer of past scenarios, sampled during continual-learning
/// updates to limit catastrophic forgetting.
pub struct ReplayBuffer<T> {
    capacity: usize,
    buffer: Vec<T>,
    rng: StdRng,
}

impl<T: Clone> ReplayBuffer<T> {
    /// `seed = None` draws sampling randomness from the OS.
    #[must_use]
    pub fn new(capacity: usize, seed: Option<u64>) -> Self {
        Self {
            capacity: capacity.max(1),
            buffer: Vec::new(),
            rng: seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64),
        }
    }

    pub fn add(&mut self, sample: T) {
        if self.buffer.len() >= self.capacity {
            self.buffer.remove(0);
        }
        self.buffer.push(sample);
    }

    /// Sample up to `batch_size` distinct items uniformly without
    /// replacement.
    pub fn sample(&mut self, batch_size: usize) -> Vec<T> {
        let count = batch_size.min(self.buffer.len());
        let mut indices: Vec<usize> = (0..self.buffer.len()).collect();
        // Partial Fisher-Yates: the first `count` slots end up uniform.
        for i in 0..count {
            let j = self.rng.random_range(i..indices.len());
            indices.swap(i, j);
        }
        indices[..count]
            .iter()
            .map(|&i| self.buffer[i].clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

// ──────────────────── continual learner ────────────────────

/// Gate for model updates: a candidate is accepted only when it passes the
/// whole evaluation suite.
pub struct ContinualLearner {
    evaluator: Evaluator,
}

impl ContinualLearner {
    #[must_use]
    pub fn new(evaluator: Evaluator) -> Self {
        Self { evaluator }
    }

    /// Validate a candidate's metrics across test scenarios. Accepts only a
    /// perfect pass rate.
    #[must_use]
    pub fn validate_update(
        &self,
        candidate_metrics: &[(Scenario, BTreeMap<String, f64>)],
    ) -> bool {
        if candidate_metrics.is_empty() {
            return false;
        }
        let outcomes: Vec<ScenarioOutcome> = candidate_metrics
            .iter()
            .map(|(scenario, metrics)| {
                self.evaluator.evaluate_scenario(scenario, metrics.clone())
            })
            .collect();
        (Evaluator::pass_rate(&outcomes) - 1.0).abs() < f64::EPSILON
    }
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(id: &str) -> Scenario {
        Scenario {
            id: id.to_string(),
            tags: BTreeMap::new(),
        }
    }

    fn thresholds() -> BTreeMap<String, f64> {
        let mut t = BTreeMap::new();
        t.insert("collision_rate".to_string(), 0.01);
        t.insert("violation_rate".to_string(), 0.05);
        t
    }

    fn metrics(collision: f64) -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("collision_rate".to_string(), collision);
        m
    }

    #[test]
    fn scenario_passes_under_threshold() {
        let evaluator = Evaluator::new(thresholds());
        let outcome = evaluator.evaluate_scenario(&scenario("s1"), metrics(0.005));
        assert!(outcome.passed);
        assert_eq!(outcome.scenario_id, "s1");
    }

    #[test]
    fn scenario_fails_over_threshold() {
        let evaluator = Evaluator::new(thresholds());
        let outcome = evaluator.evaluate_scenario(&scenario("s1"), metrics(0.02));
        assert!(!outcome.passed);
    }

    #[test]
    fn unthresholded_metrics_are_ignored() {
        let evaluator = Evaluator::new(thresholds());
        let mut m = metrics(0.005);
        m.insert("latency_ms".to_string(), 1e9);
        assert!(evaluator.evaluate_scenario(&scenario("s1"), m).passed);
    }

    #[test]
    fn pass_rate_over_batch() {
        let evaluator = Evaluator::new(thresholds());
        let outcomes: Vec<ScenarioOutcome> = [0.005, 0.02, 0.001, 0.5]
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                evaluator.evaluate_scenario(&scenario(&format!("s{i}")), metrics(v))
            })
            .collect();
        assert!((Evaluator::pass_rate(&outcomes) - 0.5).abs() < 1e-12);
        assert!(Evaluator::pass_rate(&[]).abs() < f64::EPSILON);
    }

    #[test]
    fn replay_buffer_is_fifo_bounded() {
        let mut buffer = ReplayBuffer::new(3, Some(1));
        for i in 0..5 {
            buffer.add(i);
        }
        assert_eq!(buffer.len(), 3);
        let all = buffer.sample(10);
        assert_eq!(all.len(), 3);
        assert!(all.contains(&2) && all.contains(&3) && all.contains(&4));
    }

    #[test]
    fn replay_buffer_sampling_is_seeded_and_distinct() {
        let mut a = ReplayBuffer::new(100, Some(9));
        let mut b = ReplayBuffer::new(100, Some(9));
        for i in 0..50 {
            a.add(i);
            b.add(i);
        }
        let sa = a.sample(10);
        let sb = b.sample(10);
        assert_eq!(sa, sb);
        assert_eq!(sa.len(), 10);
        let unique: std::collections::BTreeSet<i32> = sa.iter().copied().collect();
        assert_eq!(unique.len(), 10, "samples are without replacement");
    }

    #[test]
    fn continual_learner_requires_perfect_pass() {
        let learner = ContinualLearner::new(Evaluator::new(thresholds()));

        let good = vec![
            (scenario("s1"), metrics(0.001)),
            (scenario("s2"), metrics(0.009)),
        ];
        assert!(learner.validate_update(&good));

        let mixed = vec![
            (scenario("s1"), metrics(0.001)),
            (scenario("s2"), metrics(0.02)),
        ];
        assert!(!learner.validate_update(&mixed));

        assert!(!learner.validate_update(&[]), "no evidence, no update");
    }
}
