//! Replay engine: re-execute logged trajectories with substituted policies
//! or monitors for counterfactual analysis.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use serde::Serialize;

use crate::core::contracts::{MonitorOutput, Policy};
use crate::logger::intervention::InterventionRecord;
use crate::logger::query::LogQuery;
use crate::safety::monitors::Monitor;

/// Per-step replay outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayStep {
    pub trace_id: String,
    pub step_number: u64,
    pub original_action: Vec<f64>,
    /// Action from the substituted policy, when one was supplied and
    /// succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_action: Option<Vec<f64>>,
    /// `||a_new - a_orig||` for this step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_divergence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_error: Option<String>,
    /// Outputs from substituted monitors, when supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_outputs: Option<Vec<MonitorOutput>>,
}

/// Divergence statistics for a substituted policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DivergenceStats {
    pub mean: f64,
    pub max: f64,
    pub std: f64,
    pub n_samples: usize,
}

/// Replays logged interventions in `(trace_id, step_number)` order.
pub struct ReplayEngine {
    records: Vec<InterventionRecord>,
}

impl ReplayEngine {
    #[must_use]
    pub fn new(mut records: Vec<InterventionRecord>) -> Self {
        records.sort_by(|a, b| {
            a.trace_id
                .cmp(&b.trace_id)
                .then(a.step_number.cmp(&b.step_number))
        });
        Self { records }
    }

    #[must_use]
    pub fn from_query(query: LogQuery) -> Self {
        Self::new(query.into_records())
    }

    #[must_use]
    pub fn records(&self) -> &[InterventionRecord] {
        &self.records
    }

    /// Re-execute every record with an optional substituted policy and/or
    /// monitor set. Failures of the substituted components are captured per
    /// step, never raised.
    pub fn replay(
        &self,
        policy: Option<&dyn Policy>,
        mut monitors: Option<&mut [Box<dyn Monitor>]>,
    ) -> Vec<ReplayStep> {
        self.records
            .iter()
            .map(|record| {
                let mut step = ReplayStep {
                    trace_id: record.trace_id.clone(),
                    step_number: record.step_number,
                    original_action: record.action.clone(),
                    new_action: None,
                    action_divergence: None,
                    policy_error: None,
                    monitor_outputs: None,
                };

                if let Some(policy) = policy {
                    match policy.act(&record.observation) {
                        Ok(action) => {
                            step.action_divergence =
                                divergence(&action, &record.action);
                            if step.action_divergence.is_none() {
                                step.policy_error = Some(format!(
                                    "action dimension {} != logged {}",
                                    action.len(),
                                    record.action.len()
                                ));
                            }
                            step.new_action = Some(action);
                        }
                        Err(err) => step.policy_error = Some(err.to_string()),
                    }
                }

                if let Some(monitors) = monitors.as_deref_mut() {
                    step.monitor_outputs = Some(
                        monitors
                            .iter_mut()
                            .map(|m| m.check(&record.observation))
                            .collect(),
                    );
                }

                step
            })
            .collect()
    }

    /// Mean/max/std of `||a_new - a_orig||` for a substituted policy.
    /// Steps where the policy fails are skipped.
    pub fn compute_divergence(&self, policy: &dyn Policy) -> DivergenceStats {
        let mut divergences = Vec::new();
        for record in &self.records {
            if let Ok(action) = policy.act(&record.observation)
                && let Some(d) = divergence(&action, &record.action)
            {
                divergences.push(d);
            }
        }

        if divergences.is_empty() {
            return DivergenceStats {
                mean: 0.0,
                max: 0.0,
                std: 0.0,
                n_samples: 0,
            };
        }
        let n = divergences.len() as f64;
        let mean = divergences.iter().sum::<f64>() / n;
        let max = divergences.iter().fold(0.0_f64, |acc, &d| acc.max(d));
        let var = divergences
            .iter()
            .map(|&d| (d - mean) * (d - mean))
            .sum::<f64>()
            / n;
        DivergenceStats {
            mean,
            max,
            std: var.sqrt(),
            n_samples: divergences.len(),
        }
    }
}

fn divergence(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() {
        return None;
    }
    Some(
        a.iter()
            .zip(b)
            .map(|(&x, &y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt(),
    )
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::contracts::{
        MitigationState, ObsValue, Observation, UncertaintyEstimate, scalar_or_zero,
    };
    use crate::core::errors::{PsnError, Result};
    use crate::logger::intervention::LOG_FORMAT_VERSION;
    use crate::safety::monitors::ConstraintMonitor;

    fn record(trace: &str, step: u64, speed: f64, action: Vec<f64>) -> InterventionRecord {
        let mut observation = Observation::new();
        observation.insert("speed".to_string(), ObsValue::Scalar(speed));
        InterventionRecord {
            id: format!("{trace}-{step}"),
            timestamp: 1000.0 + step as f64,
            trace_id: trace.to_string(),
            step_number: step,
            session_id: "sess".to_string(),
            observation,
            state: MitigationState::Nominal,
            previous_state: MitigationState::Nominal,
            uncertainty: UncertaintyEstimate::fallback(),
            ood_score: 0.0,
            ood_component_scores: None,
            action,
            monitor_outputs: Vec::new(),
            version: LOG_FORMAT_VERSION.to_string(),
        }
    }

    /// The policy that produced the original log: action = speed / 2.
    fn original_policy(obs: &Observation) -> Result<Vec<f64>> {
        Ok(vec![scalar_or_zero(obs, "speed") / 2.0])
    }

    fn sample_records() -> Vec<InterventionRecord> {
        vec![
            record("t1", 0, 4.0, vec![2.0]),
            record("t1", 1, 6.0, vec![3.0]),
            record("t2", 0, 10.0, vec![5.0]),
        ]
    }

    #[test]
    fn records_sorted_by_trace_then_step() {
        let mut shuffled = sample_records();
        shuffled.reverse();
        let engine = ReplayEngine::new(shuffled);
        let order: Vec<(String, u64)> = engine
            .records()
            .iter()
            .map(|r| (r.trace_id.clone(), r.step_number))
            .collect();
        assert_eq!(
            order,
            vec![
                ("t1".to_string(), 0),
                ("t1".to_string(), 1),
                ("t2".to_string(), 0)
            ]
        );
    }

    #[test]
    fn replaying_original_policy_diverges_nowhere() {
        let engine = ReplayEngine::new(sample_records());
        let stats = engine.compute_divergence(&original_policy);
        assert_eq!(stats.n_samples, 3);
        assert!(stats.mean.abs() < 1e-12);
        assert!(stats.max.abs() < 1e-12);
        assert!(stats.std.abs() < 1e-12);
    }

    #[test]
    fn substituted_policy_reports_divergence() {
        let engine = ReplayEngine::new(sample_records());
        // New policy halves the original action.
        let halved = |obs: &Observation| -> Result<Vec<f64>> {
            Ok(vec![scalar_or_zero(obs, "speed") / 4.0])
        };
        let steps = engine.replay(Some(&halved as &dyn Policy), None);
        assert_eq!(steps.len(), 3);
        // Step with speed 10: original 5.0, new 2.5, divergence 2.5.
        let last = &steps[2];
        assert!((last.action_divergence.unwrap() - 2.5).abs() < 1e-12);
        assert_eq!(last.new_action.as_deref(), Some(&[2.5][..]));
    }

    #[test]
    fn policy_failure_is_captured_per_step() {
        let engine = ReplayEngine::new(sample_records());
        let failing = |_obs: &Observation| -> Result<Vec<f64>> {
            Err(PsnError::external("policy", "inference backend down"))
        };
        let steps = engine.replay(Some(&failing as &dyn Policy), None);
        assert!(steps.iter().all(|s| s.policy_error.is_some()));
        assert!(steps.iter().all(|s| s.new_action.is_none()));

        let stats = engine.compute_divergence(&failing);
        assert_eq!(stats.n_samples, 0);
        assert!(stats.mean.abs() < f64::EPSILON);
    }

    #[test]
    fn dimension_mismatch_is_flagged_not_fatal() {
        let engine = ReplayEngine::new(sample_records());
        let wrong_dim =
            |_obs: &Observation| -> Result<Vec<f64>> { Ok(vec![1.0, 2.0]) };
        let steps = engine.replay(Some(&wrong_dim as &dyn Policy), None);
        assert!(steps[0].policy_error.is_some());
        assert!(steps[0].action_divergence.is_none());
    }

    #[test]
    fn substituted_monitors_run_against_logged_observations() {
        let engine = ReplayEngine::new(sample_records());
        let mut monitors: Vec<Box<dyn Monitor>> =
            vec![Box::new(ConstraintMonitor::new("speed_limit", "speed", 5.0))];
        let steps = engine.replay(None, Some(&mut monitors));

        let outputs: Vec<bool> = steps
            .iter()
            .map(|s| s.monitor_outputs.as_ref().unwrap()[0].triggered)
            .collect();
        // Speeds 4, 6, 10 against limit 5.
        assert_eq!(outputs, vec![false, true, true]);
    }

    #[test]
    fn from_query_preserves_records() {
        let query = LogQuery::from_records(sample_records());
        let engine = ReplayEngine::from_query(query);
        assert_eq!(engine.records().len(), 3);
    }
}
