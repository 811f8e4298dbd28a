//! Online decision pipeline: policy -> (conformal, OOD, monitors/FSM) ->
//! safety filter -> intervention log, with health accounting on every step.
//!
//! The hot path never raises. A failing policy is substituted with the
//! configured fallback action; a missing uncertainty stack degrades to a
//! `source = "fallback"` estimate and the Nominal path; the safety filter
//! always runs, so box/half-space compliance holds even under total
//! collapse.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::core::contracts::{MitigationState, MonitorOutput, Observation, Policy, UncertaintyEstimate};
use crate::core::errors::Result;
use crate::health::monitor::{HealthMonitor, HealthStatus};
use crate::logger::intervention::InterventionLogger;
use crate::ood::detectors::DetectorInputs;
use crate::ood::ensemble::{OodEnsemble, OodResult};
use crate::runtime::mitigation::MitigationController;
use crate::safety::filter::{FilteredAction, SafetyFilter};
use crate::uncertainty::conformal::ConformalPredictor;
use crate::uncertainty::kernels::decompose_uncertainty;

/// Per-step side inputs from the model stack. Everything is optional; the
/// pipeline degrades gracefully around whatever is missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepContext<'a> {
    /// Per-class nonconformity scores for this step's prediction.
    pub nonconformity: Option<&'a [f64]>,
    /// Ensemble probabilities (K members x N samples x C classes) for
    /// uncertainty decomposition.
    pub ensemble_probs: Option<&'a [Vec<Vec<f64>>]>,
    /// Precomputed uncertainty estimate; overrides `ensemble_probs`.
    pub uncertainty: Option<&'a UncertaintyEstimate>,
    /// Feature/logit vector for the OOD ensemble.
    pub features: Option<&'a [f64]>,
    /// Dynamics-model residual for the OOD ensemble.
    pub dynamics_residual: Option<&'a [f64]>,
    /// State vector for CBF filtering.
    pub state: Option<&'a [f64]>,
}

/// Everything one control step produced.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub state: MitigationState,
    pub action: FilteredAction,
    pub uncertainty: UncertaintyEstimate,
    pub ood: Option<OodResult>,
    pub monitor_outputs: Vec<MonitorOutput>,
    /// The policy failure that forced the fallback action, if any.
    pub policy_error: Option<String>,
    /// Whether an intervention record was emitted for this step.
    pub logged: bool,
}

/// The per-step orchestrator. One pipeline per trajectory; multiple
/// pipelines may run on different worker threads.
pub struct TrustPipeline {
    policy: Arc<dyn Policy>,
    controller: MitigationController,
    filter: SafetyFilter,
    logger: InterventionLogger,
    health: HealthMonitor,
    conformal: Option<Arc<dyn ConformalPredictor>>,
    ood: Option<OodEnsemble>,
    /// Action emitted when the policy itself fails.
    fallback_action: Vec<f64>,
}

impl TrustPipeline {
    #[must_use]
    pub fn new(
        policy: Arc<dyn Policy>,
        controller: MitigationController,
        filter: SafetyFilter,
        logger: InterventionLogger,
        fallback_action: Vec<f64>,
    ) -> Self {
        Self {
            policy,
            controller,
            filter,
            logger,
            health: HealthMonitor::default(),
            conformal: None,
            ood: None,
            fallback_action,
        }
    }

    #[must_use]
    pub fn with_conformal(mut self, predictor: Arc<dyn ConformalPredictor>) -> Self {
        self.conformal = Some(predictor);
        self
    }

    #[must_use]
    pub fn with_ood(mut self, ensemble: OodEnsemble) -> Self {
        self.ood = Some(ensemble);
        self
    }

    #[must_use]
    pub fn with_health(mut self, health: HealthMonitor) -> Self {
        self.health = health;
        self
    }

    /// Execute one control step. Never fails; every degradation is visible
    /// in the outcome and the intervention log.
    pub fn step(&mut self, observation: &Observation, context: &StepContext<'_>) -> StepOutcome {
        let started = Instant::now();

        // Policy first: its failure switches to the fallback action but the
        // rest of the pipeline still runs.
        let (candidate, policy_error) = match self.policy.act(observation) {
            Ok(action) => (action, None),
            Err(err) => (self.fallback_action.clone(), Some(err.to_string())),
        };

        let uncertainty = self.estimate_uncertainty(context);
        let ood = self.score_ood(context);
        let (ood_score, ood_components) = ood.as_ref().map_or((0.0, None), |o| {
            (o.ensemble_score, Some(&o.component_scores))
        });

        let mitigation = self.controller.step(observation, &uncertainty, ood_score);
        let action = self.filter.filter(&candidate, context.state);

        let logged = self.logger.log(
            observation,
            mitigation.state,
            &uncertainty,
            ood_score,
            ood_components,
            &action.action,
            &mitigation.monitor_outputs,
        );

        self.health.record(
            "step",
            started.elapsed().as_secs_f64() * 1e3,
            policy_error.is_none(),
        );

        StepOutcome {
            state: mitigation.state,
            action,
            uncertainty,
            ood,
            monitor_outputs: mitigation.monitor_outputs,
            policy_error,
            logged,
        }
    }

    fn estimate_uncertainty(&self, context: &StepContext<'_>) -> UncertaintyEstimate {
        let mut estimate = if let Some(estimate) = context.uncertainty {
            estimate.clone()
        } else if let Some(probs) = context.ensemble_probs {
            match decompose_uncertainty(probs) {
                Ok(d) => UncertaintyEstimate::new(
                    1.0 - d.epistemic.min(1.0),
                    d.aleatoric,
                    d.epistemic,
                    "ensemble_decomposition",
                ),
                Err(_) => UncertaintyEstimate::fallback(),
            }
        } else {
            UncertaintyEstimate::fallback()
        };

        if let (Some(predictor), Some(scores)) = (self.conformal.as_ref(), context.nonconformity)
        {
            let results = predictor.predict(&[scores.to_vec()]);
            if let Some(result) = results.first()
                && result.valid
            {
                estimate = estimate
                    .with_prediction_set(result.prediction_set.clone(), result.coverage);
            }
        }
        estimate
    }

    fn score_ood(&self, context: &StepContext<'_>) -> Option<OodResult> {
        let ensemble = self.ood.as_ref()?;
        let mut inputs = DetectorInputs::from_features(context.features.unwrap_or(&[]));
        if let Some(residual) = context.dynamics_residual {
            inputs = inputs.with_dynamics_residual(residual);
        }
        Some(ensemble.score(&inputs))
    }

    /// Operator-facing health snapshot (aggregate or per-operation).
    #[must_use]
    pub fn get_health(&self, operation: Option<&str>) -> HealthStatus {
        self.health.get_health(operation)
    }

    /// Current mitigation state.
    #[must_use]
    pub fn current_state(&self) -> MitigationState {
        self.controller.current_state()
    }

    /// Request human escalation (external path into `HumanEscalation`).
    pub fn escalate(&mut self) -> MitigationState {
        self.controller.escalate()
    }

    /// Rotate to a new trace (new episode).
    pub fn new_trace(&self) -> String {
        self.logger.new_trace()
    }

    /// Flush and close the intervention log, draining its sink.
    pub fn close(&self) -> Result<()> {
        self.logger.close()
    }

    /// Read-only constraint check against the configured safety filter.
    #[must_use]
    pub fn check_constraints(&self, action: &[f64]) -> BTreeMap<String, bool> {
        self.filter.check_constraints(action)
    }
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::contracts::{ObsValue, SafetyEnvelope, scalar_or_zero};
    use crate::core::errors::PsnError;
    use crate::logger::intervention::LoggerConfig;
    use crate::logger::sink::MemorySink;
    use crate::ood::detectors::{MahalanobisDetector, OodDetector};
    use crate::ood::ensemble::OodConfig;
    use crate::runtime::mitigation::MitigationConfig;
    use crate::safety::filter::BoxConstraint;
    use crate::safety::monitors::ConstraintMonitor;

    fn speed_policy() -> Arc<dyn Policy> {
        Arc::new(|obs: &Observation| -> Result<Vec<f64>> {
            Ok(vec![scalar_or_zero(obs, "speed") / 2.0])
        })
    }

    fn failing_policy() -> Arc<dyn Policy> {
        Arc::new(|_obs: &Observation| -> Result<Vec<f64>> {
            Err(PsnError::external("policy", "model server unreachable"))
        })
    }

    fn obs(speed: f64) -> Observation {
        let mut o = Observation::new();
        o.insert("speed".to_string(), ObsValue::Scalar(speed));
        o
    }

    fn fitted_ood() -> OodEnsemble {
        let data: Vec<Vec<f64>> = (0..400)
            .map(|i| vec![(f64::from(i) * 0.7368).sin() * 1.2])
            .collect();
        let mut detector = MahalanobisDetector::new();
        detector.fit(&data, None).unwrap();
        let detectors: Vec<Box<dyn OodDetector>> = vec![Box::new(detector)];
        OodEnsemble::new(detectors, None, &OodConfig::default()).unwrap()
    }

    fn pipeline(policy: Arc<dyn Policy>) -> (Arc<MemorySink>, TrustPipeline) {
        let sink = Arc::new(MemorySink::new(10_000));
        let controller = MitigationController::new(
            vec![Box::new(ConstraintMonitor::new("speed_limit", "speed", 10.0))],
            MitigationConfig::default(),
        );
        let filter = SafetyFilter::new(SafetyEnvelope::default())
            .with_box(BoxConstraint::new("box", vec![-1.0], vec![1.0]))
            .with_fallback_action(vec![0.1]);
        let logger = InterventionLogger::new(
            Box::new(Arc::clone(&sink)),
            &LoggerConfig {
                log_all: true,
                ..LoggerConfig::default()
            },
        );
        let p = TrustPipeline::new(policy, controller, filter, logger, vec![0.0])
            .with_ood(fitted_ood());
        (sink, p)
    }

    fn uncertain(epistemic: f64) -> UncertaintyEstimate {
        UncertaintyEstimate::new(0.8, 0.1, epistemic, "external")
    }

    #[test]
    fn nominal_step_end_to_end() {
        let (_sink, mut pipeline) = pipeline(speed_policy());
        let features = [0.1];
        let low = uncertain(0.1);
        let outcome = pipeline.step(
            &obs(5.0),
            &StepContext {
                features: Some(&features),
                uncertainty: Some(&low),
                ..StepContext::default()
            },
        );
        assert_eq!(outcome.state, MitigationState::Nominal);
        assert!(outcome.policy_error.is_none());
        assert!(!outcome.action.was_modified);
        assert!(outcome.ood.as_ref().unwrap().ensemble_score < 2.0);
    }

    #[test]
    fn cautious_step_on_epistemic() {
        let (_sink, mut pipeline) = pipeline(speed_policy());
        let features = [0.1];
        let high = uncertain(0.6);
        let outcome = pipeline.step(
            &obs(5.0),
            &StepContext {
                features: Some(&features),
                uncertainty: Some(&high),
                ..StepContext::default()
            },
        );
        assert_eq!(outcome.state, MitigationState::Cautious);
    }

    #[test]
    fn fallback_step_on_ood_input() {
        let (_sink, mut pipeline) = pipeline(speed_policy());
        let features = [3.0];
        let low = uncertain(0.1);
        let outcome = pipeline.step(
            &obs(5.0),
            &StepContext {
                features: Some(&features),
                uncertainty: Some(&low),
                ..StepContext::default()
            },
        );
        assert_eq!(outcome.state, MitigationState::Fallback);
        assert_eq!(
            outcome.ood.as_ref().unwrap().dominant_detector,
            "mahalanobis"
        );
    }

    #[test]
    fn safe_stop_step_on_saturated_monitor() {
        let (_sink, mut pipeline) = pipeline(speed_policy());
        let features = [0.1];
        let low = uncertain(0.1);
        let outcome = pipeline.step(
            &obs(20.0),
            &StepContext {
                features: Some(&features),
                uncertainty: Some(&low),
                ..StepContext::default()
            },
        );
        assert_eq!(outcome.state, MitigationState::SafeStop);
    }

    #[test]
    fn box_filter_clamps_policy_output() {
        let (_sink, mut pipeline) = pipeline(speed_policy());
        // speed 5 -> severity 0, but raw action 2.5 violates the box.
        let outcome = pipeline.step(&obs(5.0), &StepContext::default());
        assert_eq!(outcome.action.action, vec![1.0]);
        assert!(outcome.action.was_modified);
    }

    #[test]
    fn policy_failure_substitutes_fallback_and_still_filters() {
        let (sink, mut pipeline) = pipeline(failing_policy());
        let outcome = pipeline.step(&obs(5.0), &StepContext::default());
        assert!(outcome.policy_error.is_some());
        // Fallback action [0.0] passes the box untouched... except the
        // near-zero rule swaps in the filter's own fallback.
        assert_eq!(outcome.action.action, vec![0.1]);
        assert!(outcome.action.fallback_used);
        // Health shows the failure.
        assert_eq!(pipeline.get_health(None).total_errors, 1);
        // The step was still logged.
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn uncertainty_collapse_degrades_to_fallback_source() {
        let (sink, mut pipeline) = pipeline(speed_policy());
        // No uncertainty, no conformal, no features worth scoring.
        let outcome = pipeline.step(&obs(5.0), &StepContext::default());
        assert_eq!(outcome.state, MitigationState::Nominal);
        assert_eq!(outcome.uncertainty.source, "fallback");
        let records = sink.records();
        assert_eq!(records[0].uncertainty.source, "fallback");
    }

    #[test]
    fn ensemble_probs_drive_decomposition() {
        let (_sink, mut pipeline) = pipeline(speed_policy());
        let probs = vec![
            vec![vec![0.9, 0.1]],
            vec![vec![0.2, 0.8]],
        ];
        let outcome = pipeline.step(
            &obs(5.0),
            &StepContext {
                ensemble_probs: Some(&probs),
                ..StepContext::default()
            },
        );
        assert_eq!(outcome.uncertainty.source, "ensemble_decomposition");
        assert!(outcome.uncertainty.epistemic > 0.0);
    }

    #[test]
    fn conformal_attaches_prediction_set() {
        use crate::uncertainty::conformal::{ConformalConfig, SplitConformalPredictor};

        let predictor = Arc::new(SplitConformalPredictor::new(ConformalConfig::default()));
        let calibration: Vec<f64> = (0..200).map(|i| f64::from(i) / 200.0).collect();
        predictor.fit(&calibration, None).unwrap();

        let (_sink, pipeline) = pipeline(speed_policy());
        let mut pipeline = pipeline.with_conformal(predictor);

        let low = uncertain(0.1);
        let scores = [0.05, 0.99];
        let outcome = pipeline.step(
            &obs(5.0),
            &StepContext {
                uncertainty: Some(&low),
                nonconformity: Some(&scores),
                ..StepContext::default()
            },
        );
        assert_eq!(outcome.uncertainty.prediction_set, vec![0]);
        assert_eq!(outcome.uncertainty.set_size, 1);
        assert!((outcome.uncertainty.coverage - 0.9).abs() < 1e-9);
    }

    #[test]
    fn monitor_outputs_reach_the_log() {
        let (sink, mut pipeline) = pipeline(speed_policy());
        pipeline.step(&obs(12.0), &StepContext::default());
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].monitor_outputs.len(), 1);
        assert!(records[0].monitor_outputs[0].triggered);
        assert_eq!(records[0].state, MitigationState::Fallback);
    }

    #[test]
    fn trace_rotation_and_close() {
        let (sink, mut pipeline) = pipeline(speed_policy());
        pipeline.step(&obs(5.0), &StepContext::default());
        let t2 = pipeline.new_trace();
        pipeline.step(&obs(5.0), &StepContext::default());
        pipeline.close().unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_ne!(records[0].trace_id, records[1].trace_id);
        assert_eq!(records[1].trace_id, t2);
        assert_eq!(records[1].step_number, 0);
    }

    #[test]
    fn check_constraints_passthrough() {
        let (_sink, pipeline) = pipeline(speed_policy());
        let checks = pipeline.check_constraints(&[0.5]);
        assert_eq!(checks.get("box"), Some(&true));
        let checks = pipeline.check_constraints(&[3.0]);
        assert_eq!(checks.get("box"), Some(&false));
    }
}
