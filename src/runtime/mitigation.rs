//! Mitigation state machine: fuses monitor severities, epistemic
//! uncertainty, and the OOD score into a bounded escalation ladder.
//!
//! The FSM is memoryless — hysteresis lives in the monitors, not here. The
//! transition table is evaluated top-to-bottom, first match wins:
//!
//! | condition                                   | next state |
//! |---------------------------------------------|------------|
//! | `s_max >= 1.0`                              | SafeStop   |
//! | `ood > ood_threshold` or `s_max > 0.1`      | Fallback   |
//! | `epistemic > uncertainty_threshold`         | Cautious   |
//! | otherwise                                   | Nominal    |
//!
//! `HumanEscalation` is reachable only via an explicit external
//! [`MitigationController::escalate`] request.

use serde::{Deserialize, Serialize};

use crate::core::contracts::{MitigationState, MonitorOutput, Observation, UncertaintyEstimate};
use crate::safety::monitors::Monitor;

/// Thresholds for the mitigation FSM (config keys `uncertainty_threshold`,
/// `ood_threshold`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MitigationConfig {
    /// Epistemic level above which the state becomes Cautious.
    pub uncertainty_threshold: f64,
    /// OOD score above which the state becomes Fallback.
    pub ood_threshold: f64,
}

impl Default for MitigationConfig {
    fn default() -> Self {
        Self {
            uncertainty_threshold: 0.5,
            ood_threshold: 2.0,
        }
    }
}

/// One step's outcome: the chosen state plus the monitor outputs that fed
/// the decision (for logging).
#[derive(Debug, Clone)]
pub struct MitigationStep {
    pub state: MitigationState,
    pub monitor_outputs: Vec<MonitorOutput>,
    pub max_severity: f64,
}

/// Finite state machine for runtime safety mitigation. Owns its monitors and
/// runs them on every step. The current state is readable but is set only by
/// `step` (and the external `escalate` request).
pub struct MitigationController {
    monitors: Vec<Box<dyn Monitor>>,
    config: MitigationConfig,
    current_state: MitigationState,
}

impl MitigationController {
    #[must_use]
    pub fn new(monitors: Vec<Box<dyn Monitor>>, config: MitigationConfig) -> Self {
        Self {
            monitors,
            config,
            current_state: MitigationState::Nominal,
        }
    }

    /// Current mitigation state.
    #[must_use]
    pub fn current_state(&self) -> MitigationState {
        self.current_state
    }

    /// Execute one control step: run all monitors against the observation,
    /// then apply the transition table.
    pub fn step(
        &mut self,
        observation: &Observation,
        uncertainty: &UncertaintyEstimate,
        ood_score: f64,
    ) -> MitigationStep {
        let monitor_outputs: Vec<MonitorOutput> = self
            .monitors
            .iter_mut()
            .map(|m| m.check(observation))
            .collect();
        let max_severity = monitor_outputs
            .iter()
            .map(|m| m.severity)
            .fold(0.0_f64, f64::max);

        let state = Self::decide(&self.config, max_severity, ood_score, uncertainty.epistemic);
        self.current_state = state;

        MitigationStep {
            state,
            monitor_outputs,
            max_severity,
        }
    }

    /// Pure transition function. Deterministic: the same
    /// `(max_severity, ood_score, epistemic)` always yields the same state.
    #[must_use]
    pub fn decide(
        config: &MitigationConfig,
        max_severity: f64,
        ood_score: f64,
        epistemic: f64,
    ) -> MitigationState {
        if max_severity >= 1.0 {
            MitigationState::SafeStop
        } else if ood_score > config.ood_threshold || max_severity > 0.1 {
            MitigationState::Fallback
        } else if epistemic > config.uncertainty_threshold {
            MitigationState::Cautious
        } else {
            MitigationState::Nominal
        }
    }

    /// External escalation request: hand control to a human operator. This
    /// is the only path into `HumanEscalation`; the next `step` overwrites
    /// it like any other state.
    pub fn escalate(&mut self) -> MitigationState {
        self.current_state = MitigationState::HumanEscalation;
        self.current_state
    }

    /// Number of attached monitors.
    #[must_use]
    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::contracts::ObsValue;
    use crate::safety::monitors::ConstraintMonitor;

    fn controller_with_speed_limit(limit: f64) -> MitigationController {
        MitigationController::new(
            vec![Box::new(ConstraintMonitor::new("speed_limit", "speed", limit))],
            MitigationConfig::default(),
        )
    }

    fn speed_obs(speed: f64) -> Observation {
        let mut obs = Observation::new();
        obs.insert("speed".to_string(), ObsValue::Scalar(speed));
        obs
    }

    fn low_uncertainty() -> UncertaintyEstimate {
        UncertaintyEstimate::new(0.9, 0.05, 0.1, "ensemble_decomposition")
    }

    #[test]
    fn nominal_when_everything_is_quiet() {
        let mut controller = controller_with_speed_limit(10.0);
        let step = controller.step(&speed_obs(5.0), &low_uncertainty(), 0.5);
        assert_eq!(step.state, MitigationState::Nominal);
        assert_eq!(controller.current_state(), MitigationState::Nominal);
        assert_eq!(step.monitor_outputs.len(), 1);
    }

    #[test]
    fn cautious_on_high_epistemic() {
        let mut controller = controller_with_speed_limit(10.0);
        let uncertain = UncertaintyEstimate::new(0.5, 0.1, 0.6, "ensemble_decomposition");
        let step = controller.step(&speed_obs(5.0), &uncertain, 0.5);
        assert_eq!(step.state, MitigationState::Cautious);
    }

    #[test]
    fn fallback_on_ood_score() {
        let mut controller = controller_with_speed_limit(10.0);
        let step = controller.step(&speed_obs(5.0), &low_uncertainty(), 3.0);
        assert_eq!(step.state, MitigationState::Fallback);
    }

    #[test]
    fn fallback_on_soft_monitor_violation() {
        let mut controller = controller_with_speed_limit(10.0);
        // speed 12 -> severity 0.2: above the 0.1 soft threshold.
        let step = controller.step(&speed_obs(12.0), &low_uncertainty(), 0.0);
        assert_eq!(step.state, MitigationState::Fallback);
        assert!((step.max_severity - 0.2).abs() < 1e-9);
    }

    #[test]
    fn safe_stop_on_saturated_severity() {
        let mut controller = controller_with_speed_limit(10.0);
        // speed 20 -> severity 1.0.
        let step = controller.step(&speed_obs(20.0), &low_uncertainty(), 0.0);
        assert_eq!(step.state, MitigationState::SafeStop);
    }

    #[test]
    fn safe_stop_wins_over_ood_and_uncertainty() {
        let config = MitigationConfig::default();
        let state = MitigationController::decide(&config, 1.0, 100.0, 100.0);
        assert_eq!(state, MitigationState::SafeStop);
    }

    #[test]
    fn fallback_wins_over_cautious() {
        let config = MitigationConfig::default();
        let state = MitigationController::decide(&config, 0.0, 5.0, 5.0);
        assert_eq!(state, MitigationState::Fallback);
    }

    #[test]
    fn fsm_is_total_over_input_grid() {
        let config = MitigationConfig::default();
        for severity in [0.0, 0.05, 0.1, 0.2, 0.99, 1.0, 2.0] {
            for ood in [0.0, 1.9, 2.0, 2.1, 10.0] {
                for epistemic in [0.0, 0.5, 0.51, 3.0] {
                    let state = MitigationController::decide(&config, severity, ood, epistemic);
                    assert!(matches!(
                        state,
                        MitigationState::Nominal
                            | MitigationState::Cautious
                            | MitigationState::Fallback
                            | MitigationState::SafeStop
                            | MitigationState::HumanEscalation
                    ));
                }
            }
        }
    }

    #[test]
    fn fsm_is_deterministic() {
        let config = MitigationConfig::default();
        let a = MitigationController::decide(&config, 0.3, 1.5, 0.7);
        let b = MitigationController::decide(&config, 0.3, 1.5, 0.7);
        assert_eq!(a, b);
    }

    #[test]
    fn fsm_is_memoryless() {
        let mut controller = controller_with_speed_limit(10.0);
        // Drive into SafeStop, then a quiet step returns straight to Nominal.
        controller.step(&speed_obs(20.0), &low_uncertainty(), 0.0);
        assert_eq!(controller.current_state(), MitigationState::SafeStop);
        let step = controller.step(&speed_obs(5.0), &low_uncertainty(), 0.0);
        assert_eq!(step.state, MitigationState::Nominal);
    }

    #[test]
    fn escalate_is_external_only() {
        let mut controller = controller_with_speed_limit(10.0);
        assert_eq!(controller.escalate(), MitigationState::HumanEscalation);
        assert_eq!(controller.current_state(), MitigationState::HumanEscalation);
        // The next step overwrites the escalation.
        let step = controller.step(&speed_obs(5.0), &low_uncertainty(), 0.0);
        assert_eq!(step.state, MitigationState::Nominal);
    }

    #[test]
    fn no_monitors_means_zero_severity() {
        let mut controller =
            MitigationController::new(Vec::new(), MitigationConfig::default());
        let step = controller.step(&Observation::new(), &low_uncertainty(), 0.0);
        assert_eq!(step.state, MitigationState::Nominal);
        assert!(step.max_severity.abs() < f64::EPSILON);
        assert_eq!(controller.monitor_count(), 0);
    }
}
