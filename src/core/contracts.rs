//! Shared data model: observations, uncertainty estimates, monitor outputs,
//! mitigation states, and the external collaborator traits (policy, dynamics).

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::errors::Result;

// ──────────────────── observations ────────────────────

/// An observation is an opaque mapping from string keys to values, produced
/// by an external sensor layer each control step.
pub type Observation = BTreeMap<String, ObsValue>;

/// A single observation value. Untagged so values round-trip through JSON as
/// their natural representation (numbers, strings, arrays, objects).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObsValue {
    Bool(bool),
    Scalar(f64),
    Text(String),
    Vector(Vec<f64>),
    List(Vec<ObsValue>),
    Map(BTreeMap<String, ObsValue>),
}

impl ObsValue {
    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            Self::Vector(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[ObsValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, ObsValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<f64> for ObsValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<Vec<f64>> for ObsValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Vector(v)
    }
}

impl From<&str> for ObsValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Read a scalar observation key, defaulting to 0.0 when absent or non-scalar.
#[must_use]
pub fn scalar_or_zero(observation: &Observation, key: &str) -> f64 {
    observation
        .get(key)
        .and_then(ObsValue::as_scalar)
        .unwrap_or(0.0)
}

// ──────────────────── mitigation state ────────────────────

/// Operational states for the runtime mitigation controller, ordered from
/// least to most severe. Explicit discriminants keep the ordering stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MitigationState {
    Nominal = 0,
    Cautious = 1,
    Fallback = 2,
    SafeStop = 3,
    HumanEscalation = 4,
}

impl MitigationState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Nominal => "nominal",
            Self::Cautious => "cautious",
            Self::Fallback => "fallback",
            Self::SafeStop => "safe_stop",
            Self::HumanEscalation => "human_escalation",
        }
    }
}

impl fmt::Display for MitigationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ──────────────────── uncertainty ────────────────────

/// Standardized model-uncertainty output.
///
/// Invariant: when `prediction_set` is populated, `set_size` equals its
/// length and `coverage` is the emitting predictor's target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyEstimate {
    /// Overall model confidence in [0, 1].
    pub confidence: f64,
    /// Estimate of irreducible noise (aleatoric), nonnegative.
    pub aleatoric: f64,
    /// Estimate of knowledge gap (epistemic), nonnegative.
    pub epistemic: f64,
    /// Method used for estimation, e.g. "ensemble_decomposition".
    pub source: String,
    /// Conformal prediction set (class indices), empty when unused.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prediction_set: Vec<usize>,
    /// Size of the conformal prediction set.
    #[serde(default)]
    pub set_size: usize,
    /// Target coverage probability of the conformal set.
    #[serde(default)]
    pub coverage: f64,
}

impl UncertaintyEstimate {
    /// Build an estimate without a conformal set.
    #[must_use]
    pub fn new(confidence: f64, aleatoric: f64, epistemic: f64, source: &str) -> Self {
        Self {
            confidence: confidence.clamp(0.0, 1.0),
            aleatoric: aleatoric.max(0.0),
            epistemic: epistemic.max(0.0),
            source: source.to_string(),
            prediction_set: Vec::new(),
            set_size: 0,
            coverage: 0.0,
        }
    }

    /// Attach a conformal prediction set, keeping the set-size invariant.
    #[must_use]
    pub fn with_prediction_set(mut self, prediction_set: Vec<usize>, coverage: f64) -> Self {
        self.set_size = prediction_set.len();
        self.prediction_set = prediction_set;
        self.coverage = coverage;
        self
    }

    /// Substitute estimate for a controller facing total uncertainty
    /// collapse (predictor unavailable). Carries `source = "fallback"`.
    #[must_use]
    pub fn fallback() -> Self {
        Self::new(0.0, 0.0, 0.0, "fallback")
    }
}

// ──────────────────── risk and envelope ────────────────────

/// Operational risk profile for a candidate action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub expected_risk: f64,
    /// Conditional value-at-risk (tail risk).
    pub tail_risk_cvar: f64,
    pub violation_probability: f64,
    /// Whether the risk is within safety acceptance bounds.
    pub acceptable: bool,
}

/// Declared constraint identifiers the controller must respect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyEnvelope {
    /// Constraints that cannot be violated.
    pub hard_constraints: Vec<String>,
    /// Constraints that should be minimized.
    pub soft_constraints: Vec<String>,
    /// Maximum tolerated probability of violation.
    pub violation_threshold: f64,
}

// ──────────────────── monitor output ────────────────────

/// Output from a runtime safety monitor. Severity is scaled: 0 = healthy,
/// 1 = saturate/critical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorOutput {
    pub monitor_id: String,
    pub triggered: bool,
    pub severity: f64,
    pub message: String,
    /// Wall-clock Unix seconds.
    pub timestamp: f64,
}

/// Current wall-clock time as fractional Unix seconds.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

// ──────────────────── tracked objects ────────────────────

/// A tracked object for time-to-collision computation. Position, velocity,
/// and (when present) acceleration share dimensionality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub object_id: String,
    pub position: Vec<f64>,
    pub velocity: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceleration: Option<Vec<f64>>,
}

impl TrackedObject {
    /// Parse a tracked object from an observation map value. Returns `None`
    /// when required keys are missing or malformed.
    #[must_use]
    pub fn from_value(value: &ObsValue) -> Option<Self> {
        let map = value.as_map()?;
        let position = map.get("position")?.as_vector()?.to_vec();
        let velocity = map.get("velocity")?.as_vector()?.to_vec();
        if position.len() != velocity.len() {
            return None;
        }
        let acceleration = map
            .get("acceleration")
            .and_then(ObsValue::as_vector)
            .map(<[f64]>::to_vec);
        Some(Self {
            object_id: map
                .get("object_id")
                .and_then(ObsValue::as_text)
                .unwrap_or("unknown")
                .to_string(),
            position,
            velocity,
            acceleration,
        })
    }
}

// ──────────────────── collaborator traits ────────────────────

/// A policy maps an observation to an action vector. Policies may fail;
/// failures are isolated at each consuming component's boundary.
pub trait Policy: Send + Sync {
    fn act(&self, observation: &Observation) -> Result<Vec<f64>>;
}

impl<F> Policy for F
where
    F: Fn(&Observation) -> Result<Vec<f64>> + Send + Sync,
{
    fn act(&self, observation: &Observation) -> Result<Vec<f64>> {
        self(observation)
    }
}

/// A dynamics model maps (state, action) to the predicted next state. Pure.
pub trait Dynamics: Send + Sync {
    fn predict(&self, state: &[f64], action: &[f64]) -> Vec<f64>;
}

impl<F> Dynamics for F
where
    F: Fn(&[f64], &[f64]) -> Vec<f64> + Send + Sync,
{
    fn predict(&self, state: &[f64], action: &[f64]) -> Vec<f64> {
        self(state, action)
    }
}

// ──────────────────── tests ────────────────────
