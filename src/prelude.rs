//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use policy_sentinel::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::contracts::{
    Dynamics, MitigationState, MonitorOutput, ObsValue, Observation, Policy, RiskAssessment,
    SafetyEnvelope, TrackedObject, UncertaintyEstimate,
};
pub use crate::core::errors::{PsnError, Result};

// Uncertainty
pub use crate::uncertainty::conformal::{
    AdaptiveConformalPredictor, CalibrationData, CalibrationStore, ConformalConfig,
    ConformalPredictor, ConformalResult, MondrianConformalPredictor, SplitConformalPredictor,
};
pub use crate::uncertainty::kernels::{
    brier_score, decompose_uncertainty, expected_calibration_error, predictive_entropy,
};

// OOD
pub use crate::ood::detectors::{
    DetectorInputs, DynamicsResidualDetector, EnergyDetector, LabelShiftDetector,
    MahalanobisDetector, OodDetector,
};
pub use crate::ood::ensemble::{OodCombination, OodConfig, OodEnsemble, OodResult};

// Safety
pub use crate::safety::filter::{
    BoxConstraint, CbfFilter, FilteredAction, HalfSpaceConstraint, SafetyFilter,
};
pub use crate::safety::monitors::{
    ConstraintMonitor, GeofenceMonitor, Monitor, TtcConfig, TtcMonitor,
};

// Runtime
pub use crate::runtime::mitigation::{MitigationConfig, MitigationController};
pub use crate::runtime::pipeline::{StepContext, StepOutcome, TrustPipeline};

// Health
pub use crate::health::alerts::{Alert, AlertChannel, AlertEngine, AlertRule, WebhookChannel};
pub use crate::health::monitor::{HealthMonitor, HealthStatus};
pub use crate::health::stats::RollingStatistics;

// Logging and replay
pub use crate::logger::intervention::{InterventionLogger, InterventionRecord, LoggerConfig};
pub use crate::logger::query::LogQuery;
pub use crate::logger::replay::ReplayEngine;
pub use crate::logger::sink::{FileSink, LogSink, MemorySink};

// Evaluation and deployment
pub use crate::eval::deployment::{
    AbTestRunner, AutoPromoter, DeploymentConfig, DeploymentManager, PromotionCriteria,
    ShadowRunner,
};
pub use crate::eval::scenarios::{ContinualLearner, Evaluator, ReplayBuffer, Scenario};
pub use crate::eval::statistics::{
    AggregatedResults, EvalConfig, MetricWithCi, ScenarioOutcome, StatisticalEvaluator,
};

// Selection
pub use crate::selection::acquisition::{
    AcquisitionConfig, AcquisitionPolicy, BatchSelectionResult, SampleMetadata, SelectionMethod,
};
