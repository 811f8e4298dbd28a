//! Intervention records and the decision logger.
//!
//! The logger captures a full snapshot of every decision point (or only the
//! non-nominal edge when `log_all` is off) so offline replay can reconstruct
//! continuous trajectories. Records are append-only and strictly ordered by
//! `step_number` within a trace.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::contracts::{
    MitigationState, MonitorOutput, Observation, UncertaintyEstimate, unix_now,
};
use crate::core::errors::Result;
use crate::logger::sink::LogSink;

/// Log format version stamped into every record. Records written by version
/// V must remain parseable by every later version.
pub const LOG_FORMAT_VERSION: &str = "1.0";

// ──────────────────── record ────────────────────

/// Snapshot of a single intervention/decision point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionRecord {
    pub id: String,
    /// Unix seconds.
    pub timestamp: f64,
    pub trace_id: String,
    /// Monotonic within a trace.
    pub step_number: u64,
    pub session_id: String,
    /// Observation after privacy field filtering.
    pub observation: Observation,
    pub state: MitigationState,
    pub previous_state: MitigationState,
    pub uncertainty: UncertaintyEstimate,
    pub ood_score: f64,
    /// Per-detector OOD attribution, when the ensemble supplied it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ood_component_scores: Option<BTreeMap<String, f64>>,
    /// The executed action vector.
    pub action: Vec<f64>,
    pub monitor_outputs: Vec<MonitorOutput>,
    /// Mandatory log-format version.
    pub version: String,
}

// ──────────────────── configuration ────────────────────

/// Logger behavior (config keys `log_all`, `field_filters`, `compress`,
/// `buffer_size`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggerConfig {
    /// Log every step instead of only non-nominal transitions.
    pub log_all: bool,
    /// Observation keys dropped from records (privacy).
    pub field_filters: Vec<String>,
    /// Gzip the log file (`.gz` suffix).
    pub compress: bool,
    /// Records buffered before a batch is queued for the writer.
    pub buffer_size: usize,
    /// Bounded wait for the sink to drain on close.
    pub drain_timeout_seconds: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_all: false,
            field_filters: Vec::new(),
            compress: false,
            buffer_size: 100,
            drain_timeout_seconds: 5,
        }
    }
}

// ──────────────────── logger ────────────────────

#[derive(Debug)]
struct TraceState {
    trace_id: String,
    step_number: u64,
    previous_state: MitigationState,
}

/// Logger for intervention decisions. Owns its sink; one logger per session.
pub struct InterventionLogger {
    sink: Box<dyn LogSink>,
    session_id: String,
    log_all: bool,
    field_filters: BTreeSet<String>,
    trace: Mutex<TraceState>,
}

impl InterventionLogger {
    /// Create a logger with a fresh session id.
    #[must_use]
    pub fn new(sink: Box<dyn LogSink>, config: &LoggerConfig) -> Self {
        Self::with_session_id(sink, config, &uuid::Uuid::new_v4().to_string())
    }

    /// Create a logger bound to an explicit session id.
    #[must_use]
    pub fn with_session_id(
        sink: Box<dyn LogSink>,
        config: &LoggerConfig,
        session_id: &str,
    ) -> Self {
        Self {
            sink,
            session_id: session_id.to_string(),
            log_all: config.log_all,
            field_filters: config.field_filters.iter().cloned().collect(),
            trace: Mutex::new(TraceState {
                trace_id: uuid::Uuid::new_v4().to_string(),
                step_number: 0,
                previous_state: MitigationState::Nominal,
            }),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn current_trace_id(&self) -> String {
        self.trace.lock().trace_id.clone()
    }

    /// Log one decision point. Returns whether a record was emitted: when
    /// `log_all` is off, a step is logged only if the current *or previous*
    /// state is non-nominal, which preserves the edges of transitions.
    #[allow(clippy::too_many_arguments)]
    pub fn log(
        &self,
        observation: &Observation,
        state: MitigationState,
        uncertainty: &UncertaintyEstimate,
        ood_score: f64,
        ood_component_scores: Option<&BTreeMap<String, f64>>,
        action: &[f64],
        monitor_outputs: &[MonitorOutput],
    ) -> bool {
        let mut trace = self.trace.lock();

        let should_log = self.log_all
            || state != MitigationState::Nominal
            || trace.previous_state != MitigationState::Nominal;

        if !should_log {
            trace.step_number += 1;
            trace.previous_state = state;
            return false;
        }

        let filtered: Observation = observation
            .iter()
            .filter(|(key, _)| !self.field_filters.contains(*key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let record = InterventionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: unix_now(),
            trace_id: trace.trace_id.clone(),
            step_number: trace.step_number,
            session_id: self.session_id.clone(),
            observation: filtered,
            state,
            previous_state: trace.previous_state,
            uncertainty: uncertainty.clone(),
            ood_score,
            ood_component_scores: ood_component_scores.cloned(),
            action: action.to_vec(),
            monitor_outputs: monitor_outputs.to_vec(),
            version: LOG_FORMAT_VERSION.to_string(),
        };

        trace.previous_state = state;
        trace.step_number += 1;
        drop(trace);

        self.sink.write(record);
        true
    }

    /// Start a new trace (e.g. a new episode). Resets the step counter and
    /// previous state; returns the new trace id.
    pub fn new_trace(&self) -> String {
        let mut trace = self.trace.lock();
        trace.trace_id = uuid::Uuid::new_v4().to_string();
        trace.step_number = 0;
        trace.previous_state = MitigationState::Nominal;
        trace.trace_id.clone()
    }

    pub fn flush(&self) {
        self.sink.flush();
    }

    /// Flush and close the sink, draining the write queue with a bounded
    /// wait.
    pub fn close(&self) -> Result<()> {
        self.sink.close()
    }
}

// ──────────────────── tests ────────────────────
