//! Alert engine: rule evaluation with min-sample and cooldown gating, plus
//! stderr / file / webhook notification channels.
//!
//! Channels are dispatched after the engine lock is released and each send
//! runs under a try-boundary: a failing channel is reported to stderr and
//! never stops the rest.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::contracts::unix_now;

// ──────────────────── configuration ────────────────────

/// Default alert gating knobs (config keys `alert.cooldown_seconds`,
/// `alert.min_samples`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertConfig {
    pub cooldown_seconds: f64,
    pub min_samples: u64,
    /// Bounded alert history length.
    pub history_limit: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: 300.0,
            min_samples: 10,
            history_limit: 1000,
        }
    }
}

// ──────────────────── alert model ────────────────────

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A triggered alert. The serialized form is the webhook body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub rule_name: String,
    pub metric: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: f64,
}

/// Predicate deciding whether a metric value should fire.
pub type AlertPredicate = Box<dyn Fn(f64) -> bool + Send + Sync>;

/// A rule for triggering alerts on a named metric.
pub struct AlertRule {
    pub name: String,
    pub metric: String,
    predicate: AlertPredicate,
    /// Display threshold carried into the alert body.
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub cooldown_seconds: f64,
    pub min_samples: u64,
    channels: Vec<Arc<dyn AlertChannel>>,
}

impl AlertRule {
    #[must_use]
    pub fn new(name: &str, metric: &str, threshold: f64, predicate: AlertPredicate) -> Self {
        let defaults = AlertConfig::default();
        Self {
            name: name.to_string(),
            metric: metric.to_string(),
            predicate,
            threshold,
            severity: AlertSeverity::Warning,
            cooldown_seconds: defaults.cooldown_seconds,
            min_samples: defaults.min_samples,
            channels: Vec::new(),
        }
    }

    #[must_use]
    pub fn severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn cooldown_seconds(mut self, seconds: f64) -> Self {
        self.cooldown_seconds = seconds;
        self
    }

    #[must_use]
    pub fn min_samples(mut self, min_samples: u64) -> Self {
        self.min_samples = min_samples;
        self
    }

    #[must_use]
    pub fn channel(mut self, channel: Arc<dyn AlertChannel>) -> Self {
        self.channels.push(channel);
        self
    }
}

// ──────────────────── notification channels ────────────────────

/// A notification channel. `send` returns whether delivery was handed off
/// successfully; failures are the caller's to report, never to propagate.
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;
    fn send(&self, alert: &Alert) -> bool;
}

/// Structured stderr channel (journal-friendly).
pub struct StderrChannel;

impl AlertChannel for StderrChannel {
    fn name(&self) -> &'static str {
        "stderr"
    }

    fn send(&self, alert: &Alert) -> bool {
        let level = match alert.severity {
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRIT",
        };
        eprintln!(
            "[PSN-ALERT] [{level}] {rule}: {message}",
            rule = alert.rule_name,
            message = alert.message
        );
        true
    }
}

/// Append-only JSONL file channel.
pub struct FileChannel {
    path: PathBuf,
}

impl FileChannel {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AlertChannel for FileChannel {
    fn name(&self) -> &'static str {
        "file"
    }

    fn send(&self, alert: &Alert) -> bool {
        let Ok(json) = serde_json::to_string(alert) else {
            return false;
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(mut file) => writeln!(file, "{json}").is_ok(),
            Err(_) => false,
        }
    }
}

/// HTTP webhook channel: POSTs the alert as JSON with a bounded timeout.
///
/// Delivery is fire-and-forget via a spawned `curl` child (reaped in a
/// detached thread), so the hot path never blocks on the network.
pub struct WebhookChannel {
    url: String,
    timeout_seconds: u64,
}

impl WebhookChannel {
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            timeout_seconds: 5,
        }
    }

    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds.max(1);
        self
    }
}

impl AlertChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn send(&self, alert: &Alert) -> bool {
        if self.url.is_empty() {
            return false;
        }
        let Ok(body) = serde_json::to_string(alert) else {
            return false;
        };
        // "--" prevents the URL from being read as a curl option.
        match Command::new("curl")
            .arg("--silent")
            .arg("--max-time")
            .arg(self.timeout_seconds.to_string())
            .arg("--header")
            .arg("Content-Type: application/json")
            .arg("--data-raw")
            .arg(&body)
            .arg("--")
            .arg(&self.url)
            .spawn()
        {
            Ok(child) => {
                std::thread::spawn(move || {
                    let mut child = child;
                    let _ = child.wait();
                });
                true
            }
            Err(_) => false,
        }
    }
}

// ──────────────────── alert engine ────────────────────

#[derive(Default)]
struct EngineState {
    rules: Vec<AlertRule>,
    /// rule name -> last fire time (unix seconds).
    last_fired: HashMap<String, f64>,
    history: VecDeque<Alert>,
}

/// Evaluates alert rules against metric snapshots and dispatches
/// notifications with deduplication (cooldown) and rate limiting
/// (min samples).
pub struct AlertEngine {
    history_limit: usize,
    state: Mutex<EngineState>,
}

impl AlertEngine {
    #[must_use]
    pub fn new(rules: Vec<AlertRule>, config: &AlertConfig) -> Self {
        Self {
            history_limit: config.history_limit.max(1),
            state: Mutex::new(EngineState {
                rules,
                ..EngineState::default()
            }),
        }
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.state.lock().rules.push(rule);
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.state.lock().rules.len()
    }

    /// Evaluate all rules at the current wall-clock time.
    pub fn evaluate(
        &self,
        metrics: &BTreeMap<String, f64>,
        sample_counts: &BTreeMap<String, u64>,
    ) -> Vec<Alert> {
        self.evaluate_at(metrics, sample_counts, unix_now())
    }

    /// Evaluate all rules at an explicit time (deterministic tests).
    ///
    /// A rule fires when its predicate holds, its metric has at least
    /// `min_samples` observations, and `now - last_fired >= cooldown`.
    pub fn evaluate_at(
        &self,
        metrics: &BTreeMap<String, f64>,
        sample_counts: &BTreeMap<String, u64>,
        now: f64,
    ) -> Vec<Alert> {
        // Phase 1 (locked): decide which rules fire, update cooldown state
        // and history, and clone out the channel handles.
        let mut dispatch: Vec<(Alert, Vec<Arc<dyn AlertChannel>>)> = Vec::new();
        {
            let mut state = self.state.lock();
            let mut fired: Vec<(Alert, Vec<Arc<dyn AlertChannel>>)> = Vec::new();
            for rule in &state.rules {
                let Some(&value) = metrics.get(&rule.metric) else {
                    continue;
                };
                if sample_counts.get(&rule.metric).copied().unwrap_or(0) < rule.min_samples {
                    continue;
                }
                if !(rule.predicate)(value) {
                    continue;
                }
                if let Some(&last) = state.last_fired.get(&rule.name)
                    && now - last < rule.cooldown_seconds
                {
                    continue;
                }

                let alert = Alert {
                    rule_name: rule.name.clone(),
                    metric: rule.metric.clone(),
                    severity: rule.severity,
                    message: format!(
                        "{metric} = {value:.4} breaches threshold {threshold:.4}",
                        metric = rule.metric,
                        threshold = rule.threshold
                    ),
                    value,
                    threshold: rule.threshold,
                    timestamp: now,
                };
                fired.push((alert, rule.channels.clone()));
            }
            for (alert, channels) in fired {
                state.last_fired.insert(alert.rule_name.clone(), now);
                state.history.push_back(alert.clone());
                while state.history.len() > self.history_limit {
                    state.history.pop_front();
                }
                dispatch.push((alert, channels));
            }
        }

        // Phase 2 (unlocked): invoke user-supplied channels.
        for (alert, channels) in &dispatch {
            for channel in channels {
                let delivered =
                    catch_unwind(AssertUnwindSafe(|| channel.send(alert))).unwrap_or(false);
                if !delivered {
                    eprintln!(
                        "[PSN-ALERT] channel {channel} failed for rule {rule}",
                        channel = channel.name(),
                        rule = alert.rule_name
                    );
                }
            }
        }

        dispatch.into_iter().map(|(alert, _)| alert).collect()
    }

    /// Most recent alerts, newest last.
    #[must_use]
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        let state = self.state.lock();
        state
            .history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new(Vec::new(), &AlertConfig::default())
    }
}

// ──────────────────── tests ────────────────────
