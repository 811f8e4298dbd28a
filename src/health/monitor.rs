//! Health monitor facade: per-operation rolling statistics plus default
//! alert rules, exposed as one operator-facing snapshot.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::health::alerts::{
    Alert, AlertConfig, AlertEngine, AlertRule, AlertSeverity, StderrChannel,
};
use crate::health::stats::{HealthConfig, RollingStatistics};

/// Point-in-time health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub latency_p50: f64,
    pub latency_p95: f64,
    pub latency_p99: f64,
    /// Operations per second over the rolling window.
    pub throughput: f64,
    /// Errors over total, process lifetime.
    pub error_rate: f64,
    pub total_operations: u64,
    pub total_errors: u64,
    pub alerts: Vec<Alert>,
    pub uptime_seconds: f64,
}

/// Tracks latency, throughput, and errors per operation and triggers the
/// configured alert rules on every health query.
pub struct HealthMonitor {
    config: HealthConfig,
    per_operation: Mutex<BTreeMap<String, Arc<RollingStatistics>>>,
    aggregate: RollingStatistics,
    alert_engine: AlertEngine,
}

impl HealthMonitor {
    /// Build a monitor with the default latency/error-rate rules wired to
    /// the stderr channel.
    #[must_use]
    pub fn new(config: HealthConfig, alerts: &AlertConfig) -> Self {
        let latency_threshold = config.latency_threshold_p99_ms;
        let error_threshold = config.error_rate_threshold;
        let stderr = Arc::new(StderrChannel);
        let rules = vec![
            AlertRule::new(
                "high_latency_p99",
                "latency_p99",
                latency_threshold,
                Box::new(move |v| v > latency_threshold),
            )
            .severity(AlertSeverity::Warning)
            .cooldown_seconds(alerts.cooldown_seconds)
            .min_samples(alerts.min_samples)
            .channel(stderr.clone()),
            AlertRule::new(
                "high_error_rate",
                "error_rate",
                error_threshold,
                Box::new(move |v| v > error_threshold),
            )
            .severity(AlertSeverity::Critical)
            .cooldown_seconds(alerts.cooldown_seconds)
            .min_samples(alerts.min_samples)
            .channel(stderr),
        ];

        Self {
            aggregate: RollingStatistics::from_config(&config),
            per_operation: Mutex::new(BTreeMap::new()),
            alert_engine: AlertEngine::new(rules, alerts),
            config,
        }
    }

    /// Build a monitor with custom rules instead of the defaults.
    #[must_use]
    pub fn with_rules(config: HealthConfig, alerts: &AlertConfig, rules: Vec<AlertRule>) -> Self {
        Self {
            aggregate: RollingStatistics::from_config(&config),
            per_operation: Mutex::new(BTreeMap::new()),
            alert_engine: AlertEngine::new(rules, alerts),
            config,
        }
    }

    /// Record one operation's latency and outcome.
    pub fn record(&self, operation: &str, latency_ms: f64, success: bool) {
        let stats = {
            let mut map = self.per_operation.lock();
            Arc::clone(
                map.entry(operation.to_string())
                    .or_insert_with(|| Arc::new(RollingStatistics::from_config(&self.config))),
            )
        };
        stats.record(latency_ms, success);
        self.aggregate.record(latency_ms, success);
    }

    /// Add a custom alert rule.
    pub fn add_alert_rule(&self, rule: AlertRule) {
        self.alert_engine.add_rule(rule);
    }

    /// Health snapshot for one operation, or the aggregate when `None`.
    /// Evaluates alert rules against the snapshot.
    #[must_use]
    pub fn get_health(&self, operation: Option<&str>) -> HealthStatus {
        let stats = operation
            .and_then(|op| self.per_operation.lock().get(op).cloned());
        let stats: &RollingStatistics = stats.as_deref().unwrap_or(&self.aggregate);

        let (total, errors) = stats.counts();
        let status = HealthStatus {
            latency_p50: stats.percentile(50.0),
            latency_p95: stats.percentile(95.0),
            latency_p99: stats.percentile(99.0),
            throughput: stats.throughput(),
            error_rate: stats.error_rate(),
            total_operations: total,
            total_errors: errors,
            alerts: Vec::new(),
            uptime_seconds: stats.uptime_seconds(),
        };

        let mut metrics = BTreeMap::new();
        metrics.insert("latency_p50".to_string(), status.latency_p50);
        metrics.insert("latency_p95".to_string(), status.latency_p95);
        metrics.insert("latency_p99".to_string(), status.latency_p99);
        metrics.insert("throughput".to_string(), status.throughput);
        metrics.insert("error_rate".to_string(), status.error_rate);
        let mut counts = BTreeMap::new();
        counts.insert("latency_p99".to_string(), total);
        counts.insert("error_rate".to_string(), total);

        let alerts = self.alert_engine.evaluate(&metrics, &counts);
        HealthStatus { alerts, ..status }
    }

    /// All aggregate metrics as a flat map for external monitoring.
    #[must_use]
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let status = self.get_health(None);
        let mut out = BTreeMap::new();
        out.insert("latency_p50_ms".to_string(), status.latency_p50);
        out.insert("latency_p95_ms".to_string(), status.latency_p95);
        out.insert("latency_p99_ms".to_string(), status.latency_p99);
        out.insert("throughput_ops".to_string(), status.throughput);
        out.insert("error_rate".to_string(), status.error_rate);
        out.insert(
            "total_operations".to_string(),
            status.total_operations as f64,
        );
        out.insert("total_errors".to_string(), status.total_errors as f64);
        out.insert("uptime_seconds".to_string(), status.uptime_seconds);
        out
    }

    /// Recent alert history.
    #[must_use]
    pub fn alert_history(&self, limit: usize) -> Vec<Alert> {
        self.alert_engine.history(limit)
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default(), &AlertConfig::default())
    }
}

// ──────────────────── tests ────────────────────
