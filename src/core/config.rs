//! Configuration system: TOML file + `PSN_*` env var overrides + defaults.
//!
//! Component config structs live beside their components; this module
//! aggregates them and owns load-time validation. Configuration errors are
//! raised synchronously at construction, never from the hot path.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::errors::{PsnError, Result};
use crate::eval::deployment::DeploymentConfig;
use crate::eval::statistics::EvalConfig;
use crate::health::alerts::AlertConfig;
use crate::health::stats::HealthConfig;
use crate::logger::intervention::LoggerConfig;
use crate::ood::ensemble::OodConfig;
use crate::runtime::mitigation::MitigationConfig;
use crate::safety::monitors::TtcConfig;
use crate::selection::acquisition::AcquisitionConfig;
use crate::uncertainty::conformal::ConformalConfig;

/// Full Policy Sentinel configuration model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub conformal: ConformalConfig,
    pub ood: OodConfig,
    pub mitigation: MitigationConfig,
    pub ttc: TtcConfig,
    pub health: HealthConfig,
    pub alert: AlertConfig,
    pub eval: EvalConfig,
    pub logger: LoggerConfig,
    pub deployment: DeploymentConfig,
    pub acquisition: AcquisitionConfig,
}

impl Config {
    /// Load from a TOML file, apply env overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| PsnError::io(path, source))?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string (no env overrides), validate.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with env overrides applied and validated.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PSN_*` environment overrides for the commonly tuned knobs.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        override_f64("PSN_COVERAGE", &mut self.conformal.coverage)?;
        override_f64("PSN_OOD_THRESHOLD", &mut self.ood.threshold)?;
        override_f64(
            "PSN_UNCERTAINTY_THRESHOLD",
            &mut self.mitigation.uncertainty_threshold,
        )?;
        override_f64("PSN_FSM_OOD_THRESHOLD", &mut self.mitigation.ood_threshold)?;
        override_f64("PSN_WINDOW_SECONDS", &mut self.health.window_seconds)?;
        override_f64(
            "PSN_SHADOW_FRACTION",
            &mut self.deployment.shadow_fraction,
        )?;
        override_bool("PSN_LOG_ALL", &mut self.logger.log_all)?;
        override_bool("PSN_LOG_COMPRESS", &mut self.logger.compress)?;
        Ok(())
    }

    /// Validate cross-field invariants. Every violation is an
    /// `InvalidConfig` raised here, at construction time.
    pub fn validate(&self) -> Result<()> {
        if !(0.0 < self.conformal.coverage && self.conformal.coverage < 1.0) {
            return Err(invalid(format!(
                "conformal.coverage must be in (0, 1), got {}",
                self.conformal.coverage
            )));
        }
        if self.conformal.gamma <= 0.0 {
            return Err(invalid(format!(
                "conformal.gamma must be positive, got {}",
                self.conformal.gamma
            )));
        }
        if self.conformal.min_calibration_size == 0 {
            return Err(invalid(
                "conformal.min_calibration_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.conformal.score_clip_percentile) {
            return Err(invalid(format!(
                "conformal.score_clip_percentile must be in [0, 100], got {}",
                self.conformal.score_clip_percentile
            )));
        }
        if self.ttc.critical > self.ttc.warning {
            return Err(invalid(format!(
                "ttc.critical ({}) must not exceed ttc.warning ({})",
                self.ttc.critical, self.ttc.warning
            )));
        }
        if self.ttc.debounce_steps == 0 {
            return Err(invalid("ttc.debounce_steps must be at least 1".to_string()));
        }
        if self.health.window_seconds <= 0.0 {
            return Err(invalid(format!(
                "health.window_seconds must be positive, got {}",
                self.health.window_seconds
            )));
        }
        if !(0.0..=1.0).contains(&self.deployment.shadow_fraction) {
            return Err(invalid(format!(
                "deployment.shadow_fraction must be in [0, 1], got {}",
                self.deployment.shadow_fraction
            )));
        }
        if !(0.0 < self.eval.confidence_level && self.eval.confidence_level < 1.0) {
            return Err(invalid(format!(
                "eval.confidence_level must be in (0, 1), got {}",
                self.eval.confidence_level
            )));
        }
        if self.logger.buffer_size == 0 {
            return Err(invalid("logger.buffer_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn invalid(details: String) -> PsnError {
    PsnError::InvalidConfig { details }
}

fn override_f64(var: &str, slot: &mut f64) -> Result<()> {
    if let Ok(raw) = env::var(var) {
        *slot = raw.parse().map_err(|_| {
            invalid(format!("env {var} is not a valid number: {raw:?}"))
        })?;
    }
    Ok(())
}

fn override_bool(var: &str, slot: &mut bool) -> Result<()> {
    if let Ok(raw) = env::var(var) {
        *slot = match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(invalid(format!(
                    "env {var} is not a valid boolean: {raw:?}"
                )));
            }
        };
    }
    Ok(())
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn documented_defaults_hold() {
        let config = Config::default();
        assert!((config.conformal.coverage - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.conformal.min_calibration_size, 100);
        assert!((config.ood.threshold - 2.0).abs() < f64::EPSILON);
        assert!((config.mitigation.uncertainty_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.ttc.debounce_steps, 3);
        assert!((config.health.window_seconds - 60.0).abs() < f64::EPSILON);
        assert_eq!(config.eval.n_bootstrap, 10_000);
        assert_eq!(config.logger.buffer_size, 100);
        assert!((config.deployment.shadow_fraction - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn toml_roundtrip() {
        let config = Config::default();
        let raw = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::from_toml_str(&raw).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let raw = r#"
            [conformal]
            coverage = 0.95

            [mitigation]
            ood_threshold = 3.5
        "#;
        let config = Config::from_toml_str(raw).unwrap();
        assert!((config.conformal.coverage - 0.95).abs() < f64::EPSILON);
        assert!((config.mitigation.ood_threshold - 3.5).abs() < f64::EPSILON);
        // Untouched sections keep defaults.
        assert_eq!(config.conformal.min_calibration_size, 100);
        assert_eq!(config.logger.buffer_size, 100);
    }

    #[test]
    fn invalid_coverage_is_rejected() {
        let raw = "[conformal]\ncoverage = 1.5\n";
        let err = Config::from_toml_str(raw).unwrap_err();
        assert_eq!(err.code(), "PSN-1001");
    }

    #[test]
    fn inverted_ttc_thresholds_are_rejected() {
        let raw = "[ttc]\ncritical = 5.0\nwarning = 3.0\n";
        let err = Config::from_toml_str(raw).unwrap_err();
        assert_eq!(err.code(), "PSN-1001");
    }

    #[test]
    fn invalid_shadow_fraction_is_rejected() {
        let raw = "[deployment]\nshadow_fraction = 1.5\n";
        let err = Config::from_toml_str(raw).unwrap_err();
        assert_eq!(err.code(), "PSN-1001");
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = Config::from_toml_str("= nonsense").unwrap_err();
        assert_eq!(err.code(), "PSN-1002");
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.toml");
        std::fs::write(&path, "[ood]\nthreshold = 4.0\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert!((config.ood.threshold - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = Config::load("/nonexistent/psn/sentinel.toml").unwrap_err();
        assert_eq!(err.code(), "PSN-3001");
    }
}
