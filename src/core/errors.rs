//! PSN-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, PsnError>;

/// Top-level error type for Policy Sentinel.
///
/// Hot-path components never surface these to callers; they are raised from
/// construction (`InvalidConfig`), calibration (`InsufficientData`), and the
/// offline/IO layers. See the propagation rules on each component.
#[derive(Debug, Error)]
pub enum PsnError {
    #[error("[PSN-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[PSN-1002] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[PSN-2001] insufficient data in {context}: {got} < {needed}")]
    InsufficientData {
        context: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("[PSN-2002] {component} is not calibrated; call fit() first")]
    NotCalibrated { component: &'static str },

    #[error("[PSN-2003] dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("[PSN-2004] numerical failure in {context}: {details}")]
    NumericalFailure {
        context: &'static str,
        details: String,
    },

    #[error("[PSN-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[PSN-3001] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[PSN-3002] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[PSN-3003] timeout in {component} after {seconds}s")]
    Timeout { component: &'static str, seconds: u64 },

    #[error("[PSN-3101] external failure in {component}: {details}")]
    ExternalFailure {
        component: &'static str,
        details: String,
    },
}

impl PsnError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "PSN-1001",
            Self::ConfigParse { .. } => "PSN-1002",
            Self::InsufficientData { .. } => "PSN-2001",
            Self::NotCalibrated { .. } => "PSN-2002",
            Self::DimensionMismatch { .. } => "PSN-2003",
            Self::NumericalFailure { .. } => "PSN-2004",
            Self::Serialization { .. } => "PSN-2101",
            Self::Io { .. } => "PSN-3001",
            Self::ChannelClosed { .. } => "PSN-3002",
            Self::Timeout { .. } => "PSN-3003",
            Self::ExternalFailure { .. } => "PSN-3101",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::Timeout { .. }
                | Self::ExternalFailure { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for external (policy/monitor/channel) failures.
    #[must_use]
    pub fn external(component: &'static str, details: impl Into<String>) -> Self {
        Self::ExternalFailure {
            component,
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for PsnError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for PsnError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_errors() -> Vec<PsnError> {
        vec![
            PsnError::InvalidConfig {
                details: String::new(),
            },
            PsnError::ConfigParse {
                context: "",
                details: String::new(),
            },
            PsnError::InsufficientData {
                context: "",
                needed: 100,
                got: 3,
            },
            PsnError::NotCalibrated {
                component: "split_conformal",
            },
            PsnError::DimensionMismatch {
                context: "",
                expected: 2,
                got: 3,
            },
            PsnError::NumericalFailure {
                context: "",
                details: String::new(),
            },
            PsnError::Serialization {
                context: "",
                details: String::new(),
            },
            PsnError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            PsnError::ChannelClosed { component: "" },
            PsnError::Timeout {
                component: "",
                seconds: 5,
            },
            PsnError::ExternalFailure {
                component: "",
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let codes: Vec<&str> = sample_errors().iter().map(PsnError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn error_codes_have_psn_prefix() {
        for err in &sample_errors() {
            assert!(
                err.code().starts_with("PSN-"),
                "code {} must start with PSN-",
                err.code()
            );
        }
    }

    #[test]
    fn error_display_includes_code() {
        let err = PsnError::InvalidConfig {
            details: "allocations sum to 1.3".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("PSN-1001"), "display should carry code: {msg}");
        assert!(msg.contains("allocations sum to 1.3"));
    }

    #[test]
    fn retryable_classification() {
        assert!(
            PsnError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            }
            .is_retryable()
        );
        assert!(PsnError::ChannelClosed { component: "sink" }.is_retryable());
        assert!(
            PsnError::Timeout {
                component: "sink",
                seconds: 5
            }
            .is_retryable()
        );
        assert!(PsnError::external("policy", "panic").is_retryable());

        assert!(
            !PsnError::InvalidConfig {
                details: String::new()
            }
            .is_retryable()
        );
        assert!(
            !PsnError::NotCalibrated {
                component: "mondrian"
            }
            .is_retryable()
        );
        assert!(
            !PsnError::InsufficientData {
                context: "fit",
                needed: 100,
                got: 10
            }
            .is_retryable()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = PsnError::io(
            "/tmp/interventions.jsonl",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "PSN-3001");
        assert!(err.to_string().contains("/tmp/interventions.jsonl"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: PsnError = json_err.into();
        assert_eq!(err.code(), "PSN-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: PsnError = toml_err.into();
        assert_eq!(err.code(), "PSN-1002");
    }
}
