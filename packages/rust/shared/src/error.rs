//! Error types for articleforge.
//!
//! Library crates use [`ArticleForgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! The last four variants are the pipeline failure taxonomy: they carry the
//! name of the stage that raised them so a keyword run can be reported as
//! "failed in <stage> with <kind>".

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level error type for all articleforge operations.
#[derive(Debug, thiserror::Error)]
pub enum ArticleForgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside the external call adapter (sitemaps, probes).
    #[error("network error: {0}")]
    Network(String),

    /// Input file or record parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error (bad batch file, unsupported schema version, ...).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Timeout or rate limit from an external collaborator. Retryable.
    #[error("transient external failure in {stage}: {message}")]
    TransientExternal { stage: String, message: String },

    /// A collaborator answered, but not in the requested shape.
    #[error("malformed external response in {stage}: {message}")]
    MalformedExternal { stage: String, message: String },

    /// Remote error, auth failure, or retries exhausted. Aborts the keyword run.
    #[error("permanent external failure in {stage}: {message}")]
    PermanentExternal { stage: String, message: String },

    /// An internal invariant was broken. Always fatal.
    #[error("contract violation in {stage}: {message}")]
    ContractViolation { stage: String, message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ArticleForgeError>;

/// Serializable classification of a failure, carried by failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientExternal,
    MalformedExternal,
    PermanentExternal,
    ContractViolation,
    /// A non-critical sub-call failed; never fatal, only reported.
    PartialDegradation,
    /// Local failure: config, I/O, storage, input parsing.
    Internal,
}

impl ErrorKind {
    /// Whether the retry policy may attempt the operation again.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientExternal | Self::MalformedExternal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientExternal => "transient_external",
            Self::MalformedExternal => "malformed_external",
            Self::PermanentExternal => "permanent_external",
            Self::ContractViolation => "contract_violation",
            Self::PartialDegradation => "partial_degradation",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ArticleForgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a contract violation raised by `stage`.
    pub fn contract(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ContractViolation {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Build a pipeline error of the given kind for `stage`.
    ///
    /// `PartialDegradation` and `Internal` have no pipeline variant and map to
    /// `PermanentExternal` and `Validation` respectively.
    pub fn from_kind(kind: ErrorKind, stage: impl Into<String>, msg: impl Into<String>) -> Self {
        let stage = stage.into();
        let message = msg.into();
        match kind {
            ErrorKind::TransientExternal => Self::TransientExternal { stage, message },
            ErrorKind::MalformedExternal => Self::MalformedExternal { stage, message },
            ErrorKind::PermanentExternal | ErrorKind::PartialDegradation => {
                Self::PermanentExternal { stage, message }
            }
            ErrorKind::ContractViolation => Self::ContractViolation { stage, message },
            ErrorKind::Internal => Self::Validation {
                message: format!("{stage}: {message}"),
            },
        }
    }

    /// Classify this error for failure reports.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientExternal { .. } => ErrorKind::TransientExternal,
            Self::MalformedExternal { .. } => ErrorKind::MalformedExternal,
            Self::PermanentExternal { .. } => ErrorKind::PermanentExternal,
            Self::ContractViolation { .. } => ErrorKind::ContractViolation,
            _ => ErrorKind::Internal,
        }
    }

    /// Stage that raised a pipeline error, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::TransientExternal { stage, .. }
            | Self::MalformedExternal { stage, .. }
            | Self::PermanentExternal { stage, .. }
            | Self::ContractViolation { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Promote a retryable failure to `PermanentExternal` once retries are exhausted.
    pub fn into_permanent(self) -> Self {
        match self {
            Self::TransientExternal { stage, message } | Self::MalformedExternal { stage, message } => {
                Self::PermanentExternal {
                    stage,
                    message: format!("retries exhausted: {message}"),
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ArticleForgeError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = ArticleForgeError::contract("link", "10 sections exceed capacity 9");
        assert!(err.to_string().contains("contract violation in link"));
    }

    #[test]
    fn kind_and_stage_for_pipeline_errors() {
        let err = ArticleForgeError::from_kind(ErrorKind::TransientExternal, "generate", "timeout");
        assert_eq!(err.kind(), ErrorKind::TransientExternal);
        assert_eq!(err.stage(), Some("generate"));
        assert!(err.kind().is_retryable());

        let io = ArticleForgeError::io("/tmp/x", std::io::Error::other("boom"));
        assert_eq!(io.kind(), ErrorKind::Internal);
        assert_eq!(io.stage(), None);
    }

    #[test]
    fn retries_exhausted_promotes_to_permanent() {
        let err = ArticleForgeError::from_kind(ErrorKind::MalformedExternal, "refine", "bad json");
        let promoted = err.into_permanent();
        assert_eq!(promoted.kind(), ErrorKind::PermanentExternal);
        assert!(promoted.to_string().contains("retries exhausted"));

        let contract = ArticleForgeError::contract("merge", "dangling marker").into_permanent();
        assert_eq!(contract.kind(), ErrorKind::ContractViolation);
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PartialDegradation).unwrap();
        assert_eq!(json, r#""partial_degradation""#);
    }
}
