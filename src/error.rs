//! Error taxonomy shared by every pipeline boundary.
//!
//! Only `Configuration` is allowed to escape to the caller at runtime; the
//! other kinds are caught at the per-module or per-cycle boundary and turned
//! into degraded, explicitly marked results.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Upstream data missing or empty. Short-circuits to a neutral default.
    DataUnavailable(String),
    /// An intelligence module raised or timed out.
    ModuleFailure { module: String, message: String },
    /// Malformed thresholds, weights or registry entries. Fails at startup.
    Configuration(String),
    /// Snapshot or store I/O failed.
    Persistence(String),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::DataUnavailable(_) => "data_unavailable",
            PipelineError::ModuleFailure { .. } => "module_failure",
            PipelineError::Configuration(_) => "configuration",
            PipelineError::Persistence(_) => "persistence",
        }
    }

    pub fn module(module: &str, message: impl Into<String>) -> Self {
        PipelineError::ModuleFailure {
            module: module.to_string(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Configuration(message.into())
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::DataUnavailable(msg) => write!(f, "data unavailable: {}", msg),
            PipelineError::ModuleFailure { module, message } => {
                write!(f, "module {} failed: {}", module, message)
            }
            PipelineError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            PipelineError::Persistence(msg) => write!(f, "persistence failure: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
