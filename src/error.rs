//! Error types for the advisory orchestrator

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Configuration Errors
    // =============================

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Capability already registered: {0}")]
    DuplicateCapability(String),

    #[error("Capability not registered: {0}")]
    UnknownCapability(String),

    // =============================
    // Capability Errors
    // =============================

    #[error("Argument mismatch for '{capability}': {reason}")]
    ArgumentMismatch { capability: String, reason: String },

    #[error("Capability '{capability}' failed: {cause}")]
    CapabilityFailure { capability: String, cause: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // =============================
    // Computation Errors
    // =============================

    #[error("Allocation infeasible: {0}")]
    Infeasible(String),

    #[error("Allocation solver did not converge within {iterations} iterations")]
    SolverDivergence { iterations: usize },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Incomplete report: {0}")]
    IncompleteReport(String),

    // =============================
    // Pipeline Errors
    // =============================

    #[error("Stage '{stage}' ({capability}) failed: {source}")]
    StageFailed {
        stage: String,
        capability: String,
        #[source]
        source: Box<OrchestrationError>,
    },

    #[error("Cancelled before start: {0}")]
    Cancelled(String),

    #[error("Execution error: {0}")]
    Execution(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure taxonomy surfaced to callers and mapped onto exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ConfigurationError,
    ArgumentMismatch,
    InvalidInput,
    CapabilityFailure,
    Infeasible,
    SolverDivergence,
    InsufficientData,
    IncompleteReport,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigurationError => "ConfigurationError",
            ErrorKind::ArgumentMismatch => "ArgumentMismatch",
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::CapabilityFailure => "CapabilityFailure",
            ErrorKind::Infeasible => "Infeasible",
            ErrorKind::SolverDivergence => "SolverDivergence",
            ErrorKind::InsufficientData => "InsufficientData",
            ErrorKind::IncompleteReport => "IncompleteReport",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Process exit code used by the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::ConfigurationError => 2,
            ErrorKind::ArgumentMismatch | ErrorKind::InvalidInput => 3,
            ErrorKind::CapabilityFailure => 4,
            ErrorKind::Infeasible | ErrorKind::SolverDivergence => 5,
            ErrorKind::InsufficientData => 6,
            ErrorKind::IncompleteReport => 7,
            ErrorKind::Cancelled | ErrorKind::Internal => 1,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestrationError::Configuration(_)
            | OrchestrationError::DuplicateCapability(_)
            | OrchestrationError::UnknownCapability(_) => ErrorKind::ConfigurationError,
            OrchestrationError::ArgumentMismatch { .. } => ErrorKind::ArgumentMismatch,
            OrchestrationError::InvalidInput(_) => ErrorKind::InvalidInput,
            OrchestrationError::CapabilityFailure { .. } | OrchestrationError::Http(_) => {
                ErrorKind::CapabilityFailure
            }
            OrchestrationError::Infeasible(_) => ErrorKind::Infeasible,
            OrchestrationError::SolverDivergence { .. } => ErrorKind::SolverDivergence,
            OrchestrationError::InsufficientData(_) => ErrorKind::InsufficientData,
            OrchestrationError::IncompleteReport(_) => ErrorKind::IncompleteReport,
            OrchestrationError::StageFailed { source, .. } => source.kind(),
            OrchestrationError::Cancelled(_) => ErrorKind::Cancelled,
            OrchestrationError::Execution(_)
            | OrchestrationError::Serialization(_)
            | OrchestrationError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Name of the pipeline stage that produced this failure, if any
    pub fn stage(&self) -> Option<&str> {
        match self {
            OrchestrationError::StageFailed { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Name of the capability involved in this failure, if any
    pub fn capability(&self) -> Option<&str> {
        match self {
            OrchestrationError::StageFailed { capability, .. }
            | OrchestrationError::ArgumentMismatch { capability, .. }
            | OrchestrationError::CapabilityFailure { capability, .. } => Some(capability),
            OrchestrationError::UnknownCapability(name)
            | OrchestrationError::DuplicateCapability(name) => Some(name),
            _ => None,
        }
    }

    /// Errors that keep their own identity when crossing the capability boundary
    pub(crate) fn is_domain_error(&self) -> bool {
        matches!(
            self,
            OrchestrationError::ArgumentMismatch { .. }
                | OrchestrationError::CapabilityFailure { .. }
                | OrchestrationError::InvalidInput(_)
                | OrchestrationError::Infeasible(_)
                | OrchestrationError::SolverDivergence { .. }
                | OrchestrationError::InsufficientData(_)
        )
    }
}
