//! Error types for the SDS controller
//!
//! Provides structured error types for all controller components including
//! the remote executor, catalog, node registry, and the resource engine.

use crate::remote::HostReport;
use thiserror::Error;

/// Unified error type for the controller
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Precondition Errors
    // =========================================================================
    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    // =========================================================================
    // Remote Execution Errors
    // =========================================================================
    #[error("Remote command failed on {host}: {reason}")]
    Remote { host: String, reason: String },

    #[error("{operation} failed on {failed} of {total} hosts")]
    PartialFailure {
        operation: String,
        failed: usize,
        total: usize,
        report: HostReport,
    },

    #[error("Command timed out on {host} after {seconds}s")]
    Timeout { host: String, seconds: u64 },

    // =========================================================================
    // Catalog Errors
    // =========================================================================
    #[error("Catalog failure: {0}")]
    Catalog(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Parse failure: {0}")]
    Parse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a `PartialFailure` from a per-host report, preserving the
    /// full outcome map for the caller.
    pub fn partial(operation: impl Into<String>, report: HostReport) -> Self {
        let total = report.len();
        let failed = report.failed_hosts().len();
        Error::PartialFailure {
            operation: operation.into(),
            failed,
            total,
            report,
        }
    }

    /// Check if retrying the same request could succeed.
    ///
    /// Precondition and parse errors are deterministic; remote and catalog
    /// failures depend on cluster state that may have changed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Precondition(_)
                | Error::NotFound { .. }
                | Error::AlreadyExists { .. }
                | Error::Configuration(_)
                | Error::Parse(_)
                | Error::JsonParse(_)
        )
    }

    /// Check if this error left cluster state untouched on every host.
    pub fn is_clean(&self) -> bool {
        match self {
            Error::Precondition(_)
            | Error::NotFound { .. }
            | Error::AlreadyExists { .. }
            | Error::Configuration(_) => true,
            Error::PartialFailure { report, .. } => report.succeeded_hosts().is_empty(),
            _ => false,
        }
    }
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;
