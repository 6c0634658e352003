//! Error types for MultiFi

use std::fmt;
use thiserror::Error;

/// MultiFi error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A model/mode combination lacks a required capability (wiring mistake).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Inconsistent function/variable counts between composed models.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error (collaborator failure, lost evaluation id, ...)
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Numerical degeneracies that are resolved in place and never escalated.
///
/// Each variant is reported once through [`NumericDegeneracy::warn`] at the point
/// where a safe default has already been substituted.
#[derive(Debug, Clone, PartialEq)]
pub enum NumericDegeneracy {
    /// Finite-difference step collapsed to zero; derivative set to zero.
    ZeroStep {
        /// Variable index.
        variable: usize,
    },
    /// Lower and upper bound coincide; no feasible step exists.
    ZeroWidthBounds {
        /// Variable index.
        variable: usize,
    },
    /// Quasi-Newton update skipped (tiny step or failed curvature safeguard).
    SkippedUpdate {
        /// Response function index.
        function: usize,
        /// Short reason.
        reason: &'static str,
    },
    /// Multiplicative correction with a near-zero approximate value.
    ZeroApproxValue {
        /// Response function index.
        function: usize,
    },
}

impl NumericDegeneracy {
    /// Log the degeneracy through the `log` facade.
    pub fn warn(&self, context: &str) {
        log::warn!("{context}: {self}");
    }
}

impl fmt::Display for NumericDegeneracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroStep { variable } => {
                write!(f, "zero finite-difference step for variable {variable}; using zero")
            }
            Self::ZeroWidthBounds { variable } => {
                write!(f, "zero-width bounds for variable {variable}; derivative set to zero")
            }
            Self::SkippedUpdate { function, reason } => {
                write!(f, "quasi-Newton update skipped for function {function} ({reason})")
            }
            Self::ZeroApproxValue { function } => {
                write!(f, "near-zero approximation for function {function}; unit ratio used")
            }
        }
    }
}
