//! # mf-core
//!
//! Core types, traits, and error handling for MultiFi.
//!
//! This crate provides:
//! - Common error types (and the in-place numeric degeneracy warnings)
//! - The request/answer vocabulary: [`ActiveSet`], [`Response`], [`Variables`]
//! - Ensemble keys and evaluation records
//! - Collaborator traits ([`Interface`], [`EvaluationObserver`], [`ParallelHooks`])

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod active_set;
pub mod error;
pub mod response;
pub mod traits;
pub mod types;
pub mod variables;

pub use active_set::{
    ActiveSet, REQUEST_ALL, REQUEST_GRADIENT, REQUEST_HESSIAN, REQUEST_VALUE, split_active_set,
};
pub use error::{Error, NumericDegeneracy, Result};
pub use response::Response;
pub use traits::{EvaluationObserver, Interface, ParallelHooks};
pub use types::{ActiveKey, EvalId, EvaluationRecord, ModelKey, ResponseMap};
pub use variables::Variables;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
