//! # mf-model
//!
//! Evaluation dispatch, derivative estimation and fidelity composition for
//! MultiFi.
//!
//! This crate provides:
//! - Synchronous / asynchronous dispatch with caching and duplicate suppression
//! - Finite-difference gradients and Hessians, plus secant (quasi-Newton) Hessians
//! - Ensembles of models at different fidelities (discrepancy, correction, aggregation)
//! - Data-fit, recast and nested wrapper models
//!
//! ## Architecture
//!
//! Every model lives in a [`ModelGraph`] arena and is addressed by a
//! [`ModelId`]. Collaborator simulations plug in through
//! [`mf_core::Interface`]; nothing here depends on a concrete simulation code.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Process-wide evaluation cache.
pub mod cache;
/// Serde model-graph configuration.
pub mod config;
/// Discrepancy corrections between truth and approximation.
pub mod correction;
/// Derivative routing and finite-difference estimation.
pub mod derivatives;
/// In-process analytic test interfaces.
pub mod direct;
/// Evaluation dispatcher in front of one interface.
pub mod dispatch;
/// Ensemble state and recombination.
pub mod ensemble;
/// Model arena and recursive evaluation.
pub mod graph;
/// Nested models and their inner iterators.
pub mod nested;
/// Secant Hessian updates.
pub mod quasi_newton;
/// Affine recast models.
pub mod recast;
/// Taylor-series surrogate.
pub mod surrogate;

pub use cache::EvaluationCache;
pub use config::GraphSpec;
pub use correction::{CorrectionKind, CorrectionSettings, DiscrepancyCorrection};
pub use derivatives::{DerivativeSettings, GradientSource, HessianSource, IntervalType};
pub use direct::{Completion, DirectInterface, Driver};
pub use dispatch::{EvaluationCounters, EvaluationDispatcher};
pub use ensemble::{EnsembleKind, EnsembleModel, ResponseMode};
pub use graph::{ModelGraph, ModelId, ModelKind};
pub use nested::{SampleMean, SubIterator, SubModel};
pub use quasi_newton::{QuasiNewtonKind, QuasiNewtonUpdater, UpdateOutcome};
pub use recast::{RecastMap, RecastModel};
pub use surrogate::TaylorSurrogate;
