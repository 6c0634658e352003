//! Collaborator traits.
//!
//! The engine never runs simulation codes itself. It talks to an
//! [`Interface`] (the black-box mapping), optionally notifies an
//! [`EvaluationObserver`] (an evaluation store), and may call opaque
//! [`ParallelHooks`] before routing work to a sub-model.

use crate::types::{EvalId, EvaluationRecord, ResponseMap};
use crate::{ActiveSet, Error, Response, Result, Variables};

/// Black-box "variables → response" mapping.
///
/// Synchronous evaluation is mandatory. Asynchronous evaluation is optional:
/// the default `*_nowait` / `synchronize*` methods report a configuration error
/// naming the interface, so a model wired for asynchronous dispatch against a
/// synchronous-only interface fails loudly instead of silently blocking.
pub trait Interface {
    /// Interface name (used in diagnostics and cache keys).
    fn name(&self) -> &str;

    /// Evaluate and block until the response is available.
    fn evaluate(&mut self, vars: &Variables, set: &ActiveSet) -> Result<Response>;

    /// Whether `evaluate_nowait` and the `synchronize` calls are implemented.
    fn supports_async(&self) -> bool {
        false
    }

    /// Queue an evaluation; returns the interface-local (raw) id.
    fn evaluate_nowait(&mut self, _vars: &Variables, _set: &ActiveSet) -> Result<EvalId> {
        Err(Error::Configuration(format!(
            "interface '{}' does not support asynchronous evaluation",
            self.name()
        )))
    }

    /// Block until every queued evaluation has completed; returns raw id → response.
    fn synchronize(&mut self) -> Result<ResponseMap> {
        Err(Error::Configuration(format!(
            "interface '{}' does not support synchronize",
            self.name()
        )))
    }

    /// Return the evaluations that are complete right now (possibly none).
    fn synchronize_nowait(&mut self) -> Result<ResponseMap> {
        Err(Error::Configuration(format!(
            "interface '{}' does not support synchronize_nowait",
            self.name()
        )))
    }

    /// Last raw id handed out (monotone).
    fn current_id(&self) -> EvalId;

    /// Select the resolution level used by subsequent evaluations.
    fn set_resolution(&mut self, _level: usize) -> Result<()> {
        Ok(())
    }

    /// Number of metadata scalars attached to each response.
    fn n_metadata(&self) -> usize {
        0
    }
}

/// Side-effecting observer notified on every dispatch and collection.
///
/// Failures are logged by the caller and never change the evaluation result.
pub trait EvaluationObserver {
    /// Called once when an evaluation is dispatched (or answered from the cache).
    fn on_dispatch(&mut self, model: &str, record: &EvaluationRecord) -> Result<()>;

    /// Called once when the response for `id` is handed back to the caller layer.
    fn on_complete(&mut self, model: &str, id: EvalId, response: &Response) -> Result<()>;
}

/// Opaque parallel-topology activation hook ("enter mode X for sub-model Y").
pub trait ParallelHooks {
    /// Activate `mode` before work is routed to `sub_model`.
    fn activate(&mut self, mode: &str, sub_model: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SyncOnly;

    impl Interface for SyncOnly {
        fn name(&self) -> &str {
            "sync_only"
        }

        fn evaluate(&mut self, _vars: &Variables, set: &ActiveSet) -> Result<Response> {
            Ok(Response::new(set.clone(), 0))
        }

        fn current_id(&self) -> EvalId {
            0
        }
    }

    #[test]
    fn test_default_nowait_is_configuration_error() {
        let mut i = SyncOnly;
        let vars = Variables::new(vec![1.0]);
        let set = ActiveSet::new(1, 1);
        let err = i.evaluate_nowait(&vars, &set).unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains("sync_only")));
        assert!(!i.supports_async());
        assert!(i.evaluate(&vars, &set).is_ok());
    }
}
