//! Common data types for MultiFi

use crate::{ActiveSet, Response, Variables};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Evaluation id. External ids are monotone per model instance and never reused.
pub type EvalId = u64;

/// Completed evaluations keyed by id (ascending).
pub type ResponseMap = BTreeMap<EvalId, Response>;

/// Selects one fidelity/resolution combination inside an ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    /// Model-form index (position in the ensemble's member list).
    pub form: usize,
    /// Resolution level of that model form, if it has several.
    #[serde(default)]
    pub level: Option<usize>,
}

impl ModelKey {
    /// Key for a model form without a resolution level.
    pub fn form(form: usize) -> Self {
        Self { form, level: None }
    }

    /// Key for a model form at a resolution level.
    pub fn with_level(form: usize, level: usize) -> Self {
        Self { form, level: Some(level) }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            Some(level) => write!(f, "form {} / level {level}", self.form),
            None => write!(f, "form {}", self.form),
        }
    }
}

/// Active key of an ensemble: one model, or a (truth, approximation) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveKey {
    /// A single fidelity.
    Single(ModelKey),
    /// Truth and approximation used together (discrepancy, correction, aggregation).
    Pair {
        /// High-fidelity ("truth") key.
        truth: ModelKey,
        /// Low-fidelity ("approximation") key.
        approx: ModelKey,
    },
}

impl ActiveKey {
    /// Truth component (the single key when not a pair).
    pub fn truth(&self) -> ModelKey {
        match *self {
            Self::Single(k) => k,
            Self::Pair { truth, .. } => truth,
        }
    }

    /// Approximation component (the single key when not a pair).
    pub fn approx(&self) -> ModelKey {
        match *self {
            Self::Single(k) => k,
            Self::Pair { approx, .. } => approx,
        }
    }

    /// `true` for a (truth, approximation) pair.
    pub fn is_pair(&self) -> bool {
        matches!(self, Self::Pair { .. })
    }
}

/// Bookkeeping for one dispatched evaluation, consumed once at collection.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRecord {
    /// Id visible to the caller of the dispatching model.
    pub external_id: EvalId,
    /// Id assigned by the collaborator (0 when answered from the cache).
    pub raw_id: EvalId,
    /// Variables at dispatch time.
    pub variables: Variables,
    /// Requested quantities.
    pub set: ActiveSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_key_components() {
        let k = ActiveKey::Pair { truth: ModelKey::form(1), approx: ModelKey::with_level(0, 2) };
        assert_eq!(k.truth(), ModelKey::form(1));
        assert_eq!(k.approx().level, Some(2));
        assert!(k.is_pair());
        let s = ActiveKey::Single(ModelKey::form(0));
        assert_eq!(s.truth(), s.approx());
    }

    #[test]
    fn test_model_key_serde() {
        let k: ModelKey = serde_json::from_str(r#"{"form": 2}"#).unwrap();
        assert_eq!(k, ModelKey::form(2));
        assert_eq!(k.to_string(), "form 2");
    }
}
