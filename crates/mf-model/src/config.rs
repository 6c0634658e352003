//! Declarative model-graph configuration.
//!
//! A [`GraphSpec`] lists named models, children before parents, and names the
//! root. [`GraphSpec::build`] turns it into a [`ModelGraph`].
//!
//! ```yaml
//! root: corrected
//! models:
//!   - name: hifi
//!     type: simulation
//!     variables: 2
//!     interface: { driver: rosenbrock }
//!     derivatives: { gradients: analytic }
//!   - name: lofi
//!     type: simulation
//!     variables: 2
//!     interface: { driver: rosenbrock, levels: [0.1] }
//!     derivatives: { gradients: analytic }
//!   - name: corrected
//!     type: hierarchical
//!     members: [lofi, hifi]
//!     mode: auto_corrected
//!     correction: { kind: additive, order: 1 }
//! ```

use crate::correction::CorrectionSettings;
use crate::derivatives::DerivativeSettings;
use crate::direct::{Completion, DirectInterface, Driver};
use crate::dispatch::EvaluationDispatcher;
use crate::ensemble::{EnsembleKind, ResponseMode};
use crate::graph::{ModelGraph, ModelId};
use crate::nested::SampleMean;
use crate::recast::RecastMap;
use mf_core::{ActiveKey, Error, ModelKey, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Whole graph: models in declaration order plus the root model's name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    /// Models; children must precede their parents.
    pub models: Vec<ModelSpec>,
    /// Name of the model callers evaluate.
    pub root: String,
}

/// One named model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Unique model name.
    pub name: String,
    /// Kind-specific settings.
    #[serde(flatten)]
    pub kind: ModelKindSpec,
    /// Derivative sources; kind default when absent.
    #[serde(default)]
    pub derivatives: Option<DerivativeSettings>,
}

/// Kind-specific model settings, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelKindSpec {
    /// Built-in analytic interface.
    Simulation {
        /// Interface settings.
        interface: InterfaceSpec,
        /// Number of variables.
        variables: usize,
        /// Share the process-wide evaluation cache.
        #[serde(default = "default_true")]
        cache: bool,
    },
    /// Taylor surrogate of `actual`.
    DataFit {
        /// Name of the model the surrogate approximates.
        actual: String,
        /// Expansion order (1 or 2).
        #[serde(default = "default_order")]
        order: usize,
    },
    /// Ordered fidelity hierarchy.
    Hierarchical {
        /// Member names, lowest fidelity first.
        members: Vec<String>,
        /// Active key; (last, first) pair when absent.
        #[serde(default)]
        key: Option<ActiveKey>,
        /// Response mode.
        #[serde(default)]
        mode: ResponseMode,
        /// Discrepancy correction settings.
        #[serde(default)]
        correction: Option<CorrectionSettings>,
    },
    /// Unordered peer ensemble.
    NonHierarchical {
        /// Member names.
        members: Vec<String>,
        /// Active key; first member when absent.
        #[serde(default)]
        key: Option<ActiveKey>,
        /// Response mode.
        #[serde(default)]
        mode: ResponseMode,
    },
    /// Affine recasting of `sub_model`.
    Recast {
        /// Name of the wrapped model.
        sub_model: String,
        /// Variable / response map.
        #[serde(default)]
        map: RecastMap,
    },
    /// Sample mean of `sub_model` around each outer point.
    Nested {
        /// Name of the sampled model.
        sub_model: String,
        /// Offsets added to the outer point, one vector per sample.
        samples: Vec<Vec<f64>>,
        /// Row-major result coefficients (identity when empty).
        #[serde(default)]
        coefficients: Vec<Vec<f64>>,
    },
}

/// Built-in analytic interface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSpec {
    /// Interface name (the model name when absent).
    #[serde(default)]
    pub name: Option<String>,
    /// Test function.
    #[serde(flatten)]
    pub driver: Driver,
    /// Defer completion to `synchronize*`.
    #[serde(default)]
    pub asynchronous: bool,
    /// Completion order of deferred evaluations.
    #[serde(default)]
    pub completion: Completion,
    /// Max completions per non-blocking drain (0 = all).
    #[serde(default)]
    pub nowait_limit: usize,
    /// Per-level perturbations.
    #[serde(default)]
    pub levels: Vec<f64>,
    /// Per-level cost metadata.
    #[serde(default)]
    pub costs: Vec<f64>,
}

fn default_true() -> bool {
    true
}

fn default_order() -> usize {
    1
}

impl InterfaceSpec {
    fn dispatcher(&self, model: &str, cache: bool) -> EvaluationDispatcher {
        let name = self.name.clone().unwrap_or_else(|| model.to_string());
        let mut interface = DirectInterface::new(name, self.driver.clone())
            .with_levels(self.levels.clone())
            .with_costs(self.costs.clone());
        if self.asynchronous {
            interface = interface.asynchronous(self.completion, self.nowait_limit);
        }
        let dispatcher = EvaluationDispatcher::new(model, Box::new(interface));
        if cache { dispatcher } else { dispatcher.with_cache(None) }
    }
}

impl GraphSpec {
    /// Instantiate every model; returns the graph and the root id.
    pub fn build(&self) -> Result<(ModelGraph, ModelId)> {
        let mut graph = ModelGraph::new();
        for spec in &self.models {
            let id = spec.add_to(&mut graph)?;
            if let Some(settings) = &spec.derivatives {
                graph.set_derivatives(id, settings.clone())?;
            }
        }
        let root = graph.find(&self.root).ok_or_else(|| {
            Error::Configuration(format!("root model '{}' is not declared", self.root))
        })?;
        log::debug!("built model graph with {} models, root '{}'", graph.len(), self.root);
        Ok((graph, root))
    }
}

fn lookup(graph: &ModelGraph, owner: &str, name: &str) -> Result<ModelId> {
    graph.find(name).ok_or_else(|| {
        Error::Configuration(format!(
            "model '{owner}' refers to '{name}', which is not declared before it"
        ))
    })
}

impl ModelSpec {
    fn add_to(&self, graph: &mut ModelGraph) -> Result<ModelId> {
        let name = self.name.as_str();
        match &self.kind {
            ModelKindSpec::Simulation { interface, variables, cache } => {
                let n_functions = interface.driver.n_functions();
                graph.add_simulation(name, interface.dispatcher(name, *cache), *variables, n_functions)
            }
            ModelKindSpec::DataFit { actual, order } => {
                let actual = lookup(graph, name, actual)?;
                graph.add_data_fit(name, actual, *order)
            }
            ModelKindSpec::Hierarchical { members, key, mode, correction } => {
                let members = members.iter().map(|m| lookup(graph, name, m)).collect::<Result<Vec<_>>>()?;
                let key = key.unwrap_or_else(|| match members.len() {
                    0 | 1 => ActiveKey::Single(ModelKey::form(0)),
                    n => ActiveKey::Pair { truth: ModelKey::form(n - 1), approx: ModelKey::form(0) },
                });
                let id = graph.add_ensemble(name, EnsembleKind::Hierarchical, members, key, *mode)?;
                if let Some(settings) = correction {
                    graph.set_correction(id, *settings)?;
                }
                Ok(id)
            }
            ModelKindSpec::NonHierarchical { members, key, mode } => {
                let members = members.iter().map(|m| lookup(graph, name, m)).collect::<Result<Vec<_>>>()?;
                let key = key.unwrap_or(ActiveKey::Single(ModelKey::form(0)));
                graph.add_ensemble(name, EnsembleKind::NonHierarchical, members, key, *mode)
            }
            ModelKindSpec::Recast { sub_model, map } => {
                let sub = lookup(graph, name, sub_model)?;
                graph.add_recast(name, sub, map.clone())
            }
            ModelKindSpec::Nested { sub_model, samples, coefficients } => {
                let sub = lookup(graph, name, sub_model)?;
                let (n_vars, n_results) = (graph.n_variables(sub), graph.n_functions(sub));
                let coefficients = if coefficients.is_empty() {
                    DMatrix::identity(n_results, n_results)
                } else {
                    coefficient_matrix(name, coefficients)?
                };
                let iterator = SampleMean::new(n_results, samples.clone())?;
                graph.add_nested(name, sub, n_vars, Box::new(iterator), coefficients)
            }
        }
    }
}

fn coefficient_matrix(model: &str, rows: &[Vec<f64>]) -> Result<DMatrix<f64>> {
    let n_cols = rows[0].len();
    if rows.iter().any(|r| r.len() != n_cols) {
        return Err(Error::ShapeMismatch(format!(
            "model '{model}': coefficient rows differ in length"
        )));
    }
    Ok(DMatrix::from_fn(rows.len(), n_cols, |r, c| rows[r][c]))
}
