//! Model graph: an arena of models and the interpreter that evaluates them.
//!
//! Every model lives in one [`ModelGraph`] and is addressed by a [`ModelId`].
//! Composite models refer to their children by id; children must be added
//! before their parents, so the graph is acyclic by construction. Evaluation
//! walks the graph recursively:
//!
//! ```text
//! evaluate(id) ─ derivative layer (classify, stencil, quasi-Newton)
//!              └ derived evaluation per kind
//!                  simulation       → dispatcher → interface
//!                  data fit         → Taylor expansion (built from the actual model)
//!                  ensemble         → member evaluate(...) + recombination
//!                  recast / nested  → sub-model evaluate(...) + mapping
//! ```

use crate::correction::CorrectionSettings;
use crate::derivatives::{
    DerivativeEstimator, DerivativeSettings, FdBatch, GradientSource, HessianSource, Source,
};
use crate::dispatch::{EvaluationCounters, EvaluationDispatcher};
use crate::ensemble::{CompositePlan, EnsembleKind, EnsembleModel, ResponseMode};
use crate::nested::{NestedModel, SubIterator, SubModel};
use crate::recast::{RecastMap, RecastModel};
use crate::surrogate::TaylorSurrogate;
use mf_core::{
    ActiveKey, ActiveSet, Error, EvalId, ParallelHooks, REQUEST_GRADIENT, REQUEST_HESSIAN,
    REQUEST_VALUE, Response, ResponseMap, Result, Variables,
};
use nalgebra::DMatrix;
use std::fmt;

/// Index of a model in its [`ModelGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(usize);

impl ModelId {
    /// Arena index.
    pub fn index(self) -> usize {
        self.0
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A model backed directly by a collaborator interface.
#[derive(Debug)]
pub struct SimulationModel {
    dispatcher: EvaluationDispatcher,
    n_vars: usize,
    n_functions: usize,
}

impl SimulationModel {
    /// Simulation over `dispatcher` with fixed sizes.
    pub fn new(dispatcher: EvaluationDispatcher, n_vars: usize, n_functions: usize) -> Self {
        Self { dispatcher, n_vars, n_functions }
    }

    /// Dispatcher front end.
    pub fn dispatcher(&self) -> &EvaluationDispatcher {
        &self.dispatcher
    }
}

/// The closed set of model kinds.
#[derive(Debug)]
pub enum ModelKind {
    /// Collaborator interface behind a dispatcher.
    Simulation(SimulationModel),
    /// Local Taylor surrogate of `actual`.
    DataFit {
        /// Model the surrogate is built from.
        actual: ModelId,
        /// Expansion state.
        surrogate: TaylorSurrogate,
    },
    /// Ordered fidelity hierarchy.
    Hierarchical(EnsembleModel),
    /// Unordered peer ensemble.
    NonHierarchical(EnsembleModel),
    /// Inner iteration over `sub_model` per evaluation.
    Nested {
        /// Model the iterator runs against.
        sub_model: ModelId,
        /// Outer variable count.
        n_vars: usize,
        /// Iterator and result mapping.
        model: NestedModel,
    },
    /// Affine recasting of `sub_model`.
    Recast {
        /// Wrapped model.
        sub_model: ModelId,
        /// Variable / response map.
        model: RecastModel,
    },
}

impl ModelKind {
    /// Short kind label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Simulation(_) => "simulation",
            Self::DataFit { .. } => "data_fit",
            Self::Hierarchical(_) => "hierarchical",
            Self::NonHierarchical(_) => "non_hierarchical",
            Self::Nested { .. } => "nested",
            Self::Recast { .. } => "recast",
        }
    }

    fn ensemble(&self) -> Option<&EnsembleModel> {
        match self {
            Self::Hierarchical(e) | Self::NonHierarchical(e) => Some(e),
            _ => None,
        }
    }

    fn ensemble_mut(&mut self) -> Option<&mut EnsembleModel> {
        match self {
            Self::Hierarchical(e) | Self::NonHierarchical(e) => Some(e),
            _ => None,
        }
    }

    fn children(&self) -> Vec<ModelId> {
        match self {
            Self::Simulation(_) => Vec::new(),
            Self::DataFit { actual, .. } => vec![*actual],
            Self::Hierarchical(e) | Self::NonHierarchical(e) => e.members().to_vec(),
            Self::Nested { sub_model, .. } | Self::Recast { sub_model, .. } => vec![*sub_model],
        }
    }
}

#[derive(Debug)]
struct ModelNode {
    name: String,
    kind: ModelKind,
    estimator: DerivativeEstimator,
}

/// Derived-evaluation route, copied out of a node so the graph can recurse.
#[derive(Clone, Copy)]
enum Route {
    Simulation,
    DataFit(ModelId),
    Ensemble,
    Nested(ModelId),
    Recast(ModelId),
}

/// Arena owning every model.
#[derive(Debug, Default)]
pub struct ModelGraph {
    nodes: Vec<ModelNode>,
}

impl ModelGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of models.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// `true` when no model has been added.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every model id, in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = ModelId> + use<> {
        (0..self.nodes.len()).map(ModelId)
    }

    /// Look a model up by name.
    pub fn find(&self, name: &str) -> Option<ModelId> {
        self.nodes.iter().position(|n| n.name == name).map(ModelId)
    }

    /// Model name (empty for an unknown id).
    pub fn name(&self, id: ModelId) -> &str {
        self.nodes.get(id.0).map_or("", |n| n.name.as_str())
    }

    /// Model kind.
    pub fn kind(&self, id: ModelId) -> Option<&ModelKind> {
        self.nodes.get(id.0).map(|n| &n.kind)
    }

    /// Derivative state of a model.
    pub fn estimator(&self, id: ModelId) -> Option<&DerivativeEstimator> {
        self.nodes.get(id.0).map(|n| &n.estimator)
    }

    /// Evaluation counters of a simulation model.
    pub fn counters(&self, id: ModelId) -> Option<EvaluationCounters> {
        match self.kind(id)? {
            ModelKind::Simulation(sim) => Some(sim.dispatcher.counters()),
            _ => None,
        }
    }

    // ---------------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------------

    fn push(&mut self, name: String, kind: ModelKind, settings: DerivativeSettings) -> Result<ModelId> {
        if self.find(&name).is_some() {
            return Err(Error::Configuration(format!("duplicate model name '{name}'")));
        }
        if let Some(bad) = kind.children().into_iter().find(|c| c.0 >= self.nodes.len()) {
            return Err(Error::Configuration(format!(
                "model '{name}' refers to unknown model {bad}"
            )));
        }
        log::debug!("adding {} model '{name}'", kind.label());
        self.nodes.push(ModelNode { name, kind, estimator: DerivativeEstimator::new(settings) });
        Ok(ModelId(self.nodes.len() - 1))
    }

    /// Add a simulation model.
    pub fn add_simulation(
        &mut self,
        name: impl Into<String>,
        dispatcher: EvaluationDispatcher,
        n_vars: usize,
        n_functions: usize,
    ) -> Result<ModelId> {
        let kind = ModelKind::Simulation(SimulationModel::new(dispatcher, n_vars, n_functions));
        self.push(name.into(), kind, DerivativeSettings::default())
    }

    /// Add a Taylor data-fit surrogate of `actual`.
    pub fn add_data_fit(&mut self, name: impl Into<String>, actual: ModelId, order: usize) -> Result<ModelId> {
        let kind = ModelKind::DataFit { actual, surrogate: TaylorSurrogate::new(order)? };
        self.push(name.into(), kind, DerivativeSettings::passthrough())
    }

    /// Add a hierarchical or non-hierarchical ensemble.
    pub fn add_ensemble(
        &mut self,
        name: impl Into<String>,
        kind: EnsembleKind,
        members: Vec<ModelId>,
        key: ActiveKey,
        mode: ResponseMode,
    ) -> Result<ModelId> {
        let name = name.into();
        if let Some(bad) = members.iter().find(|m| m.0 >= self.nodes.len()) {
            return Err(Error::Configuration(format!("ensemble '{name}' member {bad} is unknown")));
        }
        if let Some(&first) = members.first() {
            let n = self.n_variables(first);
            if let Some(&m) = members.iter().find(|&&m| self.n_variables(m) != n) {
                return Err(Error::ShapeMismatch(format!(
                    "ensemble '{name}': member '{}' has {} variables, '{}' has {n}",
                    self.name(m),
                    self.n_variables(m),
                    self.name(first)
                )));
            }
        }
        let ensemble = EnsembleModel::new(kind, members, key, mode)?;
        let kind = match kind {
            EnsembleKind::Hierarchical => ModelKind::Hierarchical(ensemble),
            EnsembleKind::NonHierarchical => ModelKind::NonHierarchical(ensemble),
        };
        self.push(name, kind, DerivativeSettings::passthrough())
    }

    /// Add an affine recasting of `sub_model`.
    pub fn add_recast(&mut self, name: impl Into<String>, sub_model: ModelId, map: RecastMap) -> Result<ModelId> {
        let model = RecastModel::new(map, self.n_variables(sub_model), self.n_functions(sub_model))?;
        self.push(name.into(), ModelKind::Recast { sub_model, model }, DerivativeSettings::passthrough())
    }

    /// Add a nested model running `iterator` against `sub_model`; responses
    /// are `coefficients · results`.
    pub fn add_nested(
        &mut self,
        name: impl Into<String>,
        sub_model: ModelId,
        n_vars: usize,
        iterator: Box<dyn SubIterator>,
        coefficients: DMatrix<f64>,
    ) -> Result<ModelId> {
        let model = NestedModel::new(iterator, coefficients)?;
        self.push(name.into(), ModelKind::Nested { sub_model, n_vars, model }, DerivativeSettings::default())
    }

    /// Replace a model's derivative settings.
    pub fn set_derivatives(&mut self, id: ModelId, settings: DerivativeSettings) -> Result<()> {
        let node = self.node_mut(id)?;
        if matches!(node.kind, ModelKind::Nested { .. })
            && (settings.gradients.for_function(0) == Source::Analytic
                || settings.hessians.for_function(0) == Source::Analytic)
        {
            return Err(Error::Configuration(format!(
                "nested model '{}' supplies values only",
                node.name
            )));
        }
        node.estimator.set_settings(settings);
        Ok(())
    }

    /// Select an ensemble's active key.
    pub fn set_active_key(&mut self, id: ModelId, key: ActiveKey) -> Result<()> {
        self.ensemble_mut(id)?.set_key(key)
    }

    /// Select an ensemble's response mode.
    pub fn set_response_mode(&mut self, id: ModelId, mode: ResponseMode) -> Result<()> {
        self.ensemble_mut(id)?.set_mode(mode)
    }

    /// Configure an ensemble's discrepancy correction.
    pub fn set_correction(&mut self, id: ModelId, settings: CorrectionSettings) -> Result<()> {
        self.ensemble_mut(id)?.set_correction(settings)
    }

    /// Install parallel-topology hooks on an ensemble.
    pub fn set_parallel_hooks(&mut self, id: ModelId, hooks: Box<dyn ParallelHooks>) -> Result<()> {
        self.ensemble_mut(id)?.set_hooks(hooks);
        Ok(())
    }

    /// Drop a model's secant Hessian history.
    pub fn reset_quasi_newton(&mut self, id: ModelId) -> Result<()> {
        self.node_mut(id)?.estimator.reset_quasi_newton();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Shapes
    // ---------------------------------------------------------------------

    /// Variable count (0 for an unknown id).
    pub fn n_variables(&self, id: ModelId) -> usize {
        match self.kind(id) {
            Some(ModelKind::Simulation(sim)) => sim.n_vars,
            Some(ModelKind::Nested { n_vars, .. }) => *n_vars,
            Some(ModelKind::DataFit { actual: child, .. } | ModelKind::Recast { sub_model: child, .. }) => {
                self.n_variables(*child)
            }
            Some(ModelKind::Hierarchical(e) | ModelKind::NonHierarchical(e)) => {
                e.members().first().map_or(0, |&m| self.n_variables(m))
            }
            None => 0,
        }
    }

    /// Response function count under the current key and mode (0 for an
    /// unknown id).
    pub fn n_functions(&self, id: ModelId) -> usize {
        match self.kind(id) {
            Some(ModelKind::Simulation(sim)) => sim.n_functions,
            Some(ModelKind::Nested { model, .. }) => model.n_functions(),
            Some(ModelKind::DataFit { actual: child, .. } | ModelKind::Recast { sub_model: child, .. }) => {
                self.n_functions(*child)
            }
            Some(ModelKind::Hierarchical(e) | ModelKind::NonHierarchical(e)) => {
                let layout = e.layout();
                match e.mode() {
                    ResponseMode::Aggregated => {
                        layout.iter().map(|(k, _)| self.n_functions(e.member(*k))).sum()
                    }
                    _ => layout.first().map_or(0, |(k, _)| self.n_functions(e.member(*k))),
                }
            }
            None => 0,
        }
    }

    /// Metadata scalars per response.
    pub fn n_metadata(&self, id: ModelId) -> usize {
        match self.kind(id) {
            Some(ModelKind::Simulation(sim)) => sim.dispatcher.n_metadata(),
            Some(ModelKind::Recast { sub_model, .. }) => self.n_metadata(*sub_model),
            Some(ModelKind::Hierarchical(e) | ModelKind::NonHierarchical(e)) => {
                let layout = e.layout();
                match e.mode() {
                    ResponseMode::Aggregated => {
                        layout.iter().map(|(k, _)| self.n_metadata(e.member(*k))).sum()
                    }
                    _ => layout.first().map_or(0, |(k, _)| self.n_metadata(e.member(*k))),
                }
            }
            _ => 0,
        }
    }

    /// Values always; gradients/Hessians for functions whose configured
    /// source is not `None` and can be satisfied all the way down.
    /// Derivatives over every variable.
    pub fn default_active_set(&self, id: ModelId) -> ActiveSet {
        let n = self.n_functions(id);
        let dvv: Vec<usize> = (0..self.n_variables(id)).collect();
        let mut set = ActiveSet::uniform(n, REQUEST_VALUE, dvv);
        if let Some(est) = self.estimator(id) {
            let s = est.settings();
            let gradients = self.supports(id, REQUEST_GRADIENT);
            let hessians = self.supports(id, REQUEST_HESSIAN);
            for i in 0..n {
                if gradients && s.gradients.for_function(i) != Source::None {
                    set.insert(i, REQUEST_GRADIENT);
                }
                if hessians && s.hessians.for_function(i) != Source::None {
                    set.insert(i, REQUEST_HESSIAN);
                }
            }
        }
        set
    }

    /// Whether gradient (`REQUEST_GRADIENT`) or Hessian (`REQUEST_HESSIAN`)
    /// requests can be satisfied all the way down.
    pub fn supports(&self, id: ModelId, bit: u8) -> bool {
        let Some(node) = self.nodes.get(id.0) else {
            return false;
        };
        let s = node.estimator.settings();
        let (available, delegated) = if bit == REQUEST_HESSIAN {
            (s.hessians != HessianSource::None, s.hessians == HessianSource::Analytic)
        } else {
            (s.gradients != GradientSource::None, s.gradients == GradientSource::Analytic)
        };
        if !available {
            return false;
        }
        if !delegated || matches!(node.kind, ModelKind::Simulation(_) | ModelKind::DataFit { .. }) {
            return true;
        }
        node.kind.children().into_iter().all(|c| self.supports(c, bit))
    }

    fn check_request(&self, id: ModelId, vars: &Variables, set: &ActiveSet) -> Result<()> {
        let name = &self.node(id)?.name;
        let (n_vars, n_fns) = (self.n_variables(id), self.n_functions(id));
        if vars.len() != n_vars {
            return Err(Error::ShapeMismatch(format!(
                "model '{name}': {} variables given, {n_vars} expected",
                vars.len()
            )));
        }
        if set.n_functions() != n_fns {
            return Err(Error::ShapeMismatch(format!(
                "model '{name}': request for {} functions, model has {n_fns}",
                set.n_functions()
            )));
        }
        if let Some(v) = set.derivative_vars().iter().find(|&&v| v >= n_vars) {
            return Err(Error::Validation(format!(
                "model '{name}': derivative variable {v} out of range"
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Evaluation
    // ---------------------------------------------------------------------

    /// Blocking evaluation of `set` at `vars`.
    pub fn evaluate(&mut self, id: ModelId, vars: &Variables, set: &ActiveSet) -> Result<Response> {
        self.check_request(id, vars, set)?;
        let node = self.node(id)?;
        let plan = node.estimator.classify(set, &node.name)?;
        if !plan.needs_estimation {
            let response = self.derived_evaluate(id, vars, set)?;
            return Ok(self.node_mut(id)?.estimator.finish_direct(vars, response));
        }

        let stencil = node.estimator.stencil(vars, &plan, set);
        log::debug!(
            "model '{}': estimating derivatives with {} trial points",
            node.name,
            stencil.points().len()
        );
        let center = if plan.direct.is_empty() {
            None
        } else {
            Some(self.derived_evaluate(id, vars, &plan.direct)?)
        };
        let mut trials = Vec::with_capacity(stencil.points().len());
        for point in stencil.points() {
            trials.push(self.derived_evaluate(id, &vars.shifted(&point.offsets), &point.set)?);
        }
        self.node_mut(id)?.estimator.finish(vars, set, &plan, &stencil, center.as_ref(), &trials)
    }

    /// Non-blocking evaluation; the response is returned by a later
    /// `synchronize*` call under the returned id.
    pub fn evaluate_nowait(&mut self, id: ModelId, vars: &Variables, set: &ActiveSet) -> Result<EvalId> {
        self.check_request(id, vars, set)?;
        let node = self.node(id)?;
        let plan = node.estimator.classify(set, &node.name)?;
        let stencil = plan.needs_estimation.then(|| node.estimator.stencil(vars, &plan, set));
        let eval_id = self.node_mut(id)?.estimator.next_id();

        let batch = match stencil {
            None => {
                let inner = self.derived_evaluate_nowait(id, vars, set)?;
                FdBatch::direct(eval_id, vars.clone(), set.clone(), inner)
            }
            Some(stencil) => {
                let center = if plan.direct.is_empty() {
                    None
                } else {
                    Some(self.derived_evaluate_nowait(id, vars, &plan.direct)?)
                };
                // Trial ids recorded in dispatch order.
                let mut trials = Vec::with_capacity(stencil.points().len());
                for point in stencil.points() {
                    let shifted = vars.shifted(&point.offsets);
                    trials.push(self.derived_evaluate_nowait(id, &shifted, &point.set)?);
                }
                FdBatch::estimate(eval_id, vars.clone(), set.clone(), plan, stencil, center, trials)
            }
        };
        self.node_mut(id)?.estimator.push(batch);
        Ok(eval_id)
    }

    /// Blocking drain: every outstanding evaluation of `id`.
    pub fn synchronize(&mut self, id: ModelId) -> Result<ResponseMap> {
        let inner = self.derived_synchronize(id, true)?;
        let node = self.node_mut(id)?;
        node.estimator.collect(inner, true, &node.name)
    }

    /// Whatever is ready now; never blocks.
    pub fn synchronize_nowait(&mut self, id: ModelId) -> Result<ResponseMap> {
        let inner = self.derived_synchronize(id, false)?;
        let node = self.node_mut(id)?;
        node.estimator.collect(inner, false, &node.name)
    }

    /// Hand a collected response back for re-delivery by the next
    /// `synchronize*` call on `id`.
    pub fn cache_unmatched(&mut self, id: ModelId, eval_id: EvalId, response: Response) -> Result<()> {
        self.node_mut(id)?.estimator.cache_unmatched(eval_id, response);
        Ok(())
    }

    /// Select the resolution level of a simulation (forwarded through
    /// single-child wrappers).
    pub fn set_resolution(&mut self, id: ModelId, level: usize) -> Result<()> {
        match self.route(id)? {
            Route::Simulation => self.simulation_mut(id)?.set_resolution(level),
            Route::DataFit(child) | Route::Nested(child) | Route::Recast(child) => {
                self.set_resolution(child, level)
            }
            Route::Ensemble => Err(Error::Configuration(format!(
                "ensemble '{}' selects resolution levels through its active key",
                self.name(id)
            ))),
        }
    }

    /// (Re)build an approximation at `vars`: the Taylor expansion of a data
    /// fit, or the discrepancy correction of an ensemble.
    pub fn build_approximation(&mut self, id: ModelId, vars: &Variables) -> Result<()> {
        match self.route(id)? {
            Route::DataFit(actual) => {
                let (n_fns, n_vars) = (self.n_functions(actual), self.n_variables(actual));
                let set = self.surrogate_mut(id)?.build_set(n_fns, n_vars);
                let response = self.evaluate(actual, vars, &set)?;
                self.surrogate_mut(id)?.set_build(vars, &response);
                Ok(())
            }
            Route::Ensemble => self.recompute_correction(id, vars),
            _ => Err(Error::Configuration(format!(
                "model '{}' has no approximation to build",
                self.name(id)
            ))),
        }
    }

    /// Evaluate truth and approximation at `vars` and store a fresh
    /// discrepancy correction for the active key pair.
    pub fn recompute_correction(&mut self, id: ModelId, vars: &Variables) -> Result<()> {
        let ensemble = self.ensemble(id)?;
        let key = *ensemble.key();
        if !key.is_pair() {
            return Err(Error::Configuration(format!(
                "ensemble '{}': correction needs a (truth, approximation) key pair",
                self.name(id)
            )));
        }
        let (truth_key, approx_key) = (key.truth(), key.approx());
        let (truth, approx) = (ensemble.member(truth_key), ensemble.member(approx_key));
        let n = self.n_functions(truth);
        if self.n_functions(approx) != n {
            return Err(Error::ShapeMismatch(format!(
                "ensemble '{}': truth '{}' has {n} functions, approximation '{}' has {}",
                self.name(id),
                self.name(truth),
                self.name(approx),
                self.n_functions(approx)
            )));
        }
        let hessians = self.supports(truth, REQUEST_HESSIAN) && self.supports(approx, REQUEST_HESSIAN);
        let n_vars = self.n_variables(id);
        let set = self.ensemble_mut(id)?.correction_mut()?.data_set(n, n_vars, hessians);

        self.activate(id, "truth", truth, truth_key.level)?;
        let t = self.evaluate(truth, vars, &set)?;
        self.activate(id, "approx", approx, approx_key.level)?;
        let a = self.evaluate(approx, vars, &set)?;
        log::debug!("ensemble '{}': correction rebuilt", self.name(id));
        self.ensemble_mut(id)?.correction_mut()?.compute(vars, &t, &a)?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Derived evaluation per kind
    // ---------------------------------------------------------------------

    fn derived_evaluate(&mut self, id: ModelId, vars: &Variables, set: &ActiveSet) -> Result<Response> {
        match self.route(id)? {
            Route::Simulation => self.simulation_mut(id)?.evaluate(vars, set),
            Route::DataFit(_) => {
                if !self.surrogate_mut(id)?.is_built() {
                    self.build_approximation(id, vars)?;
                }
                self.surrogate_mut(id)?.approximate(vars, set)
            }
            Route::Ensemble => self.ensemble_evaluate(id, vars, set),
            Route::Recast(sub) => {
                let sub_vars = self.recast_mut(id)?.map_variables(vars)?;
                let response = self.evaluate(sub, &sub_vars, set)?;
                self.recast_mut(id)?.map_response(&response, set)
            }
            Route::Nested(sub) => self.run_nested(id, sub, vars, set),
        }
    }

    fn derived_evaluate_nowait(&mut self, id: ModelId, vars: &Variables, set: &ActiveSet) -> Result<EvalId> {
        match self.route(id)? {
            Route::Simulation => self.simulation_mut(id)?.evaluate_nowait(vars, set),
            Route::DataFit(_) => {
                let response = self.derived_evaluate(id, vars, set)?;
                Ok(self.surrogate_mut(id)?.queue(response))
            }
            Route::Ensemble => self.ensemble_evaluate_nowait(id, vars, set),
            Route::Recast(sub) => {
                let sub_vars = self.recast_mut(id)?.map_variables(vars)?;
                let sub_id = self.evaluate_nowait(sub, &sub_vars, set)?;
                Ok(self.recast_mut(id)?.track(sub_id, set.clone()))
            }
            Route::Nested(sub) => {
                let response = self.run_nested(id, sub, vars, set)?;
                Ok(self.nested_mut(id)?.queue(response))
            }
        }
    }

    fn derived_synchronize(&mut self, id: ModelId, blocking: bool) -> Result<ResponseMap> {
        match self.route(id)? {
            Route::Simulation => {
                let dispatcher = self.simulation_mut(id)?;
                if blocking { dispatcher.synchronize() } else { dispatcher.synchronize_nowait() }
            }
            Route::DataFit(_) => Ok(self.surrogate_mut(id)?.drain()),
            Route::Nested(_) => Ok(self.nested_mut(id)?.drain()),
            Route::Ensemble => self.ensemble_synchronize(id, blocking),
            Route::Recast(sub) => {
                let collected =
                    if blocking { self.synchronize(sub)? } else { self.synchronize_nowait(sub)? };
                let mut out = ResponseMap::new();
                for (sub_id, response) in collected {
                    let recast = self.recast_mut(id)?;
                    match recast.resolve(sub_id) {
                        Some((own_id, set)) => {
                            out.insert(own_id, recast.map_response(&response, &set)?);
                        }
                        None => self.cache_unmatched(sub, sub_id, response)?,
                    }
                }
                Ok(out)
            }
        }
    }

    fn run_nested(&mut self, id: ModelId, sub: ModelId, vars: &Variables, set: &ActiveSet) -> Result<Response> {
        let mut iterator = self.nested_mut(id)?.take_iterator()?;
        let results = iterator.run(&mut SubModel::new(self, sub), vars);
        let nested = self.nested_mut(id)?;
        nested.restore_iterator(iterator);
        nested.respond(&results?, set)
    }

    // ---------------------------------------------------------------------
    // Ensembles
    // ---------------------------------------------------------------------

    fn composite_plan(&self, id: ModelId, set: &ActiveSet) -> Result<CompositePlan> {
        self.ensemble(id)?.plan(set, |m| (self.n_functions(m), self.n_metadata(m)))
    }

    /// Fire the role's activation hook and re-assert its resolution level.
    fn activate(&mut self, id: ModelId, label: &str, model: ModelId, level: Option<usize>) -> Result<()> {
        let sub_name = self.name(model).to_string();
        self.ensemble_mut(id)?.activate(label, &sub_name);
        if let Some(level) = level {
            self.set_resolution(model, level)?;
        }
        Ok(())
    }

    fn ensure_correction(&mut self, id: ModelId, vars: &Variables) -> Result<()> {
        if self.ensemble(id)?.needs_correction() {
            self.recompute_correction(id, vars)?;
        }
        Ok(())
    }

    fn ensemble_evaluate(&mut self, id: ModelId, vars: &Variables, set: &ActiveSet) -> Result<Response> {
        self.ensure_correction(id, vars)?;
        let plan = self.composite_plan(id, set)?;
        let mut parts = Vec::with_capacity(plan.roles.len());
        for role in &plan.roles {
            if role.is_active() {
                self.activate(id, role.label, role.model, role.level)?;
                parts.push(Some(self.evaluate(role.model, vars, &role.set)?));
            } else {
                parts.push(None);
            }
        }
        self.ensemble_mut(id)?.combine(&plan, vars, set, parts)
    }

    fn ensemble_evaluate_nowait(&mut self, id: ModelId, vars: &Variables, set: &ActiveSet) -> Result<EvalId> {
        self.ensure_correction(id, vars)?;
        let plan = self.composite_plan(id, set)?;
        let eval_id = self.ensemble_mut(id)?.next_id();
        let mut routes = Vec::with_capacity(plan.roles.len());
        for (slot, role) in plan.roles.iter().enumerate() {
            if role.is_active() {
                self.activate(id, role.label, role.model, role.level)?;
                let child_id = self.evaluate_nowait(role.model, vars, &role.set)?;
                routes.push((role.model, child_id, slot));
            }
        }
        let ensemble = self.ensemble_mut(id)?;
        for (child, child_id, slot) in routes {
            ensemble.route(child, child_id, eval_id, slot);
        }
        ensemble.register(eval_id, vars, set, plan);
        Ok(eval_id)
    }

    fn ensemble_synchronize(&mut self, id: ModelId, blocking: bool) -> Result<ResponseMap> {
        for child in self.ensemble(id)?.children_in_flight() {
            let collected =
                if blocking { self.synchronize(child)? } else { self.synchronize_nowait(child)? };
            for (child_id, response) in collected {
                // Responses owed to another parent of a shared child go back.
                if let Some(response) = self.ensemble_mut(id)?.deliver(child, child_id, response) {
                    self.cache_unmatched(child, child_id, response)?;
                }
            }
        }
        let ensemble = self.ensemble_mut(id)?;
        let done = ensemble.drain_complete()?;
        if blocking && ensemble.n_outstanding() > 0 {
            return Err(Error::Computation(format!(
                "ensemble: {} composite evaluations incomplete after a blocking drain",
                ensemble.n_outstanding()
            )));
        }
        Ok(done.into_iter().collect())
    }

    // ---------------------------------------------------------------------
    // Node access
    // ---------------------------------------------------------------------

    fn node(&self, id: ModelId) -> Result<&ModelNode> {
        self.nodes.get(id.0).ok_or_else(|| Error::Configuration(format!("unknown model {id}")))
    }

    fn node_mut(&mut self, id: ModelId) -> Result<&mut ModelNode> {
        self.nodes.get_mut(id.0).ok_or_else(|| Error::Configuration(format!("unknown model {id}")))
    }

    fn route(&self, id: ModelId) -> Result<Route> {
        Ok(match &self.node(id)?.kind {
            ModelKind::Simulation(_) => Route::Simulation,
            ModelKind::DataFit { actual, .. } => Route::DataFit(*actual),
            ModelKind::Hierarchical(_) | ModelKind::NonHierarchical(_) => Route::Ensemble,
            ModelKind::Nested { sub_model, .. } => Route::Nested(*sub_model),
            ModelKind::Recast { sub_model, .. } => Route::Recast(*sub_model),
        })
    }

    fn wrong_kind(&self, id: ModelId, want: &str) -> Error {
        Error::Configuration(format!("model '{}' is not a {want} model", self.name(id)))
    }

    /// Ensemble state of `id`.
    pub fn ensemble(&self, id: ModelId) -> Result<&EnsembleModel> {
        self.node(id)?.kind.ensemble().ok_or_else(|| self.wrong_kind(id, "ensemble"))
    }

    fn ensemble_mut(&mut self, id: ModelId) -> Result<&mut EnsembleModel> {
        if self.ensemble(id).is_err() {
            return Err(self.wrong_kind(id, "ensemble"));
        }
        self.node_mut(id)?
            .kind
            .ensemble_mut()
            .ok_or_else(|| Error::Configuration("ensemble vanished".into()))
    }

    fn simulation_mut(&mut self, id: ModelId) -> Result<&mut EvaluationDispatcher> {
        let err = self.wrong_kind(id, "simulation");
        match &mut self.node_mut(id)?.kind {
            ModelKind::Simulation(sim) => Ok(&mut sim.dispatcher),
            _ => Err(err),
        }
    }

    fn surrogate_mut(&mut self, id: ModelId) -> Result<&mut TaylorSurrogate> {
        let err = self.wrong_kind(id, "data-fit");
        match &mut self.node_mut(id)?.kind {
            ModelKind::DataFit { surrogate, .. } => Ok(surrogate),
            _ => Err(err),
        }
    }

    fn recast_mut(&mut self, id: ModelId) -> Result<&mut RecastModel> {
        let err = self.wrong_kind(id, "recast");
        match &mut self.node_mut(id)?.kind {
            ModelKind::Recast { model, .. } => Ok(model),
            _ => Err(err),
        }
    }

    fn nested_mut(&mut self, id: ModelId) -> Result<&mut NestedModel> {
        let err = self.wrong_kind(id, "nested");
        match &mut self.node_mut(id)?.kind {
            ModelKind::Nested { model, .. } => Ok(model),
            _ => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EvaluationCache;
    use crate::direct::{DirectInterface, Driver};
    use mf_core::ModelKey;

    fn simulation(graph: &mut ModelGraph, name: &str, driver: Driver, n_vars: usize) -> ModelId {
        let n = driver.n_functions();
        let interface = DirectInterface::new(name, driver);
        let dispatcher = EvaluationDispatcher::new(name, Box::new(interface))
            .with_cache(Some(EvaluationCache::new()));
        graph.add_simulation(name, dispatcher, n_vars, n).unwrap()
    }

    #[test]
    fn test_children_must_exist() {
        let mut g = ModelGraph::new();
        let err = g.add_data_fit("fit", ModelId(3), 1).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut g = ModelGraph::new();
        simulation(&mut g, "sim", Driver::Rosenbrock, 2);
        let dispatcher = EvaluationDispatcher::new(
            "sim",
            Box::new(DirectInterface::new("sim", Driver::Rosenbrock)),
        );
        assert!(g.add_simulation("sim", dispatcher, 2, 1).is_err());
    }

    #[test]
    fn test_request_shape_checked() {
        let mut g = ModelGraph::new();
        let sim = simulation(&mut g, "sim", Driver::TextBook, 2);
        let err = g.evaluate(sim, &Variables::new(vec![1.0, 2.0]), &ActiveSet::new(2, 2)).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn test_default_active_set_follows_settings() {
        let mut g = ModelGraph::new();
        let sim = simulation(&mut g, "sim", Driver::TextBook, 2);
        assert_eq!(g.default_active_set(sim).request(), &[1, 1, 1]);
        g.set_derivatives(
            sim,
            DerivativeSettings { gradients: GradientSource::Numerical, ..Default::default() },
        )
        .unwrap();
        let set = g.default_active_set(sim);
        assert_eq!(set.request(), &[3, 3, 3]);
        assert_eq!(set.derivative_vars(), &[0, 1]);
    }

    #[test]
    fn test_ensemble_members_must_agree_on_variables() {
        let mut g = ModelGraph::new();
        let a = simulation(&mut g, "a", Driver::Rosenbrock, 2);
        let b = simulation(&mut g, "b", Driver::Rosenbrock, 3);
        let err = g
            .add_ensemble(
                "ens",
                EnsembleKind::NonHierarchical,
                vec![a, b],
                ActiveKey::Single(ModelKey::form(0)),
                ResponseMode::Aggregated,
            )
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn test_ensemble_has_no_resolution_of_its_own() {
        let mut g = ModelGraph::new();
        let a = simulation(&mut g, "a", Driver::Rosenbrock, 2);
        let e = g
            .add_ensemble(
                "ens",
                EnsembleKind::Hierarchical,
                vec![a],
                ActiveKey::Single(ModelKey::form(0)),
                ResponseMode::Bypass,
            )
            .unwrap();
        assert!(matches!(g.set_resolution(e, 1), Err(Error::Configuration(_))));
        assert!(g.set_active_key(a, ActiveKey::Single(ModelKey::form(0))).is_err());
    }
}
