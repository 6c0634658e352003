//! Derivative estimation layered over a model's own evaluations.
//!
//! [`classify`] splits a request into what the model answers directly and what
//! has to be estimated (finite differences or quasi-Newton). [`FdStencil`]
//! lays out and consumes the trial points; [`DerivativeEstimator`] owns the
//! per-model state: settings, secant Hessians, and the FIFO of asynchronous
//! batches awaiting their trial responses.

pub mod step;
pub mod stencil;

pub use step::{HessianStep, StepPlacement, StepType, place_central, place_forward, step_size};
pub use stencil::{FdEstimate, FdStencil, TrialPoint};

use crate::quasi_newton::{QuasiNewtonKind, QuasiNewtonUpdater};
use mf_core::{
    ActiveSet, Error, EvalId, REQUEST_GRADIENT, REQUEST_HESSIAN, REQUEST_VALUE, Response,
    ResponseMap, Result, Variables,
};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Hessian by second-order differences of function values.
pub const FD_HESSIAN_BY_VALUES: u8 = 1;
/// Hessian by first-order differences of analytic gradients.
pub const FD_HESSIAN_BY_GRADIENTS: u8 = 2;

/// Where one function's derivative of one order comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Not available.
    None,
    /// Supplied by the model itself.
    Analytic,
    /// Finite differences.
    Numerical,
    /// Secant approximation (Hessians only).
    Quasi,
}

/// Gradient configuration, uniform or per function.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradientSource {
    /// Gradients cannot be requested.
    #[default]
    None,
    /// Every gradient comes from the model.
    Analytic,
    /// Every gradient is finite-differenced.
    Numerical,
    /// Per-function lists (0-based function indices); unlisted functions have none.
    Mixed {
        /// Functions with model-supplied gradients.
        #[serde(default)]
        analytic: Vec<usize>,
        /// Functions with finite-difference gradients.
        #[serde(default)]
        numerical: Vec<usize>,
    },
}

impl GradientSource {
    /// Source for function `i`.
    pub fn for_function(&self, i: usize) -> Source {
        match self {
            Self::None => Source::None,
            Self::Analytic => Source::Analytic,
            Self::Numerical => Source::Numerical,
            Self::Mixed { analytic, numerical } => {
                if analytic.contains(&i) {
                    Source::Analytic
                } else if numerical.contains(&i) {
                    Source::Numerical
                } else {
                    Source::None
                }
            }
        }
    }
}

/// Hessian configuration, uniform or per function.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HessianSource {
    /// Hessians cannot be requested.
    #[default]
    None,
    /// Every Hessian comes from the model.
    Analytic,
    /// Finite differences (of gradients when those are analytic, else of values).
    Numerical,
    /// Secant updates from successive gradients.
    Quasi,
    /// Per-function lists (0-based function indices).
    Mixed {
        /// Model-supplied.
        #[serde(default)]
        analytic: Vec<usize>,
        /// Finite-differenced.
        #[serde(default)]
        numerical: Vec<usize>,
        /// Secant.
        #[serde(default)]
        quasi: Vec<usize>,
    },
}

impl HessianSource {
    /// Source for function `i`.
    pub fn for_function(&self, i: usize) -> Source {
        match self {
            Self::None => Source::None,
            Self::Analytic => Source::Analytic,
            Self::Numerical => Source::Numerical,
            Self::Quasi => Source::Quasi,
            Self::Mixed { analytic, numerical, quasi } => {
                if analytic.contains(&i) {
                    Source::Analytic
                } else if numerical.contains(&i) {
                    Source::Numerical
                } else if quasi.contains(&i) {
                    Source::Quasi
                } else {
                    Source::None
                }
            }
        }
    }

    fn uses_quasi(&self) -> bool {
        match self {
            Self::Quasi => true,
            Self::Mixed { quasi, .. } => !quasi.is_empty(),
            _ => false,
        }
    }
}

/// Finite-difference interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalType {
    /// One extra point per variable.
    #[default]
    Forward,
    /// Two points per variable.
    Central,
}

/// Per-model derivative settings.
///
/// Empty step lists mean the defaults: gradient step `1e-3`, Hessian step
/// `2e-3` by function differences and `1e-3` by gradient differences. A single
/// entry applies to every variable; otherwise one entry per variable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DerivativeSettings {
    /// Gradient source.
    #[serde(default)]
    pub gradients: GradientSource,
    /// Hessian source.
    #[serde(default)]
    pub hessians: HessianSource,
    /// Secant formula for quasi-Newton Hessians.
    #[serde(default)]
    pub quasi_newton: QuasiNewtonKind,
    /// Forward or central gradients.
    #[serde(default)]
    pub interval: IntervalType,
    /// Step-size policy.
    #[serde(default)]
    pub step_type: StepType,
    /// Relative gradient steps.
    #[serde(default)]
    pub gradient_step: Vec<f64>,
    /// Relative Hessian steps.
    #[serde(default)]
    pub hessian_step: Vec<f64>,
    /// Let trial points leave the variable bounds.
    #[serde(default)]
    pub ignore_bounds: bool,
}

impl DerivativeSettings {
    /// Derivatives delegated to whatever the model evaluates (composite models).
    pub fn passthrough() -> Self {
        Self {
            gradients: GradientSource::Analytic,
            hessians: HessianSource::Analytic,
            ..Default::default()
        }
    }
}

/// Routing of one request, per function.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivativePlan {
    /// What the model itself is asked for (center point).
    pub direct: ActiveSet,
    /// Gradient estimated by finite differences.
    pub fd_gradient: Vec<bool>,
    /// `0`, [`FD_HESSIAN_BY_VALUES`] or [`FD_HESSIAN_BY_GRADIENTS`].
    pub fd_hessian: Vec<u8>,
    /// Hessian taken from the secant approximation.
    pub quasi: Vec<bool>,
    /// Anything beyond `direct` is needed.
    pub needs_estimation: bool,
}

/// Route every requested quantity of `set` according to `settings`.
///
/// Asking for a derivative whose source is `None` is a configuration error
/// naming `model` and the function.
pub fn classify(settings: &DerivativeSettings, set: &ActiveSet, model: &str) -> Result<DerivativePlan> {
    let n = set.n_functions();
    let mut direct = set.masked(REQUEST_VALUE);
    let mut plan = DerivativePlan {
        direct: set.masked(0),
        fd_gradient: vec![false; n],
        fd_hessian: vec![0; n],
        quasi: vec![false; n],
        needs_estimation: false,
    };
    let missing = |what: &str, i: usize| {
        Error::Configuration(format!("model '{model}' has no {what} for function {i}"))
    };

    for i in 0..n {
        let bits = set.get(i);
        let grad_source = settings.gradients.for_function(i);
        if bits & REQUEST_GRADIENT != 0 {
            match grad_source {
                Source::Analytic => direct.insert(i, REQUEST_GRADIENT),
                Source::Numerical => {
                    plan.fd_gradient[i] = true;
                    direct.insert(i, REQUEST_VALUE);
                }
                Source::None | Source::Quasi => return Err(missing("gradient source", i)),
            }
        }
        if bits & REQUEST_HESSIAN != 0 {
            match settings.hessians.for_function(i) {
                Source::Analytic => direct.insert(i, REQUEST_HESSIAN),
                Source::Numerical if grad_source == Source::Analytic => {
                    plan.fd_hessian[i] = FD_HESSIAN_BY_GRADIENTS;
                    direct.insert(i, REQUEST_GRADIENT);
                }
                Source::Numerical => {
                    plan.fd_hessian[i] = FD_HESSIAN_BY_VALUES;
                    direct.insert(i, REQUEST_VALUE);
                }
                Source::Quasi => {
                    plan.quasi[i] = true;
                    match grad_source {
                        Source::Analytic => direct.insert(i, REQUEST_GRADIENT),
                        Source::Numerical => {
                            plan.fd_gradient[i] = true;
                            direct.insert(i, REQUEST_VALUE);
                        }
                        _ => return Err(missing("gradient to drive quasi-Newton updates", i)),
                    }
                }
                Source::None => return Err(missing("Hessian source", i)),
            }
        }
    }
    plan.needs_estimation = plan.fd_gradient.iter().any(|&b| b)
        || plan.fd_hessian.iter().any(|&b| b != 0)
        || plan.quasi.iter().any(|&b| b);
    plan.direct = direct;
    Ok(plan)
}

/// Overlay estimated blocks on the directly obtained response and re-tie the
/// result to the caller's `original` request.
pub fn assemble(
    direct: Option<&Response>,
    estimate: &FdEstimate,
    quasi: &[Option<DMatrix<f64>>],
    original: &ActiveSet,
) -> Result<Response> {
    let n_metadata = direct.map_or(0, |r| r.metadata().len());
    let mut out = Response::new(original.clone(), n_metadata);
    if let Some(direct) = direct {
        out.update_from(direct)?;
    }
    for (i, g) in estimate.gradients.iter().enumerate() {
        if let Some(g) = g {
            out.set_gradient(i, g);
        }
    }
    let hessians = estimate.hessians.iter().enumerate().chain(quasi.iter().enumerate());
    for (i, h) in hessians {
        if let Some(h) = h {
            out.set_hessian(i, h);
        }
    }
    out.reset_inactive();
    Ok(out)
}

#[derive(Debug, Clone)]
enum BatchKind {
    /// Nothing to estimate: one inner evaluation passed through.
    Direct { inner: EvalId },
    /// Center plus trial points, in dispatch order.
    Estimate { plan: DerivativePlan, stencil: FdStencil, center: Option<EvalId>, trials: Vec<EvalId> },
}

/// Context of one asynchronous request: the ids it waits for and how to
/// recombine them.
#[derive(Debug, Clone)]
pub(crate) struct FdBatch {
    id: EvalId,
    vars: Variables,
    set: ActiveSet,
    kind: BatchKind,
}

impl FdBatch {
    pub(crate) fn direct(id: EvalId, vars: Variables, set: ActiveSet, inner: EvalId) -> Self {
        Self { id, vars, set, kind: BatchKind::Direct { inner } }
    }

    pub(crate) fn estimate(
        id: EvalId,
        vars: Variables,
        set: ActiveSet,
        plan: DerivativePlan,
        stencil: FdStencil,
        center: Option<EvalId>,
        trials: Vec<EvalId>,
    ) -> Self {
        Self { id, vars, set, kind: BatchKind::Estimate { plan, stencil, center, trials } }
    }

    fn waits_for(&self) -> Vec<EvalId> {
        match &self.kind {
            BatchKind::Direct { inner } => vec![*inner],
            BatchKind::Estimate { center, trials, .. } => {
                center.iter().chain(trials).copied().collect()
            }
        }
    }
}

/// Per-model derivative state.
#[derive(Debug, Clone, Default)]
pub struct DerivativeEstimator {
    settings: DerivativeSettings,
    quasi: Option<QuasiNewtonUpdater>,
    batches: VecDeque<FdBatch>,
    held: ResponseMap,
    unmatched: ResponseMap,
    eval_counter: EvalId,
}

impl DerivativeEstimator {
    /// Estimator with the given settings.
    pub fn new(settings: DerivativeSettings) -> Self {
        Self { settings, ..Default::default() }
    }

    /// Active settings.
    pub fn settings(&self) -> &DerivativeSettings {
        &self.settings
    }

    /// Replace the settings; secant history is dropped.
    pub fn set_settings(&mut self, settings: DerivativeSettings) {
        self.settings = settings;
        self.quasi = None;
    }

    /// Route a request (see [`classify`]).
    pub fn classify(&self, set: &ActiveSet, model: &str) -> Result<DerivativePlan> {
        classify(&self.settings, set, model)
    }

    /// Trial-point layout for `plan` around `vars`.
    pub fn stencil(&self, vars: &Variables, plan: &DerivativePlan, set: &ActiveSet) -> FdStencil {
        FdStencil::build(vars, plan, &self.settings, set)
    }

    /// Current secant Hessian of function `i`, if any.
    pub fn quasi_hessian(&self, i: usize) -> Option<&DMatrix<f64>> {
        self.quasi.as_ref()?.hessian(i)
    }

    /// Forget secant history (warm start off).
    pub fn reset_quasi_newton(&mut self) {
        if let Some(q) = &mut self.quasi {
            q.reset();
        }
    }

    /// Combine a completed center/trial set into the caller's response.
    pub fn finish(
        &mut self,
        vars: &Variables,
        set: &ActiveSet,
        plan: &DerivativePlan,
        stencil: &FdStencil,
        center: Option<&Response>,
        trials: &[Response],
    ) -> Result<Response> {
        let estimate = stencil.estimate(plan, center, trials);
        let n = set.n_functions();
        let mut quasi = vec![None; n];
        if self.settings.hessians.uses_quasi() {
            let dvv = set.derivative_vars();
            for i in 0..n {
                let grad = match (&estimate.gradients[i], center) {
                    (Some(g), _) => Some(g.as_slice()),
                    (None, Some(c)) if c.active_set().get(i) & REQUEST_GRADIENT != 0 => {
                        Some(c.gradient(i))
                    }
                    _ => None,
                };
                if let Some(grad) = grad {
                    self.observe(n, i, vars, dvv, grad);
                }
                if plan.quasi[i] {
                    let m = dvv.len();
                    quasi[i] =
                        Some(self.quasi_hessian(i).cloned().unwrap_or_else(|| DMatrix::zeros(m, m)));
                }
            }
        }
        assemble(center, &estimate, &quasi, set)
    }

    /// Pass a directly answered response through, feeding its gradients to
    /// the secant updates.
    pub fn finish_direct(&mut self, vars: &Variables, response: Response) -> Response {
        if self.settings.hessians.uses_quasi() {
            let set = response.active_set().clone();
            let n = set.n_functions();
            for i in 0..n {
                if set.get(i) & REQUEST_GRADIENT != 0 {
                    self.observe(n, i, vars, set.derivative_vars(), response.gradient(i));
                }
            }
        }
        response
    }

    fn observe(&mut self, n: usize, i: usize, vars: &Variables, dvv: &[usize], grad: &[f64]) {
        if self.settings.hessians.for_function(i) != Source::Quasi {
            return;
        }
        let kind = self.settings.quasi_newton;
        let updater = match &mut self.quasi {
            Some(q) if q.kind() == kind && q.n_functions() == n => q,
            slot => slot.insert(QuasiNewtonUpdater::new(kind, n)),
        };
        let x: Vec<f64> = dvv.iter().map(|&j| vars.value(j)).collect();
        updater.update(i, &x, grad);
    }

    pub(crate) fn next_id(&mut self) -> EvalId {
        self.eval_counter += 1;
        self.eval_counter
    }

    /// Most recently issued id.
    pub fn current_id(&self) -> EvalId {
        self.eval_counter
    }

    pub(crate) fn push(&mut self, batch: FdBatch) {
        self.batches.push_back(batch);
    }

    /// Outstanding asynchronous requests.
    pub fn n_outstanding(&self) -> usize {
        self.batches.len()
    }

    /// Hold `response` for re-delivery by the next collection.
    pub fn cache_unmatched(&mut self, id: EvalId, response: Response) {
        self.unmatched.insert(id, response);
    }

    /// Merge newly arrived inner responses and emit every batch whose
    /// evaluations are all present, in dispatch order.
    ///
    /// With `blocking`, every outstanding batch must complete.
    pub(crate) fn collect(
        &mut self,
        inner: ResponseMap,
        blocking: bool,
        model: &str,
    ) -> Result<ResponseMap> {
        self.held.extend(inner);
        let mut out = ResponseMap::new();
        let mut waiting = VecDeque::with_capacity(self.batches.len());
        while let Some(batch) = self.batches.pop_front() {
            if !batch.waits_for().iter().all(|id| self.held.contains_key(id)) {
                waiting.push_back(batch);
                continue;
            }
            let id = batch.id;
            let response = self.complete(batch)?;
            out.insert(id, response);
        }
        self.batches = waiting;
        if blocking && !self.batches.is_empty() {
            return Err(Error::Computation(format!(
                "model '{model}': {} asynchronous evaluations did not complete",
                self.batches.len()
            )));
        }
        out.append(&mut self.unmatched);
        Ok(out)
    }

    fn complete(&mut self, batch: FdBatch) -> Result<Response> {
        let FdBatch { vars, set, kind, .. } = batch;
        match kind {
            BatchKind::Direct { inner } => {
                let response = self.take(inner)?;
                Ok(self.finish_direct(&vars, response))
            }
            BatchKind::Estimate { plan, stencil, center, trials } => {
                let center = center.map(|id| self.take(id)).transpose()?;
                let trials = trials.iter().map(|&id| self.take(id)).collect::<Result<Vec<_>>>()?;
                self.finish(&vars, &set, &plan, &stencil, center.as_ref(), &trials)
            }
        }
    }

    fn take(&mut self, id: EvalId) -> Result<Response> {
        self.held
            .remove(&id)
            .ok_or_else(|| Error::Computation(format!("evaluation {id} missing from batch")))
    }
}
