//! Nested model: an inner iteration over a sub-model per outer evaluation.

use crate::graph::{ModelGraph, ModelId};
use mf_core::{ActiveSet, Error, EvalId, Response, ResponseMap, Result, Variables};
use nalgebra::{DMatrix, DVector};

/// Caller-supplied inner iteration (e.g. a sampling or optimization loop).
pub trait SubIterator {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Number of scalar results produced by [`Self::run`].
    fn n_results(&self) -> usize;

    /// Run against `sub` for the outer point `vars`.
    fn run(&mut self, sub: &mut SubModel<'_>, vars: &Variables) -> Result<Vec<f64>>;
}

/// Evaluation access to the nested sub-model during [`SubIterator::run`].
pub struct SubModel<'a> {
    graph: &'a mut ModelGraph,
    id: ModelId,
}

impl<'a> SubModel<'a> {
    pub(crate) fn new(graph: &'a mut ModelGraph, id: ModelId) -> Self {
        Self { graph, id }
    }

    /// Blocking evaluation of the sub-model.
    pub fn evaluate(&mut self, vars: &Variables, set: &ActiveSet) -> Result<Response> {
        self.graph.evaluate(self.id, vars, set)
    }

    /// Sub-model function count.
    pub fn n_functions(&self) -> usize {
        self.graph.n_functions(self.id)
    }

    /// Sub-model variable count.
    pub fn n_variables(&self) -> usize {
        self.graph.n_variables(self.id)
    }

    /// Sub-model default request.
    pub fn default_active_set(&self) -> ActiveSet {
        self.graph.default_active_set(self.id)
    }
}

/// Inner sampling loop: evaluates the sub-model at the outer point shifted by
/// each sample offset and returns the per-function sample mean.
#[derive(Debug, Clone)]
pub struct SampleMean {
    n_functions: usize,
    samples: Vec<Vec<f64>>,
}

impl SampleMean {
    /// Mean over `samples` (offsets added to the outer point) of a sub-model
    /// with `n_functions` responses.
    pub fn new(n_functions: usize, samples: Vec<Vec<f64>>) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::Configuration("sample mean needs at least one sample".into()));
        }
        Ok(Self { n_functions, samples })
    }
}

impl SubIterator for SampleMean {
    fn name(&self) -> &str {
        "sample_mean"
    }

    fn n_results(&self) -> usize {
        self.n_functions
    }

    fn run(&mut self, sub: &mut SubModel<'_>, vars: &Variables) -> Result<Vec<f64>> {
        let n_vars = sub.n_variables();
        if vars.len() != n_vars {
            return Err(Error::ShapeMismatch(format!(
                "sample mean: {} outer variables for a sub-model with {n_vars}",
                vars.len()
            )));
        }
        let set = ActiveSet::new(self.n_functions, n_vars);
        let mut mean = vec![0.0; self.n_functions];
        for sample in &self.samples {
            if sample.len() != n_vars {
                return Err(Error::ShapeMismatch(format!(
                    "sample of length {} for {n_vars} variables",
                    sample.len()
                )));
            }
            let offsets: Vec<(usize, f64)> = sample.iter().copied().enumerate().collect();
            let response = sub.evaluate(&vars.shifted(&offsets), &set)?;
            for (m, v) in mean.iter_mut().zip(response.values()) {
                *m += v;
            }
        }
        let n = self.samples.len() as f64;
        mean.iter_mut().for_each(|m| *m /= n);
        Ok(mean)
    }
}

/// Nested wrapper state. Responses are `f = C · r` for the iterator results `r`.
pub struct NestedModel {
    iterator: Option<Box<dyn SubIterator>>,
    coefficients: DMatrix<f64>,
    eval_counter: EvalId,
    ready: ResponseMap,
}

impl NestedModel {
    /// `coefficients` is `n_functions × iterator.n_results()`.
    pub fn new(iterator: Box<dyn SubIterator>, coefficients: DMatrix<f64>) -> Result<Self> {
        if coefficients.ncols() != iterator.n_results() {
            return Err(Error::ShapeMismatch(format!(
                "nested '{}': coefficient matrix has {} columns for {} results",
                iterator.name(),
                coefficients.ncols(),
                iterator.n_results()
            )));
        }
        Ok(Self { iterator: Some(iterator), coefficients, eval_counter: 0, ready: ResponseMap::new() })
    }

    /// Number of outer response functions.
    pub fn n_functions(&self) -> usize {
        self.coefficients.nrows()
    }

    /// Take the iterator out for a run (the graph is borrowed by the run).
    pub(crate) fn take_iterator(&mut self) -> Result<Box<dyn SubIterator>> {
        self.iterator
            .take()
            .ok_or_else(|| Error::Computation("nested model re-entered during its own run".into()))
    }

    pub(crate) fn restore_iterator(&mut self, iterator: Box<dyn SubIterator>) {
        self.iterator = Some(iterator);
    }

    /// Map iterator results to the requested response (values only).
    pub(crate) fn respond(&self, results: &[f64], set: &ActiveSet) -> Result<Response> {
        if results.len() != self.coefficients.ncols() {
            return Err(Error::ShapeMismatch(format!(
                "nested: iterator returned {} results, expected {}",
                results.len(),
                self.coefficients.ncols()
            )));
        }
        let f = &self.coefficients * DVector::from_column_slice(results);
        let mut out = Response::new(set.clone(), 0);
        out.values_mut().copy_from_slice(f.as_slice());
        out.reset_inactive();
        Ok(out)
    }

    pub(crate) fn queue(&mut self, response: Response) -> EvalId {
        self.eval_counter += 1;
        self.ready.insert(self.eval_counter, response);
        self.eval_counter
    }

    pub(crate) fn drain(&mut self) -> ResponseMap {
        std::mem::take(&mut self.ready)
    }
}

impl std::fmt::Debug for NestedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedModel")
            .field("iterator", &self.iterator.as_ref().map(|i| i.name().to_string()))
            .field("n_functions", &self.n_functions())
            .finish()
    }
}
