//! In-process analytic interfaces ("direct" drivers).
//!
//! These stand in for external simulation codes in tests, benches and the CLI.
//! Asynchronous mode only defers work: queued requests are computed when the
//! caller synchronizes, optionally in reverse order and a few at a time to
//! exercise out-of-order collection.

use mf_core::{
    ActiveSet, Error, EvalId, Interface, REQUEST_GRADIENT, REQUEST_HESSIAN, REQUEST_VALUE,
    Response, ResponseMap, Result, Variables,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Built-in test functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "driver")]
pub enum Driver {
    /// `Σ 100 (x_{i+1} - x_i²)² + (1 - x_i)²`, one function, n ≥ 2.
    Rosenbrock,
    /// Three functions: `Σ (x_i - 1)^4`, `x1² - x2/2`, `x2² - x1/2`; n ≥ 2.
    TextBook,
    /// `½ Σ (x_i - c_i)²`, one function.
    Quadratic {
        /// Minimizer `c`.
        centers: Vec<f64>,
    },
}

impl Driver {
    /// Number of response functions produced.
    pub fn n_functions(&self) -> usize {
        match self {
            Self::TextBook => 3,
            Self::Rosenbrock | Self::Quadratic { .. } => 1,
        }
    }

    fn check_dimension(&self, n: usize) -> Result<()> {
        let ok = match self {
            Self::Rosenbrock | Self::TextBook => n >= 2,
            Self::Quadratic { centers } => centers.len() == n,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::ShapeMismatch(format!("driver {self:?} cannot take {n} variables")))
        }
    }

    /// Value, gradient (full length n) and Hessian (dense n×n) of function `f`.
    fn eval_function(&self, f: usize, x: &[f64]) -> (f64, Vec<f64>, Vec<Vec<f64>>) {
        let n = x.len();
        let mut g = vec![0.0; n];
        let mut h = vec![vec![0.0; n]; n];
        let value = match self {
            Self::Rosenbrock => {
                let mut v = 0.0;
                for i in 0..n - 1 {
                    let a = x[i + 1] - x[i] * x[i];
                    let b = 1.0 - x[i];
                    v += 100.0 * a * a + b * b;
                    g[i] += -400.0 * x[i] * a - 2.0 * b;
                    g[i + 1] += 200.0 * a;
                    h[i][i] += 1200.0 * x[i] * x[i] - 400.0 * x[i + 1] + 2.0;
                    h[i][i + 1] += -400.0 * x[i];
                    h[i + 1][i] += -400.0 * x[i];
                    h[i + 1][i + 1] += 200.0;
                }
                v
            }
            Self::TextBook => match f {
                0 => {
                    let mut v = 0.0;
                    for i in 0..n {
                        let d = x[i] - 1.0;
                        v += d.powi(4);
                        g[i] = 4.0 * d.powi(3);
                        h[i][i] = 12.0 * d * d;
                    }
                    v
                }
                1 => {
                    g[0] = 2.0 * x[0];
                    g[1] = -0.5;
                    h[0][0] = 2.0;
                    x[0] * x[0] - 0.5 * x[1]
                }
                _ => {
                    g[0] = -0.5;
                    g[1] = 2.0 * x[1];
                    h[1][1] = 2.0;
                    x[1] * x[1] - 0.5 * x[0]
                }
            },
            Self::Quadratic { centers } => {
                let mut v = 0.0;
                for i in 0..n {
                    let d = x[i] - centers[i];
                    v += 0.5 * d * d;
                    g[i] = d;
                    h[i][i] = 1.0;
                }
                v
            }
        };
        (value, g, h)
    }
}

/// Order in which queued asynchronous evaluations complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// Submission order.
    #[default]
    InOrder,
    /// Most recent submission first.
    Reverse,
}

struct Queued {
    raw_id: EvalId,
    level: usize,
    vars: Variables,
    set: ActiveSet,
}

/// Analytic interface with optional deferred (asynchronous) completion.
pub struct DirectInterface {
    name: String,
    driver: Driver,
    /// Per-level perturbation `p`: every function gains `p · Σ x_i²`.
    levels: Vec<f64>,
    /// Per-level cost reported as metadata.
    costs: Vec<f64>,
    level: usize,
    asynchronous: bool,
    completion: Completion,
    /// Max completions per `synchronize_nowait` call (0 = all).
    nowait_limit: usize,
    queue: Vec<Queued>,
    raw_counter: EvalId,
    evals: Arc<AtomicUsize>,
}

impl DirectInterface {
    /// Synchronous interface running `driver`.
    pub fn new(name: impl Into<String>, driver: Driver) -> Self {
        Self {
            name: name.into(),
            driver,
            levels: Vec::new(),
            costs: Vec::new(),
            level: 0,
            asynchronous: false,
            completion: Completion::InOrder,
            nowait_limit: 0,
            queue: Vec::new(),
            raw_counter: 0,
            evals: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enable deferred completion.
    pub fn asynchronous(mut self, completion: Completion, nowait_limit: usize) -> Self {
        self.asynchronous = true;
        self.completion = completion;
        self.nowait_limit = nowait_limit;
        self
    }

    /// Resolution levels, each adding `p · Σ x_i²` to every function.
    pub fn with_levels(mut self, perturbations: Vec<f64>) -> Self {
        self.levels = perturbations;
        self
    }

    /// Per-level cost, reported as one metadata scalar.
    pub fn with_costs(mut self, costs: Vec<f64>) -> Self {
        self.costs = costs;
        self
    }

    /// Shared counter of evaluations actually computed.
    pub fn eval_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.evals)
    }

    /// Number of response functions produced by the driver.
    pub fn n_functions(&self) -> usize {
        self.driver.n_functions()
    }

    fn compute(&self, vars: &Variables, set: &ActiveSet, level: usize) -> Result<Response> {
        let x = vars.values();
        self.driver.check_dimension(x.len())?;
        if set.n_functions() != self.driver.n_functions() {
            return Err(Error::ShapeMismatch(format!(
                "interface '{}': request for {} functions, driver has {}",
                self.name,
                set.n_functions(),
                self.driver.n_functions()
            )));
        }
        if let Some(&v) = set.derivative_vars().iter().find(|&&v| v >= x.len()) {
            return Err(Error::Validation(format!(
                "interface '{}': derivative variable {v} out of range",
                self.name
            )));
        }
        self.evals.fetch_add(1, Ordering::SeqCst);

        let p = self.levels.get(level).copied().unwrap_or(0.0);
        let dvv = set.derivative_vars();
        let mut r = Response::new(set.clone(), self.n_metadata());
        for f in 0..set.n_functions() {
            let bits = set.get(f);
            if bits == 0 {
                continue;
            }
            let (value, g, h) = self.driver.eval_function(f, x);
            if bits & REQUEST_VALUE != 0 {
                r.set_value(f, value + p * x.iter().map(|v| v * v).sum::<f64>());
            }
            if bits & REQUEST_GRADIENT != 0 {
                for (c, &j) in dvv.iter().enumerate() {
                    r.gradient_mut(f)[c] = g[j] + 2.0 * p * x[j];
                }
            }
            if bits & REQUEST_HESSIAN != 0 {
                let hm = r.hessian_mut(f);
                for (a, &j) in dvv.iter().enumerate() {
                    for (b, &k) in dvv.iter().enumerate() {
                        hm[(a, b)] = h[j][k] + if j == k { 2.0 * p } else { 0.0 };
                    }
                }
            }
        }
        if let Some(&cost) = self.costs.get(level) {
            r.metadata_mut()[0] = cost;
        }
        Ok(r)
    }

    fn complete(&mut self, limit: usize) -> Result<ResponseMap> {
        let take = if limit == 0 { self.queue.len() } else { limit.min(self.queue.len()) };
        let batch: Vec<Queued> = match self.completion {
            Completion::InOrder => self.queue.drain(..take).collect(),
            Completion::Reverse => {
                let start = self.queue.len() - take;
                self.queue.drain(start..).rev().collect()
            }
        };
        let mut out = ResponseMap::new();
        for q in batch {
            out.insert(q.raw_id, self.compute(&q.vars, &q.set, q.level)?);
        }
        Ok(out)
    }
}

impl Interface for DirectInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&mut self, vars: &Variables, set: &ActiveSet) -> Result<Response> {
        self.raw_counter += 1;
        self.compute(vars, set, self.level)
    }

    fn supports_async(&self) -> bool {
        self.asynchronous
    }

    fn evaluate_nowait(&mut self, vars: &Variables, set: &ActiveSet) -> Result<EvalId> {
        if !self.asynchronous {
            return Err(Error::Configuration(format!(
                "interface '{}' is synchronous-only",
                self.name
            )));
        }
        self.raw_counter += 1;
        // Completes at the level active at submission.
        self.queue.push(Queued {
            raw_id: self.raw_counter,
            level: self.level,
            vars: vars.clone(),
            set: set.clone(),
        });
        Ok(self.raw_counter)
    }

    fn synchronize(&mut self) -> Result<ResponseMap> {
        self.complete(0)
    }

    fn synchronize_nowait(&mut self) -> Result<ResponseMap> {
        self.complete(self.nowait_limit)
    }

    fn current_id(&self) -> EvalId {
        self.raw_counter
    }

    fn set_resolution(&mut self, level: usize) -> Result<()> {
        if !self.levels.is_empty() && level >= self.levels.len() {
            return Err(Error::Configuration(format!(
                "interface '{}' has {} resolution levels, {level} requested",
                self.name,
                self.levels.len()
            )));
        }
        self.level = level;
        Ok(())
    }

    fn n_metadata(&self) -> usize {
        usize::from(!self.costs.is_empty())
    }
}
