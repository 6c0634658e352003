//! Local Taylor-series data-fit surrogate.

use mf_core::{
    ActiveSet, Error, EvalId, REQUEST_GRADIENT, REQUEST_HESSIAN, REQUEST_VALUE, Response,
    ResponseMap, Result, Variables,
};
use nalgebra::{DMatrix, DVector};

/// First- or second-order expansion of an actual model about a build point.
#[derive(Debug, Clone)]
pub struct TaylorSurrogate {
    order: usize,
    build: Option<TaylorBuild>,
    eval_counter: EvalId,
    ready: ResponseMap,
}

#[derive(Debug, Clone)]
struct TaylorBuild {
    center: DVector<f64>,
    values: Vec<f64>,
    gradients: Vec<DVector<f64>>,
    hessians: Vec<DMatrix<f64>>,
}

impl TaylorSurrogate {
    /// Surrogate of the given order (1 or 2).
    pub fn new(order: usize) -> Result<Self> {
        if !(1..=2).contains(&order) {
            return Err(Error::Configuration(format!(
                "Taylor surrogate order {order} not supported (1 or 2)"
            )));
        }
        Ok(Self { order, build: None, eval_counter: 0, ready: ResponseMap::new() })
    }

    /// Expansion order.
    pub fn order(&self) -> usize {
        self.order
    }

    /// `true` once a build point has been recorded.
    pub fn is_built(&self) -> bool {
        self.build.is_some()
    }

    /// Request the actual model must answer at a build point.
    pub fn build_set(&self, n_functions: usize, n_vars: usize) -> ActiveSet {
        let bits = if self.order == 2 {
            REQUEST_VALUE | REQUEST_GRADIENT | REQUEST_HESSIAN
        } else {
            REQUEST_VALUE | REQUEST_GRADIENT
        };
        ActiveSet::uniform(n_functions, bits, (0..n_vars).collect())
    }

    /// Record the actual model's response at `vars` as the expansion point.
    pub fn set_build(&mut self, vars: &Variables, response: &Response) {
        let n = response.n_functions();
        let dvv = response.active_set().derivative_vars();
        let m = vars.len();
        let mut gradients = vec![DVector::zeros(m); n];
        let mut hessians = vec![DMatrix::zeros(m, m); n];
        for i in 0..n {
            for (c, &j) in dvv.iter().enumerate() {
                gradients[i][j] = response.gradient(i)[c];
                if self.order == 2 {
                    for (d, &k) in dvv.iter().enumerate() {
                        hessians[i][(j, k)] = response.hessian(i)[(c, d)];
                    }
                }
            }
        }
        self.build = Some(TaylorBuild {
            center: DVector::from_column_slice(vars.values()),
            values: response.values().to_vec(),
            gradients,
            hessians,
        });
    }

    /// Evaluate the expansion at `vars` for `set`.
    pub fn approximate(&self, vars: &Variables, set: &ActiveSet) -> Result<Response> {
        let build = self
            .build
            .as_ref()
            .ok_or_else(|| Error::Configuration("Taylor surrogate evaluated before build".into()))?;
        if vars.len() != build.center.len() {
            return Err(Error::ShapeMismatch(format!(
                "Taylor surrogate built on {} variables, evaluated on {}",
                build.center.len(),
                vars.len()
            )));
        }
        let d = DVector::from_column_slice(vars.values()) - &build.center;
        let dvv = set.derivative_vars();
        let mut out = Response::new(set.clone(), 0);
        for i in 0..set.n_functions() {
            let bits = set.get(i);
            let h = &build.hessians[i];
            let hd = h * &d;
            if bits & REQUEST_VALUE != 0 {
                out.set_value(i, build.values[i] + build.gradients[i].dot(&d) + 0.5 * d.dot(&hd));
            }
            if bits & REQUEST_GRADIENT != 0 {
                let g = &build.gradients[i] + &hd;
                let g: Vec<f64> = dvv.iter().map(|&j| g[j]).collect();
                out.set_gradient(i, &g);
            }
            if bits & REQUEST_HESSIAN != 0 {
                let sub = DMatrix::from_fn(dvv.len(), dvv.len(), |r, c| h[(dvv[r], dvv[c])]);
                out.set_hessian(i, &sub);
            }
        }
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
