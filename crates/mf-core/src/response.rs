//! Response: the value / gradient / Hessian / metadata bundle that satisfies an
//! [`ActiveSet`].
//!
//! Storage is always allocated for the full shape (every function, every
//! derivative variable); the active set says which slots are meaningful.
//! Slots outside the active set are kept at zero whenever a response leaves the
//! engine, see [`Response::reset_inactive`].

use crate::active_set::{ActiveSet, REQUEST_GRADIENT, REQUEST_HESSIAN, REQUEST_VALUE};
use crate::{Error, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Evaluation result tied to exactly one active set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    set: ActiveSet,
    values: Vec<f64>,
    /// `gradients[i][c]` = d f_i / d x_{dvv[c]}
    gradients: Vec<Vec<f64>>,
    hessians: Vec<DMatrix<f64>>,
    metadata: Vec<f64>,
}

impl Response {
    /// Zero response shaped for `set` with `n_metadata` auxiliary scalars.
    pub fn new(set: ActiveSet, n_metadata: usize) -> Self {
        let n = set.n_functions();
        let m = set.n_derivative_vars();
        Self {
            values: vec![0.0; n],
            gradients: vec![vec![0.0; m]; n],
            hessians: vec![DMatrix::zeros(m, m); n],
            metadata: vec![0.0; n_metadata],
            set,
        }
    }

    /// Active set this response answers.
    pub fn active_set(&self) -> &ActiveSet {
        &self.set
    }

    /// Re-tie the response to a new active set, reshaping storage when the
    /// function count or derivative vector length changes.
    pub fn set_active_set(&mut self, set: ActiveSet) {
        let n = set.n_functions();
        let m = set.n_derivative_vars();
        if m != self.set.n_derivative_vars() || set.derivative_vars() != self.set.derivative_vars()
        {
            self.gradients = vec![vec![0.0; m]; n];
            self.hessians = vec![DMatrix::zeros(m, m); n];
        } else {
            self.gradients.resize(n, vec![0.0; m]);
            self.hessians.resize(n, DMatrix::zeros(m, m));
        }
        self.values.resize(n, 0.0);
        self.set = set;
    }

    /// Number of response functions.
    pub fn n_functions(&self) -> usize {
        self.values.len()
    }

    /// Function values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Mutable function values.
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    /// Value of function `i`.
    #[inline]
    pub fn value(&self, i: usize) -> f64 {
        self.values[i]
    }

    /// Set value of function `i`.
    #[inline]
    pub fn set_value(&mut self, i: usize, v: f64) {
        self.values[i] = v;
    }

    /// Gradient of function `i` (columns follow the derivative vector).
    #[inline]
    pub fn gradient(&self, i: usize) -> &[f64] {
        &self.gradients[i]
    }

    /// Mutable gradient of function `i`.
    #[inline]
    pub fn gradient_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.gradients[i]
    }

    /// Overwrite the gradient of function `i`.
    pub fn set_gradient(&mut self, i: usize, g: &[f64]) {
        self.gradients[i].copy_from_slice(g);
    }

    /// Hessian of function `i`.
    #[inline]
    pub fn hessian(&self, i: usize) -> &DMatrix<f64> {
        &self.hessians[i]
    }

    /// Mutable Hessian of function `i`.
    #[inline]
    pub fn hessian_mut(&mut self, i: usize) -> &mut DMatrix<f64> {
        &mut self.hessians[i]
    }

    /// Overwrite the Hessian of function `i`.
    pub fn set_hessian(&mut self, i: usize, h: &DMatrix<f64>) {
        self.hessians[i].copy_from(h);
    }

    /// Auxiliary scalars (e.g. cost).
    pub fn metadata(&self) -> &[f64] {
        &self.metadata
    }

    /// Mutable auxiliary scalars.
    pub fn metadata_mut(&mut self) -> &mut Vec<f64> {
        &mut self.metadata
    }

    /// Copy every quantity that both `self` requests and `other` provides.
    ///
    /// Derivative columns are matched by variable id, so `other` may use a
    /// different (super-set) derivative vector. Metadata is copied over the
    /// common prefix.
    pub fn update_from(&mut self, other: &Response) -> Result<()> {
        if other.n_functions() != self.n_functions() {
            return Err(Error::ShapeMismatch(format!(
                "response update: {} vs {} functions",
                self.n_functions(),
                other.n_functions()
            )));
        }
        let cols = column_map(self.set.derivative_vars(), other.set.derivative_vars());
        for i in 0..self.n_functions() {
            let bits = self.set.get(i) & other.set.get(i);
            self.copy_function(i, other, i, bits, &cols);
        }
        let k = self.metadata.len().min(other.metadata.len());
        self.metadata[..k].copy_from_slice(&other.metadata[..k]);
        Ok(())
    }

    /// Copy `other`'s functions into `self` starting at function `fn_offset`
    /// and its metadata starting at `meta_offset` (aggregation).
    pub fn update_partial(
        &mut self,
        fn_offset: usize,
        meta_offset: usize,
        other: &Response,
    ) -> Result<()> {
        if fn_offset + other.n_functions() > self.n_functions() {
            return Err(Error::ShapeMismatch(format!(
                "partial update: {} functions at offset {fn_offset} exceed {}",
                other.n_functions(),
                self.n_functions()
            )));
        }
        let cols = column_map(self.set.derivative_vars(), other.set.derivative_vars());
        for i in 0..other.n_functions() {
            let bits = self.set.get(fn_offset + i) & other.set.get(i);
            self.copy_function(fn_offset + i, other, i, bits, &cols);
        }
        let end = (meta_offset + other.metadata.len()).min(self.metadata.len());
        if end > meta_offset {
            self.metadata[meta_offset..end].copy_from_slice(&other.metadata[..end - meta_offset]);
        }
        Ok(())
    }

    /// New response for `set`, filled from `self` (column remapping included).
    pub fn extract(&self, set: &ActiveSet) -> Result<Response> {
        let mut out = Response::new(set.clone(), self.metadata.len());
        out.update_from(self)?;
        Ok(out)
    }

    /// Zero every slot not covered by the active set.
    pub fn reset_inactive(&mut self) {
        let m = self.set.n_derivative_vars();
        for i in 0..self.n_functions() {
            let bits = self.set.get(i);
            if bits & REQUEST_VALUE == 0 {
                self.values[i] = 0.0;
            }
            if bits & REQUEST_GRADIENT == 0 {
                self.gradients[i].iter_mut().for_each(|g| *g = 0.0);
            }
            if bits & REQUEST_HESSIAN == 0 && m > 0 {
                self.hessians[i].fill(0.0);
            }
        }
    }

    fn copy_function(
        &mut self,
        dst: usize,
        other: &Response,
        src: usize,
        bits: u8,
        cols: &[Option<usize>],
    ) {
        if bits & REQUEST_VALUE != 0 {
            self.values[dst] = other.values[src];
        }
        if bits & REQUEST_GRADIENT != 0 {
            for (c, &oc) in cols.iter().enumerate() {
                if let Some(oc) = oc {
                    self.gradients[dst][c] = other.gradients[src][oc];
                }
            }
        }
        if bits & REQUEST_HESSIAN != 0 {
            for (r, &or) in cols.iter().enumerate() {
                for (c, &oc) in cols.iter().enumerate() {
                    if let (Some(or), Some(oc)) = (or, oc) {
                        self.hessians[dst][(r, c)] = other.hessians[src][(or, oc)];
                    }
                }
            }
        }
    }
}

/// For each derivative variable of `dst`, its column in `src` (if present).
fn column_map(dst: &[usize], src: &[usize]) -> Vec<Option<usize>> {
    dst.iter().map(|v| src.iter().position(|s| s == v)).collect()
}
