//! Active set: what a caller asks a model to compute.
//!
//! One request bitmask per response function (value / gradient / Hessian) plus
//! the derivative vector, i.e. the ordered list of variable indices that defines
//! the column order of every gradient and Hessian produced for the request.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Request bit: function value.
pub const REQUEST_VALUE: u8 = 1;
/// Request bit: gradient.
pub const REQUEST_GRADIENT: u8 = 2;
/// Request bit: Hessian.
pub const REQUEST_HESSIAN: u8 = 4;
/// All three request bits.
pub const REQUEST_ALL: u8 = REQUEST_VALUE | REQUEST_GRADIENT | REQUEST_HESSIAN;

/// Request descriptor for one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActiveSet {
    request: Vec<u8>,
    derivative_vars: Vec<usize>,
}

impl ActiveSet {
    /// Values for every function, derivatives (if any) w.r.t. variables `0..n_vars`.
    pub fn new(n_functions: usize, n_vars: usize) -> Self {
        Self::uniform(n_functions, REQUEST_VALUE, (0..n_vars).collect())
    }

    /// Same request bits for every function.
    pub fn uniform(n_functions: usize, bits: u8, derivative_vars: Vec<usize>) -> Self {
        Self { request: vec![bits & REQUEST_ALL; n_functions], derivative_vars }
    }

    /// Build from an explicit request vector.
    pub fn from_request(request: Vec<u8>, derivative_vars: Vec<usize>) -> Result<Self> {
        if let Some(pos) = request.iter().position(|&b| b & !REQUEST_ALL != 0) {
            return Err(Error::Validation(format!(
                "request bits {} for function {pos} outside value|gradient|Hessian",
                request[pos]
            )));
        }
        Ok(Self { request, derivative_vars })
    }

    /// Number of response functions covered by this set.
    pub fn n_functions(&self) -> usize {
        self.request.len()
    }

    /// Request vector (one bitmask per function).
    pub fn request(&self) -> &[u8] {
        &self.request
    }

    /// Bits requested for function `i`.
    #[inline]
    pub fn get(&self, i: usize) -> u8 {
        self.request[i]
    }

    /// Overwrite the bits requested for function `i`.
    #[inline]
    pub fn set(&mut self, i: usize, bits: u8) {
        self.request[i] = bits & REQUEST_ALL;
    }

    /// Add `bits` to the request for function `i`.
    #[inline]
    pub fn insert(&mut self, i: usize, bits: u8) {
        self.request[i] |= bits & REQUEST_ALL;
    }

    /// Derivative variable ids (gradient/Hessian column order).
    pub fn derivative_vars(&self) -> &[usize] {
        &self.derivative_vars
    }

    /// Number of derivative variables.
    pub fn n_derivative_vars(&self) -> usize {
        self.derivative_vars.len()
    }

    /// Replace the derivative vector.
    pub fn set_derivative_vars(&mut self, derivative_vars: Vec<usize>) {
        self.derivative_vars = derivative_vars;
    }

    /// `true` if any function requests any of `bits`.
    pub fn any(&self, bits: u8) -> bool {
        self.request.iter().any(|&b| b & bits != 0)
    }

    /// `true` if nothing at all is requested.
    pub fn is_empty(&self) -> bool {
        self.request.iter().all(|&b| b == 0)
    }

    /// `true` if `self` already provides everything `other` asks for.
    ///
    /// Request bits must be a superset per function. When `other` asks for any
    /// derivative, every one of its derivative variables must also appear in
    /// `self`'s derivative vector (column order may differ).
    pub fn covers(&self, other: &ActiveSet) -> bool {
        if self.request.len() != other.request.len() {
            return false;
        }
        let bits_ok = self.request.iter().zip(&other.request).all(|(&have, &want)| have & want == want);
        if !bits_ok {
            return false;
        }
        if !other.any(REQUEST_GRADIENT | REQUEST_HESSIAN) {
            return true;
        }
        other.derivative_vars.iter().all(|v| self.derivative_vars.contains(v))
    }

    /// Per-function union of request bits. Derivative vectors must agree.
    pub fn union_with(&mut self, other: &ActiveSet) -> Result<()> {
        if self.request.len() != other.request.len() {
            return Err(Error::ShapeMismatch(format!(
                "active set union: {} vs {} functions",
                self.request.len(),
                other.request.len()
            )));
        }
        for (a, &b) in self.request.iter_mut().zip(&other.request) {
            *a |= b;
        }
        Ok(())
    }

    /// Sub-set covering functions `offset..offset + len` (same derivative vector).
    pub fn slice(&self, offset: usize, len: usize) -> ActiveSet {
        Self {
            request: self.request[offset..offset + len].to_vec(),
            derivative_vars: self.derivative_vars.clone(),
        }
    }

    /// Copy with every request masked by `mask`.
    pub fn masked(&self, mask: u8) -> ActiveSet {
        Self {
            request: self.request.iter().map(|&b| b & mask).collect(),
            derivative_vars: self.derivative_vars.clone(),
        }
    }
}

/// Partition a combined request into disjoint per-model requests.
///
/// `sizes[k]` is the number of functions contributed by model `k`; model `k`
/// receives functions `sum(sizes[..k])..sum(sizes[..=k])`. A function's bits are
/// never split across models.
pub fn split_active_set(combined: &ActiveSet, sizes: &[usize]) -> Result<Vec<ActiveSet>> {
    let total: usize = sizes.iter().sum();
    if total != combined.n_functions() {
        return Err(Error::ShapeMismatch(format!(
            "cannot split a {}-function request across models totalling {total} functions",
            combined.n_functions()
        )));
    }
    let mut offset = 0;
    let mut parts = Vec::with_capacity(sizes.len());
    for &n in sizes {
        parts.push(combined.slice(offset, n));
        offset += n;
    }
    Ok(parts)
}
