//! Continuous design variables with bounds.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Snapshot of the continuous variables passed to an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variables {
    values: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    labels: Vec<String>,
}

impl Variables {
    /// Unbounded variables labelled `x1..xn`.
    pub fn new(values: Vec<f64>) -> Self {
        let n = values.len();
        Self {
            values,
            lower: vec![f64::NEG_INFINITY; n],
            upper: vec![f64::INFINITY; n],
            labels: (1..=n).map(|i| format!("x{i}")).collect(),
        }
    }

    /// Bounded variables. Bounds must have the same length and satisfy `lower <= upper`.
    pub fn with_bounds(values: Vec<f64>, lower: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        if lower.len() != values.len() || upper.len() != values.len() {
            return Err(Error::ShapeMismatch(format!(
                "variables: {} values but {} lower / {} upper bounds",
                values.len(),
                lower.len(),
                upper.len()
            )));
        }
        if let Some(i) = (0..values.len()).find(|&i| lower[i] > upper[i]) {
            return Err(Error::Validation(format!(
                "variable {i}: lower bound {} exceeds upper bound {}",
                lower[i], upper[i]
            )));
        }
        let mut vars = Self::new(values);
        vars.lower = lower;
        vars.upper = upper;
        Ok(vars)
    }

    /// Replace variable labels.
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        debug_assert_eq!(labels.len(), self.values.len());
        self.labels = labels;
        self
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// `true` when there are no variables.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Current values.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Value of variable `i`.
    #[inline]
    pub fn value(&self, i: usize) -> f64 {
        self.values[i]
    }

    /// Overwrite variable `i`.
    #[inline]
    pub fn set_value(&mut self, i: usize, value: f64) {
        self.values[i] = value;
    }

    /// Lower bounds.
    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    /// Upper bounds.
    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    /// `(lower, upper)` for variable `i`.
    #[inline]
    pub fn bounds(&self, i: usize) -> (f64, f64) {
        (self.lower[i], self.upper[i])
    }

    /// Variable labels.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Copy with each `(i, delta)` added to variable `i` (bounds untouched).
    pub fn shifted(&self, offsets: &[(usize, f64)]) -> Variables {
        let mut out = self.clone();
        for &(i, delta) in offsets {
            out.values[i] += delta;
        }
        out
    }

    /// Bit patterns of the values, used as an exact-match key.
    pub fn key_bits(&self) -> Vec<u64> {
        // -0.0 and 0.0 denote the same point
        self.values.iter().map(|&v| if v == 0.0 { 0 } else { v.to_bits() }).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bounds_are_infinite() {
        let v = Variables::new(vec![1.0, 2.0]);
        assert_eq!(v.bounds(1), (f64::NEG_INFINITY, f64::INFINITY));
        assert_eq!(v.labels(), &["x1".to_string(), "x2".to_string()]);
    }

    #[test]
    fn test_with_bounds_validates() {
        assert!(Variables::with_bounds(vec![1.0], vec![2.0], vec![0.0]).is_err());
        assert!(matches!(
            Variables::with_bounds(vec![1.0], vec![], vec![0.0]),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_key_bits_identify_signed_zero() {
        let a = Variables::new(vec![0.0, 1.5]);
        let b = Variables::new(vec![-0.0, 1.5]);
        assert_eq!(a.key_bits(), b.key_bits());
    }

    #[test]
    fn test_shifted() {
        let v = Variables::new(vec![1.0, 2.0, 3.0]);
        let s = v.shifted(&[(0, 0.5), (2, -1.0)]);
        assert_eq!(s.values(), &[1.5, 2.0, 2.0]);
    }
}
