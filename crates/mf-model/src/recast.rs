//! Affine variable / response recasting of a sub-model.

use mf_core::{
    ActiveSet, Error, EvalId, REQUEST_GRADIENT, REQUEST_HESSIAN, REQUEST_VALUE, Response, Result,
    Variables,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `x_sub = scale ⊙ x + offset`, `f_i = weight_i · f_sub,i`.
///
/// Empty vectors mean identity (unit scale, zero offset, unit weights).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecastMap {
    /// Per-variable scale (must be non-zero).
    #[serde(default)]
    pub scale: Vec<f64>,
    /// Per-variable offset.
    #[serde(default)]
    pub offset: Vec<f64>,
    /// Per-function response weight (e.g. `-1` to turn a maximization into a
    /// minimization).
    #[serde(default)]
    pub weights: Vec<f64>,
}

/// Recast wrapper state.
#[derive(Debug, Clone)]
pub struct RecastModel {
    map: RecastMap,
    eval_counter: EvalId,
    /// sub-model id -> (own id, requested set)
    pending: HashMap<EvalId, (EvalId, ActiveSet)>,
}

impl RecastModel {
    /// Validate `map` against the sub-model sizes.
    pub fn new(map: RecastMap, n_vars: usize, n_functions: usize) -> Result<Self> {
        let check = |name: &str, len: usize, want: usize| {
            if len == 0 || len == want {
                Ok(())
            } else {
                Err(Error::ShapeMismatch(format!("recast {name}: {len} entries, expected {want}")))
            }
        };
        check("scale", map.scale.len(), n_vars)?;
        check("offset", map.offset.len(), n_vars)?;
        check("weights", map.weights.len(), n_functions)?;
        if let Some(j) = map.scale.iter().position(|&s| s == 0.0) {
            return Err(Error::Validation(format!("recast scale for variable {j} is zero")));
        }
        Ok(Self { map, eval_counter: 0, pending: HashMap::new() })
    }

    fn scale(&self, j: usize) -> f64 {
        self.map.scale.get(j).copied().unwrap_or(1.0)
    }

    fn offset(&self, j: usize) -> f64 {
        self.map.offset.get(j).copied().unwrap_or(0.0)
    }

    fn weight(&self, i: usize) -> f64 {
        self.map.weights.get(i).copied().unwrap_or(1.0)
    }

    /// Sub-model variables (bounds mapped, swapped for negative scales).
    pub fn map_variables(&self, vars: &Variables) -> Result<Variables> {
        let n = vars.len();
        let mut values = Vec::with_capacity(n);
        let mut lower = Vec::with_capacity(n);
        let mut upper = Vec::with_capacity(n);
        for j in 0..n {
            let (s, o) = (self.scale(j), self.offset(j));
            let (lb, ub) = vars.bounds(j);
            let (a, b) = (s * lb + o, s * ub + o);
            values.push(s * vars.value(j) + o);
            lower.push(a.min(b));
            upper.push(a.max(b));
        }
        Ok(Variables::with_bounds(values, lower, upper)?.with_labels(vars.labels().to_vec()))
    }

    /// Sub-model response mapped back through the weights and the chain rule.
    pub fn map_response(&self, sub: &Response, set: &ActiveSet) -> Result<Response> {
        let mut out = sub.extract(set)?;
        let dvv = set.derivative_vars().to_vec();
        for i in 0..set.n_functions() {
            let w = self.weight(i);
            let bits = set.get(i);
            if bits & REQUEST_VALUE != 0 {
                out.values_mut()[i] *= w;
            }
            if bits & REQUEST_GRADIENT != 0 {
                for (c, g) in out.gradient_mut(i).iter_mut().enumerate() {
                    *g *= w * self.scale(dvv[c]);
                }
            }
            if bits & REQUEST_HESSIAN != 0 {
                let h = out.hessian_mut(i);
                for r in 0..dvv.len() {
                    for c in 0..dvv.len() {
                        h[(r, c)] *= w * self.scale(dvv[r]) * self.scale(dvv[c]);
                    }
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn track(&mut self, sub_id: EvalId, set: ActiveSet) -> EvalId {
        self.eval_counter += 1;
        self.pending.insert(sub_id, (self.eval_counter, set));
        self.eval_counter
    }

    pub(crate) fn resolve(&mut self, sub_id: EvalId) -> Option<(EvalId, ActiveSet)> {
        self.pending.remove(&sub_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mf_core::REQUEST_ALL;

    #[test]
    fn test_affine_map_and_chain_rule() {
        let map = RecastMap { scale: vec![2.0, -1.0], offset: vec![1.0, 0.0], weights: vec![-1.0] };
        let recast = RecastModel::new(map, 2, 1).unwrap();
        let vars = Variables::with_bounds(vec![0.5, 1.0], vec![0.0, 0.0], vec![1.0, 2.0]).unwrap();
        let sub_vars = recast.map_variables(&vars).unwrap();
        assert_eq!(sub_vars.values(), &[2.0, -1.0]);
        assert_eq!(sub_vars.bounds(1), (-2.0, 0.0));

        let set = ActiveSet::uniform(1, REQUEST_ALL, vec![0, 1]);
        let mut sub = Response::new(set.clone(), 0);
        sub.set_value(0, 3.0);
        sub.set_gradient(0, &[1.0, 1.0]);
        sub.hessian_mut(0).fill(1.0);
        let out = recast.map_response(&sub, &set).unwrap();
        assert_eq!(out.value(0), -3.0);
        assert_eq!(out.gradient(0), &[-2.0, 1.0]);
        assert_eq!(out.hessian(0)[(0, 1)], 2.0);
        assert_eq!(out.hessian(0)[(0, 0)], -4.0);
    }

    #[test]
    fn test_bad_maps_rejected() {
        let zero = RecastMap { scale: vec![0.0], ..Default::default() };
        assert!(matches!(RecastModel::new(zero, 1, 1), Err(Error::Validation(_))));
        let short = RecastMap { weights: vec![1.0, 1.0], ..Default::default() };
        assert!(matches!(RecastModel::new(short, 1, 1), Err(Error::ShapeMismatch(_))));
    }
}
