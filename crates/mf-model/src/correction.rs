//! Discrepancy corrections between a truth and an approximate model.
//!
//! A correction is a Taylor expansion (order 0, 1 or 2) about the last build
//! point of either the difference `truth - approx` (additive) or the ratio
//! `truth / approx` (multiplicative). The combined kind blends both with a
//! factor fitted at the previous build point.

use crate::quasi_newton::{QuasiNewtonKind, QuasiNewtonUpdater};
use mf_core::{
    ActiveSet, Error, NumericDegeneracy, REQUEST_GRADIENT, REQUEST_HESSIAN, REQUEST_VALUE,
    Response, Result, Variables,
};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Smallest |approx| accepted as a ratio denominator.
const RATIO_TOL: f64 = 1e-12;

/// How the correction is applied to the approximate response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    /// `f = f_approx + Δ(x)`
    #[default]
    Additive,
    /// `f = f_approx · β(x)`
    Multiplicative,
    /// `f = γ (f_approx + Δ) + (1 - γ) f_approx β`
    Combined,
}

/// Kind and Taylor order of a correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionSettings {
    /// Correction kind.
    #[serde(default)]
    pub kind: CorrectionKind,
    /// Taylor order (0, 1 or 2).
    #[serde(default = "default_order")]
    pub order: usize,
}

fn default_order() -> usize {
    1
}

impl Default for CorrectionSettings {
    fn default() -> Self {
        Self { kind: CorrectionKind::Additive, order: default_order() }
    }
}

/// Taylor coefficients per function, derivative columns over `columns`.
#[derive(Debug, Clone)]
struct Expansion {
    value: Vec<f64>,
    gradient: Vec<DVector<f64>>,
    hessian: Vec<DMatrix<f64>>,
}

impl Expansion {
    fn zeros(n: usize, m: usize) -> Self {
        Self {
            value: vec![0.0; n],
            gradient: vec![DVector::zeros(m); n],
            hessian: vec![DMatrix::zeros(m, m); n],
        }
    }

    /// Value, gradient and Hessian of term `i` at displacement `d`.
    fn at(&self, i: usize, d: &DVector<f64>) -> (f64, DVector<f64>, &DMatrix<f64>) {
        let h = &self.hessian[i];
        let hd = h * d;
        let g = &self.gradient[i];
        (self.value[i] + g.dot(d) + 0.5 * d.dot(&hd), g + hd, h)
    }
}

#[derive(Debug, Clone)]
struct BuildPoint {
    vars: Variables,
    truth: Vec<f64>,
    approx: Vec<f64>,
}

/// Stored correction for one (truth, approx) key pair.
#[derive(Debug, Clone)]
pub struct DiscrepancyCorrection {
    settings: CorrectionSettings,
    center: Option<Variables>,
    columns: Vec<usize>,
    additive: Option<Expansion>,
    multiplicative: Option<Expansion>,
    combine: Vec<f64>,
    previous: Option<BuildPoint>,
    secant: Option<(QuasiNewtonUpdater, QuasiNewtonUpdater)>,
}

impl DiscrepancyCorrection {
    /// Correction with the given settings; nothing computed yet.
    pub fn new(settings: CorrectionSettings) -> Result<Self> {
        if settings.order > 2 {
            return Err(Error::Configuration(format!(
                "correction order {} not supported (0, 1 or 2)",
                settings.order
            )));
        }
        Ok(Self {
            settings,
            center: None,
            columns: Vec::new(),
            additive: None,
            multiplicative: None,
            combine: Vec::new(),
            previous: None,
            secant: None,
        })
    }

    /// Settings.
    pub fn settings(&self) -> CorrectionSettings {
        self.settings
    }

    /// `true` once [`Self::compute`] has run.
    pub fn is_computed(&self) -> bool {
        self.center.is_some()
    }

    /// Blend factors of the combined kind (empty before the first build).
    pub fn combine_factors(&self) -> &[f64] {
        &self.combine
    }

    /// Request both models must answer at a build point.
    pub fn data_set(&self, n_functions: usize, n_vars: usize, hessians: bool) -> ActiveSet {
        let mut bits = REQUEST_VALUE;
        if self.settings.order >= 1 {
            bits |= REQUEST_GRADIENT;
        }
        if self.settings.order >= 2 && hessians {
            bits |= REQUEST_HESSIAN;
        }
        ActiveSet::uniform(n_functions, bits, (0..n_vars).collect())
    }

    /// Build the correction about `vars` and return the discrepancy response
    /// (additive terms for the additive and combined kinds, ratio terms for
    /// the multiplicative kind) shaped like `truth`'s request.
    pub fn compute(&mut self, vars: &Variables, truth: &Response, approx: &Response) -> Result<Response> {
        check_pair(truth, approx)?;
        let n = truth.n_functions();
        let columns = truth.active_set().derivative_vars().to_vec();
        let m = columns.len();
        let order = self.settings.order;
        let both = |i: usize, bit: u8| both_carry(truth, approx, i, bit);

        let secant = self.secant.get_or_insert_with(|| {
            (
                QuasiNewtonUpdater::new(QuasiNewtonKind::Bfgs, n),
                QuasiNewtonUpdater::new(QuasiNewtonKind::Bfgs, n),
            )
        });

        let want_add = self.settings.kind != CorrectionKind::Multiplicative;
        let want_mult = self.settings.kind != CorrectionKind::Additive;
        let mut add = Expansion::zeros(n, m);
        let mut mult = Expansion::zeros(n, m);

        for i in 0..n {
            let (t, a) = (truth.value(i), approx.value(i));
            let gt = DVector::from_column_slice(truth.gradient(i));
            let ga = DVector::from_column_slice(approx.gradient(i));
            let first = order >= 1 && both(i, REQUEST_GRADIENT);
            let exact_second = order >= 2 && both(i, REQUEST_HESSIAN);

            if want_add {
                add.value[i] = t - a;
                if first {
                    add.gradient[i] = &gt - &ga;
                }
                if exact_second {
                    add.hessian[i] = truth.hessian(i) - approx.hessian(i);
                } else if order >= 2 && first {
                    secant.0.update(i, vars_at(vars, &columns).as_slice(), add.gradient[i].as_slice());
                    add.hessian[i] = secant.0.hessian(i).cloned().unwrap_or_else(|| DMatrix::zeros(m, m));
                }
            }

            if want_mult {
                if a.abs() < RATIO_TOL {
                    NumericDegeneracy::ZeroApproxValue { function: i }.warn("multiplicative correction");
                    mult.value[i] = 1.0;
                    continue;
                }
                let beta = t / a;
                mult.value[i] = beta;
                if first {
                    mult.gradient[i] = (&gt - &ga * beta) / a;
                }
                if exact_second {
                    let gb = &mult.gradient[i];
                    mult.hessian[i] = (truth.hessian(i)
                        - approx.hessian(i) * beta
                        - gb * ga.transpose()
                        - &ga * gb.transpose())
                        / a;
                } else if order >= 2 && first {
                    secant.1.update(i, vars_at(vars, &columns).as_slice(), mult.gradient[i].as_slice());
                    mult.hessian[i] = secant.1.hessian(i).cloned().unwrap_or_else(|| DMatrix::zeros(m, m));
                }
            }
        }

        self.center = Some(vars.clone());
        self.columns = columns;
        self.additive = want_add.then_some(add);
        self.multiplicative = want_mult.then_some(mult);

        if self.settings.kind == CorrectionKind::Combined {
            self.combine = self.fit_combine(n);
        }
        self.previous = Some(BuildPoint {
            vars: vars.clone(),
            truth: truth.values().to_vec(),
            approx: approx.values().to_vec(),
        });

        let mut out = Response::new(truth.active_set().clone(), truth.metadata().len());
        let terms = match (&self.additive, &self.multiplicative) {
            (Some(add), _) => add,
            (None, Some(mult)) => mult,
            (None, None) => return Ok(out),
        };
        for i in 0..n {
            out.set_value(i, terms.value[i]);
            out.set_gradient(i, terms.gradient[i].as_slice());
            out.set_hessian(i, &terms.hessian[i]);
        }
        out.reset_inactive();
        Ok(out)
    }

    /// Pointwise discrepancy between `truth` and `approx`, leaving every
    /// stored correction untouched: `truth - approx` for the additive and
    /// combined kinds, `truth / approx` for the multiplicative kind.
    ///
    /// Derivative terms are filled where both responses carry them; Hessian
    /// terms are zero otherwise.
    pub fn discrepancy(kind: CorrectionKind, truth: &Response, approx: &Response) -> Result<Response> {
        check_pair(truth, approx)?;
        let mut out = Response::new(truth.active_set().clone(), truth.metadata().len());
        for i in 0..truth.n_functions() {
            let (t, a) = (truth.value(i), approx.value(i));
            let gt = DVector::from_column_slice(truth.gradient(i));
            let ga = DVector::from_column_slice(approx.gradient(i));
            let first = both_carry(truth, approx, i, REQUEST_GRADIENT);
            let second = both_carry(truth, approx, i, REQUEST_HESSIAN);

            if kind != CorrectionKind::Multiplicative {
                out.set_value(i, t - a);
                if first {
                    out.set_gradient(i, (&gt - &ga).as_slice());
                }
                if second {
                    out.set_hessian(i, &(truth.hessian(i) - approx.hessian(i)));
                }
                continue;
            }

            if a.abs() < RATIO_TOL {
                NumericDegeneracy::ZeroApproxValue { function: i }.warn("multiplicative discrepancy");
                out.set_value(i, 1.0);
                continue;
            }
            let beta = t / a;
            out.set_value(i, beta);
            if first {
                let gb = (&gt - &ga * beta) / a;
                if second {
                    let hb = (truth.hessian(i)
                        - approx.hessian(i) * beta
                        - &gb * ga.transpose()
                        - &ga * gb.transpose())
                        / a;
                    out.set_hessian(i, &hb);
                }
                out.set_gradient(i, gb.as_slice());
            }
        }
        out.reset_inactive();
        Ok(out)
    }

    /// γ per function so the blend reproduces the truth value at the previous
    /// build point; 1 (pure additive) when there is none or it is degenerate.
    fn fit_combine(&self, n: usize) -> Vec<f64> {
        let (Some(prev), Some(add), Some(mult)) =
            (&self.previous, &self.additive, &self.multiplicative)
        else {
            return vec![1.0; n];
        };
        let d = displacement(&prev.vars, self.center.as_ref(), &self.columns);
        (0..n)
            .map(|i| {
                let f_add = prev.approx[i] + add.at(i, &d).0;
                let f_mult = prev.approx[i] * mult.at(i, &d).0;
                let denom = f_add - f_mult;
                if denom.abs() > RATIO_TOL * f_add.abs().max(1.0) {
                    (prev.truth[i] - f_mult) / denom
                } else {
                    1.0
                }
            })
            .collect()
    }

    /// Correct `approx` (evaluated at `vars`) in place.
    ///
    /// The multiplicative and combined kinds need the approximate value of
    /// every corrected function, and its gradient for corrected gradients.
    pub fn apply(&self, vars: &Variables, approx: &mut Response) -> Result<()> {
        let Some(center) = &self.center else {
            return Err(Error::Configuration("correction applied before it was computed".into()));
        };
        let d = displacement(vars, Some(center), &self.columns);
        let set = approx.active_set().clone();
        // Response column -> expansion column.
        let cols: Vec<Option<usize>> = set
            .derivative_vars()
            .iter()
            .map(|v| self.columns.iter().position(|c| c == v))
            .collect();
        let project = |g: &DVector<f64>| -> DVector<f64> {
            DVector::from_iterator(cols.len(), cols.iter().map(|c| c.map_or(0.0, |k| g[k])))
        };
        let project_h = |h: &DMatrix<f64>| -> DMatrix<f64> {
            DMatrix::from_fn(cols.len(), cols.len(), |r, c| match (cols[r], cols[c]) {
                (Some(a), Some(b)) => h[(a, b)],
                _ => 0.0,
            })
        };

        for i in 0..set.n_functions() {
            let bits = set.get(i);
            let a = approx.value(i);
            let ga = DVector::from_column_slice(approx.gradient(i));
            let ha = approx.hessian(i).clone();

            let additive = self.additive.as_ref().map(|e| {
                let (v, g, h) = e.at(i, &d);
                (a + v, &ga + project(&g), &ha + project_h(h))
            });
            let multiplicative = self.multiplicative.as_ref().map(|e| {
                let (b, gb, hb) = e.at(i, &d);
                let gb = project(&gb);
                let hb = project_h(hb);
                (
                    a * b,
                    &ga * b + &gb * a,
                    &ha * b + &ga * gb.transpose() + &gb * ga.transpose() + hb * a,
                )
            });
            let (value, grad, hess) = match (additive, multiplicative) {
                (Some(add), Some(mult)) => {
                    let gamma = self.combine.get(i).copied().unwrap_or(1.0);
                    (
                        gamma * add.0 + (1.0 - gamma) * mult.0,
                        add.1 * gamma + mult.1 * (1.0 - gamma),
                        add.2 * gamma + mult.2 * (1.0 - gamma),
                    )
                }
                (Some(t), None) | (None, Some(t)) => t,
                (None, None) => continue,
            };
            if bits & REQUEST_VALUE != 0 {
                approx.set_value(i, value);
            }
            if bits & REQUEST_GRADIENT != 0 {
                approx.set_gradient(i, grad.as_slice());
            }
            if bits & REQUEST_HESSIAN != 0 {
                approx.set_hessian(i, &hess);
            }
        }
        Ok(())
    }
}

fn check_pair(truth: &Response, approx: &Response) -> Result<()> {
    let n = truth.n_functions();
    if approx.n_functions() != n {
        return Err(Error::ShapeMismatch(format!(
            "correction: truth has {n} functions, approximation {}",
            approx.n_functions()
        )));
    }
    if approx.active_set().derivative_vars() != truth.active_set().derivative_vars() {
        return Err(Error::ShapeMismatch(
            "correction: truth and approximation use different derivative vectors".into(),
        ));
    }
    Ok(())
}

fn both_carry(truth: &Response, approx: &Response, i: usize, bit: u8) -> bool {
    truth.active_set().get(i) & approx.active_set().get(i) & bit != 0
}

fn vars_at(vars: &Variables, columns: &[usize]) -> Vec<f64> {
    columns.iter().map(|&j| vars.value(j)).collect()
}

fn displacement(vars: &Variables, center: Option<&Variables>, columns: &[usize]) -> DVector<f64> {
    DVector::from_iterator(
        columns.len(),
        columns.iter().map(|&j| vars.value(j) - center.map_or(0.0, |c| c.value(j))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use mf_core::REQUEST_ALL;

    /// truth = x0² + x1, approx = x0 + 1 (all derivatives exact).
    fn pair(x: &[f64]) -> (Response, Response) {
        let set = ActiveSet::uniform(1, REQUEST_ALL, vec![0, 1]);
        let mut t = Response::new(set.clone(), 0);
        t.set_value(0, x[0] * x[0] + x[1]);
        t.set_gradient(0, &[2.0 * x[0], 1.0]);
        t.set_hessian(0, &DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 0.0]));
        let mut a = Response::new(set, 0);
        a.set_value(0, x[0] + 1.0);
        a.set_gradient(0, &[1.0, 0.0]);
        (t, a)
    }

    fn corrected(c: &DiscrepancyCorrection, x: &[f64]) -> Response {
        let (_, mut a) = pair(x);
        c.apply(&Variables::new(x.to_vec()), &mut a).unwrap();
        a
    }

    #[test]
    fn test_apply_before_compute_is_configuration_error() {
        let c = DiscrepancyCorrection::new(CorrectionSettings::default()).unwrap();
        let (_, mut a) = pair(&[1.0, 1.0]);
        let err = c.apply(&Variables::new(vec![1.0, 1.0]), &mut a).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_additive_matches_truth_at_center() {
        for order in 0..=2 {
            let mut c = DiscrepancyCorrection::new(CorrectionSettings {
                kind: CorrectionKind::Additive,
                order,
            })
            .unwrap();
            let x = [2.0, 3.0];
            let (t, a) = pair(&x);
            let delta = c.compute(&Variables::new(x.to_vec()), &t, &a).unwrap();
            assert_relative_eq!(delta.value(0), 7.0 - 3.0);
            let r = corrected(&c, &x);
            assert_relative_eq!(r.value(0), t.value(0));
            if order >= 1 {
                assert_relative_eq!(r.gradient(0)[0], 4.0);
            }
        }
    }

    #[test]
    fn test_second_order_additive_is_exact_for_quadratic() {
        let mut c = DiscrepancyCorrection::new(CorrectionSettings {
            kind: CorrectionKind::Additive,
            order: 2,
        })
        .unwrap();
        let (t, a) = pair(&[1.0, 0.0]);
        c.compute(&Variables::new(vec![1.0, 0.0]), &t, &a).unwrap();
        let r = corrected(&c, &[3.0, -2.0]);
        assert_relative_eq!(r.value(0), 9.0 - 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_multiplicative_first_order() {
        let mut c = DiscrepancyCorrection::new(CorrectionSettings {
            kind: CorrectionKind::Multiplicative,
            order: 1,
        })
        .unwrap();
        let x = [2.0, 3.0];
        let (t, a) = pair(&x);
        let beta = c.compute(&Variables::new(x.to_vec()), &t, &a).unwrap();
        assert_relative_eq!(beta.value(0), 7.0 / 3.0);
        let r = corrected(&c, &x);
        assert_relative_eq!(r.value(0), 7.0, epsilon = 1e-12);
        assert_relative_eq!(r.gradient(0)[0], 4.0, epsilon = 1e-12);
        assert_relative_eq!(r.gradient(0)[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_approx_value_falls_back_to_unit_ratio() {
        let mut c = DiscrepancyCorrection::new(CorrectionSettings {
            kind: CorrectionKind::Multiplicative,
            order: 0,
        })
        .unwrap();
        let x = [-1.0, 0.0];
        let (t, a) = pair(&x);
        let beta = c.compute(&Variables::new(x.to_vec()), &t, &a).unwrap();
        assert_eq!(beta.value(0), 1.0);
    }

    #[test]
    fn test_combined_fits_previous_point() {
        let mut c = DiscrepancyCorrection::new(CorrectionSettings {
            kind: CorrectionKind::Combined,
            order: 1,
        })
        .unwrap();
        let (x1, x2) = ([1.0, 1.0], [2.0, 0.5]);
        let (t1, a1) = pair(&x1);
        c.compute(&Variables::new(x1.to_vec()), &t1, &a1).unwrap();
        assert_eq!(c.combine_factors(), &[1.0]);

        let (t2, a2) = pair(&x2);
        c.compute(&Variables::new(x2.to_vec()), &t2, &a2).unwrap();
        // The blend reproduces truth at both build points.
        assert_relative_eq!(corrected(&c, &x2).value(0), t2.value(0), epsilon = 1e-12);
        assert_relative_eq!(corrected(&c, &x1).value(0), t1.value(0), epsilon = 1e-10);
    }

    #[test]
    fn test_columns_remapped_on_apply() {
        let mut c = DiscrepancyCorrection::new(CorrectionSettings::default()).unwrap();
        let (t, a) = pair(&[2.0, 3.0]);
        c.compute(&Variables::new(vec![2.0, 3.0]), &t, &a).unwrap();

        let set = ActiveSet::uniform(1, REQUEST_VALUE | REQUEST_GRADIENT, vec![1]);
        let mut approx = Response::new(set, 0);
        approx.set_value(0, 3.0);
        c.apply(&Variables::new(vec![2.0, 3.0]), &mut approx).unwrap();
        assert_eq!(approx.gradient(0), &[1.0]);
    }

    #[test]
    fn test_pointwise_discrepancy_leaves_correction_alone() {
        let (t, a) = pair(&[2.0, 3.0]);
        let add = DiscrepancyCorrection::discrepancy(CorrectionKind::Additive, &t, &a).unwrap();
        assert_relative_eq!(add.value(0), 4.0);
        assert_eq!(add.gradient(0), &[3.0, 1.0]);
        assert_eq!(add.hessian(0), &DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 0.0]));

        let ratio =
            DiscrepancyCorrection::discrepancy(CorrectionKind::Multiplicative, &t, &a).unwrap();
        assert_relative_eq!(ratio.value(0), 7.0 / 3.0);
        // (∇t - β∇a) / a
        assert_relative_eq!(ratio.gradient(0)[0], (4.0 - 7.0 / 3.0) / 3.0, epsilon = 1e-12);
        assert_relative_eq!(ratio.gradient(0)[1], 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_order_above_two_rejected() {
        let err = DiscrepancyCorrection::new(CorrectionSettings {
            kind: CorrectionKind::Additive,
            order: 3,
        })
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
