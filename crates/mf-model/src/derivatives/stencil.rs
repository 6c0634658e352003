//! Trial-point stencils and the difference formulas that consume them.
//!
//! A [`FdStencil`] is built once per estimation request. It owns the ordered
//! list of trial points to evaluate and, per derivative column, the rule that
//! turns the evaluated points back into gradient/Hessian entries. The point
//! order is the dispatch order; [`FdStencil::estimate`] expects the trial
//! responses in exactly that order.

use super::step::{place_central, place_forward, place_hessian, step_size};
use super::{
    DerivativePlan, DerivativeSettings, FD_HESSIAN_BY_GRADIENTS, FD_HESSIAN_BY_VALUES,
    IntervalType,
};
use mf_core::{ActiveSet, NumericDegeneracy, REQUEST_GRADIENT, REQUEST_VALUE, Response, Variables};
use nalgebra::DMatrix;

/// One trial point: offsets from the center plus what to ask for there.
#[derive(Debug, Clone)]
pub struct TrialPoint {
    /// `(variable index, signed offset)` pairs.
    pub offsets: Vec<(usize, f64)>,
    /// Request for this point (union of every rule that uses it).
    pub set: ActiveSet,
}

#[derive(Debug, Clone, Copy)]
enum GradientRule {
    Zero,
    Forward { h: f64, p: usize },
    Central { h1: f64, h2: f64, p1: usize, p2: usize },
    Asymmetric { h1: f64, h2: f64, p1: usize, p2: usize },
}

#[derive(Debug, Clone, Copy)]
enum DiagonalRule {
    Zero,
    Central { h: f64, pp: usize, pm: usize },
    /// General three-point form with offsets `a`, `b` (same side).
    Weighted { a: f64, b: f64, pa: usize, pb: usize },
}

#[derive(Debug, Clone, Copy)]
enum CrossRule {
    Zero,
    Central { hj: f64, hk: f64, pp: usize, pm: usize, mp: usize, mm: usize },
    OneSided { hj: f64, hk: f64, pjk: usize, pj: usize, pk: usize },
}

#[derive(Debug, Clone, Copy)]
enum GradientDiffRule {
    Zero,
    Forward { h: f64, p: usize },
}

/// Ordered trial points and per-column difference rules for one request.
#[derive(Debug, Clone)]
pub struct FdStencil {
    points: Vec<TrialPoint>,
    n_functions: usize,
    gradient: Vec<GradientRule>,
    diagonal: Vec<DiagonalRule>,
    cross: Vec<(usize, usize, CrossRule)>,
    gradient_diff: Vec<GradientDiffRule>,
}

/// Estimated blocks, one slot per response function.
#[derive(Debug, Clone, Default)]
pub struct FdEstimate {
    /// Finite-difference gradients (derivative-vector column order).
    pub gradients: Vec<Option<Vec<f64>>>,
    /// Finite-difference Hessians.
    pub hessians: Vec<Option<DMatrix<f64>>>,
}

fn relative_step(steps: &[f64], j: usize, default: f64) -> f64 {
    match steps {
        [] => default,
        [r] => *r,
        many => many.get(j).copied().unwrap_or(default),
    }
}

fn request_mask(set: &ActiveSet, bits: impl Fn(usize) -> u8) -> ActiveSet {
    let mut out = set.masked(0);
    for i in 0..set.n_functions() {
        out.set(i, bits(i));
    }
    out
}

impl FdStencil {
    /// Lay out the trial points for `plan` around `vars`.
    pub fn build(
        vars: &Variables,
        plan: &DerivativePlan,
        settings: &DerivativeSettings,
        set: &ActiveSet,
    ) -> Self {
        let n = set.n_functions();
        let dvv = set.derivative_vars();
        let mut stencil = Self {
            points: Vec::new(),
            n_functions: n,
            gradient: Vec::new(),
            diagonal: Vec::new(),
            cross: Vec::new(),
            gradient_diff: Vec::new(),
        };

        let fd_grad = request_mask(set, |i| if plan.fd_gradient[i] { REQUEST_VALUE } else { 0 });
        let by_values = request_mask(set, |i| {
            if plan.fd_hessian[i] == FD_HESSIAN_BY_VALUES { REQUEST_VALUE } else { 0 }
        });
        let by_grads = request_mask(set, |i| {
            if plan.fd_hessian[i] == FD_HESSIAN_BY_GRADIENTS { REQUEST_GRADIENT } else { 0 }
        });
        let ignore = settings.ignore_bounds;

        if !fd_grad.is_empty() {
            for &j in dvv {
                let (x0, (lb, ub)) = (vars.value(j), vars.bounds(j));
                let h = step_size(
                    x0,
                    lb,
                    ub,
                    relative_step(&settings.gradient_step, j, 1e-3),
                    settings.step_type,
                );
                let rule = match settings.interval {
                    IntervalType::Forward => {
                        let (h, _) = place_forward(x0, lb, ub, h, ignore);
                        if h == 0.0 {
                            zero_step(j, lb, ub);
                            GradientRule::Zero
                        } else {
                            GradientRule::Forward { h, p: stencil.point(vec![(j, h)], &fd_grad) }
                        }
                    }
                    IntervalType::Central => {
                        let placed = place_central(x0, lb, ub, h, ignore);
                        match placed.h2 {
                            _ if placed.h1 == 0.0 => {
                                zero_step(j, lb, ub);
                                GradientRule::Zero
                            }
                            None => GradientRule::Forward {
                                h: placed.h1,
                                p: stencil.point(vec![(j, placed.h1)], &fd_grad),
                            },
                            Some(h2) => {
                                let p1 = stencil.point(vec![(j, placed.h1)], &fd_grad);
                                let p2 = stencil.point(vec![(j, h2)], &fd_grad);
                                if placed.is_symmetric() {
                                    GradientRule::Central { h1: placed.h1, h2, p1, p2 }
                                } else {
                                    GradientRule::Asymmetric { h1: placed.h1, h2, p1, p2 }
                                }
                            }
                        }
                    }
                };
                stencil.gradient.push(rule);
            }
        }

        if !by_values.is_empty() {
            let steps: Vec<_> = dvv
                .iter()
                .map(|&j| {
                    let (x0, (lb, ub)) = (vars.value(j), vars.bounds(j));
                    let r = relative_step(&settings.hessian_step, j, 2e-3);
                    place_hessian(x0, lb, ub, step_size(x0, lb, ub, r, settings.step_type), ignore)
                })
                .collect();
            for (c, (&j, s)) in dvv.iter().zip(&steps).enumerate() {
                let rule = if s.h == 0.0 {
                    let (lb, ub) = vars.bounds(j);
                    zero_step(j, lb, ub);
                    DiagonalRule::Zero
                } else if s.central {
                    DiagonalRule::Central {
                        h: s.h,
                        pp: stencil.point(vec![(j, 2.0 * s.h)], &by_values),
                        pm: stencil.point(vec![(j, -2.0 * s.h)], &by_values),
                    }
                } else {
                    DiagonalRule::Weighted {
                        a: s.h,
                        b: 2.0 * s.h,
                        pa: stencil.point(vec![(j, s.h)], &by_values),
                        pb: stencil.point(vec![(j, 2.0 * s.h)], &by_values),
                    }
                };
                stencil.diagonal.push(rule);
                for (d, (&k, t)) in dvv.iter().zip(&steps).enumerate().skip(c + 1) {
                    let rule = if s.h == 0.0 || t.h == 0.0 {
                        CrossRule::Zero
                    } else if s.central && t.central {
                        let (hj, hk) = (s.h, t.h);
                        CrossRule::Central {
                            hj,
                            hk,
                            pp: stencil.point(vec![(j, hj), (k, hk)], &by_values),
                            pm: stencil.point(vec![(j, hj), (k, -hk)], &by_values),
                            mp: stencil.point(vec![(j, -hj), (k, hk)], &by_values),
                            mm: stencil.point(vec![(j, -hj), (k, -hk)], &by_values),
                        }
                    } else {
                        let (hj, hk) = (s.h, t.h);
                        CrossRule::OneSided {
                            hj,
                            hk,
                            pjk: stencil.point(vec![(j, hj), (k, hk)], &by_values),
                            pj: stencil.point(vec![(j, hj)], &by_values),
                            pk: stencil.point(vec![(k, hk)], &by_values),
                        }
                    };
                    stencil.cross.push((c, d, rule));
                }
            }
        }

        if !by_grads.is_empty() {
            for &j in dvv {
                let (x0, (lb, ub)) = (vars.value(j), vars.bounds(j));
                let r = relative_step(&settings.hessian_step, j, 1e-3);
                let h = step_size(x0, lb, ub, r, settings.step_type);
                let (h, _) = place_forward(x0, lb, ub, h, ignore);
                let rule = if h == 0.0 {
                    zero_step(j, lb, ub);
                    GradientDiffRule::Zero
                } else {
                    GradientDiffRule::Forward { h, p: stencil.point(vec![(j, h)], &by_grads) }
                };
                stencil.gradient_diff.push(rule);
            }
        }

        stencil
    }

    /// Trial points in dispatch order.
    pub fn points(&self) -> &[TrialPoint] {
        &self.points
    }

    /// Register a trial point, merging with an identical earlier one.
    fn point(&mut self, mut offsets: Vec<(usize, f64)>, set: &ActiveSet) -> usize {
        offsets.sort_by_key(|&(j, _)| j);
        let same = |p: &TrialPoint| {
            p.offsets.len() == offsets.len()
                && p.offsets.iter().zip(&offsets).all(|(a, b)| a.0 == b.0 && a.1 == b.1)
        };
        if let Some(k) = self.points.iter().position(same) {
            // Both sets come from one request, so the shapes agree.
            let merged = self.points[k].set.union_with(set);
            debug_assert!(merged.is_ok(), "trial point requests differ in shape");
            return k;
        }
        self.points.push(TrialPoint { offsets, set: set.clone() });
        self.points.len() - 1
    }

    /// Recover the estimated blocks from the center response and the trial
    /// responses (same order as [`Self::points`]).
    pub fn estimate(
        &self,
        plan: &DerivativePlan,
        center: Option<&Response>,
        trials: &[Response],
    ) -> FdEstimate {
        let n = self.n_functions;
        let mut out = FdEstimate { gradients: vec![None; n], hessians: vec![None; n] };
        let value = |p: usize, i: usize| trials[p].value(i);
        let f0 = |i: usize| center.map_or(0.0, |c| c.value(i));

        for i in 0..n {
            if plan.fd_gradient[i] {
                let f0 = f0(i);
                let g = self
                    .gradient
                    .iter()
                    .map(|rule| match *rule {
                        GradientRule::Zero => 0.0,
                        GradientRule::Forward { h, p } => (value(p, i) - f0) / h,
                        GradientRule::Central { h1, h2, p1, p2 } => {
                            (value(p1, i) - value(p2, i)) / (h1 - h2)
                        }
                        GradientRule::Asymmetric { h1, h2, p1, p2 } => {
                            (h2 * h2 * (value(p1, i) - f0) - h1 * h1 * (value(p2, i) - f0))
                                / (h1 * h2 * (h2 - h1))
                        }
                    })
                    .collect();
                out.gradients[i] = Some(g);
            }

            match plan.fd_hessian[i] {
                FD_HESSIAN_BY_VALUES => {
                    let f0 = f0(i);
                    let m = self.diagonal.len();
                    let mut h = DMatrix::zeros(m, m);
                    for (c, rule) in self.diagonal.iter().enumerate() {
                        h[(c, c)] = match *rule {
                            DiagonalRule::Zero => 0.0,
                            DiagonalRule::Central { h, pp, pm } => {
                                (value(pp, i) - 2.0 * f0 + value(pm, i)) / (4.0 * h * h)
                            }
                            DiagonalRule::Weighted { a, b, pa, pb } => {
                                2.0 * ((value(pa, i) - f0) / a - (value(pb, i) - f0) / b) / (a - b)
                            }
                        };
                    }
                    for &(c, d, rule) in &self.cross {
                        let hcd = match rule {
                            CrossRule::Zero => 0.0,
                            CrossRule::Central { hj, hk, pp, pm, mp, mm } => {
                                (value(pp, i) - value(pm, i) - value(mp, i) + value(mm, i))
                                    / (4.0 * hj * hk)
                            }
                            CrossRule::OneSided { hj, hk, pjk, pj, pk } => {
                                (value(pjk, i) - value(pj, i) - value(pk, i) + f0) / (hj * hk)
                            }
                        };
                        h[(c, d)] = hcd;
                        h[(d, c)] = hcd;
                    }
                    out.hessians[i] = Some(h);
                }
                FD_HESSIAN_BY_GRADIENTS => {
                    let m = self.gradient_diff.len();
                    let g0 = center.map(|c| c.gradient(i));
                    let mut raw = DMatrix::zeros(m, m);
                    for (c, rule) in self.gradient_diff.iter().enumerate() {
                        if let GradientDiffRule::Forward { h, p } = *rule {
                            let g1 = trials[p].gradient(i);
                            for k in 0..m {
                                let base = g0.map_or(0.0, |g| g[k]);
                                raw[(c, k)] = (g1[k] - base) / h;
                            }
                        }
                    }
                    let mut h = DMatrix::zeros(m, m);
                    for c in 0..m {
                        h[(c, c)] = raw[(c, c)];
                        for k in c + 1..m {
                            let v = 0.5 * (raw[(c, k)] + raw[(k, c)]);
                            h[(c, k)] = v;
                            h[(k, c)] = v;
                        }
                    }
                    out.hessians[i] = Some(h);
                }
                _ => {}
            }
        }
        out
    }
}

fn zero_step(variable: usize, lb: f64, ub: f64) {
    if ub <= lb {
        NumericDegeneracy::ZeroWidthBounds { variable }.warn("finite differences");
    } else {
        NumericDegeneracy::ZeroStep { variable }.warn("finite differences");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivatives::step::StepType;
    use crate::derivatives::{GradientSource, HessianSource, classify};
    use approx::assert_relative_eq;
    use mf_core::REQUEST_HESSIAN;

    /// f0 = x0² x1 + 3 x1, f1 = sin(x0) + x1³
    fn eval(vars: &Variables, set: &ActiveSet) -> Response {
        let x = vars.values();
        let mut r = Response::new(set.clone(), 0);
        r.set_value(0, x[0] * x[0] * x[1] + 3.0 * x[1]);
        r.set_value(1, x[0].sin() + x[1].powi(3));
        let dvv = set.derivative_vars().to_vec();
        let g0 = [2.0 * x[0] * x[1], x[0] * x[0] + 3.0];
        let g1 = [x[0].cos(), 3.0 * x[1] * x[1]];
        let g0: Vec<f64> = dvv.iter().map(|&j| g0[j]).collect();
        let g1: Vec<f64> = dvv.iter().map(|&j| g1[j]).collect();
        r.set_gradient(0, &g0);
        r.set_gradient(1, &g1);
        r.reset_inactive();
        r
    }

    fn run(settings: &DerivativeSettings, vars: &Variables, set: &ActiveSet) -> FdEstimate {
        let plan = classify(settings, set, "test").unwrap();
        let stencil = FdStencil::build(vars, &plan, settings, set);
        let center = eval(vars, &plan.direct);
        let trials: Vec<_> =
            stencil.points().iter().map(|p| eval(&vars.shifted(&p.offsets), &p.set)).collect();
        stencil.estimate(&plan, Some(&center), &trials)
    }

    #[test]
    fn test_forward_and_central_gradients() {
        let vars = Variables::new(vec![1.5, 2.0]);
        let set = ActiveSet::uniform(2, REQUEST_GRADIENT, vec![0, 1]);
        let mut settings = DerivativeSettings {
            gradients: GradientSource::Numerical,
            gradient_step: vec![1e-6],
            ..Default::default()
        };
        let fwd = run(&settings, &vars, &set);
        let g = fwd.gradients[0].as_ref().unwrap();
        assert_relative_eq!(g[0], 6.0, epsilon = 1e-4);
        assert_relative_eq!(g[1], 5.25, epsilon = 1e-4);

        settings.interval = IntervalType::Central;
        settings.gradient_step = vec![1e-4];
        let cen = run(&settings, &vars, &set);
        let g = cen.gradients[1].as_ref().unwrap();
        assert_relative_eq!(g[0], 1.5f64.cos(), epsilon = 1e-7);
        assert_relative_eq!(g[1], 12.0, epsilon = 1e-6);
    }

    #[test]
    fn test_asymmetric_central_near_bound() {
        let vars = Variables::with_bounds(vec![1.0, 1.0], vec![0.0, 0.0], vec![1.0005, 5.0]).unwrap();
        let set = ActiveSet::uniform(2, REQUEST_GRADIENT, vec![0]);
        let settings = DerivativeSettings {
            gradients: GradientSource::Numerical,
            interval: IntervalType::Central,
            gradient_step: vec![1e-3],
            ..Default::default()
        };
        let est = run(&settings, &vars, &set);
        // f0 = x0² x1 + 3 x1 is quadratic in x0: the asymmetric formula is exact.
        assert_relative_eq!(est.gradients[0].as_ref().unwrap()[0], 2.0, epsilon = 1e-8);
    }

    #[test]
    fn test_hessian_by_values_and_gradients() {
        let vars = Variables::new(vec![1.5, 2.0]);
        let set = ActiveSet::uniform(2, REQUEST_HESSIAN, vec![0, 1]);
        let by_values = DerivativeSettings {
            hessians: HessianSource::Numerical,
            hessian_step: vec![1e-3],
            ..Default::default()
        };
        let est = run(&by_values, &vars, &set);
        let h = est.hessians[0].as_ref().unwrap();
        assert_relative_eq!(h[(0, 0)], 4.0, epsilon = 1e-5);
        assert_relative_eq!(h[(0, 1)], 3.0, epsilon = 1e-5);
        assert_relative_eq!(h[(1, 0)], 3.0, epsilon = 1e-5);
        assert_relative_eq!(h[(1, 1)], 0.0, epsilon = 1e-5);

        let by_grads = DerivativeSettings {
            gradients: GradientSource::Analytic,
            hessians: HessianSource::Numerical,
            hessian_step: vec![1e-7],
            ..Default::default()
        };
        let est = run(&by_grads, &vars, &set);
        let h = est.hessians[1].as_ref().unwrap();
        assert_relative_eq!(h[(0, 0)], -(1.5f64.sin()), epsilon = 1e-5);
        assert_relative_eq!(h[(1, 1)], 12.0, epsilon = 1e-5);
        assert_eq!(h[(0, 1)], h[(1, 0)]);
    }

    #[test]
    fn test_one_sided_hessian_near_bound() {
        let vars = Variables::with_bounds(vec![0.0, 2.0], vec![0.0, 0.0], vec![10.0, 10.0]).unwrap();
        let set = ActiveSet::uniform(2, REQUEST_HESSIAN, vec![0, 1]);
        let settings = DerivativeSettings {
            hessians: HessianSource::Numerical,
            hessian_step: vec![1e-3],
            step_type: StepType::Absolute,
            ..Default::default()
        };
        let est = run(&settings, &vars, &set);
        let h = est.hessians[0].as_ref().unwrap();
        // x0 sits on its lower bound: one-sided diagonal and cross terms.
        assert_relative_eq!(h[(0, 0)], 4.0, epsilon = 1e-6);
        // One-sided cross term carries an O(h) error.
        assert_relative_eq!(h[(0, 1)], 0.0, epsilon = 2e-3);
    }

    #[test]
    fn test_zero_width_bounds_give_zero_column() {
        let vars = Variables::with_bounds(vec![1.0, 2.0], vec![1.0, 0.0], vec![1.0, 5.0]).unwrap();
        let set = ActiveSet::uniform(2, REQUEST_GRADIENT, vec![0, 1]);
        let settings =
            DerivativeSettings { gradients: GradientSource::Numerical, ..Default::default() };
        let est = run(&settings, &vars, &set);
        let g = est.gradients[0].as_ref().unwrap();
        assert_eq!(g[0], 0.0);
        assert_relative_eq!(g[1], 4.0, epsilon = 1e-2);
    }

    #[test]
    fn test_shared_points_are_merged() {
        let vars = Variables::new(vec![1.5, 2.0]);
        let set = ActiveSet::uniform(2, REQUEST_HESSIAN, vec![0, 1]);
        let settings = DerivativeSettings {
            hessians: HessianSource::Numerical,
            ..Default::default()
        };
        let plan = classify(&settings, &set, "test").unwrap();
        let stencil = FdStencil::build(&vars, &plan, &settings, &set);
        // Two diagonal pairs plus one 4-point cross stencil, no repeats.
        assert_eq!(stencil.points().len(), 8);
    }

    #[test]
    fn test_repeated_point_merges_requests() {
        let vars = Variables::new(vec![1.5, 2.0]);
        let set = ActiveSet::new(2, 2);
        let settings = DerivativeSettings::default();
        let plan = classify(&settings, &set, "test").unwrap();
        let mut stencil = FdStencil::build(&vars, &plan, &settings, &set);
        let n = stencil.points().len();

        let first = ActiveSet::from_request(vec![1, 0], vec![0, 1]).unwrap();
        let second = ActiveSet::from_request(vec![0, 1], vec![0, 1]).unwrap();
        let k = stencil.point(vec![(1, 0.5), (0, -0.25)], &first);
        assert_eq!(stencil.point(vec![(0, -0.25), (1, 0.5)], &second), k);
        assert_eq!(stencil.points().len(), n + 1);
        assert_eq!(stencil.points()[k].set.request(), &[1, 1]);
    }
}
