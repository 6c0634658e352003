//! Secant (quasi-Newton) Hessian approximations: BFGS, damped BFGS and SR1.
//!
//! One approximation per response function, refined from successive
//! `(x, ∇f)` observations. Updates touch the upper triangle and mirror it, so
//! the stored matrix is symmetric by construction.

use mf_core::NumericDegeneracy;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Curvature threshold shared by the BFGS and SR1 safeguards.
const CURVATURE_TOL: f64 = 1e-6;
/// Damped BFGS switches to the interpolated `r` when `y·s < DAMPING_RATIO · sᵀHs`.
const DAMPING_RATIO: f64 = 0.2;

/// Secant update formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuasiNewtonKind {
    /// Plain BFGS.
    Bfgs,
    /// Powell-damped BFGS (keeps the approximation positive definite).
    #[default]
    DampedBfgs,
    /// Symmetric rank one.
    Sr1,
}

/// What a call to [`QuasiNewtonUpdater::update`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// First observation (or dimension change): recorded, Hessian untouched.
    Recorded,
    /// Hessian updated.
    Updated,
    /// Step too small: nothing changed, history not advanced.
    SkippedTinyStep,
    /// Curvature safeguard failed: Hessian untouched, history advanced.
    SkippedCurvature,
}

#[derive(Debug, Clone)]
struct SecantState {
    x_prev: DVector<f64>,
    g_prev: DVector<f64>,
    hessian: DMatrix<f64>,
    updates: usize,
}

/// Per-function secant Hessian approximations owned by one model.
#[derive(Debug, Clone)]
pub struct QuasiNewtonUpdater {
    kind: QuasiNewtonKind,
    states: Vec<Option<SecantState>>,
}

impl QuasiNewtonUpdater {
    /// Updater for `n_functions` response functions.
    pub fn new(kind: QuasiNewtonKind, n_functions: usize) -> Self {
        Self { kind, states: vec![None; n_functions] }
    }

    /// Update formula in use.
    pub fn kind(&self) -> QuasiNewtonKind {
        self.kind
    }

    /// Number of response functions tracked.
    pub fn n_functions(&self) -> usize {
        self.states.len()
    }

    /// Current approximation for function `i` (`None` before the first observation).
    pub fn hessian(&self, i: usize) -> Option<&DMatrix<f64>> {
        self.states.get(i)?.as_ref().map(|s| &s.hessian)
    }

    /// Number of secant steps taken for function `i` (initial scaling included).
    pub fn n_updates(&self, i: usize) -> usize {
        self.states.get(i).and_then(|s| s.as_ref()).map_or(0, |s| s.updates)
    }

    /// Forget all history (warm start off).
    pub fn reset(&mut self) {
        self.states.iter_mut().for_each(|s| *s = None);
    }

    /// Feed the gradient of function `i` observed at `x`.
    pub fn update(&mut self, i: usize, x: &[f64], grad: &[f64]) -> UpdateOutcome {
        debug_assert_eq!(x.len(), grad.len());
        let n = x.len();
        let x = DVector::from_column_slice(x);
        let g = DVector::from_column_slice(grad);

        let state = match &mut self.states[i] {
            Some(s) if s.x_prev.len() == n => s,
            slot => {
                // Before any curvature information the approximation is zero.
                *slot = Some(SecantState {
                    x_prev: x,
                    g_prev: g,
                    hessian: DMatrix::zeros(n, n),
                    updates: 0,
                });
                return UpdateOutcome::Recorded;
            }
        };

        let s = &x - &state.x_prev;
        let y = &g - &state.g_prev;
        let norm_s = s.norm();
        if norm_s <= f64::EPSILON * x.norm().max(1.0) {
            NumericDegeneracy::SkippedUpdate { function: i, reason: "zero step" }
                .warn("quasi-Newton");
            return UpdateOutcome::SkippedTinyStep;
        }

        if state.updates == 0 {
            state.hessian = DMatrix::identity(n, n) * initial_scale(&s, &y);
        }

        let applied = match self.kind {
            QuasiNewtonKind::Sr1 => sr1(&mut state.hessian, &s, &y),
            QuasiNewtonKind::Bfgs => bfgs(&mut state.hessian, &s, &y),
            QuasiNewtonKind::DampedBfgs => {
                let hs = &state.hessian * &s;
                let shs = s.dot(&hs);
                let ys = y.dot(&s);
                if ys < DAMPING_RATIO * shs {
                    let theta = (1.0 - DAMPING_RATIO) * shs / (shs - ys);
                    let r = &y * theta + &hs * (1.0 - theta);
                    bfgs(&mut state.hessian, &s, &r)
                } else {
                    bfgs(&mut state.hessian, &s, &y)
                }
            }
        };

        state.x_prev = x;
        state.g_prev = g;
        state.updates += 1;
        if applied {
            UpdateOutcome::Updated
        } else {
            NumericDegeneracy::SkippedUpdate { function: i, reason: "curvature safeguard" }
                .warn("quasi-Newton");
            UpdateOutcome::SkippedCurvature
        }
    }
}

/// `y·y / y·s`, zero when `y` vanishes, unit when `y·s` is not safely positive.
fn initial_scale(s: &DVector<f64>, y: &DVector<f64>) -> f64 {
    let yy = y.dot(y);
    if yy.sqrt() <= f64::EPSILON * s.norm().max(1.0) {
        return 0.0;
    }
    let ys = y.dot(s);
    if ys > f64::EPSILON * yy.sqrt() * s.norm() { yy / ys } else { 1.0 }
}

fn sr1(h: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>) -> bool {
    let ymbs = y - &*h * s;
    let denom = ymbs.dot(s);
    if denom.abs() <= CURVATURE_TOL * s.norm() * ymbs.norm() || denom == 0.0 {
        return false;
    }
    rank_one_upper(h, &ymbs, 1.0 / denom);
    mirror_upper(h);
    true
}

fn bfgs(h: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>) -> bool {
    let hs = &*h * s;
    let shs = s.dot(&hs);
    let ys = y.dot(s);
    if ys.abs() <= CURVATURE_TOL * shs.abs() || ys == 0.0 {
        return false;
    }
    rank_one_upper(h, y, 1.0 / ys);
    if shs > 0.0 {
        rank_one_upper(h, &hs, -1.0 / shs);
    }
    mirror_upper(h);
    true
}

/// `H[j][k] += alpha · v_j · v_k` for `j <= k`.
fn rank_one_upper(h: &mut DMatrix<f64>, v: &DVector<f64>, alpha: f64) {
    let n = v.len();
    for k in 0..n {
        for j in 0..=k {
            h[(j, k)] += alpha * v[j] * v[k];
        }
    }
}

fn mirror_upper(h: &mut DMatrix<f64>) {
    let n = h.nrows();
    for k in 0..n {
        for j in 0..k {
            h[(k, j)] = h[(j, k)];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Gradient of f(x) = ½ xᵀ A x with A = [[4, 1], [1, 3]].
    fn quad_grad(x: &[f64]) -> Vec<f64> {
        vec![4.0 * x[0] + x[1], x[0] + 3.0 * x[1]]
    }

    #[test]
    fn test_first_call_only_records() {
        let mut q = QuasiNewtonUpdater::new(QuasiNewtonKind::Bfgs, 1);
        assert_eq!(q.update(0, &[1.0, 1.0], &quad_grad(&[1.0, 1.0])), UpdateOutcome::Recorded);
        assert_eq!(q.hessian(0).unwrap(), &DMatrix::zeros(2, 2));
        assert_eq!(q.n_updates(0), 0);
    }

    #[test]
    fn test_tiny_step_leaves_hessian_identical() {
        for kind in [QuasiNewtonKind::Bfgs, QuasiNewtonKind::DampedBfgs, QuasiNewtonKind::Sr1] {
            let mut q = QuasiNewtonUpdater::new(kind, 1);
            q.update(0, &[1.0, 1.0], &quad_grad(&[1.0, 1.0]));
            q.update(0, &[0.5, 1.0], &quad_grad(&[0.5, 1.0]));
            let before = q.hessian(0).unwrap().clone();
            let updates = q.n_updates(0);
            let out = q.update(0, &[0.5, 1.0], &[9.0, 9.0]);
            assert_eq!(out, UpdateOutcome::SkippedTinyStep);
            assert_eq!(q.hessian(0).unwrap(), &before, "{kind:?}");
            assert_eq!(q.n_updates(0), updates);
        }
    }

    #[test]
    fn test_bfgs_recovers_quadratic_hessian() {
        let mut q = QuasiNewtonUpdater::new(QuasiNewtonKind::Bfgs, 1);
        let pts = [[1.0, 1.0], [0.2, 0.9], [0.1, -0.4], [-0.3, 0.2], [0.05, 0.05]];
        for p in &pts {
            q.update(0, p, &quad_grad(p));
        }
        let h = q.hessian(0).unwrap();
        // Secant condition on the last step holds exactly.
        let s = DVector::from_column_slice(&[0.05 - -0.3, 0.05 - 0.2]);
        let y = DVector::from_column_slice(&quad_grad(&[0.05, 0.05]))
            - DVector::from_column_slice(&quad_grad(&[-0.3, 0.2]));
        let hs = h * &s;
        assert_relative_eq!(hs[0], y[0], epsilon = 1e-10);
        assert_relative_eq!(hs[1], y[1], epsilon = 1e-10);
        assert_eq!(h[(0, 1)], h[(1, 0)], "symmetric by construction");
    }

    #[test]
    fn test_sr1_is_exact_on_quadratic_after_two_steps() {
        let mut q = QuasiNewtonUpdater::new(QuasiNewtonKind::Sr1, 1);
        for p in [[1.0, 1.0], [0.0, 1.0], [0.0, 0.0]] {
            q.update(0, &p, &quad_grad(&p));
        }
        let h = q.hessian(0).unwrap();
        assert_relative_eq!(h[(0, 0)], 4.0, epsilon = 1e-10);
        assert_relative_eq!(h[(0, 1)], 1.0, epsilon = 1e-10);
        assert_relative_eq!(h[(1, 1)], 3.0, epsilon = 1e-10);
    }

    #[test]
    fn test_initial_scaling_zero_when_gradient_unchanged() {
        let mut q = QuasiNewtonUpdater::new(QuasiNewtonKind::Bfgs, 1);
        q.update(0, &[0.0], &[2.0]);
        let out = q.update(0, &[1.0], &[2.0]);
        // y = 0 ⇒ scale 0 and y·s = 0 fails the safeguard.
        assert_eq!(out, UpdateOutcome::SkippedCurvature);
        assert_eq!(q.hessian(0).unwrap()[(0, 0)], 0.0);
        assert_eq!(q.n_updates(0), 1, "history advances on a safeguard skip");
    }

    #[test]
    fn test_damped_bfgs_stays_positive_on_negative_curvature() {
        let mut q = QuasiNewtonUpdater::new(QuasiNewtonKind::DampedBfgs, 1);
        q.update(0, &[0.0, 0.0], &[0.0, 0.0]);
        q.update(0, &[1.0, 0.0], &[2.0, 0.0]);
        // Negative curvature along the second step: plain BFGS would lose definiteness.
        q.update(0, &[1.0, 1.0], &[2.0, -1.0]);
        let h = q.hessian(0).unwrap();
        let eig = h.clone().symmetric_eigen();
        assert!(eig.eigenvalues.iter().all(|&l| l > 0.0), "eigenvalues {:?}", eig.eigenvalues);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut q = QuasiNewtonUpdater::new(QuasiNewtonKind::Sr1, 2);
        q.update(1, &[0.0], &[1.0]);
        q.reset();
        assert!(q.hessian(1).is_none());
    }
}
