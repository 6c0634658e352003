//! Finite-difference step sizing and bound-respecting placement.

use serde::{Deserialize, Serialize};

/// How a relative step setting `r` becomes a step magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// `h = r · max(|x0|, 0.01)`
    #[default]
    Relative,
    /// `h = max(r, sqrt(f64::MIN_POSITIVE))`
    Absolute,
    /// `h = r · max(ub - lb, sqrt(f64::MIN_POSITIVE))`
    Bounds,
}

/// Step magnitude for one variable.
pub fn step_size(x0: f64, lb: f64, ub: f64, r: f64, step_type: StepType) -> f64 {
    let floor = f64::MIN_POSITIVE.sqrt();
    match step_type {
        StepType::Relative => r * x0.abs().max(0.01),
        StepType::Absolute => r.max(floor),
        StepType::Bounds => r * (ub - lb).max(floor),
    }
}

/// Placement of one or two trial offsets around `x0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepPlacement {
    /// Primary signed offset (zero when no feasible step exists).
    pub h1: f64,
    /// Opposite-side offset for central differences, `None` when unavailable.
    pub h2: Option<f64>,
    /// A bound forced a shortened step; downstream formulas must use the
    /// asymmetric weighting.
    pub short: bool,
}

impl StepPlacement {
    /// `true` for a symmetric central pair (`h2 == -h1`).
    pub fn is_symmetric(&self) -> bool {
        self.h2 == Some(-self.h1) && !self.short
    }
}

fn feasible(x: f64, lb: f64, ub: f64) -> bool {
    x >= lb && x <= ub
}

/// Signed forward offset of magnitude `h`, and whether it had to be shortened.
///
/// The step points away from zero first, flips sign when `x0 + h` leaves the
/// bounds, and is cut back to the farther bound when both signs are infeasible.
/// A shortened step lands on the farther bound, never the nearer one.
pub fn place_forward(x0: f64, lb: f64, ub: f64, h: f64, ignore_bounds: bool) -> (f64, bool) {
    let h = if x0 < 0.0 { -h.abs() } else { h.abs() };
    if ignore_bounds || feasible(x0 + h, lb, ub) {
        return (h, false);
    }
    if feasible(x0 - h, lb, ub) {
        return (-h, false);
    }
    let up = (ub - x0).max(0.0);
    let down = (x0 - lb).max(0.0);
    (if up >= down { up } else { -down }, true)
}

/// Offsets for a central difference of magnitude `h`.
///
/// When only one side has room the opposite offset is shortened to the bound;
/// when neither offset is usable the placement degrades to one-sided
/// (`h2 == None`).
pub fn place_central(x0: f64, lb: f64, ub: f64, h: f64, ignore_bounds: bool) -> StepPlacement {
    let (h1, short) = place_forward(x0, lb, ub, h, ignore_bounds);
    if h1 == 0.0 {
        return StepPlacement { h1, h2: None, short };
    }
    let mirrored = -h1;
    if !short && (ignore_bounds || feasible(x0 + mirrored, lb, ub)) {
        return StepPlacement { h1, h2: Some(mirrored), short: false };
    }
    // Room left on the opposite side.
    let room = if h1 > 0.0 { (x0 - lb).max(0.0) } else { (ub - x0).max(0.0) };
    let h2 = (room > 0.0).then(|| -h1.signum() * room.min(h1.abs()));
    StepPlacement { h1, h2, short: true }
}

/// Offset for second-order function differences.
///
/// `central` means both `x0 ± 2h` are feasible and the four-point stencil is
/// usable; otherwise `x0 + h` and `x0 + 2h` lie on the feasible side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HessianStep {
    /// Signed offset `h` (zero when no feasible step exists).
    pub h: f64,
    /// Symmetric stencil available.
    pub central: bool,
}

/// Place the Hessian-by-function-differences step of magnitude `h`.
pub fn place_hessian(x0: f64, lb: f64, ub: f64, h: f64, ignore_bounds: bool) -> HessianStep {
    let (h2x, short) = place_forward(x0, lb, ub, 2.0 * h, ignore_bounds);
    let central = !short && (ignore_bounds || feasible(x0 - h2x, lb, ub));
    HessianStep { h: 0.5 * h2x, central: central && h2x != 0.0 }
}
