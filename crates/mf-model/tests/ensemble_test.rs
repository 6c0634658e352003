//! Fidelity composition: aggregation offsets, discrepancy and corrected
//! modes, shared children, and the wrapper model kinds.

use approx::assert_relative_eq;
use mf_core::{
    ActiveKey, ActiveSet, EvalId, Interface, ModelKey, ParallelHooks, REQUEST_VALUE, Response,
    ResponseMap, Result, Variables,
};
use mf_model::{
    Completion, CorrectionKind, CorrectionSettings, DerivativeSettings, DirectInterface, Driver,
    EnsembleKind, EvaluationCache, EvaluationDispatcher, ModelGraph, ModelId, RecastMap,
    ResponseMode, SubIterator, SubModel,
};
use nalgebra::DMatrix;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Two functions, `x0 + x1` and `x0 · x1`, completing one evaluation per
/// non-blocking drain.
#[derive(Default)]
struct SumProduct {
    queue: Vec<(EvalId, Variables, ActiveSet)>,
    counter: EvalId,
}

impl SumProduct {
    fn respond(vars: &Variables, set: &ActiveSet) -> Response {
        let x = vars.values();
        let mut r = Response::new(set.clone(), 0);
        r.set_value(0, x[0] + x[1]);
        r.set_value(1, x[0] * x[1]);
        r.reset_inactive();
        r
    }
}

impl Interface for SumProduct {
    fn name(&self) -> &str {
        "sum_product"
    }

    fn evaluate(&mut self, vars: &Variables, set: &ActiveSet) -> Result<Response> {
        self.counter += 1;
        Ok(Self::respond(vars, set))
    }

    fn supports_async(&self) -> bool {
        true
    }

    fn evaluate_nowait(&mut self, vars: &Variables, set: &ActiveSet) -> Result<EvalId> {
        self.counter += 1;
        self.queue.push((self.counter, vars.clone(), set.clone()));
        Ok(self.counter)
    }

    fn synchronize(&mut self) -> Result<ResponseMap> {
        Ok(self.queue.drain(..).map(|(id, v, s)| (id, Self::respond(&v, &s))).collect())
    }

    fn synchronize_nowait(&mut self) -> Result<ResponseMap> {
        Ok(self.queue.pop().map(|(id, v, s)| (id, Self::respond(&v, &s))).into_iter().collect())
    }

    fn current_id(&self) -> EvalId {
        self.counter
    }
}

fn add(graph: &mut ModelGraph, name: &str, interface: Box<dyn Interface>, n_vars: usize, n_fns: usize) -> ModelId {
    let dispatcher =
        EvaluationDispatcher::new(name, interface).with_cache(Some(EvaluationCache::new()));
    graph.add_simulation(name, dispatcher, n_vars, n_fns).unwrap()
}

fn add_direct(graph: &mut ModelGraph, name: &str, interface: DirectInterface, n_vars: usize) -> ModelId {
    let n = interface.n_functions();
    add(graph, name, Box::new(interface), n_vars, n)
}

fn text_book_values(x: &[f64]) -> [f64; 3] {
    [
        (x[0] - 1.0).powi(4) + (x[1] - 1.0).powi(4),
        x[0] * x[0] - 0.5 * x[1],
        x[1] * x[1] - 0.5 * x[0],
    ]
}

// ── Aggregation ─────────────────────────────────────────────────────────────

#[test]
fn test_aggregation_places_second_member_at_offset_three() {
    let mut g = ModelGraph::new();
    let a = add_direct(&mut g, "a", DirectInterface::new("a", Driver::TextBook), 2);
    let b = add(&mut g, "b", Box::<SumProduct>::default(), 2, 2);
    let ens = g
        .add_ensemble(
            "agg",
            EnsembleKind::NonHierarchical,
            vec![a, b],
            ActiveKey::Single(ModelKey::form(0)),
            ResponseMode::Aggregated,
        )
        .unwrap();
    assert_eq!(g.n_functions(ens), 5);

    let x = [2.0, 3.0];
    let r = g.evaluate(ens, &Variables::new(x.to_vec()), &ActiveSet::new(5, 2)).unwrap();
    assert_eq!(&r.values()[..3], &text_book_values(&x));
    assert_eq!(&r.values()[3..], &[5.0, 6.0]);
}

#[test]
fn test_aggregation_offsets_survive_out_of_order_completion() {
    let mut g = ModelGraph::new();
    // The two-function member has the lower id, so it is drained first.
    let b = add(&mut g, "b", Box::<SumProduct>::default(), 2, 2);
    let a = add_direct(
        &mut g,
        "a",
        DirectInterface::new("a", Driver::TextBook).asynchronous(Completion::Reverse, 1),
        2,
    );
    let ens = g
        .add_ensemble(
            "agg",
            EnsembleKind::NonHierarchical,
            vec![a, b],
            ActiveKey::Single(ModelKey::form(0)),
            ResponseMode::Aggregated,
        )
        .unwrap();

    let points = [[2.0, 3.0], [-1.0, 0.5], [0.0, 4.0]];
    // Skip f1 of the first member to exercise partial requests.
    let set = ActiveSet::from_request(vec![1, 0, 1, 1, 1], vec![0, 1]).unwrap();
    let ids: Vec<EvalId> = points
        .iter()
        .map(|p| g.evaluate_nowait(ens, &Variables::new(p.to_vec()), &set).unwrap())
        .collect();

    let mut done = BTreeMap::new();
    for _ in 0..20 {
        done.extend(g.synchronize_nowait(ens).unwrap());
    }
    assert_eq!(done.len(), 3);
    for (id, p) in ids.iter().zip(&points) {
        let r = &done[id];
        let tb = text_book_values(p);
        assert_eq!(r.values(), &[tb[0], 0.0, tb[2], p[0] + p[1], p[0] * p[1]]);
    }
    assert_eq!(g.ensemble(ens).unwrap().n_outstanding(), 0);
}

#[test]
fn test_hierarchical_aggregation_orders_approximation_first() {
    let mut g = ModelGraph::new();
    let lo = add_direct(&mut g, "lo", DirectInterface::new("lo", Driver::Quadratic { centers: vec![0.0, 0.0] }), 2);
    let hi = add(&mut g, "hi", Box::<SumProduct>::default(), 2, 2);
    let ens = g
        .add_ensemble(
            "h",
            EnsembleKind::Hierarchical,
            vec![lo, hi],
            ActiveKey::Pair { truth: ModelKey::form(1), approx: ModelKey::form(0) },
            ResponseMode::Aggregated,
        )
        .unwrap();
    let r = g.evaluate(ens, &Variables::new(vec![1.0, 2.0]), &ActiveSet::new(3, 2)).unwrap();
    assert_eq!(r.values(), &[2.5, 3.0, 2.0]);
}

// ── Discrepancy and correction ──────────────────────────────────────────────

fn fidelity_pair(g: &mut ModelGraph, mode: ResponseMode) -> (ModelId, ModelId, ModelId) {
    let lo = add_direct(g, "lo", DirectInterface::new("lo", Driver::Quadratic { centers: vec![0.0, 0.0] }), 2);
    let hi = add_direct(g, "hi", DirectInterface::new("hi", Driver::Quadratic { centers: vec![1.0, 2.0] }), 2);
    for m in [lo, hi] {
        g.set_derivatives(m, DerivativeSettings::passthrough()).unwrap();
    }
    let ens = g
        .add_ensemble(
            "h",
            EnsembleKind::Hierarchical,
            vec![lo, hi],
            ActiveKey::Pair { truth: ModelKey::form(1), approx: ModelKey::form(0) },
            mode,
        )
        .unwrap();
    (lo, hi, ens)
}

#[test]
fn test_discrepancy_is_truth_minus_approximation() {
    let mut g = ModelGraph::new();
    let (_, _, ens) = fidelity_pair(&mut g, ResponseMode::Discrepancy);
    let set = ActiveSet::uniform(1, REQUEST_VALUE | 2, vec![0, 1]);
    let r = g.evaluate(ens, &Variables::new(vec![1.0, 1.0]), &set).unwrap();
    // ½((0)² + (-1)²) - ½(1 + 1)
    assert_relative_eq!(r.value(0), -0.5, epsilon = 1e-12);
    assert_eq!(r.gradient(0), &[-1.0, -2.0]);
}

#[test]
fn test_additive_correction_reproduces_linear_discrepancy() {
    let mut g = ModelGraph::new();
    let (_, _, ens) = fidelity_pair(&mut g, ResponseMode::AutoCorrected);
    g.set_correction(ens, CorrectionSettings { kind: CorrectionKind::Additive, order: 1 }).unwrap();

    // truth - approx = -c·x + ½|c|² is linear, so a first-order additive
    // correction makes the corrected approximation exact everywhere.
    let set = ActiveSet::new(1, 2);
    let at_build = g.evaluate(ens, &Variables::new(vec![0.5, 0.5]), &set).unwrap();
    assert_relative_eq!(at_build.value(0), 0.5 * (0.25 + 2.25), epsilon = 1e-12);
    let away = g.evaluate(ens, &Variables::new(vec![3.0, -1.0]), &set).unwrap();
    assert_relative_eq!(away.value(0), 6.5, epsilon = 1e-12);
    assert!(g.ensemble(ens).unwrap().correction().is_some_and(|c| c.is_computed()));
}

#[test]
fn test_discrepancy_mode_keeps_stored_correction() {
    let mut g = ModelGraph::new();
    let (_, _, ens) = fidelity_pair(&mut g, ResponseMode::AutoCorrected);
    g.set_correction(ens, CorrectionSettings { kind: CorrectionKind::Additive, order: 0 }).unwrap();
    let origin = Variables::new(vec![0.0, 0.0]);
    let set = ActiveSet::new(1, 2);

    g.recompute_correction(ens, &origin).unwrap();
    let before = g.evaluate(ens, &origin, &set).unwrap().value(0);
    assert_relative_eq!(before, 2.5, epsilon = 1e-12);

    g.set_response_mode(ens, ResponseMode::Discrepancy).unwrap();
    let delta = g.evaluate(ens, &Variables::new(vec![3.0, -1.0]), &set).unwrap();
    // ½(4 + 9) - ½(9 + 1)
    assert_relative_eq!(delta.value(0), 1.5, epsilon = 1e-12);

    g.set_response_mode(ens, ResponseMode::AutoCorrected).unwrap();
    let after = g.evaluate(ens, &origin, &set).unwrap().value(0);
    assert_relative_eq!(after, before, epsilon = 1e-12);
}

#[test]
fn test_corrected_mode_requires_settings() {
    let mut g = ModelGraph::new();
    let (_, _, ens) = fidelity_pair(&mut g, ResponseMode::AutoCorrected);
    assert!(g.evaluate(ens, &Variables::new(vec![0.0, 0.0]), &ActiveSet::new(1, 2)).is_err());
}

struct Recorder(Rc<RefCell<Vec<String>>>);

impl ParallelHooks for Recorder {
    fn activate(&mut self, mode: &str, sub_model: &str) {
        self.0.borrow_mut().push(format!("{mode}:{sub_model}"));
    }
}

#[test]
fn test_hooks_fire_before_each_member() {
    let mut g = ModelGraph::new();
    let (_, _, ens) = fidelity_pair(&mut g, ResponseMode::Discrepancy);
    let log = Rc::new(RefCell::new(Vec::new()));
    g.set_parallel_hooks(ens, Box::new(Recorder(Rc::clone(&log)))).unwrap();
    g.evaluate(ens, &Variables::new(vec![0.0, 0.0]), &ActiveSet::new(1, 2)).unwrap();
    assert_eq!(*log.borrow(), vec!["truth:hi".to_string(), "approx:lo".to_string()]);
}

#[test]
fn test_one_member_serves_both_levels() {
    let mut g = ModelGraph::new();
    // Level 0 adds Σx², level 1 is the plain quadratic.
    let q = DirectInterface::new("q", Driver::Quadratic { centers: vec![0.0, 0.0] })
        .with_levels(vec![1.0, 0.0])
        .asynchronous(Completion::Reverse, 1);
    let sim = add_direct(&mut g, "q", q, 2);
    let ens = g
        .add_ensemble(
            "levels",
            EnsembleKind::Hierarchical,
            vec![sim],
            ActiveKey::Pair { truth: ModelKey::with_level(0, 1), approx: ModelKey::with_level(0, 0) },
            ResponseMode::Discrepancy,
        )
        .unwrap();
    let set = ActiveSet::new(1, 2);

    let r = g.evaluate(ens, &Variables::new(vec![1.0, 1.0]), &set).unwrap();
    assert_relative_eq!(r.value(0), -2.0, epsilon = 1e-12);

    let a = g.evaluate_nowait(ens, &Variables::new(vec![2.0, 1.0]), &set).unwrap();
    let b = g.evaluate_nowait(ens, &Variables::new(vec![0.0, 3.0]), &set).unwrap();
    let done = g.synchronize(ens).unwrap();
    assert_eq!(done.len(), 2);
    assert_relative_eq!(done[&a].value(0), -5.0, epsilon = 1e-12);
    assert_relative_eq!(done[&b].value(0), -9.0, epsilon = 1e-12);
}

// ── Shared children ─────────────────────────────────────────────────────────

#[test]
fn test_shared_child_results_reach_their_own_parent() {
    let mut g = ModelGraph::new();
    let sim = add(&mut g, "sp", Box::<SumProduct>::default(), 2, 2);
    let key = ActiveKey::Single(ModelKey::form(0));
    let left = g
        .add_ensemble("left", EnsembleKind::NonHierarchical, vec![sim], key, ResponseMode::Bypass)
        .unwrap();
    let right = g
        .add_ensemble("right", EnsembleKind::NonHierarchical, vec![sim], key, ResponseMode::Bypass)
        .unwrap();

    let set = ActiveSet::new(2, 2);
    let l = g.evaluate_nowait(left, &Variables::new(vec![1.0, 2.0]), &set).unwrap();
    let r = g.evaluate_nowait(right, &Variables::new(vec![3.0, 4.0]), &set).unwrap();

    // Draining `left` pulls both child results; the other one is held back.
    let from_left = g.synchronize(left).unwrap();
    assert_eq!(from_left.len(), 1);
    assert_eq!(from_left[&l].values(), &[3.0, 2.0]);

    let from_right = g.synchronize(right).unwrap();
    assert_eq!(from_right.len(), 1);
    assert_eq!(from_right[&r].values(), &[7.0, 12.0]);
}

// ── Wrapper kinds ───────────────────────────────────────────────────────────

#[test]
fn test_recast_flips_sign_and_scales_gradient() {
    let mut g = ModelGraph::new();
    let q = add_direct(&mut g, "q", DirectInterface::new("q", Driver::Quadratic { centers: vec![0.0, 0.0] }), 2);
    g.set_derivatives(q, DerivativeSettings::passthrough()).unwrap();
    let map = RecastMap { scale: vec![2.0, 1.0], offset: vec![0.0, 1.0], weights: vec![-1.0] };
    let neg = g.add_recast("neg", q, map).unwrap();

    let set = ActiveSet::uniform(1, REQUEST_VALUE | 2, vec![0, 1]);
    let r = g.evaluate(neg, &Variables::new(vec![1.0, 1.0]), &set).unwrap();
    // sub point (2, 2): f = 4, ∇f = (2, 2)
    assert_eq!(r.value(0), -4.0);
    assert_eq!(r.gradient(0), &[-4.0, -2.0]);
}

#[test]
fn test_data_fit_built_lazily_then_rebuilt() {
    let mut g = ModelGraph::new();
    let rb = add_direct(&mut g, "rb", DirectInterface::new("rb", Driver::Rosenbrock), 2);
    g.set_derivatives(rb, DerivativeSettings::passthrough()).unwrap();
    let fit = g.add_data_fit("fit", rb, 2).unwrap();
    let set = ActiveSet::new(1, 2);

    let at_center = g.evaluate(fit, &Variables::new(vec![1.0, 1.0]), &set).unwrap();
    assert_eq!(at_center.value(0), 0.0);
    // Second-order expansion about the minimum: ½ dᵀ H d with H = [[802, -400], [-400, 200]].
    let r = g.evaluate(fit, &Variables::new(vec![1.1, 1.0]), &set).unwrap();
    assert_relative_eq!(r.value(0), 0.5 * 802.0 * 0.01, epsilon = 1e-9);

    g.build_approximation(fit, &Variables::new(vec![1.1, 1.0])).unwrap();
    let exact = g.evaluate(rb, &Variables::new(vec![1.1, 1.0]), &set).unwrap();
    let rebuilt = g.evaluate(fit, &Variables::new(vec![1.1, 1.0]), &set).unwrap();
    assert_relative_eq!(rebuilt.value(0), exact.value(0), epsilon = 1e-12);
}

/// Best of a fixed set of inner offsets.
struct BestOf(Vec<f64>);

impl SubIterator for BestOf {
    fn name(&self) -> &str {
        "best_of"
    }

    fn n_results(&self) -> usize {
        1
    }

    fn run(&mut self, sub: &mut SubModel<'_>, vars: &Variables) -> Result<Vec<f64>> {
        let set = sub.default_active_set();
        let mut best = f64::INFINITY;
        for &d in &self.0 {
            let r = sub.evaluate(&vars.shifted(&[(0, d)]), &set)?;
            best = best.min(r.value(0));
        }
        Ok(vec![best])
    }
}

#[test]
fn test_nested_model_maps_inner_results() {
    let mut g = ModelGraph::new();
    let q = add_direct(&mut g, "q", DirectInterface::new("q", Driver::Quadratic { centers: vec![1.0] }), 1);
    let nested = g
        .add_nested("best", q, 1, Box::new(BestOf(vec![-0.5, 0.0, 0.5])), DMatrix::from_row_slice(2, 1, &[1.0, -2.0]))
        .unwrap();
    assert_eq!(g.n_functions(nested), 2);

    let r = g.evaluate(nested, &Variables::new(vec![0.0]), &ActiveSet::new(2, 1)).unwrap();
    // best of ½(x-1)² over x ∈ {-0.5, 0, 0.5} is 0.125
    assert_eq!(r.values(), &[0.125, -0.25]);

    let id = g.evaluate_nowait(nested, &Variables::new(vec![1.0]), &ActiveSet::new(2, 1)).unwrap();
    let done = g.synchronize(nested).unwrap();
    assert_eq!(done[&id].values(), &[0.0, -0.0]);
}
