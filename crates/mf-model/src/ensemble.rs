//! Fidelity composition over an ensemble of keyed sub-models.
//!
//! An [`EnsembleModel`] routes one logical evaluation to the members selected
//! by its [`ActiveKey`] and [`ResponseMode`], then recombines their responses.
//! Asynchronous requests become pending composites that are emitted only when
//! every contributing member response has arrived.

use crate::correction::{CorrectionKind, CorrectionSettings, DiscrepancyCorrection};
use crate::graph::ModelId;
use mf_core::{
    ActiveKey, ActiveSet, Error, EvalId, ModelKey, ParallelHooks, REQUEST_GRADIENT,
    REQUEST_HESSIAN, REQUEST_VALUE, Response, Result, Variables, split_active_set,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// How member responses become the ensemble response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// The approximation, passed through.
    #[default]
    Uncorrected,
    /// The approximation with the stored discrepancy correction applied.
    AutoCorrected,
    /// The truth model, passed through.
    Bypass,
    /// The discrepancy between truth and approximation.
    Discrepancy,
    /// Every contributing member, concatenated at fixed offsets.
    Aggregated,
}

impl ResponseMode {
    fn needs_pair(self) -> bool {
        matches!(self, Self::AutoCorrected | Self::Discrepancy)
    }
}

/// Member relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsembleKind {
    /// Ordered fidelity hierarchy; keys pick a truth and an approximation.
    Hierarchical,
    /// Unordered peers; aggregation covers every member.
    NonHierarchical,
}

/// One member's part in a composite evaluation.
#[derive(Debug, Clone)]
pub(crate) struct Role {
    pub model: ModelId,
    pub level: Option<usize>,
    pub label: &'static str,
    pub fn_offset: usize,
    pub meta_offset: usize,
    pub set: ActiveSet,
}

impl Role {
    pub fn is_active(&self) -> bool {
        !self.set.is_empty()
    }
}

/// Routing of one composite evaluation.
#[derive(Debug, Clone)]
pub(crate) struct CompositePlan {
    pub roles: Vec<Role>,
    pub n_metadata: usize,
}

#[derive(Debug)]
struct PendingComposite {
    vars: Variables,
    set: ActiveSet,
    plan: CompositePlan,
    parts: Vec<Option<Response>>,
}

impl PendingComposite {
    fn is_complete(&self) -> bool {
        self.plan.roles.iter().zip(&self.parts).all(|(role, part)| !role.is_active() || part.is_some())
    }
}

/// Ensemble state: members, active key, mode, corrections and in-flight
/// composites.
pub struct EnsembleModel {
    kind: EnsembleKind,
    members: Vec<ModelId>,
    key: ActiveKey,
    mode: ResponseMode,
    correction: Option<CorrectionSettings>,
    corrections: HashMap<(ModelKey, ModelKey), DiscrepancyCorrection>,
    hooks: Option<Box<dyn ParallelHooks>>,
    eval_counter: EvalId,
    pending: BTreeMap<EvalId, PendingComposite>,
    routes: HashMap<(ModelId, EvalId), (EvalId, usize)>,
}

impl EnsembleModel {
    /// Ensemble over `members` (key forms index into this list).
    pub fn new(
        kind: EnsembleKind,
        members: Vec<ModelId>,
        key: ActiveKey,
        mode: ResponseMode,
    ) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::Configuration("ensemble without members".into()));
        }
        let ensemble = Self {
            kind,
            members,
            key,
            mode,
            correction: None,
            corrections: HashMap::new(),
            hooks: None,
            eval_counter: 0,
            pending: BTreeMap::new(),
            routes: HashMap::new(),
        };
        ensemble.validate(&ensemble.key, mode)?;
        Ok(ensemble)
    }

    /// Member relationship.
    pub fn kind(&self) -> EnsembleKind {
        self.kind
    }

    /// Member models in declaration order.
    pub fn members(&self) -> &[ModelId] {
        &self.members
    }

    /// Active key.
    pub fn key(&self) -> &ActiveKey {
        &self.key
    }

    /// Active response mode.
    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    /// Select a different key.
    pub fn set_key(&mut self, key: ActiveKey) -> Result<()> {
        self.validate(&key, self.mode)?;
        self.key = key;
        Ok(())
    }

    /// Select a different response mode.
    pub fn set_mode(&mut self, mode: ResponseMode) -> Result<()> {
        self.validate(&self.key, mode)?;
        self.mode = mode;
        Ok(())
    }

    /// Correction kind/order used by the corrected and discrepancy modes.
    pub fn set_correction(&mut self, settings: CorrectionSettings) -> Result<()> {
        DiscrepancyCorrection::new(settings)?;
        self.correction = Some(settings);
        self.corrections.clear();
        Ok(())
    }

    /// Install parallel-topology activation hooks.
    pub fn set_hooks(&mut self, hooks: Box<dyn ParallelHooks>) {
        self.hooks = Some(hooks);
    }

    /// Stored correction for the active key pair, if computed.
    pub fn correction(&self) -> Option<&DiscrepancyCorrection> {
        self.corrections.get(&self.pair().ok()?)
    }

    fn validate(&self, key: &ActiveKey, mode: ResponseMode) -> Result<()> {
        let keys = [key.truth(), key.approx()];
        if let Some(bad) = keys.iter().find(|k| k.form >= self.members.len()) {
            return Err(Error::Configuration(format!(
                "key {bad} selects form {} but the ensemble has {} members",
                bad.form,
                self.members.len()
            )));
        }
        if mode.needs_pair() && !key.is_pair() {
            return Err(Error::Configuration(format!(
                "{mode:?} mode needs a (truth, approximation) key pair"
            )));
        }
        Ok(())
    }

    fn pair(&self) -> Result<(ModelKey, ModelKey)> {
        if !self.key.is_pair() {
            return Err(Error::Configuration("active key is not a (truth, approximation) pair".into()));
        }
        Ok((self.key.truth(), self.key.approx()))
    }

    /// Member selected by `key` (validated on every key change).
    pub fn member(&self, key: ModelKey) -> ModelId {
        self.members[key.form]
    }

    /// Members contributing to the output, in offset order.
    pub(crate) fn layout(&self) -> Vec<(ModelKey, &'static str)> {
        match (self.mode, self.kind) {
            (ResponseMode::Aggregated, EnsembleKind::NonHierarchical) => {
                (0..self.members.len()).map(|k| (ModelKey::form(k), "member")).collect()
            }
            (ResponseMode::Aggregated, EnsembleKind::Hierarchical) if self.key.is_pair() => {
                vec![(self.key.approx(), "approx"), (self.key.truth(), "truth")]
            }
            (ResponseMode::Uncorrected | ResponseMode::AutoCorrected, _) => {
                vec![(self.key.approx(), "approx")]
            }
            _ => vec![(self.key.truth(), "truth")],
        }
    }

    /// Route `set`; `sizes(model)` gives a member's (functions, metadata).
    pub(crate) fn plan(
        &self,
        set: &ActiveSet,
        sizes: impl Fn(ModelId) -> (usize, usize),
    ) -> Result<CompositePlan> {
        let role = |key: ModelKey, label, fn_offset, meta_offset, set: ActiveSet| Role {
            model: self.member(key),
            level: key.level,
            label,
            fn_offset,
            meta_offset,
            set,
        };
        let mut roles = Vec::new();
        let mut n_metadata = 0;
        match self.mode {
            ResponseMode::Aggregated => {
                let layout = self.layout();
                let fn_sizes: Vec<usize> = layout.iter().map(|(k, _)| sizes(self.member(*k)).0).collect();
                let parts = split_active_set(set, &fn_sizes)?;
                let mut fn_offset = 0;
                for ((key, label), part) in layout.into_iter().zip(parts) {
                    let (n_fns, n_meta) = sizes(self.member(key));
                    roles.push(role(key, label, fn_offset, n_metadata, part));
                    fn_offset += n_fns;
                    n_metadata += n_meta;
                }
            }
            ResponseMode::Discrepancy => {
                let (truth, approx) = self.pair()?;
                self.check_same_size(set, &sizes, truth, approx)?;
                n_metadata = sizes(self.member(truth)).1;
                roles.push(role(truth, "truth", 0, 0, set.clone()));
                roles.push(role(approx, "approx", 0, 0, set.clone()));
            }
            ResponseMode::AutoCorrected => {
                let (truth, approx) = self.pair()?;
                self.check_same_size(set, &sizes, truth, approx)?;
                let settings = self.correction.ok_or_else(|| {
                    Error::Configuration("corrected mode without correction settings".into())
                })?;
                n_metadata = sizes(self.member(approx)).1;
                roles.push(role(approx, "approx", 0, 0, augment(set, settings.kind)));
            }
            ResponseMode::Uncorrected | ResponseMode::Bypass => {
                let (key, label) = self.layout()[0];
                n_metadata = sizes(self.member(key)).1;
                roles.push(role(key, label, 0, 0, set.clone()));
            }
        }
        Ok(CompositePlan { roles, n_metadata })
    }

    fn check_same_size(
        &self,
        set: &ActiveSet,
        sizes: &impl Fn(ModelId) -> (usize, usize),
        truth: ModelKey,
        approx: ModelKey,
    ) -> Result<()> {
        let (t, a) = (sizes(self.member(truth)).0, sizes(self.member(approx)).0);
        if t != a || set.n_functions() != t {
            return Err(Error::ShapeMismatch(format!(
                "truth {truth} has {t} functions, approximation {approx} has {a}, request has {}",
                set.n_functions()
            )));
        }
        Ok(())
    }

    /// Fire the activation hook for a role.
    pub(crate) fn activate(&mut self, label: &str, sub_model: &str) {
        if let Some(hooks) = &mut self.hooks {
            hooks.activate(label, sub_model);
        }
    }

    /// Whether the corrected mode still lacks a correction for the active pair.
    pub(crate) fn needs_correction(&self) -> bool {
        self.mode == ResponseMode::AutoCorrected
            && self.pair().is_ok_and(|pair| {
                self.corrections.get(&pair).is_none_or(|c| !c.is_computed())
            })
    }

    /// Correction slot for the active pair (created on first use).
    pub(crate) fn correction_mut(&mut self) -> Result<&mut DiscrepancyCorrection> {
        let pair = self.pair()?;
        let settings = self.correction.unwrap_or_default();
        if !self.corrections.contains_key(&pair) {
            self.corrections.insert(pair, DiscrepancyCorrection::new(settings)?);
        }
        self.corrections
            .get_mut(&pair)
            .ok_or_else(|| Error::Computation("correction slot vanished".into()))
    }

    /// Recombine member responses (one slot per role, `None` for inactive roles).
    pub(crate) fn combine(
        &mut self,
        plan: &CompositePlan,
        vars: &Variables,
        set: &ActiveSet,
        parts: Vec<Option<Response>>,
    ) -> Result<Response> {
        let mut parts = parts.into_iter();
        let mut next = |what: &str| {
            parts.next().flatten().ok_or_else(|| {
                Error::Computation(format!("ensemble combine: missing {what} response"))
            })
        };
        match self.mode {
            ResponseMode::Aggregated => {
                let mut out = Response::new(set.clone(), plan.n_metadata);
                for role in &plan.roles {
                    match next(role.label) {
                        Ok(part) => out.update_partial(role.fn_offset, role.meta_offset, &part)?,
                        Err(_) if !role.is_active() => {}
                        Err(e) => return Err(e),
                    }
                }
                out.reset_inactive();
                Ok(out)
            }
            ResponseMode::Discrepancy => {
                let truth = next("truth")?;
                let approx = next("approx")?;
                let kind = self.correction.unwrap_or_default().kind;
                let delta = DiscrepancyCorrection::discrepancy(kind, &truth, &approx)?;
                let mut out = delta.extract(set)?;
                let k = out.metadata().len().min(truth.metadata().len());
                out.metadata_mut()[..k].copy_from_slice(&truth.metadata()[..k]);
                Ok(out)
            }
            ResponseMode::AutoCorrected => {
                let mut approx = next("approx")?;
                self.correction_mut()?.apply(vars, &mut approx)?;
                approx.extract(set)
            }
            ResponseMode::Uncorrected | ResponseMode::Bypass => next("member")?.extract(set),
        }
    }

    pub(crate) fn next_id(&mut self) -> EvalId {
        self.eval_counter += 1;
        self.eval_counter
    }

    /// Most recently issued id.
    pub fn current_id(&self) -> EvalId {
        self.eval_counter
    }

    /// Outstanding composites.
    pub fn n_outstanding(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn register(&mut self, id: EvalId, vars: &Variables, set: &ActiveSet, plan: CompositePlan) {
        let parts = vec![None; plan.roles.len()];
        self.pending.insert(id, PendingComposite { vars: vars.clone(), set: set.clone(), plan, parts });
    }

    pub(crate) fn route(&mut self, child: ModelId, child_id: EvalId, id: EvalId, role: usize) {
        self.routes.insert((child, child_id), (id, role));
    }

    /// Children with responses still owed to this ensemble.
    pub(crate) fn children_in_flight(&self) -> BTreeSet<ModelId> {
        self.routes.keys().map(|&(child, _)| child).collect()
    }

    /// Attach a child response to its composite; unrecognized responses are
    /// handed back.
    pub(crate) fn deliver(&mut self, child: ModelId, child_id: EvalId, response: Response) -> Option<Response> {
        let Some((id, role)) = self.routes.remove(&(child, child_id)) else {
            return Some(response);
        };
        match self.pending.get_mut(&id) {
            Some(pending) => {
                pending.parts[role] = Some(response);
                None
            }
            None => Some(response),
        }
    }

    /// Combine and remove every complete composite, in id order.
    pub(crate) fn drain_complete(&mut self) -> Result<Vec<(EvalId, Response)>> {
        let ready: Vec<EvalId> =
            self.pending.iter().filter(|(_, p)| p.is_complete()).map(|(&id, _)| id).collect();
        let mut out = Vec::with_capacity(ready.len());
        for id in ready {
            if let Some(p) = self.pending.remove(&id) {
                let response = self.combine(&p.plan, &p.vars, &p.set, p.parts)?;
                out.push((id, response));
            }
        }
        Ok(out)
    }
}

/// Extra quantities the approximation must supply for a correction.
fn augment(set: &ActiveSet, kind: CorrectionKind) -> ActiveSet {
    if kind == CorrectionKind::Additive {
        return set.clone();
    }
    let mut out = set.clone();
    for i in 0..set.n_functions() {
        let bits = set.get(i);
        if bits != 0 {
            out.insert(i, REQUEST_VALUE);
        }
        if bits & REQUEST_HESSIAN != 0 {
            out.insert(i, REQUEST_GRADIENT);
        }
    }
    out
}

impl std::fmt::Debug for EnsembleModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnsembleModel")
            .field("kind", &self.kind)
            .field("members", &self.members)
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("pending", &self.pending.len())
            .finish()
    }
}
