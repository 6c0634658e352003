//! Evaluation dispatcher: synchronous/asynchronous submission to an
//! [`Interface`], raw→external id rekeying and cache bookkeeping.
//!
//! Per evaluation: Dispatched → Pending(raw) → Rekeyed → [Cached if unmatched]
//! → Returned. Every external id handed out by [`EvaluationDispatcher::evaluate_nowait`]
//! is returned by exactly one later `synchronize*` call.

use crate::cache::EvaluationCache;
use mf_core::{
    ActiveSet, Error, EvalId, EvaluationObserver, EvaluationRecord, Interface, REQUEST_GRADIENT,
    REQUEST_HESSIAN, REQUEST_VALUE, Response, ResponseMap, Result, Variables,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Evaluation counts for one dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationCounters {
    /// Every request (sync + async).
    pub total: u64,
    /// Requests that reached the interface.
    pub new: u64,
    /// Requests answered from the evaluation cache.
    pub cache_hits: u64,
    /// Async requests answered by an identical evaluation already in flight.
    pub duplicates: u64,
    /// Function values requested.
    pub values: u64,
    /// Gradients requested.
    pub gradients: u64,
    /// Hessians requested.
    pub hessians: u64,
}

impl EvaluationCounters {
    fn count_request(&mut self, set: &ActiveSet) {
        self.total += 1;
        for &bits in set.request() {
            self.values += u64::from(bits & REQUEST_VALUE != 0);
            self.gradients += u64::from(bits & REQUEST_GRADIENT != 0);
            self.hessians += u64::from(bits & REQUEST_HESSIAN != 0);
        }
    }
}

struct PendingEval {
    origin: String,
    record: EvaluationRecord,
}

/// Front end to one collaborator interface.
pub struct EvaluationDispatcher {
    model: String,
    interface: Box<dyn Interface>,
    cache: Option<EvaluationCache>,
    resolution: Option<usize>,
    eval_counter: EvalId,
    raw_to_external: HashMap<EvalId, EvalId>,
    pending: BTreeMap<EvalId, PendingEval>,
    /// duplicate external id -> (source external id, requested set)
    duplicates: BTreeMap<EvalId, (EvalId, ActiveSet)>,
    /// Async requests answered from the cache at dispatch time.
    ready: ResponseMap,
    /// Results handed back through `cache_unmatched`.
    unmatched: ResponseMap,
    counters: EvaluationCounters,
    observer: Option<Box<dyn EvaluationObserver>>,
}

impl EvaluationDispatcher {
    /// Dispatcher for `interface`, using the process-wide evaluation cache.
    pub fn new(model: impl Into<String>, interface: Box<dyn Interface>) -> Self {
        Self {
            model: model.into(),
            interface,
            cache: Some(EvaluationCache::global().clone()),
            resolution: None,
            eval_counter: 0,
            raw_to_external: HashMap::new(),
            pending: BTreeMap::new(),
            duplicates: BTreeMap::new(),
            ready: ResponseMap::new(),
            unmatched: ResponseMap::new(),
            counters: EvaluationCounters::default(),
            observer: None,
        }
    }

    /// Use `cache` instead of the process-wide table (`None` disables caching).
    pub fn with_cache(mut self, cache: Option<EvaluationCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Attach an evaluation-store observer.
    pub fn with_observer(mut self, observer: Box<dyn EvaluationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Name of the owning model.
    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Underlying interface.
    pub fn interface(&self) -> &dyn Interface {
        self.interface.as_ref()
    }

    /// Evaluation counts so far.
    pub fn counters(&self) -> EvaluationCounters {
        self.counters
    }

    /// Last external id handed out.
    pub fn current_id(&self) -> EvalId {
        self.eval_counter
    }

    /// Number of evaluations still awaiting collection (including cache hits
    /// and duplicates not yet returned).
    pub fn n_outstanding(&self) -> usize {
        self.pending.len() + self.duplicates.len() + self.ready.len()
    }

    /// Metadata scalars per response.
    pub fn n_metadata(&self) -> usize {
        self.interface.n_metadata()
    }

    /// Re-assert the resolution level for subsequent evaluations.
    pub fn set_resolution(&mut self, level: usize) -> Result<()> {
        self.interface.set_resolution(level)?;
        self.resolution = Some(level);
        Ok(())
    }

    /// Cache origin: the interface plus its active resolution level.
    fn origin(&self) -> String {
        match self.resolution {
            Some(level) => format!("{}@{level}", self.interface.name()),
            None => self.interface.name().to_string(),
        }
    }

    fn next_id(&mut self, set: &ActiveSet) -> EvalId {
        self.eval_counter += 1;
        self.counters.count_request(set);
        self.eval_counter
    }

    /// Blocking evaluation (cache first, then the interface).
    pub fn evaluate(&mut self, vars: &Variables, set: &ActiveSet) -> Result<Response> {
        let id = self.next_id(set);
        let origin = self.origin();
        let mut record =
            EvaluationRecord { external_id: id, raw_id: 0, variables: vars.clone(), set: set.clone() };

        if let Some(hit) = self.lookup(vars, set, &origin) {
            log::debug!("{}: evaluation {id} answered from cache", self.model);
            self.notify_dispatch(&record);
            self.counters.cache_hits += 1;
            self.notify_complete(id, &hit);
            return Ok(hit);
        }

        let raw = self.interface.evaluate(vars, set)?;
        record.raw_id = self.interface.current_id();
        self.notify_dispatch(&record);
        log::debug!("{}: evaluation {id} (raw {})", self.model, record.raw_id);
        let response = self.finish(&origin, &record, raw)?;
        self.counters.new += 1;
        self.notify_complete(id, &response);
        Ok(response)
    }

    /// Non-blocking evaluation; the result is returned by a later `synchronize*`.
    pub fn evaluate_nowait(&mut self, vars: &Variables, set: &ActiveSet) -> Result<EvalId> {
        if !self.interface.supports_async() {
            return Err(Error::Configuration(format!(
                "model '{}': interface '{}' cannot evaluate asynchronously",
                self.model,
                self.interface.name()
            )));
        }
        let id = self.next_id(set);
        let origin = self.origin();
        let mut record =
            EvaluationRecord { external_id: id, raw_id: 0, variables: vars.clone(), set: set.clone() };

        if let Some(hit) = self.lookup(vars, set, &origin) {
            self.notify_dispatch(&record);
            self.counters.cache_hits += 1;
            self.ready.insert(id, hit);
            return Ok(id);
        }

        let key = vars.key_bits();
        let in_flight = self
            .pending
            .iter()
            .find(|(_, p)| {
                p.origin == origin && p.record.set.covers(set) && p.record.variables.key_bits() == key
            })
            .map(|(&source, _)| source);
        if let Some(source) = in_flight {
            log::debug!("{}: evaluation {id} duplicates in-flight {source}", self.model);
            self.notify_dispatch(&record);
            self.counters.duplicates += 1;
            self.duplicates.insert(id, (source, set.clone()));
            return Ok(id);
        }

        record.raw_id = self.interface.evaluate_nowait(vars, set)?;
        self.notify_dispatch(&record);
        self.raw_to_external.insert(record.raw_id, id);
        self.pending.insert(id, PendingEval { origin, record });
        Ok(id)
    }

    /// Block until every outstanding evaluation is complete.
    pub fn synchronize(&mut self) -> Result<ResponseMap> {
        let raw = if self.pending.is_empty() { ResponseMap::new() } else { self.interface.synchronize()? };
        let mut out = self.collect(raw)?;
        if !self.pending.is_empty() {
            let ids: Vec<EvalId> = self.pending.keys().copied().collect();
            return Err(Error::Computation(format!(
                "model '{}': interface '{}' finished synchronize without evaluations {ids:?}",
                self.model,
                self.interface.name()
            )));
        }
        out.append(&mut self.ready);
        out.append(&mut self.unmatched);
        Ok(out)
    }

    /// Return whatever is complete now; never blocks.
    pub fn synchronize_nowait(&mut self) -> Result<ResponseMap> {
        let raw = if self.pending.is_empty() {
            ResponseMap::new()
        } else {
            self.interface.synchronize_nowait()?
        };
        let mut out = self.collect(raw)?;
        out.append(&mut self.ready);
        out.append(&mut self.unmatched);
        Ok(out)
    }

    /// Hold a collected result back for the next `synchronize*` call.
    pub fn cache_unmatched(&mut self, id: EvalId, response: Response) {
        self.unmatched.insert(id, response);
    }

    fn collect(&mut self, raw: ResponseMap) -> Result<ResponseMap> {
        let mut out = ResponseMap::new();
        for (raw_id, response) in raw {
            let id = self.raw_to_external.remove(&raw_id).ok_or_else(|| {
                Error::Computation(format!(
                    "model '{}': interface '{}' returned unknown evaluation {raw_id}",
                    self.model,
                    self.interface.name()
                ))
            })?;
            let Some(PendingEval { origin, record }) = self.pending.remove(&id) else {
                return Err(Error::Computation(format!(
                    "model '{}': no record for evaluation {id}",
                    self.model
                )));
            };
            let response = self.finish(&origin, &record, response)?;
            self.counters.new += 1;
            self.notify_complete(id, &response);

            let dups: Vec<EvalId> =
                self.duplicates.iter().filter(|(_, (src, _))| *src == id).map(|(&d, _)| d).collect();
            for dup in dups {
                if let Some((_, set)) = self.duplicates.remove(&dup) {
                    let copy = response.extract(&set)?;
                    self.notify_complete(dup, &copy);
                    out.insert(dup, copy);
                }
            }
            log::debug!("{}: collected evaluation {id} (raw {raw_id})", self.model);
            out.insert(id, response);
        }
        Ok(out)
    }

    /// Validate the raw response, store it in the cache, restrict it to the request.
    fn finish(
        &mut self,
        origin: &str,
        record: &EvaluationRecord,
        raw: Response,
    ) -> Result<Response> {
        if raw.n_functions() != record.set.n_functions() {
            return Err(Error::ShapeMismatch(format!(
                "model '{}': interface '{}' returned {} functions, expected {}",
                self.model,
                self.interface.name(),
                raw.n_functions(),
                record.set.n_functions()
            )));
        }
        let response = raw.extract(&record.set)?;
        if let Some(cache) = &self.cache {
            cache.insert(origin, &record.variables, raw);
        }
        Ok(response)
    }

    fn lookup(&self, vars: &Variables, set: &ActiveSet, origin: &str) -> Option<Response> {
        self.cache.as_ref()?.lookup(vars, set, origin)
    }

    fn notify_dispatch(&mut self, record: &EvaluationRecord) {
        if let Some(obs) = self.observer.as_mut()
            && let Err(e) = obs.on_dispatch(&self.model, record)
        {
            log::warn!("{}: evaluation store rejected dispatch {}: {e}", self.model, record.external_id);
        }
    }

    fn notify_complete(&mut self, id: EvalId, response: &Response) {
        if let Some(obs) = self.observer.as_mut()
            && let Err(e) = obs.on_complete(&self.model, id, response)
        {
            log::warn!("{}: evaluation store rejected completion {id}: {e}", self.model);
        }
    }
}

impl std::fmt::Debug for EvaluationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationDispatcher")
            .field("model", &self.model)
            .field("interface", &self.interface.name())
            .field("outstanding", &self.n_outstanding())
            .finish()
    }
}
