//! Process-wide evaluation cache.
//!
//! Exact-match duplicate suppression keyed on (origin, variable values). A stored
//! response satisfies a request when its active set *covers* the request, i.e.
//! a record that computed more than is asked for now is a valid hit.
//! The table is append-only: nothing is ever evicted or overwritten.

use mf_core::{ActiveSet, Response, Variables};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Shared handle to an append-only evaluation table.
///
/// Clones share the same table. [`EvaluationCache::global`] is the single
/// table used by models unless they are given an isolated one.
#[derive(Clone, Default)]
pub struct EvaluationCache {
    table: Arc<Mutex<CacheTable>>,
}

#[derive(Default)]
struct CacheTable {
    entries: Vec<CacheEntry>,
    index: HashMap<(String, Vec<u64>), Vec<usize>>,
}

struct CacheEntry {
    response: Response,
}

impl EvaluationCache {
    /// Create an isolated, empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide table.
    pub fn global() -> &'static EvaluationCache {
        static GLOBAL: OnceLock<EvaluationCache> = OnceLock::new();
        GLOBAL.get_or_init(EvaluationCache::new)
    }

    /// Find a stored evaluation of `vars` from `origin` that covers `set`.
    ///
    /// The returned response is re-shaped to `set` (derivative columns remapped,
    /// unrequested quantities zeroed). The most recent matching entry wins.
    pub fn lookup(&self, vars: &Variables, set: &ActiveSet, origin: &str) -> Option<Response> {
        let table = self.lock();
        let slots = table.index.get(&(origin.to_string(), vars.key_bits()))?;
        slots
            .iter()
            .rev()
            .map(|&k| &table.entries[k].response)
            .find(|r| r.active_set().covers(set))
            .and_then(|r| r.extract(set).ok())
    }

    /// Append a completed evaluation. Visible to lookups once this returns.
    pub fn insert(&self, origin: &str, vars: &Variables, response: Response) {
        let mut table = self.lock();
        let slot = table.entries.len();
        table.entries.push(CacheEntry { response });
        table.index.entry((origin.to_string(), vars.key_bits())).or_default().push(slot);
    }

    /// Number of stored evaluations.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// `true` when nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, CacheTable> {
        // Entries are written whole under the lock; a poisoned guard still holds a
        // consistent table.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for EvaluationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationCache").field("len", &self.len()).finish()
    }
}
