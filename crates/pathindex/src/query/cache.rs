//! Bounded cache of compiled queries keyed by exact raw string.

use std::collections::VecDeque;
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::Mutex;

use crate::error::Result;

use super::matcher::CompiledQuery;

pub const DEFAULT_QUERY_CACHE_CAPACITY: usize = 64;

type CacheKey = (String, bool);

#[derive(Debug, Default)]
struct CacheState {
    entries: FnvHashMap<CacheKey, Arc<CompiledQuery>>,
    /// Insertion order, oldest first.
    order: VecDeque<CacheKey>,
}

/// FIFO cache so repeated strings (debounced retypes, back-and-forth edits)
/// are compiled once.
#[derive(Debug)]
pub struct QueryCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_CACHE_CAPACITY)
    }
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Returns the cached compilation of `raw`, compiling it on a miss.
    ///
    /// Syntax errors are returned and not cached.
    pub fn get_or_compile(&self, raw: &str, case_sensitive: bool) -> Result<Arc<CompiledQuery>> {
        let key = (raw.to_string(), case_sensitive);
        if let Some(hit) = self.state.lock().entries.get(&key) {
            return Ok(hit.clone());
        }

        let compiled = Arc::new(CompiledQuery::compile(raw, case_sensitive)?);

        let mut state = self.state.lock();
        if !state.entries.contains_key(&key) {
            while state.order.len() >= self.capacity {
                if let Some(oldest) = state.order.pop_front() {
                    state.entries.remove(&oldest);
                }
            }
            state.order.push_back(key.clone());
        }
        state.entries.insert(key, compiled.clone());
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_share_one_compilation() {
        let cache = QueryCache::new(4);
        let first = cache.get_or_compile("report", false).expect("compile");
        let second = cache.get_or_compile("report", false).expect("compile");
        assert!(Arc::ptr_eq(&first, &second));

        let sensitive = cache.get_or_compile("report", true).expect("compile");
        assert!(!Arc::ptr_eq(&first, &sensitive));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn oldest_entry_is_evicted_and_errors_are_not_cached() {
        let cache = QueryCache::new(2);
        let a = cache.get_or_compile("a", false).expect("compile");
        cache.get_or_compile("b", false).expect("compile");
        cache.get_or_compile("c", false).expect("compile");
        assert_eq!(cache.len(), 2);
        assert!(!Arc::ptr_eq(&a, &cache.get_or_compile("a", false).expect("compile")));

        assert!(cache.get_or_compile("\"open", false).is_err());
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}
