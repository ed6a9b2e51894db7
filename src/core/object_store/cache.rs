//! Worker-local replica of object store entries.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use serde::Serialize;
use serde_json::Value;

use super::{ObjectKey, ObjectStore};
use crate::core::error::RuntimeError;

/// Local hit/miss counters for one worker cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups served locally.
    pub hits: u64,
    /// Lookups that had to fetch from the shared store.
    pub misses: u64,
    /// Local copies dropped because the entry was deleted.
    pub invalidations: u64,
}

/// Lookup-or-fetch wrapper owned by a single worker.
///
/// Entries are immutable, so a cached copy only goes stale when the entry is
/// deleted; deletions arrive on the store's notification channel and are
/// applied before every lookup and whenever the owner calls
/// [`WorkerCache::apply_deletions`].
pub struct WorkerCache {
    store: Arc<ObjectStore>,
    local: HashMap<ObjectKey, Arc<Value>>,
    deletions: Receiver<ObjectKey>,
    stats: CacheStats,
}

impl WorkerCache {
    /// Create a cache subscribed to the store's deletions.
    #[must_use]
    pub fn new(store: Arc<ObjectStore>) -> Self {
        let deletions = store.subscribe_deletions();
        Self {
            store,
            local: HashMap::new(),
            deletions,
            stats: CacheStats::default(),
        }
    }

    /// Return the value for `key`, fetching it from the shared store on first access.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::KeyNotFound` if the entry was deleted or never existed.
    pub fn get(&mut self, key: ObjectKey) -> Result<Arc<Value>, RuntimeError> {
        self.apply_deletions();
        if let Some(value) = self.local.get(&key) {
            self.stats.hits += 1;
            return Ok(Arc::clone(value));
        }
        let value = self.store.get(key)?;
        self.stats.misses += 1;
        self.local.insert(key, Arc::clone(&value));
        Ok(value)
    }

    /// Number of locally held entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.local.len()
    }

    /// Whether nothing is cached locally.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Hit/miss counters.
    #[must_use]
    pub const fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Drain pending deletion notices, dropping local copies of deleted
    /// entries. Returns how many local copies were dropped.
    pub fn apply_deletions(&mut self) -> usize {
        let mut dropped = 0;
        for key in self.deletions.try_iter() {
            if self.local.remove(&key).is_some() {
                self.stats.invalidations += 1;
                dropped += 1;
            }
        }
        dropped
    }
}
