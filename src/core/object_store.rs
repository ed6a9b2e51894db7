//! Shared, write-once object store for task inputs and outputs.
//!
//! Entries are addressed by an [`ObjectKey`] built from the origin that
//! produced the value plus a store-wide sequence number, so two `put`s of the
//! same content always yield distinct entries. Values are never mutated after
//! insertion; only their reference and pin counters change.
//!
//! # Lifetime
//!
//! - `put` creates an entry with one reference, owned by whoever called it.
//! - `retain`/`release` move references between owners (task records, the
//!   client). `pin`/`unpin` mark an entry as needed by an unresolved task.
//! - [`ObjectStore::delete_if_unreferenced`] removes an entry once both
//!   counters are zero; owners call it right after giving up their share.
//!   Every subscriber of [`ObjectStore::subscribe_deletions`] is told about
//!   the deletion so worker-local replicas can drop their copies.

mod cache;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::core::error::RuntimeError;
use crate::core::task::WorkerId;

pub use cache::{CacheStats, WorkerCache};

/// Who produced a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectOrigin {
    /// Inserted by client code through `put` or argument promotion.
    Client,
    /// Produced as a task result by a worker.
    Worker(WorkerId),
}

/// Key of an entry in the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Producer of the value.
    pub origin: ObjectOrigin,
    /// Store-wide sequence number.
    pub seq: u64,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            ObjectOrigin::Client => write!(f, "obj-client-{}", self.seq),
            ObjectOrigin::Worker(id) => write!(f, "obj-w{id}-{}", self.seq),
        }
    }
}

/// A stored value plus its lifetime counters.
#[derive(Debug)]
struct ObjectEntry {
    value: Arc<Value>,
    size_bytes: usize,
    refs: usize,
    pins: usize,
}

impl ObjectEntry {
    const fn is_collectable(&self) -> bool {
        self.refs == 0 && self.pins == 0
    }
}

/// Point-in-time view of store usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Live entries.
    pub entries: usize,
    /// Encoded size of all live entries.
    pub bytes: usize,
    /// Total `put` calls.
    pub puts: u64,
    /// Total `get` calls against the shared map.
    pub gets: u64,
    /// Total entries deleted.
    pub deletes: u64,
}

#[derive(Debug, Default)]
struct StoreCounters {
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
}

/// Encoded size of a value, as used for the inlining threshold and stats.
///
/// # Errors
///
/// Returns `RuntimeError::Serialization` if the value cannot be encoded.
pub fn encoded_len(value: &Value) -> Result<usize, RuntimeError> {
    Ok(serde_json::to_vec(value)?.len())
}

/// Process-shared object store.
///
/// The key map sits behind a `RwLock`: reads share it, inserts and counter
/// updates take it exclusively for a short critical section.
#[derive(Debug, Default)]
pub struct ObjectStore {
    entries: RwLock<HashMap<ObjectKey, ObjectEntry>>,
    next_seq: AtomicU64,
    counters: StoreCounters,
    deletion_subscribers: Mutex<Vec<Sender<ObjectKey>>>,
}

impl ObjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value and return its key. The caller owns one reference.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Serialization` if the value cannot be encoded.
    pub fn put(&self, value: Value, origin: ObjectOrigin) -> Result<ObjectKey, RuntimeError> {
        let size_bytes = encoded_len(&value)?;
        Ok(self.put_sized(value, size_bytes, origin))
    }

    /// Store a value whose encoded size the caller already measured.
    pub(crate) fn put_sized(&self, value: Value, size_bytes: usize, origin: ObjectOrigin) -> ObjectKey {
        let key = ObjectKey {
            origin,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let entry = ObjectEntry {
            value: Arc::new(value),
            size_bytes,
            refs: 1,
            pins: 0,
        };
        self.entries.write().insert(key, entry);
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        trace!(%key, size_bytes, "object stored");
        key
    }

    /// Fetch a value.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::KeyNotFound` if the entry is absent or deleted.
    pub fn get(&self, key: ObjectKey) -> Result<Arc<Value>, RuntimeError> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        self.entries
            .read()
            .get(&key)
            .map(|entry| Arc::clone(&entry.value))
            .ok_or(RuntimeError::KeyNotFound(key))
    }

    /// Whether the key currently names a live entry.
    #[must_use]
    pub fn contains(&self, key: ObjectKey) -> bool {
        self.entries.read().contains_key(&key)
    }

    /// Add one reference.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::KeyNotFound` if the entry is absent.
    pub fn retain(&self, key: ObjectKey) -> Result<(), RuntimeError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&key).ok_or(RuntimeError::KeyNotFound(key))?;
        entry.refs += 1;
        Ok(())
    }

    /// Drop one reference. The entry stays until [`ObjectStore::delete_if_unreferenced`].
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::KeyNotFound` if the entry is absent.
    pub fn release(&self, key: ObjectKey) -> Result<(), RuntimeError> {
        self.adjust(key, |entry| entry.refs = entry.refs.saturating_sub(1))
    }

    /// Mark the entry as needed by an unresolved task.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::KeyNotFound` if the entry is absent.
    pub fn pin(&self, key: ObjectKey) -> Result<(), RuntimeError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&key).ok_or(RuntimeError::KeyNotFound(key))?;
        entry.pins += 1;
        Ok(())
    }

    /// Undo one `pin`. The entry stays until [`ObjectStore::delete_if_unreferenced`].
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::KeyNotFound` if the entry is absent.
    pub fn unpin(&self, key: ObjectKey) -> Result<(), RuntimeError> {
        self.adjust(key, |entry| entry.pins = entry.pins.saturating_sub(1))
    }

    /// Whether any unresolved task still needs the entry.
    #[must_use]
    pub fn is_pinned(&self, key: ObjectKey) -> bool {
        self.entries.read().get(&key).is_some_and(|entry| entry.pins > 0)
    }

    /// Current reference count, if the entry exists.
    #[must_use]
    pub fn ref_count(&self, key: ObjectKey) -> Option<usize> {
        self.entries.read().get(&key).map(|entry| entry.refs)
    }

    /// Delete the entry if it has no references and no pins.
    ///
    /// Returns `true` if the entry was removed by this call.
    pub fn delete_if_unreferenced(&self, key: ObjectKey) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            match entries.get(&key) {
                Some(entry) if entry.is_collectable() => entries.remove(&key).is_some(),
                _ => false,
            }
        };
        if removed {
            self.on_deleted(key);
        }
        removed
    }

    /// Receive the key of every entry deleted from now on.
    pub fn subscribe_deletions(&self) -> Receiver<ObjectKey> {
        let (tx, rx) = unbounded();
        self.deletion_subscribers.lock().push(tx);
        rx
    }

    /// Snapshot store usage.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let (entries, bytes) = {
            let map = self.entries.read();
            (map.len(), map.values().map(|e| e.size_bytes).sum())
        };
        StoreStats {
            entries,
            bytes,
            puts: self.counters.puts.load(Ordering::Relaxed),
            gets: self.counters.gets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
        }
    }

    fn adjust(&self, key: ObjectKey, update: impl FnOnce(&mut ObjectEntry)) -> Result<(), RuntimeError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&key).ok_or(RuntimeError::KeyNotFound(key))?;
        update(entry);
        Ok(())
    }

    fn on_deleted(&self, key: ObjectKey) {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        debug!(%key, "object deleted");
        // Subscribers whose receiver is gone (exited workers) are pruned here.
        self.deletion_subscribers
            .lock()
            .retain(|tx| tx.send(key).is_ok());
    }
}
