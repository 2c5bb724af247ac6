use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::stage::Stage;

/// What the registry records for one live workflow. The subprocess itself is
/// owned by the runner task; presence of this entry is the liveness signal.
#[derive(Clone, Debug, PartialEq)]
pub struct RunningEntry {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
}

/// The single source of truth for "is a workflow currently running for this
/// item." One mutex guards the process map and the label map together so the
/// two can never be observed in an inconsistent pairing: a key either has
/// both entries or neither.
#[derive(Debug, Default)]
pub struct RunningRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    processes: HashMap<String, RunningEntry>,
    labels: HashMap<String, String>,
}

impl RunningRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The critical sections below never panic while holding the guard, so
    /// poisoned data is still consistent; recover instead of propagating.
    fn locked(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a live workflow and its asserted running label under one lock
    /// acquisition. Returns `Err` if the key is already registered; callers
    /// must never double-dispatch an item.
    pub fn register(&self, key: &str, entry: RunningEntry, running_label: &str) -> Result<(), String> {
        let mut inner = self.locked();
        if inner.processes.contains_key(key) {
            return Err(format!("{} is already registered", key));
        }
        inner.processes.insert(key.to_string(), entry);
        inner.labels.insert(key.to_string(), running_label.to_string());
        Ok(())
    }

    /// Remove both entries atomically. Returns the removed pair, or `None`
    /// if the key was not registered.
    pub fn unregister(&self, key: &str) -> Option<(RunningEntry, String)> {
        let mut inner = self.locked();
        let entry = inner.processes.remove(key);
        let label = inner.labels.remove(key);
        match (entry, label) {
            (Some(e), Some(l)) => Some((e, l)),
            // Maps are only ever mutated together, so a half-present key
            // cannot occur; treat it as absent if it somehow does.
            _ => None,
        }
    }

    /// Whether a live workflow is registered for this key.
    pub fn is_running(&self, key: &str) -> bool {
        self.locked().processes.contains_key(key)
    }

    pub fn running_count(&self) -> usize {
        self.locked().processes.len()
    }

    /// Whether another workflow may be dispatched under the ceiling.
    pub fn has_capacity(&self, max_concurrent: u32) -> bool {
        self.running_count() < max_concurrent as usize
    }

    /// Snapshot of registered keys, for logging and shutdown reporting.
    pub fn active_keys(&self) -> Vec<String> {
        let inner = self.locked();
        let mut keys: Vec<String> = inner.processes.keys().cloned().collect();
        keys.sort();
        keys
    }
}
