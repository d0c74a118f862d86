//! # Per-Namespace Process Gates
//!
//! A connect handshake for a namespace must not race the dispatch of inbound
//! events referring to the same namespace. Each namespace name gets a lazily
//! created, reference-counted gate: the side running a connect holds it
//! exclusively, inbound dispatch waits on it with a shared acquisition that
//! is released immediately. Gates are removed once the last user lets go.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

struct GateEntry {
    lock: Arc<RwLock<()>>,
    refs: usize,
}

pub(crate) struct ProcessGates {
    gates: Mutex<HashMap<String, GateEntry>>,
}

impl ProcessGates {
    pub(crate) fn new() -> Self {
        Self {
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn checkout(&self, name: &str) -> Arc<RwLock<()>> {
        let mut gates = self.gates.lock();
        let entry = gates.entry(name.to_string()).or_insert_with(|| GateEntry {
            lock: Arc::new(RwLock::new(())),
            refs: 0,
        });
        entry.refs += 1;
        entry.lock.clone()
    }

    fn release(&self, name: &str) {
        let mut gates = self.gates.lock();
        if let Some(entry) = gates.get_mut(name) {
            entry.refs -= 1;
            if entry.refs == 0 {
                gates.remove(name);
            }
        }
    }

    /// Acquires the gate exclusively. The returned guard unblocks waiters on
    /// drop. At most one exclusive holder per name at a time.
    pub(crate) async fn start(&self, name: &str) -> GateGuard<'_> {
        let lock = self.checkout(name);
        let permit = lock.write_owned().await;
        GateGuard {
            gates: self,
            name: name.to_string(),
            _permit: permit,
        }
    }

    /// Waits until no exclusive holder is active for the name. Unbounded
    /// concurrent callers pass through immediately when the gate is free.
    pub(crate) async fn wait(&self, name: &str) {
        let lock = self.checkout(name);
        drop(lock.read().await);
        self.release(name);
    }

    /// Reports whether an exclusive holder is currently active for the name.
    pub(crate) fn is_held(&self, name: &str) -> bool {
        let gates = self.gates.lock();
        gates
            .get(name)
            .map(|entry| entry.lock.try_read().is_err())
            .unwrap_or(false)
    }
}

pub(crate) struct GateGuard<'a> {
    gates: &'a ProcessGates,
    name: String,
    _permit: OwnedRwLockWriteGuard<()>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gates.release(&self.name);
    }
}
