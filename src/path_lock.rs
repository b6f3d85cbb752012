//! Advisory mutual exclusion keyed by name.
//!
//! Serializes (a) agent read loops and (b) dumper flushes on a path without
//! blocking contenders: `try_lock` reports promptly and the loser skips its
//! turn. Locks are non-reentrant; releasing happens when the guard drops.

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};

#[derive(Clone, Debug, Default)]
pub struct PathLocks {
    locks: Arc<DashMap<String, ()>>,
}

impl PathLocks {
    pub fn new() -> PathLocks {
        PathLocks::default()
    }

    /// Attempt to take the named lock. Returns `None` when another holder
    /// has it.
    pub fn try_lock(&self, name: &str) -> Option<PathLockGuard> {
        match self.locks.entry(name.to_owned()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                entry.insert(());
                Some(PathLockGuard {
                    locks: Arc::clone(&self.locks),
                    name: name.to_owned(),
                })
            }
        }
    }
}

/// Held lock on a name; dropping it releases the lock.
#[derive(Debug)]
pub struct PathLockGuard {
    locks: Arc<DashMap<String, ()>>,
    name: String,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        self.locks.remove(&self.name);
    }
}
