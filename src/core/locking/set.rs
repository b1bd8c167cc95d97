use super::lock::{LockGuard, SharedLock};
use crate::core::errors::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// A sentinel meaning "every name currently known to the set", resolved at
/// acquire time by sorting the names and acquiring each in order (§4.3:
/// "acquiring the whole set is done by acquiring a set-level lock ... and
/// then iterating names in sorted order").
pub enum LockSpec<'a> {
    Names(&'a [String]),
    All,
}

/// A level's named lock collection: `cluster`, `instance`, or `node`.
/// Grounded on Ganeti's `LockSet`, and on the teacher's
/// `database/locking.rs` idiom of acquiring multiple guards in sorted
/// order to avoid deadlock between concurrent multi-name acquirers.
#[derive(Debug, Default)]
pub struct LockSet {
    locks: DashMap<String, Arc<SharedLock>>,
}

impl LockSet {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Adding a lock while holding set-level exclusive is allowed per
    /// §4.3; this type does not itself enforce the caller's level
    /// discipline (that is `LockManager`'s job), it only guarantees the
    /// insert is idempotent.
    pub fn add(&self, name: impl Into<String>) -> Arc<SharedLock> {
        let name = name.into();
        self.locks
            .entry(name.clone())
            .or_insert_with(|| SharedLock::new(name))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<SharedLock>> {
        self.locks.get(name).map(|e| e.clone())
    }

    /// Removing a lock requires holding it exclusively or holding nothing
    /// at that level (§4.3); enforcement of that precondition is the
    /// caller's responsibility (typically `LockManager`), this method just
    /// performs the removal and deletes the underlying lock so any
    /// lingering waiters observe "deleted".
    pub async fn remove(&self, name: &str) -> Result<()> {
        if let Some((_, lock)) = self.locks.remove(name) {
            lock.delete().await?;
        }
        Ok(())
    }

    pub fn names_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.locks.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Acquires a set of named locks, or the whole set, in sorted order —
    /// the discipline that prevents two multi-name acquirers from
    /// deadlocking against each other.
    pub async fn acquire(
        &self,
        spec: LockSpec<'_>,
        exclusive: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<LockGuard>> {
        let mut names: Vec<String> = match spec {
            LockSpec::Names(n) => n.to_vec(),
            LockSpec::All => self.names_sorted(),
        };
        names.sort();
        names.dedup();

        let mut guards = Vec::with_capacity(names.len());
        for name in &names {
            let lock = self.get(name).unwrap_or_else(|| self.add(name.clone()));
            let guard = if exclusive {
                lock.acquire_exclusive(timeout).await
            } else {
                lock.acquire_shared(timeout).await
            };
            match guard {
                Ok(g) => guards.push(g),
                Err(e) => {
                    // Partial acquisition is rolled back on failure
                    // (guards drop here, releasing anything already held).
                    return Err(e);
                }
            }
        }
        Ok(guards)
    }
}
