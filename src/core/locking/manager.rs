use super::lock::LockGuard;
use super::set::{LockSet, LockSpec};
use crate::core::errors::{GanetiError, Result};
use crate::core::metrics;
use std::time::{Duration, Instant};

pub const BGL_NAME: &str = "BGL";

/// The three totally-ordered lock levels (§4.3): `Cluster < Instance <
/// Node`. `Ord` derives in declaration order so comparisons read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    Cluster,
    Instance,
    Node,
}

/// Tracks, for one logical caller (one opcode's execution), the highest
/// lock level acquired so far. Acquiring a *lower* level after a higher one
/// has already been taken is a programming error (§8, lock order
/// invariant): "no thread ever holds a level-i lock while acquiring a
/// level-j < i lock". Re-acquiring within the same level, or moving to a
/// strictly higher level, is fine.
#[derive(Debug, Default)]
pub struct HeldLocks {
    max_level: Option<LockLevel>,
    guards: Vec<LockGuard>,
}

impl HeldLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_and_advance(&mut self, level: LockLevel) -> Result<()> {
        if let Some(max) = self.max_level {
            if level < max {
                return Err(GanetiError::LockOrderViolation(format!(
                    "attempted to acquire a {level:?}-level lock while already holding a {max:?}-level lock"
                )));
            }
        }
        self.max_level = Some(match self.max_level {
            Some(current) if current > level => current,
            _ => level,
        });
        Ok(())
    }

    fn push(&mut self, mut guards: Vec<LockGuard>) {
        self.guards.append(&mut guards);
    }

    /// Releases every held lock in reverse acquisition order (§4.4 step 6).
    pub fn release_all(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
        self.max_level = None;
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// The master-side lock manager: one `LockSet` per level. The cluster
/// level contains exactly one name, `BGL` (Big Ganeti Lock); any running
/// opcode holds it at least shared, and cluster-reshaping LUs hold it
/// exclusive, which serializes them against everything else (§5).
pub struct LockManager {
    cluster: LockSet,
    instance: LockSet,
    node: LockSet,
}

impl LockManager {
    pub fn new() -> Self {
        let cluster = LockSet::new();
        cluster.add(BGL_NAME);
        Self {
            cluster,
            instance: LockSet::new(),
            node: LockSet::new(),
        }
    }

    pub fn cluster(&self) -> &LockSet {
        &self.cluster
    }

    pub fn instance(&self) -> &LockSet {
        &self.instance
    }

    pub fn node(&self) -> &LockSet {
        &self.node
    }

    pub async fn acquire_bgl(
        &self,
        held: &mut HeldLocks,
        exclusive: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        held.check_and_advance(LockLevel::Cluster)?;
        let names = vec![BGL_NAME.to_string()];
        let started = Instant::now();
        let guards = self.cluster.acquire(LockSpec::Names(&names), exclusive, timeout).await?;
        metrics::record_lock_wait("cluster", mode_label(exclusive), started.elapsed());
        held.push(guards);
        Ok(())
    }

    pub async fn acquire_instances(
        &self,
        held: &mut HeldLocks,
        spec: LockSpec<'_>,
        exclusive: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        held.check_and_advance(LockLevel::Instance)?;
        let started = Instant::now();
        let guards = self.instance.acquire(spec, exclusive, timeout).await?;
        metrics::record_lock_wait("instance", mode_label(exclusive), started.elapsed());
        held.push(guards);
        Ok(())
    }

    pub async fn acquire_nodes(
        &self,
        held: &mut HeldLocks,
        spec: LockSpec<'_>,
        exclusive: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        held.check_and_advance(LockLevel::Node)?;
        let started = Instant::now();
        let guards = self.node.acquire(spec, exclusive, timeout).await?;
        metrics::record_lock_wait("node", mode_label(exclusive), started.elapsed());
        held.push(guards);
        Ok(())
    }
}

fn mode_label(exclusive: bool) -> &'static str {
    if exclusive { "exclusive" } else { "shared" }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn lock_order_instance_then_node_succeeds() {
        let mgr = LockManager::new();
        let mut held = HeldLocks::new();
        let names = vec!["i.example.com".to_string()];
        mgr.acquire_instances(&mut held, LockSpec::Names(&names), true, None)
            .await
            .unwrap();
        let node_names = vec!["n1".to_string()];
        mgr.acquire_nodes(&mut held, LockSpec::Names(&node_names), false, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lock_order_node_then_instance_fails() {
        let mgr = LockManager::new();
        let mut held = HeldLocks::new();
        let node_names = vec!["n1".to_string()];
        mgr.acquire_nodes(&mut held, LockSpec::Names(&node_names), true, None)
            .await
            .unwrap();
        let inst_names = vec!["i.example.com".to_string()];
        let res = mgr
            .acquire_instances(&mut held, LockSpec::Names(&inst_names), true, Some(Duration::from_millis(10)))
            .await;
        assert!(matches!(res, Err(GanetiError::LockOrderViolation(_))));
    }

    #[tokio::test]
    async fn bgl_held_shared_by_concurrent_opcodes() {
        let mgr = LockManager::new();
        let mut held_a = HeldLocks::new();
        let mut held_b = HeldLocks::new();
        mgr.acquire_bgl(&mut held_a, false, None).await.unwrap();
        mgr.acquire_bgl(&mut held_b, false, None).await.unwrap();
    }

    #[tokio::test]
    async fn bgl_exclusive_serializes_against_shared() {
        let mgr = LockManager::new();
        let mut held_a = HeldLocks::new();
        mgr.acquire_bgl(&mut held_a, true, None).await.unwrap();
        let mut held_b = HeldLocks::new();
        let res = mgr
            .acquire_bgl(&mut held_b, false, Some(Duration::from_millis(30)))
            .await;
        assert!(res.is_err());
    }
}
