//! The hypervisor capability contract (§4.4, Non-goals: hypervisor
//! internals are out of scope — only the surface LUs and the backend
//! dispatcher call through). Grounded on the public method signatures of
//! `examples/original_source/lib/hypervisor/hv_kvm.py`'s `KVMHypervisor`
//! (`StartInstance`, `StopInstance`, `GetInstanceInfo`,
//! `MigrateInstance`), reimplemented as a trait with two stub
//! implementations rather than a class hierarchy, since this crate never
//! needs to actually drive qemu/xl — only to present the shape the node
//! backend dispatches through.

use crate::core::errors::{GanetiError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRuntimeInfo {
    pub name: String,
    pub running: bool,
    pub memory_mib: u64,
    pub vcpus: u32,
}

/// One hypervisor backend's capability surface. Every method is called
/// only from `core::backend`'s procedure implementations, never directly
/// from an LU (LUs talk to the RPC layer, which talks to the node
/// backend, which talks to this).
#[async_trait]
pub trait Hypervisor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start_instance(&self, instance_name: &str) -> Result<()>;
    async fn stop_instance(&self, instance_name: &str, force: bool) -> Result<()>;
    async fn reboot_instance(&self, instance_name: &str) -> Result<()>;
    async fn instance_info(&self, instance_name: &str) -> Result<Option<InstanceRuntimeInfo>>;
    async fn list_instances(&self) -> Result<Vec<String>>;
    async fn migrate_instance(&self, instance_name: &str, target: &str, live: bool) -> Result<()>;
}

/// KVM backend stub. Real process control (`qemu-system-*`, QMP sockets)
/// is the Non-goal; this exists so `core::backend` has a concrete type to
/// hold and the procedure surface is exercised by tests.
pub struct KvmHypervisor;

#[async_trait]
impl Hypervisor for KvmHypervisor {
    fn name(&self) -> &'static str {
        "kvm"
    }

    async fn start_instance(&self, instance_name: &str) -> Result<()> {
        tracing::info!(instance = instance_name, hv = "kvm", "start_instance (stub)");
        Ok(())
    }

    async fn stop_instance(&self, instance_name: &str, force: bool) -> Result<()> {
        tracing::info!(instance = instance_name, hv = "kvm", force, "stop_instance (stub)");
        Ok(())
    }

    async fn reboot_instance(&self, instance_name: &str) -> Result<()> {
        tracing::info!(instance = instance_name, hv = "kvm", "reboot_instance (stub)");
        Ok(())
    }

    async fn instance_info(&self, _instance_name: &str) -> Result<Option<InstanceRuntimeInfo>> {
        Ok(None)
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        Ok(vec![])
    }

    async fn migrate_instance(&self, instance_name: &str, target: &str, live: bool) -> Result<()> {
        tracing::info!(instance = instance_name, hv = "kvm", target, live, "migrate_instance (stub)");
        Ok(())
    }
}

/// Xen backend stub, same shape as `KvmHypervisor`.
pub struct XenHypervisor;

#[async_trait]
impl Hypervisor for XenHypervisor {
    fn name(&self) -> &'static str {
        "xen-pvm"
    }

    async fn start_instance(&self, instance_name: &str) -> Result<()> {
        tracing::info!(instance = instance_name, hv = "xen-pvm", "start_instance (stub)");
        Ok(())
    }

    async fn stop_instance(&self, instance_name: &str, force: bool) -> Result<()> {
        tracing::info!(instance = instance_name, hv = "xen-pvm", force, "stop_instance (stub)");
        Ok(())
    }

    async fn reboot_instance(&self, instance_name: &str) -> Result<()> {
        tracing::info!(instance = instance_name, hv = "xen-pvm", "reboot_instance (stub)");
        Ok(())
    }

    async fn instance_info(&self, _instance_name: &str) -> Result<Option<InstanceRuntimeInfo>> {
        Ok(None)
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        Ok(vec![])
    }

    async fn migrate_instance(&self, instance_name: &str, target: &str, live: bool) -> Result<()> {
        tracing::info!(instance = instance_name, hv = "xen-pvm", target, live, "migrate_instance (stub)");
        Ok(())
    }
}

pub fn by_name(name: &str) -> Result<Box<dyn Hypervisor>> {
    match name {
        "kvm" => Ok(Box::new(KvmHypervisor)),
        "xen-pvm" | "xen-hvm" => Ok(Box::new(XenHypervisor)),
        other => Err(GanetiError::HypervisorError(format!("unknown hypervisor '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kvm_stub_reports_no_running_instances() {
        let hv = KvmHypervisor;
        assert_eq!(hv.list_instances().await.unwrap().len(), 0);
    }

    #[test]
    fn unknown_hypervisor_name_rejected() {
        assert!(by_name("vmware").is_err());
    }
}
