//! Ingress and DNS collaborator interfaces.
//!
//! Both are external systems; the orchestrator only calls these hooks.
//! Failures degrade the specific feature and never block the primary
//! operation.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::VirtualMachine;

/// Ingress layer hooks, called when VMs start and stop serving.
#[async_trait]
pub trait IngressApi: Send + Sync {
    async fn on_vm_started(&self, vm: &VirtualMachine) -> Result<()>;

    async fn on_vm_deleted(&self, vm: &VirtualMachine) -> Result<()>;
}

/// DNS record management for direct-access ports. An unconfigured backend
/// degrades gracefully: no record id, `is_configured` false.
#[async_trait]
pub trait DnsApi: Send + Sync {
    fn is_configured(&self) -> bool;

    /// Create a record for the mapping; None when DNS is not configured.
    async fn register(&self, hostname: &str, ip: &str, port: u16) -> Result<Option<String>>;

    async fn remove(&self, record_id: &str) -> Result<()>;
}

/// Default no-op ingress used until a real ingress layer is wired in.
pub struct NoopIngress;

#[async_trait]
impl IngressApi for NoopIngress {
    async fn on_vm_started(&self, vm: &VirtualMachine) -> Result<()> {
        tracing::debug!(vm_id = %vm.id, "Ingress registration skipped (no ingress configured)");
        Ok(())
    }

    async fn on_vm_deleted(&self, vm: &VirtualMachine) -> Result<()> {
        tracing::debug!(vm_id = %vm.id, "Ingress removal skipped (no ingress configured)");
        Ok(())
    }
}

/// DNS backend placeholder for deployments without a DNS API.
pub struct UnconfiguredDns;

#[async_trait]
impl DnsApi for UnconfiguredDns {
    fn is_configured(&self) -> bool {
        false
    }

    async fn register(&self, _hostname: &str, _ip: &str, _port: u16) -> Result<Option<String>> {
        Ok(None)
    }

    async fn remove(&self, _record_id: &str) -> Result<()> {
        Ok(())
    }
}
