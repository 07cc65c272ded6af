//! VM lifecycle manager.
//!
//! The single writer of VM status. Every transition goes through
//! `transition`, which enforces the state-machine policy under the
//! store's per-entity lock and centralizes side effects: resource release
//! and quota refund on Deleted, ingress registration on Running.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::ApiAuditLogger;
use crate::error::{OrchestratorError, Result};
use crate::model::{PowerState, VirtualMachine, VmStatus};
use crate::services::ingress::IngressApi;
use crate::store::{DataStore, Event};

/// Whether the status machine permits `from -> to`.
///
/// Heartbeat reconciliation may flip Running and Stopped in either
/// direction; everything else follows the command protocol. Error is
/// reachable from any non-terminal state, Deleted is terminal.
pub fn transition_allowed(from: VmStatus, to: VmStatus) -> bool {
    use VmStatus::*;
    if from == to {
        return true;
    }
    match (from, to) {
        (_, Error) => from != Deleted,
        (Pending, Provisioning) => true,
        (Stopped, Provisioning) => true,
        (Provisioning, Running) => true,
        (Running, Stopping) => true,
        (Stopping, Stopped) => true,
        // Heartbeat reconciliation for non-transitional states
        (Running, Stopped) | (Stopped, Running) => true,
        (Pending | Provisioning | Running | Stopped | Error, Deleting) => true,
        (Deleting, Deleted) => true,
        // No-node path: a VM that never reached a node can die directly
        (Pending, Deleted) => true,
        _ => false,
    }
}

pub struct LifecycleManager {
    store: Arc<DataStore>,
    ingress: Arc<dyn IngressApi>,
    audit: Arc<ApiAuditLogger>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<DataStore>,
        ingress: Arc<dyn IngressApi>,
        audit: Arc<ApiAuditLogger>,
    ) -> Self {
        Self {
            store,
            ingress,
            audit,
        }
    }

    /// Transition a VM to `to`, applying side effects. Returns the VM
    /// after the transition. A disallowed transition is a Validation
    /// error and changes nothing.
    pub async fn transition(
        &self,
        vm_id: &str,
        to: VmStatus,
        message: Option<String>,
    ) -> Result<VirtualMachine> {
        let mut denied_from: Option<VmStatus> = None;
        let mut previous = VmStatus::Pending;
        let vm = self
            .store
            .update_vm(vm_id, |vm| {
                if !transition_allowed(vm.status, to) {
                    denied_from = Some(vm.status);
                    return;
                }
                previous = vm.status;
                vm.status = to;
                if message.is_some() {
                    vm.status_message = message.clone();
                }
                match to {
                    VmStatus::Running => {
                        vm.power_state = PowerState::Running;
                        if vm.billing.billed_since.is_none() {
                            vm.billing.billed_since = Some(Utc::now());
                        }
                    }
                    VmStatus::Stopped | VmStatus::Deleted | VmStatus::Error => {
                        vm.power_state = PowerState::Off;
                        vm.billing.billed_since = None;
                    }
                    _ => {}
                }
            })
            .await?;

        if let Some(from) = denied_from {
            return Err(OrchestratorError::Validation(format!(
                "transition {} -> {} is not allowed for VM {}",
                from, to, vm_id
            )));
        }

        if previous != to {
            self.store.emit(Event::VmStatusChanged {
                id: vm_id.to_string(),
                old: previous,
                new: to,
            });
            self.audit
                .vm_status_changed(vm_id, previous.as_str(), to.as_str());
            info!(vm_id, from = %previous, to = %to, "VM status changed");
        }

        match to {
            VmStatus::Deleted => self.on_deleted(&vm).await,
            VmStatus::Running if previous != VmStatus::Running => self.on_running(&vm),
            _ => {}
        }

        Ok(vm)
    }

    /// Clear the active-command fields after an ack resolves.
    pub async fn clear_active_command(&self, vm_id: &str) -> Result<VirtualMachine> {
        Ok(self
            .store
            .update_vm(vm_id, |vm| {
                vm.active_command = None;
            })
            .await?)
    }

    /// Release reservations, refund quotas, detach ingress.
    async fn on_deleted(&self, vm: &VirtualMachine) {
        match self.store.release_vm_resources(&vm.id).await {
            Ok(Some(cost)) => {
                info!(vm_id = %vm.id, ?cost, "Released node reservation");
            }
            Ok(None) => {}
            Err(e) => warn!(vm_id = %vm.id, error = %e, "Failed to release reservation"),
        }

        if !vm.is_system() {
            let spec = vm.spec.clone();
            if let Err(e) = self
                .store
                .update_user(&vm.owner_id, |user| user.usage.refund(&spec))
                .await
            {
                warn!(vm_id = %vm.id, owner = %vm.owner_id, error = %e, "Quota refund failed");
            }
        }

        if let Err(e) = self.ingress.on_vm_deleted(vm).await {
            // Ingress failures degrade, they never block deletion
            warn!(vm_id = %vm.id, error = %e, "Ingress removal failed");
        }

        self.store.emit(Event::VmDeleted {
            id: vm.id.clone(),
        });
        self.audit.vm_deleted(&vm.id);
    }

    /// Poll briefly for the agent-assigned private ip, then register the
    /// VM with the ingress layer.
    fn on_running(&self, vm: &VirtualMachine) {
        let store = Arc::clone(&self.store);
        let ingress = Arc::clone(&self.ingress);
        let vm_id = vm.id.clone();
        tokio::spawn(async move {
            let mut current = store.get_vm(&vm_id).await;
            for _ in 0..10 {
                match &current {
                    Some(vm) if vm.network.private_ip.is_some() => break,
                    Some(_) => {
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                        current = store.get_vm(&vm_id).await;
                    }
                    None => return,
                }
            }
            if let Some(vm) = current {
                if vm.status != VmStatus::Running {
                    return;
                }
                if let Err(e) = ingress.on_vm_started(&vm).await {
                    warn!(vm_id = %vm.id, error = %e, "Ingress registration failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_protocol_path() {
        use VmStatus::*;
        assert!(transition_allowed(Pending, Provisioning));
        assert!(transition_allowed(Provisioning, Running));
        assert!(transition_allowed(Running, Stopping));
        assert!(transition_allowed(Stopping, Stopped));
        assert!(transition_allowed(Stopped, Provisioning));
        assert!(transition_allowed(Running, Deleting));
        assert!(transition_allowed(Deleting, Deleted));
    }

    #[test]
    fn test_error_reachable_from_non_terminal_only() {
        use VmStatus::*;
        for from in [Pending, Provisioning, Running, Stopping, Stopped, Deleting] {
            assert!(transition_allowed(from, Error), "{:?} -> Error", from);
        }
        assert!(!transition_allowed(Deleted, Error));
    }

    #[test]
    fn test_deleted_is_terminal() {
        use VmStatus::*;
        for to in [Pending, Provisioning, Running, Stopping, Stopped, Deleting] {
            assert!(!transition_allowed(Deleted, to), "Deleted -> {:?}", to);
        }
        assert!(transition_allowed(Deleted, Deleted));
    }

    #[test]
    fn test_skipping_states_is_denied() {
        use VmStatus::*;
        assert!(!transition_allowed(Pending, Running));
        assert!(!transition_allowed(Provisioning, Stopped));
        assert!(!transition_allowed(Running, Deleted));
        assert!(!transition_allowed(Stopping, Deleting));
    }
}
