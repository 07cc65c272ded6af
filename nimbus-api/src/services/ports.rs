//! Direct-access port allocation.
//!
//! Exposes a private VM port externally through node-side firewall rules
//! and DNS. Direct nodes take a single AllocatePort command. CGNAT nodes
//! take a three-hop path: the relay allocates the public port first, then
//! the CGNAT node wires the forwarding to the VM; a failure on the second
//! hop rolls the relay allocation back. The caller polls the VM record
//! for the agent-allocated port and gets an explicit partial success on
//! timeout.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::audit::ApiAuditLogger;
use crate::command::{AllocatePortPayload, CommandType, NodeCommand, RemovePortPayload};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::model::{PortMapping, VirtualMachine, VmStatus};
use crate::services::ingress::DnsApi;
use crate::store::DataStore;

/// Outcome of a port allocation, with explicit partial success.
#[derive(Debug, Clone)]
pub struct PortAllocation {
    pub success: bool,
    pub vm_port: u16,
    /// 0 while the node-side allocation is still in progress.
    pub public_port: u16,
    pub protocol: String,
    pub message: String,
    pub dns_record_id: Option<String>,
    pub is_dns_configured: bool,
}

enum AckWait {
    PublicPort(u16),
    Failed(String),
    TimedOut,
}

pub struct DirectAccessService {
    store: Arc<DataStore>,
    config: Arc<OrchestratorConfig>,
    dns: Arc<dyn DnsApi>,
    audit: Arc<ApiAuditLogger>,
}

impl DirectAccessService {
    pub fn new(
        store: Arc<DataStore>,
        config: Arc<OrchestratorConfig>,
        dns: Arc<dyn DnsApi>,
        audit: Arc<ApiAuditLogger>,
    ) -> Self {
        Self {
            store,
            config,
            dns,
            audit,
        }
    }

    pub async fn allocate(
        &self,
        vm_id: &str,
        vm_port: u16,
        protocol: &str,
    ) -> Result<PortAllocation> {
        let vm = self
            .store
            .get_vm(vm_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("vm {}", vm_id)))?;
        let node_id = vm.node_id.clone().ok_or_else(|| {
            OrchestratorError::Validation(format!("VM {} is not placed on a node", vm_id))
        })?;

        if let Some(existing) = vm.network.mapping(vm_port, protocol) {
            if existing.public_port != 0 {
                return Ok(self.completed(&vm, existing.clone(), "Port already allocated"));
            }
        } else {
            self.store
                .update_vm(vm_id, |vm| {
                    vm.network.port_mappings.push(PortMapping {
                        vm_port,
                        public_port: 0,
                        protocol: protocol.to_string(),
                        dns_record_id: None,
                    });
                })
                .await?;
        }

        let node = self
            .store
            .get_node(&node_id)
            .await
            .ok_or_else(|| OrchestratorError::External(format!("node {} missing", node_id)))?;

        match node.cgnat_info.clone() {
            Some(cgnat) => {
                self.allocate_relayed(&vm, &node_id, &cgnat.assigned_relay_node_id, &cgnat.tunnel_ip, vm_port, protocol)
                    .await
            }
            None => self.allocate_direct(&vm, &node_id, vm_port, protocol).await,
        }
    }

    /// Single hop: the hosting node allocates and reports the port back
    /// in its ack.
    async fn allocate_direct(
        &self,
        vm: &VirtualMachine,
        node_id: &str,
        vm_port: u16,
        protocol: &str,
    ) -> Result<PortAllocation> {
        self.dispatch_allocate(
            &vm.id,
            node_id,
            AllocatePortPayload {
                vm_id: vm.id.clone(),
                vm_port,
                protocol: protocol.to_string(),
                ..Default::default()
            },
        )
        .await?;

        match self.wait_for_public_port(&vm.id, vm_port, protocol).await {
            AckWait::PublicPort(public_port) => {
                let mapping = self.finish_mapping(vm, vm_port, protocol, public_port).await?;
                Ok(self.completed(vm, mapping, "Port allocated"))
            }
            AckWait::Failed(error) => Err(OrchestratorError::External(format!(
                "node failed to allocate port: {}",
                error
            ))),
            AckWait::TimedOut => Ok(self.in_progress(vm_port, protocol)),
        }
    }

    /// Three hops: external -> relay host -> relay VM -> CGNAT node -> VM.
    async fn allocate_relayed(
        &self,
        vm: &VirtualMachine,
        cgnat_node_id: &str,
        relay_node_id: &str,
        tunnel_ip: &str,
        vm_port: u16,
        protocol: &str,
    ) -> Result<PortAllocation> {
        if self.store.get_node(relay_node_id).await.is_none() {
            return Err(OrchestratorError::External(format!(
                "assigned relay {} is gone",
                relay_node_id
            )));
        }

        // Hop 1: the relay picks the external port
        self.dispatch_allocate(
            &vm.id,
            relay_node_id,
            AllocatePortPayload {
                vm_id: vm.id.clone(),
                vm_port,
                protocol: protocol.to_string(),
                is_relay_forwarding: true,
                tunnel_destination_ip: Some(tunnel_ip.to_string()),
                ..Default::default()
            },
        )
        .await?;

        let public_port = match self.wait_for_public_port(&vm.id, vm_port, protocol).await {
            AckWait::PublicPort(port) => port,
            AckWait::Failed(error) => {
                return Err(OrchestratorError::External(format!(
                    "relay failed to allocate port: {}",
                    error
                )));
            }
            AckWait::TimedOut => return Ok(self.in_progress(vm_port, protocol)),
        };

        // Hop 2: the CGNAT node forwards the allocated port to the VM
        let step2 = self
            .dispatch_allocate(
                &vm.id,
                cgnat_node_id,
                AllocatePortPayload {
                    vm_id: vm.id.clone(),
                    vm_port,
                    protocol: protocol.to_string(),
                    public_port: Some(public_port),
                    vm_private_ip: vm.network.private_ip.clone(),
                    ..Default::default()
                },
            )
            .await?;

        match self.wait_for_completion(&vm.id, &step2).await {
            AckWait::Failed(error) => {
                // Roll the relay hop back so the external port is not
                // left dangling
                warn!(vm_id = %vm.id, public_port, %error, "CGNAT hop failed, rolling back relay port");
                self.dispatch_remove(
                    &vm.id,
                    relay_node_id,
                    RemovePortPayload {
                        vm_id: vm.id.clone(),
                        public_port: Some(public_port),
                        protocol: protocol.to_string(),
                        is_relay_forwarding: true,
                        ..Default::default()
                    },
                )
                .await?;
                self.store
                    .update_vm(&vm.id, |vm| {
                        vm.network
                            .port_mappings
                            .retain(|m| !(m.vm_port == vm_port && m.protocol == protocol));
                    })
                    .await?;
                Err(OrchestratorError::External(format!(
                    "forwarding setup failed on CGNAT node: {}",
                    error
                )))
            }
            AckWait::TimedOut => Ok(PortAllocation {
                success: true,
                vm_port,
                public_port,
                protocol: protocol.to_string(),
                message: "Public port allocated; forwarding setup still in progress".to_string(),
                dns_record_id: None,
                is_dns_configured: self.dns.is_configured(),
            }),
            AckWait::PublicPort(_) => {
                let mapping = self.finish_mapping(vm, vm_port, protocol, public_port).await?;
                Ok(self.completed(vm, mapping, "Port allocated via relay"))
            }
        }
    }

    /// Remove an exposed port. For CGNAT VMs the removal mirrors the
    /// allocation topology: relay keyed by public port, CGNAT node keyed
    /// by vm port.
    pub async fn release(&self, vm_id: &str, vm_port: u16, protocol: &str) -> Result<()> {
        let vm = self
            .store
            .get_vm(vm_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("vm {}", vm_id)))?;
        let Some(mapping) = vm.network.mapping(vm_port, protocol).cloned() else {
            return Ok(());
        };
        let Some(node_id) = vm.node_id.clone() else {
            return Ok(());
        };

        // The mapping is removed eagerly; RemovePort acks are
        // acknowledgment only
        self.store
            .update_vm(vm_id, |vm| {
                vm.network
                    .port_mappings
                    .retain(|m| !(m.vm_port == vm_port && m.protocol == protocol));
            })
            .await?;

        if let Some(record_id) = &mapping.dns_record_id {
            if let Err(e) = self.dns.remove(record_id).await {
                warn!(vm_id, record_id, error = %e, "DNS record removal failed");
            }
        }

        let cgnat = self
            .store
            .get_node(&node_id)
            .await
            .and_then(|n| n.cgnat_info);
        match cgnat {
            Some(cgnat) => {
                self.dispatch_remove(
                    vm_id,
                    &cgnat.assigned_relay_node_id,
                    RemovePortPayload {
                        vm_id: vm_id.to_string(),
                        public_port: Some(mapping.public_port),
                        protocol: protocol.to_string(),
                        is_relay_forwarding: true,
                        ..Default::default()
                    },
                )
                .await?;
                self.dispatch_remove(
                    vm_id,
                    &node_id,
                    RemovePortPayload {
                        vm_id: vm_id.to_string(),
                        vm_port: Some(vm_port),
                        protocol: protocol.to_string(),
                        ..Default::default()
                    },
                )
                .await?;
            }
            None => {
                self.dispatch_remove(
                    vm_id,
                    &node_id,
                    RemovePortPayload {
                        vm_id: vm_id.to_string(),
                        vm_port: Some(vm_port),
                        public_port: Some(mapping.public_port),
                        protocol: protocol.to_string(),
                        ..Default::default()
                    },
                )
                .await?;
            }
        }

        self.audit.port_released(vm_id, vm_port);
        Ok(())
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    async fn dispatch_allocate(
        &self,
        vm_id: &str,
        node_id: &str,
        payload: AllocatePortPayload,
    ) -> Result<String> {
        let command = NodeCommand::new(
            CommandType::AllocatePort,
            vm_id,
            serde_json::to_value(&payload)
                .map_err(|e| OrchestratorError::External(e.to_string()))?,
        );
        let command_id = command.command_id.clone();
        self.store
            .register_command(&command_id, vm_id, node_id, CommandType::AllocatePort)
            .await;
        self.store.append_pending_command(node_id, command).await;
        Ok(command_id)
    }

    async fn dispatch_remove(
        &self,
        vm_id: &str,
        node_id: &str,
        payload: RemovePortPayload,
    ) -> Result<String> {
        let command = NodeCommand::new(
            CommandType::RemovePort,
            vm_id,
            serde_json::to_value(&payload)
                .map_err(|e| OrchestratorError::External(e.to_string()))?,
        );
        let command_id = command.command_id.clone();
        self.store
            .register_command(&command_id, vm_id, node_id, CommandType::RemovePort)
            .await;
        self.store.append_pending_command(node_id, command).await;
        Ok(command_id)
    }

    /// Poll the VM record until the ack path fills in the public port.
    async fn wait_for_public_port(&self, vm_id: &str, vm_port: u16, protocol: &str) -> AckWait {
        let interval = Duration::from_millis(self.config.ports.ack_poll_interval_ms);
        for _ in 0..self.config.ports.ack_poll_attempts {
            let Some(vm) = self.store.get_vm(vm_id).await else {
                return AckWait::Failed("vm disappeared".to_string());
            };
            if let Some(mapping) = vm.network.mapping(vm_port, protocol) {
                if mapping.public_port != 0 {
                    return AckWait::PublicPort(mapping.public_port);
                }
            }
            if vm.status == VmStatus::Error {
                return AckWait::Failed(
                    vm.status_message
                        .unwrap_or_else(|| "allocation failed".to_string()),
                );
            }
            tokio::time::sleep(interval).await;
        }
        AckWait::TimedOut
    }

    /// Poll until a command's registry entry is consumed by its ack.
    async fn wait_for_completion(&self, vm_id: &str, command_id: &str) -> AckWait {
        let interval = Duration::from_millis(self.config.ports.ack_poll_interval_ms);
        for _ in 0..self.config.ports.ack_poll_attempts {
            if self.store.get_command(command_id).await.is_none() {
                let failed = self
                    .store
                    .get_vm(vm_id)
                    .await
                    .filter(|vm| vm.status == VmStatus::Error);
                return match failed {
                    Some(vm) => AckWait::Failed(
                        vm.status_message
                            .unwrap_or_else(|| "forwarding failed".to_string()),
                    ),
                    None => AckWait::PublicPort(0),
                };
            }
            tokio::time::sleep(interval).await;
        }
        AckWait::TimedOut
    }

    async fn finish_mapping(
        &self,
        vm: &VirtualMachine,
        vm_port: u16,
        protocol: &str,
        public_port: u16,
    ) -> Result<PortMapping> {
        // DNS degrades gracefully: a missing backend yields no record id
        let node_ip = match vm.node_id.as_ref() {
            Some(node_id) => self
                .store
                .get_node(node_id)
                .await
                .map(|n| n.public_ip)
                .unwrap_or_default(),
            None => String::new(),
        };
        let dns_record_id = match self.dns.register(&vm.name, &node_ip, public_port).await {
            Ok(record) => record,
            Err(e) => {
                warn!(vm_id = %vm.id, error = %e, "DNS registration failed");
                None
            }
        };

        let updated = self
            .store
            .update_vm(&vm.id, |vm| {
                if let Some(mapping) = vm.network.mapping_mut(vm_port, protocol) {
                    mapping.public_port = public_port;
                    mapping.dns_record_id = dns_record_id.clone();
                }
                if vm_port == 22 {
                    vm.access.ssh_host = Some(node_ip.clone());
                    vm.access.ssh_port = Some(public_port);
                }
            })
            .await?;
        info!(vm_id = %vm.id, vm_port, public_port, "Port mapping completed");
        Ok(updated
            .network
            .mapping(vm_port, protocol)
            .cloned()
            .unwrap_or(PortMapping {
                vm_port,
                public_port,
                protocol: protocol.to_string(),
                dns_record_id,
            }))
    }

    fn completed(&self, _vm: &VirtualMachine, mapping: PortMapping, message: &str) -> PortAllocation {
        PortAllocation {
            success: true,
            vm_port: mapping.vm_port,
            public_port: mapping.public_port,
            protocol: mapping.protocol,
            message: message.to_string(),
            dns_record_id: mapping.dns_record_id,
            is_dns_configured: self.dns.is_configured(),
        }
    }

    fn in_progress(&self, vm_port: u16, protocol: &str) -> PortAllocation {
        PortAllocation {
            success: true,
            vm_port,
            public_port: 0,
            protocol: protocol.to_string(),
            message: "Port allocation still in progress".to_string(),
            dns_record_id: None,
            is_dns_configured: self.dns.is_configured(),
        }
    }
}
