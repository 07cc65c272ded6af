//! VM service: CRUD, naming, quotas, and the scheduling step.
//!
//! Creation persists the VM as Pending and attempts immediate scheduling.
//! The scheduling step reserves node resources atomically with the node
//! assignment, resolves GPUs, renders cloud-init and dispatches the
//! CreateVm command. Deletion follows the command protocol; resources are
//! not freed until the ack path runs.

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::ApiAuditLogger;
use crate::cloudinit::{self, CloudInitContext};
use crate::command::{
    CommandType, CreateVmPayload, DeleteVmPayload, NodeCommand, StopVmPayload, VmNetworkPayload,
};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::model::{
    ActiveCommand, GpuMode, Node, QualityTier, ResourceCapacity, VirtualMachine, VmServiceStatus,
    VmSpec, VmStatus, VmType,
};
use crate::naming;
use crate::password::generate_memorable_password;
use crate::scheduler::{PlacementRequest, Scheduler};
use crate::services::lifecycle::LifecycleManager;
use crate::store::{DataStore, Event};

// =============================================================================
// Template catalog (marketplace collaborator)
// =============================================================================

/// A marketplace template a VM can be created from.
#[derive(Debug, Clone)]
pub struct VmTemplate {
    pub id: String,
    pub name: String,
    pub container_image: Option<String>,
    pub gpu: bool,
    pub exposed_ports: Vec<u16>,
    pub primary_port: Option<u16>,
    pub user_data: Option<String>,
}

#[async_trait]
pub trait TemplateCatalog: Send + Sync {
    async fn get_template(&self, id: &str) -> Result<Option<VmTemplate>>;
}

/// Fixed in-process catalog; the marketplace service replaces this in
/// full deployments.
#[derive(Default)]
pub struct StaticTemplateCatalog {
    templates: HashMap<String, VmTemplate>,
}

impl StaticTemplateCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_templates(templates: Vec<VmTemplate>) -> Self {
        Self {
            templates: templates.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }
}

#[async_trait]
impl TemplateCatalog for StaticTemplateCatalog {
    async fn get_template(&self, id: &str) -> Result<Option<VmTemplate>> {
        Ok(self.templates.get(id).cloned())
    }
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct CreateVmParams {
    pub name: String,
    pub owner_id: String,
    pub owner_wallet: Option<String>,
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub image_id: String,
    pub tier: QualityTier,
    pub gpu_mode: GpuMode,
    pub container_image: Option<String>,
    pub ssh_public_key: Option<String>,
    pub template_id: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub labels: HashMap<String, String>,
    /// Explicit placement for system VMs.
    pub target_node_id: Option<String>,
    /// Premium names are globally unique and carry no suffix.
    pub premium_name: bool,
}

#[derive(Debug)]
pub struct CreateVmResult {
    pub vm: VirtualMachine,
    /// Returned exactly once. The caller encrypts it with the owner's
    /// wallet key and hands the ciphertext back via `secure_password`.
    pub plaintext_password: Option<String>,
}

// =============================================================================
// Service
// =============================================================================

pub struct VmService {
    store: Arc<DataStore>,
    config: Arc<OrchestratorConfig>,
    scheduler: Scheduler,
    lifecycle: Arc<LifecycleManager>,
    templates: Arc<dyn TemplateCatalog>,
    audit: Arc<ApiAuditLogger>,
}

impl VmService {
    pub fn new(
        store: Arc<DataStore>,
        config: Arc<OrchestratorConfig>,
        lifecycle: Arc<LifecycleManager>,
        templates: Arc<dyn TemplateCatalog>,
        audit: Arc<ApiAuditLogger>,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(Arc::clone(&config)),
            store,
            config,
            lifecycle,
            templates,
            audit,
        }
    }

    // =========================================================================
    // Naming
    // =========================================================================

    /// Produce the canonical name for a new VM.
    ///
    /// System VMs keep their raw name. User names are sanitized, validated
    /// and suffixed until unique among the owner's non-deleted VMs: five
    /// 4-hex attempts, then 8-hex. Premium names are globally unique and
    /// unsuffixed.
    pub async fn generate_canonical_name(
        &self,
        raw: &str,
        owner_id: &str,
        premium: bool,
    ) -> Result<String> {
        if owner_id == "system" {
            return Ok(raw.to_string());
        }
        let base = naming::sanitize(raw);
        naming::validate(&base).map_err(OrchestratorError::Validation)?;

        if premium {
            if self.store.any_active_vm_named(&base).await {
                return Err(OrchestratorError::Validation(format!(
                    "premium name {} is already taken",
                    base
                )));
            }
            return Ok(base);
        }

        for attempt in 0..10 {
            let suffix_len = if attempt < 5 { 4 } else { 8 };
            let candidate = naming::with_suffix(&base, &naming::hex_suffix(suffix_len));
            if self.name_taken(owner_id, &candidate).await {
                continue;
            }
            return Ok(candidate);
        }
        Err(OrchestratorError::Validation(format!(
            "could not find a unique name for {} after 10 attempts",
            base
        )))
    }

    /// Fast path over the active-VM index, then a full scan of the
    /// owner's VMs in case the index lags a concurrent write.
    async fn name_taken(&self, owner_id: &str, name: &str) -> bool {
        if self.store.owner_has_active_vm_named(owner_id, name).await {
            return true;
        }
        self.store
            .get_vms_by_user(owner_id)
            .await
            .iter()
            .any(|vm| vm.is_active() && vm.name == name)
    }

    // =========================================================================
    // Creation
    // =========================================================================

    pub async fn create(&self, params: CreateVmParams) -> Result<CreateVmResult> {
        let is_system = params.owner_id == "system";

        let mut spec = VmSpec {
            cpu_cores: params.cpu_cores,
            memory_bytes: params.memory_bytes,
            disk_bytes: params.disk_bytes,
            image_id: params.image_id.clone(),
            tier: params.tier,
            gpu_mode: params.gpu_mode,
            container_image: params.container_image.clone(),
            ssh_public_key: params.ssh_public_key.clone(),
            template_id: params.template_id.clone(),
            user_data: None,
            region: params.region.clone(),
            zone: params.zone.clone(),
        };
        if spec.cpu_cores == 0 || spec.memory_bytes == 0 || spec.disk_bytes == 0 {
            return Err(OrchestratorError::Validation(
                "cpu, memory and disk must all be non-zero".to_string(),
            ));
        }

        if !is_system {
            self.check_quota(&params.owner_id, params.owner_wallet.clone(), &spec)
                .await?;
        }

        let name = self
            .generate_canonical_name(&params.name, &params.owner_id, params.premium_name)
            .await?;

        let password = if is_system {
            None
        } else {
            Some(generate_memorable_password())
        };

        let mut labels = params.labels.clone();
        let mut services = vec![VmServiceStatus::system()];
        let mut vm_type = if is_system {
            VmType::System
        } else {
            VmType::Standard
        };

        if let Some(template_id) = &params.template_id {
            let template = self
                .templates
                .get_template(template_id)
                .await?
                .ok_or_else(|| {
                    OrchestratorError::Validation(format!("unknown template {}", template_id))
                })?;
            for port in &template.exposed_ports {
                services.push(VmServiceStatus::tcp(
                    &format!("{}-{}", template.name, port),
                    *port,
                ));
            }
            if template.gpu {
                if spec.gpu_mode == GpuMode::None {
                    spec.gpu_mode = GpuMode::Proxied;
                }
                vm_type = VmType::Inference;
            }
            if spec.container_image.is_none() {
                spec.container_image = template.container_image.clone();
            }
            spec.user_data = template.user_data.clone();
            if let Some(port) = template.primary_port {
                labels.insert("ingress-port".to_string(), port.to_string());
            }
        }

        if is_system {
            self.validate_system_labels(&labels)?;
        }

        let now = Utc::now();
        let vm = VirtualMachine {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.clone(),
            owner_id: params.owner_id.clone(),
            owner_wallet: params.owner_wallet.clone(),
            vm_type,
            spec,
            status: VmStatus::Pending,
            status_message: Some("Awaiting scheduling".to_string()),
            power_state: Default::default(),
            node_id: None,
            reserved_cost: None,
            gpu_pci_address: None,
            network: crate::model::NetworkConfig {
                hostname: Some(name.clone()),
                ..Default::default()
            },
            access: Default::default(),
            active_command: None,
            billing: Default::default(),
            services,
            labels,
            secure_password: None,
            created_at: now,
            updated_at: now,
        };

        self.store.save_vm(vm.clone()).await;
        if !is_system {
            let spec = vm.spec.clone();
            self.store
                .update_user(&params.owner_id, |user| user.usage.charge(&spec))
                .await?;
        }
        self.store.emit(Event::VmCreated(vm.clone()));
        self.audit.vm_created(&vm.id, &vm.name);

        // Attempt immediate scheduling; capacity shortfalls leave the VM
        // Pending for a later attempt.
        let vm = match self
            .schedule_vm(&vm.id, password.as_deref(), params.target_node_id.as_deref())
            .await
        {
            Ok(vm) => vm,
            Err(OrchestratorError::Capacity(reason)) => {
                warn!(vm_id = %vm.id, %reason, "No suitable node, VM stays pending");
                self.store
                    .update_vm(&vm.id, |vm| {
                        vm.status_message = Some(format!("No suitable node: {}", reason));
                    })
                    .await?
            }
            Err(e) => return Err(e),
        };

        Ok(CreateVmResult {
            vm,
            plaintext_password: password,
        })
    }

    async fn check_quota(
        &self,
        owner_id: &str,
        wallet: Option<String>,
        spec: &VmSpec,
    ) -> Result<()> {
        let user = self.store.get_or_create_user(owner_id, wallet).await;
        if user.usage.vms + 1 > user.quota.max_vms {
            return Err(OrchestratorError::Quota(format!(
                "VM limit reached ({}/{})",
                user.usage.vms, user.quota.max_vms
            )));
        }
        if user.usage.cpu_cores + spec.cpu_cores > user.quota.max_cpu_cores {
            return Err(OrchestratorError::Quota("CPU core quota exceeded".to_string()));
        }
        if user.usage.memory_bytes + spec.memory_bytes > user.quota.max_memory_bytes {
            return Err(OrchestratorError::Quota("memory quota exceeded".to_string()));
        }
        if user.usage.storage_bytes + spec.disk_bytes > user.quota.max_storage_bytes {
            return Err(OrchestratorError::Quota("storage quota exceeded".to_string()));
        }
        Ok(())
    }

    fn validate_system_labels(&self, labels: &HashMap<String, String>) -> Result<()> {
        match labels.get("system-role").map(|s| s.as_str()) {
            Some("dht" | "relay" | "blockstore" | "ingress") => Ok(()),
            Some(other) => Err(OrchestratorError::Validation(format!(
                "unknown system role {}",
                other
            ))),
            None => Err(OrchestratorError::Validation(
                "system VMs require a system-role label".to_string(),
            )),
        }
    }

    // =========================================================================
    // Scheduling step
    // =========================================================================

    /// Schedule a Pending VM onto a node and dispatch CreateVm.
    pub async fn schedule_vm(
        &self,
        vm_id: &str,
        password: Option<&str>,
        target_node_id: Option<&str>,
    ) -> Result<VirtualMachine> {
        let vm = self
            .store
            .get_vm(vm_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("vm {}", vm_id)))?;
        if vm.status != VmStatus::Pending {
            return Err(OrchestratorError::Validation(format!(
                "VM {} is {} and cannot be scheduled",
                vm_id, vm.status
            )));
        }

        let cost = ResourceCapacity {
            compute_points: self
                .config
                .scheduling
                .vm_point_cost(vm.spec.tier, vm.spec.cpu_cores),
            memory_bytes: vm.spec.memory_bytes,
            storage_bytes: vm.spec.disk_bytes,
        };

        let node = match target_node_id {
            Some(node_id) => self
                .store
                .get_node(node_id)
                .await
                .filter(|n| n.is_online())
                .ok_or_else(|| {
                    OrchestratorError::Capacity(format!("target node {} unavailable", node_id))
                })?,
            None => {
                let request = PlacementRequest {
                    cpu_cores: vm.spec.cpu_cores,
                    memory_bytes: vm.spec.memory_bytes,
                    disk_bytes: vm.spec.disk_bytes,
                    tier: vm.spec.tier,
                    preferred_region: vm.spec.region.clone(),
                    preferred_zone: vm.spec.zone.clone(),
                    required_arch: None,
                    gpu_passthrough: vm.spec.gpu_mode == GpuMode::Passthrough,
                };
                let candidates = self.store.get_active_nodes().await;
                self.scheduler
                    .select_best_node(&candidates, &request)
                    .ok_or_else(|| {
                        OrchestratorError::Capacity(format!(
                            "no node satisfies tier {} with {} vCPU",
                            vm.spec.tier, vm.spec.cpu_cores
                        ))
                    })?
            }
        };

        let (node, vm) = self
            .store
            .assign_vm_to_node(vm_id, &node.id, cost)
            .await
            .map_err(|e| OrchestratorError::Capacity(e.to_string()))?;

        let gpu_pci = match self.resolve_gpu(&node, &vm).await {
            Ok(gpu_pci) => gpu_pci,
            Err(e) => {
                self.unassign(vm_id).await;
                return Err(e);
            }
        };

        let Some(image_url) = self.config.image_url(&vm.spec.image_id).map(String::from) else {
            self.unassign(vm_id).await;
            return Err(OrchestratorError::Validation(format!(
                "unknown image {}",
                vm.spec.image_id
            )));
        };

        let user_data = cloudinit::render(
            vm.spec.user_data.as_deref(),
            &CloudInitContext {
                vm_name: vm.name.clone(),
                hostname: vm.name.clone(),
                ssh_public_key: vm.spec.ssh_public_key.clone(),
                password: password.map(String::from),
            },
        );

        let allowed_ports: Vec<u16> = vm.services.iter().filter_map(|s| s.port).collect();
        let payload = CreateVmPayload {
            vm_id: vm.id.clone(),
            name: vm.name.clone(),
            vm_type: format!("{:?}", vm.vm_type).to_lowercase(),
            owner_id: vm.owner_id.clone(),
            owner_wallet: vm.owner_wallet.clone(),
            virtual_cpu_cores: vm.spec.cpu_cores,
            memory_bytes: vm.spec.memory_bytes,
            disk_bytes: vm.spec.disk_bytes,
            quality_tier: vm.spec.tier.to_string(),
            compute_point_cost: cost.compute_points,
            base_image_url: image_url,
            ssh_public_key: vm.spec.ssh_public_key.clone(),
            gpu_mode: format!("{:?}", vm.spec.gpu_mode).to_lowercase(),
            gpu_pci_address: gpu_pci.clone(),
            deployment_mode: if vm.spec.container_image.is_some() {
                "container".to_string()
            } else {
                "image".to_string()
            },
            container_image: vm.spec.container_image.clone(),
            network: VmNetworkPayload {
                mac_address: generate_mac(),
                ip_address: None,
                gateway: None,
                vxlan_vni: None,
                allowed_ports,
            },
            password: password.map(String::from),
            user_data,
            // Sensitive labels travel in the command only
            labels: vm.labels.clone(),
            services: vm.services.clone(),
        };

        let command = NodeCommand::new(
            CommandType::CreateVm,
            &vm.id,
            serde_json::to_value(&payload)
                .map_err(|e| OrchestratorError::External(e.to_string()))?,
        );
        self.store
            .register_command(&command.command_id, &vm.id, &node.id, CommandType::CreateVm)
            .await;
        let command_id = command.command_id.clone();
        self.store.append_pending_command(&node.id, command).await;

        self.store
            .update_vm(vm_id, |vm| {
                vm.gpu_pci_address = gpu_pci.clone();
                vm.active_command = Some(ActiveCommand {
                    id: command_id.clone(),
                    command_type: CommandType::CreateVm,
                    issued_at: Utc::now(),
                });
                vm.billing.hourly_rate = billing_rate(&self.config, &vm.spec);
                strip_sensitive_labels(&mut vm.labels);
            })
            .await?;

        let vm = self
            .lifecycle
            .transition(
                vm_id,
                VmStatus::Provisioning,
                Some(format!("Creating on node {}", node.id)),
            )
            .await?;

        self.audit.vm_scheduled(vm_id, &node.id);
        info!(vm_id, node_id = %node.id, "VM scheduled");
        Ok(vm)
    }

    /// Undo a node assignment that could not be completed so the VM is
    /// schedulable again.
    async fn unassign(&self, vm_id: &str) {
        let _ = self.store.release_vm_resources(vm_id).await;
        let _ = self
            .store
            .update_vm(vm_id, |vm| {
                vm.node_id = None;
            })
            .await;
    }

    /// For passthrough, claim an available GPU on the node by PCI address.
    /// Proxied mode needs no device claim.
    async fn resolve_gpu(&self, node: &Node, vm: &VirtualMachine) -> Result<Option<String>> {
        if vm.spec.gpu_mode != GpuMode::Passthrough {
            return Ok(None);
        }
        let mut picked: Option<String> = None;
        self.store
            .update_node(&node.id, |node| {
                if let Some(gpu) = node.hardware.gpus.iter_mut().find(|g| g.available) {
                    gpu.available = false;
                    picked = Some(gpu.pci_address.clone());
                }
            })
            .await?;
        picked
            .map(Some)
            .ok_or_else(|| OrchestratorError::Capacity(format!("no available GPU on {}", node.id)))
    }

    /// Retry scheduling for VMs parked in Pending.
    pub async fn reschedule_pending(&self) -> usize {
        let pending = self.store.get_vms_by_status(VmStatus::Pending).await;
        let mut scheduled = 0;
        for vm in pending {
            // System VMs are retried by the obligation reconciler against
            // their target node
            if vm.node_id.is_some() || vm.is_system() {
                continue;
            }
            match self.schedule_vm(&vm.id, None, None).await {
                Ok(_) => scheduled += 1,
                Err(OrchestratorError::Capacity(_)) => {}
                Err(e) => warn!(vm_id = %vm.id, error = %e, "Reschedule attempt failed"),
            }
        }
        scheduled
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Delete a VM through the command protocol. Double deletion returns
    /// the current record without touching accounting.
    pub async fn delete(&self, vm_id: &str) -> Result<VirtualMachine> {
        let vm = self
            .store
            .get_vm(vm_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("vm {}", vm_id)))?;
        if matches!(vm.status, VmStatus::Deleting | VmStatus::Deleted) {
            return Ok(vm);
        }

        if let Some(node_id) = vm.node_id.clone() {
            let vm = self
                .lifecycle
                .transition(vm_id, VmStatus::Deleting, Some("Deletion requested".to_string()))
                .await?;
            let command = NodeCommand::new(
                CommandType::DeleteVm,
                vm_id,
                serde_json::to_value(DeleteVmPayload {
                    vm_id: vm_id.to_string(),
                })
                .map_err(|e| OrchestratorError::External(e.to_string()))?,
            );
            self.store
                .register_command(&command.command_id, vm_id, &node_id, CommandType::DeleteVm)
                .await;
            let command_id = command.command_id.clone();
            self.store.append_pending_command(&node_id, command).await;
            self.store
                .update_vm(vm_id, |vm| {
                    vm.active_command = Some(ActiveCommand {
                        id: command_id.clone(),
                        command_type: CommandType::DeleteVm,
                        issued_at: Utc::now(),
                    });
                })
                .await?;
            Ok(vm)
        } else {
            // Never reached a node: no command to wait for
            self.lifecycle
                .transition(vm_id, VmStatus::Deleting, Some("Deletion requested".to_string()))
                .await?;
            self.lifecycle
                .transition(vm_id, VmStatus::Deleted, None)
                .await
        }
    }

    /// Stop a running VM.
    pub async fn stop(&self, vm_id: &str) -> Result<VirtualMachine> {
        let vm = self
            .store
            .get_vm(vm_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("vm {}", vm_id)))?;
        if vm.status != VmStatus::Running {
            return Err(OrchestratorError::Validation(format!(
                "VM {} is {} and cannot be stopped",
                vm_id, vm.status
            )));
        }
        let node_id = vm.node_id.clone().ok_or_else(|| {
            OrchestratorError::Invariant(format!("running VM {} has no node", vm_id))
        })?;

        let command = NodeCommand::new(
            CommandType::StopVm,
            vm_id,
            serde_json::to_value(StopVmPayload {
                vm_id: vm_id.to_string(),
            })
            .map_err(|e| OrchestratorError::External(e.to_string()))?,
        );
        self.store
            .register_command(&command.command_id, vm_id, &node_id, CommandType::StopVm)
            .await;
        let command_id = command.command_id.clone();
        self.store.append_pending_command(&node_id, command).await;
        self.store
            .update_vm(vm_id, |vm| {
                vm.active_command = Some(ActiveCommand {
                    id: command_id.clone(),
                    command_type: CommandType::StopVm,
                    issued_at: Utc::now(),
                });
            })
            .await?;
        self.lifecycle
            .transition(vm_id, VmStatus::Stopping, Some("Stop requested".to_string()))
            .await
    }

    /// Start a stopped VM on its node.
    pub async fn start(&self, vm_id: &str) -> Result<VirtualMachine> {
        let vm = self
            .store
            .get_vm(vm_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("vm {}", vm_id)))?;
        if vm.status != VmStatus::Stopped {
            return Err(OrchestratorError::Validation(format!(
                "VM {} is {} and cannot be started",
                vm_id, vm.status
            )));
        }
        let node_id = vm.node_id.clone().ok_or_else(|| {
            OrchestratorError::Validation(format!("VM {} has no node to start on", vm_id))
        })?;

        let command = NodeCommand::new(
            CommandType::StartVm,
            vm_id,
            serde_json::json!({ "vmId": vm_id }),
        );
        self.store
            .register_command(&command.command_id, vm_id, &node_id, CommandType::StartVm)
            .await;
        let command_id = command.command_id.clone();
        self.store.append_pending_command(&node_id, command).await;
        self.store
            .update_vm(vm_id, |vm| {
                vm.active_command = Some(ActiveCommand {
                    id: command_id.clone(),
                    command_type: CommandType::StartVm,
                    issued_at: Utc::now(),
                });
            })
            .await?;
        self.lifecycle
            .transition(
                vm_id,
                VmStatus::Provisioning,
                Some("Start requested".to_string()),
            )
            .await
    }

    /// Store the wallet-encrypted password ciphertext.
    pub async fn secure_password(&self, vm_id: &str, ciphertext: String) -> Result<()> {
        self.store
            .update_vm(vm_id, |vm| {
                vm.secure_password = Some(ciphertext);
            })
            .await?;
        Ok(())
    }
}

fn billing_rate(config: &OrchestratorConfig, spec: &VmSpec) -> f64 {
    let points = config.scheduling.vm_point_cost(spec.tier, spec.cpu_cores);
    let multiplier = config
        .scheduling
        .tier(spec.tier)
        .map(|t| t.price_multiplier)
        .unwrap_or(1.0);
    points * config.scheduling.price_per_point_hour * multiplier
}

/// Remove secrets that must only travel inside the CreateVm command.
fn strip_sensitive_labels(labels: &mut HashMap<String, String>) {
    labels.retain(|k, _| !k.starts_with("wireguard-private") && !k.ends_with("private-key"));
}

fn generate_mac() -> String {
    let mut bytes = [0u8; 3];
    OsRng.fill_bytes(&mut bytes);
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_sensitive_labels() {
        let mut labels = HashMap::new();
        labels.insert("wireguard-private-key".to_string(), "secret".to_string());
        labels.insert("relay-private-key".to_string(), "secret".to_string());
        labels.insert("system-role".to_string(), "relay".to_string());
        strip_sensitive_labels(&mut labels);
        assert_eq!(labels.len(), 1);
        assert!(labels.contains_key("system-role"));
    }

    #[test]
    fn test_mac_is_locally_administered_qemu_prefix() {
        let mac = generate_mac();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
    }
}
