//! Node service: registration, heartbeat intake, acknowledgment routing.
//!
//! Registration is idempotent for a given (machine-id, wallet): the node
//! record is preserved across re-registrations, never recreated under a
//! new id. Heartbeats mark nodes online, reconcile VM state and drain the
//! pending-command queue into the response. Acknowledgments resolve their
//! VM through the command registry first and fall back to progressively
//! weaker lookups.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::audit::ApiAuditLogger;
use crate::auth;
use crate::command::{CommandAck, CommandType, NodeCommand};
use crate::config::{OrchestratorConfig, SchedulingConfig};
use crate::error::{OrchestratorError, Result};
use crate::evaluator::PerformanceEvaluator;
use crate::model::{
    CgnatInfo, DhtInfo, HardwareInventory, Node, NodeMetrics, NodePerformanceEvaluation,
    NodeStatus, ObligationStatus, OperatorPricing, Reputation, ResourceCapacity,
    ServiceReadiness, SystemVmObligation, SystemVmRole, VirtualMachine, VmServiceStatus, VmSpec,
    VmStatus, VmType,
};
use crate::services::ingress::IngressApi;
use crate::services::lifecycle::{transition_allowed, LifecycleManager};
use crate::services::relay::RelayCoordinator;
use crate::store::{DataStore, Event};

fn peer_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"peerId=([A-Za-z0-9]{20,})").expect("valid pattern"))
}

// =============================================================================
// Requests / responses
// =============================================================================

#[derive(Debug, Clone)]
pub struct RegisterNodeRequest {
    pub machine_id: String,
    pub wallet_address: String,
    /// Challenge message the wallet signed.
    pub message: String,
    pub signature: String,
    pub public_ip: String,
    pub agent_port: u16,
    pub hardware: HardwareInventory,
    pub architecture: String,
    pub agent_version: String,
    pub supported_images: Vec<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub pricing: Option<OperatorPricing>,
}

pub struct RegisterNodeResponse {
    pub node_id: String,
    pub evaluation: NodePerformanceEvaluation,
    /// Returned once; only a salted hash is stored.
    pub api_key: String,
    pub scheduling_config: SchedulingConfig,
    pub orchestrator_public_key: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub dht_bootstrap_peers: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceReport {
    pub name: String,
    pub status: String,
    pub message: Option<String>,
}

/// One VM as the node agent sees it.
#[derive(Debug, Clone, Default)]
pub struct ActiveVmReport {
    pub vm_id: String,
    pub name: Option<String>,
    pub state: String,
    pub owner_id: Option<String>,
    pub ip_address: Option<String>,
    pub vnc_host: Option<String>,
    pub vnc_port: Option<u16>,
    pub cpu_cores: Option<u32>,
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
    pub image_id: Option<String>,
    pub tier: Option<String>,
    pub status_message: Option<String>,
    pub services: Vec<ServiceReport>,
}

#[derive(Debug, Clone, Default)]
pub struct HeartbeatRequest {
    pub metrics: Option<NodeMetrics>,
    /// Node-local view of free resources; compared for drift, never
    /// written back.
    pub available_resources: Option<ResourceCapacity>,
    pub active_vms: Vec<ActiveVmReport>,
    pub cgnat_info: Option<CgnatInfo>,
    pub scheduling_config_version: Option<String>,
}

pub struct HeartbeatResponse {
    pub accepted: bool,
    pub commands: Vec<NodeCommand>,
    /// Present when the node's config version is stale.
    pub scheduling_config: Option<SchedulingConfig>,
    pub cgnat_info: Option<CgnatInfo>,
}

/// How an ack found its VM; recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckLookup {
    Registry,
    ActiveCommand,
    StatusMessageLegacy,
    DeletionStatusHeuristic,
}

impl AckLookup {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckLookup::Registry => "registry",
            AckLookup::ActiveCommand => "active_command",
            AckLookup::StatusMessageLegacy => "status_message_legacy",
            AckLookup::DeletionStatusHeuristic => "deletion_status_heuristic",
        }
    }
}

// =============================================================================
// Service
// =============================================================================

pub struct NodeService {
    store: Arc<DataStore>,
    config: Arc<OrchestratorConfig>,
    lifecycle: Arc<LifecycleManager>,
    relay: Arc<RelayCoordinator>,
    ingress: Arc<dyn IngressApi>,
    audit: Arc<ApiAuditLogger>,
    /// Orchestrator WireGuard public key, minted once on first use.
    wireguard_key: Mutex<Option<String>>,
}

impl NodeService {
    pub fn new(
        store: Arc<DataStore>,
        config: Arc<OrchestratorConfig>,
        lifecycle: Arc<LifecycleManager>,
        relay: Arc<RelayCoordinator>,
        ingress: Arc<dyn IngressApi>,
        audit: Arc<ApiAuditLogger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            lifecycle,
            relay,
            ingress,
            audit,
            wireguard_key: Mutex::new(None),
        })
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub async fn register(self: &Arc<Self>, req: RegisterNodeRequest) -> Result<RegisterNodeResponse> {
        if req.machine_id.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "machine id is required".to_string(),
            ));
        }
        let wallet = auth::validate_wallet_address(&req.wallet_address)?;
        auth::verify_wallet_signature(&req.message, &req.signature, &wallet)?;

        let node_id = auth::derive_node_id(&req.machine_id, &wallet);

        let evaluation = PerformanceEvaluator::evaluate(&req.hardware, &self.config.scheduling);
        if !evaluation.is_acceptable() {
            let reason = evaluation
                .rejection_reason
                .clone()
                .unwrap_or_else(|| "performance below minimum".to_string());
            self.audit.node_rejected(&req.machine_id, &reason);
            return Err(OrchestratorError::FailedPrecondition(reason));
        }
        let total = PerformanceEvaluator::total_capacity(&evaluation, &req.hardware);

        let api_key = auth::mint_node_token(&self.config.jwt, &node_id, &wallet, &req.machine_id)?;
        let api_key_hash = auth::hash_api_key(&api_key);

        let existing = self.store.get_node(&node_id).await;
        let is_new = existing.is_none();
        let now = Utc::now();

        let mut node = match existing {
            // Preserve scheduling state and platform records across
            // re-registration; only identity-adjacent fields and hardware
            // are overwritten.
            Some(previous) => Node {
                public_ip: req.public_ip.clone(),
                agent_port: req.agent_port,
                agent_version: req.agent_version.clone(),
                architecture: req.architecture.clone(),
                total,
                hardware: req.hardware.clone(),
                supported_images: req.supported_images.clone(),
                region: req.region.clone(),
                zone: req.zone.clone(),
                pricing: req.pricing.clone(),
                status: NodeStatus::Online,
                evaluation: Some(evaluation.clone()),
                scheduling_config_version: self.config.scheduling.version.clone(),
                api_key_hash,
                last_heartbeat: now,
                updated_at: now,
                ..previous
            },
            None => Node {
                id: node_id.clone(),
                machine_id: req.machine_id.clone(),
                wallet_address: wallet.clone(),
                public_ip: req.public_ip.clone(),
                agent_port: req.agent_port,
                agent_version: req.agent_version.clone(),
                architecture: req.architecture.clone(),
                total,
                reserved: ResourceCapacity::default(),
                hardware: req.hardware.clone(),
                supported_images: req.supported_images.clone(),
                region: req.region.clone(),
                zone: req.zone.clone(),
                pricing: req.pricing.clone(),
                status: NodeStatus::Online,
                metrics: None,
                reputation: Reputation {
                    uptime_percent: 100.0,
                    ..Default::default()
                },
                evaluation: Some(evaluation.clone()),
                scheduling_config_version: self.config.scheduling.version.clone(),
                obligations: Vec::new(),
                dht_info: None,
                relay_info: None,
                cgnat_info: None,
                api_key_hash,
                registered_at: now,
                last_heartbeat: now,
                updated_at: now,
            },
        };

        // Backfill any obligations the node's capabilities now call for
        for role in required_obligations(&req.hardware, &evaluation) {
            if node.obligation(role).is_none() {
                node.obligations.push(SystemVmObligation {
                    role,
                    status: ObligationStatus::Pending,
                    vm_id: None,
                });
            }
        }

        let nat_needs_relay = node.is_nat_traversed();
        self.store.save_node(node.clone()).await;
        if is_new {
            self.store.emit(Event::NodeRegistered(node.clone()));
        }
        self.audit.node_registered(&node_id, &wallet);
        info!(node_id, wallet, is_new, "Node registered");

        // Relay attachment failures never fail registration; the next
        // heartbeat reconciliation retries
        if nat_needs_relay {
            if let Err(e) = self.relay.reconcile(&node_id, None).await {
                warn!(node_id, error = %e, "Relay assignment failed, heartbeat will retry");
            }
        }

        Ok(RegisterNodeResponse {
            node_id,
            evaluation,
            api_key,
            scheduling_config: self.config.scheduling.clone(),
            orchestrator_public_key: Some(self.orchestrator_public_key().await),
            heartbeat_interval_secs: self.config.watchdog.heartbeat_interval_secs,
            dht_bootstrap_peers: self.dht_bootstrap_peers().await,
        })
    }

    /// Lazily initialize the orchestrator WireGuard key, double-checked
    /// behind a mutex so concurrent registrations mint it once.
    async fn orchestrator_public_key(&self) -> String {
        {
            let key = self.wireguard_key.lock().await;
            if let Some(key) = key.as_ref() {
                return key.clone();
            }
        }
        let mut key = self.wireguard_key.lock().await;
        if let Some(existing) = key.as_ref() {
            return existing.clone();
        }
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let minted = hex::encode(bytes);
        *key = Some(minted.clone());
        minted
    }

    async fn dht_bootstrap_peers(&self) -> Vec<String> {
        let mut peers = self.config.dht_bootstrap_peers.clone();
        for node in self.store.get_active_nodes().await {
            if let Some(dht) = &node.dht_info {
                if let Some(addr) = &dht.multiaddr {
                    peers.push(addr.clone());
                }
            }
        }
        peers
    }

    // =========================================================================
    // Heartbeat
    // =========================================================================

    pub async fn heartbeat(
        &self,
        node_id: &str,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        let node = self
            .store
            .get_node(node_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("node {}", node_id)))?;
        let was_offline = node.status == NodeStatus::Offline;

        let node = self
            .store
            .update_node(node_id, |node| {
                node.status = NodeStatus::Online;
                node.last_heartbeat = Utc::now();
                if let Some(metrics) = req.metrics.clone() {
                    node.metrics = Some(metrics);
                }
                if was_offline {
                    node.reputation.downtime_started_at = None;
                }
            })
            .await?;

        if was_offline {
            self.store.emit(Event::NodeOnline {
                id: node_id.to_string(),
            });
            self.audit.node_online(node_id);
        }

        // Reserved is the scheduling source of truth; node-reported free
        // resources are only compared for drift.
        if let Some(reported) = &req.available_resources {
            let free = node.free();
            let point_drift = (free.compute_points - reported.compute_points).abs();
            let memory_drift = free.memory_bytes.abs_diff(reported.memory_bytes);
            if point_drift > 1.0 || memory_drift > (1 << 30) {
                let detail = format!(
                    "tracked free {:.1}pts/{}MB, node reports {:.1}pts/{}MB",
                    free.compute_points,
                    free.memory_bytes / (1024 * 1024),
                    reported.compute_points,
                    reported.memory_bytes / (1024 * 1024),
                );
                debug!(node_id, %detail, "Resource drift detected");
                self.audit.resource_drift(node_id, &detail);
            }
        }

        if node.is_nat_traversed() {
            if let Err(e) = self.relay.reconcile(node_id, req.cgnat_info.clone()).await {
                warn!(node_id, error = %e, "CGNAT reconciliation failed");
            }
        }

        self.reconcile_vm_states(&node, &req.active_vms).await;

        let scheduling_config = if req.scheduling_config_version.as_deref()
            != Some(self.config.scheduling.version.as_str())
        {
            Some(self.config.scheduling.clone())
        } else {
            None
        };

        let commands = self.store.drain_pending_commands(node_id).await;
        let cgnat_info = self
            .store
            .get_node(node_id)
            .await
            .and_then(|n| n.cgnat_info);

        Ok(HeartbeatResponse {
            accepted: true,
            commands,
            scheduling_config,
            cgnat_info,
        })
    }

    // =========================================================================
    // VM-state reconciliation
    // =========================================================================

    async fn reconcile_vm_states(&self, node: &Node, reports: &[ActiveVmReport]) {
        for report in reports {
            match self.store.get_vm(&report.vm_id).await {
                Some(vm) => {
                    if let Err(e) = self.reconcile_known_vm(node, &vm, report).await {
                        warn!(vm_id = %report.vm_id, error = %e, "VM reconciliation failed");
                    }
                }
                None => {
                    if report.owner_id.is_some() {
                        if let Err(e) = self.recover_orphan(node, report).await {
                            warn!(vm_id = %report.vm_id, error = %e, "Orphan recovery failed");
                        }
                    } else {
                        debug!(vm_id = %report.vm_id, node_id = %node.id, "Node reports unknown VM without owner");
                    }
                }
            }
        }
    }

    async fn reconcile_known_vm(
        &self,
        node: &Node,
        vm: &VirtualMachine,
        report: &ActiveVmReport,
    ) -> Result<()> {
        // Discovered network details are always updated, even when the
        // status is unchanged.
        let node_ip = node.public_ip.clone();
        self.store
            .update_vm(&vm.id, |vm| {
                if let Some(ip) = &report.ip_address {
                    vm.network.private_ip = Some(ip.clone());
                    if vm.access.ssh_host.is_none() {
                        vm.access.ssh_host = Some(node_ip.clone());
                    }
                }
                if let Some(host) = &report.vnc_host {
                    vm.access.vnc_host = Some(host.clone());
                }
                if let Some(port) = report.vnc_port {
                    vm.access.vnc_port = Some(port);
                }
                for service_report in &report.services {
                    update_service_status(vm, service_report);
                }
            })
            .await?;

        if vm.is_system() && vm.system_role() == Some(SystemVmRole::Dht) {
            self.reconstruct_dht_info(node, vm, report).await?;
        }

        // Command-managed states are off limits: stale heartbeat data
        // races with the in-flight command.
        if vm.status.is_transitional() {
            return Ok(());
        }
        if let Some(parsed) = VmStatus::parse(&report.state) {
            if parsed != vm.status && transition_allowed(vm.status, parsed) {
                self.lifecycle
                    .transition(
                        &vm.id,
                        parsed,
                        Some(format!("Reconciled from node {}", node.id)),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Rebuild a missing DhtInfo from the running DHT system VM, pulling
    /// the libp2p peer id out of its service status message.
    async fn reconstruct_dht_info(
        &self,
        node: &Node,
        vm: &VirtualMachine,
        report: &ActiveVmReport,
    ) -> Result<()> {
        if node.dht_info.as_ref().is_some_and(|d| !d.peer_id.is_empty()) {
            return Ok(());
        }
        let haystacks = report
            .status_message
            .iter()
            .chain(report.services.iter().filter_map(|s| s.message.as_ref()));
        let Some(peer_id) = haystacks
            .filter_map(|m| peer_id_pattern().captures(m))
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .next()
        else {
            return Ok(());
        };

        let public_ip = node.public_ip.clone();
        self.store
            .update_node(&node.id, |node| {
                node.dht_info = Some(DhtInfo {
                    peer_id: peer_id.clone(),
                    listen_port: 4001,
                    multiaddr: Some(format!("/ip4/{}/tcp/4001/p2p/{}", public_ip, peer_id)),
                });
            })
            .await?;
        info!(node_id = %node.id, vm_id = %vm.id, "Reconstructed DHT info from running VM");
        Ok(())
    }

    /// Synthesize a VM record from a node report the control plane has no
    /// record of, typically after a control-plane restart.
    async fn recover_orphan(&self, node: &Node, report: &ActiveVmReport) -> Result<()> {
        let owner_id = report.owner_id.clone().unwrap_or_default();
        let status = VmStatus::parse(&report.state).unwrap_or(VmStatus::Running);
        let now = Utc::now();

        let spec = VmSpec {
            cpu_cores: report.cpu_cores.unwrap_or(1),
            memory_bytes: report.memory_bytes.unwrap_or(1 << 30),
            disk_bytes: report.disk_bytes.unwrap_or(10 << 30),
            image_id: report.image_id.clone().unwrap_or_default(),
            tier: report
                .tier
                .as_deref()
                .and_then(crate::model::QualityTier::parse)
                .unwrap_or_default(),
            ..Default::default()
        };

        let mut labels = std::collections::HashMap::new();
        labels.insert("recovered".to_string(), "true".to_string());
        labels.insert("recovery-node".to_string(), node.id.clone());

        let vm = VirtualMachine {
            id: report.vm_id.clone(),
            name: report
                .name
                .clone()
                .unwrap_or_else(|| format!("recovered-{}", &report.vm_id[..report.vm_id.len().min(8)])),
            owner_id: owner_id.clone(),
            owner_wallet: None,
            vm_type: VmType::Standard,
            spec: spec.clone(),
            status,
            status_message: Some(format!("Recovered from node {}", node.id)),
            power_state: if status == VmStatus::Running {
                crate::model::PowerState::Running
            } else {
                crate::model::PowerState::Off
            },
            node_id: Some(node.id.clone()),
            reserved_cost: None,
            gpu_pci_address: None,
            network: crate::model::NetworkConfig {
                private_ip: report.ip_address.clone(),
                ..Default::default()
            },
            access: Default::default(),
            active_command: None,
            billing: Default::default(),
            services: vec![VmServiceStatus::system()],
            labels,
            secure_password: None,
            created_at: now,
            updated_at: now,
        };

        self.store.save_vm(vm.clone()).await;

        // Charge the node and the owner so accounting matches reality
        let cost = ResourceCapacity {
            compute_points: self
                .config
                .scheduling
                .vm_point_cost(spec.tier, spec.cpu_cores),
            memory_bytes: spec.memory_bytes,
            storage_bytes: spec.disk_bytes,
        };
        if let Err(e) = self.store.assign_vm_to_node(&vm.id, &node.id, cost).await {
            warn!(vm_id = %vm.id, error = %e, "Could not reserve resources for recovered VM");
        }
        self.store.get_or_create_user(&owner_id, None).await;
        let charged_spec = spec.clone();
        let _ = self
            .store
            .update_user(&owner_id, |user| user.usage.charge(&charged_spec))
            .await;

        self.store.emit(Event::VmRecovered(vm.clone()));
        self.audit.vm_recovered(&vm.id, &node.id);
        info!(vm_id = %vm.id, node_id = %node.id, "Recovered orphan VM");

        if status == VmStatus::Running {
            if let Err(e) = self.ingress.on_vm_started(&vm).await {
                warn!(vm_id = %vm.id, error = %e, "Ingress registration for recovered VM failed");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Acknowledgments
    // =========================================================================

    /// Process a command acknowledgment. The ack path never fails the
    /// node: an unresolvable command is logged as orphaned and the call
    /// still succeeds.
    pub async fn acknowledge(&self, node_id: &str, command_id: &str, ack: CommandAck) -> Result<()> {
        let Some((vm, command_type, lookup)) = self.resolve_ack(node_id, command_id).await else {
            if self.store.was_command_completed(command_id).await {
                debug!(command_id, "Duplicate ack for completed command");
                return Ok(());
            }
            self.store.emit(Event::CommandOrphaned {
                node_id: node_id.to_string(),
                command_id: command_id.to_string(),
            });
            self.audit.orphaned_command(command_id, node_id);
            return Ok(());
        };

        self.audit.ack_resolved(command_id, &vm.id, lookup.as_str());
        debug!(command_id, vm_id = %vm.id, lookup = lookup.as_str(), "Ack resolved");

        self.lifecycle.clear_active_command(&vm.id).await?;

        if !ack.success {
            let error = ack.error_message.clone().unwrap_or_default();
            if vm.status == VmStatus::Deleting && is_not_found_error(&error) {
                // The node no longer has the VM: deletion already
                // happened, reconcile instead of erroring
                self.lifecycle
                    .transition(&vm.id, VmStatus::Deleted, Some(error))
                    .await?;
            } else {
                self.lifecycle
                    .transition(&vm.id, VmStatus::Error, Some(error))
                    .await?;
            }
            return Ok(());
        }

        match command_type {
            Some(CommandType::CreateVm) | Some(CommandType::StartVm) => {
                let data = ack.parsed_data();
                if let Some(ip) = data.private_ip {
                    self.store
                        .update_vm(&vm.id, |vm| {
                            vm.network.private_ip = Some(ip.clone());
                        })
                        .await?;
                }
                self.lifecycle
                    .transition(&vm.id, VmStatus::Running, Some("Node reported ready".to_string()))
                    .await?;
                if command_type == Some(CommandType::CreateVm) {
                    let _ = self
                        .store
                        .update_node(node_id, |node| {
                            node.reputation.total_vms_hosted += 1;
                        })
                        .await;
                }
            }
            Some(CommandType::StopVm) => {
                self.lifecycle
                    .transition(&vm.id, VmStatus::Stopped, Some("Stopped by node".to_string()))
                    .await?;
            }
            Some(CommandType::DeleteVm) => {
                self.lifecycle
                    .transition(&vm.id, VmStatus::Deleted, Some("Deleted by node".to_string()))
                    .await?;
                let _ = self
                    .store
                    .update_node(node_id, |node| {
                        node.reputation.successful_completions += 1;
                    })
                    .await;
            }
            Some(CommandType::AllocatePort) => {
                let data = ack.parsed_data();
                let public_port = data.public_port.unwrap_or(0);
                let vm_port = data.vm_port;
                let protocol = data.protocol.clone();
                self.store
                    .update_vm(&vm.id, |vm| {
                        let mapping = match (vm_port, protocol.as_deref()) {
                            (Some(port), Some(proto)) => vm.network.mapping_mut(port, proto),
                            _ => vm
                                .network
                                .port_mappings
                                .iter_mut()
                                .find(|m| m.public_port == 0),
                        };
                        if let Some(mapping) = mapping {
                            mapping.public_port = public_port;
                        }
                    })
                    .await?;
                if public_port != 0 {
                    self.audit
                        .port_allocated(&vm.id, vm_port.unwrap_or(0), public_port);
                }
            }
            Some(CommandType::RemovePort) => {
                // Mapping was removed when the command was issued
            }
            None => {
                debug!(command_id, vm_id = %vm.id, "Ack without a known command type, cleared only");
            }
        }
        Ok(())
    }

    /// Multi-strategy lookup: registry, then the VM's recorded active
    /// command id, then a status-message substring, then the
    /// deleting-VM heuristic.
    async fn resolve_ack(
        &self,
        node_id: &str,
        command_id: &str,
    ) -> Option<(VirtualMachine, Option<CommandType>, AckLookup)> {
        if let Some(registration) = self.store.try_complete_command(command_id).await {
            if let Some(vm) = self.store.get_vm(&registration.vm_id).await {
                return Some((vm, Some(registration.command_type), AckLookup::Registry));
            }
            warn!(command_id, vm_id = %registration.vm_id, "Registry entry points at missing VM");
            return None;
        }

        let node_vms = self.store.get_vms_by_node(node_id).await;

        if let Some(vm) = node_vms
            .iter()
            .find(|vm| vm.active_command.as_ref().is_some_and(|c| c.id == command_id))
        {
            let command_type = vm.active_command.as_ref().map(|c| c.command_type);
            return Some((vm.clone(), command_type, AckLookup::ActiveCommand));
        }

        if let Some(vm) = node_vms.iter().find(|vm| {
            vm.status_message
                .as_ref()
                .is_some_and(|m| m.contains(command_id))
        }) {
            let command_type = vm
                .active_command
                .as_ref()
                .map(|c| c.command_type)
                .or_else(|| infer_command_type(vm));
            return Some((vm.clone(), command_type, AckLookup::StatusMessageLegacy));
        }

        // DeleteVm only: any VM on this node still in Deleting
        let mut deleting: Vec<&VirtualMachine> = node_vms
            .iter()
            .filter(|vm| vm.status == VmStatus::Deleting)
            .collect();
        deleting.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(vm) = deleting.first() {
            return Some((
                (*vm).clone(),
                Some(CommandType::DeleteVm),
                AckLookup::DeletionStatusHeuristic,
            ));
        }

        None
    }

    // =========================================================================
    // Health watchdog
    // =========================================================================

    /// Mark silent nodes offline, error their running VMs, and keep
    /// reputation counters for nodes that stay offline. Returns how many
    /// nodes were newly marked offline.
    pub async fn check_node_health(&self, now: DateTime<Utc>) -> usize {
        let threshold = chrono::Duration::seconds(self.config.watchdog.offline_after_secs as i64);
        let today = now.format("%Y-%m-%d").to_string();
        let mut marked = 0;

        for node in self.store.get_all_nodes().await {
            match node.status {
                NodeStatus::Online if now - node.last_heartbeat > threshold => {
                    marked += 1;
                    let day = today.clone();
                    let _ = self
                        .store
                        .update_node(&node.id, |node| {
                            node.status = NodeStatus::Offline;
                            node.reputation.downtime_started_at = Some(now);
                            *node
                                .reputation
                                .failed_heartbeats_by_day
                                .entry(day)
                                .or_insert(0) += 1;
                        })
                        .await;
                    self.store.emit(Event::NodeOffline {
                        id: node.id.clone(),
                    });
                    self.audit.node_offline(&node.id);
                    warn!(node_id = %node.id, "Node missed heartbeats, marked offline");

                    for vm in self.store.get_vms_by_node(&node.id).await {
                        if vm.status == VmStatus::Running || vm.status == VmStatus::Provisioning {
                            let _ = self
                                .lifecycle
                                .transition(
                                    &vm.id,
                                    VmStatus::Error,
                                    Some(format!("Node {} went offline", node.id)),
                                )
                                .await;
                        }
                    }
                }
                NodeStatus::Offline => {
                    // Accumulate the ongoing outage for reputation. One
                    // miss is an expected interval plus its grace.
                    let beat = self.config.watchdog.heartbeat_interval_secs
                        + self.config.watchdog.heartbeat_grace_secs;
                    let misses =
                        (self.config.watchdog.check_interval_secs / beat.max(1)).max(1) as u32;
                    let day = today.clone();
                    let _ = self
                        .store
                        .update_node(&node.id, |node| {
                            *node
                                .reputation
                                .failed_heartbeats_by_day
                                .entry(day)
                                .or_insert(0) += misses;
                            node.reputation.uptime_percent =
                                (node.reputation.uptime_percent - 0.1).max(0.0);
                        })
                        .await;
                }
                _ => {}
            }
        }
        marked
    }

    /// Explicit removal: the node stops being a scheduling target and its
    /// running VMs are errored. The record is kept for audit history.
    pub async fn decommission(&self, node_id: &str) -> Result<Node> {
        let node = self
            .store
            .update_node(node_id, |node| {
                node.status = NodeStatus::Decommissioned;
            })
            .await?;
        self.store.emit(Event::NodeDecommissioned {
            id: node_id.to_string(),
        });
        for vm in self.store.get_vms_by_node(node_id).await {
            if matches!(vm.status, VmStatus::Running | VmStatus::Provisioning) {
                let _ = self
                    .lifecycle
                    .transition(
                        &vm.id,
                        VmStatus::Error,
                        Some(format!("Node {} was decommissioned", node_id)),
                    )
                    .await;
            }
        }
        Ok(node)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Case-insensitive "not found" or the exact NOT_FOUND code.
fn is_not_found_error(error: &str) -> bool {
    error == "NOT_FOUND" || error.to_lowercase().contains("not found")
}

/// Best-effort command type from the VM's transitional state, for legacy
/// lookups that lost the active-command record.
fn infer_command_type(vm: &VirtualMachine) -> Option<CommandType> {
    match vm.status {
        VmStatus::Provisioning => Some(CommandType::CreateVm),
        VmStatus::Stopping => Some(CommandType::StopVm),
        VmStatus::Deleting => Some(CommandType::DeleteVm),
        _ => None,
    }
}

/// Apply a node-side service report. A service already Ready must not
/// regress to TimedOut: the agent's local timer may fire after the
/// service actually came up.
fn update_service_status(vm: &mut VirtualMachine, report: &ServiceReport) {
    let Some(service) = vm.service_mut(&report.name) else {
        return;
    };
    let new_status = match report.status.to_lowercase().as_str() {
        "ready" => ServiceReadiness::Ready,
        "failed" => ServiceReadiness::Failed,
        "timedout" | "timed_out" => ServiceReadiness::TimedOut,
        _ => ServiceReadiness::Pending,
    };
    if service.status == ServiceReadiness::Ready && new_status == ServiceReadiness::TimedOut {
        return;
    }
    if new_status == ServiceReadiness::Ready && service.ready_at.is_none() {
        service.ready_at = Some(Utc::now());
    }
    service.status = new_status;
    if report.message.is_some() {
        service.status_message = report.message.clone();
    }
}

/// Which system-VM roles a node's capabilities call for.
fn required_obligations(
    hardware: &HardwareInventory,
    evaluation: &NodePerformanceEvaluation,
) -> Vec<SystemVmRole> {
    let mut roles = vec![SystemVmRole::Dht];
    let network = &hardware.network;
    if !network.nat_type.is_traversed() && network.public_ip.is_some() {
        if network.bandwidth_mbps >= 100 && evaluation.points_per_core >= 1.0 {
            roles.push(SystemVmRole::Relay);
        }
        if hardware.memory_bytes >= 8 << 30 {
            roles.push(SystemVmRole::Ingress);
        }
    }
    if hardware.total_storage_bytes() >= 500 << 30 {
        roles.push(SystemVmRole::BlockStore);
    }
    roles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NetworkConfig;

    fn vm_with_status(status: VmStatus) -> VirtualMachine {
        VirtualMachine {
            id: "vm-1".to_string(),
            name: "vm-1".to_string(),
            owner_id: "user-1".to_string(),
            owner_wallet: None,
            vm_type: Default::default(),
            spec: Default::default(),
            status,
            status_message: None,
            power_state: Default::default(),
            node_id: None,
            reserved_cost: None,
            gpu_pci_address: None,
            network: NetworkConfig::default(),
            access: Default::default(),
            active_command: None,
            billing: Default::default(),
            services: vec![VmServiceStatus::system()],
            labels: Default::default(),
            secure_password: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_not_found_patterns() {
        assert!(is_not_found_error("NOT_FOUND"));
        assert!(is_not_found_error("domain not found"));
        assert!(is_not_found_error("VM Not Found on host"));
        assert!(!is_not_found_error("disk full"));
    }

    #[test]
    fn test_infer_command_type_from_transitional_state() {
        assert_eq!(
            infer_command_type(&vm_with_status(VmStatus::Provisioning)),
            Some(CommandType::CreateVm)
        );
        assert_eq!(
            infer_command_type(&vm_with_status(VmStatus::Deleting)),
            Some(CommandType::DeleteVm)
        );
        assert_eq!(infer_command_type(&vm_with_status(VmStatus::Running)), None);
    }

    #[test]
    fn test_ready_service_never_regresses_to_timed_out() {
        let mut vm = vm_with_status(VmStatus::Running);
        update_service_status(
            &mut vm,
            &ServiceReport {
                name: "System".to_string(),
                status: "ready".to_string(),
                message: None,
            },
        );
        assert_eq!(vm.services[0].status, ServiceReadiness::Ready);
        assert!(vm.services[0].ready_at.is_some());

        update_service_status(
            &mut vm,
            &ServiceReport {
                name: "System".to_string(),
                status: "timedout".to_string(),
                message: Some("agent timer fired late".to_string()),
            },
        );
        assert_eq!(vm.services[0].status, ServiceReadiness::Ready);

        // Failure is a real regression and does apply
        update_service_status(
            &mut vm,
            &ServiceReport {
                name: "System".to_string(),
                status: "failed".to_string(),
                message: None,
            },
        );
        assert_eq!(vm.services[0].status, ServiceReadiness::Failed);
    }

    #[test]
    fn test_peer_id_extraction() {
        let captures = peer_id_pattern()
            .captures("dht ready peerId=12D3KooWBmwkafWE2fqcs4Nq4sJrzgYme3mkx8s4jKZmEDHBXSMm up 4h")
            .unwrap();
        assert_eq!(
            &captures[1],
            "12D3KooWBmwkafWE2fqcs4Nq4sJrzgYme3mkx8s4jKZmEDHBXSMm"
        );
        assert!(peer_id_pattern().captures("peerId=short").is_none());
    }

    #[test]
    fn test_required_obligations() {
        let config = crate::config::SchedulingConfig::default();
        let mut hardware = HardwareInventory {
            cpu: crate::model::CpuInfo {
                model: "test".to_string(),
                physical_cores: 8,
                benchmark_score: 2000.0,
            },
            memory_bytes: 16 << 30,
            storage: vec![crate::model::StorageDevice {
                device_type: crate::model::StorageDeviceType::Nvme,
                capacity_bytes: 1 << 40,
            }],
            network: crate::model::NetworkInfo {
                nat_type: crate::model::NatType::None,
                bandwidth_mbps: 1000,
                public_ip: Some("198.51.100.10".to_string()),
            },
            gpus: vec![],
        };
        let evaluation = PerformanceEvaluator::evaluate(&hardware, &config);
        let roles = required_obligations(&hardware, &evaluation);
        assert!(roles.contains(&SystemVmRole::Dht));
        assert!(roles.contains(&SystemVmRole::Relay));
        assert!(roles.contains(&SystemVmRole::Ingress));
        assert!(roles.contains(&SystemVmRole::BlockStore));

        hardware.network.nat_type = crate::model::NatType::Cgnat;
        let roles = required_obligations(&hardware, &evaluation);
        assert!(!roles.contains(&SystemVmRole::Relay));
        assert!(!roles.contains(&SystemVmRole::Ingress));
    }

    #[test]
    fn test_ack_lookup_labels() {
        assert_eq!(AckLookup::Registry.as_str(), "registry");
        assert_eq!(
            AckLookup::StatusMessageLegacy.as_str(),
            "status_message_legacy"
        );
    }
}
