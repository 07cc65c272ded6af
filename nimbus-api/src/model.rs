//! Domain model for the nimbus control plane.
//!
//! Nodes reference VMs (and each other, in the relay topology) by id only.
//! All traversal goes through the DataStore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::command::CommandType;

// =============================================================================
// Resource accounting
// =============================================================================

/// A resource vector: normalized compute points, memory, storage.
///
/// Compute points are fractional (`benchmark / baseline * cores`), so they
/// are carried as f64; memory and storage are byte counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceCapacity {
    pub compute_points: f64,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
}

impl ResourceCapacity {
    pub fn new(compute_points: f64, memory_bytes: u64, storage_bytes: u64) -> Self {
        Self {
            compute_points,
            memory_bytes,
            storage_bytes,
        }
    }

    /// True if `other` fits inside what remains of `self` after `used`.
    pub fn can_accommodate(&self, used: &ResourceCapacity, other: &ResourceCapacity) -> bool {
        self.compute_points - used.compute_points >= other.compute_points
            && self.memory_bytes.saturating_sub(used.memory_bytes) >= other.memory_bytes
            && self.storage_bytes.saturating_sub(used.storage_bytes) >= other.storage_bytes
    }

    /// Add `other` to this vector.
    pub fn reserve(&mut self, other: &ResourceCapacity) {
        self.compute_points += other.compute_points;
        self.memory_bytes += other.memory_bytes;
        self.storage_bytes += other.storage_bytes;
    }

    /// Subtract `other`, flooring every dimension at zero. Survives
    /// re-ordered or duplicate release events.
    pub fn release(&mut self, other: &ResourceCapacity) {
        self.compute_points = (self.compute_points - other.compute_points).max(0.0);
        self.memory_bytes = self.memory_bytes.saturating_sub(other.memory_bytes);
        self.storage_bytes = self.storage_bytes.saturating_sub(other.storage_bytes);
    }

    /// True if any dimension of `self` exceeds the corresponding dimension
    /// of `total`. Used for invariant observation only.
    pub fn exceeds(&self, total: &ResourceCapacity) -> bool {
        self.compute_points > total.compute_points + f64::EPSILON
            || self.memory_bytes > total.memory_bytes
            || self.storage_bytes > total.storage_bytes
    }

    pub fn is_zero(&self) -> bool {
        self.compute_points == 0.0 && self.memory_bytes == 0 && self.storage_bytes == 0
    }
}

// =============================================================================
// Quality tiers
// =============================================================================

/// SLA class a VM is sold under. Each tier has its own overcommit ratio and
/// price multiplier in the scheduling config.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Guaranteed,
    #[default]
    Standard,
    Balanced,
    Burstable,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Guaranteed => "guaranteed",
            QualityTier::Standard => "standard",
            QualityTier::Balanced => "balanced",
            QualityTier::Burstable => "burstable",
        }
    }

    pub fn parse(s: &str) -> Option<QualityTier> {
        match s.to_lowercase().as_str() {
            "guaranteed" => Some(QualityTier::Guaranteed),
            "standard" => Some(QualityTier::Standard),
            "balanced" => Some(QualityTier::Balanced),
            "burstable" => Some(QualityTier::Burstable),
            _ => None,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Hardware inventory
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CpuInfo {
    pub model: String,
    pub physical_cores: u32,
    /// Raw benchmark score for one core.
    pub benchmark_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDeviceType {
    Nvme,
    Ssd,
    Hdd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDevice {
    pub device_type: StorageDeviceType,
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDevice {
    pub model: String,
    pub pci_address: String,
    pub memory_bytes: u64,
    /// False while passed through to a VM.
    pub available: bool,
}

/// NAT classification of the node's network path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    #[default]
    None,
    FullCone,
    Symmetric,
    Cgnat,
}

impl NatType {
    /// True when the control plane cannot reach the node directly.
    pub fn is_traversed(&self) -> bool {
        matches!(self, NatType::Symmetric | NatType::Cgnat)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkInfo {
    pub nat_type: NatType,
    pub bandwidth_mbps: u64,
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HardwareInventory {
    pub cpu: CpuInfo,
    pub memory_bytes: u64,
    pub storage: Vec<StorageDevice>,
    pub gpus: Vec<GpuDevice>,
    pub network: NetworkInfo,
}

impl HardwareInventory {
    pub fn total_storage_bytes(&self) -> u64 {
        self.storage.iter().map(|d| d.capacity_bytes).sum()
    }
}

// =============================================================================
// Performance evaluation
// =============================================================================

/// Coarse class derived from points-per-core against the tier thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceClass {
    Premium,
    Enhanced,
    Standard,
    Basic,
}

/// Per-tier outcome of the evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierCapability {
    pub tier: QualityTier,
    pub eligible: bool,
    pub required_points_per_vcpu: f64,
    /// Overcommit ratio: how many vCPUs one physical core may carry.
    pub max_vcpus_per_core: u32,
    pub price_multiplier: f64,
    pub ineligibility_reason: Option<String>,
}

/// Cached per-node evaluation. Depends only on the hardware inventory and
/// the scheduling-config version, both recorded here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePerformanceEvaluation {
    pub benchmark_score: f64,
    /// Benchmark capped at max-multiplier x baseline.
    pub capped_score: f64,
    /// Single source of truth for downstream capacity math.
    pub points_per_core: f64,
    pub performance_class: Option<PerformanceClass>,
    pub eligible_tiers: Vec<QualityTier>,
    pub highest_tier: Option<QualityTier>,
    pub tier_capabilities: Vec<TierCapability>,
    pub rejection_reason: Option<String>,
    pub config_version: String,
    pub evaluated_at: DateTime<Utc>,
}

impl NodePerformanceEvaluation {
    pub fn is_acceptable(&self) -> bool {
        self.rejection_reason.is_none() && !self.eligible_tiers.is_empty()
    }

    pub fn supports_tier(&self, tier: QualityTier) -> bool {
        self.eligible_tiers.contains(&tier)
    }

    pub fn tier_capability(&self, tier: QualityTier) -> Option<&TierCapability> {
        self.tier_capabilities.iter().find(|c| c.tier == tier)
    }
}

// =============================================================================
// Relay / DHT / CGNAT records
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtInfo {
    pub peer_id: String,
    pub listen_port: u16,
    pub multiaddr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Active,
    Degraded,
    Offline,
}

/// State of a relay-capable node. CGNAT peers are referenced by node id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInfo {
    pub relay_vm_id: String,
    /// Small integer n mapping to the 10.200.n.0/24 tunnel subnet.
    /// Unique among active relays.
    pub relay_subnet: u8,
    pub wireguard_public_key: String,
    pub wireguard_endpoint: String,
    pub connected_node_ids: Vec<String>,
    pub status: RelayStatus,
}

impl RelayInfo {
    pub fn subnet_cidr(&self) -> String {
        format!("10.200.{}.0/24", self.relay_subnet)
    }

    /// Remaining tunnel addresses (hosts 2..=254, gateway excluded).
    pub fn available_slots(&self) -> usize {
        253usize.saturating_sub(self.connected_node_ids.len())
    }
}

/// Assignment of a CGNAT node to its relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CgnatInfo {
    pub assigned_relay_node_id: String,
    pub tunnel_ip: String,
}

// =============================================================================
// System-VM obligations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemVmRole {
    Dht,
    Relay,
    BlockStore,
    Ingress,
}

impl SystemVmRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemVmRole::Dht => "dht",
            SystemVmRole::Relay => "relay",
            SystemVmRole::BlockStore => "blockstore",
            SystemVmRole::Ingress => "ingress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObligationStatus {
    #[default]
    Pending,
    Deploying,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemVmObligation {
    pub role: SystemVmRole,
    pub status: ObligationStatus,
    pub vm_id: Option<String>,
}

// =============================================================================
// Node
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Online,
    Offline,
    Draining,
    Decommissioned,
}

/// Latest metrics snapshot reported by the node agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeMetrics {
    pub load_average: f64,
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_free_mb: u64,
    pub disk_used_bytes: u64,
}

/// Reputation counters kept per node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Reputation {
    pub uptime_percent: f64,
    pub total_vms_hosted: u64,
    pub successful_completions: u64,
    /// Missed heartbeats per UTC day (`YYYY-MM-DD`).
    pub failed_heartbeats_by_day: HashMap<String, u32>,
    pub downtime_started_at: Option<DateTime<Utc>>,
}

/// Operator-set pricing for the node's resources.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OperatorPricing {
    pub price_per_core_hour: f64,
    pub price_per_gb_memory_hour: f64,
    pub price_per_gb_storage_hour: f64,
}

/// A registered worker node.
///
/// Identity is stable across re-registrations: the id is derived from
/// (machine-id, owner wallet) and the record is preserved, never recreated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub machine_id: String,
    pub wallet_address: String,
    pub public_ip: String,
    pub agent_port: u16,
    pub agent_version: String,
    pub architecture: String,

    /// Total capacity, computed from the performance evaluation.
    pub total: ResourceCapacity,
    /// Reserved capacity; the scheduling source of truth.
    /// Invariant: reserved <= total on every dimension.
    pub reserved: ResourceCapacity,

    pub hardware: HardwareInventory,
    pub supported_images: Vec<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub pricing: Option<OperatorPricing>,

    pub status: NodeStatus,
    pub metrics: Option<NodeMetrics>,
    pub reputation: Reputation,
    pub evaluation: Option<NodePerformanceEvaluation>,
    pub scheduling_config_version: String,

    pub obligations: Vec<SystemVmObligation>,
    pub dht_info: Option<DhtInfo>,
    pub relay_info: Option<RelayInfo>,
    pub cgnat_info: Option<CgnatInfo>,

    /// Salted hash of the node's bearer credential. The credential itself
    /// is returned once at registration and never stored.
    pub api_key_hash: String,

    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Free capacity from the scheduler's perspective.
    pub fn free(&self) -> ResourceCapacity {
        ResourceCapacity {
            compute_points: (self.total.compute_points - self.reserved.compute_points).max(0.0),
            memory_bytes: self.total.memory_bytes.saturating_sub(self.reserved.memory_bytes),
            storage_bytes: self
                .total
                .storage_bytes
                .saturating_sub(self.reserved.storage_bytes),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    /// True when this node needs a relay to be reachable.
    pub fn is_nat_traversed(&self) -> bool {
        self.hardware.network.nat_type.is_traversed()
    }

    pub fn is_relay(&self) -> bool {
        self.relay_info.is_some()
    }

    pub fn obligation(&self, role: SystemVmRole) -> Option<&SystemVmObligation> {
        self.obligations.iter().find(|o| o.role == role)
    }

    pub fn obligation_mut(&mut self, role: SystemVmRole) -> Option<&mut SystemVmObligation> {
        self.obligations.iter_mut().find(|o| o.role == role)
    }
}

// =============================================================================
// Virtual machine
// =============================================================================

/// VM lifecycle status.
///
/// Pending -> Provisioning -> Running -> (Stopping -> Stopped)* ->
/// Deleting -> Deleted, with Error reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    #[default]
    Pending,
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Deleting,
    Deleted,
    Error,
}

impl VmStatus {
    /// Command-managed states. Heartbeat state updates must not overwrite
    /// the status while a command is in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            VmStatus::Provisioning | VmStatus::Stopping | VmStatus::Deleting
        )
    }

    pub fn is_terminal(&self) -> bool {
        *self == VmStatus::Deleted
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Pending => "pending",
            VmStatus::Provisioning => "provisioning",
            VmStatus::Running => "running",
            VmStatus::Stopping => "stopping",
            VmStatus::Stopped => "stopped",
            VmStatus::Deleting => "deleting",
            VmStatus::Deleted => "deleted",
            VmStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<VmStatus> {
        match s.to_lowercase().as_str() {
            "pending" => Some(VmStatus::Pending),
            "provisioning" | "creating" => Some(VmStatus::Provisioning),
            "running" => Some(VmStatus::Running),
            "stopping" => Some(VmStatus::Stopping),
            "stopped" | "shutoff" => Some(VmStatus::Stopped),
            "deleting" => Some(VmStatus::Deleting),
            "deleted" => Some(VmStatus::Deleted),
            "error" | "failed" => Some(VmStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Paused,
    #[default]
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuMode {
    #[default]
    None,
    Passthrough,
    Proxied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    #[default]
    Standard,
    Inference,
    System,
}

/// Desired shape of a VM. Immutable once a non-system VM reaches Running.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VmSpec {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub image_id: String,
    pub tier: QualityTier,
    pub gpu_mode: GpuMode,
    pub container_image: Option<String>,
    pub ssh_public_key: Option<String>,
    pub template_id: Option<String>,
    pub user_data: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
}

/// Externally exposed port of a VM. public_port 0 means allocation is
/// still in flight on the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub vm_port: u16,
    pub public_port: u16,
    pub protocol: String,
    pub dns_record_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    pub private_ip: Option<String>,
    pub hostname: Option<String>,
    pub port_mappings: Vec<PortMapping>,
    pub overlay_network_id: Option<String>,
}

impl NetworkConfig {
    pub fn mapping(&self, vm_port: u16, protocol: &str) -> Option<&PortMapping> {
        self.port_mappings
            .iter()
            .find(|m| m.vm_port == vm_port && m.protocol == protocol)
    }

    pub fn mapping_mut(&mut self, vm_port: u16, protocol: &str) -> Option<&mut PortMapping> {
        self.port_mappings
            .iter_mut()
            .find(|m| m.vm_port == vm_port && m.protocol == protocol)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccessInfo {
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub vnc_host: Option<String>,
    pub vnc_port: Option<u16>,
}

/// The command currently in flight for a VM. Cleared on ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveCommand {
    pub id: String,
    pub command_type: CommandType,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BillingInfo {
    pub hourly_rate: f64,
    pub billed_since: Option<DateTime<Utc>>,
}

/// How readiness of a VM service is checked on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCheckType {
    #[default]
    CloudInitDone,
    TcpPort,
    HttpGet,
    ExecCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceReadiness {
    #[default]
    Pending,
    Ready,
    Failed,
    TimedOut,
}

/// Per-service readiness tracked on a VM. At least one implicit `System`
/// service (cloud-init completion) is always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmServiceStatus {
    pub name: String,
    pub port: Option<u16>,
    pub protocol: Option<String>,
    pub check_type: ServiceCheckType,
    pub http_path: Option<String>,
    pub exec_command: Option<String>,
    pub timeout_seconds: u32,
    pub status: ServiceReadiness,
    pub ready_at: Option<DateTime<Utc>>,
    pub status_message: Option<String>,
}

impl VmServiceStatus {
    /// The implicit cloud-init completion service every VM carries.
    pub fn system() -> Self {
        Self {
            name: "System".to_string(),
            port: None,
            protocol: None,
            check_type: ServiceCheckType::CloudInitDone,
            http_path: None,
            exec_command: None,
            timeout_seconds: 300,
            status: ServiceReadiness::Pending,
            ready_at: None,
            status_message: None,
        }
    }

    pub fn tcp(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            port: Some(port),
            protocol: Some("tcp".to_string()),
            check_type: ServiceCheckType::TcpPort,
            http_path: None,
            exec_command: None,
            timeout_seconds: 120,
            status: ServiceReadiness::Pending,
            ready_at: None,
            status_message: None,
        }
    }
}

/// A user- or system-requested workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    /// Canonical, DNS-safe name. Unique per owner among non-deleted VMs.
    pub name: String,
    /// `system` for platform-owned VMs.
    pub owner_id: String,
    pub owner_wallet: Option<String>,
    pub vm_type: VmType,
    pub spec: VmSpec,

    pub status: VmStatus,
    pub status_message: Option<String>,
    pub power_state: PowerState,

    /// Hosting node. None before scheduling.
    pub node_id: Option<String>,
    /// Resources charged against the hosting node at assignment time.
    pub reserved_cost: Option<ResourceCapacity>,
    /// GPU picked for passthrough, if any.
    pub gpu_pci_address: Option<String>,

    pub network: NetworkConfig,
    pub access: AccessInfo,
    pub active_command: Option<ActiveCommand>,
    pub billing: BillingInfo,
    pub services: Vec<VmServiceStatus>,
    pub labels: HashMap<String, String>,

    /// Password ciphertext, encrypted client-side with the owner wallet key.
    pub secure_password: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VirtualMachine {
    pub fn is_system(&self) -> bool {
        self.owner_id == "system"
    }

    pub fn is_active(&self) -> bool {
        self.status != VmStatus::Deleted
    }

    pub fn system_role(&self) -> Option<SystemVmRole> {
        match self.labels.get("system-role").map(|s| s.as_str()) {
            Some("dht") => Some(SystemVmRole::Dht),
            Some("relay") => Some(SystemVmRole::Relay),
            Some("blockstore") => Some(SystemVmRole::BlockStore),
            Some("ingress") => Some(SystemVmRole::Ingress),
            _ => None,
        }
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut VmServiceStatus> {
        self.services.iter_mut().find(|s| s.name == name)
    }
}

// =============================================================================
// Users and quotas
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub max_vms: u32,
    pub max_cpu_cores: u32,
    pub max_memory_bytes: u64,
    pub max_storage_bytes: u64,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            max_vms: 10,
            max_cpu_cores: 32,
            max_memory_bytes: 64 * 1024 * 1024 * 1024,
            max_storage_bytes: 2 * 1024 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceUsage {
    pub vms: u32,
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
}

impl ResourceUsage {
    pub fn charge(&mut self, spec: &VmSpec) {
        self.vms += 1;
        self.cpu_cores += spec.cpu_cores;
        self.memory_bytes += spec.memory_bytes;
        self.storage_bytes += spec.disk_bytes;
    }

    /// Floored at zero, like node-side release.
    pub fn refund(&mut self, spec: &VmSpec) {
        self.vms = self.vms.saturating_sub(1);
        self.cpu_cores = self.cpu_cores.saturating_sub(spec.cpu_cores);
        self.memory_bytes = self.memory_bytes.saturating_sub(spec.memory_bytes);
        self.storage_bytes = self.storage_bytes.saturating_sub(spec.disk_bytes);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserData {
    pub id: String,
    pub wallet_address: Option<String>,
    pub quota: ResourceQuota,
    pub usage: ResourceUsage,
    pub created_at: DateTime<Utc>,
}

impl UserData {
    pub fn new(id: &str, wallet_address: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            wallet_address,
            quota: ResourceQuota::default(),
            usage: ResourceUsage::default(),
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Command registry
// =============================================================================

/// One entry per outstanding command that requires an acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRegistration {
    pub command_id: String,
    pub vm_id: String,
    pub node_id: String,
    pub command_type: CommandType,
    pub issued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_floors_at_zero() {
        let mut reserved = ResourceCapacity::new(2.0, 1024, 4096);
        reserved.release(&ResourceCapacity::new(5.0, 4096, 8192));
        assert_eq!(reserved.compute_points, 0.0);
        assert_eq!(reserved.memory_bytes, 0);
        assert_eq!(reserved.storage_bytes, 0);
    }

    #[test]
    fn test_can_accommodate_checks_every_dimension() {
        let total = ResourceCapacity::new(32.0, 32 << 30, 1 << 40);
        let used = ResourceCapacity::new(30.0, 0, 0);
        let want = ResourceCapacity::new(4.0, 1 << 30, 1 << 30);
        assert!(!total.can_accommodate(&used, &want));
        let used = ResourceCapacity::new(4.0, 0, 0);
        assert!(total.can_accommodate(&used, &want));
    }

    #[test]
    fn test_vm_status_transitional() {
        assert!(VmStatus::Provisioning.is_transitional());
        assert!(VmStatus::Stopping.is_transitional());
        assert!(VmStatus::Deleting.is_transitional());
        assert!(!VmStatus::Running.is_transitional());
        assert!(!VmStatus::Pending.is_transitional());
    }

    #[test]
    fn test_vm_status_parse_aliases() {
        assert_eq!(VmStatus::parse("RUNNING"), Some(VmStatus::Running));
        assert_eq!(VmStatus::parse("shutoff"), Some(VmStatus::Stopped));
        assert_eq!(VmStatus::parse("failed"), Some(VmStatus::Error));
        assert_eq!(VmStatus::parse("unknown-state"), None);
    }

    #[test]
    fn test_usage_refund_floors() {
        let mut usage = ResourceUsage::default();
        let spec = VmSpec {
            cpu_cores: 2,
            memory_bytes: 1 << 30,
            disk_bytes: 10 << 30,
            ..Default::default()
        };
        usage.refund(&spec);
        assert_eq!(usage.vms, 0);
        assert_eq!(usage.cpu_cores, 0);
    }

    #[test]
    fn test_relay_slots() {
        let relay = RelayInfo {
            relay_vm_id: "vm-1".to_string(),
            relay_subnet: 3,
            wireguard_public_key: "pk".to_string(),
            wireguard_endpoint: "1.2.3.4:51820".to_string(),
            connected_node_ids: vec!["n1".to_string(); 250],
            status: RelayStatus::Active,
        };
        assert_eq!(relay.available_slots(), 3);
        assert_eq!(relay.subnet_cidr(), "10.200.3.0/24");
    }
}
