use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::model::{GpuMode, QualityTier, VirtualMachine};
use crate::scheduler::{NodeScore, PlacementRequest};
use crate::services::vm::CreateVmParams;

use super::{ApiError, AppState};

// =============================================================================
// DTOs
// =============================================================================

/// Request to create a VM
#[derive(Deserialize, ToSchema)]
pub struct CreateVmBody {
    /// Raw VM name; sanitized into the canonical DNS-safe form
    pub name: String,
    pub owner_id: String,
    pub owner_wallet: Option<String>,
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub image_id: String,
    /// Quality tier: guaranteed, standard, balanced or burstable
    pub tier: Option<String>,
    /// GPU mode: none, passthrough or proxied
    pub gpu_mode: Option<String>,
    pub container_image: Option<String>,
    pub ssh_public_key: Option<String>,
    pub template_id: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub labels: Option<HashMap<String, String>>,
    /// Premium names are globally unique and carry no suffix
    #[serde(default)]
    pub premium_name: bool,
}

#[derive(Serialize, ToSchema)]
pub struct PortMappingResponse {
    pub vm_port: u16,
    pub public_port: u16,
    pub protocol: String,
    pub dns_record_id: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct VmSpecResponse {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub image_id: String,
    pub tier: String,
    pub gpu_mode: String,
    pub container_image: Option<String>,
    pub template_id: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
}

/// VM resource
#[derive(Serialize, ToSchema)]
pub struct Vm {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub vm_type: String,
    pub status: String,
    pub status_message: Option<String>,
    pub power_state: String,
    pub node_id: Option<String>,
    pub spec: VmSpecResponse,
    pub private_ip: Option<String>,
    pub hostname: Option<String>,
    pub port_mappings: Vec<PortMappingResponse>,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub labels: HashMap<String, String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<VirtualMachine> for Vm {
    fn from(vm: VirtualMachine) -> Self {
        Self {
            id: vm.id,
            name: vm.name,
            owner_id: vm.owner_id,
            vm_type: format!("{:?}", vm.vm_type).to_lowercase(),
            status: vm.status.to_string(),
            status_message: vm.status_message,
            power_state: format!("{:?}", vm.power_state).to_lowercase(),
            node_id: vm.node_id,
            spec: VmSpecResponse {
                cpu_cores: vm.spec.cpu_cores,
                memory_bytes: vm.spec.memory_bytes,
                disk_bytes: vm.spec.disk_bytes,
                image_id: vm.spec.image_id,
                tier: vm.spec.tier.to_string(),
                gpu_mode: format!("{:?}", vm.spec.gpu_mode).to_lowercase(),
                container_image: vm.spec.container_image,
                template_id: vm.spec.template_id,
                region: vm.spec.region,
                zone: vm.spec.zone,
            },
            private_ip: vm.network.private_ip,
            hostname: vm.network.hostname,
            port_mappings: vm
                .network
                .port_mappings
                .into_iter()
                .map(|m| PortMappingResponse {
                    vm_port: m.vm_port,
                    public_port: m.public_port,
                    protocol: m.protocol,
                    dns_record_id: m.dns_record_id,
                })
                .collect(),
            ssh_host: vm.access.ssh_host,
            ssh_port: vm.access.ssh_port,
            labels: vm.labels,
            created_at: vm.created_at.to_rfc3339(),
            updated_at: vm.updated_at.to_rfc3339(),
        }
    }
}

/// Creation response; the plaintext password appears exactly once
#[derive(Serialize, ToSchema)]
pub struct CreateVmResponse {
    pub vm: Vm,
    /// One-time plaintext; encrypt with the owner wallet key and return
    /// the ciphertext via the password endpoint
    pub password: Option<String>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Create a new VM
#[utoipa::path(
    post,
    path = "/v1/vms",
    request_body = CreateVmBody,
    responses(
        (status = 200, description = "VM created", body = CreateVmResponse),
        (status = 400, description = "Invalid name or spec", body = ApiError),
        (status = 403, description = "Quota exceeded", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn create_vm(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateVmBody>,
) -> Result<Json<CreateVmResponse>, ApiError> {
    let tier = match body.tier.as_deref() {
        Some(raw) => QualityTier::parse(raw)
            .ok_or_else(|| ApiError::new("argument", format!("unknown tier {}", raw)))?,
        None => QualityTier::default(),
    };
    let gpu_mode = match body.gpu_mode.as_deref() {
        Some("passthrough") => GpuMode::Passthrough,
        Some("proxied") => GpuMode::Proxied,
        _ => GpuMode::None,
    };

    let result = state
        .vms
        .create(CreateVmParams {
            name: body.name,
            owner_id: body.owner_id,
            owner_wallet: body.owner_wallet,
            cpu_cores: body.cpu_cores,
            memory_bytes: body.memory_bytes,
            disk_bytes: body.disk_bytes,
            image_id: body.image_id,
            tier,
            gpu_mode,
            container_image: body.container_image,
            ssh_public_key: body.ssh_public_key,
            template_id: body.template_id,
            region: body.region,
            zone: body.zone,
            labels: body.labels.unwrap_or_default(),
            target_node_id: None,
            premium_name: body.premium_name,
        })
        .await?;

    Ok(Json(CreateVmResponse {
        vm: result.vm.into(),
        password: result.plaintext_password,
    }))
}

/// Query parameters for list VMs
#[derive(Deserialize, ToSchema)]
pub struct ListVmsQuery {
    pub owner_id: Option<String>,
    pub node_id: Option<String>,
    pub status: Option<String>,
}

/// List VMs
#[utoipa::path(
    get,
    path = "/v1/vms",
    params(
        ("owner_id" = Option<String>, Query, description = "Filter by owner"),
        ("node_id" = Option<String>, Query, description = "Filter by node"),
        ("status" = Option<String>, Query, description = "Filter by status")
    ),
    responses(
        (status = 200, description = "List of VMs", body = Vec<Vm>)
    ),
    tag = "vms"
)]
pub async fn list_vms(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListVmsQuery>,
) -> Json<Vec<Vm>> {
    let vms = match (&query.owner_id, &query.node_id) {
        (Some(owner), _) => state.store.get_vms_by_user(owner).await,
        (None, Some(node)) => state.store.get_vms_by_node(node).await,
        (None, None) => state.store.get_all_vms().await,
    };
    let vms: Vec<Vm> = vms
        .into_iter()
        .filter(|vm| match &query.status {
            Some(status) => vm.status.to_string() == status.to_lowercase(),
            None => true,
        })
        .map(Into::into)
        .collect();
    Json(vms)
}

/// Get a VM by ID
#[utoipa::path(
    get,
    path = "/v1/vms/{id}",
    params(("id" = String, Path, description = "VM ID")),
    responses(
        (status = 200, description = "VM found", body = Vm),
        (status = 404, description = "VM not found", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn get_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vm>, ApiError> {
    match state.store.get_vm(&id).await {
        Some(vm) => Ok(Json(vm.into())),
        None => Err(ApiError::new("not_found", "VM not found")),
    }
}

/// Delete a VM
#[utoipa::path(
    delete,
    path = "/v1/vms/{id}",
    params(("id" = String, Path, description = "VM ID")),
    responses(
        (status = 200, description = "Deletion started (or already done)", body = Vm),
        (status = 404, description = "VM not found", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn delete_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vm>, ApiError> {
    let vm = state.vms.delete(&id).await?;
    Ok(Json(vm.into()))
}

/// Stop a running VM
#[utoipa::path(
    post,
    path = "/v1/vms/{id}/stop",
    params(("id" = String, Path, description = "VM ID")),
    responses(
        (status = 200, description = "Stop requested", body = Vm),
        (status = 400, description = "VM is not running", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn stop_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vm>, ApiError> {
    let vm = state.vms.stop(&id).await?;
    Ok(Json(vm.into()))
}

/// Start a stopped VM
#[utoipa::path(
    post,
    path = "/v1/vms/{id}/start",
    params(("id" = String, Path, description = "VM ID")),
    responses(
        (status = 200, description = "Start requested", body = Vm),
        (status = 400, description = "VM is not stopped", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn start_vm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vm>, ApiError> {
    let vm = state.vms.start(&id).await?;
    Ok(Json(vm.into()))
}

/// Request to store the encrypted password
#[derive(Deserialize, ToSchema)]
pub struct SecurePasswordBody {
    /// Password ciphertext, encrypted with the owner wallet key
    pub ciphertext: String,
}

#[derive(Serialize, ToSchema)]
pub struct SecurePasswordResponse {
    pub stored: bool,
}

/// Store the wallet-encrypted VM password
#[utoipa::path(
    post,
    path = "/v1/vms/{id}/password",
    params(("id" = String, Path, description = "VM ID")),
    request_body = SecurePasswordBody,
    responses(
        (status = 200, description = "Ciphertext stored", body = SecurePasswordResponse),
        (status = 404, description = "VM not found", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn secure_password(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SecurePasswordBody>,
) -> Result<Json<SecurePasswordResponse>, ApiError> {
    state.vms.secure_password(&id, body.ciphertext).await?;
    Ok(Json(SecurePasswordResponse { stored: true }))
}

// =============================================================================
// Ports
// =============================================================================

#[derive(Deserialize, ToSchema)]
pub struct AllocatePortBody {
    pub vm_port: u16,
    /// tcp or udp; defaults to tcp
    pub protocol: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct PortAllocationResponse {
    pub success: bool,
    pub vm_port: u16,
    /// 0 while the node-side allocation is still in progress
    pub public_port: u16,
    pub protocol: String,
    pub message: String,
    pub dns_record_id: Option<String>,
    pub is_dns_configured: bool,
}

/// Expose a VM port externally
#[utoipa::path(
    post,
    path = "/v1/vms/{id}/ports",
    params(("id" = String, Path, description = "VM ID")),
    request_body = AllocatePortBody,
    responses(
        (status = 200, description = "Port allocated or allocation in progress", body = PortAllocationResponse),
        (status = 400, description = "VM not placed on a node", body = ApiError),
        (status = 502, description = "Node-side allocation failed", body = ApiError)
    ),
    tag = "ports"
)]
pub async fn allocate_port(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AllocatePortBody>,
) -> Result<Json<PortAllocationResponse>, ApiError> {
    let protocol = body.protocol.unwrap_or_else(|| "tcp".to_string());
    let allocation = state.ports.allocate(&id, body.vm_port, &protocol).await?;
    Ok(Json(PortAllocationResponse {
        success: allocation.success,
        vm_port: allocation.vm_port,
        public_port: allocation.public_port,
        protocol: allocation.protocol,
        message: allocation.message,
        dns_record_id: allocation.dns_record_id,
        is_dns_configured: allocation.is_dns_configured,
    }))
}

#[derive(Deserialize, ToSchema)]
pub struct ReleasePortQuery {
    pub protocol: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ReleasePortResponse {
    pub released: bool,
}

/// Release an exposed VM port
#[utoipa::path(
    delete,
    path = "/v1/vms/{id}/ports/{vm_port}",
    params(
        ("id" = String, Path, description = "VM ID"),
        ("vm_port" = u16, Path, description = "VM-side port"),
        ("protocol" = Option<String>, Query, description = "tcp or udp")
    ),
    responses(
        (status = 200, description = "Port released", body = ReleasePortResponse),
        (status = 404, description = "VM not found", body = ApiError)
    ),
    tag = "ports"
)]
pub async fn release_port(
    State(state): State<Arc<AppState>>,
    Path((id, vm_port)): Path<(String, u16)>,
    Query(query): Query<ReleasePortQuery>,
) -> Result<Json<ReleasePortResponse>, ApiError> {
    let protocol = query.protocol.unwrap_or_else(|| "tcp".to_string());
    state.ports.release(&id, vm_port, &protocol).await?;
    Ok(Json(ReleasePortResponse { released: true }))
}

// =============================================================================
// Scheduler introspection
// =============================================================================

#[derive(Deserialize, ToSchema)]
pub struct ScoreNodesBody {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub tier: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub arch: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct NodeScoreResponse {
    pub node_id: String,
    pub total: f64,
    pub capacity: f64,
    pub load: f64,
    pub reputation: f64,
    pub locality: f64,
    pub rejection_reason: Option<String>,
}

impl From<NodeScore> for NodeScoreResponse {
    fn from(score: NodeScore) -> Self {
        Self {
            node_id: score.node_id,
            total: score.total,
            capacity: score.capacity,
            load: score.load,
            reputation: score.reputation,
            locality: score.locality,
            rejection_reason: score.rejection_reason,
        }
    }
}

/// Score all candidate nodes for a hypothetical VM spec
#[utoipa::path(
    post,
    path = "/v1/scheduler/scores",
    request_body = ScoreNodesBody,
    responses(
        (status = 200, description = "Per-node scores with rejection reasons", body = Vec<NodeScoreResponse>)
    ),
    tag = "scheduler"
)]
pub async fn score_nodes(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScoreNodesBody>,
) -> Result<Json<Vec<NodeScoreResponse>>, ApiError> {
    let tier = match body.tier.as_deref() {
        Some(raw) => QualityTier::parse(raw)
            .ok_or_else(|| ApiError::new("argument", format!("unknown tier {}", raw)))?,
        None => QualityTier::default(),
    };
    let request = PlacementRequest {
        cpu_cores: body.cpu_cores,
        memory_bytes: body.memory_bytes,
        disk_bytes: body.disk_bytes,
        tier,
        preferred_region: body.region,
        preferred_zone: body.zone,
        required_arch: body.arch,
        gpu_passthrough: false,
    };
    let nodes = state.store.get_active_nodes().await;
    let scores = state.scheduler.score_nodes(&nodes, &request);
    Ok(Json(scores.into_iter().map(Into::into).collect()))
}
