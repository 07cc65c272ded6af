use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::command::{CommandAck, NodeCommand};
use crate::config::SchedulingConfig;
use crate::model::{
    CgnatInfo, HardwareInventory, Node, NodeMetrics, NodePerformanceEvaluation, OperatorPricing,
    ResourceCapacity,
};
use crate::services::node::{
    ActiveVmReport, HeartbeatRequest, RegisterNodeRequest, ServiceReport,
};

use super::{authorize_node, ApiError, AppState};

// =============================================================================
// Registration
// =============================================================================

/// Request to register a worker node
#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeBody {
    /// Stable machine identifier
    pub machine_id: String,
    /// Operator wallet address
    pub wallet_address: String,
    /// Challenge message the wallet signed
    pub message: String,
    /// Recoverable signature over the message
    pub signature: String,
    pub public_ip: String,
    pub agent_port: u16,
    #[schema(value_type = Object)]
    pub hardware_inventory: HardwareInventory,
    pub architecture: Option<String>,
    pub agent_version: String,
    #[serde(default)]
    pub supported_images: Vec<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    #[schema(value_type = Object)]
    pub pricing: Option<OperatorPricing>,
}

/// Registration response
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeResponseBody {
    pub node_id: String,
    #[schema(value_type = Object)]
    pub performance_evaluation: NodePerformanceEvaluation,
    /// Bearer credential; shown once, store it securely
    pub api_key: String,
    #[schema(value_type = Object)]
    pub scheduling_config: SchedulingConfig,
    pub orchestrator_public_key: Option<String>,
    /// Expected heartbeat cadence in seconds
    pub heartbeat_interval: u64,
    pub dht_bootstrap_peers: Vec<String>,
}

/// Register a worker node
#[utoipa::path(
    post,
    path = "/v1/nodes/register",
    request_body = RegisterNodeBody,
    responses(
        (status = 200, description = "Node registered", body = RegisterNodeResponseBody),
        (status = 400, description = "Invalid wallet or machine id", body = ApiError),
        (status = 401, description = "Signature does not recover to the wallet", body = ApiError),
        (status = 412, description = "Performance below minimum", body = ApiError)
    ),
    tag = "nodes"
)]
pub async fn register_node(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterNodeBody>,
) -> Result<Json<RegisterNodeResponseBody>, ApiError> {
    let request = RegisterNodeRequest {
        machine_id: body.machine_id,
        wallet_address: body.wallet_address,
        message: body.message,
        signature: body.signature,
        public_ip: body.public_ip,
        agent_port: body.agent_port,
        architecture: body
            .architecture
            .unwrap_or_else(|| "x86_64".to_string()),
        hardware: body.hardware_inventory,
        agent_version: body.agent_version,
        supported_images: body.supported_images,
        region: body.region,
        zone: body.zone,
        pricing: body.pricing,
    };

    let response = state.nodes.register(request).await?;
    Ok(Json(RegisterNodeResponseBody {
        node_id: response.node_id,
        performance_evaluation: response.evaluation,
        api_key: response.api_key,
        scheduling_config: response.scheduling_config,
        orchestrator_public_key: response.orchestrator_public_key,
        heartbeat_interval: response.heartbeat_interval_secs,
        dht_bootstrap_peers: response.dht_bootstrap_peers,
    }))
}

// =============================================================================
// Heartbeat
// =============================================================================

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReportBody {
    pub name: String,
    pub status: String,
    pub message: Option<String>,
}

/// One VM as reported by the node agent
#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveVmReportBody {
    pub vm_id: String,
    pub name: Option<String>,
    pub state: String,
    pub owner_id: Option<String>,
    pub ip_address: Option<String>,
    pub vnc_host: Option<String>,
    pub vnc_port: Option<u16>,
    pub v_cpu_cores: Option<u32>,
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
    pub image_id: Option<String>,
    pub tier: Option<String>,
    pub status_message: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceReportBody>,
}

impl From<ActiveVmReportBody> for ActiveVmReport {
    fn from(body: ActiveVmReportBody) -> Self {
        Self {
            vm_id: body.vm_id,
            name: body.name,
            state: body.state,
            owner_id: body.owner_id,
            ip_address: body.ip_address,
            vnc_host: body.vnc_host,
            vnc_port: body.vnc_port,
            cpu_cores: body.v_cpu_cores,
            memory_bytes: body.memory_bytes,
            disk_bytes: body.disk_bytes,
            image_id: body.image_id,
            tier: body.tier,
            status_message: body.status_message,
            services: body
                .services
                .into_iter()
                .map(|s| ServiceReport {
                    name: s.name,
                    status: s.status,
                    message: s.message,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatBody {
    #[schema(value_type = Object)]
    pub metrics: Option<NodeMetrics>,
    #[schema(value_type = Object)]
    pub available_resources: Option<ResourceCapacity>,
    #[serde(default)]
    pub active_vms: Vec<ActiveVmReportBody>,
    #[schema(value_type = Object)]
    pub cgnat_info: Option<CgnatInfo>,
    pub scheduling_config_version: Option<String>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponseBody {
    pub accepted: bool,
    /// Commands drained from the node's pending queue
    #[schema(value_type = Vec<Object>)]
    pub commands: Vec<NodeCommand>,
    /// Present when the node's scheduling config is stale
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub agent_scheduling_config: Option<SchedulingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    pub cgnat_info: Option<CgnatInfo>,
}

/// Process a node heartbeat
#[utoipa::path(
    post,
    path = "/v1/nodes/{id}/heartbeat",
    params(("id" = String, Path, description = "Node ID")),
    request_body = HeartbeatBody,
    responses(
        (status = 200, description = "Heartbeat accepted", body = HeartbeatResponseBody),
        (status = 401, description = "Invalid credential", body = ApiError),
        (status = 404, description = "Unknown node", body = ApiError)
    ),
    tag = "nodes"
)]
pub async fn node_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<HeartbeatBody>,
) -> Result<Json<HeartbeatResponseBody>, ApiError> {
    authorize_node(&state, &headers, &node_id).await?;

    let request = HeartbeatRequest {
        metrics: body.metrics,
        available_resources: body.available_resources,
        active_vms: body.active_vms.into_iter().map(Into::into).collect(),
        cgnat_info: body.cgnat_info,
        scheduling_config_version: body.scheduling_config_version,
    };
    let response = state.nodes.heartbeat(&node_id, request).await?;
    Ok(Json(HeartbeatResponseBody {
        accepted: response.accepted,
        commands: response.commands,
        agent_scheduling_config: response.scheduling_config,
        cgnat_info: response.cgnat_info,
    }))
}

// =============================================================================
// Acknowledgments
// =============================================================================

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AckResponseBody {
    pub accepted: bool,
}

/// Acknowledge a command
///
/// Always returns 200 with an accepted flag; an unresolvable command is
/// recorded as orphaned rather than failing the node.
#[utoipa::path(
    post,
    path = "/v1/nodes/{id}/commands/{command_id}/ack",
    params(
        ("id" = String, Path, description = "Node ID"),
        ("command_id" = String, Path, description = "Command ID")
    ),
    responses(
        (status = 200, description = "Ack received", body = AckResponseBody),
        (status = 401, description = "Invalid credential", body = ApiError)
    ),
    tag = "nodes"
)]
pub async fn acknowledge_command(
    State(state): State<Arc<AppState>>,
    Path((node_id, command_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(ack): Json<CommandAck>,
) -> Result<Json<AckResponseBody>, ApiError> {
    authorize_node(&state, &headers, &node_id).await?;
    state.nodes.acknowledge(&node_id, &command_id, ack).await?;
    Ok(Json(AckResponseBody { accepted: true }))
}

// =============================================================================
// Management surface
// =============================================================================

/// Node summary for operators
#[derive(Serialize, ToSchema)]
pub struct NodeSummary {
    pub id: String,
    pub status: String,
    pub public_ip: String,
    pub architecture: String,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub total_compute_points: f64,
    pub reserved_compute_points: f64,
    pub total_memory_bytes: u64,
    pub reserved_memory_bytes: u64,
    pub performance_class: Option<String>,
    pub highest_tier: Option<String>,
    pub is_relay: bool,
    pub is_cgnat: bool,
    pub last_heartbeat: String,
    pub registered_at: String,
}

impl From<Node> for NodeSummary {
    fn from(node: Node) -> Self {
        Self {
            id: node.id,
            status: format!("{:?}", node.status).to_lowercase(),
            public_ip: node.public_ip,
            architecture: node.architecture,
            region: node.region,
            zone: node.zone,
            total_compute_points: node.total.compute_points,
            reserved_compute_points: node.reserved.compute_points,
            total_memory_bytes: node.total.memory_bytes,
            reserved_memory_bytes: node.reserved.memory_bytes,
            performance_class: node
                .evaluation
                .as_ref()
                .and_then(|e| e.performance_class)
                .map(|c| format!("{:?}", c).to_lowercase()),
            highest_tier: node
                .evaluation
                .as_ref()
                .and_then(|e| e.highest_tier)
                .map(|t| t.to_string()),
            is_relay: node.relay_info.is_some(),
            is_cgnat: node.cgnat_info.is_some(),
            last_heartbeat: node.last_heartbeat.to_rfc3339(),
            registered_at: node.registered_at.to_rfc3339(),
        }
    }
}

/// List all nodes
#[utoipa::path(
    get,
    path = "/v1/nodes",
    responses(
        (status = 200, description = "List of nodes", body = Vec<NodeSummary>)
    ),
    tag = "nodes"
)]
pub async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<NodeSummary>> {
    let nodes = state.store.get_all_nodes().await;
    Json(nodes.into_iter().map(Into::into).collect())
}

/// Get a node by ID
#[utoipa::path(
    get,
    path = "/v1/nodes/{id}",
    params(("id" = String, Path, description = "Node ID")),
    responses(
        (status = 200, description = "Node found", body = NodeSummary),
        (status = 404, description = "Node not found", body = ApiError)
    ),
    tag = "nodes"
)]
pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<NodeSummary>, ApiError> {
    match state.store.get_node(&id).await {
        Some(node) => Ok(Json(node.into())),
        None => Err(ApiError::new("not_found", "Node not found")),
    }
}

/// Decommission a node
#[utoipa::path(
    delete,
    path = "/v1/nodes/{id}",
    params(("id" = String, Path, description = "Node ID")),
    responses(
        (status = 200, description = "Node decommissioned", body = NodeSummary),
        (status = 404, description = "Node not found", body = ApiError)
    ),
    tag = "nodes"
)]
pub async fn decommission_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<NodeSummary>, ApiError> {
    let node = state.nodes.decommission(&id).await?;
    Ok(Json(node.into()))
}
