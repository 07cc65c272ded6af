use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::handlers::{self, AppState};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "nimbus API Server",
        version = "0.1.0",
        description = "Control plane for the nimbus distributed VM network. Schedules user VMs onto worker nodes and drives their lifecycle through the command/ack protocol.",
        license(name = "MIT")
    ),
    tags(
        (name = "system", description = "System information"),
        (name = "nodes", description = "Worker node registration, heartbeats and acks"),
        (name = "vms", description = "VM lifecycle operations"),
        (name = "ports", description = "Direct-access port allocation"),
        (name = "scheduler", description = "Scheduler introspection")
    ),
    paths(
        handlers::get_version,
        handlers::register_node,
        handlers::node_heartbeat,
        handlers::acknowledge_command,
        handlers::list_nodes,
        handlers::get_node,
        handlers::decommission_node,
        handlers::create_vm,
        handlers::list_vms,
        handlers::get_vm,
        handlers::delete_vm,
        handlers::stop_vm,
        handlers::start_vm,
        handlers::secure_password,
        handlers::allocate_port,
        handlers::release_port,
        handlers::score_nodes,
    ),
    components(schemas(
        handlers::VersionInfo,
        handlers::ApiError,
        handlers::RegisterNodeBody,
        handlers::RegisterNodeResponseBody,
        handlers::ServiceReportBody,
        handlers::ActiveVmReportBody,
        handlers::HeartbeatBody,
        handlers::HeartbeatResponseBody,
        handlers::AckResponseBody,
        handlers::NodeSummary,
        handlers::CreateVmBody,
        handlers::CreateVmResponse,
        handlers::Vm,
        handlers::VmSpecResponse,
        handlers::PortMappingResponse,
        handlers::ListVmsQuery,
        handlers::SecurePasswordBody,
        handlers::SecurePasswordResponse,
        handlers::AllocatePortBody,
        handlers::PortAllocationResponse,
        handlers::ReleasePortQuery,
        handlers::ReleasePortResponse,
        handlers::ScoreNodesBody,
        handlers::NodeScoreResponse,
    ))
)]
pub struct ApiDoc;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // System
        .route("/version", get(handlers::get_version))
        // Nodes (agent-facing)
        .route("/nodes/register", post(handlers::register_node))
        .route("/nodes/{id}/heartbeat", post(handlers::node_heartbeat))
        .route(
            "/nodes/{id}/commands/{command_id}/ack",
            post(handlers::acknowledge_command),
        )
        // Nodes (management)
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/{id}", get(handlers::get_node))
        .route("/nodes/{id}", delete(handlers::decommission_node))
        // VMs
        .route("/vms", get(handlers::list_vms))
        .route("/vms", post(handlers::create_vm))
        .route("/vms/{id}", get(handlers::get_vm))
        .route("/vms/{id}", delete(handlers::delete_vm))
        .route("/vms/{id}/stop", post(handlers::stop_vm))
        .route("/vms/{id}/start", post(handlers::start_vm))
        .route("/vms/{id}/password", post(handlers::secure_password))
        // Ports
        .route("/vms/{id}/ports", post(handlers::allocate_port))
        .route("/vms/{id}/ports/{vm_port}", delete(handlers::release_port))
        // Scheduler
        .route("/scheduler/scores", post(handlers::score_nodes));

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api/v1", api_routes)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
