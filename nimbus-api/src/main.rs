use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nimbus_api::audit::{create_audit_logger, ApiAuditLogger};
use nimbus_api::config::OrchestratorConfig;
use nimbus_api::rest::{create_router, AppState};
use nimbus_api::scheduler::Scheduler;
use nimbus_api::services::ingress::{NoopIngress, UnconfiguredDns};
use nimbus_api::services::lifecycle::LifecycleManager;
use nimbus_api::services::node::NodeService;
use nimbus_api::services::ports::DirectAccessService;
use nimbus_api::services::relay::{HttpRelayManagement, NoopRelayManagement, RelayCoordinator, RelayManagementApi};
use nimbus_api::services::vm::{StaticTemplateCatalog, VmService};
use nimbus_api::services::watchdog::{
    spawn_command_sweeper, spawn_health_watchdog, spawn_pending_rescheduler, ObligationReconciler,
};
use nimbus_api::store::{
    DataStore, DocumentStore, FileDocumentStore, NoopDocumentStore, SyncService,
};

#[derive(Parser)]
#[command(name = "nimbus-api")]
#[command(about = "nimbus API Server - VM orchestration control plane")]
struct Args {
    /// Listen address for the REST API
    #[arg(short, long, default_value = "[::]:8080")]
    listen: String,

    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory for the document store
    #[arg(short, long, default_value = "/var/lib/nimbus")]
    data_dir: PathBuf,

    /// Run in development mode (ephemeral storage, no outbound relay calls)
    #[arg(long)]
    dev: bool,

    /// Log service endpoint for audit logging
    #[arg(long, default_value = "")]
    log_endpoint: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("nimbus_api=info".parse()?))
        .init();

    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => OrchestratorConfig::load(path).await.map_err(|e| e.to_string())?,
        None => {
            let mut config = OrchestratorConfig::default();
            config.finalize().map_err(|e| e.to_string())?;
            config
        }
    };
    let config = Arc::new(config);
    info!(
        scheduling_version = %config.scheduling.version,
        "Starting nimbus-api - REST: {}",
        args.listen
    );

    // Document store and in-memory index
    let documents: Arc<dyn DocumentStore> = if args.dev {
        Arc::new(NoopDocumentStore)
    } else {
        tokio::fs::create_dir_all(&args.data_dir).await?;
        Arc::new(FileDocumentStore::new(args.data_dir.clone()))
    };
    let store = Arc::new(DataStore::new());
    match store.hydrate_from(documents.as_ref()).await {
        Ok(restored) if restored > 0 => info!(restored, "Restored state from document store"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Hydration failed, starting empty"),
    }

    // Audit logger
    let audit: Arc<ApiAuditLogger> = if args.log_endpoint.is_empty() {
        Arc::new(ApiAuditLogger::new_noop())
    } else {
        create_audit_logger(&args.log_endpoint)
    };

    // Collaborators
    let ingress = Arc::new(NoopIngress);
    let dns = Arc::new(UnconfiguredDns);
    let relay_management: Arc<dyn RelayManagementApi> = if args.dev {
        Arc::new(NoopRelayManagement)
    } else {
        Arc::new(HttpRelayManagement::new())
    };

    // Services
    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::clone(&store),
        ingress.clone(),
        Arc::clone(&audit),
    ));
    let relay = Arc::new(RelayCoordinator::new(
        Arc::clone(&store),
        relay_management,
        Arc::clone(&audit),
    ));
    let vm_service = Arc::new(VmService::new(
        Arc::clone(&store),
        Arc::clone(&config),
        Arc::clone(&lifecycle),
        Arc::new(StaticTemplateCatalog::empty()),
        Arc::clone(&audit),
    ));
    let node_service = NodeService::new(
        Arc::clone(&store),
        Arc::clone(&config),
        Arc::clone(&lifecycle),
        Arc::clone(&relay),
        ingress.clone(),
        Arc::clone(&audit),
    );
    let ports = Arc::new(DirectAccessService::new(
        Arc::clone(&store),
        Arc::clone(&config),
        dns,
        Arc::clone(&audit),
    ));

    // Shutdown fan-out for the background loops and the server
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Background loops
    let sync = SyncService::new(
        Arc::clone(&store),
        Arc::clone(&documents),
        Duration::from_secs(config.sync.sync_interval_secs),
    );
    let sync_handle = sync.spawn(shutdown_rx.clone());
    let watchdog_handle = spawn_health_watchdog(
        Arc::clone(&node_service),
        Arc::clone(&config),
        shutdown_rx.clone(),
    );
    let sweeper_handle = spawn_command_sweeper(
        Arc::clone(&store),
        Arc::clone(&audit),
        Arc::clone(&config),
        shutdown_rx.clone(),
    );
    let rescheduler_handle = spawn_pending_rescheduler(Arc::clone(&vm_service), shutdown_rx.clone());
    let reconciler = Arc::new(ObligationReconciler::new(
        Arc::clone(&store),
        Arc::clone(&vm_service),
        Arc::clone(&relay),
    ));
    let reconciler_handle = reconciler.spawn(shutdown_rx.clone());

    // REST server
    let app_state = Arc::new(AppState {
        store: Arc::clone(&store),
        config: Arc::clone(&config),
        nodes: node_service,
        vms: vm_service,
        ports,
        scheduler: Scheduler::new(Arc::clone(&config)),
        audit,
    });
    let router = create_router(app_state);
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!("REST API listening on {}", args.listen);

    let mut server_shutdown = shutdown_rx.clone();
    let rest_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_shutdown.changed().await.ok();
            })
            .await
    });

    // Wait for shutdown signal
    let ctrl_c = signal::ctrl_c();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    // Signal shutdown to the server and every loop
    let _ = shutdown_tx.send(true);

    let _ = rest_handle.await;
    let _ = watchdog_handle.await;
    let _ = sweeper_handle.await;
    let _ = rescheduler_handle.await;
    let _ = reconciler_handle.await;
    // The sync service flushes once more on the way out
    let _ = sync_handle.await;

    info!("Shutdown complete");
    Ok(())
}
