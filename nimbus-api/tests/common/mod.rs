//! Shared harness for service-level integration tests: the full service
//! stack over the in-memory store with fake collaborators.

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use sha3::{Digest, Keccak256};
use std::sync::Arc;
use tokio::sync::Mutex;

use nimbus_api::audit::ApiAuditLogger;
use nimbus_api::command::{CommandAck, NodeCommand};
use nimbus_api::config::OrchestratorConfig;
use nimbus_api::error::Result;
use nimbus_api::model::{
    CpuInfo, HardwareInventory, NatType, NetworkInfo, StorageDevice, StorageDeviceType,
    VirtualMachine, VmStatus,
};
use nimbus_api::services::ingress::{DnsApi, IngressApi};
use nimbus_api::services::lifecycle::LifecycleManager;
use nimbus_api::services::node::{NodeService, RegisterNodeRequest, RegisterNodeResponse};
use nimbus_api::services::ports::DirectAccessService;
use nimbus_api::services::relay::{NoopRelayManagement, RelayCoordinator};
use nimbus_api::services::vm::{StaticTemplateCatalog, VmService};
use nimbus_api::store::DataStore;

/// Ingress fake that records which VMs were started and deleted.
#[derive(Default)]
pub struct RecordingIngress {
    pub started: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl IngressApi for RecordingIngress {
    async fn on_vm_started(&self, vm: &VirtualMachine) -> Result<()> {
        self.started.lock().await.push(vm.id.clone());
        Ok(())
    }

    async fn on_vm_deleted(&self, vm: &VirtualMachine) -> Result<()> {
        self.deleted.lock().await.push(vm.id.clone());
        Ok(())
    }
}

pub struct FakeDns;

#[async_trait]
impl DnsApi for FakeDns {
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

pub struct Harness {
    pub store: Arc<DataStore>,
    pub config: Arc<OrchestratorConfig>,
    pub lifecycle: Arc<LifecycleManager>,
    pub relay: Arc<RelayCoordinator>,
    pub nodes: Arc<NodeService>,
    pub vms: Arc<VmService>,
    pub ports: Arc<DirectAccessService>,
    pub ingress: Arc<RecordingIngress>,
}

pub fn harness() -> Harness {
    let mut config = OrchestratorConfig::default();
    // Fast ack polling so port tests finish quickly
    config.ports.ack_poll_interval_ms = 10;
    config.ports.ack_poll_attempts = 50;
    config.finalize().unwrap();
    let config = Arc::new(config);

    let store = Arc::new(DataStore::new());
    let audit = Arc::new(ApiAuditLogger::new_noop());
    let ingress = Arc::new(RecordingIngress::default());

    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::clone(&store),
        ingress.clone(),
        Arc::clone(&audit),
    ));
    let relay = Arc::new(RelayCoordinator::new(
        Arc::clone(&store),
        Arc::new(NoopRelayManagement),
        Arc::clone(&audit),
    ));
    let vms = Arc::new(VmService::new(
        Arc::clone(&store),
        Arc::clone(&config),
        Arc::clone(&lifecycle),
        Arc::new(StaticTemplateCatalog::empty()),
        Arc::clone(&audit),
    ));
    let nodes = NodeService::new(
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
        Arc::new(FakeDns),
        Arc::clone(&audit),
    ));

    Harness {
        store,
        config,
        lifecycle,
        relay,
        nodes,
        vms,
        ports,
        ingress,
    }
}

/// Sign a registration challenge the way a node agent's wallet would.
pub fn sign_challenge(key: &SigningKey, message: &str) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    let (signature, recovery_id) = key.sign_prehash_recoverable(&digest).unwrap();
    let mut raw = signature.to_bytes().to_vec();
    raw.push(recovery_id.to_byte() + 27);
    format!("0x{}", hex::encode(raw))
}

pub struct NodeParams {
    pub machine_id: String,
    pub benchmark: f64,
    pub cores: u32,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
    pub nat_type: NatType,
    pub public_ip: String,
}

impl Default for NodeParams {
    fn default() -> Self {
        Self {
            machine_id: "machine-1".to_string(),
            benchmark: 2000.0,
            cores: 16,
            memory_bytes: 32 << 30,
            storage_bytes: 1 << 40,
            nat_type: NatType::None,
            public_ip: "198.51.100.10".to_string(),
        }
    }
}

/// Register a node through the real registration flow, wallet signature
/// included. A fresh wallet is minted per call; use
/// `register_node_with_key` to re-register the same node.
pub async fn register_node(harness: &Harness, params: NodeParams) -> RegisterNodeResponse {
    let key = SigningKey::random(&mut rand::rngs::OsRng);
    register_node_with_key(harness, params, &key).await
}

pub async fn register_node_with_key(
    harness: &Harness,
    params: NodeParams,
    key: &SigningKey,
) -> RegisterNodeResponse {
    let message = format!("nimbus-register:{}", params.machine_id);
    let signature = sign_challenge(key, &message);
    // Recover the address from our own signature rather than re-deriving it
    let wallet = nimbus_api::auth::recover_wallet(&message, &signature).unwrap();

    harness
        .nodes
        .register(RegisterNodeRequest {
            machine_id: params.machine_id.clone(),
            wallet_address: wallet,
            message,
            signature,
            public_ip: params.public_ip.clone(),
            agent_port: 7001,
            hardware: HardwareInventory {
                cpu: CpuInfo {
                    model: "EPYC 7543".to_string(),
                    physical_cores: params.cores,
                    benchmark_score: params.benchmark,
                },
                memory_bytes: params.memory_bytes,
                storage: vec![StorageDevice {
                    device_type: StorageDeviceType::Nvme,
                    capacity_bytes: params.storage_bytes,
                }],
                gpus: vec![],
                network: NetworkInfo {
                    nat_type: params.nat_type,
                    bandwidth_mbps: 1000,
                    public_ip: Some(params.public_ip),
                },
            },
            architecture: "x86_64".to_string(),
            agent_version: "0.1.0".to_string(),
            supported_images: vec!["ubuntu-24.04".to_string()],
            region: Some("eu-west".to_string()),
            zone: Some("a".to_string()),
            pricing: None,
        })
        .await
        .expect("registration should succeed")
}

/// Drain a node's pending queue and answer each command through the ack
/// endpoint, the way the agent's poll loop would.
pub async fn run_agent_once<F>(
    harness: &Harness,
    node_id: &str,
    observed: &Mutex<Vec<(String, NodeCommand)>>,
    respond: F,
) -> usize
where
    F: Fn(&NodeCommand) -> Option<CommandAck>,
{
    let commands = harness.store.drain_pending_commands(node_id).await;
    let count = commands.len();
    for command in commands {
        observed
            .lock()
            .await
            .push((node_id.to_string(), command.clone()));
        if let Some(ack) = respond(&command) {
            harness
                .nodes
                .acknowledge(node_id, &command.command_id, ack)
                .await
                .expect("ack path never fails the node");
        }
    }
    count
}

pub fn success_ack(data: serde_json::Value) -> CommandAck {
    CommandAck {
        success: true,
        error_message: None,
        data: Some(data),
        completed_at: chrono::Utc::now(),
    }
}

pub fn failure_ack(error: &str) -> CommandAck {
    CommandAck {
        success: false,
        error_message: Some(error.to_string()),
        data: None,
        completed_at: chrono::Utc::now(),
    }
}

/// Wait until the VM reaches the wanted status or the attempts run out.
pub async fn wait_for_status(
    harness: &Harness,
    vm_id: &str,
    wanted: VmStatus,
) -> VirtualMachine {
    for _ in 0..100 {
        if let Some(vm) = harness.store.get_vm(vm_id).await {
            if vm.status == wanted {
                return vm;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("vm {} never reached {:?}", vm_id, wanted);
}
