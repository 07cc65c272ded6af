//! Relay coordination and direct-access port allocation, including the
//! CGNAT three-hop path and its rollback.

mod common;

use common::*;
use nimbus_api::command::{CommandType, NodeCommand};
use nimbus_api::model::{NatType, QualityTier, RelayStatus, VmStatus};
use nimbus_api::services::vm::CreateVmParams;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Put a running relay VM on a registered node and promote the node to
/// relay.
async fn promote_to_relay(h: &Harness, node_id: &str) {
    let mut labels = HashMap::new();
    labels.insert("system-role".to_string(), "relay".to_string());
    let relay_vm = h
        .vms
        .create(CreateVmParams {
            name: "sys-relay".to_string(),
            owner_id: "system".to_string(),
            cpu_cores: 2,
            memory_bytes: 2 << 30,
            disk_bytes: 10 << 30,
            image_id: "ubuntu-24.04".to_string(),
            tier: QualityTier::Burstable,
            labels,
            target_node_id: Some(node_id.to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
        .vm;

    // Agent brings the relay VM up
    let observed = Mutex::new(Vec::new());
    run_agent_once(h, node_id, &observed, |_| {
        Some(success_ack(serde_json::json!({ "privateIp": "10.0.0.2" })))
    })
    .await;
    wait_for_status(h, &relay_vm.id, VmStatus::Running).await;

    h.relay
        .register_relay(
            node_id,
            &relay_vm.id,
            "mBd4W1Yjr8lPoq3Zxv2N5cT7uK9sAeFhGiJkLmNoPqR=",
            "198.51.100.10:51820",
        )
        .await
        .unwrap();
}

async fn cgnat_setup(h: &Harness) -> (String, String) {
    let relay_node = register_node(
        &h,
        NodeParams {
            machine_id: "relay-machine".to_string(),
            ..Default::default()
        },
    )
    .await;
    promote_to_relay(h, &relay_node.node_id).await;

    let cgnat_node = register_node(
        &h,
        NodeParams {
            machine_id: "cgnat-machine".to_string(),
            nat_type: NatType::Cgnat,
            public_ip: "100.64.7.7".to_string(),
            ..Default::default()
        },
    )
    .await;
    // Registration kicks off assignment in the background; reconcile
    // synchronously so the test observes a settled state
    h.relay
        .reconcile(&cgnat_node.node_id, None)
        .await
        .unwrap();

    (relay_node.node_id, cgnat_node.node_id)
}

#[tokio::test]
async fn test_cgnat_node_gets_relay_and_tunnel_ip() {
    let h = harness();
    let (relay_node_id, cgnat_node_id) = cgnat_setup(&h).await;

    let cgnat = h
        .store
        .get_node(&cgnat_node_id)
        .await
        .unwrap()
        .cgnat_info
        .expect("assignment happened");
    assert_eq!(cgnat.assigned_relay_node_id, relay_node_id);
    assert!(cgnat.tunnel_ip.starts_with("10.200."));

    // Bidirectional: the relay lists the CGNAT node as a peer
    let relay = h
        .store
        .get_node(&relay_node_id)
        .await
        .unwrap()
        .relay_info
        .unwrap();
    assert!(relay.connected_node_ids.contains(&cgnat_node_id));
}

#[tokio::test]
async fn test_reconcile_is_idempotent_when_sides_agree() {
    let h = harness();
    let (_, cgnat_node_id) = cgnat_setup(&h).await;
    let tracked = h
        .store
        .get_node(&cgnat_node_id)
        .await
        .unwrap()
        .cgnat_info
        .unwrap();

    let after = h
        .relay
        .reconcile(&cgnat_node_id, Some(tracked.clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after, tracked);
}

#[tokio::test]
async fn test_forged_report_is_not_adopted() {
    let h = harness();
    let (relay_node_id, cgnat_node_id) = cgnat_setup(&h).await;

    // Clear the tracked assignment and detach from the relay's peer list
    let tracked = h
        .store
        .get_node(&cgnat_node_id)
        .await
        .unwrap()
        .cgnat_info
        .unwrap();
    h.store
        .update_node(&relay_node_id, |node| {
            if let Some(relay) = node.relay_info.as_mut() {
                relay.connected_node_ids.clear();
            }
        })
        .await
        .unwrap();
    h.store
        .update_node(&cgnat_node_id, |node| {
            node.cgnat_info = None;
        })
        .await
        .unwrap();

    // The node claims an assignment the relay does not corroborate: the
    // claim is rejected and a fresh assignment is made instead
    let result = h
        .relay
        .reconcile(&cgnat_node_id, Some(tracked))
        .await
        .unwrap()
        .expect("reassigned");
    let relay = h
        .store
        .get_node(&relay_node_id)
        .await
        .unwrap()
        .relay_info
        .unwrap();
    assert!(relay.connected_node_ids.contains(&cgnat_node_id));
    assert_eq!(result.assigned_relay_node_id, relay_node_id);
}

#[tokio::test]
async fn test_degraded_relay_still_accepts_peers_offline_does_not() {
    let h = harness();
    let (relay_node_id, cgnat_node_id) = cgnat_setup(&h).await;

    h.store
        .update_node(&relay_node_id, |node| {
            if let Some(relay) = node.relay_info.as_mut() {
                relay.status = RelayStatus::Degraded;
            }
        })
        .await
        .unwrap();
    let tracked = h
        .store
        .get_node(&cgnat_node_id)
        .await
        .unwrap()
        .cgnat_info
        .unwrap();
    // Degraded relay remains valid for the existing attachment
    assert!(h
        .relay
        .reconcile(&cgnat_node_id, Some(tracked))
        .await
        .unwrap()
        .is_some());

    h.store
        .update_node(&relay_node_id, |node| {
            if let Some(relay) = node.relay_info.as_mut() {
                relay.status = RelayStatus::Offline;
            }
        })
        .await
        .unwrap();
    // Offline relay is invalid; with no other relay available the node
    // ends up unassigned
    let result = h.relay.reconcile(&cgnat_node_id, None).await.unwrap();
    assert!(result.is_none());
    assert!(h
        .store
        .get_node(&cgnat_node_id)
        .await
        .unwrap()
        .cgnat_info
        .is_none());
}

/// Create a user VM on the CGNAT node and bring it to Running with a
/// private ip.
async fn running_vm_on(h: &Harness, node_id: &str, private_ip: &str) -> String {
    let vm = h
        .vms
        .create(CreateVmParams {
            name: "app".to_string(),
            owner_id: "user-1".to_string(),
            cpu_cores: 2,
            memory_bytes: 2 << 30,
            disk_bytes: 20 << 30,
            image_id: "ubuntu-24.04".to_string(),
            tier: QualityTier::Standard,
            target_node_id: Some(node_id.to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
        .vm;
    let observed = Mutex::new(Vec::new());
    run_agent_once(h, node_id, &observed, |_| {
        Some(success_ack(serde_json::json!({ "privateIp": private_ip })))
    })
    .await;
    wait_for_status(h, &vm.id, VmStatus::Running).await;
    vm.id
}

/// Background agent that keeps draining and answering commands for one
/// node until dropped.
fn spawn_agent(
    h: Arc<Harness>,
    node_id: String,
    observed: Arc<Mutex<Vec<(String, NodeCommand)>>>,
    respond: impl Fn(&NodeCommand) -> Option<nimbus_api::command::CommandAck> + Send + Sync + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            run_agent_once(&h, &node_id, &observed, &respond).await;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
}

#[tokio::test]
async fn test_cgnat_three_hop_port_allocation() {
    let h = Arc::new(harness());
    let (relay_node_id, cgnat_node_id) = cgnat_setup(&h).await;
    let vm_id = running_vm_on(&h, &cgnat_node_id, "10.100.0.9").await;
    let tunnel_ip = h
        .store
        .get_node(&cgnat_node_id)
        .await
        .unwrap()
        .cgnat_info
        .unwrap()
        .tunnel_ip;

    let observed = Arc::new(Mutex::new(Vec::new()));

    // Relay agent allocates external port 30022
    let relay_agent = spawn_agent(
        Arc::clone(&h),
        relay_node_id.clone(),
        Arc::clone(&observed),
        |cmd| match cmd.command_type {
            CommandType::AllocatePort => Some(success_ack(serde_json::json!({
                "publicPort": 30022,
                "vmPort": cmd.payload["vmPort"],
                "protocol": cmd.payload["protocol"],
            }))),
            _ => Some(success_ack(serde_json::json!({}))),
        },
    );
    // CGNAT agent wires the forwarding
    let cgnat_agent = spawn_agent(
        Arc::clone(&h),
        cgnat_node_id.clone(),
        Arc::clone(&observed),
        |_| Some(success_ack(serde_json::json!({}))),
    );

    let allocation = h.ports.allocate(&vm_id, 22, "tcp").await.unwrap();
    relay_agent.abort();
    cgnat_agent.abort();

    assert!(allocation.success);
    assert_eq!(allocation.public_port, 30022);

    // Observe the outbound command sequence
    let observed = observed.lock().await;
    let allocates: Vec<_> = observed
        .iter()
        .filter(|(_, c)| c.command_type == CommandType::AllocatePort)
        .collect();
    assert_eq!(allocates.len(), 2);

    let (first_node, first) = &allocates[0];
    assert_eq!(first_node, &relay_node_id);
    assert_eq!(first.payload["isRelayForwarding"], true);
    assert_eq!(first.payload["tunnelDestinationIp"], tunnel_ip.as_str());

    let (second_node, second) = &allocates[1];
    assert_eq!(second_node, &cgnat_node_id);
    assert_eq!(second.payload["publicPort"], 30022);
    assert_eq!(second.payload["vmPrivateIp"], "10.100.0.9");

    // The VM's mapping records the allocated port
    let vm = h.store.get_vm(&vm_id).await.unwrap();
    let mapping = vm.network.mapping(22, "tcp").unwrap();
    assert_eq!(mapping.public_port, 30022);
}

#[tokio::test]
async fn test_cgnat_step2_failure_rolls_back_relay_port() {
    let h = Arc::new(harness());
    let (relay_node_id, cgnat_node_id) = cgnat_setup(&h).await;
    let vm_id = running_vm_on(&h, &cgnat_node_id, "10.100.0.9").await;

    let observed = Arc::new(Mutex::new(Vec::new()));
    let relay_agent = spawn_agent(
        Arc::clone(&h),
        relay_node_id.clone(),
        Arc::clone(&observed),
        |cmd| match cmd.command_type {
            CommandType::AllocatePort => Some(success_ack(serde_json::json!({
                "publicPort": 30023,
                "vmPort": cmd.payload["vmPort"],
                "protocol": cmd.payload["protocol"],
            }))),
            CommandType::RemovePort => Some(success_ack(serde_json::json!({}))),
            _ => Some(success_ack(serde_json::json!({}))),
        },
    );
    // The CGNAT node cannot set up the forwarding
    let cgnat_agent = spawn_agent(
        Arc::clone(&h),
        cgnat_node_id.clone(),
        Arc::clone(&observed),
        |cmd| match cmd.command_type {
            CommandType::AllocatePort => Some(failure_ack("nftables rule rejected")),
            _ => Some(success_ack(serde_json::json!({}))),
        },
    );

    let err = h.ports.allocate(&vm_id, 22, "tcp").await.unwrap_err();
    assert_eq!(err.code(), "external");

    // The rollback RemovePort lands on the relay, keyed by public port
    let mut saw_rollback = false;
    for _ in 0..100 {
        let observed = observed.lock().await;
        if observed.iter().any(|(node, c)| {
            node == &relay_node_id
                && c.command_type == CommandType::RemovePort
                && c.payload["publicPort"] == 30023
                && c.payload["isRelayForwarding"] == true
        }) {
            saw_rollback = true;
            break;
        }
        drop(observed);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    relay_agent.abort();
    cgnat_agent.abort();
    assert!(saw_rollback, "RemovePort rollback never reached the relay");

    // The placeholder mapping is gone
    let vm = h.store.get_vm(&vm_id).await.unwrap();
    assert!(vm.network.mapping(22, "tcp").is_none());
}

#[tokio::test]
async fn test_direct_port_allocation_and_release() {
    let h = Arc::new(harness());
    let node = register_node(&h, NodeParams::default()).await;
    let vm_id = running_vm_on(&h, &node.node_id, "10.100.0.4").await;

    let observed = Arc::new(Mutex::new(Vec::new()));
    let agent = spawn_agent(
        Arc::clone(&h),
        node.node_id.clone(),
        Arc::clone(&observed),
        |cmd| match cmd.command_type {
            CommandType::AllocatePort => Some(success_ack(serde_json::json!({
                "publicPort": 31000,
                "vmPort": cmd.payload["vmPort"],
                "protocol": cmd.payload["protocol"],
            }))),
            _ => Some(success_ack(serde_json::json!({}))),
        },
    );

    let allocation = h.ports.allocate(&vm_id, 8080, "tcp").await.unwrap();
    assert!(allocation.success);
    assert_eq!(allocation.public_port, 31000);
    assert!(!allocation.is_dns_configured);
    assert!(allocation.dns_record_id.is_none());

    // Allocating the same port again is idempotent
    let again = h.ports.allocate(&vm_id, 8080, "tcp").await.unwrap();
    assert_eq!(again.public_port, 31000);

    h.ports.release(&vm_id, 8080, "tcp").await.unwrap();
    agent.abort();

    let vm = h.store.get_vm(&vm_id).await.unwrap();
    assert!(vm.network.mapping(8080, "tcp").is_none());
}

#[tokio::test]
async fn test_port_allocation_times_out_to_partial_success() {
    let h = harness();
    let node = register_node(&h, NodeParams::default()).await;
    let vm_id = running_vm_on(&h, &node.node_id, "10.100.0.4").await;

    // No agent answers: polling exhausts and reports partial success
    let allocation = h.ports.allocate(&vm_id, 9090, "tcp").await.unwrap();
    assert!(allocation.success);
    assert_eq!(allocation.public_port, 0);
    assert!(allocation.message.contains("in progress"));
}
