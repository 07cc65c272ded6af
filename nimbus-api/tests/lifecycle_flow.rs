//! End-to-end lifecycle scenarios over the service layer: create,
//! heartbeat reconciliation, acknowledgment routing, deletion, orphan
//! recovery and the health watchdog.

mod common;

use common::*;
use nimbus_api::command::CommandType;
use nimbus_api::model::{QualityTier, VmStatus};
use nimbus_api::services::node::{ActiveVmReport, HeartbeatRequest};
use nimbus_api::services::vm::CreateVmParams;
use tokio::sync::Mutex;

fn standard_vm(name: &str, owner: &str) -> CreateVmParams {
    CreateVmParams {
        name: name.to_string(),
        owner_id: owner.to_string(),
        owner_wallet: Some("0x00000000000000000000000000000000000000aa".to_string()),
        cpu_cores: 4,
        memory_bytes: 8 << 30,
        disk_bytes: 100 << 30,
        image_id: "ubuntu-24.04".to_string(),
        tier: QualityTier::Standard,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_happy_path_create_then_delete() {
    let h = harness();
    let node = register_node(&h, NodeParams::default()).await;

    let result = h.vms.create(standard_vm("web", "user-1")).await.unwrap();
    let vm_id = result.vm.id.clone();
    assert_eq!(result.vm.status, VmStatus::Provisioning);
    assert!(result.plaintext_password.is_some());
    assert!(result.vm.name.starts_with("web-"));

    // Reservation: 4 vCPU x (1500/1000) = 6 points, plus memory and disk
    let node_record = h.store.get_node(&node.node_id).await.unwrap();
    assert_eq!(node_record.reserved.compute_points, 6.0);
    assert_eq!(node_record.reserved.memory_bytes, 8 << 30);
    assert_eq!(node_record.reserved.storage_bytes, 100 << 30);

    // Agent completes the CreateVm command
    let observed = Mutex::new(Vec::new());
    let handled = run_agent_once(&h, &node.node_id, &observed, |cmd| {
        assert_eq!(cmd.command_type, CommandType::CreateVm);
        assert!(!cmd.payload["baseImageUrl"].as_str().unwrap().is_empty());
        Some(success_ack(serde_json::json!({ "privateIp": "10.100.0.5" })))
    })
    .await;
    assert_eq!(handled, 1);

    let vm = wait_for_status(&h, &vm_id, VmStatus::Running).await;
    assert_eq!(vm.network.private_ip.as_deref(), Some("10.100.0.5"));
    assert!(vm.active_command.is_none());

    // Quota usage reflects the running VM
    let user = h.store.get_user("user-1").await.unwrap();
    assert_eq!(user.usage.vms, 1);
    assert_eq!(user.usage.cpu_cores, 4);

    // Delete through the command protocol
    let vm = h.vms.delete(&vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Deleting);

    // Resources are not freed until the ack arrives
    let node_record = h.store.get_node(&node.node_id).await.unwrap();
    assert_eq!(node_record.reserved.compute_points, 6.0);

    run_agent_once(&h, &node.node_id, &observed, |cmd| {
        assert_eq!(cmd.command_type, CommandType::DeleteVm);
        Some(success_ack(serde_json::json!({})))
    })
    .await;

    let vm = wait_for_status(&h, &vm_id, VmStatus::Deleted).await;
    assert!(vm.reserved_cost.is_none());

    let node_record = h.store.get_node(&node.node_id).await.unwrap();
    assert!(node_record.reserved.is_zero());

    let user = h.store.get_user("user-1").await.unwrap();
    assert_eq!(user.usage.vms, 0);
    assert_eq!(user.usage.cpu_cores, 0);
    assert_eq!(user.usage.memory_bytes, 0);
    assert_eq!(user.usage.storage_bytes, 0);
}

#[tokio::test]
async fn test_heartbeat_cannot_overwrite_transitional_status() {
    let h = harness();
    let node = register_node(&h, NodeParams::default()).await;

    let result = h.vms.create(standard_vm("web", "user-1")).await.unwrap();
    let vm_id = result.vm.id.clone();

    let observed = Mutex::new(Vec::new());
    run_agent_once(&h, &node.node_id, &observed, |_| {
        Some(success_ack(serde_json::json!({})))
    })
    .await;
    wait_for_status(&h, &vm_id, VmStatus::Running).await;

    // Deletion starts; the agent's next heartbeat still says "running"
    h.vms.delete(&vm_id).await.unwrap();
    let response = h
        .nodes
        .heartbeat(
            &node.node_id,
            HeartbeatRequest {
                active_vms: vec![ActiveVmReport {
                    vm_id: vm_id.clone(),
                    state: "running".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(response.accepted);

    // The stale heartbeat must not clobber the Deleting status
    let vm = h.store.get_vm(&vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Deleting);

    // The heartbeat drained the DeleteVm command; ack it
    let delete_cmd = response
        .commands
        .iter()
        .find(|c| c.command_type == CommandType::DeleteVm)
        .expect("DeleteVm was queued");
    h.nodes
        .acknowledge(
            &node.node_id,
            &delete_cmd.command_id,
            success_ack(serde_json::json!({})),
        )
        .await
        .unwrap();
    wait_for_status(&h, &vm_id, VmStatus::Deleted).await;
}

#[tokio::test]
async fn test_orphan_recovery_from_heartbeat() {
    let h = harness();
    let node = register_node(&h, NodeParams::default()).await;

    // Control plane knows nothing about this VM (fresh store)
    h.nodes
        .heartbeat(
            &node.node_id,
            HeartbeatRequest {
                active_vms: vec![ActiveVmReport {
                    vm_id: "vm-orphan-1".to_string(),
                    name: Some("lost-vm".to_string()),
                    state: "running".to_string(),
                    owner_id: Some("user-42".to_string()),
                    ip_address: Some("10.100.0.17".to_string()),
                    cpu_cores: Some(2),
                    memory_bytes: Some(2 << 30),
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let vm = h.store.get_vm("vm-orphan-1").await.unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert_eq!(vm.owner_id, "user-42");
    assert_eq!(vm.spec.cpu_cores, 2);
    assert_eq!(vm.spec.memory_bytes, 2 << 30);
    assert_eq!(vm.network.private_ip.as_deref(), Some("10.100.0.17"));
    assert_eq!(vm.labels.get("recovered").map(String::as_str), Some("true"));
    assert_eq!(
        vm.labels.get("recovery-node").map(String::as_str),
        Some(node.node_id.as_str())
    );

    // Ingress saw the recovered VM start
    assert!(h
        .ingress
        .started
        .lock()
        .await
        .contains(&"vm-orphan-1".to_string()));

    // The node now accounts for the recovered workload
    let node_record = h.store.get_node(&node.node_id).await.unwrap();
    assert!(node_record.reserved.compute_points > 0.0);
}

#[tokio::test]
async fn test_no_suitable_node_keeps_vm_pending() {
    let h = harness();
    // 2000 benchmark serves Standard at best, never Guaranteed
    register_node(&h, NodeParams::default()).await;

    let mut params = standard_vm("gold", "user-1");
    params.tier = QualityTier::Guaranteed;
    let result = h.vms.create(params).await.unwrap();
    assert_eq!(result.vm.status, VmStatus::Pending);
    assert!(result
        .vm
        .status_message
        .as_deref()
        .unwrap()
        .contains("No suitable node"));

    // A qualifying node registers; a re-schedule attempt succeeds
    register_node(
        &h,
        NodeParams {
            machine_id: "machine-2".to_string(),
            benchmark: 3200.0,
            ..Default::default()
        },
    )
    .await;
    let scheduled = h.vms.reschedule_pending().await;
    assert_eq!(scheduled, 1);

    let vm = h.store.get_vm(&result.vm.id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Provisioning);
    assert!(vm.node_id.is_some());
}

#[tokio::test]
async fn test_ack_falls_back_to_status_message_lookup() {
    let h = harness();
    let node = register_node(&h, NodeParams::default()).await;

    let result = h.vms.create(standard_vm("web", "user-1")).await.unwrap();
    let vm_id = result.vm.id.clone();
    let observed = Mutex::new(Vec::new());
    run_agent_once(&h, &node.node_id, &observed, |_| {
        Some(success_ack(serde_json::json!({})))
    })
    .await;
    wait_for_status(&h, &vm_id, VmStatus::Running).await;

    h.vms.delete(&vm_id).await.unwrap();
    let vm = h.store.get_vm(&vm_id).await.unwrap();
    let command_id = vm.active_command.as_ref().unwrap().id.clone();

    // Simulate a crash that lost both the registry entry and the VM's
    // active-command record, leaving only a legacy status message
    h.store.try_complete_command(&command_id).await.unwrap();
    h.store
        .update_vm(&vm_id, |vm| {
            vm.active_command = None;
            vm.status_message = Some(format!("Deletion requested (command {})", command_id));
        })
        .await
        .unwrap();

    // Drain the queued DeleteVm so the ack is the only signal left
    h.store.drain_pending_commands(&node.node_id).await;

    h.nodes
        .acknowledge(&node.node_id, &command_id, success_ack(serde_json::json!({})))
        .await
        .unwrap();

    let vm = wait_for_status(&h, &vm_id, VmStatus::Deleted).await;
    assert!(vm.status_message.is_some());
}

#[tokio::test]
async fn test_delete_vm_not_found_reconciliation() {
    let h = harness();
    let node = register_node(&h, NodeParams::default()).await;

    let result = h.vms.create(standard_vm("web", "user-1")).await.unwrap();
    let vm_id = result.vm.id.clone();
    let observed = Mutex::new(Vec::new());
    run_agent_once(&h, &node.node_id, &observed, |_| {
        Some(success_ack(serde_json::json!({})))
    })
    .await;
    wait_for_status(&h, &vm_id, VmStatus::Running).await;

    h.vms.delete(&vm_id).await.unwrap();

    // The node lost the VM already; its ack is a failure saying so
    run_agent_once(&h, &node.node_id, &observed, |cmd| {
        assert_eq!(cmd.command_type, CommandType::DeleteVm);
        Some(failure_ack("domain not found on hypervisor"))
    })
    .await;

    // "not found" during deletion reconciles to Deleted, not Error
    let vm = wait_for_status(&h, &vm_id, VmStatus::Deleted).await;
    assert!(vm.reserved_cost.is_none());
    let node_record = h.store.get_node(&node.node_id).await.unwrap();
    assert!(node_record.reserved.is_zero());
}

#[tokio::test]
async fn test_double_delete_changes_nothing() {
    let h = harness();
    let node = register_node(&h, NodeParams::default()).await;

    let result = h.vms.create(standard_vm("web", "user-1")).await.unwrap();
    let vm_id = result.vm.id.clone();
    let observed = Mutex::new(Vec::new());
    run_agent_once(&h, &node.node_id, &observed, |_| {
        Some(success_ack(serde_json::json!({})))
    })
    .await;
    wait_for_status(&h, &vm_id, VmStatus::Running).await;

    h.vms.delete(&vm_id).await.unwrap();
    // Second delete returns success without queueing another command
    let pending_before = h.store.pending_command_count(&node.node_id).await;
    let vm = h.vms.delete(&vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Deleting);
    assert_eq!(
        h.store.pending_command_count(&node.node_id).await,
        pending_before
    );

    run_agent_once(&h, &node.node_id, &observed, |_| {
        Some(success_ack(serde_json::json!({})))
    })
    .await;
    wait_for_status(&h, &vm_id, VmStatus::Deleted).await;

    // Deleting an already-deleted VM is a no-op as well
    let user_before = h.store.get_user("user-1").await.unwrap();
    h.vms.delete(&vm_id).await.unwrap();
    let user_after = h.store.get_user("user-1").await.unwrap();
    assert_eq!(user_before.usage.vms, user_after.usage.vms);
}

#[tokio::test]
async fn test_watchdog_marks_silent_node_offline_and_errors_vms() {
    let h = harness();
    let node = register_node(&h, NodeParams::default()).await;

    let result = h.vms.create(standard_vm("web", "user-1")).await.unwrap();
    let vm_id = result.vm.id.clone();
    let observed = Mutex::new(Vec::new());
    run_agent_once(&h, &node.node_id, &observed, |_| {
        Some(success_ack(serde_json::json!({})))
    })
    .await;
    wait_for_status(&h, &vm_id, VmStatus::Running).await;

    // Push the last heartbeat past the offline threshold
    h.store
        .update_node(&node.node_id, |n| {
            n.last_heartbeat = chrono::Utc::now() - chrono::Duration::minutes(10);
        })
        .await
        .unwrap();

    let marked = h.nodes.check_node_health(chrono::Utc::now()).await;
    assert_eq!(marked, 1);

    let node_record = h.store.get_node(&node.node_id).await.unwrap();
    assert_eq!(
        node_record.status,
        nimbus_api::model::NodeStatus::Offline
    );
    let vm = h.store.get_vm(&vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Error);

    // The next heartbeat brings the node back online
    let response = h
        .nodes
        .heartbeat(&node.node_id, HeartbeatRequest::default())
        .await
        .unwrap();
    assert!(response.accepted);
    let node_record = h.store.get_node(&node.node_id).await.unwrap();
    assert_eq!(node_record.status, nimbus_api::model::NodeStatus::Online);
}

#[tokio::test]
async fn test_quota_is_enforced() {
    let h = harness();
    register_node(&h, NodeParams::default()).await;

    // Default quota allows 32 cores; ask for more across two VMs
    let mut params = standard_vm("big", "user-1");
    params.cpu_cores = 20;
    h.vms.create(params).await.unwrap();

    let mut params = standard_vm("bigger", "user-1");
    params.cpu_cores = 20;
    let err = h.vms.create(params).await.unwrap_err();
    assert_eq!(err.code(), "quota_exceeded");
}

#[tokio::test]
async fn test_stale_config_version_gets_fresh_config() {
    let h = harness();
    let node = register_node(&h, NodeParams::default()).await;

    let response = h
        .nodes
        .heartbeat(
            &node.node_id,
            HeartbeatRequest {
                scheduling_config_version: Some("ancient".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(response.scheduling_config.is_some());

    let response = h
        .nodes
        .heartbeat(
            &node.node_id,
            HeartbeatRequest {
                scheduling_config_version: Some(h.config.scheduling.version.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(response.scheduling_config.is_none());
}

#[tokio::test]
async fn test_reregistration_preserves_reservations() {
    let h = harness();
    let key = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
    let node = register_node_with_key(&h, NodeParams::default(), &key).await;

    let result = h.vms.create(standard_vm("web", "user-1")).await.unwrap();
    assert_eq!(result.vm.status, VmStatus::Provisioning);

    // Same machine and wallet: the node id and the reservations survive
    let again = register_node_with_key(&h, NodeParams::default(), &key).await;
    assert_eq!(again.node_id, node.node_id);
    let node_record = h.store.get_node(&node.node_id).await.unwrap();
    assert_eq!(node_record.reserved.compute_points, 6.0);
}
