//! Outbound commands queued for node agents.
//!
//! Commands travel inside heartbeat responses: the per-node pending queue
//! is drained on each agent poll. Commands that require an acknowledgment
//! are correlated through the command registry until the agent posts the
//! ack back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use utoipa::ToSchema;

use crate::model::VmServiceStatus;

/// Type tag for routing acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    CreateVm,
    StartVm,
    StopVm,
    DeleteVm,
    AllocatePort,
    RemovePort,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::CreateVm => "CreateVm",
            CommandType::StartVm => "StartVm",
            CommandType::StopVm => "StopVm",
            CommandType::DeleteVm => "DeleteVm",
            CommandType::AllocatePort => "AllocatePort",
            CommandType::RemovePort => "RemovePort",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope delivered to the node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCommand {
    pub command_id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub requires_ack: bool,
    pub target_resource_id: String,
}

impl NodeCommand {
    pub fn new(
        command_type: CommandType,
        target_resource_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            command_type,
            payload,
            requires_ack: true,
            target_resource_id: target_resource_id.to_string(),
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VmNetworkPayload {
    pub mac_address: String,
    pub ip_address: Option<String>,
    pub gateway: Option<String>,
    pub vxlan_vni: Option<u32>,
    pub allowed_ports: Vec<u16>,
}

/// Full payload of a CreateVm command. The plaintext password and any
/// sensitive labels travel here only; they are stripped from the persisted
/// VM record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVmPayload {
    pub vm_id: String,
    pub name: String,
    pub vm_type: String,
    pub owner_id: String,
    pub owner_wallet: Option<String>,
    pub virtual_cpu_cores: u32,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub quality_tier: String,
    pub compute_point_cost: f64,
    pub base_image_url: String,
    pub ssh_public_key: Option<String>,
    pub gpu_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_pci_address: Option<String>,
    pub deployment_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
    pub network: VmNetworkPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub user_data: String,
    pub labels: HashMap<String, String>,
    pub services: Vec<VmServiceStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StopVmPayload {
    pub vm_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVmPayload {
    pub vm_id: String,
}

/// AllocatePort payload. For the relay hop of a CGNAT path,
/// `is_relay_forwarding` is set and `tunnel_destination_ip` names the
/// CGNAT node inside the relay's tunnel subnet. For the CGNAT hop,
/// `public_port` carries the port the relay already allocated.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AllocatePortPayload {
    pub vm_id: String,
    pub vm_port: u16,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_private_ip: Option<String>,
    #[serde(default)]
    pub is_relay_forwarding: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_destination_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemovePortPayload {
    pub vm_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
    pub protocol: String,
    #[serde(default)]
    pub is_relay_forwarding: bool,
}

// =============================================================================
// Acknowledgments
// =============================================================================

/// Acknowledgment posted by a node agent for a completed command.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    pub completed_at: DateTime<Utc>,
}

/// Structured fields an agent may return in ack data.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AckData {
    #[serde(default)]
    pub public_port: Option<u16>,
    #[serde(default)]
    pub vm_port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub private_ip: Option<String>,
}

impl CommandAck {
    /// Parse the structured part of the ack data, tolerating absent or
    /// unknown fields.
    pub fn parsed_data(&self) -> AckData {
        self.data
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_envelope_wire_shape() {
        let cmd = NodeCommand::new(
            CommandType::DeleteVm,
            "vm-1",
            serde_json::to_value(DeleteVmPayload {
                vm_id: "vm-1".to_string(),
            })
            .unwrap(),
        );
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "DeleteVm");
        assert_eq!(json["targetResourceId"], "vm-1");
        assert_eq!(json["requiresAck"], true);
        assert_eq!(json["payload"]["vmId"], "vm-1");
    }

    #[test]
    fn test_allocate_port_relay_hop_shape() {
        let payload = AllocatePortPayload {
            vm_id: "vm-1".to_string(),
            vm_port: 22,
            protocol: "tcp".to_string(),
            is_relay_forwarding: true,
            tunnel_destination_ip: Some("10.200.1.7".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["isRelayForwarding"], true);
        assert_eq!(json["tunnelDestinationIp"], "10.200.1.7");
        assert!(json.get("publicPort").is_none());
    }

    #[test]
    fn test_ack_data_tolerates_unknown_fields() {
        let ack = CommandAck {
            success: true,
            error_message: None,
            data: Some(serde_json::json!({
                "publicPort": 30022,
                "somethingNew": "ignored"
            })),
            completed_at: Utc::now(),
        };
        assert_eq!(ack.parsed_data().public_port, Some(30022));
    }
}
