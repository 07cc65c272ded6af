//! Events emitted by store changes.

use crate::command::CommandType;
use crate::model::{Node, VirtualMachine, VmStatus};

/// Events emitted when state changes occur.
///
/// Dispatched via broadcast channels to subscribers (audit shipping,
/// tests, the obligation reconciler).
#[derive(Debug, Clone)]
pub enum Event {
    // Node events
    /// A new node completed registration.
    NodeRegistered(Node),
    /// A previously offline node resumed heartbeating.
    NodeOnline { id: String },
    /// The health watchdog marked a node offline.
    NodeOffline { id: String },
    /// A node was explicitly removed.
    NodeDecommissioned { id: String },

    // VM events
    /// A new VM was created.
    VmCreated(VirtualMachine),
    /// A VM's lifecycle status changed.
    VmStatusChanged {
        id: String,
        old: VmStatus,
        new: VmStatus,
    },
    /// An orphan VM was synthesized from a node report.
    VmRecovered(VirtualMachine),
    /// A VM reached its terminal state.
    VmDeleted { id: String },

    // Command events
    /// A command was queued for a node.
    CommandQueued {
        node_id: String,
        command_id: String,
        command_type: CommandType,
    },
    /// An ack or sweep could not be matched to a VM.
    CommandOrphaned {
        node_id: String,
        command_id: String,
    },

    // Relay events
    /// A CGNAT node was attached to a relay.
    RelayAssigned {
        node_id: String,
        relay_node_id: String,
        tunnel_ip: String,
    },
}

impl Event {
    /// Get the resource type for this event.
    pub fn resource_type(&self) -> &'static str {
        match self {
            Event::NodeRegistered(_)
            | Event::NodeOnline { .. }
            | Event::NodeOffline { .. }
            | Event::NodeDecommissioned { .. } => "node",
            Event::VmCreated(_)
            | Event::VmStatusChanged { .. }
            | Event::VmRecovered(_)
            | Event::VmDeleted { .. } => "vm",
            Event::CommandQueued { .. } | Event::CommandOrphaned { .. } => "command",
            Event::RelayAssigned { .. } => "relay",
        }
    }

    /// Get the primary resource ID for this event.
    pub fn resource_id(&self) -> &str {
        match self {
            Event::NodeRegistered(n) => &n.id,
            Event::NodeOnline { id }
            | Event::NodeOffline { id }
            | Event::NodeDecommissioned { id } => id,
            Event::VmCreated(v) | Event::VmRecovered(v) => &v.id,
            Event::VmStatusChanged { id, .. } | Event::VmDeleted { id } => id,
            Event::CommandQueued { command_id, .. } | Event::CommandOrphaned { command_id, .. } => {
                command_id
            }
            Event::RelayAssigned { node_id, .. } => node_id,
        }
    }
}
