//! In-memory data store with secondary indexes and write-behind tracking.
//!
//! This is the only shared mutable state in the control plane. A single
//! RwLock over the state makes every operation on a single entity
//! linearizable; the per-entity update methods are the serialization
//! points the lifecycle manager relies on. Durability is write-behind:
//! mutations mark entities dirty and the sync service flushes them to the
//! document store on its own cadence.

use chrono::{DateTime, Utc};
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use tokio::sync::{broadcast, RwLock};
use tracing::error;

use crate::command::{CommandType, NodeCommand};
use crate::model::{
    CommandRegistration, Node, NodeStatus, ResourceCapacity, UserData, VirtualMachine, VmStatus,
};

use super::document::{collections, DocumentStore};
use super::error::{Result, StoreError};
use super::event::Event;

/// Entity kinds tracked for write-behind flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Node,
    Vm,
    User,
    Command,
}

impl EntityKind {
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Node => collections::NODES,
            EntityKind::Vm => collections::VMS,
            EntityKind::User => collections::USERS,
            EntityKind::Command => collections::COMMANDS,
        }
    }
}

#[derive(Default)]
struct DirtySet {
    nodes: HashSet<String>,
    vms: HashSet<String>,
    users: HashSet<String>,
    commands: HashSet<String>,
    /// (collection, id) pairs removed since the last flush.
    deleted: Vec<(&'static str, String)>,
}

/// Entities pending a flush, cloned out under the lock.
pub struct DirtySnapshot {
    pub nodes: Vec<Node>,
    pub vms: Vec<VirtualMachine>,
    pub users: Vec<UserData>,
    pub commands: Vec<CommandRegistration>,
    pub deleted: Vec<(&'static str, String)>,
}

impl DirtySnapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.vms.is_empty()
            && self.users.is_empty()
            && self.commands.is_empty()
            && self.deleted.is_empty()
    }
}

struct StoreState {
    nodes: HashMap<String, Node>,
    vms: HashMap<String, VirtualMachine>,
    users: HashMap<String, UserData>,
    commands: HashMap<String, CommandRegistration>,
    pending: HashMap<String, Vec<NodeCommand>>,

    // Secondary indexes
    vms_by_owner: HashMap<String, HashSet<String>>,
    vms_by_node: HashMap<String, HashSet<String>>,
    /// VMs whose status is not Deleted; the uniqueness-check fast path.
    active_vms: HashSet<String>,

    dirty: DirtySet,
    /// Command ids already completed, to tell duplicate acks apart from
    /// unknown ones.
    completed_commands: LruCache<String, DateTime<Utc>>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            vms: HashMap::new(),
            users: HashMap::new(),
            commands: HashMap::new(),
            pending: HashMap::new(),
            vms_by_owner: HashMap::new(),
            vms_by_node: HashMap::new(),
            active_vms: HashSet::new(),
            dirty: DirtySet::default(),
            completed_commands: LruCache::new(NonZeroUsize::new(4096).unwrap()),
        }
    }

    fn index_vm(&mut self, vm: &VirtualMachine, old_node_id: Option<&str>) {
        self.vms_by_owner
            .entry(vm.owner_id.clone())
            .or_default()
            .insert(vm.id.clone());
        if let Some(old) = old_node_id {
            if vm.node_id.as_deref() != Some(old) {
                if let Some(set) = self.vms_by_node.get_mut(old) {
                    set.remove(&vm.id);
                }
            }
        }
        if let Some(node_id) = &vm.node_id {
            self.vms_by_node
                .entry(node_id.clone())
                .or_default()
                .insert(vm.id.clone());
        }
        if vm.status == VmStatus::Deleted {
            self.active_vms.remove(&vm.id);
        } else {
            self.active_vms.insert(vm.id.clone());
        }
    }

    fn check_node_invariant(node: &Node) {
        if node.reserved.exceeds(&node.total) {
            // Observation only. Never auto-correct.
            error!(
                node_id = %node.id,
                reserved = ?node.reserved,
                total = ?node.total,
                "invariant violation: reserved exceeds total"
            );
        }
    }
}

/// The control plane's data store: persistent keyed entities plus the
/// command registry and per-node pending-command queues.
pub struct DataStore {
    state: RwLock<StoreState>,
    events: broadcast::Sender<Event>,
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(StoreState::new()),
            events,
        }
    }

    /// Subscribe to state change events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub async fn get_node(&self, id: &str) -> Option<Node> {
        self.state.read().await.nodes.get(id).cloned()
    }

    /// List all nodes.
    pub async fn get_all_nodes(&self) -> Vec<Node> {
        self.state.read().await.nodes.values().cloned().collect()
    }

    /// List online nodes only.
    pub async fn get_active_nodes(&self) -> Vec<Node> {
        self.state
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Online)
            .cloned()
            .collect()
    }

    pub async fn save_node(&self, node: Node) {
        let mut state = self.state.write().await;
        StoreState::check_node_invariant(&node);
        state.dirty.nodes.insert(node.id.clone());
        state.nodes.insert(node.id.clone(), node);
    }

    /// Mutate a node in place under the store lock.
    pub async fn update_node<F>(&self, id: &str, f: F) -> Result<Node>
    where
        F: FnOnce(&mut Node),
    {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", id)))?;
        f(node);
        node.updated_at = Utc::now();
        let snapshot = node.clone();
        StoreState::check_node_invariant(&snapshot);
        state.dirty.nodes.insert(id.to_string());
        Ok(snapshot)
    }

    pub async fn remove_node(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .nodes
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", id)))?;
        state.dirty.nodes.remove(id);
        state
            .dirty
            .deleted
            .push((collections::NODES, id.to_string()));
        Ok(())
    }

    // =========================================================================
    // VMs
    // =========================================================================

    pub async fn get_vm(&self, id: &str) -> Option<VirtualMachine> {
        self.state.read().await.vms.get(id).cloned()
    }

    pub async fn get_all_vms(&self) -> Vec<VirtualMachine> {
        self.state.read().await.vms.values().cloned().collect()
    }

    pub async fn get_vms_by_user(&self, owner_id: &str) -> Vec<VirtualMachine> {
        let state = self.state.read().await;
        state
            .vms_by_owner
            .get(owner_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.vms.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn get_vms_by_node(&self, node_id: &str) -> Vec<VirtualMachine> {
        let state = self.state.read().await;
        state
            .vms_by_node
            .get(node_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.vms.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn get_vms_by_status(&self, status: VmStatus) -> Vec<VirtualMachine> {
        self.state
            .read()
            .await
            .vms
            .values()
            .filter(|v| v.status == status)
            .cloned()
            .collect()
    }

    /// Fast-path uniqueness check over the active-VM index.
    pub async fn owner_has_active_vm_named(&self, owner_id: &str, name: &str) -> bool {
        let state = self.state.read().await;
        match state.vms_by_owner.get(owner_id) {
            Some(ids) => ids
                .iter()
                .filter(|id| state.active_vms.contains(*id))
                .filter_map(|id| state.vms.get(id))
                .any(|vm| vm.name == name),
            None => false,
        }
    }

    /// Global uniqueness check (premium names). Deleted VMs are excluded;
    /// their names are reusable.
    pub async fn any_active_vm_named(&self, name: &str) -> bool {
        let state = self.state.read().await;
        state
            .active_vms
            .iter()
            .filter_map(|id| state.vms.get(id))
            .any(|vm| vm.name == name)
    }

    pub async fn save_vm(&self, vm: VirtualMachine) {
        let mut state = self.state.write().await;
        let old_node_id = state.vms.get(&vm.id).and_then(|v| v.node_id.clone());
        state.index_vm(&vm, old_node_id.as_deref());
        state.dirty.vms.insert(vm.id.clone());
        state.vms.insert(vm.id.clone(), vm);
    }

    /// Mutate a VM in place under the store lock. This is the
    /// serialization point for status updates.
    pub async fn update_vm<F>(&self, id: &str, f: F) -> Result<VirtualMachine>
    where
        F: FnOnce(&mut VirtualMachine),
    {
        let mut state = self.state.write().await;
        let old_node_id = state.vms.get(id).and_then(|v| v.node_id.clone());
        let vm = state
            .vms
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("vm {}", id)))?;
        f(vm);
        vm.updated_at = Utc::now();
        let snapshot = vm.clone();
        state.index_vm(&snapshot, old_node_id.as_deref());
        state.dirty.vms.insert(id.to_string());
        Ok(snapshot)
    }

    pub async fn remove_vm(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let vm = state
            .vms
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("vm {}", id)))?;
        if let Some(set) = state.vms_by_owner.get_mut(&vm.owner_id) {
            set.remove(id);
        }
        if let Some(node_id) = &vm.node_id {
            if let Some(set) = state.vms_by_node.get_mut(node_id) {
                set.remove(id);
            }
        }
        state.active_vms.remove(id);
        state.dirty.vms.remove(id);
        state.dirty.deleted.push((collections::VMS, id.to_string()));
        Ok(())
    }

    // =========================================================================
    // Scheduling updates
    // =========================================================================

    /// Reserve resources on a node and assign the VM to it as one atomic
    /// update. A concurrent delete can therefore never release resources
    /// that were not charged.
    pub async fn assign_vm_to_node(
        &self,
        vm_id: &str,
        node_id: &str,
        cost: ResourceCapacity,
    ) -> Result<(Node, VirtualMachine)> {
        let mut state = self.state.write().await;
        if !state.vms.contains_key(vm_id) {
            return Err(StoreError::NotFound(format!("vm {}", vm_id)));
        }
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node_id)))?;
        if !node.total.can_accommodate(&node.reserved, &cost) {
            return Err(StoreError::Capacity(format!(
                "node {} cannot accommodate {:?}",
                node_id, cost
            )));
        }
        node.reserved.reserve(&cost);
        node.updated_at = Utc::now();
        let node_snapshot = node.clone();
        StoreState::check_node_invariant(&node_snapshot);

        let old_node_id = state.vms.get(vm_id).and_then(|v| v.node_id.clone());
        let vm = state.vms.get_mut(vm_id).expect("checked above");
        vm.node_id = Some(node_id.to_string());
        vm.reserved_cost = Some(cost);
        vm.updated_at = Utc::now();
        let vm_snapshot = vm.clone();
        state.index_vm(&vm_snapshot, old_node_id.as_deref());

        state.dirty.nodes.insert(node_id.to_string());
        state.dirty.vms.insert(vm_id.to_string());
        Ok((node_snapshot, vm_snapshot))
    }

    /// Release the resources a VM holds on its node, flooring at zero.
    /// Idempotent: the reserved cost is cleared on first release, and a
    /// passthrough GPU is returned to the pool.
    pub async fn release_vm_resources(&self, vm_id: &str) -> Result<Option<ResourceCapacity>> {
        let mut state = self.state.write().await;
        let vm = state
            .vms
            .get_mut(vm_id)
            .ok_or_else(|| StoreError::NotFound(format!("vm {}", vm_id)))?;
        let Some(cost) = vm.reserved_cost.take() else {
            return Ok(None);
        };
        let node_id = vm.node_id.clone();
        let gpu_pci = vm.gpu_pci_address.take();
        state.dirty.vms.insert(vm_id.to_string());

        if let Some(node_id) = node_id {
            if let Some(node) = state.nodes.get_mut(&node_id) {
                node.reserved.release(&cost);
                if let Some(pci) = &gpu_pci {
                    if let Some(gpu) = node.hardware.gpus.iter_mut().find(|g| &g.pci_address == pci)
                    {
                        gpu.available = true;
                    }
                }
                node.updated_at = Utc::now();
                state.dirty.nodes.insert(node_id);
            }
        }
        Ok(Some(cost))
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub async fn get_user(&self, id: &str) -> Option<UserData> {
        self.state.read().await.users.get(id).cloned()
    }

    pub async fn save_user(&self, user: UserData) {
        let mut state = self.state.write().await;
        state.dirty.users.insert(user.id.clone());
        state.users.insert(user.id.clone(), user);
    }

    pub async fn get_or_create_user(&self, id: &str, wallet: Option<String>) -> UserData {
        let mut state = self.state.write().await;
        if let Some(user) = state.users.get(id) {
            return user.clone();
        }
        let user = UserData::new(id, wallet);
        state.dirty.users.insert(id.to_string());
        state.users.insert(id.to_string(), user.clone());
        user
    }

    pub async fn update_user<F>(&self, id: &str, f: F) -> Result<UserData>
    where
        F: FnOnce(&mut UserData),
    {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", id)))?;
        f(user);
        let snapshot = user.clone();
        state.dirty.users.insert(id.to_string());
        Ok(snapshot)
    }

    // =========================================================================
    // Command registry
    // =========================================================================

    /// Register an outstanding command for ack correlation.
    pub async fn register_command(
        &self,
        command_id: &str,
        vm_id: &str,
        node_id: &str,
        command_type: CommandType,
    ) -> CommandRegistration {
        let registration = CommandRegistration {
            command_id: command_id.to_string(),
            vm_id: vm_id.to_string(),
            node_id: node_id.to_string(),
            command_type,
            issued_at: Utc::now(),
            completed_at: None,
        };
        let mut state = self.state.write().await;
        state.dirty.commands.insert(command_id.to_string());
        state
            .commands
            .insert(command_id.to_string(), registration.clone());
        registration
    }

    /// Remove and return the registration for a command id.
    ///
    /// At most one caller observes the registration; concurrent attempts
    /// and duplicate acks get None.
    pub async fn try_complete_command(&self, command_id: &str) -> Option<CommandRegistration> {
        let mut state = self.state.write().await;
        match state.commands.remove(command_id) {
            Some(mut registration) => {
                registration.completed_at = Some(Utc::now());
                state
                    .completed_commands
                    .put(command_id.to_string(), Utc::now());
                state.dirty.commands.remove(command_id);
                state
                    .dirty
                    .deleted
                    .push((collections::COMMANDS, command_id.to_string()));
                Some(registration)
            }
            None => None,
        }
    }

    /// True if the command was completed recently (duplicate-ack probe).
    pub async fn was_command_completed(&self, command_id: &str) -> bool {
        self.state
            .write()
            .await
            .completed_commands
            .contains(command_id)
    }

    /// Registrations issued before the cutoff, for the sweeper.
    pub async fn stale_commands(&self, issued_before: DateTime<Utc>) -> Vec<CommandRegistration> {
        self.state
            .read()
            .await
            .commands
            .values()
            .filter(|r| r.issued_at < issued_before)
            .cloned()
            .collect()
    }

    pub async fn get_command(&self, command_id: &str) -> Option<CommandRegistration> {
        self.state.read().await.commands.get(command_id).cloned()
    }

    // =========================================================================
    // Pending command queues
    // =========================================================================

    /// Queue a command for the node's next heartbeat poll.
    pub async fn append_pending_command(&self, node_id: &str, command: NodeCommand) {
        let command_id = command.command_id.clone();
        let command_type = command.command_type;
        {
            let mut state = self.state.write().await;
            state
                .pending
                .entry(node_id.to_string())
                .or_default()
                .push(command);
        }
        self.emit(Event::CommandQueued {
            node_id: node_id.to_string(),
            command_id,
            command_type,
        });
    }

    /// Drain the node's queue atomically: the caller gets everything or,
    /// under contention, nothing another poll already took.
    pub async fn drain_pending_commands(&self, node_id: &str) -> Vec<NodeCommand> {
        self.state
            .write()
            .await
            .pending
            .remove(node_id)
            .unwrap_or_default()
    }

    pub async fn pending_command_count(&self, node_id: &str) -> usize {
        self.state
            .read()
            .await
            .pending
            .get(node_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    // =========================================================================
    // Write-behind
    // =========================================================================

    /// Snapshot and clear the dirty sets for the sync flush.
    pub async fn take_dirty(&self) -> DirtySnapshot {
        let mut state = self.state.write().await;
        let dirty = std::mem::take(&mut state.dirty);
        DirtySnapshot {
            nodes: dirty
                .nodes
                .iter()
                .filter_map(|id| state.nodes.get(id))
                .cloned()
                .collect(),
            vms: dirty
                .vms
                .iter()
                .filter_map(|id| state.vms.get(id))
                .cloned()
                .collect(),
            users: dirty
                .users
                .iter()
                .filter_map(|id| state.users.get(id))
                .cloned()
                .collect(),
            commands: dirty
                .commands
                .iter()
                .filter_map(|id| state.commands.get(id))
                .cloned()
                .collect(),
            deleted: dirty.deleted,
        }
    }

    /// Re-mark an entity after a failed flush so the next cycle retries.
    pub async fn mark_dirty(&self, kind: EntityKind, id: &str) {
        let mut state = self.state.write().await;
        match kind {
            EntityKind::Node => state.dirty.nodes.insert(id.to_string()),
            EntityKind::Vm => state.dirty.vms.insert(id.to_string()),
            EntityKind::User => state.dirty.users.insert(id.to_string()),
            EntityKind::Command => state.dirty.commands.insert(id.to_string()),
        };
    }

    /// Restore state from the document store at startup. Indexes are
    /// rebuilt; nothing is marked dirty.
    pub async fn hydrate_from(&self, docs: &dyn DocumentStore) -> Result<usize> {
        let mut restored = 0;
        let mut state = self.state.write().await;
        for (id, doc) in docs.load_collection(collections::NODES).await? {
            match serde_json::from_value::<Node>(doc) {
                Ok(node) => {
                    state.nodes.insert(id, node);
                    restored += 1;
                }
                Err(e) => tracing::warn!(id, error = %e, "Skipping unreadable node document"),
            }
        }
        for (id, doc) in docs.load_collection(collections::VMS).await? {
            match serde_json::from_value::<VirtualMachine>(doc) {
                Ok(vm) => {
                    state.index_vm(&vm, None);
                    state.vms.insert(id, vm);
                    restored += 1;
                }
                Err(e) => tracing::warn!(id, error = %e, "Skipping unreadable vm document"),
            }
        }
        for (id, doc) in docs.load_collection(collections::USERS).await? {
            match serde_json::from_value::<UserData>(doc) {
                Ok(user) => {
                    state.users.insert(id, user);
                    restored += 1;
                }
                Err(e) => tracing::warn!(id, error = %e, "Skipping unreadable user document"),
            }
        }
        for (id, doc) in docs.load_collection(collections::COMMANDS).await? {
            match serde_json::from_value::<CommandRegistration>(doc) {
                Ok(registration) => {
                    state.commands.insert(id, registration);
                    restored += 1;
                }
                Err(e) => tracing::warn!(id, error = %e, "Skipping unreadable command document"),
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HardwareInventory, NetworkConfig, Reputation, VmSpec};
    use crate::model::{AccessInfo, BillingInfo};

    fn make_node(id: &str, points: f64, memory: u64, storage: u64) -> Node {
        Node {
            id: id.to_string(),
            machine_id: format!("machine-{}", id),
            wallet_address: "0x0000000000000000000000000000000000000001".to_string(),
            public_ip: "198.51.100.10".to_string(),
            agent_port: 7001,
            agent_version: "0.1.0".to_string(),
            architecture: "x86_64".to_string(),
            total: ResourceCapacity::new(points, memory, storage),
            reserved: ResourceCapacity::default(),
            hardware: HardwareInventory::default(),
            supported_images: vec![],
            region: None,
            zone: None,
            pricing: None,
            status: NodeStatus::Online,
            metrics: None,
            reputation: Reputation::default(),
            evaluation: None,
            scheduling_config_version: String::new(),
            obligations: vec![],
            dht_info: None,
            relay_info: None,
            cgnat_info: None,
            api_key_hash: String::new(),
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn make_vm(id: &str, owner: &str) -> VirtualMachine {
        VirtualMachine {
            id: id.to_string(),
            name: format!("vm-{}", id),
            owner_id: owner.to_string(),
            owner_wallet: None,
            vm_type: Default::default(),
            spec: VmSpec::default(),
            status: VmStatus::Pending,
            status_message: None,
            power_state: Default::default(),
            node_id: None,
            reserved_cost: None,
            gpu_pci_address: None,
            network: NetworkConfig::default(),
            access: AccessInfo::default(),
            active_command: None,
            billing: BillingInfo::default(),
            services: vec![],
            labels: HashMap::new(),
            secure_password: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_try_complete_command_at_most_once() {
        let store = DataStore::new();
        store
            .register_command("cmd-1", "vm-1", "node-1", CommandType::CreateVm)
            .await;

        let first = store.try_complete_command("cmd-1").await;
        assert!(first.is_some());
        assert_eq!(first.unwrap().vm_id, "vm-1");

        let second = store.try_complete_command("cmd-1").await;
        assert!(second.is_none());
        assert!(store.was_command_completed("cmd-1").await);
    }

    #[tokio::test]
    async fn test_drain_is_all_or_nothing() {
        let store = DataStore::new();
        for i in 0..3 {
            store
                .append_pending_command(
                    "node-1",
                    NodeCommand::new(CommandType::StopVm, &format!("vm-{}", i), serde_json::json!({})),
                )
                .await;
        }
        let drained = store.drain_pending_commands("node-1").await;
        assert_eq!(drained.len(), 3);
        assert!(store.drain_pending_commands("node-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_assign_and_release_accounting() {
        let store = DataStore::new();
        store
            .save_node(make_node("node-1", 32.0, 32 << 30, 1 << 40))
            .await;
        store.save_vm(make_vm("vm-1", "user-1")).await;

        let cost = ResourceCapacity::new(6.0, 8 << 30, 100 << 30);
        let (node, vm) = store.assign_vm_to_node("vm-1", "node-1", cost).await.unwrap();
        assert_eq!(node.reserved.compute_points, 6.0);
        assert_eq!(vm.node_id.as_deref(), Some("node-1"));
        assert_eq!(vm.reserved_cost, Some(cost));

        let released = store.release_vm_resources("vm-1").await.unwrap();
        assert_eq!(released, Some(cost));
        let node = store.get_node("node-1").await.unwrap();
        assert!(node.reserved.is_zero());

        // Second release is a no-op
        assert_eq!(store.release_vm_resources("vm-1").await.unwrap(), None);
        let node = store.get_node("node-1").await.unwrap();
        assert!(node.reserved.is_zero());
    }

    #[tokio::test]
    async fn test_assign_rejects_over_capacity() {
        let store = DataStore::new();
        store.save_node(make_node("node-1", 4.0, 4 << 30, 100 << 30)).await;
        store.save_vm(make_vm("vm-1", "user-1")).await;

        let cost = ResourceCapacity::new(6.0, 1 << 30, 1 << 30);
        let result = store.assign_vm_to_node("vm-1", "node-1", cost).await;
        assert!(matches!(result, Err(StoreError::Capacity(_))));
        let vm = store.get_vm("vm-1").await.unwrap();
        assert!(vm.node_id.is_none());
    }

    #[tokio::test]
    async fn test_name_uniqueness_excludes_deleted() {
        let store = DataStore::new();
        let mut vm = make_vm("vm-1", "user-1");
        vm.name = "web".to_string();
        store.save_vm(vm).await;

        assert!(store.owner_has_active_vm_named("user-1", "web").await);
        assert!(store.any_active_vm_named("web").await);

        store
            .update_vm("vm-1", |vm| vm.status = VmStatus::Deleted)
            .await
            .unwrap();
        assert!(!store.owner_has_active_vm_named("user-1", "web").await);
        assert!(!store.any_active_vm_named("web").await);
    }

    #[tokio::test]
    async fn test_vms_by_node_index_follows_assignment() {
        let store = DataStore::new();
        store.save_node(make_node("node-1", 32.0, 32 << 30, 1 << 40)).await;
        store.save_vm(make_vm("vm-1", "user-1")).await;
        assert!(store.get_vms_by_node("node-1").await.is_empty());

        store
            .assign_vm_to_node("vm-1", "node-1", ResourceCapacity::new(1.0, 1, 1))
            .await
            .unwrap();
        assert_eq!(store.get_vms_by_node("node-1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_take_dirty_then_clean() {
        let store = DataStore::new();
        store.save_node(make_node("node-1", 1.0, 1, 1)).await;
        store.save_vm(make_vm("vm-1", "user-1")).await;

        let snapshot = store.take_dirty().await;
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.vms.len(), 1);

        let snapshot = store.take_dirty().await;
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_hydrate_rebuilds_indexes() {
        use crate::store::document::{DocumentStore, MemoryDocumentStore};

        let docs = MemoryDocumentStore::new();
        let mut vm = make_vm("vm-1", "user-1");
        vm.node_id = Some("node-1".to_string());
        docs.upsert(
            collections::VMS,
            "vm-1",
            serde_json::to_value(&vm).unwrap(),
        )
        .await
        .unwrap();

        let store = DataStore::new();
        let restored = store.hydrate_from(&docs).await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(store.get_vms_by_node("node-1").await.len(), 1);
        assert_eq!(store.get_vms_by_user("user-1").await.len(), 1);
    }
}
