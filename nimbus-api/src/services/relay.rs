//! Relay-network coordination for NAT-traversed nodes.
//!
//! CGNAT nodes are unreachable from the control plane; each is attached
//! to a relay node that forwards traffic through a WireGuard tunnel.
//! Assignment state is bidirectional: the orchestrator tracks it in
//! `CgnatInfo` and the node reports what it actually has. Heartbeat
//! reconciliation resolves the four disagreement cases. Per-node
//! semaphores with a non-blocking try-acquire keep concurrent heartbeats
//! from reconciling the same node twice.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::audit::ApiAuditLogger;
use crate::error::{OrchestratorError, Result};
use crate::model::{CgnatInfo, Node, RelayInfo, RelayStatus, VmStatus};
use crate::store::{DataStore, Event};

// =============================================================================
// Relay management endpoint (runs on the relay VM)
// =============================================================================

#[async_trait]
pub trait RelayManagementApi: Send + Sync {
    /// Register a CGNAT peer on a relay (idempotent on the relay side).
    async fn register_cgnat_peer(
        &self,
        relay_endpoint: &str,
        node_id: &str,
        tunnel_ip: &str,
    ) -> Result<()>;

    /// Peer two relays with each other.
    async fn add_relay_peer(
        &self,
        relay_endpoint: &str,
        peer_endpoint: &str,
        peer_public_key: &str,
    ) -> Result<()>;
}

/// JSON/HTTP client for the relay VM's management endpoint.
pub struct HttpRelayManagement {
    client: reqwest::Client,
}

impl HttpRelayManagement {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpRelayManagement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayManagementApi for HttpRelayManagement {
    async fn register_cgnat_peer(
        &self,
        relay_endpoint: &str,
        node_id: &str,
        tunnel_ip: &str,
    ) -> Result<()> {
        let url = format!("http://{}/api/v1/peers", relay_endpoint);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "nodeId": node_id, "tunnelIp": tunnel_ip }))
            .send()
            .await
            .map_err(|e| OrchestratorError::External(format!("relay {}: {}", relay_endpoint, e)))?;
        if !response.status().is_success() {
            return Err(OrchestratorError::External(format!(
                "relay {} returned {}",
                relay_endpoint,
                response.status()
            )));
        }
        Ok(())
    }

    async fn add_relay_peer(
        &self,
        relay_endpoint: &str,
        peer_endpoint: &str,
        peer_public_key: &str,
    ) -> Result<()> {
        let url = format!("http://{}/api/v1/relay-peers", relay_endpoint);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "endpoint": peer_endpoint,
                "publicKey": peer_public_key,
            }))
            .send()
            .await
            .map_err(|e| OrchestratorError::External(format!("relay {}: {}", relay_endpoint, e)))?;
        if !response.status().is_success() {
            return Err(OrchestratorError::External(format!(
                "relay {} returned {}",
                relay_endpoint,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Management client that does nothing; for tests and dev mode.
pub struct NoopRelayManagement;

#[async_trait]
impl RelayManagementApi for NoopRelayManagement {
    async fn register_cgnat_peer(&self, _: &str, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    async fn add_relay_peer(&self, _: &str, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct RelayCoordinator {
    store: Arc<DataStore>,
    management: Arc<dyn RelayManagementApi>,
    audit: Arc<ApiAuditLogger>,
    /// One permit per CGNAT node; try-acquire, never wait.
    locks: DashMap<String, Arc<Semaphore>>,
}

impl RelayCoordinator {
    pub fn new(
        store: Arc<DataStore>,
        management: Arc<dyn RelayManagementApi>,
        audit: Arc<ApiAuditLogger>,
    ) -> Self {
        Self {
            store,
            management,
            audit,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, node_id: &str) -> Arc<Semaphore> {
        self.locks
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// A relay is usable when its node is online, its relay VM runs, and
    /// its status is Active or Degraded.
    async fn usable_relay(&self, relay_node_id: &str) -> Option<(Node, RelayInfo)> {
        let node = self.store.get_node(relay_node_id).await?;
        if !node.is_online() {
            return None;
        }
        let relay = node.relay_info.clone()?;
        if relay.status == RelayStatus::Offline {
            return None;
        }
        let relay_vm = self.store.get_vm(&relay.relay_vm_id).await?;
        if relay_vm.status != VmStatus::Running {
            return None;
        }
        Some((node, relay))
    }

    /// Pick the best relay for a new attachment: usable, has free tunnel
    /// slots, most slots first, node id as the tie-break.
    async fn find_best_relay(&self) -> Option<(Node, RelayInfo)> {
        let mut best: Option<(Node, RelayInfo)> = None;
        for node in self.store.get_active_nodes().await {
            if node.relay_info.is_none() {
                continue;
            }
            let Some((node, relay)) = self.usable_relay(&node.id).await else {
                continue;
            };
            if relay.available_slots() == 0 {
                continue;
            }
            let better = match &best {
                None => true,
                Some((current_node, current)) => {
                    relay.available_slots() > current.available_slots()
                        || (relay.available_slots() == current.available_slots()
                            && node.id < current_node.id)
                }
            };
            if better {
                best = Some((node, relay));
            }
        }
        best
    }

    /// Lowest free host address in the relay's /24, skipping the gateway.
    async fn allocate_tunnel_ip(&self, relay_node_id: &str, relay: &RelayInfo) -> Result<String> {
        let mut used: Vec<u8> = Vec::new();
        for node in self.store.get_all_nodes().await {
            if let Some(cgnat) = &node.cgnat_info {
                if cgnat.assigned_relay_node_id == relay_node_id {
                    if let Some(host) = cgnat.tunnel_ip.rsplit('.').next() {
                        if let Ok(host) = host.parse::<u8>() {
                            used.push(host);
                        }
                    }
                }
            }
        }
        for host in 2u8..=254 {
            if !used.contains(&host) {
                return Ok(format!("10.200.{}.{}", relay.relay_subnet, host));
            }
        }
        Err(OrchestratorError::Capacity(format!(
            "relay {} subnet is full",
            relay_node_id
        )))
    }

    /// Assign a CGNAT node to the best available relay.
    pub async fn assign_relay(&self, cgnat_node_id: &str) -> Result<Option<CgnatInfo>> {
        let Some((relay_node, relay)) = self.find_best_relay().await else {
            debug!(node_id = cgnat_node_id, "No usable relay available yet");
            return Ok(None);
        };
        let tunnel_ip = self.allocate_tunnel_ip(&relay_node.id, &relay).await?;
        let assignment = CgnatInfo {
            assigned_relay_node_id: relay_node.id.clone(),
            tunnel_ip: tunnel_ip.clone(),
        };

        self.store
            .update_node(cgnat_node_id, |node| {
                node.cgnat_info = Some(assignment.clone());
            })
            .await?;
        self.store
            .update_node(&relay_node.id, |node| {
                if let Some(relay) = node.relay_info.as_mut() {
                    if !relay.connected_node_ids.iter().any(|id| id == cgnat_node_id) {
                        relay.connected_node_ids.push(cgnat_node_id.to_string());
                    }
                }
            })
            .await?;

        if let Err(e) = self
            .management
            .register_cgnat_peer(&relay.wireguard_endpoint, cgnat_node_id, &tunnel_ip)
            .await
        {
            // The peer registration retries on the next reconciliation
            warn!(node_id = cgnat_node_id, error = %e, "Peer registration on relay failed");
        }

        self.store.emit(Event::RelayAssigned {
            node_id: cgnat_node_id.to_string(),
            relay_node_id: relay_node.id.clone(),
            tunnel_ip: tunnel_ip.clone(),
        });
        self.audit
            .relay_assigned(cgnat_node_id, &relay_node.id, &tunnel_ip);
        info!(node_id = cgnat_node_id, relay = %relay_node.id, %tunnel_ip, "Relay assigned");
        Ok(Some(assignment))
    }

    /// Reconcile tracked vs node-reported relay assignment on heartbeat.
    ///
    /// Concurrent reconciliations for the same node skip cleanly via
    /// try-acquire. Idempotent when both sides already agree and the
    /// relay is valid.
    pub async fn reconcile(
        &self,
        cgnat_node_id: &str,
        reported: Option<CgnatInfo>,
    ) -> Result<Option<CgnatInfo>> {
        let lock = self.lock_for(cgnat_node_id);
        let Ok(_permit) = lock.try_acquire() else {
            debug!(node_id = cgnat_node_id, "Reconciliation already in flight, skipping");
            return Ok(None);
        };

        let node = self
            .store
            .get_node(cgnat_node_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("node {}", cgnat_node_id)))?;
        let tracked = node.cgnat_info.clone();

        match (tracked, reported) {
            (None, None) => self.assign_relay(cgnat_node_id).await,

            (Some(tracked), None) => {
                if let Some((_, relay)) = self.usable_relay(&tracked.assigned_relay_node_id).await {
                    // Keep; make sure the peer exists on the relay side
                    if let Err(e) = self
                        .management
                        .register_cgnat_peer(
                            &relay.wireguard_endpoint,
                            cgnat_node_id,
                            &tracked.tunnel_ip,
                        )
                        .await
                    {
                        warn!(node_id = cgnat_node_id, error = %e, "Re-registering peer failed");
                    }
                    Ok(Some(tracked))
                } else {
                    self.detach(cgnat_node_id, &tracked).await?;
                    self.assign_relay(cgnat_node_id).await
                }
            }

            (None, Some(reported)) => {
                if self.reported_is_authentic(cgnat_node_id, &reported).await {
                    self.adopt(cgnat_node_id, reported).await
                } else {
                    self.assign_relay(cgnat_node_id).await
                }
            }

            (Some(tracked), Some(reported)) => {
                if tracked == reported {
                    if self
                        .usable_relay(&tracked.assigned_relay_node_id)
                        .await
                        .is_some()
                    {
                        return Ok(Some(tracked));
                    }
                    self.detach(cgnat_node_id, &tracked).await?;
                    return self.assign_relay(cgnat_node_id).await;
                }
                // Disagreement: drop the tracked attachment, prefer what
                // the node actually has if it checks out
                self.detach(cgnat_node_id, &tracked).await?;
                if self.reported_is_authentic(cgnat_node_id, &reported).await {
                    self.adopt(cgnat_node_id, reported).await
                } else {
                    self.assign_relay(cgnat_node_id).await
                }
            }
        }
    }

    /// A reported assignment is adopted only when the relay is usable AND
    /// already lists this node among its connected peers. Guards against
    /// forged reports.
    async fn reported_is_authentic(&self, cgnat_node_id: &str, reported: &CgnatInfo) -> bool {
        match self.usable_relay(&reported.assigned_relay_node_id).await {
            Some((_, relay)) => relay
                .connected_node_ids
                .iter()
                .any(|id| id == cgnat_node_id),
            None => false,
        }
    }

    async fn adopt(&self, cgnat_node_id: &str, assignment: CgnatInfo) -> Result<Option<CgnatInfo>> {
        self.store
            .update_node(cgnat_node_id, |node| {
                node.cgnat_info = Some(assignment.clone());
            })
            .await?;
        info!(
            node_id = cgnat_node_id,
            relay = %assignment.assigned_relay_node_id,
            "Adopted node-reported relay assignment"
        );
        Ok(Some(assignment))
    }

    /// Remove the node from its tracked relay's peer list and clear the
    /// assignment.
    async fn detach(&self, cgnat_node_id: &str, tracked: &CgnatInfo) -> Result<()> {
        let relay_node_id = tracked.assigned_relay_node_id.clone();
        if self.store.get_node(&relay_node_id).await.is_some() {
            self.store
                .update_node(&relay_node_id, |node| {
                    if let Some(relay) = node.relay_info.as_mut() {
                        relay.connected_node_ids.retain(|id| id != cgnat_node_id);
                    }
                })
                .await?;
        }
        self.store
            .update_node(cgnat_node_id, |node| {
                node.cgnat_info = None;
            })
            .await?;
        Ok(())
    }

    // =========================================================================
    // Relay lifecycle
    // =========================================================================

    /// Promote a node to relay once its relay VM is running. Allocates a
    /// unique tunnel subnet and cross-peers with every existing relay.
    pub async fn register_relay(
        &self,
        node_id: &str,
        relay_vm_id: &str,
        wireguard_public_key: &str,
        wireguard_endpoint: &str,
    ) -> Result<RelayInfo> {
        let used: Vec<u8> = self
            .store
            .get_all_nodes()
            .await
            .iter()
            .filter_map(|n| n.relay_info.as_ref().map(|r| r.relay_subnet))
            .collect();
        let subnet = (1u8..=254)
            .find(|s| !used.contains(s))
            .ok_or_else(|| OrchestratorError::Capacity("no free relay subnet".to_string()))?;

        let relay = RelayInfo {
            relay_vm_id: relay_vm_id.to_string(),
            relay_subnet: subnet,
            wireguard_public_key: wireguard_public_key.to_string(),
            wireguard_endpoint: wireguard_endpoint.to_string(),
            connected_node_ids: Vec::new(),
            status: RelayStatus::Active,
        };
        self.store
            .update_node(node_id, |node| {
                node.relay_info = Some(relay.clone());
            })
            .await?;
        info!(node_id, subnet, "Relay registered");

        self.cross_peer(node_id, &relay).await;
        Ok(relay)
    }

    /// Peer the new relay with every existing Active relay, both ways.
    /// Partial failures are logged; the next reconciliation retries.
    async fn cross_peer(&self, new_relay_node_id: &str, new_relay: &RelayInfo) {
        for node in self.store.get_all_nodes().await {
            if node.id == new_relay_node_id {
                continue;
            }
            let Some(existing) = &node.relay_info else {
                continue;
            };
            if existing.status != RelayStatus::Active {
                continue;
            }
            if let Err(e) = self
                .management
                .add_relay_peer(
                    &existing.wireguard_endpoint,
                    &new_relay.wireguard_endpoint,
                    &new_relay.wireguard_public_key,
                )
                .await
            {
                self.audit
                    .relay_peering_failed(&node.id, new_relay_node_id, &e.to_string());
            }
            if let Err(e) = self
                .management
                .add_relay_peer(
                    &new_relay.wireguard_endpoint,
                    &existing.wireguard_endpoint,
                    &existing.wireguard_public_key,
                )
                .await
            {
                self.audit
                    .relay_peering_failed(new_relay_node_id, &node.id, &e.to_string());
            }
        }
    }
}
