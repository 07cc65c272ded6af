//! Background loops: health watchdog, stale-command sweeper, system-VM
//! obligation reconciler, pending-VM rescheduler.
//!
//! Every loop runs on its own interval and stops on the shared shutdown
//! signal, the same pattern the REST server uses.

use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::ApiAuditLogger;
use crate::config::OrchestratorConfig;
use crate::model::{ObligationStatus, QualityTier, SystemVmRole, VmStatus};
use crate::services::node::NodeService;
use crate::services::relay::RelayCoordinator;
use crate::services::vm::{CreateVmParams, VmService};
use crate::store::{DataStore, Event};

fn wireguard_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"wgKey=([A-Za-z0-9+/=]{40,})").expect("valid pattern"))
}

/// Mark silent nodes offline on a fixed cadence.
pub fn spawn_health_watchdog(
    node_service: Arc<NodeService>,
    config: Arc<OrchestratorConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.watchdog.check_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let marked = node_service.check_node_health(Utc::now()).await;
                    if marked > 0 {
                        info!(marked, "Health watchdog marked nodes offline");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

/// Sweep command registrations that never received an ack. Sweeping does
/// not synthesize an ack; stuck VMs surface through the orphaned-command
/// events.
pub fn spawn_command_sweeper(
    store: Arc<DataStore>,
    audit: Arc<ApiAuditLogger>,
    config: Arc<OrchestratorConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.watchdog.sweep_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cutoff = Utc::now()
                        - chrono::Duration::seconds(config.watchdog.stale_command_secs as i64);
                    for registration in store.stale_commands(cutoff).await {
                        if store.try_complete_command(&registration.command_id).await.is_some() {
                            warn!(
                                command_id = %registration.command_id,
                                vm_id = %registration.vm_id,
                                "Swept stale command registration"
                            );
                            store.emit(Event::CommandOrphaned {
                                node_id: registration.node_id.clone(),
                                command_id: registration.command_id.clone(),
                            });
                            audit.stale_command_swept(&registration.command_id, &registration.vm_id);
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

/// Retry scheduling for VMs parked in Pending, for example after new
/// capacity registers.
pub fn spawn_pending_rescheduler(
    vm_service: Arc<VmService>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let scheduled = vm_service.reschedule_pending().await;
                    if scheduled > 0 {
                        info!(scheduled, "Rescheduled pending VMs");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

// =============================================================================
// Obligation reconciler
// =============================================================================

/// Drives each node's system-VM obligations: Pending obligations get a
/// system VM created, Deploying ones are checked against the VM's actual
/// state and flipped to Ready or Failed.
pub struct ObligationReconciler {
    store: Arc<DataStore>,
    vm_service: Arc<VmService>,
    relay: Arc<RelayCoordinator>,
}

impl ObligationReconciler {
    pub fn new(
        store: Arc<DataStore>,
        vm_service: Arc<VmService>,
        relay: Arc<RelayCoordinator>,
    ) -> Self {
        Self {
            store,
            vm_service,
            relay,
        }
    }

    pub async fn tick(&self) {
        for node in self.store.get_active_nodes().await {
            for obligation in node.obligations.clone() {
                let result = match obligation.status {
                    ObligationStatus::Pending => self.deploy(&node.id, obligation.role).await,
                    ObligationStatus::Deploying => {
                        self.check_deployment(&node.id, obligation.role, obligation.vm_id.as_deref())
                            .await
                    }
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    debug!(node_id = %node.id, role = obligation.role.as_str(), error = %e, "Obligation step deferred");
                }
            }
        }
    }

    async fn deploy(&self, node_id: &str, role: SystemVmRole) -> crate::error::Result<()> {
        let short = &node_id[..node_id.len().min(8)];
        let (cpu, memory_gb, disk_gb) = match role {
            SystemVmRole::Dht => (1, 1, 10),
            SystemVmRole::Relay => (2, 2, 10),
            SystemVmRole::BlockStore => (2, 4, 200),
            SystemVmRole::Ingress => (2, 2, 10),
        };
        let mut labels = std::collections::HashMap::new();
        labels.insert("system-role".to_string(), role.as_str().to_string());

        let result = self
            .vm_service
            .create(CreateVmParams {
                name: format!("sys-{}-{}", role.as_str(), short),
                owner_id: "system".to_string(),
                cpu_cores: cpu,
                memory_bytes: memory_gb << 30,
                disk_bytes: disk_gb << 30,
                image_id: "ubuntu-24.04".to_string(),
                tier: QualityTier::Burstable,
                labels,
                target_node_id: Some(node_id.to_string()),
                ..Default::default()
            })
            .await?;

        let vm_id = result.vm.id.clone();
        self.store
            .update_node(node_id, |node| {
                if let Some(obligation) = node.obligation_mut(role) {
                    obligation.status = ObligationStatus::Deploying;
                    obligation.vm_id = Some(vm_id.clone());
                }
            })
            .await?;
        info!(node_id, role = role.as_str(), vm_id = %result.vm.id, "System VM deploying");
        Ok(())
    }

    async fn check_deployment(
        &self,
        node_id: &str,
        role: SystemVmRole,
        vm_id: Option<&str>,
    ) -> crate::error::Result<()> {
        let Some(vm_id) = vm_id else {
            // Lost the VM reference; start over
            self.store
                .update_node(node_id, |node| {
                    if let Some(obligation) = node.obligation_mut(role) {
                        obligation.status = ObligationStatus::Pending;
                    }
                })
                .await?;
            return Ok(());
        };
        let Some(vm) = self.store.get_vm(vm_id).await else {
            self.store
                .update_node(node_id, |node| {
                    if let Some(obligation) = node.obligation_mut(role) {
                        obligation.status = ObligationStatus::Pending;
                        obligation.vm_id = None;
                    }
                })
                .await?;
            return Ok(());
        };

        match vm.status {
            VmStatus::Pending => {
                // Target node had no room earlier; try again
                if vm.node_id.is_none() {
                    let _ = self
                        .vm_service
                        .schedule_vm(vm_id, None, Some(node_id))
                        .await;
                }
            }
            VmStatus::Running => {
                if role == SystemVmRole::Relay {
                    let node = self.store.get_node(node_id).await;
                    if node.as_ref().is_some_and(|n| n.relay_info.is_none()) {
                        // The relay VM advertises its WireGuard key in its
                        // status message once the tunnel is up
                        let Some(key) = vm
                            .status_message
                            .as_deref()
                            .and_then(|m| wireguard_key_pattern().captures(m))
                            .and_then(|c| c.get(1))
                            .map(|m| m.as_str().to_string())
                        else {
                            return Ok(());
                        };
                        let endpoint = node
                            .map(|n| format!("{}:51820", n.public_ip))
                            .unwrap_or_default();
                        self.relay
                            .register_relay(node_id, vm_id, &key, &endpoint)
                            .await?;
                    }
                }
                self.store
                    .update_node(node_id, |node| {
                        if let Some(obligation) = node.obligation_mut(role) {
                            obligation.status = ObligationStatus::Ready;
                        }
                    })
                    .await?;
                info!(node_id, role = role.as_str(), "System VM obligation ready");
            }
            VmStatus::Error => {
                self.store
                    .update_node(node_id, |node| {
                        if let Some(obligation) = node.obligation_mut(role) {
                            obligation.status = ObligationStatus::Failed;
                        }
                    })
                    .await?;
                warn!(node_id, role = role.as_str(), "System VM obligation failed");
            }
            _ => {}
        }
        Ok(())
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    _ = shutdown.changed() => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wireguard_key_extraction() {
        let message = "relay up wgKey=mBd4W1Yjr8lPoq3Zxv2N5cT7uK9sAeFhGiJkLmNoPqR= peers=0";
        let captures = wireguard_key_pattern().captures(message).unwrap();
        assert_eq!(&captures[1], "mBd4W1Yjr8lPoq3Zxv2N5cT7uK9sAeFhGiJkLmNoPqR=");
        assert!(wireguard_key_pattern().captures("wgKey=short").is_none());
    }
}
