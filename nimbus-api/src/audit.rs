use nimbus_log::{AuditLogger, LogLevel};
use std::sync::Arc;

/// Control-plane audit logger
pub struct ApiAuditLogger {
    inner: Arc<AuditLogger>,
}

impl ApiAuditLogger {
    pub fn new(log_endpoint: &str) -> Self {
        Self {
            inner: Arc::new(AuditLogger::new(log_endpoint, "api")),
        }
    }

    pub fn new_noop() -> Self {
        Self {
            inner: Arc::new(AuditLogger::new_noop()),
        }
    }

    fn log_async(&self, level: LogLevel, message: String, object_ids: Vec<String>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.log(level, message, object_ids).await;
        });
    }

    // Node events
    pub fn node_registered(&self, node_id: &str, wallet: &str) {
        self.log_async(
            LogLevel::Audit,
            format!("Node registered: {} (wallet {})", node_id, wallet),
            vec![node_id.to_string()],
        );
    }

    pub fn node_rejected(&self, machine_id: &str, reason: &str) {
        self.log_async(
            LogLevel::Notice,
            format!("Node registration rejected for {}: {}", machine_id, reason),
            vec![machine_id.to_string()],
        );
    }

    pub fn node_online(&self, node_id: &str) {
        self.log_async(
            LogLevel::Info,
            format!("Node back online: {}", node_id),
            vec![node_id.to_string()],
        );
    }

    pub fn node_offline(&self, node_id: &str) {
        self.log_async(
            LogLevel::Warn,
            format!("Node missed heartbeats, marked offline: {}", node_id),
            vec![node_id.to_string()],
        );
    }

    pub fn resource_drift(&self, node_id: &str, detail: &str) {
        self.log_async(
            LogLevel::Notice,
            format!("Resource drift on node {}: {}", node_id, detail),
            vec![node_id.to_string()],
        );
    }

    // VM events
    pub fn vm_created(&self, vm_id: &str, vm_name: &str) {
        self.log_async(
            LogLevel::Audit,
            format!("VM created: {} ({})", vm_name, vm_id),
            vec![vm_id.to_string()],
        );
    }

    pub fn vm_scheduled(&self, vm_id: &str, node_id: &str) {
        self.log_async(
            LogLevel::Audit,
            format!("VM {} scheduled onto node {}", vm_id, node_id),
            vec![vm_id.to_string(), node_id.to_string()],
        );
    }

    pub fn vm_status_changed(&self, vm_id: &str, old: &str, new: &str) {
        self.log_async(
            LogLevel::Info,
            format!("VM {} transitioned {} -> {}", vm_id, old, new),
            vec![vm_id.to_string()],
        );
    }

    pub fn vm_recovered(&self, vm_id: &str, node_id: &str) {
        self.log_async(
            LogLevel::Audit,
            format!("Orphan VM {} recovered from node {}", vm_id, node_id),
            vec![vm_id.to_string(), node_id.to_string()],
        );
    }

    pub fn vm_deleted(&self, vm_id: &str) {
        self.log_async(
            LogLevel::Audit,
            format!("VM deleted: {}", vm_id),
            vec![vm_id.to_string()],
        );
    }

    // Command events
    pub fn ack_resolved(&self, command_id: &str, vm_id: &str, lookup: &str) {
        self.log_async(
            LogLevel::Info,
            format!(
                "Ack for command {} resolved to VM {} (lookup={})",
                command_id, vm_id, lookup
            ),
            vec![command_id.to_string(), vm_id.to_string()],
        );
    }

    pub fn orphaned_command(&self, command_id: &str, node_id: &str) {
        self.log_async(
            LogLevel::Critical,
            format!(
                "Orphaned command {}: no VM resolvable on node {}",
                command_id, node_id
            ),
            vec![command_id.to_string(), node_id.to_string()],
        );
    }

    pub fn stale_command_swept(&self, command_id: &str, vm_id: &str) {
        self.log_async(
            LogLevel::Warn,
            format!(
                "Swept stale command {} (VM {}) without an ack",
                command_id, vm_id
            ),
            vec![command_id.to_string(), vm_id.to_string()],
        );
    }

    // Relay events
    pub fn relay_assigned(&self, node_id: &str, relay_node_id: &str, tunnel_ip: &str) {
        self.log_async(
            LogLevel::Audit,
            format!(
                "CGNAT node {} assigned to relay {} ({})",
                node_id, relay_node_id, tunnel_ip
            ),
            vec![node_id.to_string(), relay_node_id.to_string()],
        );
    }

    pub fn relay_peering_failed(&self, relay_a: &str, relay_b: &str, error: &str) {
        self.log_async(
            LogLevel::Warn,
            format!("Cross-peering {} <-> {} failed: {}", relay_a, relay_b, error),
            vec![relay_a.to_string(), relay_b.to_string()],
        );
    }

    // Port events
    pub fn port_allocated(&self, vm_id: &str, vm_port: u16, public_port: u16) {
        self.log_async(
            LogLevel::Audit,
            format!(
                "Port allocated for VM {}: {} -> public {}",
                vm_id, vm_port, public_port
            ),
            vec![vm_id.to_string()],
        );
    }

    pub fn port_released(&self, vm_id: &str, vm_port: u16) {
        self.log_async(
            LogLevel::Audit,
            format!("Port released for VM {}: {}", vm_id, vm_port),
            vec![vm_id.to_string()],
        );
    }
}

pub fn create_audit_logger(log_endpoint: &str) -> Arc<ApiAuditLogger> {
    Arc::new(ApiAuditLogger::new(log_endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_logger_doesnt_panic() {
        let logger = ApiAuditLogger::new_noop();

        logger.node_registered("node-1", "0xabc");
        logger.node_offline("node-1");
        logger.vm_created("vm-1", "web");
        logger.ack_resolved("cmd-1", "vm-1", "registry");
        logger.orphaned_command("cmd-2", "node-1");
        logger.relay_assigned("node-2", "node-3", "10.200.1.5");
        logger.port_allocated("vm-1", 22, 30022);
    }
}
