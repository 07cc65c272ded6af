//! Audit logging to the nimbus log service
//!
//! Shared audit logger for all nimbus components. Non-blocking and
//! fault-tolerant - if the log service is unavailable, events are logged
//! locally via tracing and discarded.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::{LogEntry, LogLevel};

/// Audit logger client for the nimbus log service
pub struct AuditLogger {
    client: reqwest::Client,
    log_endpoint: String,
    component: String,
}

impl AuditLogger {
    /// Create a new audit logger for a specific component
    pub fn new(log_endpoint: &str, component: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            log_endpoint: log_endpoint.trim_end_matches('/').to_string(),
            component: component.to_string(),
        }
    }

    /// Create a noop audit logger (for testing)
    /// Uses an empty endpoint so shipping is skipped entirely
    pub fn new_noop() -> Self {
        Self {
            client: reqwest::Client::new(),
            log_endpoint: String::new(),
            component: String::new(),
        }
    }

    /// Log an audit event
    ///
    /// Events are always logged locally via tracing, and sent to the log
    /// service if one is configured.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>, object_ids: Vec<String>) {
        let message = message.into();

        // Always log locally via tracing
        match level {
            LogLevel::Emergency | LogLevel::Alert | LogLevel::Critical | LogLevel::Error => {
                tracing::error!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            LogLevel::Warn => {
                tracing::warn!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            LogLevel::Notice | LogLevel::Audit | LogLevel::Info => {
                tracing::info!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            LogLevel::Debug => {
                tracing::debug!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
        }

        if self.log_endpoint.is_empty() {
            return;
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            message,
            level,
            component: self.component.clone(),
            related_object_ids: object_ids,
        };

        let url = format!("{}/api/v1/logs", self.log_endpoint);
        if let Err(e) = self.client.post(&url).json(&entry).send().await {
            debug!(error = %e, "Failed to ship audit log entry (continuing)");
        }
    }
}

/// Create a shared audit logger
pub fn create_audit_logger(log_endpoint: &str, component: &str) -> Arc<AuditLogger> {
    Arc::new(AuditLogger::new(log_endpoint, component))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_logger_doesnt_panic() {
        let logger = AuditLogger::new_noop();
        logger
            .log(LogLevel::Audit, "VM created", vec!["vm-1".to_string()])
            .await;
        logger.log(LogLevel::Error, "boom", vec![]).await;
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_silently() {
        let logger = AuditLogger::new("http://127.0.0.1:1", "test");
        logger.log(LogLevel::Info, "unreachable", vec![]).await;
    }
}
