//! nimbus-log client library
//!
//! Shared AuditLogger for nimbus components. Events are mirrored to the
//! local `tracing` subscriber and shipped to the central log service as
//! JSON over HTTP when one is configured.
//!
//! # Example
//! ```ignore
//! use nimbus_log::{AuditLogger, LogLevel, create_audit_logger};
//!
//! let audit = create_audit_logger("http://[::1]:7090", "api");
//! audit.log(LogLevel::Audit, "VM created", vec![vm_id]).await;
//! ```

mod audit;
mod entry;

pub use audit::{create_audit_logger, AuditLogger};
pub use entry::{LogEntry, LogLevel};
