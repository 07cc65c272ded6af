//! Orchestrator error taxonomy.
//!
//! Validation and Quota errors surface synchronously to the API caller.
//! Capacity errors leave the VM in Pending. Protocol errors on acks are
//! absorbed by the ack path. External errors degrade the specific feature.
//! Invariant violations are logged at high severity, never thrown from
//! observation code.

use thiserror::Error;

use crate::store::StoreError;

/// Errors that can occur in the orchestrator services.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Rejected before any state change.
    #[error("validation: {0}")]
    Validation(String),

    /// Owner quota exceeded.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// No eligible node for a VM spec.
    #[error("capacity: {0}")]
    Capacity(String),

    /// Command not correlatable, or an ack wait timed out.
    #[error("protocol: {0}")]
    Protocol(String),

    /// A collaborator (node agent, DNS, relay endpoint) failed.
    #[error("external: {0}")]
    External(String),

    /// reserved > total or similar. Should never happen.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A precondition on the target is not met (for example a node whose
    /// benchmark is below the minimum for every tier).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller is not allowed to perform the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// Stable machine-readable code carried in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "argument",
            OrchestratorError::Quota(_) => "quota_exceeded",
            OrchestratorError::Capacity(_) => "no_capacity",
            OrchestratorError::Protocol(_) => "protocol",
            OrchestratorError::External(_) => "external",
            OrchestratorError::Invariant(_) => "invariant",
            OrchestratorError::FailedPrecondition(_) => "failed_precondition",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::Unauthorized(_) => "unauthorized",
            OrchestratorError::Store(StoreError::NotFound(_)) => "not_found",
            OrchestratorError::Store(_) => "internal",
        }
    }
}

/// Result type for orchestrator services.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            OrchestratorError::Validation("bad wallet".into()).code(),
            "argument"
        );
        assert_eq!(
            OrchestratorError::Quota("too many VMs".into()).code(),
            "quota_exceeded"
        );
        assert_eq!(
            OrchestratorError::Store(StoreError::NotFound("vm".into())).code(),
            "not_found"
        );
    }
}
