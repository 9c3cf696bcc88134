//! Error types for the hypervisor orchestration core.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kind of managed resource an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Vm,
    Network,
    Snapshot,
    Interface,
    Disk,
    InstallMedia,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Vm => "VM",
            ResourceKind::Network => "network",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::Interface => "interface",
            ResourceKind::Disk => "disk",
            ResourceKind::InstallMedia => "install media",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// The connection was never opened or has been closed.
    #[error("Hypervisor connection is not open")]
    NotConnected,

    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// A named resource does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    /// A resource with the requested identity already exists.
    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: ResourceKind, name: String },

    /// The resource is in the wrong state for the requested operation.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Caller input failed validation.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// An external provisioning tool exited unsuccessfully or could not be started.
    #[error("{tool} failed: {detail}")]
    ProvisioningFailed { tool: String, detail: String },

    /// A bounded operation did not finish in time.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    /// The hypervisor rejected the operation.
    #[error("Hypervisor rejected {operation} on '{target}': {message}")]
    Hypervisor {
        operation: String,
        target: String,
        message: String,
    },

    /// A resource descriptor could not be decoded.
    #[error("XML error: {0}")]
    XmlError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HypervisorError {
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::NotFound { kind, name: name.into() }
    }

    pub fn already_exists(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::AlreadyExists { kind, name: name.into() }
    }

    pub fn hypervisor(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl fmt::Display,
    ) -> Self {
        Self::Hypervisor {
            operation: operation.into(),
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HypervisorError::NotConnected | HypervisorError::ConnectionFailed(_) => {
                ErrorKind::NotConnected
            }
            HypervisorError::NotFound { .. } => ErrorKind::NotFound,
            HypervisorError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            HypervisorError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            HypervisorError::Validation(_) => ErrorKind::ValidationError,
            HypervisorError::ProvisioningFailed { .. } => ErrorKind::ProvisioningFailed,
            HypervisorError::Timeout { .. } => ErrorKind::Timeout,
            HypervisorError::Hypervisor { .. } | HypervisorError::XmlError(_) => {
                ErrorKind::HypervisorError
            }
            HypervisorError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Error classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotConnected,
    NotFound,
    AlreadyExists,
    PreconditionFailed,
    ValidationError,
    ProvisioningFailed,
    Timeout,
    HypervisorError,
    Internal,
}

/// Serializable form of an error: its kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&HypervisorError> for ErrorReport {
    fn from(err: &HypervisorError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_snake_case() {
        let err = HypervisorError::not_found(ResourceKind::Vm, "web01");
        let report = ErrorReport::from(&err);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"not_found\""));
        assert!(json.contains("VM not found: web01"));
    }

    #[test]
    fn test_timeout_message() {
        let err = HypervisorError::Timeout {
            operation: "virt-install".to_string(),
            after: Duration::from_secs(120),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.to_string(), "virt-install timed out after 120s");
    }
}
