//! Mapping of libvirt failures onto [`HypervisorError`].
//!
//! Only the lookup of the addressed object and the definition of a new one
//! are classified, and only on the error code. Failures of the operation
//! itself keep libvirt's message untouched, whatever it says.

use crate::decoder::XmlElement;
use crate::error::{HypervisorError, ResourceKind};

/// libvirt error codes that carry meaning for this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeCode {
    /// `VIR_ERR_NO_DOMAIN`
    NoDomain,
    /// `VIR_ERR_NO_NETWORK`
    NoNetwork,
    /// `VIR_ERR_NO_DOMAIN_SNAPSHOT`
    NoSnapshot,
    /// `VIR_ERR_DOM_EXIST`
    DomainExists,
    /// `VIR_ERR_NETWORK_EXIST`
    NetworkExists,
    Other,
}

impl NativeCode {
    fn missing(kind: ResourceKind) -> Option<Self> {
        match kind {
            ResourceKind::Vm => Some(Self::NoDomain),
            ResourceKind::Network => Some(Self::NoNetwork),
            ResourceKind::Snapshot => Some(Self::NoSnapshot),
            _ => None,
        }
    }

    fn exists(kind: ResourceKind) -> Option<Self> {
        match kind {
            ResourceKind::Vm => Some(Self::DomainExists),
            ResourceKind::Network => Some(Self::NetworkExists),
            _ => None,
        }
    }
}

/// A failed `lookup_by_name` of `name`.
pub fn lookup_error(
    operation: &str,
    kind: ResourceKind,
    name: &str,
    code: NativeCode,
    message: impl std::fmt::Display,
) -> HypervisorError {
    if NativeCode::missing(kind) == Some(code) {
        HypervisorError::not_found(kind, name)
    } else {
        HypervisorError::hypervisor(operation, name, message)
    }
}

/// A failed definition or creation of `name`.
pub fn define_error(
    operation: &str,
    kind: ResourceKind,
    name: &str,
    code: NativeCode,
    message: impl std::fmt::Display,
) -> HypervisorError {
    if NativeCode::exists(kind) == Some(code) {
        HypervisorError::already_exists(kind, name)
    } else {
        HypervisorError::hypervisor(operation, name, message)
    }
}

/// The `<name>` of a domain, network or snapshot descriptor, or empty.
pub fn descriptor_name(xml: &str) -> String {
    XmlElement::parse(xml)
        .ok()
        .and_then(|root| root.child_text("name").map(str::to_string))
        .unwrap_or_default()
}
