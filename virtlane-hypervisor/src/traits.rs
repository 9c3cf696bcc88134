//! Core hypervisor backend trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// Name-addressed primitives a hypervisor backend must provide.
///
/// Backends speak in native descriptors (XML) and raw runtime facts. They carry
/// no policy: idempotence, precondition checks and decoding belong to the
/// managers built on top of this trait. Native failures are classified as
/// `NotFound` for failed lookups, `AlreadyExists` for name collisions and
/// `Hypervisor` (with the native text untranslated) for everything else.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // =========================================================================
    // Connection & Health
    // =========================================================================

    /// URI this backend is connected to.
    fn uri(&self) -> &str;

    /// Check if the hypervisor connection is healthy.
    async fn health_check(&self) -> Result<bool>;

    /// Release the underlying connection. Later calls fail with `NotConnected`.
    async fn close(&self) -> Result<()>;

    // =========================================================================
    // Domains
    // =========================================================================

    /// Names of every defined or running domain.
    async fn list_domains(&self) -> Result<Vec<String>>;

    async fn domain_runtime(&self, name: &str) -> Result<DomainRuntime>;

    /// Current descriptor: the live view while active, the persistent one otherwise.
    async fn domain_xml(&self, name: &str) -> Result<String>;

    /// Define a persistent domain. Returns its name.
    async fn define_domain(&self, xml: &str) -> Result<String>;

    async fn start_domain(&self, name: &str) -> Result<()>;

    /// Send an ACPI shutdown request. Does not wait for the guest.
    async fn shutdown_domain(&self, name: &str) -> Result<()>;

    /// Immediately halt the domain.
    async fn destroy_domain(&self, name: &str) -> Result<()>;

    /// Send an ACPI reboot request.
    async fn reboot_domain(&self, name: &str) -> Result<()>;

    async fn undefine_domain(&self, name: &str, flags: UndefineFlags) -> Result<()>;

    async fn interface_addresses(
        &self,
        name: &str,
        source: AddressSource,
    ) -> Result<Vec<GuestAddress>>;

    async fn attach_device(&self, name: &str, xml: &str, scope: DeviceScope) -> Result<()>;

    async fn detach_device(&self, name: &str, xml: &str, scope: DeviceScope) -> Result<()>;

    // =========================================================================
    // Networks
    // =========================================================================

    async fn list_networks(&self) -> Result<Vec<String>>;

    async fn network_runtime(&self, name: &str) -> Result<NetworkRuntime>;

    async fn network_xml(&self, name: &str) -> Result<String>;

    /// Define a persistent network. Returns its name.
    async fn define_network(&self, xml: &str) -> Result<String>;

    async fn start_network(&self, name: &str) -> Result<()>;

    async fn stop_network(&self, name: &str) -> Result<()>;

    async fn undefine_network(&self, name: &str) -> Result<()>;

    async fn set_network_autostart(&self, name: &str, autostart: bool) -> Result<()>;

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Snapshot names of a domain.
    async fn list_snapshots(&self, vm: &str) -> Result<Vec<String>>;

    async fn snapshot_xml(&self, vm: &str, snapshot: &str) -> Result<String>;

    /// Capture a snapshot described by `xml`. Returns the snapshot name.
    async fn create_snapshot(&self, vm: &str, xml: &str) -> Result<String>;

    async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> Result<()>;

    async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<()>;
}
