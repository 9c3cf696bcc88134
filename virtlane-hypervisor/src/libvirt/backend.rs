//! Libvirt backend implementation.

use async_trait::async_trait;
use std::sync::RwLock;
use tracing::{debug, info, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::domain_snapshot::DomainSnapshot;
use virt::error::ErrorNumber;
use virt::network::Network;
use virt::sys;

use crate::error::{HypervisorError, ResourceKind, Result};
use crate::libvirt::errors::{define_error, descriptor_name, lookup_error, NativeCode};
use crate::traits::Hypervisor;
use crate::types::*;

/// Libvirt/QEMU hypervisor backend.
///
/// Holds one `virConnect` for the life of the process. Every call looks the
/// object up by name, so nothing here goes stale when other tools change
/// the host.
pub struct LibvirtBackend {
    uri: String,
    connection: RwLock<Option<Connect>>,
}

fn native_code(err: &virt::error::Error) -> NativeCode {
    match err.code() {
        ErrorNumber::NoDomain => NativeCode::NoDomain,
        ErrorNumber::NoNetwork => NativeCode::NoNetwork,
        ErrorNumber::NoDomainSnapshot => NativeCode::NoSnapshot,
        ErrorNumber::DomExist => NativeCode::DomainExists,
        ErrorNumber::NetworkExist => NativeCode::NetworkExists,
        _ => NativeCode::Other,
    }
}

fn lookup_failed(operation: &str, kind: ResourceKind, name: &str, err: virt::error::Error) -> HypervisorError {
    lookup_error(operation, kind, name, native_code(&err), err)
}

fn define_failed(operation: &str, kind: ResourceKind, name: &str, err: virt::error::Error) -> HypervisorError {
    define_error(operation, kind, name, native_code(&err), err)
}

impl LibvirtBackend {
    /// Connect to the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu:///session` - User session QEMU
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub async fn open(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::ConnectionFailed(format!("{}: {}", uri, e)))?;

        info!("Connected to libvirt");

        Ok(Self {
            uri: uri.to_string(),
            connection: RwLock::new(Some(connection)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connect) -> Result<T>) -> Result<T> {
        let guard = self
            .connection
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        let conn = guard.as_ref().ok_or(HypervisorError::NotConnected)?;
        f(conn)
    }

    fn with_domain<T>(&self, name: &str, operation: &str, f: impl FnOnce(&Domain) -> std::result::Result<T, virt::error::Error>) -> Result<T> {
        self.with_conn(|conn| {
            let domain = Domain::lookup_by_name(conn, name)
                .map_err(|e| lookup_failed(operation, ResourceKind::Vm, name, e))?;
            f(&domain).map_err(|e| HypervisorError::hypervisor(operation, name, e))
        })
    }

    fn with_network<T>(&self, name: &str, operation: &str, f: impl FnOnce(&Network) -> std::result::Result<T, virt::error::Error>) -> Result<T> {
        self.with_conn(|conn| {
            let network = Network::lookup_by_name(conn, name)
                .map_err(|e| lookup_failed(operation, ResourceKind::Network, name, e))?;
            f(&network).map_err(|e| HypervisorError::hypervisor(operation, name, e))
        })
    }

    fn with_snapshot<T>(&self, vm: &str, snapshot: &str, operation: &str, f: impl FnOnce(&DomainSnapshot) -> std::result::Result<T, virt::error::Error>) -> Result<T> {
        self.with_conn(|conn| {
            let domain = Domain::lookup_by_name(conn, vm)
                .map_err(|e| lookup_failed(operation, ResourceKind::Vm, vm, e))?;
            let snap = DomainSnapshot::lookup_by_name(&domain, snapshot, 0)
                .map_err(|e| lookup_failed(operation, ResourceKind::Snapshot, snapshot, e))?;
            f(&snap).map_err(|e| HypervisorError::hypervisor(operation, snapshot, e))
        })
    }

    /// Convert libvirt domain state to VmState.
    fn state_from_libvirt(state: sys::virDomainState) -> VmState {
        match state {
            sys::VIR_DOMAIN_RUNNING => VmState::Running,
            sys::VIR_DOMAIN_BLOCKED => VmState::Blocked,
            sys::VIR_DOMAIN_PAUSED => VmState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => VmState::ShuttingDown,
            sys::VIR_DOMAIN_SHUTOFF => VmState::Shutoff,
            sys::VIR_DOMAIN_CRASHED => VmState::Crashed,
            sys::VIR_DOMAIN_PMSUSPENDED => VmState::Suspended,
            _ => VmState::NoState,
        }
    }

    fn scope_flags(scope: DeviceScope) -> u32 {
        let mut flags = 0;
        if scope.live {
            flags |= sys::VIR_DOMAIN_AFFECT_LIVE;
        }
        if scope.config {
            flags |= sys::VIR_DOMAIN_AFFECT_CONFIG;
        }
        flags
    }
}

#[async_trait]
impl Hypervisor for LibvirtBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<bool> {
        self.with_conn(|conn| Ok(conn.is_alive().unwrap_or(false)))
    }

    #[instrument(skip(self))]
    async fn close(&self) -> Result<()> {
        let mut guard = self
            .connection
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        if let Some(mut conn) = guard.take() {
            conn.close()
                .map_err(|e| HypervisorError::hypervisor("close", &self.uri, e))?;
            info!(uri = %self.uri, "Disconnected from libvirt");
        }
        Ok(())
    }

    // =========================================================================
    // Domains
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_domains(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let domains = conn
                .list_all_domains(0)
                .map_err(|e| HypervisorError::hypervisor("list domains", &self.uri, e))?;
            let mut names = Vec::with_capacity(domains.len());
            for domain in domains {
                match domain.get_name() {
                    Ok(name) => names.push(name),
                    // Vanished between list and read
                    Err(e) => debug!(error = %e, "Skipping domain without name"),
                }
            }
            Ok(names)
        })
    }

    async fn domain_runtime(&self, name: &str) -> Result<DomainRuntime> {
        self.with_domain(name, "get info", |domain| {
            let info = domain.get_info()?;
            let (state, _reason) = domain.get_state()?;
            Ok(DomainRuntime {
                state: Self::state_from_libvirt(state),
                active: domain.is_active()?,
                id: domain.get_id(),
                memory_kib: info.memory,
                max_memory_kib: info.max_mem,
                vcpus: info.nr_virt_cpu,
                persistent: domain.is_persistent()?,
                autostart: domain.get_autostart()?,
            })
        })
    }

    async fn domain_xml(&self, name: &str) -> Result<String> {
        self.with_domain(name, "get xml", |domain| domain.get_xml_desc(0))
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<String> {
        let requested = descriptor_name(xml);
        self.with_conn(|conn| {
            let domain = Domain::define_xml(conn, xml)
                .map_err(|e| define_failed("define", ResourceKind::Vm, &requested, e))?;
            let name = domain
                .get_name()
                .map_err(|e| HypervisorError::hypervisor("define", &requested, e))?;
            info!(vm = %name, "Domain defined");
            Ok(name)
        })
    }

    #[instrument(skip(self))]
    async fn start_domain(&self, name: &str) -> Result<()> {
        info!("Starting VM");
        self.with_domain(name, "start", |domain| domain.create().map(|_| ()))
    }

    #[instrument(skip(self))]
    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        info!("Sending ACPI shutdown");
        self.with_domain(name, "shutdown", |domain| domain.shutdown().map(|_| ()))
    }

    #[instrument(skip(self))]
    async fn destroy_domain(&self, name: &str) -> Result<()> {
        info!("Force stopping VM");
        self.with_domain(name, "destroy", |domain| domain.destroy())
    }

    #[instrument(skip(self))]
    async fn reboot_domain(&self, name: &str) -> Result<()> {
        info!("Sending reboot");
        self.with_domain(name, "reboot", |domain| domain.reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT))
    }

    #[instrument(skip(self))]
    async fn undefine_domain(&self, name: &str, flags: UndefineFlags) -> Result<()> {
        let mut raw = 0;
        if flags.managed_save {
            raw |= sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE;
        }
        if flags.snapshots_metadata {
            raw |= sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA;
        }
        if flags.nvram {
            raw |= sys::VIR_DOMAIN_UNDEFINE_NVRAM;
        }
        self.with_domain(name, "undefine", |domain| domain.undefine_flags(raw))
    }

    async fn interface_addresses(&self, name: &str, source: AddressSource) -> Result<Vec<GuestAddress>> {
        let src = match source {
            AddressSource::Lease => sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE,
            AddressSource::Arp => sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_ARP,
        };
        self.with_domain(name, "interface addresses", |domain| {
            let ifaces = domain.interface_addresses(src, 0)?;
            Ok(ifaces
                .into_iter()
                .flat_map(|iface| {
                    let mac = Some(iface.hwaddr.clone()).filter(|m| !m.is_empty());
                    let interface = iface.name.clone();
                    iface.addrs.into_iter().map(move |a| GuestAddress {
                        interface: interface.clone(),
                        mac: mac.clone(),
                        addr: a.addr,
                        prefix: a.prefix,
                    })
                })
                .collect())
        })
    }

    #[instrument(skip(self, xml))]
    async fn attach_device(&self, name: &str, xml: &str, scope: DeviceScope) -> Result<()> {
        let flags = Self::scope_flags(scope);
        self.with_domain(name, "attach device", |domain| {
            domain.attach_device_flags(xml, flags).map(|_| ())
        })
    }

    #[instrument(skip(self, xml))]
    async fn detach_device(&self, name: &str, xml: &str, scope: DeviceScope) -> Result<()> {
        let flags = Self::scope_flags(scope);
        self.with_domain(name, "detach device", |domain| {
            domain.detach_device_flags(xml, flags).map(|_| ())
        })
    }

    // =========================================================================
    // Networks
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_networks(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let networks = conn
                .list_all_networks(0)
                .map_err(|e| HypervisorError::hypervisor("list networks", &self.uri, e))?;
            Ok(networks.iter().filter_map(|n| n.get_name().ok()).collect())
        })
    }

    async fn network_runtime(&self, name: &str) -> Result<NetworkRuntime> {
        self.with_network(name, "get network info", |net| {
            Ok(NetworkRuntime {
                active: net.is_active()?,
                autostart: net.get_autostart()?,
                persistent: net.is_persistent()?,
            })
        })
    }

    async fn network_xml(&self, name: &str) -> Result<String> {
        self.with_network(name, "get network xml", |net| net.get_xml_desc(0))
    }

    #[instrument(skip(self, xml))]
    async fn define_network(&self, xml: &str) -> Result<String> {
        let requested = descriptor_name(xml);
        self.with_conn(|conn| {
            let net = Network::define_xml(conn, xml)
                .map_err(|e| define_failed("define network", ResourceKind::Network, &requested, e))?;
            net.get_name()
                .map_err(|e| HypervisorError::hypervisor("define network", &requested, e))
        })
    }

    #[instrument(skip(self))]
    async fn start_network(&self, name: &str) -> Result<()> {
        self.with_network(name, "start network", |net| net.create().map(|_| ()))
    }

    #[instrument(skip(self))]
    async fn stop_network(&self, name: &str) -> Result<()> {
        self.with_network(name, "stop network", |net| net.destroy())
    }

    #[instrument(skip(self))]
    async fn undefine_network(&self, name: &str) -> Result<()> {
        self.with_network(name, "undefine network", |net| net.undefine())
    }

    async fn set_network_autostart(&self, name: &str, autostart: bool) -> Result<()> {
        self.with_network(name, "set autostart", |net| net.set_autostart(autostart).map(|_| ()))
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    async fn list_snapshots(&self, vm: &str) -> Result<Vec<String>> {
        self.with_domain(vm, "list snapshots", |domain| {
            let snaps = domain.list_all_snapshots(0)?;
            Ok(snaps.iter().filter_map(|s| s.get_name().ok()).collect())
        })
    }

    async fn snapshot_xml(&self, vm: &str, snapshot: &str) -> Result<String> {
        self.with_snapshot(vm, snapshot, "get snapshot xml", |snap| snap.get_xml_desc(0))
    }

    #[instrument(skip(self, xml))]
    async fn create_snapshot(&self, vm: &str, xml: &str) -> Result<String> {
        let requested = descriptor_name(xml);
        self.with_conn(|conn| {
            let domain = Domain::lookup_by_name(conn, vm)
                .map_err(|e| lookup_failed("create snapshot", ResourceKind::Vm, vm, e))?;
            let snap = DomainSnapshot::create_xml(&domain, xml, 0)
                .map_err(|e| define_failed("create snapshot", ResourceKind::Snapshot, &requested, e))?;
            snap.get_name()
                .map_err(|e| HypervisorError::hypervisor("create snapshot", &requested, e))
        })
    }

    #[instrument(skip(self))]
    async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.with_snapshot(vm, snapshot, "revert snapshot", |snap| snap.revert(0))
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.with_snapshot(vm, snapshot, "delete snapshot", |snap| snap.delete(0))
    }
}
