//! Mock hypervisor backend for testing and development.
//!
//! [`MockBackend`] keeps domains, networks and snapshots in memory and speaks
//! the same XML as libvirt, so every manager and the descriptor decoder run
//! unchanged against it. [`MockRunner`] plays the part of `virt-install`,
//! `virt-clone` and friends on top of a `MockBackend`.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::decoder::{DescriptorDecoder, LibvirtXmlDecoder, XmlElement};
use crate::error::{HypervisorError, ResourceKind, Result};
use crate::network::generate_mac_address;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::traits::Hypervisor;
use crate::types::*;
use crate::xml::{escape, DomainXmlBuilder, NetworkXmlBuilder};

/// Mock hypervisor backend for testing.
///
/// This backend simulates a libvirt host in memory without requiring
/// an actual hypervisor. Useful for:
/// - Unit and integration testing
/// - Development without libvirt installed (`--dev`)
///
/// A fresh backend has one active NAT network named `default` on `virbr0`,
/// like a stock libvirt install. Graceful shutdown completes asynchronously:
/// the first runtime query after the request still reports `shutting-down`,
/// the next one `shutoff`.
pub struct MockBackend {
    uri: String,
    closed: AtomicBool,
    next_id: AtomicU32,
    decoder: LibvirtXmlDecoder,
    domains: RwLock<HashMap<String, MockDomain>>,
    networks: RwLock<HashMap<String, MockNetwork>>,
}

struct MockDomain {
    /// Persistent definition
    config: DomainDescriptor,
    /// Running instance, present while active
    live: Option<DomainDescriptor>,
    state: VmState,
    id: Option<u32>,
    persistent: bool,
    autostart: bool,
    shutdown_pending: bool,
    ignores_acpi: bool,
    unreadable: bool,
    reboots: u32,
    leases: Option<Vec<GuestAddress>>,
    arp: Option<Vec<GuestAddress>>,
    /// Stand-in for guest disk contents
    guest_data: BTreeMap<String, String>,
    snapshots: Vec<MockSnapshot>,
}

struct MockSnapshot {
    name: String,
    description: Option<String>,
    created_at: i64,
    state: VmState,
    has_memory: bool,
    config: DomainDescriptor,
    guest_data: BTreeMap<String, String>,
    unreadable: bool,
}

struct MockNetwork {
    desc: NetworkDescriptor,
    active: bool,
    autostart: bool,
    persistent: bool,
    unreadable: bool,
}

impl MockDomain {
    fn new(config: DomainDescriptor) -> Self {
        Self {
            config,
            live: None,
            state: VmState::Shutoff,
            id: None,
            persistent: true,
            autostart: false,
            shutdown_pending: false,
            ignores_acpi: false,
            unreadable: false,
            reboots: 0,
            leases: Some(Vec::new()),
            arp: Some(Vec::new()),
            guest_data: BTreeMap::new(),
            snapshots: Vec::new(),
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            VmState::Running
                | VmState::Blocked
                | VmState::Paused
                | VmState::ShuttingDown
                | VmState::Suspended
        )
    }

    fn power_off(&mut self) {
        self.state = VmState::Shutoff;
        self.live = None;
        self.id = None;
        self.shutdown_pending = false;
    }

    /// The view a plain descriptor query returns.
    fn current(&self) -> &DomainDescriptor {
        self.live.as_ref().unwrap_or(&self.config)
    }
}

fn poisoned<T>(_: T) -> HypervisorError {
    HypervisorError::Internal("Lock poisoned".to_string())
}

fn not_running(operation: &str, name: &str) -> HypervisorError {
    HypervisorError::hypervisor(
        operation,
        name,
        "Requested operation is not valid: domain is not running",
    )
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        Self::with_uri("test:///default")
    }

    pub fn with_uri(uri: impl Into<String>) -> Self {
        info!("Creating mock hypervisor backend");
        let default_net = NetworkDescriptor {
            name: "default".to_string(),
            uuid: Some(Uuid::new_v4().to_string()),
            bridge: Some("virbr0".to_string()),
            forward_mode: Some("nat".to_string()),
            ip_address: Some("192.168.122.1".to_string()),
            prefix: Some(24),
            dhcp_range: Some(DhcpRange {
                start: "192.168.122.2".to_string(),
                end: "192.168.122.254".to_string(),
            }),
        };
        let mut networks = HashMap::new();
        networks.insert(
            default_net.name.clone(),
            MockNetwork {
                desc: default_net,
                active: true,
                autostart: true,
                persistent: true,
                unreadable: false,
            },
        );

        Self {
            uri: uri.into(),
            closed: AtomicBool::new(false),
            next_id: AtomicU32::new(1),
            decoder: LibvirtXmlDecoder::new(),
            domains: RwLock::new(HashMap::new()),
            networks: RwLock::new(networks),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HypervisorError::NotConnected);
        }
        Ok(())
    }

    fn with_domain<T>(&self, name: &str, f: impl FnOnce(&mut MockDomain) -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        let mut domains = self.domains.write().map_err(poisoned)?;
        let domain = domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Vm, name))?;
        f(domain)
    }

    fn with_network<T>(&self, name: &str, f: impl FnOnce(&mut MockNetwork) -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        let mut networks = self.networks.write().map_err(poisoned)?;
        let network = networks
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Network, name))?;
        f(network)
    }

    // =========================================================================
    // Test and dev helpers
    // =========================================================================

    /// Define a shutoff VM with one qcow2 disk and one NIC on `network`.
    pub fn seed_vm(&self, name: &str, memory_mib: u64, vcpus: u32, network: &str) -> Result<()> {
        let desc = DomainDescriptor {
            name: name.to_string(),
            uuid: Some(Uuid::new_v4().to_string()),
            memory_mib,
            vcpus,
            disks: vec![DiskDevice {
                device: "disk".to_string(),
                source: Some(format!("/var/lib/libvirt/images/{}.qcow2", name)),
                target: Some("vda".to_string()),
                bus: Some("virtio".to_string()),
                format: Some("qcow2".to_string()),
            }],
            interfaces: vec![InterfaceDevice {
                kind: "network".to_string(),
                mac: Some(generate_mac_address()),
                source: Some(network.to_string()),
                model: Some("virtio".to_string()),
                xml: String::new(),
            }],
            ..Default::default()
        };
        self.insert_domain(desc)
    }

    fn insert_domain(&self, mut desc: DomainDescriptor) -> Result<()> {
        self.ensure_open()?;
        let mut domains = self.domains.write().map_err(poisoned)?;

        if let Some(existing) = domains.get_mut(&desc.name) {
            // Redefining with the same UUID updates the persistent config
            if desc.uuid.is_some() && desc.uuid == existing.config.uuid {
                existing.config = desc;
                return Ok(());
            }
            return Err(HypervisorError::already_exists(ResourceKind::Vm, desc.name));
        }
        if let Some(uuid) = &desc.uuid {
            if domains.values().any(|d| d.config.uuid.as_ref() == Some(uuid)) {
                return Err(HypervisorError::hypervisor(
                    "define",
                    &desc.name,
                    format!("domain with uuid {} already exists", uuid),
                ));
            }
        } else {
            desc.uuid = Some(Uuid::new_v4().to_string());
        }
        for iface in desc.interfaces.iter_mut() {
            if iface.mac.is_none() {
                iface.mac = Some(generate_mac_address());
            }
        }

        info!(vm = %desc.name, "Mock VM defined");
        domains.insert(desc.name.clone(), MockDomain::new(desc));
        Ok(())
    }

    /// Scripted DHCP leases for a VM.
    pub fn set_leases(&self, name: &str, leases: Vec<GuestAddress>) -> Result<()> {
        self.with_domain(name, |d| {
            d.leases = Some(leases);
            Ok(())
        })
    }

    /// Make the lease-table lookup for a VM fail.
    pub fn fail_lease_lookup(&self, name: &str) -> Result<()> {
        self.with_domain(name, |d| {
            d.leases = None;
            Ok(())
        })
    }

    pub fn set_arp_entries(&self, name: &str, entries: Vec<GuestAddress>) -> Result<()> {
        self.with_domain(name, |d| {
            d.arp = Some(entries);
            Ok(())
        })
    }

    pub fn fail_arp_lookup(&self, name: &str) -> Result<()> {
        self.with_domain(name, |d| {
            d.arp = None;
            Ok(())
        })
    }

    /// Make every read of this VM fail.
    pub fn set_unreadable(&self, name: &str, unreadable: bool) -> Result<()> {
        self.with_domain(name, |d| {
            d.unreadable = unreadable;
            Ok(())
        })
    }

    pub fn set_network_unreadable(&self, name: &str, unreadable: bool) -> Result<()> {
        self.with_network(name, |n| {
            n.unreadable = unreadable;
            Ok(())
        })
    }

    pub fn set_snapshot_unreadable(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.with_domain(vm, |d| {
            let snap = d
                .snapshots
                .iter_mut()
                .find(|s| s.name == snapshot)
                .ok_or_else(|| HypervisorError::not_found(ResourceKind::Snapshot, snapshot))?;
            snap.unreadable = true;
            Ok(())
        })
    }

    /// Guest ignores ACPI shutdown requests.
    pub fn set_ignores_acpi(&self, name: &str, ignores: bool) -> Result<()> {
        self.with_domain(name, |d| {
            d.ignores_acpi = ignores;
            Ok(())
        })
    }

    /// Write a value the guest can see.
    pub fn write_guest_data(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.with_domain(name, |d| {
            d.guest_data.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    pub fn guest_data(&self, name: &str, key: &str) -> Result<Option<String>> {
        self.with_domain(name, |d| Ok(d.guest_data.get(key).cloned()))
    }

    pub fn reboot_count(&self, name: &str) -> Result<u32> {
        self.with_domain(name, |d| Ok(d.reboots))
    }

    /// Interfaces of the persistent (`live = false`) or running view.
    pub fn interfaces(&self, name: &str, live: bool) -> Result<Vec<InterfaceDevice>> {
        self.with_domain(name, |d| {
            let view = if live { d.live.as_ref() } else { Some(&d.config) };
            Ok(view.map(|v| v.interfaces.clone()).unwrap_or_default())
        })
    }

    pub fn domain_exists(&self, name: &str) -> bool {
        self.domains
            .read()
            .map(|d| d.contains_key(name))
            .unwrap_or(false)
    }

    fn parse_interface(xml: &str) -> Result<InterfaceDevice> {
        let element = XmlElement::parse(xml)?;
        if element.name != "interface" {
            return Err(HypervisorError::hypervisor(
                "device",
                &element.name,
                format!("unsupported configuration: device type '{}'", element.name),
            ));
        }
        Ok(LibvirtXmlDecoder::decode_interface(&element))
    }

    fn render_snapshot(snap: &MockSnapshot) -> String {
        let mut xml = format!("<domainsnapshot>\n  <name>{}</name>\n", escape(&snap.name));
        if let Some(description) = &snap.description {
            xml.push_str(&format!("  <description>{}</description>\n", escape(description)));
        }
        xml.push_str(&format!("  <state>{}</state>\n", snap.state.as_str()));
        xml.push_str(&format!("  <creationTime>{}</creationTime>\n", snap.created_at));
        xml.push_str(&format!(
            "  <memory snapshot='{}'/>\n",
            if snap.has_memory { "internal" } else { "no" }
        ));
        xml.push_str(&DomainXmlBuilder::new(&snap.config).build());
        xml.push_str("</domainsnapshot>\n");
        xml
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for MockBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.closed.load(Ordering::SeqCst))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        info!("Mock hypervisor closed");
        Ok(())
    }

    // =========================================================================
    // Domains
    // =========================================================================

    async fn list_domains(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let domains = self.domains.read().map_err(poisoned)?;
        Ok(domains.keys().cloned().collect())
    }

    async fn domain_runtime(&self, name: &str) -> Result<DomainRuntime> {
        self.with_domain(name, |d| {
            if d.unreadable {
                return Err(HypervisorError::hypervisor(
                    "get info",
                    name,
                    "internal error: cannot read domain status",
                ));
            }
            // Graceful shutdown completes on the second observation
            if d.state == VmState::ShuttingDown {
                if d.shutdown_pending {
                    d.shutdown_pending = false;
                } else {
                    d.power_off();
                }
            }
            let view = d.current();
            Ok(DomainRuntime {
                state: d.state,
                active: d.is_active(),
                id: d.id,
                memory_kib: view.memory_mib * 1024,
                max_memory_kib: d.config.memory_mib * 1024,
                vcpus: view.vcpus,
                persistent: d.persistent,
                autostart: d.autostart,
            })
        })
    }

    async fn domain_xml(&self, name: &str) -> Result<String> {
        self.with_domain(name, |d| {
            if d.unreadable {
                return Err(HypervisorError::hypervisor(
                    "get xml",
                    name,
                    "internal error: cannot read domain XML",
                ));
            }
            Ok(DomainXmlBuilder::new(d.current()).build())
        })
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<String> {
        let desc = self.decoder.decode_domain(xml)?;
        let name = desc.name.clone();
        self.insert_domain(desc)?;
        Ok(name)
    }

    #[instrument(skip(self))]
    async fn start_domain(&self, name: &str) -> Result<()> {
        info!("Starting mock VM");
        self.ensure_open()?;

        let required: Vec<String> = {
            let domains = self.domains.read().map_err(poisoned)?;
            let d = domains
                .get(name)
                .ok_or_else(|| HypervisorError::not_found(ResourceKind::Vm, name))?;
            if d.is_active() {
                return Err(HypervisorError::hypervisor(
                    "start",
                    name,
                    "Requested operation is not valid: domain is already running",
                ));
            }
            d.config
                .interfaces
                .iter()
                .filter(|i| i.kind == "network")
                .filter_map(|i| i.source.clone())
                .collect()
        };

        {
            let networks = self.networks.read().map_err(poisoned)?;
            for net in &required {
                match networks.get(net) {
                    Some(n) if n.active => {}
                    Some(_) => {
                        return Err(HypervisorError::hypervisor(
                            "start",
                            name,
                            format!("Requested operation is not valid: network '{}' is not active", net),
                        ))
                    }
                    None => {
                        return Err(HypervisorError::hypervisor(
                            "start",
                            name,
                            format!("Network not found: no network with matching name '{}'", net),
                        ))
                    }
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.with_domain(name, |d| {
            d.state = VmState::Running;
            d.live = Some(d.config.clone());
            d.id = Some(id);
            Ok(())
        })?;
        info!("Mock VM started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        info!("Sending ACPI shutdown to mock VM");
        self.with_domain(name, |d| {
            if !d.is_active() {
                return Err(not_running("shutdown", name));
            }
            if d.ignores_acpi {
                debug!("Mock guest ignored shutdown request");
                return Ok(());
            }
            d.state = VmState::ShuttingDown;
            d.shutdown_pending = true;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    async fn destroy_domain(&self, name: &str) -> Result<()> {
        info!("Force stopping mock VM");
        self.ensure_open()?;
        let mut domains = self.domains.write().map_err(poisoned)?;
        let d = domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Vm, name))?;
        if !d.is_active() {
            return Err(not_running("destroy", name));
        }
        d.power_off();
        if !d.persistent {
            domains.remove(name);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reboot_domain(&self, name: &str) -> Result<()> {
        self.with_domain(name, |d| {
            if !d.is_active() {
                return Err(not_running("reboot", name));
            }
            d.reboots += 1;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    async fn undefine_domain(&self, name: &str, flags: UndefineFlags) -> Result<()> {
        self.ensure_open()?;
        let mut domains = self.domains.write().map_err(poisoned)?;
        let d = domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Vm, name))?;

        if !d.snapshots.is_empty() && !flags.snapshots_metadata {
            return Err(HypervisorError::hypervisor(
                "undefine",
                name,
                format!(
                    "Requested operation is not valid: cannot delete inactive domain with {} snapshots",
                    d.snapshots.len()
                ),
            ));
        }

        if d.is_active() {
            // Running domains become transient and vanish on shutoff
            d.persistent = false;
        } else {
            domains.remove(name);
        }
        info!("Mock VM undefined");
        Ok(())
    }

    async fn interface_addresses(&self, name: &str, source: AddressSource) -> Result<Vec<GuestAddress>> {
        self.with_domain(name, |d| {
            if !d.is_active() {
                return Err(not_running("interface addresses", name));
            }
            let table = match source {
                AddressSource::Lease => &d.leases,
                AddressSource::Arp => &d.arp,
            };
            table.clone().ok_or_else(|| {
                HypervisorError::hypervisor(
                    "interface addresses",
                    name,
                    format!("operation failed: no {:?} information available", source),
                )
            })
        })
    }

    #[instrument(skip(self, xml))]
    async fn attach_device(&self, name: &str, xml: &str, scope: DeviceScope) -> Result<()> {
        let mut iface = Self::parse_interface(xml)?;
        if iface.mac.is_none() {
            iface.mac = Some(generate_mac_address());
        }
        let mac = iface.mac.clone().unwrap_or_default();

        self.with_domain(name, |d| {
            if scope.live && !d.is_active() {
                return Err(not_running("attach device", name));
            }
            let clash = |view: &DomainDescriptor| {
                view.interfaces
                    .iter()
                    .any(|i| i.mac.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(&mac)))
            };
            if (scope.config && clash(&d.config)) || (scope.live && d.live.as_ref().is_some_and(clash)) {
                return Err(HypervisorError::hypervisor(
                    "attach device",
                    name,
                    format!("operation failed: target already has an interface with MAC {}", mac),
                ));
            }
            if scope.config {
                d.config.interfaces.push(iface.clone());
            }
            if scope.live {
                if let Some(live) = d.live.as_mut() {
                    live.interfaces.push(iface);
                }
            }
            info!(mac = %mac, live = scope.live, config = scope.config, "Mock interface attached");
            Ok(())
        })
    }

    #[instrument(skip(self, xml))]
    async fn detach_device(&self, name: &str, xml: &str, scope: DeviceScope) -> Result<()> {
        let iface = Self::parse_interface(xml)?;
        let mac = iface.mac.ok_or_else(|| {
            HypervisorError::hypervisor("detach device", name, "operation failed: interface has no MAC")
        })?;

        self.with_domain(name, |d| {
            if scope.live && !d.is_active() {
                return Err(not_running("detach device", name));
            }
            let position = |view: &DomainDescriptor| {
                view.interfaces
                    .iter()
                    .position(|i| i.mac.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(&mac)))
            };
            let missing = || {
                HypervisorError::hypervisor(
                    "detach device",
                    name,
                    format!("operation failed: no device found with MAC {}", mac),
                )
            };

            // Resolve every view first so a failure leaves both untouched
            let config_pos = if scope.config {
                Some(position(&d.config).ok_or_else(missing)?)
            } else {
                None
            };
            let live_pos = if scope.live {
                Some(d.live.as_ref().and_then(position).ok_or_else(missing)?)
            } else {
                None
            };

            if let Some(pos) = config_pos {
                d.config.interfaces.remove(pos);
            }
            if let (Some(pos), Some(live)) = (live_pos, d.live.as_mut()) {
                live.interfaces.remove(pos);
            }
            info!(mac = %mac, "Mock interface detached");
            Ok(())
        })
    }

    // =========================================================================
    // Networks
    // =========================================================================

    async fn list_networks(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let networks = self.networks.read().map_err(poisoned)?;
        Ok(networks.keys().cloned().collect())
    }

    async fn network_runtime(&self, name: &str) -> Result<NetworkRuntime> {
        self.with_network(name, |n| {
            if n.unreadable {
                return Err(HypervisorError::hypervisor(
                    "get network info",
                    name,
                    "internal error: cannot read network status",
                ));
            }
            Ok(NetworkRuntime {
                active: n.active,
                autostart: n.autostart,
                persistent: n.persistent,
            })
        })
    }

    async fn network_xml(&self, name: &str) -> Result<String> {
        self.with_network(name, |n| {
            if n.unreadable {
                return Err(HypervisorError::hypervisor(
                    "get network xml",
                    name,
                    "internal error: cannot read network XML",
                ));
            }
            Ok(NetworkXmlBuilder::new(&n.desc).build())
        })
    }

    #[instrument(skip(self, xml))]
    async fn define_network(&self, xml: &str) -> Result<String> {
        let mut desc = self.decoder.decode_network(xml)?;
        self.ensure_open()?;
        let mut networks = self.networks.write().map_err(poisoned)?;
        if networks.contains_key(&desc.name) {
            return Err(HypervisorError::already_exists(ResourceKind::Network, desc.name));
        }
        if desc.uuid.is_none() {
            desc.uuid = Some(Uuid::new_v4().to_string());
        }
        let name = desc.name.clone();
        info!(network = %name, "Mock network defined");
        networks.insert(
            name.clone(),
            MockNetwork {
                desc,
                active: false,
                autostart: false,
                persistent: true,
                unreadable: false,
            },
        );
        Ok(name)
    }

    #[instrument(skip(self))]
    async fn start_network(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let mut networks = self.networks.write().map_err(poisoned)?;
        let (active, bridge) = {
            let n = networks
                .get(name)
                .ok_or_else(|| HypervisorError::not_found(ResourceKind::Network, name))?;
            (n.active, n.desc.bridge.clone())
        };
        if active {
            return Err(HypervisorError::hypervisor(
                "start network",
                name,
                "Requested operation is not valid: network is already active",
            ));
        }
        if let Some(bridge) = &bridge {
            let collides = networks
                .values()
                .any(|other| other.active && other.desc.name != name && other.desc.bridge.as_ref() == Some(bridge));
            if collides {
                return Err(HypervisorError::hypervisor(
                    "start network",
                    name,
                    format!("internal error: bridge name '{}' already in use.", bridge),
                ));
            }
        }
        if let Some(n) = networks.get_mut(name) {
            n.active = true;
        }
        info!(network = %name, "Mock network started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop_network(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let mut networks = self.networks.write().map_err(poisoned)?;
        let n = networks
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Network, name))?;
        if !n.active {
            return Err(HypervisorError::hypervisor(
                "stop network",
                name,
                "Requested operation is not valid: network is not active",
            ));
        }
        n.active = false;
        if !n.persistent {
            networks.remove(name);
        }
        info!(network = %name, "Mock network stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn undefine_network(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let mut networks = self.networks.write().map_err(poisoned)?;
        let n = networks
            .get_mut(name)
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Network, name))?;
        if n.active {
            n.persistent = false;
        } else {
            networks.remove(name);
        }
        info!(network = %name, "Mock network undefined");
        Ok(())
    }

    async fn set_network_autostart(&self, name: &str, autostart: bool) -> Result<()> {
        self.with_network(name, |n| {
            if !n.persistent {
                return Err(HypervisorError::hypervisor(
                    "set autostart",
                    name,
                    "Requested operation is not valid: cannot set autostart for transient network",
                ));
            }
            n.autostart = autostart;
            Ok(())
        })
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    async fn list_snapshots(&self, vm: &str) -> Result<Vec<String>> {
        self.with_domain(vm, |d| Ok(d.snapshots.iter().map(|s| s.name.clone()).collect()))
    }

    async fn snapshot_xml(&self, vm: &str, snapshot: &str) -> Result<String> {
        self.with_domain(vm, |d| {
            let snap = d
                .snapshots
                .iter()
                .find(|s| s.name == snapshot)
                .ok_or_else(|| HypervisorError::not_found(ResourceKind::Snapshot, snapshot))?;
            if snap.unreadable {
                return Err(HypervisorError::hypervisor(
                    "get snapshot xml",
                    snapshot,
                    "internal error: snapshot metadata is corrupt",
                ));
            }
            Ok(Self::render_snapshot(snap))
        })
    }

    #[instrument(skip(self, xml))]
    async fn create_snapshot(&self, vm: &str, xml: &str) -> Result<String> {
        let desc = self.decoder.decode_snapshot(xml)?;
        self.with_domain(vm, |d| {
            if d.snapshots.iter().any(|s| s.name == desc.name) {
                return Err(HypervisorError::already_exists(ResourceKind::Snapshot, desc.name.clone()));
            }
            let active = d.is_active();
            d.snapshots.push(MockSnapshot {
                name: desc.name.clone(),
                description: desc.description.clone(),
                created_at: chrono::Utc::now().timestamp(),
                state: if active { d.state } else { VmState::Shutoff },
                has_memory: active,
                config: d.config.clone(),
                guest_data: d.guest_data.clone(),
                unreadable: false,
            });
            info!(snapshot = %desc.name, with_memory = active, "Mock snapshot created");
            Ok(desc.name.clone())
        })
    }

    #[instrument(skip(self))]
    async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.with_domain(vm, |d| {
            let snap = d
                .snapshots
                .iter()
                .find(|s| s.name == snapshot)
                .ok_or_else(|| HypervisorError::not_found(ResourceKind::Snapshot, snapshot))?;

            let config = snap.config.clone();
            let guest_data = snap.guest_data.clone();
            let (has_memory, state) = (snap.has_memory, snap.state);

            d.config = config;
            d.guest_data = guest_data;
            if has_memory {
                d.state = state;
                d.live = Some(d.config.clone());
                d.shutdown_pending = false;
                if d.id.is_none() {
                    d.id = Some(id);
                }
            } else {
                d.power_off();
            }
            info!(snapshot = %snapshot, "Mock VM reverted");
            Ok(())
        })
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.with_domain(vm, |d| {
            let pos = d
                .snapshots
                .iter()
                .position(|s| s.name == snapshot)
                .ok_or_else(|| HypervisorError::not_found(ResourceKind::Snapshot, snapshot))?;
            d.snapshots.remove(pos);
            Ok(())
        })
    }
}

// =============================================================================
// Provisioning tool simulator
// =============================================================================

/// Canned behaviour for the next invocation of a program.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Return this output without running the simulation
    Output(CommandOutput),
    /// Behave as if the tool never finished
    Hang,
}

/// Simulates `virt-install`, `virt-clone`, `osinfo-query` and `ip` against a
/// [`MockBackend`], recording every invocation.
pub struct MockRunner {
    backend: Arc<MockBackend>,
    create_disk_files: bool,
    scripted: Mutex<HashMap<String, Vec<ScriptedResponse>>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl MockRunner {
    pub fn new(backend: Arc<MockBackend>) -> Self {
        Self {
            backend,
            create_disk_files: false,
            scripted: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Create (empty) disk image files the way the real tools would.
    pub fn with_disk_files(mut self, enabled: bool) -> Self {
        self.create_disk_files = enabled;
        self
    }

    /// Queue a canned response for the next call to `program`.
    pub fn script(&self, program: &str, response: ScriptedResponse) {
        if let Ok(mut scripted) = self.scripted.lock() {
            scripted.entry(program.to_string()).or_default().push(response);
        }
    }

    /// Every command run so far.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next_scripted(&self, program: &str) -> Option<ScriptedResponse> {
        let mut scripted = self.scripted.lock().ok()?;
        let queue = scripted.get_mut(program)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    fn ok(stdout: impl Into<String>) -> CommandOutput {
        CommandOutput {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    fn failed(stderr: impl Into<String>) -> CommandOutput {
        CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    fn touch(&self, path: &str) -> std::result::Result<(), String> {
        if self.create_disk_files {
            std::fs::write(path, b"").map_err(|e| format!("ERROR    Couldn't create storage {}: {}", path, e))?;
        }
        Ok(())
    }

    async fn virt_install(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        if spec.has_flag("--os-variant") && spec.has_flag("list") {
            return Ok(Self::ok("debian12\nubuntu22.04\nfedora39\nwin11\ngeneric\n"));
        }

        let Some(name) = spec.flag_value("name") else {
            return Ok(Self::failed("ERROR    --name is required"));
        };
        let disk = spec.flag_value("disk").unwrap_or_default();
        let disk_path = disk
            .split(',')
            .find_map(|p| p.strip_prefix("path="))
            .unwrap_or_default()
            .to_string();
        let (kind, source) = spec
            .flag_value("network")
            .and_then(|n| n.split(',').next())
            .and_then(|n| n.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .unwrap_or_else(|| ("network".to_string(), "default".to_string()));

        if self.backend.domain_exists(name) {
            return Ok(Self::failed(format!(
                "ERROR    Guest name '{}' is already in use.",
                name
            )));
        }

        let mut disks = vec![DiskDevice {
            device: "disk".to_string(),
            source: Some(disk_path.clone()),
            target: Some("vda".to_string()),
            bus: Some("virtio".to_string()),
            format: Some("qcow2".to_string()),
        }];
        if let Some(iso) = spec.flag_value("cdrom") {
            disks.push(DiskDevice {
                device: "cdrom".to_string(),
                source: Some(iso.to_string()),
                target: Some("sda".to_string()),
                bus: Some("sata".to_string()),
                format: Some("raw".to_string()),
            });
        }

        let desc = DomainDescriptor {
            name: name.to_string(),
            uuid: Some(Uuid::new_v4().to_string()),
            memory_mib: spec.flag_value("memory").and_then(|m| m.parse().ok()).unwrap_or(1024),
            vcpus: spec.flag_value("vcpus").and_then(|v| v.parse().ok()).unwrap_or(1),
            os_variant: spec.flag_value("os-variant").map(|v| format!("http://libosinfo.org/{}", v)),
            disks,
            interfaces: vec![InterfaceDevice {
                kind,
                mac: Some(generate_mac_address()),
                source: Some(source),
                model: Some("virtio".to_string()),
                xml: String::new(),
            }],
            ..Default::default()
        };

        if !disk_path.is_empty() {
            if let Err(stderr) = self.touch(&disk_path) {
                return Ok(Self::failed(stderr));
            }
        }

        let xml = DomainXmlBuilder::new(&desc).build();
        if let Err(e) = self.backend.define_domain(&xml).await {
            return Ok(Self::failed(format!("ERROR    {}", e)));
        }
        if let Err(e) = self.backend.start_domain(name).await {
            return Ok(Self::failed(format!("ERROR    {}", e)));
        }

        Ok(Self::ok(format!(
            "Starting install...\nCreating domain...\nDomain creation completed.\n{}",
            name
        )))
    }

    async fn virt_clone(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let (Some(original), Some(name)) = (spec.flag_value("original"), spec.flag_value("name")) else {
            return Ok(Self::failed("ERROR    --original and --name are required"));
        };

        let source_xml = match self.backend.domain_xml(original).await {
            Ok(xml) => xml,
            Err(_) => {
                return Ok(Self::failed(format!(
                    "ERROR    Domain '{}' was not found.",
                    original
                )))
            }
        };
        let runtime = self.backend.domain_runtime(original).await?;
        if runtime.active {
            return Ok(Self::failed(
                "ERROR    Domain with devices to clone must be paused or shutoff.",
            ));
        }
        if self.backend.domain_exists(name) {
            return Ok(Self::failed(format!(
                "ERROR    Invalid name for new guest: Guest name '{}' is already in use.",
                name
            )));
        }

        let mut desc = self.backend.decoder.decode_domain(&source_xml)?;
        desc.name = name.to_string();
        desc.uuid = Some(Uuid::new_v4().to_string());
        for disk in desc.disks.iter_mut().filter(|d| d.is_disk()) {
            if let Some(src) = disk.source.take() {
                let cloned = match src.rsplit_once('.') {
                    Some((stem, ext)) if !ext.contains('/') => format!("{}-clone.{}", stem, ext),
                    _ => format!("{}-clone", src),
                };
                if let Err(stderr) = self.touch(&cloned) {
                    return Ok(Self::failed(stderr));
                }
                disk.source = Some(cloned);
            }
        }
        for iface in desc.interfaces.iter_mut() {
            iface.mac = Some(generate_mac_address());
        }

        let xml = DomainXmlBuilder::new(&desc).build();
        if let Err(e) = self.backend.define_domain(&xml).await {
            return Ok(Self::failed(format!("ERROR    {}", e)));
        }
        Ok(Self::ok(format!("Clone '{}' created successfully.", name)))
    }

    async fn ip_bridges(&self) -> Result<CommandOutput> {
        let names = self.backend.list_networks().await?;
        let mut bridges = Vec::new();
        for name in names {
            let runtime = self.backend.network_runtime(&name).await;
            let xml = self.backend.network_xml(&name).await;
            if let (Ok(runtime), Ok(xml)) = (runtime, xml) {
                let desc = self.backend.decoder.decode_network(&xml)?;
                if let (true, Some(bridge)) = (runtime.active, desc.bridge) {
                    bridges.push(serde_json::json!({
                        "ifname": bridge,
                        "operstate": "UP",
                        "address": "52:54:00:00:00:01",
                    }));
                }
            }
        }
        Ok(Self::ok(serde_json::Value::Array(bridges).to_string()))
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        debug!(program = %spec.program, args = ?spec.args, "Mock command");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.clone());
        }

        match self.next_scripted(&spec.program) {
            Some(ScriptedResponse::Output(output)) => return Ok(output),
            Some(ScriptedResponse::Hang) => {
                tokio::time::sleep(spec.timeout).await;
                return Err(HypervisorError::Timeout {
                    operation: spec.program.clone(),
                    after: spec.timeout,
                });
            }
            None => {}
        }

        match spec.program.as_str() {
            "virt-install" => self.virt_install(&spec).await,
            "virt-clone" => self.virt_clone(&spec).await,
            "osinfo-query" => Ok(Self::ok(
                " Short ID | Name\n----------+------------------\n debian12 | Debian 12\n win11    | Microsoft Windows 11\n",
            )),
            "ip" => self.ip_bridges().await,
            other => Err(HypervisorError::ProvisioningFailed {
                tool: other.to_string(),
                detail: "failed to start: No such file or directory (os error 2)".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_define_and_start() {
        let backend = MockBackend::new();
        backend.seed_vm("web01", 2048, 2, "default").unwrap();

        let runtime = backend.domain_runtime("web01").await.unwrap();
        assert_eq!(runtime.state, VmState::Shutoff);
        assert!(!runtime.active);

        backend.start_domain("web01").await.unwrap();
        let runtime = backend.domain_runtime("web01").await.unwrap();
        assert_eq!(runtime.state, VmState::Running);
        assert_eq!(runtime.memory_kib, 2048 * 1024);
        assert!(runtime.id.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_define_rejected() {
        let backend = MockBackend::new();
        backend.seed_vm("web01", 1024, 1, "default").unwrap();
        let err = backend.seed_vm("web01", 1024, 1, "default").unwrap_err();
        assert!(matches!(err, HypervisorError::AlreadyExists { kind: ResourceKind::Vm, .. }));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_is_asynchronous() {
        let backend = MockBackend::new();
        backend.seed_vm("web01", 1024, 1, "default").unwrap();
        backend.start_domain("web01").await.unwrap();

        backend.shutdown_domain("web01").await.unwrap();
        assert_eq!(backend.domain_runtime("web01").await.unwrap().state, VmState::ShuttingDown);
        assert_eq!(backend.domain_runtime("web01").await.unwrap().state, VmState::Shutoff);
    }

    #[tokio::test]
    async fn test_start_requires_active_network() {
        let backend = MockBackend::new();
        backend.seed_vm("web01", 1024, 1, "missing").unwrap();
        let err = backend.start_domain("web01").await.unwrap_err();
        assert!(matches!(err, HypervisorError::Hypervisor { .. }));
    }

    #[tokio::test]
    async fn test_undefine_with_snapshots_needs_flag() {
        let backend = MockBackend::new();
        backend.seed_vm("web01", 1024, 1, "default").unwrap();
        backend
            .create_snapshot("web01", "<domainsnapshot><name>s1</name></domainsnapshot>")
            .await
            .unwrap();

        assert!(backend.undefine_domain("web01", UndefineFlags::default()).await.is_err());
        backend.undefine_domain("web01", UndefineFlags::all()).await.unwrap();
        assert!(!backend.domain_exists("web01"));
    }

    #[tokio::test]
    async fn test_live_attach_requires_running() {
        let backend = MockBackend::new();
        backend.seed_vm("web01", 1024, 1, "default").unwrap();
        let xml = crate::xml::interface_xml("network", "default", Some("52:54:00:12:34:56"), None);

        let err = backend
            .attach_device("web01", &xml, DeviceScope { live: true, config: true })
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::Hypervisor { .. }));
        assert_eq!(backend.interfaces("web01", false).unwrap().len(), 1);

        backend
            .attach_device("web01", &xml, DeviceScope::for_active(false))
            .await
            .unwrap();
        assert_eq!(backend.interfaces("web01", false).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bridge_collision_blocks_start() {
        let backend = MockBackend::new();
        backend
            .define_network("<network><name>dup</name><bridge name='virbr0'/></network>")
            .await
            .unwrap();
        let err = backend.start_network("dup").await.unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[tokio::test]
    async fn test_closed_backend() {
        let backend = MockBackend::new();
        backend.close().await.unwrap();
        assert!(matches!(backend.list_domains().await, Err(HypervisorError::NotConnected)));
    }

    #[tokio::test]
    async fn test_runner_records_and_scripts() {
        let backend = Arc::new(MockBackend::new());
        let runner = MockRunner::new(backend.clone());
        runner.script(
            "virt-install",
            ScriptedResponse::Output(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "ERROR    boom".to_string(),
            }),
        );

        let spec = CommandSpec::new("virt-install", std::time::Duration::from_secs(1)).arg("--name=x");
        let output = runner.run(spec.clone()).await.unwrap();
        assert_eq!(output.exit_code, 1);
        assert_eq!(runner.calls().len(), 1);

        // Script consumed, simulation runs next
        let output = runner.run(spec).await.unwrap();
        assert!(output.success());
        assert!(backend.domain_exists("x"));
    }
}
