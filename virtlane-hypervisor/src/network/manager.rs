//! Virtual network manager.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::subnet::Subnet;
use super::types::*;
use crate::connection::Connection;
use crate::error::{HypervisorError, ResourceKind, Result};
use crate::inspector::Inspector;
use crate::provision::validate_name;
use crate::types::*;
use crate::xml::{interface_xml, NetworkXmlBuilder};

/// Longest accepted network name.
const MAX_NETWORK_NAME: usize = 100;

/// Generate a random MAC address in the QEMU/KVM OUI.
pub fn generate_mac_address() -> String {
    let bytes: [u8; 3] = rand::random();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        bytes[0] & 0x3f,
        bytes[1],
        bytes[2]
    )
}

/// Accept `xx:xx:xx:xx:xx:xx` unicast MACs, normalized to lowercase.
fn normalize_mac(mac: &str) -> Result<String> {
    let parts: Vec<&str> = mac.trim().split(':').collect();
    let valid = parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(HypervisorError::Validation(format!("invalid MAC address '{}'", mac)));
    }
    let first = u8::from_str_radix(parts[0], 16).unwrap_or(1);
    if first & 0x01 != 0 {
        return Err(HypervisorError::Validation(format!("MAC address '{}' is multicast", mac)));
    }
    Ok(mac.trim().to_ascii_lowercase())
}

/// Bridge device name for a network: `virbr-` plus the first 8 characters.
fn bridge_name(network: &str) -> String {
    format!("virbr-{}", network.chars().take(8).collect::<String>())
}

pub struct Networks {
    conn: Arc<Connection>,
    inspector: Inspector,
}

impl Networks {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            inspector: Inspector::new(conn.clone()),
            conn,
        }
    }

    fn parse_host(subnet: &Subnet, label: &str, value: &str) -> Result<Ipv4Addr> {
        let addr: Ipv4Addr = value
            .trim()
            .parse()
            .map_err(|_| HypervisorError::Validation(format!("invalid {} address '{}'", label, value)))?;
        if !subnet.contains_host(addr) {
            return Err(HypervisorError::Validation(format!(
                "{} address {} is outside {}",
                label, addr, subnet
            )));
        }
        if addr == subnet.gateway() {
            return Err(HypervisorError::Validation(format!(
                "{} address {} is the gateway",
                label, addr
            )));
        }
        Ok(addr)
    }

    /// DHCP range for a spec: the explicit one when given, otherwise the
    /// subnet default.
    fn dhcp_range(spec: &NetworkSpec, subnet: &Subnet) -> Result<Option<DhcpRange>> {
        if !spec.dhcp {
            return Ok(None);
        }
        let (default_start, default_end) = subnet.default_dhcp_range();
        let start = match &spec.dhcp_start {
            Some(s) => Self::parse_host(subnet, "DHCP start", s)?,
            None => default_start,
        };
        let end = match &spec.dhcp_end {
            Some(e) => Self::parse_host(subnet, "DHCP end", e)?,
            None => default_end,
        };
        if u32::from(start) > u32::from(end) {
            return Err(HypervisorError::Validation(format!(
                "DHCP range start {} is after end {}",
                start, end
            )));
        }
        Ok(Some(DhcpRange {
            start: start.to_string(),
            end: end.to_string(),
        }))
    }

    /// Define, optionally mark autostart, and start a new network.
    #[instrument(skip(self, spec), fields(network = %spec.name))]
    pub async fn create_network(&self, spec: NetworkSpec) -> Result<NetworkOutcome> {
        validate_name(&spec.name, MAX_NETWORK_NAME)?;
        let subnet = Subnet::parse(&spec.subnet)?;
        let dhcp_range = Self::dhcp_range(&spec, &subnet)?;

        if self.inspector.network_exists(&spec.name).await? {
            return Err(HypervisorError::already_exists(ResourceKind::Network, &spec.name));
        }

        let bridge = bridge_name(&spec.name);
        let desc = NetworkDescriptor {
            name: spec.name.clone(),
            uuid: None,
            bridge: Some(bridge.clone()),
            forward_mode: spec.forward_mode.libvirt_mode().map(str::to_string),
            ip_address: Some(subnet.gateway().to_string()),
            prefix: Some(subnet.prefix()),
            dhcp_range: dhcp_range.clone(),
        };
        let xml = NetworkXmlBuilder::new(&desc).build();

        let backend = self.conn.get()?;
        backend.define_network(&xml).await?;
        if spec.autostart {
            backend.set_network_autostart(&spec.name, true).await?;
        }
        if let Err(e) = backend.start_network(&spec.name).await {
            // Leave no half-created network behind
            if let Err(undo) = backend.undefine_network(&spec.name).await {
                warn!(error = %undo, "Failed to undefine network after start failure");
            }
            return Err(e);
        }

        let active = backend.network_runtime(&spec.name).await?.active;
        info!(subnet = %subnet, bridge = %bridge, "Network created");

        Ok(NetworkOutcome {
            name: spec.name,
            subnet: subnet.to_string(),
            gateway: subnet.gateway().to_string(),
            netmask: subnet.netmask().to_string(),
            bridge,
            forward_mode: spec.forward_mode,
            dhcp_range,
            autostart: spec.autostart,
            active,
        })
    }

    /// Start a network. Already active is a no-op.
    #[instrument(skip(self))]
    pub async fn start_network(&self, name: &str) -> Result<NetworkStateOutcome> {
        let backend = self.conn.get()?;
        let runtime = backend.network_runtime(name).await?;
        if runtime.active {
            return Ok(NetworkStateOutcome {
                network: name.to_string(),
                action: "start".to_string(),
                active: true,
                changed: false,
                affected_vms: Vec::new(),
            });
        }

        backend.start_network(name).await?;
        info!("Network started");
        Ok(NetworkStateOutcome {
            network: name.to_string(),
            action: "start".to_string(),
            active: true,
            changed: true,
            affected_vms: Vec::new(),
        })
    }

    /// Stop a network. Already inactive is a no-op.
    ///
    /// Stopping is allowed while running VMs use the network; they lose
    /// connectivity and are listed in the outcome.
    #[instrument(skip(self))]
    pub async fn stop_network(&self, name: &str) -> Result<NetworkStateOutcome> {
        let backend = self.conn.get()?;
        let runtime = backend.network_runtime(name).await?;
        if !runtime.active {
            return Ok(NetworkStateOutcome {
                network: name.to_string(),
                action: "stop".to_string(),
                active: false,
                changed: false,
                affected_vms: Vec::new(),
            });
        }

        let affected_vms = self.inspector.vms_using_network(name).await.unwrap_or_else(|e| {
            warn!(error = %e, "Could not determine VMs using network");
            Vec::new()
        });
        if !affected_vms.is_empty() {
            warn!(vms = ?affected_vms, "Stopping network breaks connectivity of running VMs");
        }

        backend.stop_network(name).await?;
        info!("Network stopped");
        Ok(NetworkStateOutcome {
            network: name.to_string(),
            action: "stop".to_string(),
            active: false,
            changed: true,
            affected_vms,
        })
    }

    /// Undefine an inactive network.
    #[instrument(skip(self))]
    pub async fn delete_network(&self, name: &str) -> Result<NetworkStateOutcome> {
        let backend = self.conn.get()?;
        let runtime = backend.network_runtime(name).await?;
        if runtime.active {
            return Err(HypervisorError::PreconditionFailed(format!(
                "network '{}' is active; stop it before deleting",
                name
            )));
        }

        backend.undefine_network(name).await?;
        info!("Network deleted");
        Ok(NetworkStateOutcome {
            network: name.to_string(),
            action: "delete".to_string(),
            active: false,
            changed: true,
            affected_vms: Vec::new(),
        })
    }

    /// Hot-plug a NIC. Applies to the persistent definition always and to
    /// the running instance when the VM is active.
    #[instrument(skip(self, spec), fields(network = %spec.network))]
    pub async fn attach_interface(&self, vm: &str, spec: InterfaceSpec) -> Result<InterfaceOutcome> {
        let mac = match &spec.mac {
            Some(mac) => normalize_mac(mac)?,
            None => generate_mac_address(),
        };
        if spec.network.trim().is_empty() {
            return Err(HypervisorError::Validation("network name must not be empty".into()));
        }

        let runtime = self.inspector.vm_state(vm).await?;
        if spec.kind == AttachmentKind::Network && !self.inspector.network_exists(&spec.network).await? {
            return Err(HypervisorError::not_found(ResourceKind::Network, &spec.network));
        }

        let scope = DeviceScope::for_active(runtime.active);
        let xml = interface_xml(spec.kind.as_str(), &spec.network, Some(&mac), Some(&spec.model));
        self.conn.get()?.attach_device(vm, &xml, scope).await?;

        info!(mac = %mac, live = scope.live, "Interface attached");
        Ok(InterfaceOutcome {
            vm: vm.to_string(),
            mac,
            network: Some(spec.network),
            model: Some(spec.model),
            live: scope.live,
            config: scope.config,
        })
    }

    /// Unplug the NIC whose MAC matches (case-insensitive).
    #[instrument(skip(self))]
    pub async fn detach_interface(&self, vm: &str, mac: &str) -> Result<InterfaceOutcome> {
        let runtime = self.inspector.vm_state(vm).await?;
        let desc = self.inspector.domain(vm).await?;

        let iface = desc
            .interfaces
            .into_iter()
            .find(|i| i.mac.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(mac.trim())))
            .ok_or_else(|| HypervisorError::not_found(ResourceKind::Interface, mac))?;

        let scope = DeviceScope::for_active(runtime.active);
        self.conn.get()?.detach_device(vm, &iface.xml, scope).await?;

        info!(mac = %mac, live = scope.live, "Interface detached");
        Ok(InterfaceOutcome {
            vm: vm.to_string(),
            mac: iface.mac.unwrap_or_else(|| mac.to_string()),
            network: iface.source,
            model: iface.model,
            live: scope.live,
            config: scope.config,
        })
    }
}
