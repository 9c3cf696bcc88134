//! Resource inspector.
//!
//! Read-only queries that turn hypervisor descriptors into normalized records.
//! Nothing is cached: every call re-reads the hypervisor, since other tools
//! may change it at any time. Enumerations never fail because one entry is
//! unreadable; the entry is skipped and reported in [`Listing::warnings`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::connection::Connection;
use crate::error::{HypervisorError, Result};
use crate::network::Subnet;
use crate::runner::{CommandRunner, CommandSpec};
use crate::types::*;

pub struct Inspector {
    conn: Arc<Connection>,
}

impl Inspector {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    // =========================================================================
    // VMs
    // =========================================================================

    /// Summaries of every VM, ordered by name.
    #[instrument(skip(self))]
    pub async fn list_vms(&self) -> Result<Listing<VmSummary>> {
        let backend = self.conn.get()?;
        let mut names = backend.list_domains().await?;
        names.sort();

        let mut listing = Listing::default();
        for name in names {
            match self.summarize(&name).await {
                Ok(summary) => listing.items.push(summary),
                Err(e) => {
                    warn!(vm = %name, error = %e, "Skipping unreadable VM");
                    listing.warnings.push(format!("{}: {}", name, e));
                }
            }
        }
        debug!(count = listing.items.len(), skipped = listing.warnings.len(), "Listed VMs");
        Ok(listing)
    }

    async fn summarize(&self, name: &str) -> Result<VmSummary> {
        let runtime = self.vm_state(name).await?;
        let desc = self.domain(name).await?;
        let ip_addresses = self.ip_addresses(name, runtime.active).await;

        Ok(VmSummary {
            name: desc.name,
            uuid: desc.uuid,
            state: runtime.state,
            memory_mib: runtime.memory_kib / 1024,
            vcpus: runtime.vcpus,
            autostart: runtime.autostart,
            networks: desc.interfaces.into_iter().filter_map(|i| i.source).collect(),
            ip_addresses,
        })
    }

    /// Full detail of one VM.
    #[instrument(skip(self))]
    pub async fn get_vm(&self, name: &str) -> Result<VmDetail> {
        let runtime = self.vm_state(name).await?;
        let desc = self.domain(name).await?;
        let ip_addresses = self.ip_addresses(name, runtime.active).await;

        Ok(VmDetail {
            name: desc.name,
            uuid: desc.uuid,
            id: runtime.id,
            state: runtime.state,
            persistent: runtime.persistent,
            autostart: runtime.autostart,
            memory_mib: runtime.memory_kib / 1024,
            max_memory_mib: runtime.max_memory_kib / 1024,
            vcpus: runtime.vcpus,
            title: desc.title,
            description: desc.description,
            os_variant: desc.os_variant,
            disks: desc.disks,
            interfaces: desc.interfaces,
            ip_addresses,
        })
    }

    /// Current runtime state, used for precondition checks.
    pub async fn vm_state(&self, name: &str) -> Result<DomainRuntime> {
        self.conn.get()?.domain_runtime(name).await
    }

    /// Decoded current descriptor of a VM.
    pub async fn domain(&self, name: &str) -> Result<DomainDescriptor> {
        let xml = self.conn.get()?.domain_xml(name).await?;
        self.conn.decoder().decode_domain(&xml)
    }

    /// Whether a VM of this name is defined.
    pub async fn vm_exists(&self, name: &str) -> Result<bool> {
        match self.vm_state(name).await {
            Ok(_) => Ok(true),
            Err(HypervisorError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Best-effort guest IP discovery as `addr/prefix`.
    ///
    /// Only running VMs are queried. The lease table is tried first and the
    /// host ARP table second; when both fail or come back empty the result is
    /// empty rather than an error.
    pub async fn ip_addresses(&self, name: &str, active: bool) -> Vec<String> {
        if !active {
            return Vec::new();
        }
        let Ok(backend) = self.conn.get() else {
            return Vec::new();
        };

        for source in [AddressSource::Lease, AddressSource::Arp] {
            match backend.interface_addresses(name, source).await {
                Ok(addrs) if !addrs.is_empty() => {
                    return addrs.iter().map(GuestAddress::cidr).collect();
                }
                Ok(_) => debug!(vm = %name, source = ?source, "No addresses reported"),
                Err(e) => debug!(vm = %name, source = ?source, error = %e, "Address lookup failed"),
            }
        }
        Vec::new()
    }

    /// Running VMs with a NIC on `network`.
    pub async fn vms_using_network(&self, network: &str) -> Result<Vec<String>> {
        let listing = self.list_vms().await?;
        Ok(listing
            .items
            .into_iter()
            .filter(|vm| vm.state == VmState::Running && vm.networks.iter().any(|n| n == network))
            .map(|vm| vm.name)
            .collect())
    }

    // =========================================================================
    // Networks
    // =========================================================================

    /// Summaries of every network, ordered by name.
    #[instrument(skip(self))]
    pub async fn list_networks(&self) -> Result<Listing<NetworkSummary>> {
        let backend = self.conn.get()?;
        let mut names = backend.list_networks().await?;
        names.sort();

        let mut listing = Listing::default();
        for name in names {
            match self.network(&name).await {
                Ok((runtime, desc)) => listing.items.push(Self::network_summary(runtime, desc)),
                Err(e) => {
                    warn!(network = %name, error = %e, "Skipping unreadable network");
                    listing.warnings.push(format!("{}: {}", name, e));
                }
            }
        }
        Ok(listing)
    }

    /// Full detail of one network, including its raw descriptor.
    #[instrument(skip(self))]
    pub async fn get_network(&self, name: &str) -> Result<NetworkDetail> {
        let backend = self.conn.get()?;
        let runtime = backend.network_runtime(name).await?;
        let xml = backend.network_xml(name).await?;
        let desc = self.conn.decoder().decode_network(&xml)?;
        Ok(NetworkDetail {
            summary: Self::network_summary(runtime, desc),
            xml,
        })
    }

    pub async fn network(&self, name: &str) -> Result<(NetworkRuntime, NetworkDescriptor)> {
        let backend = self.conn.get()?;
        let runtime = backend.network_runtime(name).await?;
        let xml = backend.network_xml(name).await?;
        Ok((runtime, self.conn.decoder().decode_network(&xml)?))
    }

    pub async fn network_exists(&self, name: &str) -> Result<bool> {
        match self.conn.get()?.network_runtime(name).await {
            Ok(_) => Ok(true),
            Err(HypervisorError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn network_summary(runtime: NetworkRuntime, desc: NetworkDescriptor) -> NetworkSummary {
        let subnet = match (&desc.ip_address, desc.prefix) {
            (Some(ip), Some(prefix)) => {
                let cidr = format!("{}/{}", ip, prefix);
                Some(Subnet::parse(&cidr).map(|s| s.to_string()).unwrap_or(cidr))
            }
            _ => None,
        };
        NetworkSummary {
            name: desc.name,
            uuid: desc.uuid,
            active: runtime.active,
            autostart: runtime.autostart,
            persistent: runtime.persistent,
            bridge: desc.bridge,
            forward_mode: desc.forward_mode.unwrap_or_else(|| "isolated".to_string()),
            subnet,
            dhcp_range: desc.dhcp_range,
        }
    }

    // =========================================================================
    // Host
    // =========================================================================

    /// Linux bridges on the host, via `ip -j link show type bridge`.
    #[instrument(skip(self, runner))]
    pub async fn list_host_bridges(
        &self,
        runner: &dyn CommandRunner,
        timeout: Duration,
    ) -> Listing<HostBridge> {
        let spec = CommandSpec::new("ip", timeout).args(["-j", "link", "show", "type", "bridge"]);

        let mut listing = Listing::default();
        let output = match runner.run(spec).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                let msg = format!("ip exited with {}: {}", output.exit_code, output.stderr.trim());
                warn!("{}", msg);
                listing.warnings.push(msg);
                return listing;
            }
            Err(e) => {
                warn!(error = %e, "Bridge listing failed");
                listing.warnings.push(e.to_string());
                return listing;
            }
        };

        match serde_json::from_str::<Vec<serde_json::Value>>(&output.stdout) {
            Ok(links) => {
                listing.items = links
                    .iter()
                    .filter_map(|link| {
                        let name = link.get("ifname")?.as_str()?.to_string();
                        Some(HostBridge {
                            name,
                            state: link.get("operstate").and_then(|v| v.as_str()).map(str::to_string),
                            mac: link.get("address").and_then(|v| v.as_str()).map(str::to_string),
                        })
                    })
                    .collect();
                listing.items.sort_by(|a, b| a.name.cmp(&b.name));
            }
            Err(e) => listing.warnings.push(format!("unparseable ip output: {}", e)),
        }
        listing
    }
}
