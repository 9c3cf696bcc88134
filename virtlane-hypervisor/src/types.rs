//! Type definitions for VM, network and snapshot records, creation specs and
//! operation outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// VM STATE
// =============================================================================

/// Runtime state of a VM as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VmState {
    #[default]
    NoState,
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    Suspended,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::NoState => "no-state",
            VmState::Running => "running",
            VmState::Blocked => "blocked",
            VmState::Paused => "paused",
            VmState::ShuttingDown => "shutting-down",
            VmState::Shutoff => "shutoff",
            VmState::Crashed => "crashed",
            VmState::Suspended => "suspended",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime facts about a domain that are not part of its XML descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRuntime {
    pub state: VmState,
    /// Whether a live instance exists (running, paused, shutting down...)
    pub active: bool,
    /// Hypervisor-assigned runtime id, only while active
    pub id: Option<u32>,
    pub memory_kib: u64,
    pub max_memory_kib: u64,
    pub vcpus: u32,
    pub persistent: bool,
    pub autostart: bool,
}

/// Runtime facts about a virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRuntime {
    pub active: bool,
    pub autostart: bool,
    pub persistent: bool,
}

// =============================================================================
// BACKEND CALL PARAMETERS
// =============================================================================

/// Where guest IP addresses are looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSource {
    /// DHCP lease table of the virtual network
    Lease,
    /// Host ARP table
    Arp,
}

/// An address reported for one guest interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestAddress {
    pub interface: String,
    pub mac: Option<String>,
    pub addr: String,
    pub prefix: u32,
}

impl GuestAddress {
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.addr, self.prefix)
    }
}

/// Which views of a domain a device change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceScope {
    /// The running instance
    pub live: bool,
    /// The persistent definition
    pub config: bool,
}

impl DeviceScope {
    /// Config always, live only when the VM currently runs.
    pub fn for_active(active: bool) -> Self {
        Self { live: active, config: true }
    }
}

/// Extra cleanup performed when a domain definition is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UndefineFlags {
    pub managed_save: bool,
    pub snapshots_metadata: bool,
    pub nvram: bool,
}

impl UndefineFlags {
    /// Remove every piece of hypervisor-side metadata with the definition.
    pub fn all() -> Self {
        Self {
            managed_save: true,
            snapshots_metadata: true,
            nvram: true,
        }
    }
}

// =============================================================================
// DECODED DESCRIPTORS
// =============================================================================

/// Normalized view of a domain descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainDescriptor {
    pub name: String,
    pub uuid: Option<String>,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub title: Option<String>,
    pub description: Option<String>,
    /// libosinfo short id when the descriptor carries one
    pub os_variant: Option<String>,
    pub disks: Vec<DiskDevice>,
    pub interfaces: Vec<InterfaceDevice>,
}

/// A disk or cdrom device of a domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDevice {
    /// `disk`, `cdrom`, `floppy` or `lun`
    pub device: String,
    /// Backing file or block device path
    pub source: Option<String>,
    /// Guest target device (vda, sda, hdc...)
    pub target: Option<String>,
    pub bus: Option<String>,
    pub format: Option<String>,
}

impl DiskDevice {
    pub fn is_disk(&self) -> bool {
        self.device == "disk"
    }
}

/// A network interface of a domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDevice {
    /// `network`, `bridge`, `direct`, `user`...
    pub kind: String,
    pub mac: Option<String>,
    /// Source network, bridge or host device
    pub source: Option<String>,
    pub model: Option<String>,
    /// Exact serialized element, used for detach
    #[serde(skip)]
    pub xml: String,
}

/// Normalized view of a network descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub name: String,
    pub uuid: Option<String>,
    pub bridge: Option<String>,
    /// `nat`, `route`, `bridge`... `None` means isolated
    pub forward_mode: Option<String>,
    pub ip_address: Option<String>,
    pub prefix: Option<u8>,
    pub dhcp_range: Option<DhcpRange>,
}

/// Inclusive DHCP lease range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: String,
    pub end: String,
}

/// Normalized view of a snapshot descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub created_at: Option<i64>,
    /// Domain state at capture time
    pub state: Option<String>,
    /// Whether guest memory was captured with the disks
    pub has_memory: bool,
}

// =============================================================================
// INSPECTOR RECORDS
// =============================================================================

/// Partial result of an enumeration: entries that could be read plus one
/// warning per entry that could not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub warnings: Vec<String>,
}

impl<T> Default for Listing<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// One row of the VM listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    pub name: String,
    pub uuid: Option<String>,
    pub state: VmState,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub autostart: bool,
    pub networks: Vec<String>,
    pub ip_addresses: Vec<String>,
}

/// Full detail of one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDetail {
    pub name: String,
    pub uuid: Option<String>,
    pub id: Option<u32>,
    pub state: VmState,
    pub persistent: bool,
    pub autostart: bool,
    pub memory_mib: u64,
    pub max_memory_mib: u64,
    pub vcpus: u32,
    pub title: Option<String>,
    pub description: Option<String>,
    pub os_variant: Option<String>,
    pub disks: Vec<DiskDevice>,
    pub interfaces: Vec<InterfaceDevice>,
    pub ip_addresses: Vec<String>,
}

/// One row of the network listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub name: String,
    pub uuid: Option<String>,
    pub active: bool,
    pub autostart: bool,
    pub persistent: bool,
    pub bridge: Option<String>,
    pub forward_mode: String,
    /// `address/prefix` of the network's IP block
    pub subnet: Option<String>,
    pub dhcp_range: Option<DhcpRange>,
}

/// Full detail of one network, including its raw descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDetail {
    #[serde(flatten)]
    pub summary: NetworkSummary,
    pub xml: String,
}

/// A Linux bridge device present on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBridge {
    pub name: String,
    pub state: Option<String>,
    pub mac: Option<String>,
}

// =============================================================================
// VM CREATION
// =============================================================================

/// How the first NIC of a new VM is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    /// A libvirt virtual network
    #[default]
    Network,
    /// A host bridge device
    Bridge,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Network => "network",
            AttachmentKind::Bridge => "bridge",
        }
    }
}

/// Network or bridge a NIC attaches to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub name: String,
    pub kind: AttachmentKind,
}

impl NetworkAttachment {
    pub fn network(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AttachmentKind::Network,
        }
    }

    pub fn bridge(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AttachmentKind::Bridge,
        }
    }
}

/// Boot device of a newly created VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    /// Install media
    Cdrom,
    /// Pre-populated disk image
    Disk,
}

/// Display attached to a new VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsMode {
    #[default]
    Vnc,
    Spice,
    None,
}

impl GraphicsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphicsMode::Vnc => "vnc",
            GraphicsMode::Spice => "spice",
            GraphicsMode::None => "none",
        }
    }
}

impl std::str::FromStr for GraphicsMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vnc" => Ok(GraphicsMode::Vnc),
            "spice" => Ok(GraphicsMode::Spice),
            "none" => Ok(GraphicsMode::None),
            other => Err(format!("unknown graphics mode '{}'", other)),
        }
    }
}

/// Description of a VM to build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    /// Memory in MiB
    pub memory_mib: u64,
    pub vcpus: u32,
    /// Disk size in GiB
    pub disk_gib: u64,
    /// Install media; when set the VM boots from it onto a fresh disk
    pub install_media: Option<String>,
    /// Custom disk image path; defaults to `<disk_dir>/<name>.qcow2`
    pub disk_path: Option<String>,
    pub os_variant: String,
    pub network: NetworkAttachment,
    pub graphics: GraphicsMode,
}

impl VmSpec {
    /// Create a spec with default sizing (2 GiB, 2 vCPUs, 40 GiB disk).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory_mib: 2048,
            vcpus: 2,
            disk_gib: 40,
            install_media: None,
            disk_path: None,
            os_variant: "generic".to_string(),
            network: NetworkAttachment::network("default"),
            graphics: GraphicsMode::Vnc,
        }
    }

    pub fn with_memory(mut self, memory_mib: u64) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    pub fn with_disk_size(mut self, disk_gib: u64) -> Self {
        self.disk_gib = disk_gib;
        self
    }

    pub fn with_install_media(mut self, iso: impl Into<String>) -> Self {
        self.install_media = Some(iso.into());
        self
    }

    pub fn with_disk_path(mut self, path: impl Into<String>) -> Self {
        self.disk_path = Some(path.into());
        self
    }

    pub fn with_os_variant(mut self, variant: impl Into<String>) -> Self {
        self.os_variant = variant.into();
        self
    }

    pub fn with_network(mut self, network: NetworkAttachment) -> Self {
        self.network = network;
        self
    }

    pub fn with_graphics(mut self, graphics: GraphicsMode) -> Self {
        self.graphics = graphics;
        self
    }

    pub fn boot_device(&self) -> BootDevice {
        if self.install_media.is_some() {
            BootDevice::Cdrom
        } else {
            BootDevice::Disk
        }
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Lifecycle action that was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Start,
    Shutdown,
    ForceStop,
    Reboot,
    Delete,
}

/// Result of a lifecycle request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleOutcome {
    pub vm: String,
    pub action: LifecycleAction,
    pub previous_state: VmState,
    /// `false` when the request was an idempotent no-op
    pub changed: bool,
    pub note: String,
}

/// Result of deleting a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub vm: String,
    pub removed_storage: Vec<String>,
    /// `path: error` for every disk that could not be removed
    pub storage_errors: Vec<String>,
}

/// Result of building a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionOutcome {
    pub name: String,
    pub uuid: Option<String>,
    pub disk_path: String,
    pub disk_gib: u64,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub network: NetworkAttachment,
    pub boot: BootDevice,
    pub graphics: GraphicsMode,
    pub os_variant: String,
    pub install_media: Option<String>,
}

/// Result of cloning a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneOutcome {
    pub source: String,
    pub name: String,
    pub uuid: Option<String>,
    pub macs: Vec<String>,
    pub disks: Vec<String>,
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// What a snapshot captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Disks plus guest memory; reverts to a clean running state
    DiskAndMemory,
    /// Disks only; reverting a running VM to it is crash-consistent
    DiskOnly,
}

impl SnapshotKind {
    pub fn from_memory(has_memory: bool) -> Self {
        if has_memory {
            SnapshotKind::DiskAndMemory
        } else {
            SnapshotKind::DiskOnly
        }
    }
}

/// One snapshot of a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// VM state at capture time
    pub state: Option<String>,
    pub kind: Option<SnapshotKind>,
}

/// Result of creating a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotOutcome {
    pub vm: String,
    pub snapshot: String,
    pub description: String,
    pub kind: SnapshotKind,
    pub vm_state: VmState,
}
