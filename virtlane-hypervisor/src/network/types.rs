//! Network types for virtual network management and interface hot-plug.

use serde::{Deserialize, Serialize};

use crate::types::{AttachmentKind, DhcpRange};

/// External connectivity policy of a virtual network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// Guests reach the outside through host NAT
    #[default]
    Nat,
    /// Routed without NAT
    Route,
    /// No external connectivity
    Isolated,
}

impl ForwardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardMode::Nat => "nat",
            ForwardMode::Route => "route",
            ForwardMode::Isolated => "isolated",
        }
    }

    /// Value for `<forward mode=...>`; isolated networks omit the element.
    pub fn libvirt_mode(&self) -> Option<&'static str> {
        match self {
            ForwardMode::Isolated => None,
            other => Some(other.as_str()),
        }
    }
}

impl std::str::FromStr for ForwardMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nat" => Ok(ForwardMode::Nat),
            "route" => Ok(ForwardMode::Route),
            "isolated" | "none" => Ok(ForwardMode::Isolated),
            other => Err(format!("unknown forward mode '{}'", other)),
        }
    }
}

/// Description of a virtual network to create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    /// IPv4 subnet in CIDR form
    pub subnet: String,
    /// Serve DHCP on the network
    pub dhcp: bool,
    /// Explicit DHCP range start; derived from the subnet when absent
    pub dhcp_start: Option<String>,
    pub dhcp_end: Option<String>,
    pub forward_mode: ForwardMode,
    /// Start on host boot
    pub autostart: bool,
}

impl NetworkSpec {
    pub fn new(name: impl Into<String>, subnet: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subnet: subnet.into(),
            dhcp: true,
            dhcp_start: None,
            dhcp_end: None,
            forward_mode: ForwardMode::Nat,
            autostart: true,
        }
    }

    pub fn with_dhcp(mut self, enabled: bool) -> Self {
        self.dhcp = enabled;
        self
    }

    pub fn with_dhcp_range(mut self, start: impl Into<String>, end: impl Into<String>) -> Self {
        self.dhcp_start = Some(start.into());
        self.dhcp_end = Some(end.into());
        self
    }

    pub fn with_forward_mode(mut self, mode: ForwardMode) -> Self {
        self.forward_mode = mode;
        self
    }

    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }
}

/// Result of creating a network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkOutcome {
    pub name: String,
    pub subnet: String,
    pub gateway: String,
    pub netmask: String,
    pub bridge: String,
    pub forward_mode: ForwardMode,
    pub dhcp_range: Option<DhcpRange>,
    pub autostart: bool,
    pub active: bool,
}

/// Result of starting, stopping or deleting a network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStateOutcome {
    pub network: String,
    pub action: String,
    pub active: bool,
    /// `false` when the network was already in the requested state
    pub changed: bool,
    /// Running VMs whose connectivity the change affects
    pub affected_vms: Vec<String>,
}

/// NIC to hot-plug into a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSpec {
    /// Source network or bridge
    pub network: String,
    pub kind: AttachmentKind,
    pub model: String,
    /// Generated when absent
    pub mac: Option<String>,
}

impl InterfaceSpec {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            kind: AttachmentKind::Network,
            model: "virtio".to_string(),
            mac: None,
        }
    }

    pub fn with_kind(mut self, kind: AttachmentKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }
}

/// Result of attaching or detaching a NIC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceOutcome {
    pub vm: String,
    pub mac: String,
    pub network: Option<String>,
    pub model: Option<String>,
    /// Applied to the running instance
    pub live: bool,
    /// Applied to the persistent definition
    pub config: bool,
}
