//! Command-line argument parsing.

use clap::{Args as ClapArgs, Parser, Subcommand};

use virtlane_hypervisor::{ForwardMode, GraphicsMode};

/// virtlane - VM lifecycle and resource orchestration
#[derive(Parser, Debug)]
#[command(name = "virtlane")]
#[command(about = "virtlane - VM lifecycle and resource orchestration for libvirt hosts")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Hypervisor connection URI (e.g. qemu:///system, qemu+ssh://root@host/system)
    #[arg(long, env = "VIRTLANE_URI", global = true)]
    pub uri: Option<String>,

    /// Enable development mode (in-memory hypervisor)
    #[arg(long, global = true)]
    pub dev: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "VIRTLANE_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Directory for new disk images
    #[arg(long, env = "VIRTLANE_DISK_DIR", global = true)]
    pub disk_dir: Option<String>,

    /// Extra directory searched for install media
    #[arg(long, env = "VIRTLANE_ISO_DIR", global = true)]
    pub iso_dir: Option<String>,

    /// Network new VMs attach to when none is given
    #[arg(long, env = "VIRTLANE_DEFAULT_NETWORK", global = true)]
    pub default_network: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Virtual machines
    Vm {
        #[command(subcommand)]
        command: VmCommand,
    },
    /// Virtual networks and VM interfaces
    Net {
        #[command(subcommand)]
        command: NetCommand,
    },
    /// VM snapshots
    Snap {
        #[command(subcommand)]
        command: SnapCommand,
    },
    /// Install media and OS variants
    Media {
        #[command(subcommand)]
        command: MediaCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum VmCommand {
    /// List all VMs
    List,
    /// Show one VM
    Info { name: String },
    /// Start a VM
    Start { name: String },
    /// Stop a VM (ACPI shutdown unless --force)
    Stop {
        name: String,
        /// Power off immediately
        #[arg(long)]
        force: bool,
        /// Wait up to SECS for the guest to shut off
        #[arg(long, value_name = "SECS", conflicts_with = "force")]
        wait: Option<u64>,
    },
    /// Reboot a running VM
    Reboot { name: String },
    /// Create a VM with virt-install
    Create(CreateVmArgs),
    /// Clone a shut-off VM with virt-clone
    Clone { source: String, name: String },
    /// Remove a shut-off VM's definition
    Delete {
        name: String,
        /// Also delete its disk images
        #[arg(long)]
        remove_storage: bool,
    },
}

#[derive(ClapArgs, Debug)]
pub struct CreateVmArgs {
    pub name: String,

    /// Memory in MiB
    #[arg(long)]
    pub memory: Option<u64>,

    #[arg(long)]
    pub vcpus: Option<u32>,

    /// Disk size in GiB
    #[arg(long)]
    pub disk_size: Option<u64>,

    /// Install from this ISO (boots from disk when absent)
    #[arg(long)]
    pub iso: Option<String>,

    /// Disk image path (default: <disk_dir>/<name>.qcow2)
    #[arg(long)]
    pub disk_path: Option<String>,

    #[arg(long, default_value = "generic")]
    pub os_variant: String,

    /// Virtual network to attach
    #[arg(long, conflicts_with = "bridge")]
    pub network: Option<String>,

    /// Host bridge to attach instead of a virtual network
    #[arg(long)]
    pub bridge: Option<String>,

    /// vnc, spice or none
    #[arg(long, default_value = "vnc")]
    pub graphics: GraphicsMode,
}

#[derive(Subcommand, Debug)]
pub enum NetCommand {
    /// List virtual networks
    List,
    /// Show one network, including its XML
    Info { name: String },
    /// Define and start a network
    Create {
        name: String,
        /// IPv4 subnet, e.g. 10.10.10.0/24
        subnet: String,
        /// Disable the DHCP service
        #[arg(long)]
        no_dhcp: bool,
        #[arg(long, requires = "dhcp_end")]
        dhcp_start: Option<String>,
        #[arg(long, requires = "dhcp_start")]
        dhcp_end: Option<String>,
        /// nat, route or isolated
        #[arg(long, default_value = "nat")]
        forward: ForwardMode,
        /// Do not start with the host
        #[arg(long)]
        no_autostart: bool,
    },
    Start { name: String },
    Stop { name: String },
    /// Remove a stopped network
    Delete { name: String },
    /// Hot-plug a NIC into a VM
    Attach {
        vm: String,
        /// Network (or bridge with --bridge) to connect to
        network: String,
        /// Treat the source as a host bridge
        #[arg(long)]
        bridge: bool,
        #[arg(long, default_value = "virtio")]
        model: String,
        #[arg(long)]
        mac: Option<String>,
    },
    /// Remove a NIC from a VM by MAC address
    Detach { vm: String, mac: String },
    /// List Linux bridges on the host
    Bridges,
}

#[derive(Subcommand, Debug)]
pub enum SnapCommand {
    List { vm: String },
    Create {
        vm: String,
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Restore a VM to a snapshot (discards later changes)
    Revert { vm: String, name: String },
    Delete { vm: String, name: String },
}

#[derive(Subcommand, Debug)]
pub enum MediaCommand {
    /// ISO images in the media directories
    Isos,
    /// OS variant ids known to virt-install
    OsVariants,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_stop_force_conflicts_with_wait() {
        assert!(Args::try_parse_from(["virtlane", "vm", "stop", "web01", "--force", "--wait", "30"]).is_err());

        let args = Args::try_parse_from(["virtlane", "vm", "stop", "web01", "--wait", "30"]).unwrap();
        match args.command {
            Command::Vm { command: VmCommand::Stop { wait, force, .. } } => {
                assert_eq!(wait, Some(30));
                assert!(!force);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_create_parses_enums() {
        let args = Args::try_parse_from([
            "virtlane", "vm", "create", "web01", "--graphics", "spice", "--bridge", "br0",
        ])
        .unwrap();
        match args.command {
            Command::Vm { command: VmCommand::Create(create) } => {
                assert_eq!(create.graphics, GraphicsMode::Spice);
                assert_eq!(create.bridge.as_deref(), Some("br0"));
                assert_eq!(create.os_variant, "generic");
            }
            other => panic!("unexpected command: {:?}", other),
        }

        assert!(Args::try_parse_from(["virtlane", "vm", "create", "x", "--graphics", "rdp"]).is_err());
        assert!(Args::try_parse_from(["virtlane", "vm", "create", "x", "--network", "a", "--bridge", "b"]).is_err());
    }

    #[test]
    fn test_net_create_range_needs_both_ends() {
        assert!(Args::try_parse_from([
            "virtlane", "net", "create", "lab1", "10.10.10.0/24", "--dhcp-start", "10.10.10.10",
        ])
        .is_err());
    }
}
