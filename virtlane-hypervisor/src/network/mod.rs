//! Virtual network module.
//!
//! This module provides:
//! - Subnet arithmetic (gateway and default DHCP range derivation)
//! - Network create/start/stop/delete against the hypervisor
//! - NIC hot-plug and unplug on running or stopped VMs

mod manager;
pub mod subnet;
mod types;

pub use manager::{generate_mac_address, Networks};
pub use subnet::Subnet;
pub use types::*;
