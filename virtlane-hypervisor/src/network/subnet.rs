//! IPv4 subnet arithmetic for virtual network definitions.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{HypervisorError, Result};

/// Dotted netmask for a prefix length.
pub fn netmask(prefix: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::MAX.checked_shl(32 - u32::from(prefix.min(32))).unwrap_or(0))
}

/// An IPv4 subnet with at least two usable host addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// Parse `a.b.c.d/p`. Host bits are masked off, so `10.0.0.7/24` is
    /// accepted as `10.0.0.0/24`.
    pub fn parse(cidr: &str) -> Result<Self> {
        let (addr, prefix) = cidr
            .trim()
            .split_once('/')
            .ok_or_else(|| HypervisorError::Validation(format!("subnet '{}' is not in CIDR form", cidr)))?;

        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| HypervisorError::Validation(format!("invalid subnet address '{}'", addr)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| HypervisorError::Validation(format!("invalid prefix length '{}'", prefix)))?;

        // /31 and /32 leave no room for a gateway plus DHCP clients
        if prefix > 30 {
            return Err(HypervisorError::Validation(format!(
                "prefix /{} is too small for a virtual network (max /30)",
                prefix
            )));
        }

        let network = Ipv4Addr::from(u32::from(addr) & u32::from(netmask(prefix)));
        Ok(Self { network, prefix })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn netmask(&self) -> Ipv4Addr {
        netmask(self.prefix)
    }

    /// Number of usable host addresses.
    pub fn host_count(&self) -> u64 {
        (1u64 << (32 - u32::from(self.prefix))) - 2
    }

    /// The `index`-th usable host address (0-based).
    pub fn host(&self, index: u64) -> Option<Ipv4Addr> {
        if index >= self.host_count() {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network) + 1 + index as u32))
    }

    /// First usable host.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    /// Whether `addr` is a usable host of this subnet.
    pub fn contains_host(&self, addr: Ipv4Addr) -> bool {
        let offset = u32::from(addr).wrapping_sub(u32::from(self.network)) as u64;
        u32::from(addr) >= u32::from(self.network) && offset >= 1 && offset <= self.host_count()
    }

    /// Default DHCP range: from roughly a quarter into the host range (never
    /// the gateway) up to the last usable host. A heuristic, not a sizing rule.
    pub fn default_dhcp_range(&self) -> (Ipv4Addr, Ipv4Addr) {
        let n = self.host_count();
        let start = (n / 4).max(1);
        let first = Ipv4Addr::from(u32::from(self.network) + 1 + start as u32);
        let last = Ipv4Addr::from(u32::from(self.network) + n as u32);
        (first, last)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slash_24() {
        let s = Subnet::parse("10.10.10.0/24").unwrap();
        assert_eq!(s.gateway(), Ipv4Addr::new(10, 10, 10, 1));
        assert_eq!(s.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(s.host_count(), 254);

        let (start, end) = s.default_dhcp_range();
        assert_eq!(start, Ipv4Addr::new(10, 10, 10, 64));
        assert_eq!(end, Ipv4Addr::new(10, 10, 10, 254));
    }

    #[test]
    fn test_host_bits_ignored() {
        let s = Subnet::parse("192.168.5.77/24").unwrap();
        assert_eq!(s.to_string(), "192.168.5.0/24");
    }

    #[test]
    fn test_slash_30_range_skips_gateway() {
        let s = Subnet::parse("172.16.0.0/30").unwrap();
        assert_eq!(s.gateway(), Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(s.default_dhcp_range(), (Ipv4Addr::new(172, 16, 0, 2), Ipv4Addr::new(172, 16, 0, 2)));
    }

    #[test]
    fn test_contains_host() {
        let s = Subnet::parse("10.0.0.0/24").unwrap();
        assert!(s.contains_host(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(s.contains_host(Ipv4Addr::new(10, 0, 0, 254)));
        assert!(!s.contains_host(Ipv4Addr::new(10, 0, 0, 0)));
        assert!(!s.contains_host(Ipv4Addr::new(10, 0, 0, 255)));
        assert!(!s.contains_host(Ipv4Addr::new(10, 0, 1, 1)));
        assert!(!s.contains_host(Ipv4Addr::new(9, 255, 255, 255)));
    }

    #[test]
    fn test_invalid_subnets() {
        for bad in ["10.0.0.0", "10.0.0.0/31", "10.0.0.300/24", "10.0.0.0/x", "fe80::/64"] {
            assert!(
                matches!(Subnet::parse(bad), Err(HypervisorError::Validation(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_netmask_edges() {
        assert_eq!(netmask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(netmask(16), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(netmask(32), Ipv4Addr::new(255, 255, 255, 255));
    }
}
