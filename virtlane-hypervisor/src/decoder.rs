//! Descriptor decoding.
//!
//! Translates the hypervisor's native structured descriptors into the
//! normalized records in [`crate::types`]. Controllers only ever see those
//! records, so a backend that speaks a different descriptor format only needs
//! its own [`DescriptorDecoder`].

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{HypervisorError, Result};
use crate::types::*;

/// Maps native descriptors to normalized records.
pub trait DescriptorDecoder: Send + Sync {
    fn decode_domain(&self, xml: &str) -> Result<DomainDescriptor>;

    fn decode_network(&self, xml: &str) -> Result<NetworkDescriptor>;

    fn decode_snapshot(&self, xml: &str) -> Result<SnapshotDescriptor>;
}

// =============================================================================
// Element tree
// =============================================================================

/// Minimal owned XML element tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a document and return its root element.
    pub fn parse(xml: &str) -> Result<XmlElement> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    stack.push(Self::open(&e)?);
                }
                Ok(Event::Empty(e)) => {
                    let element = Self::open(&e)?;
                    Self::close(&mut stack, &mut root, element)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| HypervisorError::XmlError("unbalanced end tag".into()))?;
                    Self::close(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| HypervisorError::XmlError(e.to_string()))?;
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text);
                    }
                }
                Ok(Event::CData(c)) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(HypervisorError::XmlError(format!(
                        "at position {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
            }
        }

        if !stack.is_empty() {
            return Err(HypervisorError::XmlError("unexpected end of document".into()));
        }
        root.ok_or_else(|| HypervisorError::XmlError("empty document".into()))
    }

    fn open(e: &quick_xml::events::BytesStart<'_>) -> Result<XmlElement> {
        let name = std::str::from_utf8(e.name().as_ref())
            .map_err(|err| HypervisorError::XmlError(err.to_string()))?
            .to_string();
        let mut element = XmlElement::new(name);
        for attr in e.attributes() {
            let attr = attr.map_err(|err| HypervisorError::XmlError(err.to_string()))?;
            let key = std::str::from_utf8(attr.key.as_ref())
                .map_err(|err| HypervisorError::XmlError(err.to_string()))?
                .to_string();
            let value = attr
                .unescape_value()
                .map_err(|err| HypervisorError::XmlError(err.to_string()))?
                .into_owned();
            element.attributes.push((key, value));
        }
        Ok(element)
    }

    fn close(
        stack: &mut [XmlElement],
        root: &mut Option<XmlElement>,
        element: XmlElement,
    ) -> Result<()> {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None if root.is_none() => *root = Some(element),
            None => {
                return Err(HypervisorError::XmlError(
                    "multiple root elements".into(),
                ))
            }
        }
        Ok(())
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Descend through nested children by name.
    pub fn path(&self, names: &[&str]) -> Option<&XmlElement> {
        names.iter().try_fold(self, |el, name| el.child(name))
    }

    /// Trimmed text of a direct child, `None` when absent or blank.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name)
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty())
    }

    /// Serialize this element and its subtree.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            out.push_str(&format!(" {}='{}'", key, crate::xml::escape(value)));
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&crate::xml::escape(&self.text));
        for child in &self.children {
            child.write_to(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

// =============================================================================
// libvirt decoder
// =============================================================================

/// Decoder for libvirt domain, network and snapshot XML.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibvirtXmlDecoder;

impl LibvirtXmlDecoder {
    pub fn new() -> Self {
        Self
    }

    fn expect_root<'a>(root: &'a XmlElement, name: &str) -> Result<&'a XmlElement> {
        if root.name != name {
            return Err(HypervisorError::XmlError(format!(
                "expected <{}> document, found <{}>",
                name, root.name
            )));
        }
        Ok(root)
    }

    fn required_name(root: &XmlElement) -> Result<String> {
        root.child_text("name")
            .map(str::to_string)
            .ok_or_else(|| HypervisorError::XmlError(format!("<{}> without <name>", root.name)))
    }

    fn decode_disk(disk: &XmlElement) -> DiskDevice {
        let source = disk.child("source").and_then(|s| {
            ["file", "dev", "volume", "name"]
                .iter()
                .find_map(|k| s.attr(k))
                .map(str::to_string)
        });
        let target = disk.child("target");
        DiskDevice {
            device: disk.attr("device").unwrap_or("disk").to_string(),
            source,
            target: target.and_then(|t| t.attr("dev")).map(str::to_string),
            bus: target.and_then(|t| t.attr("bus")).map(str::to_string),
            format: disk
                .child("driver")
                .and_then(|d| d.attr("type"))
                .map(str::to_string),
        }
    }

    pub(crate) fn decode_interface(iface: &XmlElement) -> InterfaceDevice {
        let source = iface.child("source").and_then(|s| {
            ["network", "bridge", "dev"]
                .iter()
                .find_map(|k| s.attr(k))
                .map(str::to_string)
        });
        InterfaceDevice {
            kind: iface.attr("type").unwrap_or("network").to_string(),
            mac: iface
                .child("mac")
                .and_then(|m| m.attr("address"))
                .map(str::to_string),
            source,
            model: iface
                .child("model")
                .and_then(|m| m.attr("type"))
                .map(str::to_string),
            xml: iface.to_xml(),
        }
    }

    fn os_variant(root: &XmlElement) -> Option<String> {
        let metadata = root.child("metadata")?;
        metadata
            .children
            .iter()
            .filter(|c| c.name == "libosinfo" || c.name.ends_with(":libosinfo"))
            .flat_map(|c| c.children.iter())
            .find(|c| c.name == "os" || c.name.ends_with(":os"))
            .and_then(|os| os.attr("id"))
            .map(str::to_string)
    }
}

/// Convert a libvirt memory quantity to MiB.
pub fn memory_to_mib(value: u64, unit: Option<&str>) -> u64 {
    let bytes: u128 = match unit.unwrap_or("KiB") {
        "b" | "bytes" => value as u128,
        "KB" => value as u128 * 1_000,
        "k" | "KiB" => value as u128 * 1_024,
        "MB" => value as u128 * 1_000_000,
        "M" | "MiB" => value as u128 * 1_048_576,
        "GB" => value as u128 * 1_000_000_000,
        "G" | "GiB" => value as u128 * 1_073_741_824,
        "TB" => value as u128 * 1_000_000_000_000,
        "T" | "TiB" => value as u128 * 1_099_511_627_776,
        _ => value as u128 * 1_024,
    };
    (bytes / 1_048_576) as u64
}

/// Count the leading ones of a dotted netmask.
fn netmask_prefix(netmask: &str) -> Option<u8> {
    let mask: std::net::Ipv4Addr = netmask.parse().ok()?;
    let bits = u32::from(mask);
    // Reject non-contiguous masks
    if bits.leading_ones() + bits.trailing_zeros() != 32 {
        return None;
    }
    Some(bits.leading_ones() as u8)
}

impl DescriptorDecoder for LibvirtXmlDecoder {
    fn decode_domain(&self, xml: &str) -> Result<DomainDescriptor> {
        let doc = XmlElement::parse(xml)?;
        let root = Self::expect_root(&doc, "domain")?;

        let memory_mib = match root.child("memory") {
            Some(m) => {
                let value: u64 = m.text.trim().parse().map_err(|_| {
                    HypervisorError::XmlError(format!("invalid memory value '{}'", m.text.trim()))
                })?;
                memory_to_mib(value, m.attr("unit"))
            }
            None => 0,
        };
        let vcpus = root
            .child_text("vcpu")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let (disks, interfaces) = match root.child("devices") {
            Some(devices) => (
                devices.children_named("disk").map(Self::decode_disk).collect(),
                devices
                    .children_named("interface")
                    .map(Self::decode_interface)
                    .collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        Ok(DomainDescriptor {
            name: Self::required_name(root)?,
            uuid: root.child_text("uuid").map(str::to_string),
            memory_mib,
            vcpus,
            title: root.child_text("title").map(str::to_string),
            description: root.child_text("description").map(str::to_string),
            os_variant: Self::os_variant(root),
            disks,
            interfaces,
        })
    }

    fn decode_network(&self, xml: &str) -> Result<NetworkDescriptor> {
        let doc = XmlElement::parse(xml)?;
        let root = Self::expect_root(&doc, "network")?;

        // A bare <forward/> means NAT
        let forward_mode = root
            .child("forward")
            .map(|f| f.attr("mode").unwrap_or("nat").to_string());

        let ip = root
            .children_named("ip")
            .find(|ip| ip.attr("family").map_or(true, |f| f == "ipv4"));
        let prefix = ip.and_then(|ip| {
            ip.attr("prefix")
                .and_then(|p| p.parse().ok())
                .or_else(|| ip.attr("netmask").and_then(netmask_prefix))
        });
        let dhcp_range = ip
            .and_then(|ip| ip.path(&["dhcp", "range"]))
            .and_then(|r| match (r.attr("start"), r.attr("end")) {
                (Some(start), Some(end)) => Some(DhcpRange {
                    start: start.to_string(),
                    end: end.to_string(),
                }),
                _ => None,
            });

        Ok(NetworkDescriptor {
            name: Self::required_name(root)?,
            uuid: root.child_text("uuid").map(str::to_string),
            bridge: root
                .child("bridge")
                .and_then(|b| b.attr("name"))
                .map(str::to_string),
            forward_mode,
            ip_address: ip.and_then(|ip| ip.attr("address")).map(str::to_string),
            prefix,
            dhcp_range,
        })
    }

    fn decode_snapshot(&self, xml: &str) -> Result<SnapshotDescriptor> {
        let doc = XmlElement::parse(xml)?;
        let root = Self::expect_root(&doc, "domainsnapshot")?;

        let state = root.child_text("state").map(str::to_string);
        let has_memory = match root.child("memory").and_then(|m| m.attr("snapshot")) {
            Some(mode) => mode != "no",
            None => matches!(state.as_deref(), Some("running") | Some("paused") | Some("blocked")),
        };

        Ok(SnapshotDescriptor {
            name: Self::required_name(root)?,
            description: root.child_text("description").map(str::to_string),
            created_at: root.child_text("creationTime").and_then(|t| t.parse().ok()),
            state,
            has_memory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = r#"<domain type='kvm' id='3'>
  <name>web01</name>
  <uuid>4dea22b3-1d52-d8f3-2516-782e98ab3fa0</uuid>
  <title>Web &amp; API</title>
  <metadata>
    <libosinfo:libosinfo xmlns:libosinfo="http://libosinfo.org/xmlns/libvirt/domain/1.0">
      <libosinfo:os id="http://debian.org/debian/12"/>
    </libosinfo:libosinfo>
  </metadata>
  <memory unit='KiB'>2097152</memory>
  <vcpu placement='static'>2</vcpu>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/web01.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <source file='/iso/debian.iso'/>
      <target dev='sda' bus='sata'/>
    </disk>
    <interface type='network'>
      <mac address='52:54:00:AB:cd:01'/>
      <source network='default'/>
      <model type='virtio'/>
    </interface>
    <interface type='bridge'>
      <mac address='52:54:00:ab:cd:02'/>
      <source bridge='br0'/>
    </interface>
  </devices>
</domain>"#;

    #[test]
    fn test_decode_domain() {
        let d = LibvirtXmlDecoder.decode_domain(DOMAIN).unwrap();

        assert_eq!(d.name, "web01");
        assert_eq!(d.uuid.as_deref(), Some("4dea22b3-1d52-d8f3-2516-782e98ab3fa0"));
        assert_eq!(d.title.as_deref(), Some("Web & API"));
        assert_eq!(d.memory_mib, 2048);
        assert_eq!(d.vcpus, 2);
        assert_eq!(d.os_variant.as_deref(), Some("http://debian.org/debian/12"));

        assert_eq!(d.disks.len(), 2);
        assert!(d.disks[0].is_disk());
        assert_eq!(d.disks[0].format.as_deref(), Some("qcow2"));
        assert_eq!(d.disks[1].device, "cdrom");

        assert_eq!(d.interfaces.len(), 2);
        assert_eq!(d.interfaces[0].source.as_deref(), Some("default"));
        assert_eq!(d.interfaces[1].kind, "bridge");
        assert_eq!(d.interfaces[1].source.as_deref(), Some("br0"));
        assert!(d.interfaces[0].xml.contains("52:54:00:AB:cd:01"));
    }

    #[test]
    fn test_interface_xml_reparses() {
        let d = LibvirtXmlDecoder.decode_domain(DOMAIN).unwrap();
        let reparsed = XmlElement::parse(&d.interfaces[0].xml).unwrap();
        assert_eq!(reparsed.name, "interface");
        assert_eq!(reparsed.path(&["source"]).and_then(|s| s.attr("network")), Some("default"));
    }

    #[test]
    fn test_memory_units() {
        assert_eq!(memory_to_mib(2_097_152, None), 2048);
        assert_eq!(memory_to_mib(4, Some("GiB")), 4096);
        assert_eq!(memory_to_mib(512, Some("MiB")), 512);
        assert_eq!(memory_to_mib(1_073_741_824, Some("b")), 1024);
    }

    #[test]
    fn test_decode_network_with_netmask() {
        let xml = r#"<network>
  <name>default</name>
  <forward mode='nat'/>
  <bridge name='virbr0' stp='on' delay='0'/>
  <ip address='192.168.122.1' netmask='255.255.255.0'>
    <dhcp><range start='192.168.122.2' end='192.168.122.254'/></dhcp>
  </ip>
</network>"#;
        let n = LibvirtXmlDecoder.decode_network(xml).unwrap();
        assert_eq!(n.bridge.as_deref(), Some("virbr0"));
        assert_eq!(n.forward_mode.as_deref(), Some("nat"));
        assert_eq!(n.prefix, Some(24));
        assert_eq!(n.dhcp_range.unwrap().end, "192.168.122.254");
    }

    #[test]
    fn test_decode_isolated_network() {
        let xml = "<network><name>iso</name><ip address='10.0.0.1' prefix='16'/></network>";
        let n = LibvirtXmlDecoder.decode_network(xml).unwrap();
        assert_eq!(n.forward_mode, None);
        assert_eq!(n.prefix, Some(16));
        assert!(n.dhcp_range.is_none());
    }

    #[test]
    fn test_decode_snapshot_memory() {
        let running = "<domainsnapshot><name>s1</name><state>running</state>\
                       <creationTime>1700000000</creationTime></domainsnapshot>";
        let s = LibvirtXmlDecoder.decode_snapshot(running).unwrap();
        assert!(s.has_memory);
        assert_eq!(s.created_at, Some(1_700_000_000));

        let disk_only = "<domainsnapshot><name>s2</name><state>running</state>\
                         <memory snapshot='no'/></domainsnapshot>";
        assert!(!LibvirtXmlDecoder.decode_snapshot(disk_only).unwrap().has_memory);
    }

    #[test]
    fn test_wrong_root_rejected() {
        let err = LibvirtXmlDecoder.decode_network(DOMAIN).unwrap_err();
        assert!(matches!(err, HypervisorError::XmlError(_)));
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(XmlElement::parse("<domain><name>x</domain>").is_err());
        assert!(XmlElement::parse("").is_err());
    }
}
