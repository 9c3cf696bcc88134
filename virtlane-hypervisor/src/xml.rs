//! XML generation utilities for libvirt descriptors.
//!
//! Builds the domain, network, interface and snapshot XML handed to the
//! hypervisor. Every value taken from caller input goes through [`escape`].

use std::borrow::Cow;

use crate::network::subnet::netmask;
use crate::types::*;

/// Escape text or an attribute value for inclusion in XML.
pub fn escape(raw: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(raw)
}

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    desc: &'a DomainDescriptor,
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(desc: &'a DomainDescriptor) -> Self {
        Self { desc }
    }

    pub fn build(&self) -> String {
        let d = self.desc;
        let mut xml = String::from("<domain type='kvm'>\n");
        xml.push_str(&format!("  <name>{}</name>\n", escape(&d.name)));
        if let Some(uuid) = &d.uuid {
            xml.push_str(&format!("  <uuid>{}</uuid>\n", escape(uuid)));
        }
        if let Some(title) = &d.title {
            xml.push_str(&format!("  <title>{}</title>\n", escape(title)));
        }
        if let Some(description) = &d.description {
            xml.push_str(&format!("  <description>{}</description>\n", escape(description)));
        }
        if let Some(os) = &d.os_variant {
            xml.push_str(&format!(
                r#"  <metadata>
    <libosinfo:libosinfo xmlns:libosinfo="http://libosinfo.org/xmlns/libvirt/domain/1.0">
      <libosinfo:os id="{}"/>
    </libosinfo:libosinfo>
  </metadata>
"#,
                escape(os)
            ));
        }
        xml.push_str(&format!("  <memory unit='MiB'>{}</memory>\n", d.memory_mib));
        xml.push_str(&format!("  <vcpu placement='static'>{}</vcpu>\n", d.vcpus));
        xml.push_str("  <os>\n    <type arch='x86_64' machine='q35'>hvm</type>\n  </os>\n");
        xml.push_str("  <devices>\n");
        for disk in &d.disks {
            xml.push_str(&self.build_disk(disk));
        }
        for iface in &d.interfaces {
            xml.push_str(&self.build_interface(iface));
        }
        xml.push_str("  </devices>\n</domain>\n");
        xml
    }

    fn build_disk(&self, disk: &DiskDevice) -> String {
        let mut xml = format!("    <disk type='file' device='{}'>\n", escape(&disk.device));
        if let Some(format) = &disk.format {
            xml.push_str(&format!("      <driver name='qemu' type='{}'/>\n", escape(format)));
        }
        if let Some(source) = &disk.source {
            xml.push_str(&format!("      <source file='{}'/>\n", escape(source)));
        }
        if let Some(target) = &disk.target {
            match &disk.bus {
                Some(bus) => xml.push_str(&format!(
                    "      <target dev='{}' bus='{}'/>\n",
                    escape(target),
                    escape(bus)
                )),
                None => xml.push_str(&format!("      <target dev='{}'/>\n", escape(target))),
            }
        }
        xml.push_str("    </disk>\n");
        xml
    }

    fn build_interface(&self, iface: &InterfaceDevice) -> String {
        format!(
            "    {}\n",
            interface_xml(
                &iface.kind,
                iface.source.as_deref().unwrap_or_default(),
                iface.mac.as_deref(),
                iface.model.as_deref(),
            )
        )
    }
}

/// Builder for libvirt network XML.
pub struct NetworkXmlBuilder<'a> {
    desc: &'a NetworkDescriptor,
}

impl<'a> NetworkXmlBuilder<'a> {
    pub fn new(desc: &'a NetworkDescriptor) -> Self {
        Self { desc }
    }

    pub fn build(&self) -> String {
        let d = self.desc;
        let mut xml = String::from("<network>\n");
        xml.push_str(&format!("  <name>{}</name>\n", escape(&d.name)));
        if let Some(uuid) = &d.uuid {
            xml.push_str(&format!("  <uuid>{}</uuid>\n", escape(uuid)));
        }
        if let Some(mode) = &d.forward_mode {
            xml.push_str(&format!("  <forward mode='{}'/>\n", escape(mode)));
        }
        if let Some(bridge) = &d.bridge {
            xml.push_str(&format!(
                "  <bridge name='{}' stp='on' delay='0'/>\n",
                escape(bridge)
            ));
        }
        if let (Some(address), Some(prefix)) = (&d.ip_address, d.prefix) {
            xml.push_str(&format!(
                "  <ip address='{}' netmask='{}'>\n",
                escape(address),
                netmask(prefix)
            ));
            if let Some(range) = &d.dhcp_range {
                xml.push_str(&format!(
                    "    <dhcp>\n      <range start='{}' end='{}'/>\n    </dhcp>\n",
                    escape(&range.start),
                    escape(&range.end)
                ));
            }
            xml.push_str("  </ip>\n");
        }
        xml.push_str("</network>\n");
        xml
    }
}

/// Interface device XML for attach.
pub fn interface_xml(kind: &str, source: &str, mac: Option<&str>, model: Option<&str>) -> String {
    let source_attr = if kind == "bridge" { "bridge" } else { "network" };
    let mut xml = format!("<interface type='{}'>", escape(kind));
    if let Some(mac) = mac {
        xml.push_str(&format!("<mac address='{}'/>", escape(mac)));
    }
    xml.push_str(&format!("<source {}='{}'/>", source_attr, escape(source)));
    if let Some(model) = model {
        xml.push_str(&format!("<model type='{}'/>", escape(model)));
    }
    xml.push_str("</interface>");
    xml
}

/// Snapshot creation XML.
pub fn snapshot_xml(name: &str, description: &str) -> String {
    format!(
        "<domainsnapshot><name>{}</name><description>{}</description></domainsnapshot>",
        escape(name),
        escape(description)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DescriptorDecoder, LibvirtXmlDecoder};

    #[test]
    fn test_domain_xml_decodes_back() {
        let desc = DomainDescriptor {
            name: "db01".to_string(),
            uuid: Some("11111111-2222-3333-4444-555555555555".to_string()),
            memory_mib: 4096,
            vcpus: 4,
            os_variant: Some("http://ubuntu.com/ubuntu/22.04".to_string()),
            disks: vec![DiskDevice {
                device: "disk".to_string(),
                source: Some("/var/lib/vms/db01.qcow2".to_string()),
                target: Some("vda".to_string()),
                bus: Some("virtio".to_string()),
                format: Some("qcow2".to_string()),
            }],
            interfaces: vec![InterfaceDevice {
                kind: "network".to_string(),
                mac: Some("52:54:00:00:00:01".to_string()),
                source: Some("default".to_string()),
                model: Some("virtio".to_string()),
                xml: String::new(),
            }],
            ..Default::default()
        };

        let xml = DomainXmlBuilder::new(&desc).build();
        assert!(xml.contains("<memory unit='MiB'>4096</memory>"));
        assert!(xml.contains("<vcpu placement='static'>4</vcpu>"));

        let decoded = LibvirtXmlDecoder.decode_domain(&xml).unwrap();
        assert_eq!(decoded.memory_mib, 4096);
        assert_eq!(decoded.disks, desc.disks);
        assert_eq!(decoded.interfaces[0].mac, desc.interfaces[0].mac);
        assert_eq!(decoded.os_variant, desc.os_variant);
    }

    #[test]
    fn test_network_xml() {
        let desc = NetworkDescriptor {
            name: "lab1".to_string(),
            bridge: Some("virbr-lab1".to_string()),
            forward_mode: Some("nat".to_string()),
            ip_address: Some("10.10.10.1".to_string()),
            prefix: Some(24),
            dhcp_range: Some(DhcpRange {
                start: "10.10.10.64".to_string(),
                end: "10.10.10.254".to_string(),
            }),
            ..Default::default()
        };
        let xml = NetworkXmlBuilder::new(&desc).build();

        assert!(xml.contains("<forward mode='nat'/>"));
        assert!(xml.contains("<bridge name='virbr-lab1' stp='on' delay='0'/>"));
        assert!(xml.contains("netmask='255.255.255.0'"));
        assert!(xml.contains("<range start='10.10.10.64' end='10.10.10.254'/>"));
    }

    #[test]
    fn test_isolated_network_has_no_forward() {
        let desc = NetworkDescriptor {
            name: "iso".to_string(),
            ..Default::default()
        };
        assert!(!NetworkXmlBuilder::new(&desc).build().contains("<forward"));
    }

    #[test]
    fn test_interface_xml_bridge() {
        let xml = interface_xml("bridge", "br0", Some("52:54:00:aa:bb:cc"), Some("virtio"));
        assert!(xml.contains("<source bridge='br0'/>"));
        assert!(xml.contains("<mac address='52:54:00:aa:bb:cc'/>"));
    }

    #[test]
    fn test_snapshot_xml_escapes() {
        let xml = snapshot_xml("pre-upgrade", "before <apt> & reboot");
        assert!(xml.contains("before &lt;apt&gt; &amp; reboot"));
    }
}
