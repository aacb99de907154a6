use std::path::{Path, PathBuf};

use crate::config::LibvirtConfig;
use crate::plan::NodeSpec;

/// Everything a node's domain definition points at on the host.
pub struct DomainLayout<'a> {
    pub node: &'a NodeSpec,
    /// Partition A and B images.
    pub disks: [PathBuf; 2],
    /// Installation image; only the install controller carries one.
    pub iso: Option<&'a Path>,
}

/// Generate libvirt domain XML for one plan node.
///
/// A node with an ISO boots from it first; every other node boots its disk
/// and falls back to the network, where the installed controller serves it.
pub fn generate_domain_xml(layout: &DomainLayout<'_>, libvirt: &LibvirtConfig) -> String {
    let node = layout.node;
    let name = &node.id;
    let memory_mib = node.memory_mb;
    let cores = node.cores;
    let domain_type = &libvirt.domain_type;
    let disk_a = layout.disks[0].display();
    let disk_b = layout.disks[1].display();

    let boot = match layout.iso {
        Some(_) => "    <boot dev='cdrom'/>\n    <boot dev='hd'/>\n",
        None => "    <boot dev='hd'/>\n    <boot dev='network'/>\n",
    };

    let cdrom = layout
        .iso
        .map(|iso| {
            format!(
                r#"    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
"#,
                iso.display()
            )
        })
        .unwrap_or_default();

    let interfaces: String = libvirt
        .bridges()
        .iter()
        .map(|bridge| {
            format!(
                r#"    <interface type='bridge'>
      <source bridge='{bridge}'/>
      <model type='e1000'/>
    </interface>
"#
            )
        })
        .collect();

    format!(
        r#"<domain type='{domain_type}'>
  <name>{name}</name>
  <memory unit='MiB'>{memory_mib}</memory>
  <currentMemory unit='MiB'>{memory_mib}</currentMemory>
  <vcpu placement='static'>{cores}</vcpu>
  <os>
    <type arch='x86_64' machine='pc'>hvm</type>
{boot}  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>restart</on_crash>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk_a}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk_b}'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
{cdrom}{interfaces}    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeResourcesConfig;

    fn node() -> NodeSpec {
        NodeSpec::controller(
            0,
            &NodeResourcesConfig {
                partition_a_gb: 200,
                partition_b_gb: 200,
                memory_mb: 10240,
                cores: 4,
            },
        )
    }

    fn disks() -> [PathBuf; 2] {
        [
            PathBuf::from("/var/lib/libvirt/images/controller-0-0.img"),
            PathBuf::from("/var/lib/libvirt/images/controller-0-1.img"),
        ]
    }

    #[test]
    fn xml_contains_name_and_resources() {
        let node = node();
        let xml = generate_domain_xml(
            &DomainLayout {
                node: &node,
                disks: disks(),
                iso: None,
            },
            &LibvirtConfig::default(),
        );
        assert!(xml.contains("<name>controller-0</name>"));
        assert!(xml.contains("<memory unit='MiB'>10240</memory>"));
        assert!(xml.contains("<vcpu placement='static'>4</vcpu>"));
        assert!(xml.contains("type='kvm'"));
    }

    #[test]
    fn xml_has_both_partitions_and_restarts_on_crash() {
        let node = node();
        let xml = generate_domain_xml(
            &DomainLayout {
                node: &node,
                disks: disks(),
                iso: None,
            },
            &LibvirtConfig::default(),
        );
        assert!(xml.contains("<source file='/var/lib/libvirt/images/controller-0-0.img'/>"));
        assert!(xml.contains("<source file='/var/lib/libvirt/images/controller-0-1.img'/>"));
        assert!(xml.contains("<target dev='vdb' bus='virtio'/>"));
        assert!(xml.contains("<on_crash>restart</on_crash>"));
        assert!(xml.contains("<serial type='pty'>"));
        assert!(xml.contains("<console type='pty'>"));
    }

    #[test]
    fn iso_node_boots_from_cdrom() {
        let node = node();
        let iso = PathBuf::from("/srv/bootimage.iso");
        let xml = generate_domain_xml(
            &DomainLayout {
                node: &node,
                disks: disks(),
                iso: Some(&iso),
            },
            &LibvirtConfig::default(),
        );
        assert!(xml.contains("<source file='/srv/bootimage.iso'/>"));
        let cdrom = xml.find("<boot dev='cdrom'/>").unwrap();
        let hd = xml.find("<boot dev='hd'/>").unwrap();
        assert!(cdrom < hd);
    }

    #[test]
    fn node_without_iso_has_no_cdrom() {
        let node = node();
        let xml = generate_domain_xml(
            &DomainLayout {
                node: &node,
                disks: disks(),
                iso: None,
            },
            &LibvirtConfig::default(),
        );
        assert!(!xml.contains("device='cdrom'"));
        assert!(xml.contains("<boot dev='network'/>"));
    }

    #[test]
    fn one_interface_per_bridge() {
        let node = node();
        let xml = generate_domain_xml(
            &DomainLayout {
                node: &node,
                disks: disks(),
                iso: None,
            },
            &LibvirtConfig::default(),
        );
        assert_eq!(xml.matches("<interface type='bridge'>").count(), 4);
        assert!(xml.contains("<source bridge='virbr1'/>"));
        assert!(xml.contains("<source bridge='virbr4'/>"));

        let custom = LibvirtConfig {
            bridges: vec!["br-oam".into()],
            ..LibvirtConfig::default()
        };
        let xml = generate_domain_xml(
            &DomainLayout {
                node: &node,
                disks: disks(),
                iso: None,
            },
            &custom,
        );
        assert_eq!(xml.matches("<interface type='bridge'>").count(), 1);
    }
}
