//! XML generation for libvirt domain definitions.

/// Builder for the domain XML a VM is defined with.
///
/// The fleet runs uniform guests: one block-backed virtio disk, one bridged
/// virtio NIC, serial console. Anything fancier is defined out-of-band.
pub struct DomainXmlBuilder<'a> {
    name: &'a str,
    memory_mib: i64,
    vcpus: i64,
    disk_path: &'a str,
    bridge: &'a str,
}

impl<'a> DomainXmlBuilder<'a> {
    pub fn new(name: &'a str, memory_mib: i64, vcpus: i64, disk_path: &'a str) -> Self {
        Self {
            name,
            memory_mib,
            vcpus,
            disk_path,
            bridge: "br0",
        }
    }

    pub fn with_bridge(mut self, bridge: &'a str) -> Self {
        self.bridge = bridge;
        self
    }

    /// Build the domain XML string.
    pub fn build(&self) -> String {
        let mut xml = String::new();

        xml.push_str(&format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <memory unit='MiB'>{}</memory>
  <vcpu placement='static'>{}</vcpu>
"#,
            self.name, self.memory_mib, self.vcpus
        ));

        xml.push_str(
            r#"  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <clock offset='utc'>
    <timer name='rtc' tickpolicy='catchup'/>
    <timer name='pit' tickpolicy='delay'/>
    <timer name='hpet' present='no'/>
  </clock>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
"#,
        );

        xml.push_str("  <devices>\n");
        xml.push_str("    <emulator>/usr/bin/qemu-system-x86_64</emulator>\n");
        xml.push_str(&format!(
            r#"    <disk type='block' device='disk'>
      <driver name='qemu' type='raw' cache='none' io='native'/>
      <source dev='{}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
"#,
            self.disk_path
        ));
        xml.push_str(&format!(
            r#"    <interface type='bridge'>
      <source bridge='{}'/>
      <model type='virtio'/>
    </interface>
"#,
            self.bridge
        ));
        xml.push_str(
            r#"    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
"#,
        );
        xml.push_str("  </devices>\n");
        xml.push_str("</domain>\n");

        xml
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_xml_generation() {
        let xml = DomainXmlBuilder::new("web-01.example.com", 2048, 2, "/dev/xen-data/web-01.example.com")
            .build();

        assert!(xml.contains("<name>web-01.example.com</name>"));
        assert!(xml.contains("<memory unit='MiB'>2048</memory>"));
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
        assert!(xml.contains("<source dev='/dev/xen-data/web-01.example.com'/>"));
        assert!(xml.contains("bus='virtio'"));
    }

    #[test]
    fn bridge_override() {
        let xml = DomainXmlBuilder::new("vm", 1024, 1, "/dev/xen-data/vm")
            .with_bridge("br-vlan200")
            .build();
        assert!(xml.contains("<source bridge='br-vlan200'/>"));
    }
}
