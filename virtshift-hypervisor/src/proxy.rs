//! The per-host hypervisor proxy.
//!
//! One [`HypervisorProxy`] adapts a single physical host: libvirt operations
//! through `virsh`, storage through LVM, plus raw command/file passthrough
//! for the layers above. Everything goes over the host's [`RemoteExec`]
//! channel; the proxy holds no connection state of its own.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument};

use virtshift_inventory::{AttributeMap, AttributeValue, Hypervisor, Vm};

use crate::error::{HypervisorError, Result};
use crate::remote::{RemoteExec, RunOpts};
use crate::xml::DomainXmlBuilder;

/// How often a graceful shutdown polls the domain state.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A logical volume handle on one hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub vg_name: String,
    pub lv_name: String,
}

impl Volume {
    pub fn new(vg_name: impl Into<String>, lv_name: impl Into<String>) -> Self {
        Self {
            vg_name: vg_name.into(),
            lv_name: lv_name.into(),
        }
    }

    /// Absolute block device path of the volume.
    pub fn path(&self) -> String {
        format!("/dev/{}/{}", self.vg_name, self.lv_name)
    }
}

/// Adapter over one physical hypervisor host.
pub struct HypervisorProxy {
    host: Hypervisor,
    remote: Arc<dyn RemoteExec>,
    vg_name: String,
}

impl HypervisorProxy {
    pub fn new(host: Hypervisor, remote: Arc<dyn RemoteExec>) -> Self {
        Self {
            host,
            remote,
            vg_name: "xen-data".to_string(),
        }
    }

    /// Use a non-default volume group for VM storage.
    pub fn with_volume_group(mut self, vg_name: impl Into<String>) -> Self {
        self.vg_name = vg_name.into();
        self
    }

    pub fn hostname(&self) -> &str {
        self.host.fqdn()
    }

    /// The inventory view of this host.
    pub fn host(&self) -> &Hypervisor {
        &self.host
    }

    pub fn volume_group(&self) -> &str {
        &self.vg_name
    }

    // =========================================================================
    // Channel passthrough
    // =========================================================================

    pub async fn run(&self, cmd: &str, opts: RunOpts) -> Result<String> {
        Ok(self.remote.run(cmd, opts).await?)
    }

    pub async fn put(&self, path: &str, data: Bytes, mode: &str) -> Result<()> {
        Ok(self.remote.put(path, data, mode).await?)
    }

    pub async fn read_file(&self, path: &str) -> Result<Bytes> {
        Ok(self.remote.read_file(path).await?)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether the VM is registered with the hypervisor daemon.
    pub async fn vm_defined(&self, vm: &Vm) -> Result<bool> {
        let out = self
            .run("virsh list --all --name", RunOpts::silent())
            .await?;
        Ok(out.lines().any(|line| line.trim() == vm.fqdn()))
    }

    /// Whether the VM is currently running (paused does not count).
    pub async fn vm_running(&self, vm: &Vm) -> Result<bool> {
        if !self.vm_defined(vm).await? {
            return Ok(false);
        }
        Ok(self.domstate(vm).await? == "running")
    }

    async fn domstate(&self, vm: &Vm) -> Result<String> {
        let out = self
            .run(&format!("virsh domstate {}", vm.fqdn()), RunOpts::silent())
            .await?;
        Ok(out.trim().to_string())
    }

    /// Find the VM's backing volume. The steady-state name is the FQDN; a
    /// replica created for an in-flight migration is named after the VM's
    /// uid_name, so both are accepted.
    pub async fn get_volume_by_vm(&self, vm: &Vm) -> Result<Volume> {
        let out = self
            .run(
                &format!("lvs --noheadings -o vg_name,lv_name {}", self.vg_name),
                RunOpts::silent(),
            )
            .await?;
        let uid_name = vm.uid_name().await?;

        let mut fallback = None;
        for line in out.lines() {
            let mut fields = line.split_whitespace();
            let (Some(vg), Some(lv)) = (fields.next(), fields.next()) else {
                continue;
            };
            if lv == vm.fqdn() {
                return Ok(Volume::new(vg, lv));
            }
            if lv == uid_name {
                fallback = Some(Volume::new(vg, lv));
            }
        }
        fallback.ok_or_else(|| HypervisorError::VolumeNotFound {
            vm: vm.fqdn().to_string(),
            vg: self.vg_name.clone(),
        })
    }

    /// Volume size in bytes, from LVM.
    pub async fn volume_size_bytes(&self, volume: &Volume) -> Result<u64> {
        let out = self
            .run(
                &format!(
                    "lvs --noheadings -o lv_size --units b --nosuffix {}/{}",
                    volume.vg_name, volume.lv_name
                ),
                RunOpts::silent(),
            )
            .await?;
        out.trim()
            .parse()
            .map_err(|_| HypervisorError::UnparsableOutput {
                what: "volume size",
                output: out,
            })
    }

    /// Logical block size of a block device in bytes.
    pub async fn get_block_size(&self, path: &str) -> Result<u32> {
        let out = self
            .run(&format!("blockdev --getss {}", path), RunOpts::silent())
            .await?;
        out.trim()
            .parse()
            .map_err(|_| HypervisorError::UnparsableOutput {
                what: "block size",
                output: out,
            })
    }

    /// Memory available for additional VMs, in MiB.
    pub async fn free_vm_memory(&self) -> Result<u64> {
        let out = self.run("virsh nodememstats", RunOpts::silent()).await?;
        for line in out.lines() {
            let mut fields = line.split_whitespace();
            if fields.next() == Some("free") {
                let kib: u64 = fields
                    .find_map(|f| f.parse().ok())
                    .ok_or_else(|| HypervisorError::UnparsableOutput {
                        what: "free memory",
                        output: out.clone(),
                    })?;
                return Ok(kib / 1024);
            }
        }
        Err(HypervisorError::UnparsableOutput {
            what: "free memory",
            output: out,
        })
    }

    /// Unallocated space in the VM volume group, in GiB.
    pub async fn get_free_disk_size_gib(&self) -> Result<u64> {
        let out = self
            .run(
                &format!(
                    "vgs --noheadings --units g --nosuffix -o vg_free {}",
                    self.vg_name
                ),
                RunOpts::silent(),
            )
            .await?;
        let free: f64 = out
            .trim()
            .parse()
            .map_err(|_| HypervisorError::UnparsableOutput {
                what: "free disk",
                output: out.clone(),
            })?;
        Ok(free as u64)
    }

    /// Live resource values of the VM as the hypervisor sees them.
    ///
    /// Returns `memory` (MiB), `num_cpu` and `disk_size_gib`, keyed like the
    /// inventory attributes they are compared against.
    pub async fn vm_sync_from_hypervisor(&self, vm: &Vm) -> Result<AttributeMap> {
        let out = self
            .run(&format!("virsh dominfo {}", vm.fqdn()), RunOpts::silent())
            .await?;

        let mut memory_mib = None;
        let mut num_cpu = None;
        for line in out.lines() {
            if let Some(rest) = line.strip_prefix("Max memory:") {
                let kib: i64 = rest
                    .split_whitespace()
                    .next()
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(|| HypervisorError::UnparsableOutput {
                        what: "domain memory",
                        output: line.to_string(),
                    })?;
                memory_mib = Some(kib / 1024);
            } else if let Some(rest) = line.strip_prefix("CPU(s):") {
                num_cpu = rest.trim().parse::<i64>().ok();
            }
        }

        let volume = self.get_volume_by_vm(vm).await?;
        let disk_size_gib = (self.volume_size_bytes(&volume).await? >> 30) as i64;

        let mut attrs = AttributeMap::new();
        if let Some(memory) = memory_mib {
            attrs.insert("memory".to_string(), AttributeValue::Int(memory));
        }
        if let Some(cpus) = num_cpu {
            attrs.insert("num_cpu".to_string(), AttributeValue::Int(cpus));
        }
        attrs.insert(
            "disk_size_gib".to_string(),
            AttributeValue::Int(disk_size_gib),
        );
        Ok(attrs)
    }

    // =========================================================================
    // Storage
    // =========================================================================

    /// Create the migration replica volume, named after the VM's uid_name so
    /// it cannot collide with an existing LV.
    #[instrument(skip(self, vm), fields(hv = %self.hostname(), vm = %vm.fqdn()))]
    pub async fn create_vm_volume(&self, vm: &Vm) -> Result<Volume> {
        let name = vm.uid_name().await?;
        let size_gib = vm.disk_size_gib().await?;
        info!(lv = %name, size_gib, "Creating volume");
        self.run(
            &format!("lvcreate -y -n {} -L{}g {}", name, size_gib, self.vg_name),
            RunOpts::default(),
        )
        .await?;
        Ok(Volume::new(self.vg_name.clone(), name))
    }

    pub async fn remove_vm_volume(&self, lv_name: &str) -> Result<()> {
        info!(hv = %self.hostname(), lv = %lv_name, "Removing volume");
        self.run(
            &format!("lvremove -fy {}/{}", self.vg_name, lv_name),
            RunOpts::default(),
        )
        .await?;
        Ok(())
    }

    pub async fn rename_vm_volume(&self, from: &str, to: &str) -> Result<()> {
        debug!(hv = %self.hostname(), from = %from, to = %to, "Renaming volume");
        self.run(
            &format!("lvrename {} {} {}", self.vg_name, from, to),
            RunOpts::default(),
        )
        .await?;
        Ok(())
    }

    // =========================================================================
    // VM lifecycle
    // =========================================================================

    /// Register the VM with the hypervisor daemon, backed by `disk_path`.
    #[instrument(skip(self, vm), fields(hv = %self.hostname(), vm = %vm.fqdn()))]
    pub async fn define_vm(&self, vm: &Vm, disk_path: &str) -> Result<()> {
        let memory = vm.memory().await?;
        let num_cpu = vm.num_cpu().await?;
        let xml = DomainXmlBuilder::new(vm.fqdn(), memory, num_cpu, disk_path).build();

        let xml_path = format!("/tmp/{}.xml", vm.fqdn());
        self.put(&xml_path, Bytes::from(xml), "0644").await?;
        self.run(&format!("virsh define {}", xml_path), RunOpts::default())
            .await?;
        self.run(&format!("rm {}", xml_path), RunOpts::warn_only())
            .await?;
        info!("VM defined");
        Ok(())
    }

    pub async fn undefine_vm(&self, vm: &Vm) -> Result<()> {
        info!(hv = %self.hostname(), vm = %vm.fqdn(), "Undefining VM");
        self.run(&format!("virsh undefine {}", vm.fqdn()), RunOpts::default())
            .await?;
        Ok(())
    }

    pub async fn start_vm(&self, vm: &Vm) -> Result<()> {
        info!(hv = %self.hostname(), vm = %vm.fqdn(), "Starting VM");
        self.run(&format!("virsh start {}", vm.fqdn()), RunOpts::default())
            .await?;
        Ok(())
    }

    /// Graceful shutdown: ACPI signal, then poll until the domain is shut
    /// off or the timeout expires.
    #[instrument(skip(self, vm), fields(hv = %self.hostname(), vm = %vm.fqdn()))]
    pub async fn stop_vm(&self, vm: &Vm, timeout: Duration) -> Result<()> {
        if !self.vm_running(vm).await? {
            return Err(HypervisorError::InvalidState(format!(
                "{} is not running on {}",
                vm.fqdn(),
                self.hostname()
            )));
        }

        info!(timeout_secs = timeout.as_secs(), "Shutting down VM");
        self.run(&format!("virsh shutdown {}", vm.fqdn()), RunOpts::default())
            .await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.domstate(vm).await? == "shut off" {
                info!("VM shut down");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HypervisorError::OperationFailed(format!(
                    "{} did not shut down within {}s",
                    vm.fqdn(),
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }

    /// Pull the plug.
    pub async fn stop_vm_force(&self, vm: &Vm) -> Result<()> {
        info!(hv = %self.hostname(), vm = %vm.fqdn(), "Destroying VM");
        self.run(&format!("virsh destroy {}", vm.fqdn()), RunOpts::default())
            .await?;
        Ok(())
    }

    pub async fn suspend_vm(&self, vm: &Vm) -> Result<()> {
        if self.domstate(vm).await? != "running" {
            return Err(HypervisorError::InvalidState(format!(
                "{} is not running, cannot suspend",
                vm.fqdn()
            )));
        }
        debug!(hv = %self.hostname(), vm = %vm.fqdn(), "Suspending VM");
        self.run(&format!("virsh suspend {}", vm.fqdn()), RunOpts::default())
            .await?;
        Ok(())
    }

    pub async fn resume_vm(&self, vm: &Vm) -> Result<()> {
        if self.domstate(vm).await? != "paused" {
            return Err(HypervisorError::InvalidState(format!(
                "{} is not paused, cannot resume",
                vm.fqdn()
            )));
        }
        debug!(hv = %self.hostname(), vm = %vm.fqdn(), "Resuming VM");
        self.run(&format!("virsh resume {}", vm.fqdn()), RunOpts::default())
            .await?;
        Ok(())
    }

    /// Live-migrate the VM's memory and runtime state to `destination`.
    ///
    /// Disk state is not copied here; the replication layer keeps both ends
    /// writable while the pages move.
    #[instrument(skip(self, vm, destination), fields(vm = %vm.fqdn(), from = %self.hostname(), to = %destination.hostname()))]
    pub async fn migrate_vm_live(&self, vm: &Vm, destination: &HypervisorProxy) -> Result<()> {
        info!("Starting live migration");
        self.run(
            &format!(
                "virsh migrate --live {} qemu+ssh://{}/system",
                vm.fqdn(),
                destination.hostname()
            ),
            RunOpts::default(),
        )
        .await?;
        info!("Live migration finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRemote;
    use virtshift_inventory::{AttributeMap, AttributeValue, MemoryStore};

    async fn fixture() -> (Arc<HypervisorProxy>, Arc<MockRemote>, Vm) {
        let store = Arc::new(MemoryStore::new());

        let mut vm_attrs = AttributeMap::new();
        vm_attrs.insert("servertype".into(), "vm".into());
        vm_attrs.insert("xen_host".into(), "hv1.example.com".into());
        vm_attrs.insert("memory".into(), AttributeValue::Int(2048));
        vm_attrs.insert("num_cpu".into(), AttributeValue::Int(2));
        vm_attrs.insert("disk_size_gib".into(), AttributeValue::Int(6));
        vm_attrs.insert("uid_name".into(), "vm_5001".into());
        store.insert("web-01.example.com", vm_attrs).await;

        let mut hv_attrs = AttributeMap::new();
        hv_attrs.insert("servertype".into(), "hypervisor".into());
        hv_attrs.insert("hypervisor_type".into(), "kvm".into());
        hv_attrs.insert("intern_ip".into(), "10.0.1.1".into());
        store.insert("hv1.example.com", hv_attrs).await;

        let remote = Arc::new(MockRemote::new("hv1.example.com"));
        let proxy = Arc::new(HypervisorProxy::new(
            Hypervisor::new("hv1.example.com", store.clone()),
            remote.clone(),
        ));
        let vm = Vm::new("web-01.example.com", store);
        (proxy, remote, vm)
    }

    #[tokio::test]
    async fn defined_and_running_track_domain_state() {
        let (proxy, remote, vm) = fixture().await;

        assert!(!proxy.vm_defined(&vm).await.unwrap());
        remote.set_domain("web-01.example.com", 2048, 2, true);
        assert!(proxy.vm_defined(&vm).await.unwrap());
        assert!(proxy.vm_running(&vm).await.unwrap());

        proxy.stop_vm_force(&vm).await.unwrap();
        assert!(!proxy.vm_running(&vm).await.unwrap());
        assert!(proxy.vm_defined(&vm).await.unwrap());
    }

    #[tokio::test]
    async fn volume_lookup_prefers_fqdn_then_uid_name() {
        let (proxy, remote, vm) = fixture().await;

        remote.add_lv("xen-data", "vm_5001", 6 << 30);
        let volume = proxy.get_volume_by_vm(&vm).await.unwrap();
        assert_eq!(volume.lv_name, "vm_5001");

        remote.add_lv("xen-data", "web-01.example.com", 6 << 30);
        let volume = proxy.get_volume_by_vm(&vm).await.unwrap();
        assert_eq!(volume.lv_name, "web-01.example.com");
        assert_eq!(volume.path(), "/dev/xen-data/web-01.example.com");
    }

    #[tokio::test]
    async fn define_vm_uploads_domain_xml() {
        let (proxy, remote, vm) = fixture().await;

        proxy
            .define_vm(&vm, "/dev/xen-data/web-01.example.com")
            .await
            .unwrap();

        assert!(remote.is_defined("web-01.example.com"));
        assert!(!remote.is_running("web-01.example.com"));
        // The upload is cleaned up after the define.
        assert!(!remote.has_file("/tmp/web-01.example.com.xml"));

        proxy.start_vm(&vm).await.unwrap();
        assert!(remote.is_running("web-01.example.com"));
    }

    #[tokio::test]
    async fn graceful_stop_requires_running_vm() {
        let (proxy, remote, vm) = fixture().await;

        remote.set_domain("web-01.example.com", 2048, 2, false);
        let err = proxy
            .stop_vm(&vm, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidState(_)));

        remote.set_domain("web-01.example.com", 2048, 2, true);
        proxy.stop_vm(&vm, Duration::from_secs(1)).await.unwrap();
        assert!(!remote.is_running("web-01.example.com"));
    }

    #[tokio::test]
    async fn sync_reports_live_values() {
        let (proxy, remote, vm) = fixture().await;

        remote.set_domain("web-01.example.com", 3072, 4, true);
        remote.add_lv("xen-data", "web-01.example.com", 7 << 30);

        let attrs = proxy.vm_sync_from_hypervisor(&vm).await.unwrap();
        assert_eq!(attrs.get("memory"), Some(&AttributeValue::Int(3072)));
        assert_eq!(attrs.get("num_cpu"), Some(&AttributeValue::Int(4)));
        assert_eq!(attrs.get("disk_size_gib"), Some(&AttributeValue::Int(7)));
    }

    #[tokio::test]
    async fn suspend_resume_transitions() {
        let (proxy, remote, vm) = fixture().await;
        remote.set_domain("web-01.example.com", 2048, 2, true);

        proxy.suspend_vm(&vm).await.unwrap();
        let err = proxy.suspend_vm(&vm).await.unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidState(_)));

        proxy.resume_vm(&vm).await.unwrap();
        assert!(proxy.vm_running(&vm).await.unwrap());
    }
}
