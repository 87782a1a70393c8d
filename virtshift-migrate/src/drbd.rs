//! DRBD transport internals.
//!
//! One [`DrbdEndpoint`] is one side of a replication pair, bound to a
//! (hypervisor, VM) tuple. Starting a session creates a metadata volume,
//! shims the VM's logical volume behind a device-mapper indirection, brings
//! DRBD up on the shim and re-points the VM-visible device at
//! `/dev/drbdN` — all without the guest noticing. Every forward step has a
//! defined inverse; on failure the inverses run in reverse order, so a
//! failed session leaves nothing behind.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use virtshift_hypervisor::{HypervisorProxy, RemoteExec, RunOpts, Volume};
use virtshift_inventory::Vm;

use crate::error::{MigrateError, Result};
use crate::migration::{CancelFlag, MigrationConfig};

/// Which side of the replication pair an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrbdRole {
    /// Holds the authoritative data and overwrites the peer.
    Primary,
    /// Receives the data; promoted to a second primary once connected.
    Secondary,
}

/// One side of a DRBD replication session.
pub struct DrbdEndpoint {
    hv: Arc<HypervisorProxy>,
    vm: Vm,
    role: DrbdRole,
    resource: String,
    vg_name: String,
    lv_name: String,
    meta_disk: String,
    table_file: String,
    dev_minor: OnceCell<u32>,
}

impl DrbdEndpoint {
    /// Bind an endpoint to the VM's volume on `hv`.
    ///
    /// On the primary the exposed LV is the VM's own volume; on the
    /// secondary it is the replica named after the VM's uid_name, which
    /// keeps the shim clear of any existing LV on the destination.
    pub async fn new(hv: Arc<HypervisorProxy>, vm: &Vm, role: DrbdRole) -> Result<Self> {
        let volume = hv.get_volume_by_vm(vm).await?;
        let resource = vm.fqdn().to_string();
        let meta_disk = format!("{}_meta", vm.fqdn());
        let table_file = format!("/tmp/{}_{}_table", volume.vg_name, volume.lv_name);

        Ok(Self {
            hv,
            vm: vm.clone(),
            role,
            resource,
            vg_name: volume.vg_name,
            lv_name: volume.lv_name,
            meta_disk,
            table_file,
            dev_minor: OnceCell::new(),
        })
    }

    pub fn role(&self) -> DrbdRole {
        self.role
    }

    pub fn hypervisor(&self) -> &HypervisorProxy {
        &self.hv
    }

    fn lv_path(&self) -> String {
        format!("/dev/{}/{}", self.vg_name, self.lv_name)
    }

    /// Device minor of the exposed LV, from a stat of its device node.
    /// Stable per host, so it doubles as the DRBD minor and port offset.
    pub async fn device_minor(&self) -> Result<u32> {
        self.dev_minor
            .get_or_try_init(|| async {
                let out = self
                    .hv
                    .run(
                        &format!("stat -L -c \"%T\" {}", self.lv_path()),
                        RunOpts::silent(),
                    )
                    .await?;
                u32::from_str_radix(out.trim(), 16).map_err(|_| MigrateError::UnexpectedOutput {
                    what: "device minor",
                    output: out,
                })
            })
            .await
            .copied()
    }

    /// Replication port: collision-free per device on one host.
    pub async fn device_port(&self) -> Result<u32> {
        Ok(8000 + self.device_minor().await?)
    }

    /// Size of the exposed LV in bytes.
    pub async fn device_size(&self) -> Result<u64> {
        let volume = Volume::new(self.vg_name.clone(), self.lv_name.clone());
        Ok(self.hv.volume_size_bytes(&volume).await?)
    }

    /// This endpoint's `on <host>` stanza of the resource file.
    pub async fn host_config(&self) -> Result<String> {
        let address = self.hv.host().intern_ip().await?;
        Ok(format!(
            "    on {host} {{
        address   {address}:{port};
        device    /dev/drbd{minor};
        disk      /dev/mapper/{lv}_orig;
        meta-disk /dev/{vg}/{meta};
    }}",
            host = self.hv.hostname(),
            address = address,
            port = self.device_port().await?,
            minor = self.device_minor().await?,
            lv = self.lv_name,
            vg = self.vg_name,
            meta = self.meta_disk,
        ))
    }

    /// The full resource file contents for this endpoint, peer included.
    ///
    /// `allow-two-primaries` is required, not an optimization: during the
    /// memory hand-off both ends must stay writable. The buffer and rate
    /// settings are what keeps the resync at link speed.
    pub async fn resource_config(&self, peer: &DrbdEndpoint) -> Result<String> {
        Ok(format!(
            "resource {resource} {{
    net {{
        protocol C;
        max-buffers 24k;
        allow-two-primaries;
    }}
    disk {{
         c-max-rate 750M;
         resync-rate 750M;
    }}
{own}
{peer}
}}
",
            resource = self.resource,
            own = self.host_config().await?,
            peer = peer.host_config().await?,
        ))
    }

    // =========================================================================
    // Session start
    // =========================================================================

    /// Start replication towards `peer`.
    ///
    /// On success the VM-visible block device is backed by DRBD and the
    /// session must later be released with [`DrbdEndpoint::stop`]. On
    /// failure every resource created so far has been released again.
    #[instrument(skip(self, peer), fields(hv = %self.hv.hostname(), resource = %self.resource, role = ?self.role))]
    pub async fn start(&self, peer: &DrbdEndpoint) -> Result<()> {
        info!("Starting replication session");
        self.create_metadata_device().await?;
        if let Err(err) = self.install_shim(peer).await {
            self.hv
                .run(
                    &format!("lvremove -fy {}/{}", self.vg_name, self.meta_disk),
                    RunOpts::warn_only(),
                )
                .await
                .ok();
            return Err(err);
        }
        info!("Replication session up");
        Ok(())
    }

    /// Create and zero the DRBD metadata volume.
    async fn create_metadata_device(&self) -> Result<()> {
        // 256 MiB of metadata is fine up to 7 TiB of synced storage.
        self.hv
            .run(
                &format!("lvcreate -y -n {} -L256M {}", self.meta_disk, self.vg_name),
                RunOpts::default(),
            )
            .await?;

        // DRBD rejects metadata devices with leftover content.
        if let Err(err) = self
            .hv
            .run(
                &format!(
                    "dd if=/dev/zero of=/dev/{}/{} bs=1048576 count=256",
                    self.vg_name, self.meta_disk
                ),
                RunOpts::default(),
            )
            .await
        {
            self.hv
                .run(
                    &format!("lvremove -fy {}/{}", self.vg_name, self.meta_disk),
                    RunOpts::warn_only(),
                )
                .await
                .ok();
            return Err(err.into());
        }
        Ok(())
    }

    /// Dump the LV's mapper table and create the `_orig` shim over it, then
    /// continue with the DRBD take-over.
    async fn install_shim(&self, peer: &DrbdEndpoint) -> Result<()> {
        self.hv
            .run(
                &format!("dmsetup table {} > {}", self.lv_path(), self.table_file),
                RunOpts::default(),
            )
            .await?;
        self.hv
            .run(
                &format!("dmsetup create {}_orig < {}", self.lv_name, self.table_file),
                RunOpts::default(),
            )
            .await?;

        if let Err(err) = self.write_config_and_take_over(peer).await {
            self.hv
                .run(
                    &format!("dmsetup remove {}_orig", self.lv_name),
                    RunOpts::warn_only(),
                )
                .await
                .ok();
            self.hv
                .run(&format!("rm -f {}", self.table_file), RunOpts::warn_only())
                .await
                .ok();
            return Err(err);
        }
        Ok(())
    }

    async fn write_config_and_take_over(&self, peer: &DrbdEndpoint) -> Result<()> {
        let config = self.resource_config(peer).await?;
        self.hv
            .put(
                &format!("/etc/drbd.d/{}.res", self.resource),
                config.into(),
                "0640",
            )
            .await?;

        if let Err(err) = self.take_over_device().await {
            self.hv
                .run(
                    &format!("rm /etc/drbd.d/{}.res", self.resource),
                    RunOpts::warn_only(),
                )
                .await
                .ok();
            return Err(err);
        }
        Ok(())
    }

    /// Freeze the VM's device, bring DRBD up on the shim and swap the
    /// VM-visible mapping over to `/dev/drbdN`.
    async fn take_over_device(&self) -> Result<()> {
        // Size must be retrieved before suspending the device.
        let dev_size = self.device_size().await?;
        let minor = self.device_minor().await?;

        self.hv
            .run(
                &format!("dmsetup suspend {}", self.lv_path()),
                RunOpts::default(),
            )
            .await?;

        if let Err(err) = self.splice_drbd(dev_size, minor).await {
            // "up" can fail with the device started regardless, so the down
            // always runs and is allowed to fail.
            self.hv
                .run(&format!("drbdadm down {}", self.resource), RunOpts::warn_only())
                .await
                .ok();
            self.hv
                .run(
                    &format!("dmsetup resume {}", self.lv_path()),
                    RunOpts::warn_only(),
                )
                .await
                .ok();
            return Err(err);
        }
        Ok(())
    }

    async fn splice_drbd(&self, dev_size: u64, minor: u32) -> Result<()> {
        self.hv
            .run(
                &format!("drbdadm create-md {}", self.resource),
                RunOpts::default(),
            )
            .await?;
        self.hv
            .run(&format!("drbdadm up {}", self.resource), RunOpts::default())
            .await?;

        match self.role {
            DrbdRole::Primary => {
                // Force primary operation, overwriting whatever the peer has.
                self.hv
                    .run(
                        &format!(
                            "drbdadm -- --overwrite-data-of-peer primary {}",
                            self.resource
                        ),
                        RunOpts::default(),
                    )
                    .await?;
            }
            DrbdRole::Secondary => {
                // The device is not usable until DRBD reports it ready, which
                // needs the connection established ...
                self.hv
                    .run(
                        &format!("drbdadm wait-connect {}", self.resource),
                        RunOpts::default(),
                    )
                    .await?;
                // ... and primary/primary mode, which makes it writable.
                self.hv
                    .run(
                        &format!("drbdadm -- primary {}", self.resource),
                        RunOpts::default(),
                    )
                    .await?;
            }
        }

        // Re-point the device the VM talks to. Device-mapper counts in
        // 512-byte sectors regardless of the logical block size.
        self.hv
            .run(
                &format!(
                    "dmsetup load {} --table \"0 {} linear /dev/drbd{} 0\"",
                    self.lv_path(),
                    dev_size / 512,
                    minor
                ),
                RunOpts::default(),
            )
            .await?;

        if let Err(err) = self
            .hv
            .run(
                &format!("dmsetup resume {}", self.lv_path()),
                RunOpts::default(),
            )
            .await
        {
            // The resume in the outer rollback is not enough: DRBD refuses to
            // shut down while the new table still holds its device open, so
            // the original table has to go back in first.
            self.restore_original_table_quiesced().await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Reload the original table with the VM paused across the slot swap,
    /// so no guest write races the reload. Best-effort; runs on an error
    /// path that is already being reported.
    async fn restore_original_table_quiesced(&self) {
        let running = matches!(self.hv.vm_defined(&self.vm).await, Ok(true))
            && matches!(self.hv.vm_running(&self.vm).await, Ok(true));
        if running {
            if let Err(err) = self.hv.suspend_vm(&self.vm).await {
                warn!(error = %err, "Could not suspend VM for table restore");
            }
        }
        self.hv
            .run(
                &format!("dmsetup load {} < {}", self.lv_path(), self.table_file),
                RunOpts::warn_only(),
            )
            .await
            .ok();
        self.hv
            .run(
                &format!("dmsetup resume {}", self.lv_path()),
                RunOpts::warn_only(),
            )
            .await
            .ok();
        if running {
            if let Err(err) = self.hv.resume_vm(&self.vm).await {
                warn!(error = %err, "Could not resume VM after table restore");
            }
        }
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Block until DRBD reports both disks UpToDate.
    ///
    /// Polls `/proc/drbd` once per interval and surfaces the in-kernel
    /// progress bar as log output; `drbdsetup wait-sync` is the
    /// authoritative completion gate afterwards.
    #[instrument(skip(self, config, cancel), fields(hv = %self.hv.hostname(), resource = %self.resource))]
    pub async fn wait_for_sync(&self, config: &MigrationConfig, cancel: &CancelFlag) -> Result<()> {
        let minor = self.device_minor().await?;
        let needle = format!("{}: cs:", minor);
        let deadline = config
            .sync_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let mut polls_without_progressbar = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }
            if let (Some(deadline), Some(timeout)) = (deadline, config.sync_timeout) {
                if tokio::time::Instant::now() >= deadline {
                    return Err(MigrateError::SyncTimeout(timeout));
                }
            }

            let content = self.hv.read_file("/proc/drbd").await?;
            let text = String::from_utf8_lossy(&content);

            let mut device_found = false;
            let mut synced = false;
            let mut lines = text.lines();
            while let Some(line) = lines.next() {
                if !line.contains(&needle) {
                    continue;
                }
                device_found = true;
                if line.contains("ds:UpToDate/UpToDate") {
                    synced = true;
                }
                // The progress bar sits two lines below the device line.
                match lines.nth(1) {
                    Some(bar) => info!("{}", bar.trim()),
                    None => {
                        polls_without_progressbar += 1;
                        if polls_without_progressbar < 5 {
                            info!("Waiting for DRBD progress bar to show up");
                        } else {
                            warn!("Could not find progress bar, syncing without it");
                            synced = true;
                        }
                    }
                }
                break;
            }

            // No line for this device means there is nothing to watch.
            if !device_found || synced {
                break;
            }
            tokio::time::sleep(config.sync_poll_interval).await;
        }

        // The progress bar is cosmetic; DRBD itself arbitrates completion.
        self.hv
            .run(
                &format!("drbdsetup wait-sync {}", minor),
                RunOpts::default(),
            )
            .await?;
        info!("Disks are in sync");
        Ok(())
    }

    // =========================================================================
    // Tear-down
    // =========================================================================

    /// Release the session: original table back in, DRBD down, shim, meta
    /// volume and resource file removed.
    #[instrument(skip(self), fields(hv = %self.hv.hostname(), resource = %self.resource, role = ?self.role))]
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping replication session");

        // On the secondary a local VM may already be using the device; pause
        // it across the slot swap so its writes cannot race the reload.
        let quiesce = self.role == DrbdRole::Secondary
            && self.hv.vm_defined(&self.vm).await?
            && self.hv.vm_running(&self.vm).await?;
        if quiesce {
            self.hv.suspend_vm(&self.vm).await?;
        }

        self.hv
            .run(
                &format!("dmsetup load {} < {}", self.lv_path(), self.table_file),
                RunOpts::default(),
            )
            .await?;
        self.hv
            .run(
                &format!("dmsetup resume {}", self.lv_path()),
                RunOpts::default(),
            )
            .await?;

        // The load lands in the inactive table slot while the old table
        // still pins the DRBD device, so the down only works after the
        // resume has swapped the slots. The VM is paused (online) or shut
        // off (offline) here, so there is no I/O in the window.
        self.hv
            .run(&format!("drbdadm down {}", self.resource), RunOpts::default())
            .await?;

        if quiesce {
            self.hv.resume_vm(&self.vm).await?;
        }

        self.hv
            .run(
                &format!("dmsetup remove {}_orig", self.lv_name),
                RunOpts::default(),
            )
            .await?;
        self.hv
            .run(
                &format!("lvremove -fy {}/{}", self.vg_name, self.meta_disk),
                RunOpts::default(),
            )
            .await?;
        self.hv
            .run(
                &format!("rm /etc/drbd.d/{}.res", self.resource),
                RunOpts::default(),
            )
            .await?;
        self.hv
            .run(&format!("rm -f {}", self.table_file), RunOpts::default())
            .await?;

        info!("Replication session released");
        Ok(())
    }

    /// Tear-down on a path that is already failing: log instead of masking
    /// the original error.
    pub async fn stop_warn(&self) {
        if let Err(err) = self.stop().await {
            warn!(
                hv = %self.hv.hostname(),
                resource = %self.resource,
                error = %err,
                "Replication tear-down failed during rollback"
            );
        }
    }
}

/// Reconcile the logical block sizes seen by the guest, the source LV and
/// the destination LV before a session starts.
///
/// The splice must not present a different block size to the running guest,
/// so the guest's device is set to the minimum of the three.
pub async fn sync_block_size(
    vm: &Vm,
    guest: &Arc<dyn RemoteExec>,
    source: &HypervisorProxy,
    destination: &HypervisorProxy,
) -> Result<()> {
    if !source.vm_running(vm).await? {
        return Ok(());
    }

    let out = guest.run("blockdev --getss /dev/vda", RunOpts::silent()).await?;
    let vm_block_size: u32 = out
        .trim()
        .parse()
        .map_err(|_| MigrateError::UnexpectedOutput {
            what: "guest block size",
            output: out,
        })?;
    let src_block_size = source
        .get_block_size(&source.get_volume_by_vm(vm).await?.path())
        .await?;
    let dst_block_size = destination
        .get_block_size(&destination.get_volume_by_vm(vm).await?.path())
        .await?;
    debug!(
        vm = vm_block_size,
        source = src_block_size,
        destination = dst_block_size,
        "Block sizes"
    );

    let minimum = vm_block_size.min(src_block_size).min(dst_block_size);
    guest
        .run(
            &format!("blockdev --setbsz {} /dev/vda", minimum),
            RunOpts::default(),
        )
        .await?;
    Ok(())
}
