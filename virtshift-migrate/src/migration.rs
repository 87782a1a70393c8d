//! The migration orchestrator.
//!
//! Sequences a full VM migration: pre-flight gates, destination volume,
//! nested DRBD sessions, the libvirt memory hand-off (online) or a
//! stop/start cycle (offline), and the inventory commit. Any failure
//! unwinds every remote side effect in reverse order; the inventory is only
//! touched on the fully successful path.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use virtshift_hypervisor::{HypervisorProxy, RemoteExec, RunOpts};
use virtshift_inventory::Vm;

use crate::drbd::{sync_block_size, DrbdEndpoint, DrbdRole};
use crate::error::{MigrateError, Result};

/// Tunables of one orchestration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Ceiling for the disk synchronization; `None` waits indefinitely.
    /// Exceeding it is fatal and triggers rollback.
    pub sync_timeout: Option<Duration>,
    /// How often `/proc/drbd` is polled while syncing.
    pub sync_poll_interval: Duration,
    /// How long a graceful shutdown may take in the offline path.
    pub shutdown_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            sync_timeout: None,
            sync_poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(300),
        }
    }
}

/// Cooperative cancellation handle.
///
/// Checked between steps and once per poll iteration; a cancelled
/// orchestration fails with [`MigrateError::Cancelled`] and takes the
/// ordinary rollback path, so remote inverses still run.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Caller-supplied migration options.
#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    /// Shut the VM down and copy the disk instead of a live hand-off.
    pub offline: bool,
    /// Address the VM gets on the destination; requires `offline` and
    /// `runpuppet`.
    pub newip: Option<IpAddr>,
    /// Re-run puppet in the copied system before its first boot.
    pub runpuppet: bool,
}

/// What the plan had already done when it failed; drives the rollback.
#[derive(Debug, Default)]
struct Progress {
    created_replica_volume: bool,
    shut_down_source: bool,
}

/// Orchestrates one migration of one VM between two hypervisors.
pub struct MigrationOrchestrator {
    vm: Vm,
    source: Arc<HypervisorProxy>,
    destination: Arc<HypervisorProxy>,
    guest: Option<Arc<dyn RemoteExec>>,
    options: MigrateOptions,
    config: MigrationConfig,
    cancel: CancelFlag,
}

impl MigrationOrchestrator {
    pub fn new(
        vm: Vm,
        source: Arc<HypervisorProxy>,
        destination: Arc<HypervisorProxy>,
        options: MigrateOptions,
    ) -> Self {
        Self {
            vm,
            source,
            destination,
            guest: None,
            options,
            config: MigrationConfig::default(),
            cancel: CancelFlag::new(),
        }
    }

    /// Channel into the guest itself, used for block-size reconciliation.
    pub fn with_guest_channel(mut self, guest: Arc<dyn RemoteExec>) -> Self {
        self.guest = Some(guest);
        self
    }

    pub fn with_config(mut self, config: MigrationConfig) -> Self {
        self.config = config;
        self
    }

    /// Handle to cancel this orchestration from another task.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run the migration to completion or to a fully rolled-back failure.
    pub async fn run(&self) -> Result<()> {
        let span = info_span!(
            "migration",
            id = %Uuid::new_v4(),
            vm = %self.vm.fqdn(),
            from = %self.source.hostname(),
            to = %self.destination.hostname(),
            offline = self.options.offline,
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<()> {
        info!("Starting migration");
        self.preflight().await?;

        let was_running = self.source.vm_running(&self.vm).await?;
        let mut progress = Progress::default();

        match self.execute(was_running, &mut progress).await {
            Ok(()) => {
                self.vm.set("xen_host", self.destination.hostname());
                if let Some(ip) = self.options.newip {
                    self.vm.set("intern_ip", ip.to_string());
                }
                self.vm.commit().await?;
                info!("Migration complete");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Migration failed, rolling back");
                self.rollback(&progress).await;
                Err(err)
            }
        }
    }

    // =========================================================================
    // Pre-flight gates
    // =========================================================================

    /// Everything that must hold before the first remote mutation.
    async fn preflight(&self) -> Result<()> {
        if self.options.runpuppet && !self.options.offline {
            return Err(MigrateError::IncompatibleOptions(
                "puppet re-provisioning requires an offline migration".to_string(),
            ));
        }
        if self.options.newip.is_some() && !(self.options.offline && self.options.runpuppet) {
            return Err(MigrateError::IncompatibleOptions(
                "a new IP address requires an offline migration with puppet re-provisioning"
                    .to_string(),
            ));
        }

        if self.source.hostname() == self.destination.hostname() {
            return Err(MigrateError::InvalidState(format!(
                "{} is already hosted on {}",
                self.vm.fqdn(),
                self.destination.hostname()
            )));
        }
        if !self.source.vm_defined(&self.vm).await? {
            return Err(MigrateError::InvalidState(format!(
                "{} is not built yet or is not actually running on {}",
                self.vm.fqdn(),
                self.source.hostname()
            )));
        }
        if self.destination.vm_defined(&self.vm).await? {
            return Err(MigrateError::InvalidState(format!(
                "{} is already defined on {}",
                self.vm.fqdn(),
                self.destination.hostname()
            )));
        }

        // The inventory is rewritten at the end, so it has to match reality
        // before anything starts.
        let live = self.source.vm_sync_from_hypervisor(&self.vm).await?;
        for (attribute, live_value) in &live {
            let inventory_value = self.vm.get(attribute).await?;
            if inventory_value != *live_value {
                return Err(MigrateError::InconsistentAttribute {
                    attribute: attribute.clone(),
                    inventory: inventory_value,
                    live: live_value.clone(),
                });
            }
        }

        self.check_destination_capacity().await?;
        Ok(())
    }

    async fn check_destination_capacity(&self) -> Result<()> {
        let memory = self.vm.memory().await?;
        let disk_gib = self.vm.disk_size_gib().await?;
        let dest = self.destination.host();

        // Fast estimates from inventory totals catch hopeless placements
        // without waiting for the hypervisor.
        if let Ok(free) = dest.memory_free_estimate().await {
            if free < memory as f64 {
                return Err(MigrateError::InsufficientResources {
                    host: dest.fqdn().to_string(),
                    details: format!(
                        "{:.0} MiB memory free by inventory estimate, VM needs {} MiB",
                        free, memory
                    ),
                });
            }
        }
        if let Ok(free_mib) = dest.disk_free_estimate_mib().await {
            if free_mib < (disk_gib * 1024) as f64 {
                return Err(MigrateError::InsufficientResources {
                    host: dest.fqdn().to_string(),
                    details: format!(
                        "{:.0} MiB disk free by inventory estimate, VM needs {} MiB",
                        free_mib,
                        disk_gib * 1024
                    ),
                });
            }
        }

        // The live hypervisor has the authoritative numbers.
        let free_memory = self.destination.free_vm_memory().await?;
        if (free_memory as i64) < memory {
            return Err(MigrateError::InsufficientResources {
                host: dest.fqdn().to_string(),
                details: format!("{} MiB memory free, VM needs {} MiB", free_memory, memory),
            });
        }
        let free_disk = self.destination.get_free_disk_size_gib().await?;
        if (free_disk as i64) < disk_gib {
            return Err(MigrateError::InsufficientResources {
                host: dest.fqdn().to_string(),
                details: format!("{} GiB disk free, VM needs {} GiB", free_disk, disk_gib),
            });
        }
        Ok(())
    }

    // =========================================================================
    // The plan
    // =========================================================================

    async fn execute(&self, was_running: bool, progress: &mut Progress) -> Result<()> {
        self.checkpoint()?;

        // The replica volume the secondary session will wrap.
        self.destination.create_vm_volume(&self.vm).await?;
        progress.created_replica_volume = true;

        if !self.options.offline {
            match &self.guest {
                Some(guest) => {
                    sync_block_size(&self.vm, guest, &self.source, &self.destination).await?
                }
                None => warn!("No guest channel, skipping block size reconciliation"),
            }
        }

        if self.options.offline && was_running {
            self.source
                .stop_vm(&self.vm, self.config.shutdown_timeout)
                .await?;
            progress.shut_down_source = true;
        }

        self.checkpoint()?;
        let primary =
            DrbdEndpoint::new(self.source.clone(), &self.vm, DrbdRole::Primary).await?;
        let secondary =
            DrbdEndpoint::new(self.destination.clone(), &self.vm, DrbdRole::Secondary).await?;

        // Primary outer, secondary inner: the inner scope releases first,
        // because the primary's shutdown blocks while a connected peer is
        // still up.
        primary.start(&secondary).await?;
        let replicated = self.replicate_within(&primary, &secondary).await;
        match replicated {
            Ok(()) => primary.stop().await?,
            Err(err) => {
                primary.stop_warn().await;
                return Err(err);
            }
        }

        // Steady state: retire the source copy and give the replica the
        // name the next orchestration will look for.
        let source_volume = self.source.get_volume_by_vm(&self.vm).await?;
        self.source
            .remove_vm_volume(&source_volume.lv_name)
            .await?;
        let uid_name = self.vm.uid_name().await?;
        self.destination
            .rename_vm_volume(&uid_name, self.vm.fqdn())
            .await?;
        Ok(())
    }

    async fn replicate_within(
        &self,
        primary: &DrbdEndpoint,
        secondary: &DrbdEndpoint,
    ) -> Result<()> {
        secondary.start(primary).await?;
        let result = self.transfer(primary).await;
        match result {
            Ok(()) => secondary.stop().await,
            Err(err) => {
                secondary.stop_warn().await;
                Err(err)
            }
        }
    }

    /// The actual hand-off, with both replication sessions active.
    async fn transfer(&self, primary: &DrbdEndpoint) -> Result<()> {
        self.checkpoint()?;
        primary.wait_for_sync(&self.config, &self.cancel).await?;
        self.checkpoint()?;

        let dest_path = self.destination.get_volume_by_vm(&self.vm).await?.path();
        if self.options.offline {
            if self.options.runpuppet {
                self.run_puppet(&dest_path).await?;
            }
            self.destination.define_vm(&self.vm, &dest_path).await?;
            self.destination.start_vm(&self.vm).await?;
        } else {
            self.destination.define_vm(&self.vm, &dest_path).await?;
            self.checkpoint()?;
            self.source
                .migrate_vm_live(&self.vm, &self.destination)
                .await?;
        }
        self.source.undefine_vm(&self.vm).await?;
        Ok(())
    }

    /// Re-provision the copied system in a chroot before its first boot.
    async fn run_puppet(&self, disk_path: &str) -> Result<()> {
        let environment = self
            .vm
            .get_or("puppet_environment", "production".into())
            .await?;
        let mount_point = format!("/mnt/{}", self.vm.fqdn());
        info!(environment = %environment, "Running puppet in the copied system");

        self.destination
            .run(&format!("mkdir -p {}", mount_point), RunOpts::default())
            .await?;
        self.destination
            .run(
                &format!("mount {} {}", disk_path, mount_point),
                RunOpts::default(),
            )
            .await?;
        let result = self
            .destination
            .run(
                &format!(
                    "chroot {} puppet agent --onetime --no-daemonize --environment {}",
                    mount_point, environment
                ),
                RunOpts::default(),
            )
            .await;
        // The mount must not outlive the attempt, failed or not.
        self.destination
            .run(&format!("umount {}", mount_point), RunOpts::warn_only())
            .await
            .ok();
        result?;
        Ok(())
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    /// Best-effort unwind of everything outside the replication sessions
    /// (those clean up in their own scopes). Never masks the original error.
    async fn rollback(&self, progress: &Progress) {
        warn!("Unwinding partial migration state");
        self.vm.discard();

        match self.destination.vm_defined(&self.vm).await {
            Ok(true) => {
                if matches!(self.destination.vm_running(&self.vm).await, Ok(true)) {
                    if let Err(err) = self.destination.stop_vm_force(&self.vm).await {
                        warn!(error = %err, "Could not stop VM on destination during rollback");
                    }
                }
                if let Err(err) = self.destination.undefine_vm(&self.vm).await {
                    warn!(error = %err, "Could not undefine VM on destination during rollback");
                }
            }
            Ok(false) => {}
            Err(err) => warn!(error = %err, "Could not inspect destination during rollback"),
        }

        if progress.created_replica_volume {
            if let Ok(uid_name) = self.vm.uid_name().await {
                self.destination
                    .run(
                        &format!(
                            "lvremove -fy {}/{}",
                            self.destination.volume_group(),
                            uid_name
                        ),
                        RunOpts::warn_only(),
                    )
                    .await
                    .ok();
            }
        }

        // A VM that was shut down for an offline migration comes back.
        if progress.shut_down_source {
            match self.source.vm_running(&self.vm).await {
                Ok(false) => {
                    if let Err(err) = self.source.start_vm(&self.vm).await {
                        warn!(error = %err, "Could not restart VM on source after rollback");
                    }
                }
                Ok(true) => {}
                Err(err) => warn!(error = %err, "Could not inspect source during rollback"),
            }
        }
        info!("Rollback finished");
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(MigrateError::Cancelled)
        } else {
            Ok(())
        }
    }
}
