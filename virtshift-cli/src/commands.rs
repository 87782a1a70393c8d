//! VM lifecycle command implementations.
//!
//! Thin wrappers over the hypervisor proxy: resolve the VM through the
//! inventory, find its hypervisor, act. Benign no-ops (starting a running
//! VM, stopping a stopped one) are notices, not errors.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use virtshift_hypervisor::{HypervisorProxy, RemoteExec, SshChannel};
use virtshift_inventory::{FileStore, InventoryError, InventoryStore, Vm};
use virtshift_migrate::{MigrateError, MigrateOptions, MigrationOrchestrator};

use crate::config::Config;

/// Shared command context: the inventory store and the configuration the
/// per-host channels are built from.
pub struct Context {
    store: Arc<dyn InventoryStore>,
    config: Config,
}

impl Context {
    pub async fn new(config: Config) -> Result<Self> {
        let store = FileStore::open(&config.inventory.path).await?;
        Ok(Self {
            store: Arc::new(store),
            config,
        })
    }

    fn channel(&self, hostname: &str) -> Arc<dyn RemoteExec> {
        Arc::new(
            SshChannel::new(hostname, &self.config.ssh.user)
                .with_args(self.config.ssh.options.clone()),
        )
    }

    fn proxy(&self, hostname: &str) -> Arc<HypervisorProxy> {
        Arc::new(
            HypervisorProxy::new(
                virtshift_inventory::Hypervisor::new(hostname, self.store.clone()),
                self.channel(hostname),
            )
            .with_volume_group(&self.config.storage.volume_group),
        )
    }

    /// The VM and the proxy of the hypervisor currently hosting it.
    async fn vm_and_proxy(&self, vm_hostname: &str) -> Result<(Vm, Arc<HypervisorProxy>)> {
        let vm = Vm::new(vm_hostname, self.store.clone());
        let source_hostname = vm.xen_host().await?;
        Ok((vm, self.proxy(&source_hostname)))
    }
}

async fn check_defined(proxy: &HypervisorProxy, vm: &Vm) -> Result<()> {
    if !proxy.vm_defined(vm).await? {
        return Err(MigrateError::InvalidState(format!(
            "{} is not built yet or is not actually running on {}",
            vm.fqdn(),
            proxy.hostname()
        ))
        .into());
    }
    Ok(())
}

/// Migrate a VM to another hypervisor.
pub async fn migrate(
    ctx: &Context,
    vm_hostname: &str,
    destination: &str,
    options: MigrateOptions,
) -> Result<()> {
    let (vm, source) = ctx.vm_and_proxy(vm_hostname).await?;
    let dest = ctx.proxy(destination);

    let orchestrator = MigrationOrchestrator::new(vm, source, dest, options)
        .with_guest_channel(ctx.channel(vm_hostname))
        .with_config(ctx.config.migration_config());
    orchestrator.run().await?;
    Ok(())
}

/// Start a VM; a notice when it already runs.
pub async fn start(ctx: &Context, vm_hostname: &str) -> Result<()> {
    let (vm, proxy) = ctx.vm_and_proxy(vm_hostname).await?;
    check_defined(&proxy, &vm).await?;

    if proxy.vm_running(&vm).await? {
        info!("{} is already running", vm.fqdn());
        return Ok(());
    }
    proxy.start_vm(&vm).await?;
    Ok(())
}

/// Stop a VM, gracefully unless forced; a notice when already stopped.
pub async fn stop(ctx: &Context, vm_hostname: &str, force: bool) -> Result<()> {
    let (vm, proxy) = ctx.vm_and_proxy(vm_hostname).await?;
    check_defined(&proxy, &vm).await?;

    if !proxy.vm_running(&vm).await? {
        info!("{} is already stopped", vm.fqdn());
        return Ok(());
    }
    if force {
        proxy.stop_vm_force(&vm).await?;
    } else {
        proxy
            .stop_vm(&vm, ctx.config.migration_config().shutdown_timeout)
            .await?;
    }
    info!("{} stopped", vm.fqdn());
    Ok(())
}

/// Restart a running VM.
pub async fn restart(ctx: &Context, vm_hostname: &str, force: bool) -> Result<()> {
    let (vm, proxy) = ctx.vm_and_proxy(vm_hostname).await?;
    check_defined(&proxy, &vm).await?;

    if !proxy.vm_running(&vm).await? {
        return Err(MigrateError::InvalidState(format!("{} is not running", vm.fqdn())).into());
    }

    if force {
        proxy.stop_vm_force(&vm).await?;
    } else {
        proxy
            .stop_vm(&vm, ctx.config.migration_config().shutdown_timeout)
            .await?;
    }
    proxy.start_vm(&vm).await?;
    info!("{} restarted", vm.fqdn());
    Ok(())
}

/// Overwrite outdated inventory attributes with the hypervisor's live
/// resource values.
pub async fn sync(ctx: &Context, vm_hostname: &str) -> Result<()> {
    let (vm, proxy) = ctx.vm_and_proxy(vm_hostname).await?;
    check_defined(&proxy, &vm).await?;

    let attributes = proxy.vm_sync_from_hypervisor(&vm).await?;
    let mut changed = Vec::new();
    for (attribute, value) in &attributes {
        let current = match vm.get(attribute).await {
            Ok(current) => Some(current),
            Err(InventoryError::AttributeMissing { .. }) => None,
            Err(err) => return Err(err.into()),
        };
        if current.as_ref() == Some(value) {
            info!("{}: {}", attribute, value);
            continue;
        }
        match current {
            Some(current) => info!("{}: {} -> {}", attribute, current, value),
            None => info!("{}: (unset) -> {}", attribute, value),
        }
        vm.set(attribute, value.clone());
        changed.push(attribute.clone());
    }

    if changed.is_empty() {
        info!("{}: inventory is already synchronized", vm.fqdn());
    } else {
        vm.commit().await?;
        info!(
            "{}: synchronized {} attributes ({})",
            vm.fqdn(),
            changed.len(),
            changed.join(", ")
        );
    }
    Ok(())
}
