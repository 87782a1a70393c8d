//! End-to-end migration scenarios against in-process mock hosts.
//!
//! Two emulated hypervisors, an emulated guest and an in-memory inventory
//! carry a VM back and forth; the assertions pin the user-visible contract:
//! where the VM runs, what the inventory says, and that no replication
//! residue (meta LV, mapper shim, resource file, table dump) survives on
//! either host after success or failure.

use std::sync::Arc;
use std::time::Duration;

use virtshift_hypervisor::{HypervisorProxy, MockRemote, RemoteExec};
use virtshift_inventory::{AttributeMap, AttributeValue, Hypervisor, InventoryStore, MemoryStore, Vm};
use virtshift_migrate::{MigrateError, MigrateOptions, MigrationConfig, MigrationOrchestrator};

const VM1: &str = "web-01.example.com";
const UID1: &str = "vm_5001";
const HV1: &str = "hv-01.example.com";
const HV2: &str = "hv-02.example.com";
const GIB: u64 = 1 << 30;

struct Fleet {
    store: Arc<MemoryStore>,
    vm: Vm,
    hv1: Arc<HypervisorProxy>,
    hv2: Arc<HypervisorProxy>,
    hv1_remote: Arc<MockRemote>,
    hv2_remote: Arc<MockRemote>,
    guest: Arc<MockRemote>,
}

impl Fleet {
    async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());

        let mut vm_attrs = AttributeMap::new();
        vm_attrs.insert("servertype".into(), "vm".into());
        vm_attrs.insert("xen_host".into(), HV1.into());
        vm_attrs.insert("intern_ip".into(), "10.20.9.5".into());
        vm_attrs.insert("state".into(), "online".into());
        vm_attrs.insert("os".into(), "bookworm".into());
        vm_attrs.insert("memory".into(), AttributeValue::Int(2048));
        vm_attrs.insert("num_cpu".into(), AttributeValue::Int(2));
        vm_attrs.insert("disk_size_gib".into(), AttributeValue::Int(6));
        vm_attrs.insert("uid_name".into(), UID1.into());
        store.insert(VM1, vm_attrs).await;

        for (hostname, ip) in [(HV1, "10.0.1.1"), (HV2, "10.0.1.2")] {
            let mut attrs = AttributeMap::new();
            attrs.insert("servertype".into(), "hypervisor".into());
            attrs.insert("hypervisor_type".into(), "kvm".into());
            attrs.insert("state".into(), "online".into());
            attrs.insert("intern_ip".into(), ip.into());
            attrs.insert("memory".into(), AttributeValue::Int(65536));
            attrs.insert("disk_size_gib".into(), AttributeValue::Int(2000));
            store.insert(hostname, attrs).await;
        }

        let hv1_remote = Arc::new(MockRemote::new(HV1));
        let hv2_remote = Arc::new(MockRemote::new(HV2));
        let guest = Arc::new(MockRemote::new(VM1));

        hv1_remote.add_lv("xen-data", VM1, 6 * GIB);
        hv1_remote.set_domain(VM1, 2048, 2, true);
        hv1_remote.link_migration_target(&hv2_remote);
        hv2_remote.link_migration_target(&hv1_remote);

        let hv1 = Arc::new(HypervisorProxy::new(
            Hypervisor::new(HV1, store.clone()),
            hv1_remote.clone(),
        ));
        let hv2 = Arc::new(HypervisorProxy::new(
            Hypervisor::new(HV2, store.clone()),
            hv2_remote.clone(),
        ));

        Fleet {
            vm: Vm::new(VM1, store.clone()),
            store,
            hv1,
            hv2,
            hv1_remote,
            hv2_remote,
            guest,
        }
    }

    fn migrate_to_hv2(&self, options: MigrateOptions) -> MigrationOrchestrator {
        MigrationOrchestrator::new(self.vm.clone(), self.hv1.clone(), self.hv2.clone(), options)
            .with_guest_channel(self.guest.clone() as Arc<dyn RemoteExec>)
            .with_config(quick_config())
    }

    fn migrate_to_hv1(&self, options: MigrateOptions) -> MigrationOrchestrator {
        MigrationOrchestrator::new(self.vm.clone(), self.hv2.clone(), self.hv1.clone(), options)
            .with_guest_channel(self.guest.clone() as Arc<dyn RemoteExec>)
            .with_config(quick_config())
    }

    async fn set_attribute(&self, key: &str, value: AttributeValue) {
        let mut changes = AttributeMap::new();
        changes.insert(key.to_string(), value);
        self.store.commit(VM1, &changes).await.unwrap();
    }
}

fn quick_config() -> MigrationConfig {
    MigrationConfig {
        sync_timeout: None,
        sync_poll_interval: Duration::from_millis(2),
        shutdown_timeout: Duration::from_secs(5),
    }
}

fn offline() -> MigrateOptions {
    MigrateOptions {
        offline: true,
        ..Default::default()
    }
}

/// No meta LV, no mapper shim, no resource file, no table dump, no DRBD
/// resource left on the host.
fn assert_no_session_residue(remote: &MockRemote) {
    assert!(
        remote.lv_names().iter().all(|lv| !lv.ends_with("_meta")),
        "meta LV left behind on {:?}",
        remote.lv_names()
    );
    assert!(!remote.has_dm_device(&format!("{}_orig", VM1)));
    assert!(!remote.has_dm_device(&format!("{}_orig", UID1)));
    assert!(!remote.has_file(&format!("/etc/drbd.d/{}.res", VM1)));
    assert!(!remote.has_file(&format!("/tmp/xen-data_{}_table", VM1)));
    assert!(!remote.has_file(&format!("/tmp/xen-data_{}_table", UID1)));
    assert!(remote.drbd_resources().is_empty());
}

/// The host saw no state-changing command at all.
fn assert_no_mutations(remote: &MockRemote) {
    const MUTATING: &[&str] = &[
        "lvcreate",
        "lvremove",
        "lvrename",
        "dd ",
        "dmsetup",
        "drbdadm",
        "put ",
        "virsh define",
        "virsh undefine",
        "virsh start",
        "virsh shutdown",
        "virsh destroy",
        "virsh suspend",
        "virsh migrate",
        "mount",
        "chroot",
    ];
    for cmd in remote.commands() {
        assert!(
            MUTATING.iter().all(|needle| !cmd.starts_with(needle)),
            "unexpected mutation on {}: {}",
            remote.hostname(),
            cmd
        );
    }
}

#[tokio::test]
async fn online_migration_and_back() {
    let fleet = Fleet::new().await;
    let before = fleet.store.snapshot().await;
    fleet.hv1_remote.set_sync_polls(2);

    fleet
        .migrate_to_hv2(MigrateOptions::default())
        .run()
        .await
        .unwrap();

    assert!(fleet.hv2_remote.is_running(VM1));
    assert!(!fleet.hv1_remote.is_defined(VM1));
    assert_eq!(fleet.vm.xen_host().await.unwrap(), HV2);
    assert!(!fleet.vm.is_dirty());
    assert_no_session_residue(&fleet.hv1_remote);
    assert_no_session_residue(&fleet.hv2_remote);
    // The source copy is retired, the replica carries the steady-state name.
    assert!(!fleet.hv1_remote.has_lv("xen-data", VM1));
    assert!(fleet.hv2_remote.has_lv("xen-data", VM1));

    // And back again.
    fleet
        .migrate_to_hv1(MigrateOptions::default())
        .run()
        .await
        .unwrap();

    assert!(fleet.hv1_remote.is_running(VM1));
    assert!(!fleet.hv2_remote.is_defined(VM1));
    assert_eq!(fleet.vm.xen_host().await.unwrap(), HV1);
    assert_no_session_residue(&fleet.hv1_remote);
    assert_no_session_residue(&fleet.hv2_remote);
    assert!(fleet.hv1_remote.has_lv("xen-data", VM1));
    assert!(!fleet.hv2_remote.has_lv("xen-data", VM1));

    // A round trip restores the inventory exactly.
    assert_eq!(fleet.store.snapshot().await, before);
}

#[tokio::test]
async fn offline_migration_stops_syncs_and_starts() {
    let fleet = Fleet::new().await;

    fleet.migrate_to_hv2(offline()).run().await.unwrap();

    let hv1_commands = fleet.hv1_remote.commands();
    assert!(hv1_commands
        .iter()
        .any(|cmd| cmd == &format!("virsh shutdown {}", VM1)));
    // No memory hand-off in the offline path.
    assert!(hv1_commands.iter().all(|cmd| !cmd.contains("virsh migrate")));

    assert!(fleet.hv2_remote.is_running(VM1));
    assert!(!fleet.hv1_remote.is_defined(VM1));
    assert_eq!(fleet.vm.xen_host().await.unwrap(), HV2);
    assert_no_session_residue(&fleet.hv1_remote);
    assert_no_session_residue(&fleet.hv2_remote);
}

#[tokio::test]
async fn rejects_out_of_sync_inventory() {
    let fleet = Fleet::new().await;
    fleet
        .set_attribute("disk_size_gib", AttributeValue::Int(7))
        .await;

    let err = fleet
        .migrate_to_hv2(MigrateOptions::default())
        .run()
        .await
        .unwrap_err();
    match err {
        MigrateError::InconsistentAttribute { attribute, .. } => {
            assert_eq!(attribute, "disk_size_gib")
        }
        other => panic!("expected InconsistentAttribute, got {:?}", other),
    }

    assert_no_mutations(&fleet.hv1_remote);
    assert_no_mutations(&fleet.hv2_remote);
    assert!(fleet.hv1_remote.is_running(VM1));
}

#[tokio::test]
async fn rejects_online_migration_with_new_ip() {
    let fleet = Fleet::new().await;
    let options = MigrateOptions {
        newip: Some("10.20.9.6".parse().unwrap()),
        ..Default::default()
    };

    let err = fleet.migrate_to_hv2(options).run().await.unwrap_err();
    assert!(matches!(err, MigrateError::IncompatibleOptions(_)));
    assert_no_mutations(&fleet.hv1_remote);
    assert_no_mutations(&fleet.hv2_remote);
}

#[tokio::test]
async fn rejects_new_ip_without_puppet() {
    let fleet = Fleet::new().await;
    let options = MigrateOptions {
        offline: true,
        newip: Some("10.20.9.6".parse().unwrap()),
        runpuppet: false,
    };

    let err = fleet.migrate_to_hv2(options).run().await.unwrap_err();
    assert!(matches!(err, MigrateError::IncompatibleOptions(_)));
}

#[tokio::test]
async fn rejects_online_migration_with_puppet() {
    let fleet = Fleet::new().await;
    let options = MigrateOptions {
        runpuppet: true,
        ..Default::default()
    };

    let err = fleet.migrate_to_hv2(options).run().await.unwrap_err();
    assert!(matches!(err, MigrateError::IncompatibleOptions(_)));
    assert_no_mutations(&fleet.hv1_remote);
    assert_no_mutations(&fleet.hv2_remote);
}

#[tokio::test]
async fn rollback_on_bad_puppet_environment() {
    let fleet = Fleet::new().await;
    fleet
        .set_attribute("puppet_environment", "doesnotexist".into())
        .await;
    fleet
        .hv2_remote
        .fail_when_contains("--environment doesnotexist");
    let before = fleet.store.snapshot().await;

    let options = MigrateOptions {
        offline: true,
        runpuppet: true,
        ..Default::default()
    };
    fleet.migrate_to_hv2(options).run().await.unwrap_err();

    // The VM is back where it was, running.
    assert!(fleet.hv1_remote.is_defined(VM1));
    assert!(fleet.hv1_remote.is_running(VM1));
    assert!(fleet.hv1_remote.has_lv("xen-data", VM1));

    // The destination is clean.
    assert!(!fleet.hv2_remote.is_defined(VM1));
    assert!(!fleet.hv2_remote.has_lv("xen-data", UID1));
    assert!(!fleet.hv2_remote.has_lv("xen-data", VM1));
    assert_no_session_residue(&fleet.hv1_remote);
    assert_no_session_residue(&fleet.hv2_remote);

    // The inventory is byte-identical to its pre-call state.
    assert_eq!(fleet.store.snapshot().await, before);
    assert!(!fleet.vm.is_dirty());
}

#[tokio::test]
async fn rollback_on_replication_failure() {
    let fleet = Fleet::new().await;
    fleet.hv2_remote.fail_when_contains("drbdadm wait-connect");
    let before = fleet.store.snapshot().await;

    fleet
        .migrate_to_hv2(MigrateOptions::default())
        .run()
        .await
        .unwrap_err();

    assert!(fleet.hv1_remote.is_running(VM1));
    assert!(fleet.hv1_remote.has_lv("xen-data", VM1));
    assert!(!fleet.hv2_remote.is_defined(VM1));
    assert!(!fleet.hv2_remote.has_lv("xen-data", UID1));
    assert_no_session_residue(&fleet.hv1_remote);
    assert_no_session_residue(&fleet.hv2_remote);
    assert_eq!(fleet.store.snapshot().await, before);
}

#[tokio::test]
async fn guest_block_size_becomes_the_minimum() {
    let fleet = Fleet::new().await;
    fleet.guest.set_block_size("/dev/vda", 4096);
    fleet
        .hv1_remote
        .set_block_size(&format!("/dev/xen-data/{}", VM1), 512);
    fleet
        .hv2_remote
        .set_block_size(&format!("/dev/xen-data/{}", UID1), 4096);

    fleet
        .migrate_to_hv2(MigrateOptions::default())
        .run()
        .await
        .unwrap();

    assert!(fleet
        .guest
        .commands()
        .iter()
        .any(|cmd| cmd == "blockdev --setbsz 512 /dev/vda"));
}

#[tokio::test]
async fn secondary_session_releases_before_primary() {
    let fleet = Fleet::new().await;

    fleet
        .migrate_to_hv2(MigrateOptions::default())
        .run()
        .await
        .unwrap();

    let secondary_down = fleet
        .hv2_remote
        .commands_with_seq()
        .into_iter()
        .find(|(_, cmd)| cmd.starts_with("drbdadm down"))
        .expect("secondary never took DRBD down")
        .0;
    let primary_down = fleet
        .hv1_remote
        .commands_with_seq()
        .into_iter()
        .find(|(_, cmd)| cmd.starts_with("drbdadm down"))
        .expect("primary never took DRBD down")
        .0;
    assert!(
        secondary_down < primary_down,
        "secondary must release before primary"
    );
}

#[tokio::test]
async fn cancellation_rolls_back_before_any_mutation() {
    let fleet = Fleet::new().await;
    let orchestrator = fleet.migrate_to_hv2(MigrateOptions::default());
    orchestrator.cancel_handle().cancel();

    let err = orchestrator.run().await.unwrap_err();
    assert!(matches!(err, MigrateError::Cancelled));
    assert_no_mutations(&fleet.hv1_remote);
    assert_no_mutations(&fleet.hv2_remote);
    assert!(fleet.hv1_remote.is_running(VM1));
}

#[tokio::test]
async fn rejects_migration_to_the_current_host() {
    let fleet = Fleet::new().await;
    let orchestrator = MigrationOrchestrator::new(
        fleet.vm.clone(),
        fleet.hv1.clone(),
        fleet.hv1.clone(),
        MigrateOptions::default(),
    )
    .with_config(quick_config());

    let err = orchestrator.run().await.unwrap_err();
    assert!(matches!(err, MigrateError::InvalidState(_)));
}

#[tokio::test]
async fn rejects_undefined_vm() {
    let fleet = Fleet::new().await;
    fleet
        .hv1_remote
        .run(&format!("virsh destroy {}", VM1), Default::default())
        .await
        .unwrap();
    fleet
        .hv1_remote
        .run(&format!("virsh undefine {}", VM1), Default::default())
        .await
        .unwrap();

    let err = fleet
        .migrate_to_hv2(MigrateOptions::default())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::InvalidState(_)));
}

#[tokio::test]
async fn rejects_destination_without_capacity() {
    let fleet = Fleet::new().await;
    fleet.hv2_remote.set_free_memory_mib(512);

    let err = fleet
        .migrate_to_hv2(MigrateOptions::default())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, MigrateError::InsufficientResources { .. }));
    assert_no_mutations(&fleet.hv2_remote);
}
