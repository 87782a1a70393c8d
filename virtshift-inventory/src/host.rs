//! Lazy-loading host views over the inventory.
//!
//! A [`Host`] materializes its attribute map from the store on first read
//! and memoizes it for the lifetime of the object. Writes are staged locally
//! and only become durable on an explicit [`Host::commit`]. [`Vm`] and
//! [`Hypervisor`] add the typed accessors the migration engine works with.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;
use tracing::debug;

use crate::attrs::{AttributeMap, AttributeValue};
use crate::error::{InventoryError, Result};
use crate::store::InventoryStore;

/// Disk reserved on every hypervisor for the root partition and swap, GiB.
const RESERVED_HOST_DISK_GIB: f64 = 10.0 + 16.0;

struct HostInner {
    hostname: String,
    store: Arc<dyn InventoryStore>,
    attrs: RwLock<Option<AttributeMap>>,
    staged: Mutex<AttributeMap>,
}

/// One inventory record, identified by its fully-qualified hostname.
///
/// Equality and hashing are by hostname only; two handles for the same
/// hostname refer to the same logical record even when loaded separately.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub fn new(hostname: impl Into<String>, store: Arc<dyn InventoryStore>) -> Self {
        Self {
            inner: Arc::new(HostInner {
                hostname: hostname.into(),
                store,
                attrs: RwLock::new(None),
                staged: Mutex::new(AttributeMap::new()),
            }),
        }
    }

    /// Build a host whose attribute map is already known, e.g. from a query
    /// result. Skips the first fetch.
    pub fn from_record(
        hostname: impl Into<String>,
        store: Arc<dyn InventoryStore>,
        record: AttributeMap,
    ) -> Self {
        Self {
            inner: Arc::new(HostInner {
                hostname: hostname.into(),
                store,
                attrs: RwLock::new(Some(record)),
                staged: Mutex::new(AttributeMap::new()),
            }),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn store(&self) -> Arc<dyn InventoryStore> {
        self.inner.store.clone()
    }

    async fn ensure_loaded(&self) -> Result<()> {
        if self.inner.attrs.read().await.is_some() {
            return Ok(());
        }
        let mut guard = self.inner.attrs.write().await;
        if guard.is_none() {
            debug!(host = %self.inner.hostname, "Loading inventory attributes");
            *guard = Some(self.inner.store.fetch(&self.inner.hostname).await?);
        }
        Ok(())
    }

    /// Read one attribute, staged changes taking precedence.
    pub async fn get(&self, key: &str) -> Result<AttributeValue> {
        if let Some(value) = self.staged_value(key) {
            return Ok(value);
        }
        self.ensure_loaded().await?;
        let guard = self.inner.attrs.read().await;
        guard
            .as_ref()
            .and_then(|attrs| attrs.get(key))
            .cloned()
            .ok_or_else(|| InventoryError::AttributeMissing {
                host: self.inner.hostname.clone(),
                attribute: key.to_string(),
            })
    }

    /// Read one attribute, falling back to `default` when absent.
    pub async fn get_or(&self, key: &str, default: AttributeValue) -> Result<AttributeValue> {
        match self.get(key).await {
            Ok(value) => Ok(value),
            Err(InventoryError::AttributeMissing { .. }) => Ok(default),
            Err(err) => Err(err),
        }
    }

    /// All attribute names, staged ones included.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.ensure_loaded().await?;
        let guard = self.inner.attrs.read().await;
        let mut keys: Vec<String> = guard
            .as_ref()
            .map(|attrs| attrs.keys().cloned().collect())
            .unwrap_or_default();
        for key in self.staged_guard().keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Stage one attribute change.
    pub fn set(&self, key: &str, value: impl Into<AttributeValue>) {
        self.staged_guard().insert(key.to_string(), value.into());
    }

    /// Stage a batch of attribute changes.
    pub fn update(&self, changes: AttributeMap) {
        self.staged_guard().extend(changes);
    }

    /// Whether any staged change is waiting for a commit.
    pub fn is_dirty(&self) -> bool {
        !self.staged_guard().is_empty()
    }

    /// Push staged changes to the store. On success the memoized attribute
    /// map is updated in place; on failure the changes stay staged.
    pub async fn commit(&self) -> Result<()> {
        let staged = self.staged_guard().clone();
        if staged.is_empty() {
            return Ok(());
        }
        self.inner
            .store
            .commit(&self.inner.hostname, &staged)
            .await?;
        self.staged_guard().clear();
        let mut guard = self.inner.attrs.write().await;
        if let Some(attrs) = guard.as_mut() {
            attrs.extend(staged);
        }
        Ok(())
    }

    /// Throw away staged changes.
    pub fn discard(&self) {
        self.staged_guard().clear();
    }

    /// Drop the memoized attribute map; the next read fetches fresh data.
    /// Staged changes are discarded as well.
    pub async fn refresh(&self) {
        self.staged_guard().clear();
        *self.inner.attrs.write().await = None;
    }

    fn staged_value(&self, key: &str) -> Option<AttributeValue> {
        self.staged_guard().get(key).cloned()
    }

    fn staged_guard(&self) -> std::sync::MutexGuard<'_, AttributeMap> {
        self.inner
            .staged
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Typed accessors shared by the Vm and Hypervisor views.

    pub(crate) async fn int_attr(&self, key: &str) -> Result<i64> {
        let value = self.get(key).await?;
        value
            .as_int()
            .ok_or_else(|| self.type_mismatch(key, "an integer"))
    }

    pub(crate) async fn f64_attr(&self, key: &str) -> Result<f64> {
        let value = self.get(key).await?;
        value
            .as_f64()
            .ok_or_else(|| self.type_mismatch(key, "a number"))
    }

    pub(crate) async fn str_attr(&self, key: &str) -> Result<String> {
        let value = self.get(key).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.type_mismatch(key, "a string"))
    }

    pub(crate) async fn ip_attr(&self, key: &str) -> Result<IpAddr> {
        let value = self.str_attr(key).await?;
        value
            .parse()
            .map_err(|_| self.type_mismatch(key, "an IP address"))
    }

    fn type_mismatch(&self, key: &str, expected: &'static str) -> InventoryError {
        InventoryError::TypeMismatch {
            host: self.inner.hostname.clone(),
            attribute: key.to_string(),
            expected,
        }
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.inner.hostname == other.inner.hostname
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hostname.hash(state);
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.hostname)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Host({})", self.inner.hostname)
    }
}

/// The hypervisor type a physical host runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorType {
    Kvm,
    Xen,
}

impl HypervisorType {
    fn parse(host: &Host, value: &str) -> Result<Self> {
        match value {
            "kvm" => Ok(HypervisorType::Kvm),
            "xen" => Ok(HypervisorType::Xen),
            _ => Err(InventoryError::TypeMismatch {
                host: host.hostname().to_string(),
                attribute: "hypervisor_type".to_string(),
                expected: "kvm or xen",
            }),
        }
    }
}

/// Inventory view of a virtual machine.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Vm {
    host: Host,
}

impl Vm {
    pub fn new(hostname: impl Into<String>, store: Arc<dyn InventoryStore>) -> Self {
        Self {
            host: Host::new(hostname, store),
        }
    }

    pub fn from_record(
        hostname: impl Into<String>,
        store: Arc<dyn InventoryStore>,
        record: AttributeMap,
    ) -> Self {
        Self {
            host: Host::from_record(hostname, store, record),
        }
    }

    /// The fully-qualified name; doubles as the libvirt domain name and the
    /// steady-state logical volume name.
    pub fn fqdn(&self) -> &str {
        self.host.hostname()
    }

    /// Allocated memory in MiB.
    pub async fn memory(&self) -> Result<i64> {
        self.host.int_attr("memory").await
    }

    pub async fn num_cpu(&self) -> Result<i64> {
        self.host.int_attr("num_cpu").await
    }

    pub async fn disk_size_gib(&self) -> Result<i64> {
        self.host.int_attr("disk_size_gib").await
    }

    /// Hostname of the owning hypervisor.
    pub async fn xen_host(&self) -> Result<String> {
        self.host.str_attr("xen_host").await
    }

    /// Unique identifier used for non-conflicting resource naming on a
    /// migration destination; distinct from the LV name.
    pub async fn uid_name(&self) -> Result<String> {
        self.host.str_attr("uid_name").await
    }

    pub async fn intern_ip(&self) -> Result<IpAddr> {
        self.host.ip_attr("intern_ip").await
    }

    pub async fn state(&self) -> Result<String> {
        self.host.str_attr("state").await
    }

    pub async fn os(&self) -> Result<String> {
        self.host.str_attr("os").await
    }

    /// Resolve the owning hypervisor as a fresh view; the back-reference is
    /// a hostname, not an owned object.
    pub async fn hypervisor(&self) -> Result<Hypervisor> {
        let hostname = self.xen_host().await?;
        Ok(Hypervisor::new(hostname, self.host.store()))
    }
}

impl Deref for Vm {
    type Target = Host;

    fn deref(&self) -> &Host {
        &self.host
    }
}

impl fmt::Display for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fqdn())
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vm({})", self.fqdn())
    }
}

/// Inventory view of a physical hypervisor.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Hypervisor {
    host: Host,
}

impl Hypervisor {
    pub fn new(hostname: impl Into<String>, store: Arc<dyn InventoryStore>) -> Self {
        Self {
            host: Host::new(hostname, store),
        }
    }

    pub fn fqdn(&self) -> &str {
        self.host.hostname()
    }

    pub async fn hypervisor_type(&self) -> Result<HypervisorType> {
        let value = self.host.str_attr("hypervisor_type").await?;
        HypervisorType::parse(&self.host, &value)
    }

    pub async fn state(&self) -> Result<String> {
        self.host.str_attr("state").await
    }

    pub async fn intern_ip(&self) -> Result<IpAddr> {
        self.host.ip_attr("intern_ip").await
    }

    /// VMs currently assigned to this hypervisor, per the inventory.
    pub async fn vms(&self) -> Result<Vec<Vm>> {
        let records = self
            .host
            .store()
            .query(&[
                ("servertype", "vm".into()),
                ("xen_host", self.fqdn().into()),
            ])
            .await?;
        let mut vms = Vec::with_capacity(records.len());
        for record in records {
            let hostname = record
                .get("hostname")
                .and_then(AttributeValue::as_str)
                .map(str::to_string)
                .ok_or_else(|| InventoryError::AttributeMissing {
                    host: self.fqdn().to_string(),
                    attribute: "hostname".to_string(),
                })?;
            vms.push(Vm::from_record(hostname, self.host.store(), record));
        }
        Ok(vms)
    }

    /// Free memory for VMs in MiB, estimated from inventory totals.
    pub async fn memory_free_estimate(&self) -> Result<f64> {
        let total = self.host.int_attr("memory").await? as f64;
        let mut allocated = 0.0;
        for vm in self.vms().await? {
            allocated += vm.memory().await? as f64;
        }
        Ok(total - allocated)
    }

    /// Free disk for VMs in MiB, estimated from inventory totals with the
    /// root/swap reserve subtracted.
    pub async fn disk_free_estimate_mib(&self) -> Result<f64> {
        let total = self.host.int_attr("disk_size_gib").await? as f64;
        let mut allocated = 0.0;
        for vm in self.vms().await? {
            allocated += vm.disk_size_gib().await? as f64;
        }
        Ok((total - allocated - RESERVED_HOST_DISK_GIB) * 1024.0)
    }

    /// 95-percentile CPU usage of the last 24 hours, percent.
    pub async fn cpu_util_pct(&self) -> Result<f64> {
        self.host.f64_attr("cpu_util_pct").await
    }

    /// 95-percentile VM CPU usage of the last 24 hours, percent.
    pub async fn cpu_util_vm_pct(&self) -> Result<f64> {
        self.host.f64_attr("cpu_util_vm_pct").await
    }

    /// Average load average of the last 24 hours.
    pub async fn load_avg_day(&self) -> Result<f64> {
        self.host.f64_attr("load_avg_day").await
    }
}

impl Deref for Hypervisor {
    type Target = Host;

    fn deref(&self) -> &Host {
        &self.host
    }
}

impl fmt::Display for Hypervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fqdn())
    }
}

impl fmt::Debug for Hypervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hypervisor({})", self.fqdn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::hash_map::DefaultHasher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hash_of(host: &Host) -> u64 {
        let mut hasher = DefaultHasher::new();
        host.hash(&mut hasher);
        hasher.finish()
    }

    struct CountingStore {
        inner: MemoryStore,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl InventoryStore for CountingStore {
        async fn fetch(&self, hostname: &str) -> Result<AttributeMap> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(hostname).await
        }

        async fn query(
            &self,
            filters: &[(&str, AttributeValue)],
        ) -> Result<Vec<AttributeMap>> {
            self.inner.query(filters).await
        }

        async fn commit(&self, hostname: &str, changes: &AttributeMap) -> Result<()> {
            self.inner.commit(hostname, changes).await
        }
    }

    async fn fixture() -> Arc<CountingStore> {
        let store = CountingStore {
            inner: MemoryStore::new(),
            fetches: AtomicUsize::new(0),
        };
        let mut vm = AttributeMap::new();
        vm.insert("servertype".into(), "vm".into());
        vm.insert("xen_host".into(), "hv1.example.com".into());
        vm.insert("intern_ip".into(), "10.20.9.5".into());
        vm.insert("memory".into(), AttributeValue::Int(2048));
        vm.insert("num_cpu".into(), AttributeValue::Int(2));
        vm.insert("disk_size_gib".into(), AttributeValue::Int(6));
        vm.insert("uid_name".into(), "vm_5001".into());
        store.inner.insert("web-01.example.com", vm).await;

        let mut hv = AttributeMap::new();
        hv.insert("servertype".into(), "hypervisor".into());
        hv.insert("hypervisor_type".into(), "kvm".into());
        hv.insert("memory".into(), AttributeValue::Int(65536));
        hv.insert("disk_size_gib".into(), AttributeValue::Int(2000));
        store.inner.insert("hv1.example.com", hv).await;

        Arc::new(store)
    }

    #[tokio::test]
    async fn attributes_load_once() {
        let store = fixture().await;
        let vm = Vm::new("web-01.example.com", store.clone());

        assert_eq!(vm.memory().await.unwrap(), 2048);
        assert_eq!(vm.num_cpu().await.unwrap(), 2);
        assert_eq!(vm.xen_host().await.unwrap(), "hv1.example.com");
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn staged_changes_shadow_and_commit() {
        let store = fixture().await;
        let vm = Vm::new("web-01.example.com", store.clone());

        assert!(!vm.is_dirty());
        vm.set("xen_host", "hv2.example.com");
        assert!(vm.is_dirty());
        assert_eq!(vm.xen_host().await.unwrap(), "hv2.example.com");

        // Not durable until commit.
        let record = store.inner.fetch("web-01.example.com").await.unwrap();
        assert_eq!(record.get("xen_host"), Some(&"hv1.example.com".into()));

        vm.commit().await.unwrap();
        assert!(!vm.is_dirty());
        let record = store.inner.fetch("web-01.example.com").await.unwrap();
        assert_eq!(record.get("xen_host"), Some(&"hv2.example.com".into()));
    }

    #[tokio::test]
    async fn discard_drops_staged_changes() {
        let store = fixture().await;
        let vm = Vm::new("web-01.example.com", store);

        vm.set("memory", 4096i64);
        vm.discard();
        assert!(!vm.is_dirty());
        assert_eq!(vm.memory().await.unwrap(), 2048);
    }

    #[tokio::test]
    async fn equality_and_hash_are_by_hostname() {
        let store = fixture().await;
        let a = Host::new("web-01.example.com", store.clone());
        let b = Host::new("web-01.example.com", store.clone());
        let c = Host::new("hv1.example.com", store);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[tokio::test]
    async fn hypervisor_free_memory_estimate() {
        let store = fixture().await;
        let hv = Hypervisor::new("hv1.example.com", store);

        // One VM with 2048 MiB on a 65536 MiB host.
        assert_eq!(hv.memory_free_estimate().await.unwrap(), 63488.0);
    }

    #[tokio::test]
    async fn missing_attribute_is_reported() {
        let store = fixture().await;
        let vm = Vm::new("web-01.example.com", store);
        let err = vm.get("puppet_environment").await.unwrap_err();
        assert!(matches!(err, InventoryError::AttributeMissing { .. }));

        let fallback = vm
            .get_or("puppet_environment", "production".into())
            .await
            .unwrap();
        assert_eq!(fallback, "production".into());
    }
}
