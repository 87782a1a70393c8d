//! Mock remote host for testing and development.
//!
//! Emulates, in memory, the slice of a hypervisor host the proxy and the
//! replication layer drive over the shell: logical volumes with device
//! minors, device-mapper tables with an active and an inactive slot, DRBD
//! resources, libvirt domains and plain files. Unknown commands succeed with
//! empty output; state-changing commands enforce the same ordering rules the
//! real tools do (a DRBD device cannot go down while a mapper table still
//! references it, a shim cannot be removed while a resource holds it open).
//!
//! Every executed command is recorded with a process-global sequence number
//! so tests can assert cross-host ordering.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::error::RemoteExecError;
use crate::remote::{RemoteExec, RunOpts};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DomState {
    ShutOff,
    Running,
    Paused,
}

#[derive(Debug, Clone)]
struct MockDomain {
    state: DomState,
    memory_mib: i64,
    vcpus: i64,
}

#[derive(Debug, Clone)]
struct MockLv {
    minor: u32,
    size_bytes: u64,
    active_table: String,
    inactive_table: Option<String>,
    suspended: bool,
}

#[derive(Debug, Clone)]
struct MockDrbd {
    minor: u32,
    disk: String,
}

struct HostState {
    log: Vec<(u64, String)>,
    files: BTreeMap<String, Bytes>,
    lvs: BTreeMap<String, MockLv>,
    dm_devices: BTreeMap<String, String>,
    drbd_up: BTreeMap<String, MockDrbd>,
    domains: BTreeMap<String, MockDomain>,
    block_sizes: BTreeMap<String, u32>,
    next_minor: u32,
    free_memory_kib: u64,
    vg_free_gib: f64,
    sync_polls_remaining: u32,
    fail_contains: Vec<String>,
    peer: Option<Arc<Mutex<HostState>>>,
}

/// In-process stand-in for a remote hypervisor host.
pub struct MockRemote {
    hostname: String,
    state: Arc<Mutex<HostState>>,
}

impl MockRemote {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            state: Arc::new(Mutex::new(HostState {
                log: Vec::new(),
                files: BTreeMap::new(),
                lvs: BTreeMap::new(),
                dm_devices: BTreeMap::new(),
                drbd_up: BTreeMap::new(),
                domains: BTreeMap::new(),
                block_sizes: BTreeMap::new(),
                next_minor: 10,
                free_memory_kib: 48 * 1024 * 1024,
                vg_free_gib: 500.0,
                sync_polls_remaining: 0,
                fail_contains: Vec::new(),
                peer: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Test setup
    // =========================================================================

    /// Create a logical volume with a fresh device minor.
    pub fn add_lv(&self, vg: &str, lv: &str, size_bytes: u64) {
        let mut st = self.state();
        let minor = st.next_minor;
        st.next_minor += 1;
        st.lvs.insert(
            format!("{}/{}", vg, lv),
            MockLv {
                minor,
                size_bytes,
                active_table: format!("0 {} linear 252:{} 0", size_bytes / 512, minor),
                inactive_table: None,
                suspended: false,
            },
        );
    }

    /// Register a libvirt domain with its live resource values.
    pub fn set_domain(&self, name: &str, memory_mib: i64, vcpus: i64, running: bool) {
        self.state().domains.insert(
            name.to_string(),
            MockDomain {
                state: if running {
                    DomState::Running
                } else {
                    DomState::ShutOff
                },
                memory_mib,
                vcpus,
            },
        );
    }

    /// Logical block size reported for a device path (default 512).
    pub fn set_block_size(&self, path: &str, size: u32) {
        self.state()
            .block_sizes
            .insert(path.to_string(), size);
    }

    pub fn set_free_memory_mib(&self, mib: u64) {
        self.state().free_memory_kib = mib * 1024;
    }

    pub fn set_vg_free_gib(&self, gib: f64) {
        self.state().vg_free_gib = gib;
    }

    /// How many `/proc/drbd` reads still show a resync in progress.
    pub fn set_sync_polls(&self, polls: u32) {
        self.state().sync_polls_remaining = polls;
    }

    /// Fail every command containing `needle`.
    pub fn fail_when_contains(&self, needle: &str) {
        self.state().fail_contains.push(needle.to_string());
    }

    /// Wire up the host a live migration would hand domains to.
    pub fn link_migration_target(&self, target: &MockRemote) {
        self.state().peer = Some(target.state.clone());
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn commands(&self) -> Vec<String> {
        self.state().log.iter().map(|(_, cmd)| cmd.clone()).collect()
    }

    /// Commands with their process-global sequence numbers, for cross-host
    /// ordering assertions.
    pub fn commands_with_seq(&self) -> Vec<(u64, String)> {
        self.state().log.clone()
    }

    pub fn has_lv(&self, vg: &str, lv: &str) -> bool {
        self.state().lvs.contains_key(&format!("{}/{}", vg, lv))
    }

    /// All `vg/lv` keys currently present.
    pub fn lv_names(&self) -> Vec<String> {
        self.state().lvs.keys().cloned().collect()
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.state().files.contains_key(path)
    }

    pub fn file(&self, path: &str) -> Option<Bytes> {
        self.state().files.get(path).cloned()
    }

    pub fn has_dm_device(&self, name: &str) -> bool {
        self.state().dm_devices.contains_key(name)
    }

    pub fn lv_suspended(&self, vg: &str, lv: &str) -> bool {
        self.state()
            .lvs
            .get(&format!("{}/{}", vg, lv))
            .map(|lv| lv.suspended)
            .unwrap_or(false)
    }

    /// The active device-mapper table of an LV.
    pub fn lv_table(&self, vg: &str, lv: &str) -> Option<String> {
        self.state()
            .lvs
            .get(&format!("{}/{}", vg, lv))
            .map(|lv| lv.active_table.clone())
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.state().domains.contains_key(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state()
            .domains
            .get(name)
            .map(|d| d.state == DomState::Running)
            .unwrap_or(false)
    }

    pub fn drbd_resources(&self) -> Vec<String> {
        self.state().drbd_up.keys().cloned().collect()
    }

    // =========================================================================
    // Command emulation
    // =========================================================================

    fn err(&self, cmd: &str, stderr: &str) -> RemoteExecError {
        RemoteExecError::CommandFailed {
            host: self.hostname.clone(),
            cmd: cmd.to_string(),
            status: 1,
            stderr: stderr.to_string(),
        }
    }

    fn dispatch(&self, cmd: &str) -> Result<String, RemoteExecError> {
        {
            let mut st = self.state();
            st.log
                .push((SEQUENCE.fetch_add(1, Ordering::SeqCst), cmd.to_string()));
            if st.fail_contains.iter().any(|needle| cmd.contains(needle)) {
                drop(st);
                return Err(self.err(cmd, "injected failure"));
            }
        }

        if cmd.starts_with("virsh migrate --live ") {
            return self.virsh_migrate(cmd);
        }

        let mut st = self.state();
        self.exec(&mut st, cmd)
    }

    fn exec(&self, st: &mut HostState, cmd: &str) -> Result<String, RemoteExecError> {
        // Shell output redirection: run the left side, capture into a file.
        if let Some((left, path)) = cmd.split_once(" > ") {
            let out = self.exec(st, left.trim())?;
            st.files.insert(path.trim().to_string(), Bytes::from(out));
            return Ok(String::new());
        }

        let tokens: Vec<&str> = cmd.split_whitespace().collect();
        match tokens.first().copied() {
            Some("lvcreate") => self.lvcreate(st, cmd, &tokens),
            Some("lvremove") => self.lvremove(st, cmd, &tokens),
            Some("lvrename") => self.lvrename(st, cmd, &tokens),
            Some("lvs") => self.lvs(st, cmd, &tokens),
            Some("vgs") => Ok(format!("  {:.2}\n", st.vg_free_gib)),
            Some("dd") => self.dd(st, cmd, &tokens),
            Some("stat") => self.stat(st, cmd, &tokens),
            Some("blockdev") => self.blockdev(st, cmd, &tokens),
            Some("dmsetup") => self.dmsetup(st, cmd, &tokens),
            Some("drbdadm") => self.drbdadm(st, cmd, &tokens),
            Some("drbdsetup") => Ok(String::new()),
            Some("virsh") => self.virsh(st, cmd, &tokens),
            Some("rm") => self.rm(st, cmd, &tokens),
            _ => Ok(String::new()),
        }
    }

    fn lvcreate(
        &self,
        st: &mut HostState,
        cmd: &str,
        tokens: &[&str],
    ) -> Result<String, RemoteExecError> {
        let name = tokens
            .iter()
            .position(|t| *t == "-n")
            .and_then(|i| tokens.get(i + 1))
            .ok_or_else(|| self.err(cmd, "lvcreate: no name given"))?;
        let size = tokens
            .iter()
            .find_map(|t| parse_lv_size(t))
            .ok_or_else(|| self.err(cmd, "lvcreate: no size given"))?;
        let vg = tokens
            .last()
            .ok_or_else(|| self.err(cmd, "lvcreate: no volume group"))?;

        let key = format!("{}/{}", vg, name);
        if st.lvs.contains_key(&key) {
            return Err(self.err(
                cmd,
                &format!("Logical Volume \"{}\" already exists in volume group \"{}\"", name, vg),
            ));
        }
        let minor = st.next_minor;
        st.next_minor += 1;
        st.lvs.insert(
            key,
            MockLv {
                minor,
                size_bytes: size,
                active_table: format!("0 {} linear 252:{} 0", size / 512, minor),
                inactive_table: None,
                suspended: false,
            },
        );
        Ok(String::new())
    }

    fn lvremove(
        &self,
        st: &mut HostState,
        cmd: &str,
        tokens: &[&str],
    ) -> Result<String, RemoteExecError> {
        let target = tokens
            .last()
            .ok_or_else(|| self.err(cmd, "lvremove: no volume"))?;
        if st.lvs.remove(*target).is_none() {
            return Err(self.err(cmd, &format!("Failed to find logical volume \"{}\"", target)));
        }
        Ok(String::new())
    }

    fn lvrename(
        &self,
        st: &mut HostState,
        cmd: &str,
        tokens: &[&str],
    ) -> Result<String, RemoteExecError> {
        let (Some(vg), Some(from), Some(to)) = (tokens.get(1), tokens.get(2), tokens.get(3))
        else {
            return Err(self.err(cmd, "lvrename: bad arguments"));
        };
        let old_key = format!("{}/{}", vg, from);
        let new_key = format!("{}/{}", vg, to);
        if st.lvs.contains_key(&new_key) {
            return Err(self.err(cmd, &format!("Logical Volume \"{}\" already exists", to)));
        }
        let lv = st
            .lvs
            .remove(&old_key)
            .ok_or_else(|| self.err(cmd, &format!("Existing logical volume \"{}\" not found", from)))?;
        st.lvs.insert(new_key, lv);
        Ok(String::new())
    }

    fn lvs(
        &self,
        st: &mut HostState,
        cmd: &str,
        tokens: &[&str],
    ) -> Result<String, RemoteExecError> {
        if cmd.contains("-o lv_size") {
            let target = tokens
                .last()
                .ok_or_else(|| self.err(cmd, "lvs: no volume"))?;
            let lv = st
                .lvs
                .get(*target)
                .ok_or_else(|| self.err(cmd, &format!("Failed to find logical volume \"{}\"", target)))?;
            return Ok(format!("  {}\n", lv.size_bytes));
        }
        if cmd.contains("-o vg_name,lv_name") {
            let vg = tokens
                .last()
                .ok_or_else(|| self.err(cmd, "lvs: no volume group"))?;
            let mut out = String::new();
            for key in st.lvs.keys() {
                if let Some((key_vg, key_lv)) = key.split_once('/') {
                    if key_vg == *vg {
                        out.push_str(&format!("  {} {}\n", key_vg, key_lv));
                    }
                }
            }
            return Ok(out);
        }
        Ok(String::new())
    }

    fn dd(
        &self,
        st: &mut HostState,
        cmd: &str,
        tokens: &[&str],
    ) -> Result<String, RemoteExecError> {
        let target = tokens
            .iter()
            .find_map(|t| t.strip_prefix("of="))
            .ok_or_else(|| self.err(cmd, "dd: no output file"))?;
        let key = target.trim_start_matches("/dev/");
        if !st.lvs.contains_key(key) {
            return Err(self.err(cmd, &format!("dd: failed to open '{}'", target)));
        }
        Ok(String::new())
    }

    fn stat(
        &self,
        st: &mut HostState,
        cmd: &str,
        tokens: &[&str],
    ) -> Result<String, RemoteExecError> {
        let path = tokens
            .last()
            .ok_or_else(|| self.err(cmd, "stat: no path"))?;
        let key = path.trim_start_matches("/dev/");
        let lv = st
            .lvs
            .get(key)
            .ok_or_else(|| self.err(cmd, &format!("stat: cannot stat '{}'", path)))?;
        Ok(format!("{:x}\n", lv.minor))
    }

    fn blockdev(
        &self,
        st: &mut HostState,
        cmd: &str,
        tokens: &[&str],
    ) -> Result<String, RemoteExecError> {
        match tokens.get(1).copied() {
            Some("--getss") => {
                let path = tokens
                    .get(2)
                    .ok_or_else(|| self.err(cmd, "blockdev: no device"))?;
                let size = st.block_sizes.get(*path).copied().unwrap_or(512);
                Ok(format!("{}\n", size))
            }
            Some("--setbsz") => Ok(String::new()),
            _ => Ok(String::new()),
        }
    }

    fn dmsetup(
        &self,
        st: &mut HostState,
        cmd: &str,
        tokens: &[&str],
    ) -> Result<String, RemoteExecError> {
        match tokens.get(1).copied() {
            Some("table") => {
                let path = tokens
                    .get(2)
                    .ok_or_else(|| self.err(cmd, "dmsetup table: no device"))?;
                let lv = self.lv_by_path(st, path)
                    .ok_or_else(|| self.err(cmd, &format!("Device {} not found", path)))?;
                Ok(format!("{}\n", lv.active_table))
            }
            Some("create") => {
                let name = tokens
                    .get(2)
                    .ok_or_else(|| self.err(cmd, "dmsetup create: no name"))?
                    .to_string();
                let table = self.stdin_table(st, cmd)?;
                if st.dm_devices.contains_key(&name) {
                    return Err(self.err(cmd, &format!("device {} already exists", name)));
                }
                st.dm_devices.insert(name, table);
                Ok(String::new())
            }
            Some("remove") => {
                let name = tokens
                    .get(2)
                    .ok_or_else(|| self.err(cmd, "dmsetup remove: no name"))?;
                let mapper_path = format!("/dev/mapper/{}", name);
                if st.drbd_up.values().any(|d| d.disk == mapper_path) {
                    return Err(self.err(cmd, "Device or resource busy"));
                }
                if st.dm_devices.remove(*name).is_none() {
                    return Err(self.err(cmd, &format!("device {} not found", name)));
                }
                Ok(String::new())
            }
            Some("suspend") => {
                let path = tokens
                    .get(2)
                    .ok_or_else(|| self.err(cmd, "dmsetup suspend: no device"))?
                    .to_string();
                let lv = self
                    .lv_by_path_mut(st, &path)
                    .ok_or_else(|| self.err(cmd, &format!("Device {} not found", path)))?;
                lv.suspended = true;
                Ok(String::new())
            }
            Some("resume") => {
                let path = tokens
                    .get(2)
                    .ok_or_else(|| self.err(cmd, "dmsetup resume: no device"))?
                    .to_string();
                let lv = self
                    .lv_by_path_mut(st, &path)
                    .ok_or_else(|| self.err(cmd, &format!("Device {} not found", path)))?;
                if let Some(table) = lv.inactive_table.take() {
                    lv.active_table = table;
                }
                lv.suspended = false;
                Ok(String::new())
            }
            Some("load") => {
                let path = tokens
                    .get(2)
                    .ok_or_else(|| self.err(cmd, "dmsetup load: no device"))?
                    .to_string();
                let table = if let Some(idx) = cmd.find("--table") {
                    let rest = &cmd[idx + "--table".len()..];
                    rest.trim().trim_matches('"').to_string()
                } else {
                    self.stdin_table(st, cmd)?
                };
                let lv = self
                    .lv_by_path_mut(st, &path)
                    .ok_or_else(|| self.err(cmd, &format!("Device {} not found", path)))?;
                lv.inactive_table = Some(table);
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }

    /// Resolve the `< file` stdin redirection of a dmsetup invocation.
    fn stdin_table(&self, st: &HostState, cmd: &str) -> Result<String, RemoteExecError> {
        let (_, file) = cmd
            .split_once(" < ")
            .ok_or_else(|| self.err(cmd, "no table given"))?;
        let content = st
            .files
            .get(file.trim())
            .ok_or_else(|| self.err(cmd, &format!("{}: No such file or directory", file.trim())))?;
        Ok(String::from_utf8_lossy(content).trim().to_string())
    }

    fn lv_by_path<'a>(&self, st: &'a HostState, path: &str) -> Option<&'a MockLv> {
        st.lvs.get(path.trim_start_matches("/dev/"))
    }

    fn lv_by_path_mut<'a>(&self, st: &'a mut HostState, path: &str) -> Option<&'a mut MockLv> {
        st.lvs.get_mut(path.trim_start_matches("/dev/"))
    }

    fn drbdadm(
        &self,
        st: &mut HostState,
        cmd: &str,
        tokens: &[&str],
    ) -> Result<String, RemoteExecError> {
        let resource = tokens
            .last()
            .ok_or_else(|| self.err(cmd, "drbdadm: no resource"))?
            .to_string();
        let verb = tokens.get(1).copied().unwrap_or_default();

        match verb {
            "create-md" => {
                if !st.files.contains_key(&format!("/etc/drbd.d/{}.res", resource)) {
                    return Err(self.err(cmd, &format!("no resources defined: {}", resource)));
                }
                Ok(String::new())
            }
            "up" => {
                if st.drbd_up.contains_key(&resource) {
                    return Err(self.err(cmd, &format!("{}: already configured", resource)));
                }
                let (minor, disk, meta) = self
                    .own_stanza(st, &resource)
                    .ok_or_else(|| self.err(cmd, &format!("no resources defined: {}", resource)))?;
                let shim = disk.trim_start_matches("/dev/mapper/");
                if !st.dm_devices.contains_key(shim) {
                    return Err(self.err(cmd, &format!("{}: not a block device", disk)));
                }
                if !st.lvs.contains_key(meta.trim_start_matches("/dev/")) {
                    return Err(self.err(cmd, &format!("{}: not a block device", meta)));
                }
                st.drbd_up.insert(resource, MockDrbd { minor, disk });
                Ok(String::new())
            }
            "down" => {
                let drbd = st
                    .drbd_up
                    .get(&resource)
                    .ok_or_else(|| self.err(cmd, &format!("no resources defined: {}", resource)))?;
                let device = format!("/dev/drbd{} ", drbd.minor);
                if st.lvs.values().any(|lv| lv.active_table.contains(&device)) {
                    return Err(self.err(
                        cmd,
                        &format!("State change failed: {} still in use", resource),
                    ));
                }
                st.drbd_up.remove(&resource);
                Ok(String::new())
            }
            "wait-connect" | "primary" | "--" => {
                // "drbdadm -- --overwrite-data-of-peer primary RES" and
                // "drbdadm -- primary RES" land here via the "--" verb.
                if !st.drbd_up.contains_key(&resource) {
                    return Err(self.err(cmd, &format!("no resources defined: {}", resource)));
                }
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }

    /// Parse this host's stanza out of the uploaded resource file:
    /// (device minor, backing disk, meta disk).
    fn own_stanza(&self, st: &HostState, resource: &str) -> Option<(u32, String, String)> {
        let content = st.files.get(&format!("/etc/drbd.d/{}.res", resource))?;
        let text = String::from_utf8_lossy(content);
        let marker = format!("on {} {{", self.hostname);
        let start = text.find(&marker)?;

        let mut minor = None;
        let mut disk = None;
        let mut meta = None;
        for line in text[start..].lines().skip(1) {
            let line = line.trim();
            if line.starts_with('}') {
                break;
            }
            if let Some(rest) = line.strip_prefix("device") {
                let dev = rest.trim().trim_end_matches(';');
                minor = dev.strip_prefix("/dev/drbd").and_then(|m| m.parse().ok());
            } else if let Some(rest) = line.strip_prefix("disk") {
                disk = Some(rest.trim().trim_end_matches(';').to_string());
            } else if let Some(rest) = line.strip_prefix("meta-disk") {
                meta = Some(rest.trim().trim_end_matches(';').to_string());
            }
        }
        Some((minor?, disk?, meta?))
    }

    fn virsh(
        &self,
        st: &mut HostState,
        cmd: &str,
        tokens: &[&str],
    ) -> Result<String, RemoteExecError> {
        match tokens.get(1).copied() {
            Some("list") => {
                let mut out = String::new();
                for name in st.domains.keys() {
                    out.push_str(name);
                    out.push('\n');
                }
                Ok(out)
            }
            Some("domstate") => {
                let name = self.domain_arg(cmd, tokens)?;
                let domain = st
                    .domains
                    .get(&name)
                    .ok_or_else(|| self.err(cmd, &format!("failed to get domain '{}'", name)))?;
                Ok(match domain.state {
                    DomState::Running => "running\n".to_string(),
                    DomState::Paused => "paused\n".to_string(),
                    DomState::ShutOff => "shut off\n".to_string(),
                })
            }
            Some("define") => {
                let path = tokens
                    .get(2)
                    .ok_or_else(|| self.err(cmd, "define: no file"))?;
                let content = st
                    .files
                    .get(*path)
                    .ok_or_else(|| self.err(cmd, &format!("failed to read XML file {}", path)))?;
                let xml = String::from_utf8_lossy(content).to_string();
                let name = xml_text(&xml, "name")
                    .ok_or_else(|| self.err(cmd, "XML error: no name"))?;
                let memory_mib = xml_text(&xml, "memory")
                    .and_then(|m| m.parse().ok())
                    .unwrap_or(0);
                let vcpus = xml_text(&xml, "vcpu")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1);
                let state = st
                    .domains
                    .get(&name)
                    .map(|d| d.state)
                    .unwrap_or(DomState::ShutOff);
                st.domains.insert(
                    name,
                    MockDomain {
                        state,
                        memory_mib,
                        vcpus,
                    },
                );
                Ok(String::new())
            }
            Some("undefine") => {
                let name = self.domain_arg(cmd, tokens)?;
                if st.domains.remove(&name).is_none() {
                    return Err(self.err(cmd, &format!("failed to get domain '{}'", name)));
                }
                Ok(String::new())
            }
            Some("start") => {
                let name = self.domain_arg(cmd, tokens)?;
                let domain = st
                    .domains
                    .get_mut(&name)
                    .ok_or_else(|| self.err(cmd, &format!("failed to get domain '{}'", name)))?;
                if domain.state != DomState::ShutOff {
                    return Err(self.err(cmd, &format!("Domain '{}' is already active", name)));
                }
                domain.state = DomState::Running;
                Ok(String::new())
            }
            Some("shutdown") => {
                let name = self.domain_arg(cmd, tokens)?;
                let domain = st
                    .domains
                    .get_mut(&name)
                    .ok_or_else(|| self.err(cmd, &format!("failed to get domain '{}'", name)))?;
                if domain.state != DomState::Running {
                    return Err(self.err(cmd, &format!("domain '{}' is not running", name)));
                }
                domain.state = DomState::ShutOff;
                Ok(String::new())
            }
            Some("destroy") => {
                let name = self.domain_arg(cmd, tokens)?;
                let domain = st
                    .domains
                    .get_mut(&name)
                    .ok_or_else(|| self.err(cmd, &format!("failed to get domain '{}'", name)))?;
                if domain.state == DomState::ShutOff {
                    return Err(self.err(cmd, &format!("domain '{}' is not running", name)));
                }
                domain.state = DomState::ShutOff;
                Ok(String::new())
            }
            Some("suspend") => {
                let name = self.domain_arg(cmd, tokens)?;
                let domain = st
                    .domains
                    .get_mut(&name)
                    .ok_or_else(|| self.err(cmd, &format!("failed to get domain '{}'", name)))?;
                if domain.state != DomState::Running {
                    return Err(self.err(cmd, &format!("domain '{}' is not running", name)));
                }
                domain.state = DomState::Paused;
                Ok(String::new())
            }
            Some("resume") => {
                let name = self.domain_arg(cmd, tokens)?;
                let domain = st
                    .domains
                    .get_mut(&name)
                    .ok_or_else(|| self.err(cmd, &format!("failed to get domain '{}'", name)))?;
                if domain.state != DomState::Paused {
                    return Err(self.err(cmd, &format!("domain '{}' is not paused", name)));
                }
                domain.state = DomState::Running;
                Ok(String::new())
            }
            Some("dominfo") => {
                let name = self.domain_arg(cmd, tokens)?;
                let domain = st
                    .domains
                    .get(&name)
                    .ok_or_else(|| self.err(cmd, &format!("failed to get domain '{}'", name)))?;
                let state = match domain.state {
                    DomState::Running => "running",
                    DomState::Paused => "paused",
                    DomState::ShutOff => "shut off",
                };
                Ok(format!(
                    "Id:             1\n\
                     Name:           {}\n\
                     OS Type:        hvm\n\
                     State:          {}\n\
                     CPU(s):         {}\n\
                     Max memory:     {} KiB\n\
                     Used memory:    {} KiB\n",
                    name,
                    state,
                    domain.vcpus,
                    domain.memory_mib * 1024,
                    domain.memory_mib * 1024,
                ))
            }
            Some("nodememstats") => Ok(format!(
                "total  :             134217728 KiB\n\
                 free   :             {} KiB\n\
                 buffers:              257728 KiB\n\
                 cached :             2352360 KiB\n",
                st.free_memory_kib
            )),
            _ => Ok(String::new()),
        }
    }

    fn domain_arg(&self, cmd: &str, tokens: &[&str]) -> Result<String, RemoteExecError> {
        tokens
            .get(2)
            .map(|t| t.to_string())
            .ok_or_else(|| self.err(cmd, "no domain given"))
    }

    fn virsh_migrate(&self, cmd: &str) -> Result<String, RemoteExecError> {
        let tokens: Vec<&str> = cmd.split_whitespace().collect();
        let name = tokens
            .get(3)
            .map(|t| t.to_string())
            .ok_or_else(|| self.err(cmd, "migrate: no domain"))?;

        let peer = {
            let st = self.state();
            let domain = st
                .domains
                .get(&name)
                .ok_or_else(|| self.err(cmd, &format!("failed to get domain '{}'", name)))?;
            if domain.state != DomState::Running {
                return Err(self.err(cmd, &format!("domain '{}' is not running", name)));
            }
            st.peer
                .clone()
                .ok_or_else(|| self.err(cmd, "unable to connect to destination"))?
        };

        {
            let mut peer_state = peer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let domain = peer_state.domains.get_mut(&name).ok_or_else(|| {
                self.err(cmd, &format!("no domain '{}' defined on destination", name))
            })?;
            domain.state = DomState::Running;
        }

        if let Some(domain) = self.state().domains.get_mut(&name) {
            domain.state = DomState::ShutOff;
        }
        Ok(String::new())
    }

    fn rm(
        &self,
        st: &mut HostState,
        cmd: &str,
        tokens: &[&str],
    ) -> Result<String, RemoteExecError> {
        let force = tokens.contains(&"-f");
        let path = tokens
            .last()
            .ok_or_else(|| self.err(cmd, "rm: no path"))?;
        if st.files.remove(*path).is_none() && !force {
            return Err(self.err(
                cmd,
                &format!("rm: cannot remove '{}': No such file or directory", path),
            ));
        }
        Ok(String::new())
    }

    fn render_proc_drbd(&self) -> String {
        let mut st = self.state();
        let syncing = if st.sync_polls_remaining > 0 {
            st.sync_polls_remaining -= 1;
            true
        } else {
            false
        };

        let mut out = String::from(
            "version: 8.4.10 (api:1/proto:86-101)\nsrcversion: 473968AD625BA317874A57E\n",
        );
        let mut resources: Vec<&MockDrbd> = st.drbd_up.values().collect();
        resources.sort_by_key(|d| d.minor);
        for drbd in resources {
            if syncing {
                out.push_str(&format!(
                    " {}: cs:SyncSource ro:Primary/Secondary ds:UpToDate/Inconsistent C r-----\n",
                    drbd.minor
                ));
                out.push_str(
                    "    ns:1048576 nr:0 dw:0 dr:1048576 al:8 bm:0 lo:0 pe:0 ua:0 ap:0 ep:1 wo:f oos:5242880\n",
                );
                out.push_str("\t[===>................] sync'ed: 20.0% (5120/6144)M\n");
            } else {
                out.push_str(&format!(
                    " {}: cs:Connected ro:Primary/Primary ds:UpToDate/UpToDate C r-----\n",
                    drbd.minor
                ));
                out.push_str(
                    "    ns:6291456 nr:0 dw:0 dr:6291456 al:8 bm:0 lo:0 pe:0 ua:0 ap:0 ep:1 wo:f oos:0\n",
                );
            }
        }
        out
    }
}

#[async_trait]
impl RemoteExec for MockRemote {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn run(&self, cmd: &str, opts: RunOpts) -> Result<String, RemoteExecError> {
        match self.dispatch(cmd) {
            Ok(out) => Ok(out),
            Err(err) if opts.warn_only => {
                warn!(host = %self.hostname, command = %cmd, error = %err, "Mock command failed, continuing");
                Ok(String::new())
            }
            Err(err) => Err(err),
        }
    }

    async fn put(&self, path: &str, data: Bytes, mode: &str) -> Result<(), RemoteExecError> {
        let mut st = self.state();
        st.log.push((
            SEQUENCE.fetch_add(1, Ordering::SeqCst),
            format!("put {} (mode {})", path, mode),
        ));
        st.files.insert(path.to_string(), data);
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Bytes, RemoteExecError> {
        if path == "/proc/drbd" {
            return Ok(Bytes::from(self.render_proc_drbd()));
        }
        self.state()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteExecError::TransferFailed {
                host: self.hostname.clone(),
                path: path.to_string(),
                reason: "No such file or directory".to_string(),
            })
    }
}

fn parse_lv_size(token: &str) -> Option<u64> {
    let value = token.strip_prefix("-L")?;
    if value.is_empty() {
        return None;
    }
    let (number, suffix) = value.split_at(value.len() - 1);
    let number: u64 = number.parse().ok()?;
    match suffix {
        "M" | "m" => Some(number << 20),
        "G" | "g" => Some(number << 30),
        _ => None,
    }
}

/// Extract the text of the first `<tag ...>text</tag>` element.
fn xml_text(xml: &str, tag: &str) -> Option<String> {
    let open = xml.find(&format!("<{}", tag))?;
    let start = xml[open..].find('>')? + open + 1;
    let end = xml[start..].find(&format!("</{}>", tag))? + start;
    Some(xml[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_commands_succeed() {
        let remote = MockRemote::new("hv1");
        let out = remote.run("mount /dev/a /mnt/b", RunOpts::default()).await;
        assert_eq!(out.unwrap(), "");
    }

    #[tokio::test]
    async fn lv_lifecycle_and_minors() {
        let remote = MockRemote::new("hv1");
        remote
            .run("lvcreate -y -n vm1_meta -L256M xen-data", RunOpts::default())
            .await
            .unwrap();
        assert!(remote.has_lv("xen-data", "vm1_meta"));

        let minor = remote
            .run("stat -L -c \"%T\" /dev/xen-data/vm1_meta", RunOpts::silent())
            .await
            .unwrap();
        assert_eq!(u32::from_str_radix(minor.trim(), 16).unwrap(), 10);

        let err = remote
            .run("lvcreate -y -n vm1_meta -L256M xen-data", RunOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteExecError::CommandFailed { .. }));

        remote
            .run("lvremove -fy xen-data/vm1_meta", RunOpts::default())
            .await
            .unwrap();
        assert!(!remote.has_lv("xen-data", "vm1_meta"));
    }

    #[tokio::test]
    async fn table_dump_redirection_lands_in_file() {
        let remote = MockRemote::new("hv1");
        remote.add_lv("xen-data", "vm1", 6 << 30);

        remote
            .run(
                "dmsetup table /dev/xen-data/vm1 > /tmp/xen-data_vm1_table",
                RunOpts::default(),
            )
            .await
            .unwrap();
        let table = remote.file("/tmp/xen-data_vm1_table").unwrap();
        assert!(String::from_utf8_lossy(&table).starts_with("0 12582912 linear"));
    }

    #[tokio::test]
    async fn inactive_slot_swaps_on_resume() {
        let remote = MockRemote::new("hv1");
        remote.add_lv("xen-data", "vm1", 6 << 30);

        remote
            .run(
                "dmsetup load /dev/xen-data/vm1 --table \"0 12582912 linear /dev/drbd10 0\"",
                RunOpts::default(),
            )
            .await
            .unwrap();
        // Still the original table until resume.
        let table = remote
            .run("dmsetup table /dev/xen-data/vm1", RunOpts::default())
            .await
            .unwrap();
        assert!(table.contains("252:"));

        remote
            .run("dmsetup resume /dev/xen-data/vm1", RunOpts::default())
            .await
            .unwrap();
        let table = remote
            .run("dmsetup table /dev/xen-data/vm1", RunOpts::default())
            .await
            .unwrap();
        assert!(table.contains("/dev/drbd10"));
    }

    #[tokio::test]
    async fn failure_injection() {
        let remote = MockRemote::new("hv1");
        remote.fail_when_contains("--environment doesnotexist");

        let err = remote
            .run(
                "chroot /mnt/vm1 puppet agent --onetime --environment doesnotexist",
                RunOpts::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("injected failure"));
    }
}
