//! In-process simulated pool
//!
//! `SimulatedPool` keeps a small object database behind a mutex and enforces
//! the server-side rules the agent relies on: session validity, plug/unplug
//! ordering, duplicate backing stores, memory constraints and CD eviction
//! before migration. Faults can be injected per method so failure paths can
//! be exercised without a real pool.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::types::*;
use super::ManagementApi;
use crate::error::{
    HANDLE_INVALID, SESSION_AUTHENTICATION_FAILED, SESSION_INVALID, SR_DEVICE_IN_USE, UUID_INVALID,
};
use crate::session::Connector;
use crate::stats::RrdSource;
use crate::vm::MemoryLimits;
use crate::{Error, Result};

const GIB: u64 = 1024 * 1024 * 1024;

/// A recorded plugin invocation.
#[derive(Debug, Clone)]
pub struct PluginCall {
    pub host: OpaqueRef,
    pub plugin: String,
    pub function: String,
    pub args: BTreeMap<String, String>,
}

/// Seed for a VDI placed directly into an SR.
#[derive(Debug, Clone, Default)]
pub struct VdiSeed {
    pub name: String,
    pub virtual_size: u64,
    pub physical_utilisation: u64,
    pub parent: Option<String>,
    pub is_a_snapshot: bool,
    pub managed: bool,
}

#[derive(Debug, Clone)]
enum FaultKind {
    Call(String),
    Task(Vec<String>),
}

#[derive(Debug, Clone)]
struct Fault {
    method: String,
    kind: FaultKind,
    /// Matching calls let through before the fault starts firing.
    skip: u32,
    remaining: u32,
}

#[derive(Debug)]
struct SimTask {
    record: TaskRecord,
    outcome: std::result::Result<String, Vec<String>>,
    polls_remaining: u32,
    hang: bool,
}

/// An SR that was forgotten but whose backing store still holds it.
#[derive(Debug, Clone)]
struct DetachedSr {
    uuid: String,
    name_label: String,
    sr_type: String,
    content_type: String,
    shared: bool,
    device_config: BTreeMap<String, String>,
}

#[derive(Default)]
struct SimState {
    counter: u64,
    pool_uuid: String,
    users: HashMap<String, String>,
    sessions: HashSet<String>,
    hosts: BTreeMap<OpaqueRef, HostRecord>,
    vms: BTreeMap<OpaqueRef, VmRecord>,
    srs: BTreeMap<OpaqueRef, SrRecord>,
    pbds: BTreeMap<OpaqueRef, PbdRecord>,
    vdis: BTreeMap<OpaqueRef, VdiRecord>,
    vbds: BTreeMap<OpaqueRef, VbdRecord>,
    vifs: BTreeMap<OpaqueRef, VifRecord>,
    networks: BTreeMap<OpaqueRef, NetworkRecord>,
    pifs: BTreeMap<OpaqueRef, PifRecord>,
    tasks: BTreeMap<OpaqueRef, SimTask>,
    detached_srs: Vec<DetachedSr>,
    iso_images: HashMap<String, Vec<String>>,
    sr_device_configs: HashMap<OpaqueRef, BTreeMap<String, String>>,
    plugin_responses: HashMap<(String, String), String>,
    plugin_calls: Vec<PluginCall>,
    faults: Vec<Fault>,
    calls: Vec<String>,
    task_destroys: HashMap<OpaqueRef, u32>,
    task_latency: u32,
    hang_tasks: bool,
    expire_task_handles: bool,
}

fn fail(call: &str, code: &str, params: &[&str]) -> Error {
    Error::api(call, code, params.iter().map(|p| p.to_string()).collect())
}

fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Fields that identify a backing store; CHAP secrets do not.
fn backing_identity(device_config: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    device_config
        .iter()
        .filter(|(k, _)| !k.starts_with("chap"))
        .map(|(k, v)| (k.clone(), v.trim_end_matches('/').to_string()))
        .collect()
}

fn lookup<'a, T>(map: &'a BTreeMap<OpaqueRef, T>, r: &OpaqueRef, call: &str) -> Result<&'a T> {
    map.get(r).ok_or_else(|| fail(call, HANDLE_INVALID, &[r.as_str()]))
}

fn lookup_mut<'a, T>(map: &'a mut BTreeMap<OpaqueRef, T>, r: &OpaqueRef, call: &str) -> Result<&'a mut T> {
    map.get_mut(r).ok_or_else(|| fail(call, HANDLE_INVALID, &[r.as_str()]))
}

fn find_by_uuid<T>(map: &BTreeMap<OpaqueRef, T>, uuid: &str, call: &str, get: impl Fn(&T) -> &str) -> Result<OpaqueRef> {
    map.iter()
        .find(|(_, rec)| get(rec) == uuid)
        .map(|(r, _)| r.clone())
        .ok_or_else(|| fail(call, UUID_INVALID, &[uuid]))
}

impl SimState {
    fn next_ref(&mut self) -> OpaqueRef {
        self.counter += 1;
        OpaqueRef::new(format!("OpaqueRef:{}", self.counter))
    }

    fn take_call_fault(&mut self, method: &str) -> Option<String> {
        let fault = self.faults.iter_mut().find(|f| {
            f.method == method && f.remaining > 0 && matches!(f.kind, FaultKind::Call(_))
        })?;
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        fault.remaining -= 1;
        match &fault.kind {
            FaultKind::Call(code) => Some(code.clone()),
            FaultKind::Task(_) => None,
        }
    }

    fn take_task_fault(&mut self, method: &str) -> Option<Vec<String>> {
        let fault = self.faults.iter_mut().find(|f| {
            f.method == method && f.remaining > 0 && matches!(f.kind, FaultKind::Task(_))
        })?;
        fault.remaining -= 1;
        match &fault.kind {
            FaultKind::Task(info) => Some(info.clone()),
            FaultKind::Call(_) => None,
        }
    }

    fn first_host(&self) -> Option<OpaqueRef> {
        self.hosts.keys().next().cloned()
    }

    fn sr_has_attached_pbd(&self, sr: &OpaqueRef) -> bool {
        self.pbds.values().any(|p| &p.sr == sr && p.currently_attached)
    }

    fn vdi_in_use(&self, vdi: &OpaqueRef) -> bool {
        self.vbds.values().any(|b| &b.vdi == vdi && b.currently_attached)
    }

    fn remove_vbd(&mut self, vbd: &OpaqueRef) {
        if let Some(rec) = self.vbds.remove(vbd) {
            if let Some(vm) = self.vms.get_mut(&rec.vm) {
                vm.vbds.retain(|b| b != vbd);
            }
            if let Some(vdi) = self.vdis.get_mut(&rec.vdi) {
                vdi.vbds.retain(|b| b != vbd);
            }
        }
    }

    fn remove_vif(&mut self, vif: &OpaqueRef) {
        if let Some(rec) = self.vifs.remove(vif) {
            if let Some(vm) = self.vms.get_mut(&rec.vm) {
                vm.vifs.retain(|v| v != vif);
            }
            if let Some(net) = self.networks.get_mut(&rec.network) {
                net.vifs.retain(|v| v != vif);
            }
        }
    }

    fn remove_vdi(&mut self, vdi: &OpaqueRef) {
        let vbds: Vec<_> = self
            .vbds
            .iter()
            .filter(|(_, b)| &b.vdi == vdi)
            .map(|(r, _)| r.clone())
            .collect();
        for vbd in vbds {
            self.remove_vbd(&vbd);
        }
        if let Some(rec) = self.vdis.remove(vdi) {
            if let Some(sr) = self.srs.get_mut(&rec.sr) {
                sr.vdis.retain(|v| v != vdi);
            }
        }
    }

    fn insert_vdi(&mut self, sr: &OpaqueRef, record: VdiRecord) -> OpaqueRef {
        let r = self.next_ref();
        if let Some(sr_rec) = self.srs.get_mut(sr) {
            sr_rec.vdis.push(r.clone());
        }
        self.vdis.insert(r.clone(), record);
        r
    }

    fn detach_vm_devices(&mut self, vm: &OpaqueRef) {
        for vbd in self.vbds.values_mut().filter(|b| &b.vm == vm) {
            vbd.currently_attached = false;
        }
        for vif in self.vifs.values_mut().filter(|v| &v.vm == vm) {
            vif.currently_attached = false;
        }
    }

    fn materialize_iso_images(&mut self, sr: &OpaqueRef) {
        let Some(location) = self
            .sr_device_configs
            .get(sr)
            .and_then(|dc| dc.get("location"))
            .cloned()
        else {
            return;
        };
        let files = self.iso_images.get(&location).cloned().unwrap_or_default();
        for file in files {
            let present = self
                .vdis
                .values()
                .any(|v| &v.sr == sr && v.name_label == file);
            if !present {
                let record = VdiRecord {
                    uuid: new_uuid(),
                    name_label: file,
                    sr: sr.clone(),
                    virtual_size: GIB,
                    physical_utilisation: GIB,
                    vdi_type: VdiType::Iso,
                    read_only: true,
                    sharable: true,
                    managed: true,
                    is_a_snapshot: false,
                    snapshot_of: OpaqueRef::null(),
                    vbds: vec![],
                    sm_config: BTreeMap::new(),
                };
                self.insert_vdi(sr, record);
            }
        }
    }

    /// Snapshot a leaf VDI: the leaf's data moves into a hidden parent node
    /// shared by the leaf and the new snapshot.
    fn snapshot_vdi(&mut self, vdi: &OpaqueRef, call: &str) -> Result<OpaqueRef> {
        let leaf = lookup(&self.vdis, vdi, call)?.clone();
        let mut parent_sm = BTreeMap::new();
        if let Some(p) = leaf.vhd_parent() {
            parent_sm.insert(VHD_PARENT_KEY.to_string(), p.to_string());
        }
        let parent = VdiRecord {
            uuid: new_uuid(),
            name_label: "base copy".into(),
            sr: leaf.sr.clone(),
            virtual_size: leaf.virtual_size,
            physical_utilisation: leaf.physical_utilisation,
            vdi_type: leaf.vdi_type,
            read_only: true,
            sharable: false,
            managed: false,
            is_a_snapshot: false,
            snapshot_of: OpaqueRef::null(),
            vbds: vec![],
            sm_config: parent_sm,
        };
        let parent_uuid = parent.uuid.clone();
        self.insert_vdi(&leaf.sr, parent);

        if let Some(l) = self.vdis.get_mut(vdi) {
            l.physical_utilisation = 0;
            l.sm_config.insert(VHD_PARENT_KEY.into(), parent_uuid.clone());
        }

        let mut sm = BTreeMap::new();
        sm.insert(VHD_PARENT_KEY.to_string(), parent_uuid);
        let snapshot = VdiRecord {
            uuid: new_uuid(),
            name_label: leaf.name_label.clone(),
            sr: leaf.sr.clone(),
            virtual_size: leaf.virtual_size,
            physical_utilisation: 0,
            vdi_type: leaf.vdi_type,
            read_only: false,
            sharable: false,
            managed: true,
            is_a_snapshot: true,
            snapshot_of: vdi.clone(),
            vbds: vec![],
            sm_config: sm,
        };
        Ok(self.insert_vdi(&leaf.sr, snapshot))
    }

    fn chain_physical(&self, vdi: &VdiRecord) -> u64 {
        let mut total = vdi.physical_utilisation;
        let mut parent = vdi.vhd_parent().map(str::to_string);
        let mut depth = 0;
        while let Some(uuid) = parent {
            depth += 1;
            if depth > 64 {
                break;
            }
            match self.vdis.values().find(|v| v.uuid == uuid) {
                Some(rec) => {
                    total += rec.physical_utilisation;
                    parent = rec.vhd_parent().map(str::to_string);
                }
                None => break,
            }
        }
        total
    }

    fn bad_power_state(vm: &OpaqueRef, expected: &str, actual: VmPowerState) -> Vec<String> {
        vec![
            "VM_BAD_POWER_STATE".into(),
            vm.to_string(),
            expected.into(),
            actual.to_string().to_lowercase(),
        ]
    }

    /// Apply an async call's side effect, returning the task result or error info.
    fn apply_async(&mut self, call: &AsyncCall) -> std::result::Result<String, Vec<String>> {
        let missing = |r: &OpaqueRef| vec![HANDLE_INVALID.to_string(), r.to_string()];
        match call {
            AsyncCall::VmStart { vm, host } => {
                let rec = self.vms.get(vm).ok_or_else(|| missing(vm))?;
                if rec.is_a_template {
                    return Err(vec!["VM_IS_TEMPLATE".into(), vm.to_string()]);
                }
                if rec.power_state != VmPowerState::Halted {
                    return Err(Self::bad_power_state(vm, "halted", rec.power_state));
                }
                if rec.memory.validate().is_err() {
                    return Err(vec!["MEMORY_CONSTRAINT_VIOLATION".into()]);
                }
                let host = match host {
                    Some(h) => h.clone(),
                    None => self.first_host().ok_or_else(|| vec!["HOST_NOT_ENOUGH_FREE_MEMORY".to_string()])?,
                };
                for vbd in self.vbds.values_mut().filter(|b| &b.vm == vm && !b.empty) {
                    vbd.currently_attached = true;
                }
                for vif in self.vifs.values_mut().filter(|v| &v.vm == vm) {
                    vif.currently_attached = true;
                }
                if let Some(rec) = self.vms.get_mut(vm) {
                    rec.power_state = VmPowerState::Running;
                    rec.resident_on = host;
                }
                Ok(String::new())
            }
            AsyncCall::VmCleanShutdown { vm } | AsyncCall::VmHardShutdown { vm } => {
                let rec = self.vms.get(vm).ok_or_else(|| missing(vm))?;
                if rec.power_state == VmPowerState::Halted {
                    return Err(Self::bad_power_state(vm, "running", rec.power_state));
                }
                self.detach_vm_devices(vm);
                if let Some(rec) = self.vms.get_mut(vm) {
                    rec.power_state = VmPowerState::Halted;
                    rec.resident_on = OpaqueRef::null();
                }
                Ok(String::new())
            }
            AsyncCall::VmCleanReboot { vm } | AsyncCall::VmHardReboot { vm } => {
                let rec = self.vms.get(vm).ok_or_else(|| missing(vm))?;
                if rec.power_state != VmPowerState::Running {
                    return Err(Self::bad_power_state(vm, "running", rec.power_state));
                }
                Ok(String::new())
            }
            AsyncCall::VmPoolMigrate { vm, host, .. } => {
                let rec = self.vms.get(vm).ok_or_else(|| missing(vm))?;
                if rec.power_state != VmPowerState::Running {
                    return Err(Self::bad_power_state(vm, "running", rec.power_state));
                }
                if !self.hosts.contains_key(host) {
                    return Err(missing(host));
                }
                let cd_inserted = self
                    .vbds
                    .values()
                    .any(|b| &b.vm == vm && b.vbd_type == VbdType::Cd && !b.empty);
                if cd_inserted {
                    return Err(vec!["VM_HAS_CD_INSERTED".into(), vm.to_string()]);
                }
                if let Some(rec) = self.vms.get_mut(vm) {
                    rec.resident_on = host.clone();
                }
                Ok(String::new())
            }
            AsyncCall::VmSnapshot { vm, name } => {
                let source = self.vms.get(vm).ok_or_else(|| missing(vm))?.clone();
                let disks: Vec<VbdRecord> = source
                    .vbds
                    .iter()
                    .filter_map(|b| self.vbds.get(b))
                    .filter(|b| b.vbd_type == VbdType::Disk && !b.empty)
                    .cloned()
                    .collect();
                let snap_ref = self.next_ref();
                let mut snap_vbds = Vec::new();
                for disk in disks {
                    let snap_vdi = self
                        .snapshot_vdi(&disk.vdi, "VM.snapshot")
                        .map_err(|e| vec![e.to_string()])?;
                    let vbd_ref = self.next_ref();
                    let vbd = VbdRecord {
                        uuid: new_uuid(),
                        vm: snap_ref.clone(),
                        vdi: snap_vdi.clone(),
                        currently_attached: false,
                        ..disk
                    };
                    if let Some(v) = self.vdis.get_mut(&snap_vdi) {
                        v.vbds.push(vbd_ref.clone());
                    }
                    self.vbds.insert(vbd_ref.clone(), vbd);
                    snap_vbds.push(vbd_ref);
                }
                let snapshot = VmRecord {
                    uuid: new_uuid(),
                    name_label: name.clone(),
                    power_state: VmPowerState::Halted,
                    is_a_template: true,
                    is_a_snapshot: true,
                    snapshot_of: vm.clone(),
                    resident_on: OpaqueRef::null(),
                    vbds: snap_vbds,
                    vifs: vec![],
                    snapshots: vec![],
                    ..source
                };
                self.vms.insert(snap_ref.clone(), snapshot);
                if let Some(rec) = self.vms.get_mut(vm) {
                    rec.snapshots.push(snap_ref.clone());
                }
                Ok(snap_ref.to_string())
            }
            AsyncCall::VmRevert { snapshot } => {
                let snap = self.vms.get(snapshot).ok_or_else(|| missing(snapshot))?;
                if !snap.is_a_snapshot {
                    return Err(vec!["VM_NOT_A_SNAPSHOT".into(), snapshot.to_string()]);
                }
                let vm = snap.snapshot_of.clone();
                if !self.vms.contains_key(&vm) {
                    return Err(missing(&vm));
                }
                self.detach_vm_devices(&vm);
                if let Some(rec) = self.vms.get_mut(&vm) {
                    rec.power_state = VmPowerState::Halted;
                    rec.resident_on = OpaqueRef::null();
                }
                Ok(String::new())
            }
            AsyncCall::VdiCopy { vdi, sr } => {
                let source = self.vdis.get(vdi).ok_or_else(|| missing(vdi))?.clone();
                if !self.srs.contains_key(sr) {
                    return Err(missing(sr));
                }
                if !self.sr_has_attached_pbd(sr) {
                    return Err(vec!["SR_NOT_ATTACHED".into(), sr.to_string()]);
                }
                let record = VdiRecord {
                    uuid: new_uuid(),
                    sr: sr.clone(),
                    physical_utilisation: self.chain_physical(&source),
                    managed: true,
                    is_a_snapshot: false,
                    snapshot_of: OpaqueRef::null(),
                    vbds: vec![],
                    sm_config: BTreeMap::new(),
                    ..source
                };
                Ok(self.insert_vdi(sr, record).to_string())
            }
            AsyncCall::SrScan { sr } => {
                if !self.srs.contains_key(sr) {
                    return Err(missing(sr));
                }
                if !self.sr_has_attached_pbd(sr) {
                    return Err(vec!["SR_NOT_ATTACHED".into(), sr.to_string()]);
                }
                self.materialize_iso_images(sr);
                Ok(String::new())
            }
        }
    }
}

/// In-memory pool implementing [`ManagementApi`].
///
/// Cloning yields another handle onto the same pool.
#[derive(Clone)]
pub struct SimulatedPool {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPool {
    pub fn new() -> Self {
        let mut state = SimState {
            pool_uuid: new_uuid(),
            ..Default::default()
        };
        state
            .plugin_responses
            .insert(("vmops".into(), "network_rules".into()), "true".into());
        state
            .plugin_responses
            .insert(("vmops".into(), "heartbeat".into()), "> DONE <".into());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Lock the pool for one API call: logs the call, validates the session
    /// and consumes any injected fault for `call`.
    fn enter(&self, session: Option<&SessionRef>, call: &str) -> Result<MutexGuard<'_, SimState>> {
        let mut st = self.state.lock();
        st.calls.push(call.to_string());
        if let Some(session) = session {
            if !st.sessions.contains(session.as_str()) {
                return Err(fail(call, SESSION_INVALID, &[session.as_str()]));
            }
        }
        if let Some(code) = st.take_call_fault(call) {
            return Err(fail(call, &code, &[]));
        }
        Ok(st)
    }

    // ----- seeding -----

    pub fn pool_uuid(&self) -> String {
        self.state.lock().pool_uuid.clone()
    }

    pub fn add_user(&self, username: &str, password: &str) {
        self.state
            .lock()
            .users
            .insert(username.to_string(), password.to_string());
    }

    /// Add a host with a management interface on `eth0`.
    pub fn add_host(&self, uuid: &str, name: &str, address: &str) -> OpaqueRef {
        let mut st = self.state.lock();
        let host = st.next_ref();
        let net = st.next_ref();
        let pif = st.next_ref();
        let bridge = format!("xenbr{}", st.networks.len());
        st.networks.insert(
            net.clone(),
            NetworkRecord {
                uuid: new_uuid(),
                name_label: format!("Management network on {}", name),
                bridge,
                mtu: 1500,
                pifs: vec![pif.clone()],
                vifs: vec![],
                other_config: BTreeMap::new(),
            },
        );
        st.pifs.insert(
            pif.clone(),
            PifRecord {
                uuid: new_uuid(),
                device: "eth0".into(),
                host: host.clone(),
                network: net,
                vlan: -1,
                management: true,
            },
        );
        st.hosts.insert(
            host.clone(),
            HostRecord {
                uuid: uuid.to_string(),
                name_label: name.to_string(),
                address: address.to_string(),
                cpu_count: 8,
                cpu_speed_mhz: 2600,
                product_version: "8.2.1".into(),
                memory_total: 64 * GIB,
                memory_free: 48 * GIB,
                pifs: vec![pif],
            },
        );
        host
    }

    /// Put the management interface of `host_uuid` on a VLAN.
    pub fn set_management_vlan(&self, host_uuid: &str, tag: i64) {
        let mut st = self.state.lock();
        let host = st
            .hosts
            .iter()
            .find(|(_, h)| h.uuid == host_uuid)
            .map(|(r, _)| r.clone());
        if let Some(host) = host {
            for pif in st.pifs.values_mut().filter(|p| p.host == host && p.management) {
                pif.vlan = tag;
            }
        }
    }

    /// Add a network with an untagged interface on every host.
    pub fn add_network(&self, name_label: &str, device: &str) -> String {
        let mut st = self.state.lock();
        let net = st.next_ref();
        let uuid = new_uuid();
        let hosts: Vec<_> = st.hosts.keys().cloned().collect();
        let mut pifs = Vec::new();
        for host in hosts {
            let pif = st.next_ref();
            st.pifs.insert(
                pif.clone(),
                PifRecord {
                    uuid: new_uuid(),
                    device: device.to_string(),
                    host: host.clone(),
                    network: net.clone(),
                    vlan: -1,
                    management: false,
                },
            );
            if let Some(h) = st.hosts.get_mut(&host) {
                h.pifs.push(pif.clone());
            }
            pifs.push(pif);
        }
        let bridge = format!("xenbr{}", st.networks.len());
        st.networks.insert(
            net,
            NetworkRecord {
                uuid: uuid.clone(),
                name_label: name_label.to_string(),
                bridge,
                mtu: 1500,
                pifs,
                vifs: vec![],
                other_config: BTreeMap::new(),
            },
        );
        uuid
    }

    pub fn add_template(&self, name_label: &str) -> String {
        let mut st = self.state.lock();
        let r = st.next_ref();
        let uuid = new_uuid();
        st.vms.insert(
            r,
            VmRecord {
                uuid: uuid.clone(),
                name_label: name_label.to_string(),
                power_state: VmPowerState::Halted,
                is_a_template: true,
                is_a_snapshot: false,
                is_control_domain: false,
                snapshot_of: OpaqueRef::null(),
                resident_on: OpaqueRef::null(),
                affinity: OpaqueRef::null(),
                memory: MemoryLimits::fixed(GIB),
                vcpus_max: 1,
                vcpus_at_startup: 1,
                vbds: vec![],
                vifs: vec![],
                snapshots: vec![],
                pv_bootloader: "pygrub".into(),
                other_config: BTreeMap::new(),
            },
        );
        uuid
    }

    /// Add a plain VM in the given power state, resident on `host_uuid` when running.
    pub fn add_vm(&self, name_label: &str, power_state: VmPowerState, host_uuid: Option<&str>) -> String {
        let mut st = self.state.lock();
        let host = host_uuid
            .and_then(|u| st.hosts.iter().find(|(_, h)| h.uuid == u).map(|(r, _)| r.clone()))
            .unwrap_or_else(OpaqueRef::null);
        let r = st.next_ref();
        let uuid = new_uuid();
        st.vms.insert(
            r,
            VmRecord {
                uuid: uuid.clone(),
                name_label: name_label.to_string(),
                power_state,
                is_a_template: false,
                is_a_snapshot: false,
                is_control_domain: false,
                snapshot_of: OpaqueRef::null(),
                resident_on: host,
                affinity: OpaqueRef::null(),
                memory: MemoryLimits::fixed(GIB),
                vcpus_max: 1,
                vcpus_at_startup: 1,
                vbds: vec![],
                vifs: vec![],
                snapshots: vec![],
                pv_bootloader: String::new(),
                other_config: BTreeMap::new(),
            },
        );
        uuid
    }

    /// Add a local LVM SR attached to the first host.
    pub fn add_local_sr(&self, name_label: &str, device: &str) -> String {
        let mut st = self.state.lock();
        let Some(host) = st.first_host() else {
            return String::new();
        };
        let sr = st.next_ref();
        let pbd = st.next_ref();
        let uuid = new_uuid();
        let mut dc = BTreeMap::new();
        dc.insert("device".to_string(), device.to_string());
        st.pbds.insert(
            pbd.clone(),
            PbdRecord {
                uuid: new_uuid(),
                host,
                sr: sr.clone(),
                device_config: dc.clone(),
                currently_attached: true,
            },
        );
        st.sr_device_configs.insert(sr.clone(), dc);
        st.srs.insert(
            sr,
            SrRecord {
                uuid: uuid.clone(),
                name_label: name_label.to_string(),
                sr_type: "lvm".into(),
                content_type: "user".into(),
                shared: false,
                physical_size: 500 * GIB,
                physical_utilisation: 0,
                pbds: vec![pbd],
                vdis: vec![],
            },
        );
        uuid
    }

    /// Register an ISO image file served from `location` (`server:/path`).
    pub fn add_iso_image(&self, location: &str, file_name: &str) {
        self.state
            .lock()
            .iso_images
            .entry(location.to_string())
            .or_default()
            .push(file_name.to_string());
    }

    /// Place a VDI straight into an SR, bypassing SR attachment rules.
    pub fn add_vdi(&self, sr_uuid: &str, seed: VdiSeed) -> String {
        let mut st = self.state.lock();
        let Some(sr) = st
            .srs
            .iter()
            .find(|(_, s)| s.uuid == sr_uuid)
            .map(|(r, _)| r.clone())
        else {
            return String::new();
        };
        let mut sm_config = BTreeMap::new();
        if let Some(parent) = &seed.parent {
            sm_config.insert(VHD_PARENT_KEY.to_string(), parent.clone());
        }
        let uuid = new_uuid();
        let record = VdiRecord {
            uuid: uuid.clone(),
            name_label: seed.name,
            sr: sr.clone(),
            virtual_size: seed.virtual_size,
            physical_utilisation: seed.physical_utilisation,
            vdi_type: VdiType::User,
            read_only: false,
            sharable: false,
            managed: seed.managed,
            is_a_snapshot: seed.is_a_snapshot,
            snapshot_of: OpaqueRef::null(),
            vbds: vec![],
            sm_config,
        };
        st.insert_vdi(&sr, record);
        uuid
    }

    /// Attach a VDI to a VM at `device`; `attached` marks the VBD plugged.
    pub fn attach_disk(&self, vm_uuid: &str, vdi_uuid: &str, device: u32, attached: bool) -> String {
        let mut st = self.state.lock();
        let vm = st.vms.iter().find(|(_, v)| v.uuid == vm_uuid).map(|(r, _)| r.clone());
        let vdi = st.vdis.iter().find(|(_, v)| v.uuid == vdi_uuid).map(|(r, _)| r.clone());
        let (Some(vm), Some(vdi)) = (vm, vdi) else {
            return String::new();
        };
        let vbd = st.next_ref();
        let uuid = new_uuid();
        st.vbds.insert(
            vbd.clone(),
            VbdRecord {
                uuid: uuid.clone(),
                vm: vm.clone(),
                vdi: vdi.clone(),
                userdevice: device.to_string(),
                mode: VbdMode::ReadWrite,
                vbd_type: VbdType::Disk,
                bootable: false,
                unpluggable: true,
                empty: false,
                currently_attached: attached,
            },
        );
        if let Some(v) = st.vms.get_mut(&vm) {
            v.vbds.push(vbd.clone());
        }
        if let Some(v) = st.vdis.get_mut(&vdi) {
            v.vbds.push(vbd);
        }
        uuid
    }

    // ----- fault injection -----

    /// Fail the next `times` calls of `method` with remote error `code`.
    pub fn inject_fault(&self, method: &str, code: &str, times: u32) {
        self.inject_fault_after(method, code, 0, times);
    }

    /// Like [`inject_fault`](Self::inject_fault), but let the first `skip`
    /// calls of `method` succeed.
    pub fn inject_fault_after(&self, method: &str, code: &str, skip: u32, times: u32) {
        self.state.lock().faults.push(Fault {
            method: method.to_string(),
            kind: FaultKind::Call(code.to_string()),
            skip,
            remaining: times,
        });
    }

    /// Make the next `times` tasks for `method` (e.g. `VM.start`) end in failure.
    pub fn inject_task_failure(&self, method: &str, error_info: &[&str], times: u32) {
        self.state.lock().faults.push(Fault {
            method: method.to_string(),
            kind: FaultKind::Task(error_info.iter().map(|s| s.to_string()).collect()),
            skip: 0,
            remaining: times,
        });
    }

    /// Number of polls a task stays pending before finishing.
    pub fn set_task_latency(&self, polls: u32) {
        self.state.lock().task_latency = polls;
    }

    /// New tasks never leave the pending state and have no effect.
    pub fn set_hang_tasks(&self, hang: bool) {
        self.state.lock().hang_tasks = hang;
    }

    /// Task polling reports every task handle as invalid.
    pub fn set_expire_task_handles(&self, expire: bool) {
        self.state.lock().expire_task_handles = expire;
    }

    /// Invalidate every open session.
    pub fn expire_sessions(&self) {
        self.state.lock().sessions.clear();
    }

    pub fn set_plugin_response(&self, plugin: &str, function: &str, response: &str) {
        self.state
            .lock()
            .plugin_responses
            .insert((plugin.to_string(), function.to_string()), response.to_string());
    }

    /// Detach every PBD of an SR without going through the API.
    pub fn unplug_all_pbds(&self, sr_uuid: &str) {
        let mut st = self.state.lock();
        let sr = st.srs.iter().find(|(_, s)| s.uuid == sr_uuid).map(|(r, _)| r.clone());
        if let Some(sr) = sr {
            for pbd in st.pbds.values_mut().filter(|p| p.sr == sr) {
                pbd.currently_attached = false;
            }
        }
    }

    // ----- inspection -----

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == method).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// How many destroy calls each task received, in task order.
    pub fn task_destroy_counts(&self) -> Vec<u32> {
        let st = self.state.lock();
        let mut counts: Vec<_> = st.task_destroys.iter().collect();
        counts.sort_by(|a, b| a.0.cmp(b.0));
        counts.into_iter().map(|(_, n)| *n).collect()
    }

    /// Tasks that were submitted but never destroyed.
    pub fn live_task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Non-template, non-snapshot VMs with this name.
    pub fn vms_named(&self, name: &str) -> Vec<VmRecord> {
        self.state
            .lock()
            .vms
            .values()
            .filter(|v| v.name_label == name && !v.is_a_template)
            .cloned()
            .collect()
    }

    pub fn vm_by_uuid(&self, uuid: &str) -> Option<VmRecord> {
        self.state.lock().vms.values().find(|v| v.uuid == uuid).cloned()
    }

    fn vm_refs_named(st: &SimState, name: &str) -> HashSet<OpaqueRef> {
        st.vms
            .iter()
            .filter(|(_, v)| v.name_label == name && !v.is_a_template)
            .map(|(r, _)| r.clone())
            .collect()
    }

    pub fn vbds_of_vm(&self, name: &str) -> Vec<VbdRecord> {
        let st = self.state.lock();
        let vms = Self::vm_refs_named(&st, name);
        st.vbds.values().filter(|b| vms.contains(&b.vm)).cloned().collect()
    }

    pub fn vifs_of_vm(&self, name: &str) -> Vec<VifRecord> {
        let st = self.state.lock();
        let vms = Self::vm_refs_named(&st, name);
        st.vifs.values().filter(|v| vms.contains(&v.vm)).cloned().collect()
    }

    pub fn vbd_count(&self) -> usize {
        self.state.lock().vbds.len()
    }

    pub fn vif_count(&self) -> usize {
        self.state.lock().vifs.len()
    }

    pub fn sr_count_by_type(&self, sr_type: &str) -> usize {
        self.state
            .lock()
            .srs
            .values()
            .filter(|s| s.sr_type == sr_type)
            .count()
    }

    pub fn sr_by_uuid(&self, uuid: &str) -> Option<SrRecord> {
        self.state.lock().srs.values().find(|s| s.uuid == uuid).cloned()
    }

    pub fn srs_named(&self, name: &str) -> Vec<SrRecord> {
        self.state
            .lock()
            .srs
            .values()
            .filter(|s| s.name_label == name)
            .cloned()
            .collect()
    }

    pub fn pbds_of_sr(&self, uuid: &str) -> Vec<PbdRecord> {
        let st = self.state.lock();
        let Some(sr) = st.srs.iter().find(|(_, s)| s.uuid == uuid).map(|(r, _)| r.clone()) else {
            return Vec::new();
        };
        st.pbds.values().filter(|p| p.sr == sr).cloned().collect()
    }

    pub fn vdi_by_uuid(&self, uuid: &str) -> Option<VdiRecord> {
        self.state.lock().vdis.values().find(|v| v.uuid == uuid).cloned()
    }

    pub fn networks_named(&self, name: &str) -> Vec<NetworkRecord> {
        self.state
            .lock()
            .networks
            .values()
            .filter(|n| n.name_label == name)
            .cloned()
            .collect()
    }

    pub fn vlan_pif_count(&self) -> usize {
        self.state.lock().pifs.values().filter(|p| p.vlan >= 0).count()
    }

    pub fn plugin_calls(&self) -> Vec<PluginCall> {
        self.state.lock().plugin_calls.clone()
    }
}

impl ManagementApi for SimulatedPool {
    fn login(&self, username: &str, password: &str) -> Result<SessionRef> {
        let mut st = self.enter(None, "session.login_with_password")?;
        match st.users.get(username) {
            Some(expected) if expected == password => {
                let session = format!("OpaqueRef:session-{}", new_uuid());
                st.sessions.insert(session.clone());
                Ok(SessionRef::new(session))
            }
            _ => Err(fail(
                "session.login_with_password",
                SESSION_AUTHENTICATION_FAILED,
                &[username],
            )),
        }
    }

    fn logout(&self, session: &SessionRef) -> Result<()> {
        let mut st = self.enter(Some(session), "session.logout")?;
        st.sessions.remove(session.as_str());
        Ok(())
    }

    fn pool_get_uuid(&self, session: &SessionRef) -> Result<String> {
        let st = self.enter(Some(session), "pool.get_uuid")?;
        Ok(st.pool_uuid.clone())
    }

    fn host_get_all(&self, session: &SessionRef) -> Result<Vec<OpaqueRef>> {
        let st = self.enter(Some(session), "host.get_all")?;
        Ok(st.hosts.keys().cloned().collect())
    }

    fn host_get_by_uuid(&self, session: &SessionRef, uuid: &str) -> Result<OpaqueRef> {
        let call = "host.get_by_uuid";
        let st = self.enter(Some(session), call)?;
        find_by_uuid(&st.hosts, uuid, call, |h| &h.uuid)
    }

    fn host_get_record(&self, session: &SessionRef, host: &OpaqueRef) -> Result<HostRecord> {
        let call = "host.get_record";
        let st = self.enter(Some(session), call)?;
        lookup(&st.hosts, host, call).cloned()
    }

    fn vm_get_all(&self, session: &SessionRef) -> Result<Vec<OpaqueRef>> {
        let st = self.enter(Some(session), "VM.get_all")?;
        Ok(st.vms.keys().cloned().collect())
    }

    fn vm_get_by_uuid(&self, session: &SessionRef, uuid: &str) -> Result<OpaqueRef> {
        let call = "VM.get_by_uuid";
        let st = self.enter(Some(session), call)?;
        find_by_uuid(&st.vms, uuid, call, |v| &v.uuid)
    }

    fn vm_get_by_name_label(&self, session: &SessionRef, name: &str) -> Result<Vec<OpaqueRef>> {
        let st = self.enter(Some(session), "VM.get_by_name_label")?;
        Ok(st
            .vms
            .iter()
            .filter(|(_, v)| v.name_label == name)
            .map(|(r, _)| r.clone())
            .collect())
    }

    fn vm_get_record(&self, session: &SessionRef, vm: &OpaqueRef) -> Result<VmRecord> {
        let call = "VM.get_record";
        let st = self.enter(Some(session), call)?;
        lookup(&st.vms, vm, call).cloned()
    }

    fn vm_clone(&self, session: &SessionRef, template: &OpaqueRef, name: &str) -> Result<OpaqueRef> {
        let call = "VM.clone";
        let mut st = self.enter(Some(session), call)?;
        let source = lookup(&st.vms, template, call)?.clone();
        if source.power_state != VmPowerState::Halted {
            return Err(fail(call, "VM_BAD_POWER_STATE", &[template.as_str(), "halted"]));
        }
        let r = st.next_ref();
        st.vms.insert(
            r.clone(),
            VmRecord {
                uuid: new_uuid(),
                name_label: name.to_string(),
                is_a_snapshot: false,
                snapshot_of: OpaqueRef::null(),
                resident_on: OpaqueRef::null(),
                vbds: vec![],
                vifs: vec![],
                snapshots: vec![],
                ..source
            },
        );
        Ok(r)
    }

    fn vm_set_is_a_template(&self, session: &SessionRef, vm: &OpaqueRef, value: bool) -> Result<()> {
        let call = "VM.set_is_a_template";
        let mut st = self.enter(Some(session), call)?;
        lookup_mut(&mut st.vms, vm, call)?.is_a_template = value;
        Ok(())
    }

    fn vm_set_memory_limits(&self, session: &SessionRef, vm: &OpaqueRef, limits: &MemoryLimits) -> Result<()> {
        let call = "VM.set_memory_limits";
        let mut st = self.enter(Some(session), call)?;
        if limits.validate().is_err() {
            return Err(fail(call, "MEMORY_CONSTRAINT_VIOLATION", &[vm.as_str()]));
        }
        let rec = lookup_mut(&mut st.vms, vm, call)?;
        if rec.power_state != VmPowerState::Halted && !rec.memory.same_static_range(limits) {
            return Err(fail(call, "VM_BAD_POWER_STATE", &[vm.as_str(), "halted"]));
        }
        rec.memory = *limits;
        Ok(())
    }

    fn vm_set_vcpus(&self, session: &SessionRef, vm: &OpaqueRef, max: u32, at_startup: u32) -> Result<()> {
        let call = "VM.set_VCPUs";
        let mut st = self.enter(Some(session), call)?;
        if at_startup == 0 || at_startup > max {
            return Err(fail(call, "VALUE_NOT_SUPPORTED", &["VCPUs_at_startup"]));
        }
        let rec = lookup_mut(&mut st.vms, vm, call)?;
        rec.vcpus_max = max;
        rec.vcpus_at_startup = at_startup;
        Ok(())
    }

    fn vm_set_affinity(&self, session: &SessionRef, vm: &OpaqueRef, host: &OpaqueRef) -> Result<()> {
        let call = "VM.set_affinity";
        let mut st = self.enter(Some(session), call)?;
        lookup(&st.hosts, host, call)?;
        lookup_mut(&mut st.vms, vm, call)?.affinity = host.clone();
        Ok(())
    }

    fn vm_add_to_other_config(&self, session: &SessionRef, vm: &OpaqueRef, key: &str, value: &str) -> Result<()> {
        let call = "VM.add_to_other_config";
        let mut st = self.enter(Some(session), call)?;
        lookup_mut(&mut st.vms, vm, call)?
            .other_config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn vm_destroy(&self, session: &SessionRef, vm: &OpaqueRef) -> Result<()> {
        let call = "VM.destroy";
        let mut st = self.enter(Some(session), call)?;
        let rec = lookup(&st.vms, vm, call)?.clone();
        if rec.power_state != VmPowerState::Halted {
            return Err(fail(call, "VM_BAD_POWER_STATE", &[vm.as_str(), "halted"]));
        }
        for vbd in &rec.vbds {
            st.remove_vbd(vbd);
        }
        for vif in &rec.vifs {
            st.remove_vif(vif);
        }
        if let Some(parent) = st.vms.get_mut(&rec.snapshot_of) {
            parent.snapshots.retain(|s| s != vm);
        }
        st.vms.remove(vm);
        Ok(())
    }

    fn sr_get_all(&self, session: &SessionRef) -> Result<Vec<OpaqueRef>> {
        let st = self.enter(Some(session), "SR.get_all")?;
        Ok(st.srs.keys().cloned().collect())
    }

    fn sr_get_by_uuid(&self, session: &SessionRef, uuid: &str) -> Result<OpaqueRef> {
        let call = "SR.get_by_uuid";
        let st = self.enter(Some(session), call)?;
        find_by_uuid(&st.srs, uuid, call, |s| &s.uuid)
    }

    fn sr_get_by_name_label(&self, session: &SessionRef, name: &str) -> Result<Vec<OpaqueRef>> {
        let st = self.enter(Some(session), "SR.get_by_name_label")?;
        Ok(st
            .srs
            .iter()
            .filter(|(_, s)| s.name_label == name)
            .map(|(r, _)| r.clone())
            .collect())
    }

    fn sr_get_record(&self, session: &SessionRef, sr: &OpaqueRef) -> Result<SrRecord> {
        let call = "SR.get_record";
        let st = self.enter(Some(session), call)?;
        let mut rec = lookup(&st.srs, sr, call)?.clone();
        rec.physical_utilisation = rec
            .vdis
            .iter()
            .filter_map(|v| st.vdis.get(v))
            .map(|v| v.physical_utilisation)
            .sum();
        Ok(rec)
    }

    fn sr_probe(
        &self,
        session: &SessionRef,
        host: &OpaqueRef,
        device_config: &BTreeMap<String, String>,
        sr_type: &str,
    ) -> Result<Vec<String>> {
        let call = "SR.probe";
        let st = self.enter(Some(session), call)?;
        lookup(&st.hosts, host, call)?;
        let wanted = backing_identity(device_config);
        let mut found: Vec<String> = st
            .srs
            .iter()
            .filter(|(r, s)| {
                s.sr_type == sr_type
                    && st
                        .sr_device_configs
                        .get(*r)
                        .is_some_and(|dc| backing_identity(dc) == wanted)
            })
            .map(|(_, s)| s.uuid.clone())
            .collect();
        found.extend(
            st.detached_srs
                .iter()
                .filter(|d| d.sr_type == sr_type && backing_identity(&d.device_config) == wanted)
                .map(|d| d.uuid.clone()),
        );
        Ok(found)
    }

    fn sr_create(&self, session: &SessionRef, spec: &SrCreateSpec) -> Result<OpaqueRef> {
        let call = "SR.create";
        let mut st = self.enter(Some(session), call)?;
        lookup(&st.hosts, &spec.host, call)?;
        let wanted = backing_identity(&spec.device_config);
        let live_duplicate = st.srs.iter().any(|(r, s)| {
            s.sr_type == spec.sr_type
                && st
                    .sr_device_configs
                    .get(r)
                    .is_some_and(|dc| backing_identity(dc) == wanted)
        });
        let detached_duplicate = st
            .detached_srs
            .iter()
            .any(|d| d.sr_type == spec.sr_type && backing_identity(&d.device_config) == wanted);
        if live_duplicate || detached_duplicate {
            return Err(fail(call, SR_DEVICE_IN_USE, &[&spec.name_label]));
        }

        let sr = st.next_ref();
        let hosts: Vec<OpaqueRef> = if spec.shared {
            st.hosts.keys().cloned().collect()
        } else {
            vec![spec.host.clone()]
        };
        let mut pbds = Vec::new();
        for host in hosts {
            let pbd = st.next_ref();
            st.pbds.insert(
                pbd.clone(),
                PbdRecord {
                    uuid: new_uuid(),
                    host,
                    sr: sr.clone(),
                    device_config: spec.device_config.clone(),
                    currently_attached: true,
                },
            );
            pbds.push(pbd);
        }
        st.sr_device_configs.insert(sr.clone(), spec.device_config.clone());
        st.srs.insert(
            sr.clone(),
            SrRecord {
                uuid: new_uuid(),
                name_label: spec.name_label.clone(),
                sr_type: spec.sr_type.clone(),
                content_type: spec.content_type.clone(),
                shared: spec.shared,
                physical_size: if spec.physical_size > 0 {
                    spec.physical_size
                } else {
                    1024 * GIB
                },
                physical_utilisation: 0,
                pbds,
                vdis: vec![],
            },
        );
        if spec.sr_type == "iso" {
            st.materialize_iso_images(&sr);
        }
        Ok(sr)
    }

    fn sr_introduce(
        &self,
        session: &SessionRef,
        uuid: &str,
        name_label: &str,
        sr_type: &str,
        content_type: &str,
        shared: bool,
    ) -> Result<OpaqueRef> {
        let call = "SR.introduce";
        let mut st = self.enter(Some(session), call)?;
        if st.srs.values().any(|s| s.uuid == uuid) {
            return Err(fail(call, "SR_UUID_EXISTS", &[uuid]));
        }
        let position = st.detached_srs.iter().position(|d| d.uuid == uuid);
        let detached = position.map(|i| st.detached_srs.remove(i));
        let sr = st.next_ref();
        if let Some(d) = &detached {
            st.sr_device_configs.insert(sr.clone(), d.device_config.clone());
        }
        st.srs.insert(
            sr.clone(),
            SrRecord {
                uuid: uuid.to_string(),
                name_label: name_label.to_string(),
                sr_type: sr_type.to_string(),
                content_type: content_type.to_string(),
                shared,
                physical_size: 1024 * GIB,
                physical_utilisation: 0,
                pbds: vec![],
                vdis: vec![],
            },
        );
        Ok(sr)
    }

    fn sr_forget(&self, session: &SessionRef, sr: &OpaqueRef) -> Result<()> {
        let call = "SR.forget";
        let mut st = self.enter(Some(session), call)?;
        let rec = lookup(&st.srs, sr, call)?.clone();
        if st.sr_has_attached_pbd(sr) {
            return Err(fail(call, "SR_HAS_PBD", &[sr.as_str()]));
        }
        for pbd in &rec.pbds {
            st.pbds.remove(pbd);
        }
        for vdi in &rec.vdis {
            st.remove_vdi(vdi);
        }
        let device_config = st.sr_device_configs.remove(sr).unwrap_or_default();
        st.detached_srs.push(DetachedSr {
            uuid: rec.uuid,
            name_label: rec.name_label,
            sr_type: rec.sr_type,
            content_type: rec.content_type,
            shared: rec.shared,
            device_config,
        });
        st.srs.remove(sr);
        Ok(())
    }

    fn pbd_create(
        &self,
        session: &SessionRef,
        host: &OpaqueRef,
        sr: &OpaqueRef,
        device_config: &BTreeMap<String, String>,
    ) -> Result<OpaqueRef> {
        let call = "PBD.create";
        let mut st = self.enter(Some(session), call)?;
        lookup(&st.hosts, host, call)?;
        lookup(&st.srs, sr, call)?;
        let pbd = st.next_ref();
        st.pbds.insert(
            pbd.clone(),
            PbdRecord {
                uuid: new_uuid(),
                host: host.clone(),
                sr: sr.clone(),
                device_config: device_config.clone(),
                currently_attached: false,
            },
        );
        st.sr_device_configs
            .entry(sr.clone())
            .or_insert_with(|| device_config.clone());
        if let Some(rec) = st.srs.get_mut(sr) {
            rec.pbds.push(pbd.clone());
        }
        Ok(pbd)
    }

    fn pbd_get_record(&self, session: &SessionRef, pbd: &OpaqueRef) -> Result<PbdRecord> {
        let call = "PBD.get_record";
        let st = self.enter(Some(session), call)?;
        lookup(&st.pbds, pbd, call).cloned()
    }

    fn pbd_plug(&self, session: &SessionRef, pbd: &OpaqueRef) -> Result<()> {
        let call = "PBD.plug";
        let mut st = self.enter(Some(session), call)?;
        let rec = lookup_mut(&mut st.pbds, pbd, call)?;
        rec.currently_attached = true;
        let sr = rec.sr.clone();
        let is_iso = st.srs.get(&sr).is_some_and(|s| s.sr_type == "iso");
        if is_iso {
            st.materialize_iso_images(&sr);
        }
        Ok(())
    }

    fn pbd_unplug(&self, session: &SessionRef, pbd: &OpaqueRef) -> Result<()> {
        let call = "PBD.unplug";
        let mut st = self.enter(Some(session), call)?;
        let sr = lookup(&st.pbds, pbd, call)?.sr.clone();
        let busy = st
            .srs
            .get(&sr)
            .map(|s| s.vdis.iter().any(|v| st.vdi_in_use(v)))
            .unwrap_or(false);
        if busy {
            return Err(fail(call, "SR_HAS_ATTACHED_VBDS", &[sr.as_str()]));
        }
        lookup_mut(&mut st.pbds, pbd, call)?.currently_attached = false;
        Ok(())
    }

    fn pbd_destroy(&self, session: &SessionRef, pbd: &OpaqueRef) -> Result<()> {
        let call = "PBD.destroy";
        let mut st = self.enter(Some(session), call)?;
        let rec = lookup(&st.pbds, pbd, call)?.clone();
        if rec.currently_attached {
            return Err(fail(call, "OPERATION_NOT_ALLOWED", &["PBD is attached"]));
        }
        if let Some(sr) = st.srs.get_mut(&rec.sr) {
            sr.pbds.retain(|p| p != pbd);
        }
        st.pbds.remove(pbd);
        Ok(())
    }

    fn vdi_create(&self, session: &SessionRef, spec: &VdiSpec) -> Result<OpaqueRef> {
        let call = "VDI.create";
        let mut st = self.enter(Some(session), call)?;
        lookup(&st.srs, &spec.sr, call)?;
        if !st.sr_has_attached_pbd(&spec.sr) {
            return Err(fail(call, "SR_NOT_ATTACHED", &[spec.sr.as_str()]));
        }
        let record = VdiRecord {
            uuid: new_uuid(),
            name_label: spec.name_label.clone(),
            sr: spec.sr.clone(),
            virtual_size: spec.virtual_size,
            physical_utilisation: 0,
            vdi_type: spec.vdi_type,
            read_only: spec.read_only,
            sharable: spec.sharable,
            managed: true,
            is_a_snapshot: false,
            snapshot_of: OpaqueRef::null(),
            vbds: vec![],
            sm_config: BTreeMap::new(),
        };
        Ok(st.insert_vdi(&spec.sr, record))
    }

    fn vdi_get_by_uuid(&self, session: &SessionRef, uuid: &str) -> Result<OpaqueRef> {
        let call = "VDI.get_by_uuid";
        let st = self.enter(Some(session), call)?;
        find_by_uuid(&st.vdis, uuid, call, |v| &v.uuid)
    }

    fn vdi_get_record(&self, session: &SessionRef, vdi: &OpaqueRef) -> Result<VdiRecord> {
        let call = "VDI.get_record";
        let st = self.enter(Some(session), call)?;
        lookup(&st.vdis, vdi, call).cloned()
    }

    fn vdi_destroy(&self, session: &SessionRef, vdi: &OpaqueRef) -> Result<()> {
        let call = "VDI.destroy";
        let mut st = self.enter(Some(session), call)?;
        lookup(&st.vdis, vdi, call)?;
        if st.vdi_in_use(vdi) {
            return Err(fail(call, "VDI_IN_USE", &[vdi.as_str()]));
        }
        st.remove_vdi(vdi);
        Ok(())
    }

    fn vdi_forget(&self, session: &SessionRef, vdi: &OpaqueRef) -> Result<()> {
        let call = "VDI.forget";
        let mut st = self.enter(Some(session), call)?;
        lookup(&st.vdis, vdi, call)?;
        if st.vdi_in_use(vdi) {
            return Err(fail(call, "VDI_IN_USE", &[vdi.as_str()]));
        }
        st.remove_vdi(vdi);
        Ok(())
    }

    fn vdi_resize(&self, session: &SessionRef, vdi: &OpaqueRef, size: u64) -> Result<()> {
        let call = "VDI.resize";
        let mut st = self.enter(Some(session), call)?;
        let rec = lookup_mut(&mut st.vdis, vdi, call)?;
        if size < rec.virtual_size {
            return Err(fail(call, "VDI_SIZE_TOO_SMALL", &[vdi.as_str()]));
        }
        rec.virtual_size = size;
        Ok(())
    }

    fn vdi_snapshot(&self, session: &SessionRef, vdi: &OpaqueRef) -> Result<OpaqueRef> {
        let call = "VDI.snapshot";
        let mut st = self.enter(Some(session), call)?;
        st.snapshot_vdi(vdi, call)
    }

    fn vbd_create(&self, session: &SessionRef, spec: &VbdSpec) -> Result<OpaqueRef> {
        let call = "VBD.create";
        let mut st = self.enter(Some(session), call)?;
        lookup(&st.vms, &spec.vm, call)?;
        if let Some(vdi) = &spec.vdi {
            lookup(&st.vdis, vdi, call)?;
        }
        let taken = st
            .vbds
            .values()
            .any(|b| b.vm == spec.vm && b.userdevice == spec.userdevice);
        if taken {
            return Err(fail(call, "DEVICE_ALREADY_EXISTS", &[&spec.userdevice]));
        }
        let vbd = st.next_ref();
        let vdi = spec.vdi.clone().unwrap_or_else(OpaqueRef::null);
        st.vbds.insert(
            vbd.clone(),
            VbdRecord {
                uuid: new_uuid(),
                vm: spec.vm.clone(),
                vdi: vdi.clone(),
                userdevice: spec.userdevice.clone(),
                mode: spec.mode,
                vbd_type: spec.vbd_type,
                bootable: spec.bootable,
                unpluggable: spec.unpluggable,
                empty: spec.empty || spec.vdi.is_none(),
                currently_attached: false,
            },
        );
        if let Some(vm) = st.vms.get_mut(&spec.vm) {
            vm.vbds.push(vbd.clone());
        }
        if let Some(v) = st.vdis.get_mut(&vdi) {
            v.vbds.push(vbd.clone());
        }
        Ok(vbd)
    }

    fn vbd_get_record(&self, session: &SessionRef, vbd: &OpaqueRef) -> Result<VbdRecord> {
        let call = "VBD.get_record";
        let st = self.enter(Some(session), call)?;
        lookup(&st.vbds, vbd, call).cloned()
    }

    fn vbd_plug(&self, session: &SessionRef, vbd: &OpaqueRef) -> Result<()> {
        let call = "VBD.plug";
        let mut st = self.enter(Some(session), call)?;
        let vm = lookup(&st.vbds, vbd, call)?.vm.clone();
        let power = lookup(&st.vms, &vm, call)?.power_state;
        if power != VmPowerState::Running {
            return Err(fail(call, "VM_BAD_POWER_STATE", &[vm.as_str(), "running"]));
        }
        lookup_mut(&mut st.vbds, vbd, call)?.currently_attached = true;
        Ok(())
    }

    fn vbd_unplug(&self, session: &SessionRef, vbd: &OpaqueRef) -> Result<()> {
        let call = "VBD.unplug";
        let mut st = self.enter(Some(session), call)?;
        let rec = lookup_mut(&mut st.vbds, vbd, call)?;
        if !rec.currently_attached {
            return Err(fail(call, "DEVICE_ALREADY_DETACHED", &[vbd.as_str()]));
        }
        rec.currently_attached = false;
        Ok(())
    }

    fn vbd_destroy(&self, session: &SessionRef, vbd: &OpaqueRef) -> Result<()> {
        let call = "VBD.destroy";
        let mut st = self.enter(Some(session), call)?;
        if lookup(&st.vbds, vbd, call)?.currently_attached {
            return Err(fail(call, "OPERATION_NOT_ALLOWED", &["VBD is attached"]));
        }
        st.remove_vbd(vbd);
        Ok(())
    }

    fn vbd_eject(&self, session: &SessionRef, vbd: &OpaqueRef) -> Result<()> {
        let call = "VBD.eject";
        let mut st = self.enter(Some(session), call)?;
        let rec = lookup(&st.vbds, vbd, call)?.clone();
        if rec.vbd_type != VbdType::Cd {
            return Err(fail(call, "VBD_NOT_REMOVABLE_MEDIA", &[vbd.as_str()]));
        }
        if rec.empty {
            return Err(fail(call, "VBD_IS_EMPTY", &[vbd.as_str()]));
        }
        if let Some(v) = st.vdis.get_mut(&rec.vdi) {
            v.vbds.retain(|b| b != vbd);
        }
        let rec = lookup_mut(&mut st.vbds, vbd, call)?;
        rec.empty = true;
        rec.vdi = OpaqueRef::null();
        Ok(())
    }

    fn vbd_insert(&self, session: &SessionRef, vbd: &OpaqueRef, vdi: &OpaqueRef) -> Result<()> {
        let call = "VBD.insert";
        let mut st = self.enter(Some(session), call)?;
        lookup(&st.vdis, vdi, call)?;
        let rec = lookup_mut(&mut st.vbds, vbd, call)?;
        if rec.vbd_type != VbdType::Cd {
            return Err(fail(call, "VBD_NOT_REMOVABLE_MEDIA", &[vbd.as_str()]));
        }
        if !rec.empty {
            return Err(fail(call, "VBD_NOT_EMPTY", &[vbd.as_str()]));
        }
        rec.empty = false;
        rec.vdi = vdi.clone();
        if let Some(v) = st.vdis.get_mut(vdi) {
            v.vbds.push(vbd.clone());
        }
        Ok(())
    }

    fn vif_create(&self, session: &SessionRef, spec: &VifSpec) -> Result<OpaqueRef> {
        let call = "VIF.create";
        let mut st = self.enter(Some(session), call)?;
        lookup(&st.vms, &spec.vm, call)?;
        lookup(&st.networks, &spec.network, call)?;
        let taken = st
            .vifs
            .values()
            .any(|v| v.vm == spec.vm && v.device == spec.device);
        if taken {
            return Err(fail(call, "DEVICE_ALREADY_EXISTS", &[&spec.device]));
        }
        let vif = st.next_ref();
        st.vifs.insert(
            vif.clone(),
            VifRecord {
                uuid: new_uuid(),
                vm: spec.vm.clone(),
                network: spec.network.clone(),
                device: spec.device.clone(),
                mac: spec.mac.clone(),
                mtu: spec.mtu,
                currently_attached: false,
                other_config: spec.other_config.clone(),
            },
        );
        if let Some(vm) = st.vms.get_mut(&spec.vm) {
            vm.vifs.push(vif.clone());
        }
        if let Some(net) = st.networks.get_mut(&spec.network) {
            net.vifs.push(vif.clone());
        }
        Ok(vif)
    }

    fn vif_get_record(&self, session: &SessionRef, vif: &OpaqueRef) -> Result<VifRecord> {
        let call = "VIF.get_record";
        let st = self.enter(Some(session), call)?;
        lookup(&st.vifs, vif, call).cloned()
    }

    fn vif_plug(&self, session: &SessionRef, vif: &OpaqueRef) -> Result<()> {
        let call = "VIF.plug";
        let mut st = self.enter(Some(session), call)?;
        let vm = lookup(&st.vifs, vif, call)?.vm.clone();
        if lookup(&st.vms, &vm, call)?.power_state != VmPowerState::Running {
            return Err(fail(call, "VM_BAD_POWER_STATE", &[vm.as_str(), "running"]));
        }
        lookup_mut(&mut st.vifs, vif, call)?.currently_attached = true;
        Ok(())
    }

    fn vif_unplug(&self, session: &SessionRef, vif: &OpaqueRef) -> Result<()> {
        let call = "VIF.unplug";
        let mut st = self.enter(Some(session), call)?;
        let rec = lookup_mut(&mut st.vifs, vif, call)?;
        if !rec.currently_attached {
            return Err(fail(call, "DEVICE_ALREADY_DETACHED", &[vif.as_str()]));
        }
        rec.currently_attached = false;
        Ok(())
    }

    fn vif_destroy(&self, session: &SessionRef, vif: &OpaqueRef) -> Result<()> {
        let call = "VIF.destroy";
        let mut st = self.enter(Some(session), call)?;
        if lookup(&st.vifs, vif, call)?.currently_attached {
            return Err(fail(call, "OPERATION_NOT_ALLOWED", &["VIF is attached"]));
        }
        st.remove_vif(vif);
        Ok(())
    }

    fn network_get_by_name_label(&self, session: &SessionRef, name: &str) -> Result<Vec<OpaqueRef>> {
        let st = self.enter(Some(session), "network.get_by_name_label")?;
        Ok(st
            .networks
            .iter()
            .filter(|(_, n)| n.name_label == name)
            .map(|(r, _)| r.clone())
            .collect())
    }

    fn network_get_record(&self, session: &SessionRef, network: &OpaqueRef) -> Result<NetworkRecord> {
        let call = "network.get_record";
        let st = self.enter(Some(session), call)?;
        lookup(&st.networks, network, call).cloned()
    }

    fn network_create(
        &self,
        session: &SessionRef,
        name_label: &str,
        other_config: &BTreeMap<String, String>,
    ) -> Result<OpaqueRef> {
        let mut st = self.enter(Some(session), "network.create")?;
        let net = st.next_ref();
        let bridge = format!("xapi{}", st.counter);
        st.networks.insert(
            net.clone(),
            NetworkRecord {
                uuid: new_uuid(),
                name_label: name_label.to_string(),
                bridge,
                mtu: 1500,
                pifs: vec![],
                vifs: vec![],
                other_config: other_config.clone(),
            },
        );
        Ok(net)
    }

    fn network_add_to_other_config(
        &self,
        session: &SessionRef,
        network: &OpaqueRef,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let call = "network.add_to_other_config";
        let mut st = self.enter(Some(session), call)?;
        lookup_mut(&mut st.networks, network, call)?
            .other_config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn network_destroy(&self, session: &SessionRef, network: &OpaqueRef) -> Result<()> {
        let call = "network.destroy";
        let mut st = self.enter(Some(session), call)?;
        let rec = lookup(&st.networks, network, call)?;
        if !rec.vifs.is_empty() {
            return Err(fail(call, "NETWORK_CONTAINS_VIF", &[network.as_str()]));
        }
        if !rec.pifs.is_empty() {
            return Err(fail(call, "NETWORK_CONTAINS_PIF", &[network.as_str()]));
        }
        st.networks.remove(network);
        Ok(())
    }

    fn pif_get_record(&self, session: &SessionRef, pif: &OpaqueRef) -> Result<PifRecord> {
        let call = "PIF.get_record";
        let st = self.enter(Some(session), call)?;
        lookup(&st.pifs, pif, call).cloned()
    }

    fn vlan_create(&self, session: &SessionRef, pif: &OpaqueRef, tag: u16, network: &OpaqueRef) -> Result<OpaqueRef> {
        let call = "VLAN.create";
        let mut st = self.enter(Some(session), call)?;
        let base = lookup(&st.pifs, pif, call)?.clone();
        lookup(&st.networks, network, call)?;
        let exists = st
            .pifs
            .values()
            .any(|p| p.host == base.host && p.device == base.device && p.vlan == i64::from(tag));
        if exists {
            return Err(fail(call, "PIF_VLAN_EXISTS", &[&base.device]));
        }
        let vlan_pif = st.next_ref();
        st.pifs.insert(
            vlan_pif.clone(),
            PifRecord {
                uuid: new_uuid(),
                device: base.device.clone(),
                host: base.host.clone(),
                network: network.clone(),
                vlan: i64::from(tag),
                management: false,
            },
        );
        if let Some(net) = st.networks.get_mut(network) {
            net.pifs.push(vlan_pif.clone());
        }
        if let Some(host) = st.hosts.get_mut(&base.host) {
            host.pifs.push(vlan_pif.clone());
        }
        Ok(vlan_pif)
    }

    fn vlan_destroy(&self, session: &SessionRef, vlan_pif: &OpaqueRef) -> Result<()> {
        let call = "VLAN.destroy";
        let mut st = self.enter(Some(session), call)?;
        let rec = lookup(&st.pifs, vlan_pif, call)?.clone();
        if rec.vlan < 0 {
            return Err(fail(call, "PIF_IS_PHYSICAL", &[vlan_pif.as_str()]));
        }
        if let Some(net) = st.networks.get_mut(&rec.network) {
            net.pifs.retain(|p| p != vlan_pif);
        }
        if let Some(host) = st.hosts.get_mut(&rec.host) {
            host.pifs.retain(|p| p != vlan_pif);
        }
        st.pifs.remove(vlan_pif);
        Ok(())
    }

    fn submit_async(&self, session: &SessionRef, call: &AsyncCall) -> Result<OpaqueRef> {
        let name = format!("Async.{}", call.method());
        let mut st = self.enter(Some(session), &name)?;
        let hang = st.hang_tasks;
        let outcome = if hang {
            Ok(String::new())
        } else {
            match st.take_task_fault(call.method()) {
                Some(info) => Err(info),
                None => st.apply_async(call),
            }
        };
        let task = st.next_ref();
        let polls_remaining = st.task_latency;
        st.tasks.insert(
            task.clone(),
            SimTask {
                record: TaskRecord {
                    uuid: new_uuid(),
                    name_label: name,
                    status: TaskStatus::Pending,
                    progress: 0.0,
                    result: String::new(),
                    error_info: vec![],
                },
                outcome,
                polls_remaining,
                hang,
            },
        );
        Ok(task)
    }

    fn task_get_record(&self, session: &SessionRef, task: &OpaqueRef) -> Result<TaskRecord> {
        let call = "task.get_record";
        let mut st = self.enter(Some(session), call)?;
        if st.expire_task_handles {
            return Err(fail(call, HANDLE_INVALID, &[task.as_str()]));
        }
        let t = lookup_mut(&mut st.tasks, task, call)?;
        if t.record.status == TaskStatus::Pending && !t.hang {
            if t.polls_remaining > 0 {
                t.polls_remaining -= 1;
                t.record.progress = 0.5;
            } else {
                t.record.progress = 1.0;
                match &t.outcome {
                    Ok(result) => {
                        t.record.status = TaskStatus::Success;
                        t.record.result = result.clone();
                    }
                    Err(info) => {
                        t.record.status = TaskStatus::Failure;
                        t.record.error_info = info.clone();
                    }
                }
            }
        }
        Ok(t.record.clone())
    }

    fn task_cancel(&self, session: &SessionRef, task: &OpaqueRef) -> Result<()> {
        let call = "task.cancel";
        let mut st = self.enter(Some(session), call)?;
        let t = lookup_mut(&mut st.tasks, task, call)?;
        if t.record.status.is_pending() {
            t.record.status = TaskStatus::Cancelled;
        }
        Ok(())
    }

    fn task_destroy(&self, session: &SessionRef, task: &OpaqueRef) -> Result<()> {
        let call = "task.destroy";
        let mut st = self.enter(Some(session), call)?;
        *st.task_destroys.entry(task.clone()).or_insert(0) += 1;
        if st.tasks.remove(task).is_none() {
            return Err(fail(call, HANDLE_INVALID, &[task.as_str()]));
        }
        Ok(())
    }

    fn call_plugin(
        &self,
        session: &SessionRef,
        host: &OpaqueRef,
        plugin: &str,
        function: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<String> {
        let call = "host.call_plugin";
        let mut st = self.enter(Some(session), call)?;
        lookup(&st.hosts, host, call)?;
        st.plugin_calls.push(PluginCall {
            host: host.clone(),
            plugin: plugin.to_string(),
            function: function.to_string(),
            args: args.clone(),
        });
        if let Some(resp) = st
            .plugin_responses
            .get(&(plugin.to_string(), function.to_string()))
        {
            return Ok(resp.clone());
        }
        if plugin == "ovstunnel" && function == "setup_ovs_bridge" {
            let bridge = args.get("bridge").cloned().unwrap_or_default();
            return Ok(format!("SUCCESS:{}", bridge));
        }
        Ok(String::new())
    }
}

impl Connector for SimulatedPool {
    fn connect(&self, address: &str) -> Result<Arc<dyn ManagementApi>> {
        let known = self.state.lock().hosts.values().any(|h| h.address == address);
        if !known {
            return Err(Error::Transport(format!("connection refused by {}", address)));
        }
        Ok(Arc::new(self.clone()))
    }
}

impl RrdSource for SimulatedPool {
    fn fetch(&self, address: &str, session: &SessionRef, start: i64) -> Result<String> {
        let st = self.enter(Some(session), "rrd_updates")?;
        let host = st
            .hosts
            .values()
            .find(|h| h.address == address)
            .ok_or_else(|| Error::Transport(format!("no host at {}", address)))?;

        let mut legend = Vec::new();
        let mut values = Vec::new();
        let host_columns: [(&str, f64); 6] = [
            ("cpu0", 0.25),
            ("cpu1", 0.75),
            ("memory_total_kib", (host.memory_total / 1024) as f64),
            ("memory_free_kib", (host.memory_free / 1024) as f64),
            ("pif_eth0_rx", 2048.0),
            ("pif_eth0_tx", 1024.0),
        ];
        for (param, value) in host_columns {
            legend.push(format!("AVERAGE:host:{}:{}", host.uuid, param));
            values.push(value);
        }
        for vm in st.vms.values().filter(|v| v.power_state == VmPowerState::Running) {
            let vm_columns: [(&str, f64); 7] = [
                ("cpu0", 0.5),
                ("memory", vm.memory.dynamic_max as f64),
                ("memory_internal_free", 262144.0),
                ("vif_0_rx", 4096.0),
                ("vif_0_tx", 2048.0),
                ("vbd_xvda_read", 8192.0),
                ("vbd_xvda_write", 1024.0),
            ];
            for (param, value) in vm_columns {
                legend.push(format!("AVERAGE:vm:{}:{}", vm.uuid, param));
                values.push(value);
            }
        }

        let mut xml = String::from("<xport><meta>");
        xml.push_str(&format!(
            "<start>{}</start><step>5</step><end>{}</end><rows>2</rows><columns>{}</columns><legend>",
            start,
            start + 10,
            legend.len()
        ));
        for entry in &legend {
            xml.push_str(&format!("<entry>{}</entry>", entry));
        }
        xml.push_str("</legend></meta><data>");
        for t in [start + 10, start + 5] {
            xml.push_str(&format!("<row><t>{}</t>", t));
            for v in &values {
                xml.push_str(&format!("<v>{}</v>", v));
            }
            xml.push_str("</row>");
        }
        xml.push_str("</data></xport>");
        Ok(xml)
    }
}
