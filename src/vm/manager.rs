//! VM power, migration, snapshot and device operations
//!
//! VMs are addressed by name label (the control plane's instance name) and
//! resolved to references afresh inside each operation.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::compensation::{Compensation, Undo};
use super::memory::MemoryLimits;
use super::spec::{BootMode, DiskKind, DiskSource, DiskSpec, NicSpec, VmSpec, CD_DEVICE, MAX_DISK_DEVICE};
use super::state::{PowerState, VmPhase, VmStateTracker};
use crate::config::TaskSettings;
use crate::mgmt::{
    AsyncCall, OpaqueRef, VbdMode, VbdRecord, VbdSpec, VbdType, VifRecord, VifSpec, VmPowerState, VmRecord,
};
use crate::network::{NetworkManager, NetworkSpec};
use crate::session::Connection;
use crate::storage::{IsoLocation, SrDescriptor, StorageManager, StoragePoolSpec};
use crate::task::TaskExecutor;
use crate::{Error, Result};

const DEFAULT_MTU: u32 = 1500;

const ISO_SR_SUFFIX: &str = "-ISO";

/// Name label of the per-VM ISO SR.
pub fn iso_sr_name(vm: &str) -> String {
    format!("{}{}", vm, ISO_SR_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub uuid: String,
    pub name: String,
    pub power_state: PowerState,
    pub host_uuid: Option<String>,
    pub vcpus: u32,
    pub memory: MemoryLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub uuid: String,
    pub name: String,
    pub vm_uuid: String,
    pub disk_uuids: Vec<String>,
}

pub struct VmManager {
    executor: TaskExecutor,
    tasks: TaskSettings,
    tracker: VmStateTracker,
    storage: Arc<StorageManager>,
    networks: Arc<NetworkManager>,
}

impl VmManager {
    pub fn new(
        executor: TaskExecutor,
        tasks: TaskSettings,
        storage: Arc<StorageManager>,
        networks: Arc<NetworkManager>,
    ) -> Self {
        Self {
            executor,
            tasks,
            tracker: VmStateTracker::new(),
            storage,
            networks,
        }
    }

    pub fn tracker(&self) -> &VmStateTracker {
        &self.tracker
    }

    // ----- lookups -----

    /// Guest VMs (not templates, snapshots or dom0) with the given name.
    fn find_vms(&self, conn: &Connection, name: &str) -> Result<Vec<(OpaqueRef, VmRecord)>> {
        let refs = conn.call("VM.get_by_name_label", |api, s| api.vm_get_by_name_label(s, name))?;
        let mut found = Vec::new();
        for vm in refs {
            let record = conn.call("VM.get_record", |api, s| api.vm_get_record(s, &vm))?;
            if !record.is_a_template && !record.is_a_snapshot && !record.is_control_domain {
                found.push((vm, record));
            }
        }
        Ok(found)
    }

    fn vm_by_name(&self, conn: &Connection, name: &str) -> Result<(OpaqueRef, VmRecord)> {
        let mut vms = self.find_vms(conn, name)?;
        if vms.len() > 1 {
            // Prefer the copy that is actually running.
            vms.sort_by_key(|(_, r)| r.power_state != VmPowerState::Running);
        }
        vms.into_iter()
            .next()
            .ok_or_else(|| Error::not_found("VM", name))
    }

    fn vm_record(&self, conn: &Connection, vm: &OpaqueRef) -> Result<VmRecord> {
        conn.call("VM.get_record", |api, s| api.vm_get_record(s, vm))
    }

    fn vm_info(&self, conn: &Connection, record: &VmRecord) -> Result<VmInfo> {
        let host_uuid = if record.resident_on.is_null() {
            None
        } else {
            let host = conn.call("host.get_record", |api, s| api.host_get_record(s, &record.resident_on))?;
            Some(host.uuid)
        };
        Ok(VmInfo {
            uuid: record.uuid.clone(),
            name: record.name_label.clone(),
            power_state: self
                .tracker
                .reported(&record.name_label, record.power_state.into()),
            host_uuid,
            vcpus: record.vcpus_at_startup,
            memory: record.memory,
        })
    }

    /// Current summary of the VM called `name`.
    pub fn info(&self, conn: &Connection, name: &str) -> Result<VmInfo> {
        let (_, record) = self.vm_by_name(conn, name)?;
        self.vm_info(conn, &record)
    }

    fn vbd_records(&self, conn: &Connection, record: &VmRecord) -> Result<Vec<(OpaqueRef, VbdRecord)>> {
        record
            .vbds
            .iter()
            .map(|vbd| {
                let r = conn.call("VBD.get_record", |api, s| api.vbd_get_record(s, vbd))?;
                Ok((vbd.clone(), r))
            })
            .collect()
    }

    fn vif_records(&self, conn: &Connection, record: &VmRecord) -> Result<Vec<(OpaqueRef, VifRecord)>> {
        record
            .vifs
            .iter()
            .map(|vif| {
                let r = conn.call("VIF.get_record", |api, s| api.vif_get_record(s, vif))?;
                Ok((vif.clone(), r))
            })
            .collect()
    }

    fn power_verifier(vm: &OpaqueRef, expected: VmPowerState) -> impl Fn(&Connection) -> Result<bool> + '_ {
        move |conn| {
            let record = conn.call("VM.get_record", |api, s| api.vm_get_record(s, vm))?;
            Ok(record.power_state == expected)
        }
    }

    // ----- start -----

    /// Create and boot a VM from `spec` on `host`.
    ///
    /// A VM with the same name already running on this host is returned as
    /// is; one running elsewhere is a conflict. Any failure after the template
    /// is cloned rolls back everything created so far.
    pub fn start(&self, conn: &Connection, host: &OpaqueRef, spec: &VmSpec) -> Result<VmInfo> {
        spec.validate()?;
        let record = {
            let _transition = self
                .tracker
                .begin(&spec.name, VmPhase::Starting, PowerState::PowerOff)?;
            self.start_tracked(conn, host, spec)?
        };
        self.vm_info(conn, &record)
    }

    fn start_tracked(&self, conn: &Connection, host: &OpaqueRef, spec: &VmSpec) -> Result<VmRecord> {
        for (vm, record) in self.find_vms(conn, &spec.name)? {
            match record.power_state {
                VmPowerState::Running if &record.resident_on == host => {
                    tracing::info!(vm = %spec.name, "VM already running on this host");
                    return Ok(record);
                }
                VmPowerState::Halted => {
                    tracing::info!(vm = %spec.name, uuid = %record.uuid, "Destroying stale halted copy");
                    self.destroy_vm(conn, &vm)?;
                }
                other => {
                    return Err(Error::Conflict(format!(
                        "VM {} is {} on another host ({})",
                        spec.name, other, record.resident_on
                    )));
                }
            }
        }

        let mut comp = Compensation::new();
        match self.provision(conn, host, spec, &mut comp) {
            Ok(record) => {
                tracing::info!(vm = %spec.name, uuid = %record.uuid, "VM started");
                Ok(record)
            }
            Err(e) => {
                tracing::error!(vm = %spec.name, error = %e, steps = comp.len(), "VM start failed, rolling back");
                let cleanup_failures = comp.unwind(|step| self.undo(conn, step));
                Err(Error::Compensated {
                    operation: format!("start {}", spec.name),
                    source: Box::new(e),
                    cleanup_failures,
                })
            }
        }
    }

    fn provision(&self, conn: &Connection, host: &OpaqueRef, spec: &VmSpec, comp: &mut Compensation) -> Result<VmRecord> {
        let template = self.template(conn, &spec.template)?;
        let vm = conn.call("VM.clone", |api, s| api.vm_clone(s, &template, &spec.name))?;
        comp.push(Undo::DestroyVm(vm.clone()));

        conn.call("VM.set_is_a_template", |api, s| api.vm_set_is_a_template(s, &vm, false))?;
        conn.call("VM.set_memory_limits", |api, s| api.vm_set_memory_limits(s, &vm, &spec.memory))?;
        conn.call("VM.set_VCPUs", |api, s| api.vm_set_vcpus(s, &vm, spec.vcpus, spec.vcpus))?;
        conn.call("VM.set_affinity", |api, s| api.vm_set_affinity(s, &vm, host))?;
        conn.call("VM.add_to_other_config", |api, s| {
            api.vm_add_to_other_config(s, &vm, "pv-bootloader", spec.boot_mode.bootloader())
        })?;

        for disk in &spec.disks {
            self.create_disk(conn, host, &vm, spec, disk, comp)?;
        }
        if let Some(iso) = &spec.iso {
            self.create_cd(conn, host, &vm, spec, iso, comp)?;
        }
        for nic in &spec.nics {
            self.create_vif(conn, host, &vm, nic, comp)?;
        }

        comp.push(Undo::HardShutdown(vm.clone()));
        self.executor.run_verified(
            conn,
            &AsyncCall::VmStart {
                vm: vm.clone(),
                host: Some(host.clone()),
            },
            self.tasks.start_timeout(),
            Self::power_verifier(&vm, VmPowerState::Running),
        )?;

        let record = self.vm_record(conn, &vm)?;
        if record.power_state != VmPowerState::Running {
            return Err(Error::InvalidState {
                object: spec.name.clone(),
                current: record.power_state.to_string(),
                expected: "Running".into(),
            });
        }
        Ok(record)
    }

    fn template(&self, conn: &Connection, name: &str) -> Result<OpaqueRef> {
        for vm in conn.call("VM.get_by_name_label", |api, s| api.vm_get_by_name_label(s, name))? {
            let record = self.vm_record(conn, &vm)?;
            if record.is_a_template && !record.is_a_snapshot {
                return Ok(vm);
            }
        }
        Err(Error::not_found("template", name))
    }

    fn create_disk(
        &self,
        conn: &Connection,
        host: &OpaqueRef,
        vm: &OpaqueRef,
        spec: &VmSpec,
        disk: &DiskSpec,
        comp: &mut Compensation,
    ) -> Result<()> {
        let vdi_uuid = match &disk.source {
            DiskSource::Existing { vdi_uuid } => {
                let info = self.storage.get_vdi(conn, vdi_uuid)?;
                self.storage.prepare_sr(conn, host, &info.sr_uuid)?;
                vdi_uuid.clone()
            }
            DiskSource::New { sr_uuid, size } => {
                let label = match disk.kind {
                    DiskKind::Root => format!("{}-ROOT", spec.name),
                    DiskKind::Data => format!("{}-DATA-{}", spec.name, disk.device),
                };
                let info = self.storage.create_vdi(conn, host, sr_uuid, &label, *size)?;
                comp.push(Undo::DestroyVdi(info.uuid.clone()));
                info.uuid
            }
        };
        let vdi = self.storage.resolve_vdi(conn, &vdi_uuid)?;
        let root = disk.kind == DiskKind::Root;
        let vbd_spec = VbdSpec {
            vm: vm.clone(),
            vdi: Some(vdi),
            userdevice: disk.device.to_string(),
            mode: VbdMode::ReadWrite,
            vbd_type: VbdType::Disk,
            bootable: root && spec.boot_mode == BootMode::PyGrub,
            unpluggable: !root,
            empty: false,
        };
        let vbd = conn.call("VBD.create", |api, s| api.vbd_create(s, &vbd_spec))?;
        comp.push(Undo::DestroyVbd(vbd));
        Ok(())
    }

    fn create_cd(
        &self,
        conn: &Connection,
        host: &OpaqueRef,
        vm: &OpaqueRef,
        spec: &VmSpec,
        iso_url: &str,
        comp: &mut Compensation,
    ) -> Result<()> {
        let (vdi, sr_uuid, reused) = self.iso_vdi(conn, host, &spec.name, iso_url)?;
        if !reused {
            comp.push(Undo::RemoveIsoSr(sr_uuid));
        }
        let vbd_spec = VbdSpec {
            vm: vm.clone(),
            vdi: Some(vdi),
            userdevice: CD_DEVICE.to_string(),
            mode: VbdMode::ReadOnly,
            vbd_type: VbdType::Cd,
            bootable: spec.boot_mode == BootMode::Hvm,
            unpluggable: true,
            empty: false,
        };
        let vbd = conn.call("VBD.create", |api, s| api.vbd_create(s, &vbd_spec))?;
        comp.push(Undo::DestroyVbd(vbd));
        Ok(())
    }

    /// Attach the per-VM ISO SR for `iso_url` and find the image in it.
    fn iso_vdi(&self, conn: &Connection, host: &OpaqueRef, vm_name: &str, iso_url: &str) -> Result<(OpaqueRef, String, bool)> {
        let iso = IsoLocation::parse(iso_url)?;
        let sr = self.storage.ensure_attached(
            conn,
            host,
            &StoragePoolSpec {
                name_label: iso_sr_name(vm_name),
                descriptor: SrDescriptor::Iso {
                    location: iso.location.clone(),
                },
                shared: false,
            },
        )?;
        let sr_ref = conn.call("SR.get_by_uuid", |api, s| api.sr_get_by_uuid(s, &sr.uuid))?;
        let record = conn.call("SR.get_record", |api, s| api.sr_get_record(s, &sr_ref))?;
        for vdi in &record.vdis {
            let vdi_record = conn.call("VDI.get_record", |api, s| api.vdi_get_record(s, vdi))?;
            if vdi_record.name_label == iso.file_name {
                return Ok((vdi.clone(), sr.uuid, sr.reused));
            }
        }
        if !sr.reused {
            if let Err(e) = self.storage.remove_sr(conn, &sr.uuid) {
                tracing::warn!(sr = %sr.uuid, error = %e, "Failed to remove ISO SR");
            }
        }
        Err(Error::not_found("ISO image", iso_url))
    }

    fn create_vif(&self, conn: &Connection, host: &OpaqueRef, vm: &OpaqueRef, nic: &NicSpec, comp: &mut Compensation) -> Result<OpaqueRef> {
        let network = self.networks.resolve(conn, host, &nic.network)?;
        if matches!(nic.network, NetworkSpec::Vlan { .. }) {
            comp.push(Undo::ReleaseNetwork(nic.network.clone()));
        }
        let vif_spec = VifSpec {
            vm: vm.clone(),
            network,
            device: nic.device.to_string(),
            mac: nic.mac.clone(),
            mtu: nic.mtu.unwrap_or(DEFAULT_MTU),
            other_config: nic.tags.clone(),
        };
        let vif = conn.call("VIF.create", |api, s| api.vif_create(s, &vif_spec))?;
        comp.push(Undo::DestroyVif(vif.clone()));
        Ok(vif)
    }

    fn undo(&self, conn: &Connection, step: &Undo) -> Result<()> {
        let tolerate_missing = |r: Result<()>| match r {
            Err(e) if e.is_missing_object() => Ok(()),
            other => other,
        };
        match step {
            Undo::HardShutdown(vm) => tolerate_missing(self.force_off(conn, vm)),
            Undo::DestroyVbd(vbd) => tolerate_missing(self.destroy_vbd(conn, vbd)),
            Undo::DestroyVif(vif) => tolerate_missing(self.destroy_vif(conn, vif)),
            Undo::DestroyVdi(uuid) => self.storage.delete_vdi(conn, uuid),
            Undo::RemoveIsoSr(uuid) => self.storage.remove_sr(conn, uuid),
            Undo::ReleaseNetwork(spec) => self.networks.release_if_unused(conn, spec).map(|_| ()),
            Undo::DestroyVm(vm) => tolerate_missing(conn.call("VM.destroy", |api, s| api.vm_destroy(s, vm))),
        }
    }

    fn force_off(&self, conn: &Connection, vm: &OpaqueRef) -> Result<()> {
        if self.vm_record(conn, vm)?.power_state == VmPowerState::Halted {
            return Ok(());
        }
        self.executor
            .run(conn, &AsyncCall::VmHardShutdown { vm: vm.clone() }, self.tasks.stop_timeout())
            .map(|_| ())
    }

    fn destroy_vbd(&self, conn: &Connection, vbd: &OpaqueRef) -> Result<()> {
        let record = conn.call("VBD.get_record", |api, s| api.vbd_get_record(s, vbd))?;
        if record.currently_attached {
            conn.call("VBD.unplug", |api, s| api.vbd_unplug(s, vbd))?;
        }
        conn.call("VBD.destroy", |api, s| api.vbd_destroy(s, vbd))
    }

    fn destroy_vif(&self, conn: &Connection, vif: &OpaqueRef) -> Result<()> {
        let record = conn.call("VIF.get_record", |api, s| api.vif_get_record(s, vif))?;
        if record.currently_attached {
            conn.call("VIF.unplug", |api, s| api.vif_unplug(s, vif))?;
        }
        conn.call("VIF.destroy", |api, s| api.vif_destroy(s, vif))
    }

    /// Remove a halted VM's devices and the VM object. Disks are kept.
    fn destroy_vm(&self, conn: &Connection, vm: &OpaqueRef) -> Result<()> {
        let record = self.vm_record(conn, vm)?;
        for vbd in &record.vbds {
            self.destroy_vbd(conn, vbd)?;
        }
        for vif in &record.vifs {
            self.destroy_vif(conn, vif)?;
        }
        conn.call("VM.destroy", |api, s| api.vm_destroy(s, vm))
    }

    // ----- stop / reboot -----

    /// Shut a VM down and remove it from the host.
    ///
    /// A halted VM needs no shutdown; its object is still removed. Graceful
    /// shutdown escalates to a forced power-off when it fails.
    pub fn stop(&self, conn: &Connection, name: &str, force: bool) -> Result<()> {
        let vms = self.find_vms(conn, name)?;
        let Some((_, first)) = vms.first() else {
            tracing::info!(vm = %name, "VM not present, nothing to stop");
            return self.remove_iso_srs(conn, name, Vec::new());
        };
        let _transition = self
            .tracker
            .begin(name, VmPhase::Stopping, first.power_state.into())?;

        let mut iso_srs = Vec::new();
        for (vm, record) in &vms {
            for sr in self.cd_srs(conn, record)? {
                if !iso_srs.contains(&sr) {
                    iso_srs.push(sr);
                }
            }
            if record.power_state == VmPowerState::Halted {
                tracing::debug!(vm = %name, "Already halted");
            } else {
                self.shutdown(conn, vm, name, force)?;
            }
            let networks: Vec<String> = self
                .vif_records(conn, record)?
                .into_iter()
                .map(|(_, vif)| conn.call("network.get_record", |api, s| api.network_get_record(s, &vif.network)))
                .map(|r| r.map(|n| n.name_label))
                .collect::<Result<_>>()?;
            self.destroy_vm(conn, vm)?;
            for network in networks {
                if let Err(e) = self.networks.release_named(conn, &network) {
                    tracing::warn!(vm = %name, network = %network, error = %e, "Failed to release network");
                }
            }
            tracing::info!(vm = %name, uuid = %record.uuid, "VM stopped and removed");
        }
        self.remove_iso_srs(conn, name, iso_srs)
    }

    fn shutdown(&self, conn: &Connection, vm: &OpaqueRef, name: &str, force: bool) -> Result<()> {
        if !force {
            match self.executor.run_verified(
                conn,
                &AsyncCall::VmCleanShutdown { vm: vm.clone() },
                self.tasks.stop_timeout(),
                Self::power_verifier(vm, VmPowerState::Halted),
            ) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::warn!(vm = %name, error = %e, "Clean shutdown failed, forcing power-off");
                }
            }
        }
        self.executor
            .run_verified(
                conn,
                &AsyncCall::VmHardShutdown { vm: vm.clone() },
                self.tasks.stop_timeout(),
                Self::power_verifier(vm, VmPowerState::Halted),
            )
            .map(|_| ())
    }

    /// SRs backing the images currently inserted in the VM's CD drives.
    ///
    /// An ISO SR attached for one VM is reused by any other VM booting from
    /// the same location, so the name alone does not find it.
    fn cd_srs(&self, conn: &Connection, record: &VmRecord) -> Result<Vec<OpaqueRef>> {
        let mut srs = Vec::new();
        for (_, vbd) in self.vbd_records(conn, record)? {
            if vbd.vbd_type != VbdType::Cd || vbd.empty || vbd.vdi.is_null() {
                continue;
            }
            let vdi = conn.call("VDI.get_record", |api, s| api.vdi_get_record(s, &vbd.vdi))?;
            if !srs.contains(&vdi.sr) {
                srs.push(vdi.sr);
            }
        }
        Ok(srs)
    }

    /// Remove agent-created ISO SRs (`candidates` plus the one named after
    /// the VM) unless a disk in them is still in use.
    fn remove_iso_srs(&self, conn: &Connection, vm_name: &str, mut candidates: Vec<OpaqueRef>) -> Result<()> {
        let name = iso_sr_name(vm_name);
        for sr in conn.call("SR.get_by_name_label", |api, s| api.sr_get_by_name_label(s, &name))? {
            if !candidates.contains(&sr) {
                candidates.push(sr);
            }
        }
        for sr in &candidates {
            let record = match conn.call("SR.get_record", |api, s| api.sr_get_record(s, sr)) {
                Ok(record) => record,
                Err(e) if e.is_missing_object() => continue,
                Err(e) => return Err(e),
            };
            if record.sr_type != "iso" || !record.name_label.ends_with(ISO_SR_SUFFIX) {
                continue;
            }
            let mut busy = false;
            for vdi in &record.vdis {
                let vdi_record = conn.call("VDI.get_record", |api, s| api.vdi_get_record(s, vdi))?;
                busy |= !vdi_record.vbds.is_empty();
            }
            if busy {
                tracing::info!(sr = %record.uuid, vm = %vm_name, "ISO SR still in use, keeping it");
                continue;
            }
            self.storage.remove_sr(conn, &record.uuid)?;
        }
        Ok(())
    }

    pub fn reboot(&self, conn: &Connection, name: &str) -> Result<VmInfo> {
        let (vm, record) = self.vm_by_name(conn, name)?;
        if record.power_state != VmPowerState::Running {
            return Err(Error::InvalidState {
                object: name.to_string(),
                current: record.power_state.to_string(),
                expected: "Running".into(),
            });
        }
        let clean = self.executor.run(
            conn,
            &AsyncCall::VmCleanReboot { vm: vm.clone() },
            self.tasks.reboot_timeout(),
        );
        if let Err(e) = clean {
            tracing::warn!(vm = %name, error = %e, "Clean reboot failed, forcing reboot");
            self.executor.run(
                conn,
                &AsyncCall::VmHardReboot { vm: vm.clone() },
                self.tasks.reboot_timeout(),
            )?;
        }
        let record = self.vm_record(conn, &vm)?;
        self.vm_info(conn, &record)
    }

    // ----- migration -----

    /// Live-migrate a VM to another host of the same pool.
    pub fn migrate(&self, conn: &Connection, name: &str, dest_host_uuid: &str) -> Result<VmInfo> {
        let dest = match conn.call("host.get_by_uuid", |api, s| api.host_get_by_uuid(s, dest_host_uuid)) {
            Ok(host) => host,
            Err(e) if e.is_missing_object() => {
                return Err(Error::Precondition(format!(
                    "destination host {} is not a member of this pool",
                    dest_host_uuid
                )));
            }
            Err(e) => return Err(e),
        };
        let (vm, record) = self.vm_by_name(conn, name)?;
        if record.power_state != VmPowerState::Running {
            return Err(Error::InvalidState {
                object: name.to_string(),
                current: record.power_state.to_string(),
                expected: "Running".into(),
            });
        }
        let transition = self.tracker.begin(name, VmPhase::Migrating, PowerState::PowerOn)?;

        for (vbd, vbd_record) in self.vbd_records(conn, &record)? {
            if vbd_record.vbd_type == VbdType::Cd && !vbd_record.empty {
                tracing::info!(vm = %name, device = %vbd_record.userdevice, "Ejecting CD before migration");
                conn.call("VBD.eject", |api, s| api.vbd_eject(s, &vbd))?;
            }
        }

        self.executor.run(
            conn,
            &AsyncCall::VmPoolMigrate {
                vm: vm.clone(),
                host: dest.clone(),
                live: true,
            },
            self.tasks.migrate_timeout(),
        )?;
        conn.call("VM.set_affinity", |api, s| api.vm_set_affinity(s, &vm, &dest))?;
        tracing::info!(vm = %name, destination = %dest_host_uuid, "VM migrated");

        let record = self.vm_record(conn, &vm)?;
        drop(transition);
        self.vm_info(conn, &record)
    }

    // ----- scaling -----

    /// Change memory bounds (and optionally VCPUs).
    ///
    /// Bounds are validated before anything is sent; a running VM keeps its
    /// static range.
    pub fn scale(&self, conn: &Connection, name: &str, memory: &MemoryLimits, vcpus: Option<u32>) -> Result<VmInfo> {
        memory.validate()?;
        if vcpus == Some(0) {
            return Err(Error::Precondition("vcpus must be at least 1".into()));
        }
        let (vm, record) = self.vm_by_name(conn, name)?;
        let running = record.power_state == VmPowerState::Running;
        if running && !record.memory.same_static_range(memory) {
            return Err(Error::Precondition(format!(
                "static memory range of running VM {} cannot change",
                name
            )));
        }
        if let Some(vcpus) = vcpus {
            if running && vcpus > record.vcpus_max {
                return Err(Error::Precondition(format!(
                    "{} vcpus exceeds the maximum {} of running VM {}",
                    vcpus, record.vcpus_max, name
                )));
            }
        }

        conn.call("VM.set_memory_limits", |api, s| api.vm_set_memory_limits(s, &vm, memory))?;
        if let Some(vcpus) = vcpus {
            let max = if running { record.vcpus_max } else { record.vcpus_max.max(vcpus) };
            conn.call("VM.set_VCPUs", |api, s| api.vm_set_vcpus(s, &vm, max, vcpus))?;
        }
        tracing::info!(vm = %name, dynamic_max = memory.dynamic_max, ?vcpus, "VM scaled");
        let record = self.vm_record(conn, &vm)?;
        self.vm_info(conn, &record)
    }

    // ----- snapshots -----

    pub fn snapshot(&self, conn: &Connection, name: &str, snapshot_name: &str) -> Result<SnapshotInfo> {
        let (vm, record) = self.vm_by_name(conn, name)?;
        let _transition = self
            .tracker
            .begin(name, VmPhase::Snapshotting, record.power_state.into())?;
        let result = self.executor.run(
            conn,
            &AsyncCall::VmSnapshot {
                vm,
                name: snapshot_name.to_string(),
            },
            self.tasks.snapshot_timeout(),
        )?;
        let snapshot = OpaqueRef::new(result);
        let snap_record = self.vm_record(conn, &snapshot)?;
        let disk_uuids = self.snapshot_disks(conn, &snap_record)?;
        tracing::info!(vm = %name, snapshot = %snap_record.uuid, disks = disk_uuids.len(), "VM snapshot taken");
        Ok(SnapshotInfo {
            uuid: snap_record.uuid,
            name: snap_record.name_label,
            vm_uuid: record.uuid,
            disk_uuids,
        })
    }

    fn snapshot_disks(&self, conn: &Connection, record: &VmRecord) -> Result<Vec<String>> {
        let mut disks = Vec::new();
        for (_, vbd) in self.vbd_records(conn, record)? {
            if vbd.vbd_type == VbdType::Disk && !vbd.empty {
                let vdi = conn.call("VDI.get_record", |api, s| api.vdi_get_record(s, &vbd.vdi))?;
                disks.push(vdi.uuid);
            }
        }
        Ok(disks)
    }

    fn snapshot_by_uuid(&self, conn: &Connection, uuid: &str) -> Result<(OpaqueRef, VmRecord)> {
        let snapshot = conn
            .call("VM.get_by_uuid", |api, s| api.vm_get_by_uuid(s, uuid))
            .map_err(|e| if e.is_missing_object() { Error::not_found("VM snapshot", uuid) } else { e })?;
        let record = self.vm_record(conn, &snapshot)?;
        if !record.is_a_snapshot {
            return Err(Error::Precondition(format!("{} is not a VM snapshot", uuid)));
        }
        Ok((snapshot, record))
    }

    /// Roll the snapshot's VM back; returns the VM's power state afterwards.
    pub fn revert(&self, conn: &Connection, snapshot_uuid: &str) -> Result<VmInfo> {
        let (snapshot, snap_record) = self.snapshot_by_uuid(conn, snapshot_uuid)?;
        let vm = snap_record.snapshot_of.clone();
        let record = self.vm_record(conn, &vm)?;
        {
            let _transition = self.tracker.begin(
                &record.name_label,
                VmPhase::Reverting,
                record.power_state.into(),
            )?;
            self.executor.run(
                conn,
                &AsyncCall::VmRevert { snapshot },
                self.tasks.snapshot_timeout(),
            )?;
        }
        tracing::info!(vm = %record.name_label, snapshot = %snapshot_uuid, "VM reverted to snapshot");
        let record = self.vm_record(conn, &vm)?;
        self.vm_info(conn, &record)
    }

    /// Destroy a VM snapshot and its disks. A missing snapshot counts as deleted.
    pub fn delete_snapshot(&self, conn: &Connection, snapshot_uuid: &str) -> Result<()> {
        let (snapshot, record) = match self.snapshot_by_uuid(conn, snapshot_uuid) {
            Ok(found) => found,
            Err(Error::NotFound { .. }) => {
                tracing::info!(snapshot = %snapshot_uuid, "VM snapshot already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let disks = self.snapshot_disks(conn, &record)?;
        self.destroy_vm(conn, &snapshot)?;
        for disk in disks {
            self.storage.delete_vdi(conn, &disk)?;
        }
        tracing::info!(snapshot = %snapshot_uuid, "VM snapshot deleted");
        Ok(())
    }

    // ----- NICs -----

    /// Add a NIC; plugging again with the same device and MAC is a no-op.
    pub fn plug_nic(&self, conn: &Connection, host: &OpaqueRef, name: &str, nic: &NicSpec) -> Result<()> {
        let (vm, record) = self.vm_by_name(conn, name)?;
        let running = record.power_state == VmPowerState::Running;
        let device = nic.device.to_string();
        for (vif, vif_record) in self.vif_records(conn, &record)? {
            let same_mac = vif_record.mac.eq_ignore_ascii_case(&nic.mac);
            if vif_record.device == device && !same_mac {
                return Err(Error::Conflict(format!(
                    "device {} of {} already carries MAC {}",
                    device, name, vif_record.mac
                )));
            }
            if same_mac {
                if running && !vif_record.currently_attached {
                    conn.call("VIF.plug", |api, s| api.vif_plug(s, &vif))?;
                }
                tracing::debug!(vm = %name, mac = %nic.mac, "NIC already present");
                return Ok(());
            }
        }

        let mut comp = Compensation::new();
        let plugged = self.create_vif(conn, host, &vm, nic, &mut comp).and_then(|vif| {
            if running {
                conn.call("VIF.plug", |api, s| api.vif_plug(s, &vif))?;
            }
            Ok(())
        });
        if let Err(e) = plugged {
            let cleanup_failures = comp.unwind(|step| self.undo(conn, step));
            return Err(Error::Compensated {
                operation: format!("plug NIC {} into {}", nic.mac, name),
                source: Box::new(e),
                cleanup_failures,
            });
        }
        tracing::info!(vm = %name, device = %device, mac = %nic.mac, "NIC plugged");
        Ok(())
    }

    /// Remove the NIC with `mac`. A missing NIC counts as removed.
    pub fn unplug_nic(&self, conn: &Connection, name: &str, mac: &str) -> Result<()> {
        let (_, record) = self.vm_by_name(conn, name)?;
        for (vif, vif_record) in self.vif_records(conn, &record)? {
            if !vif_record.mac.eq_ignore_ascii_case(mac) {
                continue;
            }
            let network = conn.call("network.get_record", |api, s| api.network_get_record(s, &vif_record.network))?;
            self.destroy_vif(conn, &vif)?;
            if let Err(e) = self.networks.release_named(conn, &network.name_label) {
                tracing::warn!(network = %network.name_label, error = %e, "Failed to release network");
            }
            tracing::info!(vm = %name, mac = %mac, "NIC unplugged");
            return Ok(());
        }
        tracing::info!(vm = %name, mac = %mac, "NIC not present");
        Ok(())
    }

    // ----- volumes and ISOs -----

    /// Attach a VDI at `device`, or at the first free slot. Returns the slot used.
    pub fn attach_volume(
        &self,
        conn: &Connection,
        host: &OpaqueRef,
        name: &str,
        vdi_uuid: &str,
        device: Option<u32>,
    ) -> Result<u32> {
        let info = self.storage.get_vdi(conn, vdi_uuid)?;
        self.storage.prepare_sr(conn, host, &info.sr_uuid)?;
        let vdi = self.storage.resolve_vdi(conn, vdi_uuid)?;
        let (vm, record) = self.vm_by_name(conn, name)?;
        let vbds = self.vbd_records(conn, &record)?;

        if let Some((_, existing)) = vbds.iter().find(|(_, b)| b.vdi == vdi) {
            tracing::debug!(vm = %name, vdi = %vdi_uuid, "Volume already attached");
            return existing
                .userdevice
                .parse()
                .map_err(|_| Error::Precondition(format!("unexpected device {}", existing.userdevice)));
        }

        let used: HashSet<&str> = vbds.iter().map(|(_, b)| b.userdevice.as_str()).collect();
        let device = match device {
            Some(d) if used.contains(d.to_string().as_str()) => {
                return Err(Error::Conflict(format!("device {} of {} is in use", d, name)));
            }
            Some(d) => d,
            None => (0..=MAX_DISK_DEVICE)
                .filter(|d| *d != CD_DEVICE)
                .find(|d| !used.contains(d.to_string().as_str()))
                .ok_or_else(|| Error::Precondition(format!("{} has no free disk slot", name)))?,
        };

        let vbd_spec = VbdSpec {
            vm: vm.clone(),
            vdi: Some(vdi),
            userdevice: device.to_string(),
            mode: VbdMode::ReadWrite,
            vbd_type: VbdType::Disk,
            bootable: false,
            unpluggable: true,
            empty: false,
        };
        let vbd = conn.call("VBD.create", |api, s| api.vbd_create(s, &vbd_spec))?;
        if record.power_state == VmPowerState::Running {
            if let Err(e) = conn.call("VBD.plug", |api, s| api.vbd_plug(s, &vbd)) {
                if let Err(cleanup) = conn.call("VBD.destroy", |api, s| api.vbd_destroy(s, &vbd)) {
                    tracing::warn!(vbd = %vbd, error = %cleanup, "Failed to remove unplugged VBD");
                }
                return Err(e);
            }
        }
        tracing::info!(vm = %name, vdi = %vdi_uuid, device, "Volume attached");
        Ok(device)
    }

    /// Detach a VDI. Detaching a volume that is not attached succeeds.
    pub fn detach_volume(&self, conn: &Connection, name: &str, vdi_uuid: &str) -> Result<()> {
        let vdi = self.storage.resolve_vdi(conn, vdi_uuid)?;
        let (_, record) = self.vm_by_name(conn, name)?;
        for (vbd, vbd_record) in self.vbd_records(conn, &record)? {
            if vbd_record.vdi == vdi {
                self.destroy_vbd(conn, &vbd)?;
                tracing::info!(vm = %name, vdi = %vdi_uuid, "Volume detached");
                return Ok(());
            }
        }
        tracing::info!(vm = %name, vdi = %vdi_uuid, "Volume not attached");
        Ok(())
    }

    fn cd_drive(&self, conn: &Connection, record: &VmRecord) -> Result<Option<(OpaqueRef, VbdRecord)>> {
        Ok(self
            .vbd_records(conn, record)?
            .into_iter()
            .find(|(_, b)| b.vbd_type == VbdType::Cd))
    }

    /// Insert an ISO into the VM's CD drive, creating the drive if needed.
    pub fn attach_iso(&self, conn: &Connection, host: &OpaqueRef, name: &str, iso_url: &str) -> Result<()> {
        let (vm, record) = self.vm_by_name(conn, name)?;
        let (vdi, _, _) = self.iso_vdi(conn, host, name, iso_url)?;

        let cd = match self.cd_drive(conn, &record)? {
            Some((vbd, cd)) => {
                if cd.vdi == vdi && !cd.empty {
                    return Ok(());
                }
                if !cd.empty {
                    conn.call("VBD.eject", |api, s| api.vbd_eject(s, &vbd))?;
                }
                vbd
            }
            None => {
                let vbd_spec = VbdSpec {
                    vm: vm.clone(),
                    vdi: None,
                    userdevice: CD_DEVICE.to_string(),
                    mode: VbdMode::ReadOnly,
                    vbd_type: VbdType::Cd,
                    bootable: false,
                    unpluggable: true,
                    empty: true,
                };
                let vbd = conn.call("VBD.create", |api, s| api.vbd_create(s, &vbd_spec))?;
                if record.power_state == VmPowerState::Running {
                    conn.call("VBD.plug", |api, s| api.vbd_plug(s, &vbd))?;
                }
                vbd
            }
        };
        conn.call("VBD.insert", |api, s| api.vbd_insert(s, &cd, &vdi))?;
        tracing::info!(vm = %name, iso = %iso_url, "ISO attached");
        Ok(())
    }

    /// Eject the CD and drop the per-VM ISO SR.
    pub fn detach_iso(&self, conn: &Connection, name: &str) -> Result<()> {
        let (_, record) = self.vm_by_name(conn, name)?;
        let iso_srs = self.cd_srs(conn, &record)?;
        if let Some((vbd, cd)) = self.cd_drive(conn, &record)? {
            if !cd.empty {
                conn.call("VBD.eject", |api, s| api.vbd_eject(s, &vbd))?;
                tracing::info!(vm = %name, "ISO ejected");
            }
        }
        self.remove_iso_srs(conn, name, iso_srs)
    }

    // ----- state queries -----

    /// Reported power state. An unknown VM is reported as off.
    pub fn power_state(&self, conn: &Connection, name: &str) -> Result<PowerState> {
        match self.vm_by_name(conn, name) {
            Ok((_, record)) => Ok(self.tracker.reported(name, record.power_state.into())),
            Err(Error::NotFound { .. }) => Ok(self.tracker.reported(name, PowerState::PowerOff)),
            Err(e) => Err(e),
        }
    }

    /// Power state of every guest resident on `host`, by name.
    pub fn host_vm_states(&self, conn: &Connection, host: &OpaqueRef) -> Result<BTreeMap<String, PowerState>> {
        let mut states = BTreeMap::new();
        for vm in conn.call("VM.get_all", |api, s| api.vm_get_all(s))? {
            let record = self.vm_record(conn, &vm)?;
            if record.is_a_template || record.is_a_snapshot || record.is_control_domain {
                continue;
            }
            if &record.resident_on != host {
                continue;
            }
            let state = self
                .tracker
                .reported(&record.name_label, record.power_state.into());
            states.insert(record.name_label, state);
        }
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkSettings, StorageSettings};
    use crate::mgmt::sim::VdiSeed;
    use crate::testing::{Fixture, TEMPLATE};

    const GIB: u64 = 1024 * 1024 * 1024;
    const VM: &str = "i-2-3-test";
    const MAC: &str = "02:00:0c:ae:00:01";

    fn manager(fx: &Fixture) -> VmManager {
        let tasks = TaskSettings::default();
        let storage = Arc::new(StorageManager::new(fx.executor(), tasks.clone(), StorageSettings::default()));
        let networks = Arc::new(NetworkManager::new(NetworkSettings::default()));
        VmManager::new(fx.executor(), tasks, storage, networks)
    }

    fn basic_spec(fx: &Fixture) -> VmSpec {
        VmSpec::builder(VM, TEMPLATE)
            .disk(DiskSpec::new_root(fx.local_sr.clone(), 8 * GIB))
            .nic(NicSpec::new(0, MAC, NetworkSpec::named("guest0")))
            .build()
    }

    fn running_vm(fx: &Fixture, mgr: &VmManager) -> VmInfo {
        mgr.start(&fx.conn(), &fx.host_ref(), &basic_spec(fx)).unwrap()
    }

    #[test]
    fn test_start_creates_bootable_disk_and_nic() {
        let fx = Fixture::new();
        let mgr = manager(&fx);
        let info = running_vm(&fx, &mgr);

        assert_eq!(info.power_state, PowerState::PowerOn);
        assert_eq!(info.host_uuid.as_deref(), Some("host-1"));
        let vbds = fx.sim.vbds_of_vm(VM);
        assert_eq!(vbds.len(), 1);
        assert!(vbds[0].bootable);
        assert_eq!(vbds[0].userdevice, "0");
        let vifs = fx.sim.vifs_of_vm(VM);
        assert_eq!(vifs.len(), 1);
        assert_eq!(vifs[0].device, "0");
        assert_eq!(fx.sim.call_count("Async.VM.start"), 1);
        assert_eq!(fx.sim.live_task_count(), 0);
    }

    #[test]
    fn test_start_returns_vm_already_running_here() {
        let fx = Fixture::new();
        let mgr = manager(&fx);
        let first = running_vm(&fx, &mgr);
        let second = running_vm(&fx, &mgr);
        assert_eq!(first.uuid, second.uuid);
        assert_eq!(fx.sim.call_count("Async.VM.start"), 1);
    }

    #[test]
    fn test_start_conflicts_with_vm_running_elsewhere() {
        let fx = Fixture::new();
        fx.sim.add_vm(VM, VmPowerState::Running, Some("host-2"));
        let err = manager(&fx)
            .start(&fx.conn(), &fx.host_ref(), &basic_spec(&fx))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(fx.sim.call_count("VM.clone"), 0);
    }

    #[test]
    fn test_start_replaces_stale_halted_copy() {
        let fx = Fixture::new();
        let stale = fx.sim.add_vm(VM, VmPowerState::Halted, None);
        let info = running_vm(&fx, &manager(&fx));
        assert_ne!(info.uuid, stale);
        assert!(fx.sim.vm_by_uuid(&stale).is_none());
        assert_eq!(fx.sim.vms_named(VM).len(), 1);
    }

    #[test]
    fn test_failed_start_rolls_back_everything() {
        let fx = Fixture::new();
        fx.sim.inject_task_failure("VM.start", &["HOST_NOT_ENOUGH_FREE_MEMORY"], 1);
        let spec = VmSpec::builder(VM, TEMPLATE)
            .disk(DiskSpec::new_root(fx.local_sr.clone(), 8 * GIB))
            .nic(NicSpec::new(0, MAC, NetworkSpec::Vlan { tag: 42, physical: "guest0".into() }))
            .build();
        let vdis_before = fx.sim.sr_by_uuid(&fx.local_sr).unwrap().vdis.len();

        let err = manager(&fx).start(&fx.conn(), &fx.host_ref(), &spec).unwrap_err();
        match err {
            Error::Compensated { source, cleanup_failures, .. } => {
                assert!(matches!(*source, Error::TaskFailed { .. }));
                assert!(cleanup_failures.is_empty(), "{:?}", cleanup_failures);
            }
            other => panic!("expected Compensated, got {:?}", other),
        }
        assert!(fx.sim.vms_named(VM).is_empty());
        assert_eq!(fx.sim.vbd_count(), 0);
        assert_eq!(fx.sim.vif_count(), 0);
        assert!(fx.sim.networks_named("VLAN-guest0-42").is_empty());
        assert_eq!(fx.sim.sr_by_uuid(&fx.local_sr).unwrap().vdis.len(), vdis_before);
    }

    #[test]
    fn test_existing_disks_survive_rollback() {
        let fx = Fixture::new();
        let root = fx.sim.add_vdi(
            &fx.local_sr,
            VdiSeed {
                name: "root".into(),
                virtual_size: 8 * GIB,
                managed: true,
                ..Default::default()
            },
        );
        fx.sim.inject_task_failure("VM.start", &["INTERNAL_ERROR"], 1);
        let spec = VmSpec::builder(VM, TEMPLATE).disk(DiskSpec::root(root.clone())).build();
        assert!(manager(&fx).start(&fx.conn(), &fx.host_ref(), &spec).is_err());
        assert!(fx.sim.vdi_by_uuid(&root).is_some());
    }

    #[test]
    fn test_start_with_iso_uses_per_vm_sr() {
        let fx = Fixture::new();
        fx.sim.add_iso_image("filer01:/isos", "tools.iso");
        let mgr = manager(&fx);
        let spec = VmSpec::builder(VM, TEMPLATE)
            .disk(DiskSpec::new_root(fx.local_sr.clone(), 8 * GIB))
            .iso("filer01:/isos/tools.iso")
            .build();
        mgr.start(&fx.conn(), &fx.host_ref(), &spec).unwrap();
        assert_eq!(fx.sim.srs_named(&iso_sr_name(VM)).len(), 1);
        let cd = fx
            .sim
            .vbds_of_vm(VM)
            .into_iter()
            .find(|b| b.vbd_type == VbdType::Cd)
            .unwrap();
        assert_eq!(cd.userdevice, "3");

        mgr.stop(&fx.conn(), VM, false).unwrap();
        assert!(fx.sim.srs_named(&iso_sr_name(VM)).is_empty());
    }

    #[test]
    fn test_stop_halted_vm_skips_shutdown() {
        let fx = Fixture::new();
        fx.sim.add_vm(VM, VmPowerState::Halted, None);
        manager(&fx).stop(&fx.conn(), VM, false).unwrap();
        assert_eq!(fx.sim.call_count("Async.VM.clean_shutdown"), 0);
        assert_eq!(fx.sim.call_count("Async.VM.hard_shutdown"), 0);
        assert!(fx.sim.vms_named(VM).is_empty());
    }

    #[test]
    fn test_stop_missing_vm_succeeds() {
        let fx = Fixture::new();
        assert!(manager(&fx).stop(&fx.conn(), "nope", false).is_ok());
    }

    #[test]
    fn test_stop_escalates_to_hard_shutdown() {
        let fx = Fixture::new();
        let mgr = manager(&fx);
        running_vm(&fx, &mgr);
        fx.sim.inject_task_failure("VM.clean_shutdown", &["VM_UNRESPONSIVE"], 1);
        mgr.stop(&fx.conn(), VM, false).unwrap();
        assert_eq!(fx.sim.call_count("Async.VM.hard_shutdown"), 1);
        assert!(fx.sim.vms_named(VM).is_empty());
        assert_eq!(fx.sim.vif_count(), 0);
    }

    #[test]
    fn test_reboot_falls_back_to_hard() {
        let fx = Fixture::new();
        let mgr = manager(&fx);
        running_vm(&fx, &mgr);
        fx.sim.inject_task_failure("VM.clean_reboot", &["VM_UNRESPONSIVE"], 1);
        let info = mgr.reboot(&fx.conn(), VM).unwrap();
        assert_eq!(info.power_state, PowerState::PowerOn);
        assert_eq!(fx.sim.call_count("Async.VM.hard_reboot"), 1);
    }

    #[test]
    fn test_migrate_ejects_cd_and_sets_affinity() {
        let fx = Fixture::new();
        fx.sim.add_iso_image("filer01:/isos", "tools.iso");
        let mgr = manager(&fx);
        let spec = VmSpec::builder(VM, TEMPLATE)
            .disk(DiskSpec::new_root(fx.local_sr.clone(), 8 * GIB))
            .iso("filer01:/isos/tools.iso")
            .build();
        mgr.start(&fx.conn(), &fx.host_ref(), &spec).unwrap();

        let info = mgr.migrate(&fx.conn(), VM, "host-2").unwrap();
        assert_eq!(info.host_uuid.as_deref(), Some("host-2"));
        assert_eq!(fx.sim.call_count("VBD.eject"), 1);
        let vm = fx.sim.vms_named(VM).remove(0);
        assert_eq!(vm.affinity, vm.resident_on);
    }

    #[test]
    fn test_migrate_to_unknown_host_rejected() {
        let fx = Fixture::new();
        let mgr = manager(&fx);
        running_vm(&fx, &mgr);
        let err = mgr.migrate(&fx.conn(), VM, "host-9").unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(fx.sim.call_count("Async.VM.pool_migrate"), 0);
    }

    #[test]
    fn test_scale_rejects_bad_bounds_before_any_call() {
        let fx = Fixture::new();
        let mgr = manager(&fx);
        running_vm(&fx, &mgr);
        let conn = fx.conn();
        fx.sim.clear_calls();
        let bad = MemoryLimits {
            static_min: GIB,
            dynamic_min: GIB,
            dynamic_max: 4 * GIB,
            static_max: 2 * GIB,
        };
        assert!(matches!(mgr.scale(&conn, VM, &bad, None), Err(Error::Precondition(_))));
        assert!(fx.sim.calls().is_empty());
    }

    #[test]
    fn test_scale_running_vm_keeps_static_range() {
        let fx = Fixture::new();
        let mgr = manager(&fx);
        let info = running_vm(&fx, &mgr);
        let mut within = info.memory;
        within.dynamic_min = within.static_min;
        assert!(mgr.scale(&fx.conn(), VM, &within, Some(1)).is_ok());

        let grown = MemoryLimits::fixed(2 * GIB);
        assert!(matches!(mgr.scale(&fx.conn(), VM, &grown, None), Err(Error::Precondition(_))));
        assert_eq!(fx.sim.call_count("VM.set_memory_limits"), 2);
    }

    #[test]
    fn test_snapshot_revert_and_delete() {
        let fx = Fixture::new();
        let mgr = manager(&fx);
        running_vm(&fx, &mgr);
        let snap = mgr.snapshot(&fx.conn(), VM, "before-upgrade").unwrap();
        assert_eq!(snap.disk_uuids.len(), 1);
        assert!(mgr.tracker().is_empty());
        assert_eq!(mgr.power_state(&fx.conn(), VM).unwrap(), PowerState::PowerOn);

        let info = mgr.revert(&fx.conn(), &snap.uuid).unwrap();
        assert_eq!(info.power_state, PowerState::PowerOff);

        mgr.delete_snapshot(&fx.conn(), &snap.uuid).unwrap();
        assert!(fx.sim.vm_by_uuid(&snap.uuid).is_none());
        assert!(fx.sim.vdi_by_uuid(&snap.disk_uuids[0]).is_none());
        mgr.delete_snapshot(&fx.conn(), &snap.uuid).unwrap();
    }

    #[test]
    fn test_transition_in_flight_blocks_stop() {
        let fx = Fixture::new();
        let mgr = manager(&fx);
        running_vm(&fx, &mgr);
        let _busy = mgr
            .tracker()
            .begin(VM, VmPhase::Migrating, PowerState::PowerOn)
            .unwrap();
        assert!(matches!(mgr.stop(&fx.conn(), VM, false), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn test_plug_nic_idempotent_and_unplug() {
        let fx = Fixture::new();
        let mgr = manager(&fx);
        running_vm(&fx, &mgr);
        let conn = fx.conn();
        let host = fx.host_ref();
        let nic = NicSpec::new(1, "02:00:0c:ae:00:02", NetworkSpec::named("guest0")).tag("nic-id", "17");
        mgr.plug_nic(&conn, &host, VM, &nic).unwrap();
        mgr.plug_nic(&conn, &host, VM, &nic).unwrap();
        let vifs = fx.sim.vifs_of_vm(VM);
        assert_eq!(vifs.len(), 2);
        let added = vifs.iter().find(|v| v.device == "1").unwrap();
        assert!(added.currently_attached);
        assert_eq!(added.other_config["nic-id"], "17");

        let clash = NicSpec::new(1, "02:00:0c:ae:00:03", NetworkSpec::named("guest0"));
        assert!(matches!(mgr.plug_nic(&conn, &host, VM, &clash), Err(Error::Conflict(_))));

        mgr.unplug_nic(&conn, VM, "02:00:0c:ae:00:02").unwrap();
        assert_eq!(fx.sim.vifs_of_vm(VM).len(), 1);
        mgr.unplug_nic(&conn, VM, "02:00:0c:ae:00:02").unwrap();
    }

    #[test]
    fn test_attach_volume_finds_free_slot() {
        let fx = Fixture::new();
        let mgr = manager(&fx);
        running_vm(&fx, &mgr);
        let conn = fx.conn();
        let host = fx.host_ref();
        let mut devices = Vec::new();
        for i in 0..3 {
            let data = fx.sim.add_vdi(
                &fx.local_sr,
                VdiSeed {
                    name: format!("data-{}", i),
                    virtual_size: GIB,
                    managed: true,
                    ..Default::default()
                },
            );
            devices.push(mgr.attach_volume(&conn, &host, VM, &data, None).unwrap());
            assert_eq!(mgr.attach_volume(&conn, &host, VM, &data, None).unwrap(), devices[i]);
        }
        assert_eq!(devices, vec![1, 2, 4]);
        assert!(fx.sim.vbds_of_vm(VM).iter().all(|b| b.currently_attached));
    }

    #[test]
    fn test_detach_volume() {
        let fx = Fixture::new();
        let mgr = manager(&fx);
        running_vm(&fx, &mgr);
        let conn = fx.conn();
        let data = fx.sim.add_vdi(
            &fx.local_sr,
            VdiSeed {
                name: "data".into(),
                virtual_size: GIB,
                managed: true,
                ..Default::default()
            },
        );
        mgr.attach_volume(&conn, &fx.host_ref(), VM, &data, Some(5)).unwrap();
        mgr.detach_volume(&conn, VM, &data).unwrap();
        assert_eq!(fx.sim.vbds_of_vm(VM).len(), 1);
        assert!(fx.sim.vdi_by_uuid(&data).is_some());
        mgr.detach_volume(&conn, VM, &data).unwrap();
    }

    #[test]
    fn test_attach_and_detach_iso() {
        let fx = Fixture::new();
        fx.sim.add_iso_image("filer01:/isos", "a.iso");
        fx.sim.add_iso_image("filer01:/isos", "b.iso");
        let mgr = manager(&fx);
        running_vm(&fx, &mgr);
        let conn = fx.conn();
        let host = fx.host_ref();

        mgr.attach_iso(&conn, &host, VM, "filer01:/isos/a.iso").unwrap();
        mgr.attach_iso(&conn, &host, VM, "filer01:/isos/b.iso").unwrap();
        assert_eq!(fx.sim.call_count("VBD.eject"), 1);
        assert_eq!(fx.sim.call_count("VBD.insert"), 2);

        mgr.detach_iso(&conn, VM).unwrap();
        assert!(fx.sim.srs_named(&iso_sr_name(VM)).is_empty());
        assert!(mgr
            .attach_iso(&conn, &host, VM, "filer01:/isos/missing.iso")
            .is_err());
    }

    #[test]
    fn test_host_vm_states() {
        let fx = Fixture::new();
        let mgr = manager(&fx);
        running_vm(&fx, &mgr);
        fx.sim.add_vm("elsewhere", VmPowerState::Running, Some("host-2"));
        let states = mgr.host_vm_states(&fx.conn(), &fx.host_ref()).unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[VM], PowerState::PowerOn);
        assert_eq!(mgr.power_state(&fx.conn(), "ghost").unwrap(), PowerState::PowerOff);
    }
}
