//! Management API seam
//!
//! `ManagementApi` is the outbound surface of a hypervisor pool: sessions,
//! object CRUD, async tasks and named plugin calls. The agent only ever talks
//! to the pool through this trait; `sim` provides an in-process implementation.

pub mod sim;
pub mod types;

use std::collections::BTreeMap;

use crate::vm::MemoryLimits;
use crate::Result;

pub use sim::SimulatedPool;
pub use types::*;

/// Operations exposed by a pool's management endpoint.
///
/// Every call except `login` runs inside a session. Remote failures are
/// reported as [`crate::Error::Api`] carrying the server's error code.
#[cfg_attr(test, mockall::automock)]
pub trait ManagementApi: Send + Sync {
    fn login(&self, username: &str, password: &str) -> Result<SessionRef>;
    fn logout(&self, session: &SessionRef) -> Result<()>;

    // pool / host
    fn pool_get_uuid(&self, session: &SessionRef) -> Result<String>;
    fn host_get_all(&self, session: &SessionRef) -> Result<Vec<OpaqueRef>>;
    fn host_get_by_uuid(&self, session: &SessionRef, uuid: &str) -> Result<OpaqueRef>;
    fn host_get_record(&self, session: &SessionRef, host: &OpaqueRef) -> Result<HostRecord>;

    // VM
    fn vm_get_all(&self, session: &SessionRef) -> Result<Vec<OpaqueRef>>;
    fn vm_get_by_uuid(&self, session: &SessionRef, uuid: &str) -> Result<OpaqueRef>;
    fn vm_get_by_name_label(&self, session: &SessionRef, name: &str) -> Result<Vec<OpaqueRef>>;
    fn vm_get_record(&self, session: &SessionRef, vm: &OpaqueRef) -> Result<VmRecord>;
    fn vm_clone(&self, session: &SessionRef, template: &OpaqueRef, name: &str) -> Result<OpaqueRef>;
    fn vm_set_is_a_template(&self, session: &SessionRef, vm: &OpaqueRef, value: bool) -> Result<()>;
    fn vm_set_memory_limits(&self, session: &SessionRef, vm: &OpaqueRef, limits: &MemoryLimits) -> Result<()>;
    fn vm_set_vcpus(&self, session: &SessionRef, vm: &OpaqueRef, max: u32, at_startup: u32) -> Result<()>;
    fn vm_set_affinity(&self, session: &SessionRef, vm: &OpaqueRef, host: &OpaqueRef) -> Result<()>;
    fn vm_add_to_other_config(&self, session: &SessionRef, vm: &OpaqueRef, key: &str, value: &str) -> Result<()>;
    fn vm_destroy(&self, session: &SessionRef, vm: &OpaqueRef) -> Result<()>;

    // storage repositories
    fn sr_get_all(&self, session: &SessionRef) -> Result<Vec<OpaqueRef>>;
    fn sr_get_by_uuid(&self, session: &SessionRef, uuid: &str) -> Result<OpaqueRef>;
    fn sr_get_by_name_label(&self, session: &SessionRef, name: &str) -> Result<Vec<OpaqueRef>>;
    fn sr_get_record(&self, session: &SessionRef, sr: &OpaqueRef) -> Result<SrRecord>;
    /// UUIDs of SRs already present on the backing store described by `device_config`.
    fn sr_probe(
        &self,
        session: &SessionRef,
        host: &OpaqueRef,
        device_config: &BTreeMap<String, String>,
        sr_type: &str,
    ) -> Result<Vec<String>>;
    fn sr_create(&self, session: &SessionRef, spec: &SrCreateSpec) -> Result<OpaqueRef>;
    fn sr_introduce(
        &self,
        session: &SessionRef,
        uuid: &str,
        name_label: &str,
        sr_type: &str,
        content_type: &str,
        shared: bool,
    ) -> Result<OpaqueRef>;
    fn sr_forget(&self, session: &SessionRef, sr: &OpaqueRef) -> Result<()>;

    // PBDs
    fn pbd_create(
        &self,
        session: &SessionRef,
        host: &OpaqueRef,
        sr: &OpaqueRef,
        device_config: &BTreeMap<String, String>,
    ) -> Result<OpaqueRef>;
    fn pbd_get_record(&self, session: &SessionRef, pbd: &OpaqueRef) -> Result<PbdRecord>;
    fn pbd_plug(&self, session: &SessionRef, pbd: &OpaqueRef) -> Result<()>;
    fn pbd_unplug(&self, session: &SessionRef, pbd: &OpaqueRef) -> Result<()>;
    fn pbd_destroy(&self, session: &SessionRef, pbd: &OpaqueRef) -> Result<()>;

    // VDIs
    fn vdi_create(&self, session: &SessionRef, spec: &VdiSpec) -> Result<OpaqueRef>;
    fn vdi_get_by_uuid(&self, session: &SessionRef, uuid: &str) -> Result<OpaqueRef>;
    fn vdi_get_record(&self, session: &SessionRef, vdi: &OpaqueRef) -> Result<VdiRecord>;
    fn vdi_destroy(&self, session: &SessionRef, vdi: &OpaqueRef) -> Result<()>;
    fn vdi_forget(&self, session: &SessionRef, vdi: &OpaqueRef) -> Result<()>;
    fn vdi_resize(&self, session: &SessionRef, vdi: &OpaqueRef, size: u64) -> Result<()>;
    fn vdi_snapshot(&self, session: &SessionRef, vdi: &OpaqueRef) -> Result<OpaqueRef>;

    // VBDs
    fn vbd_create(&self, session: &SessionRef, spec: &VbdSpec) -> Result<OpaqueRef>;
    fn vbd_get_record(&self, session: &SessionRef, vbd: &OpaqueRef) -> Result<VbdRecord>;
    fn vbd_plug(&self, session: &SessionRef, vbd: &OpaqueRef) -> Result<()>;
    fn vbd_unplug(&self, session: &SessionRef, vbd: &OpaqueRef) -> Result<()>;
    fn vbd_destroy(&self, session: &SessionRef, vbd: &OpaqueRef) -> Result<()>;
    fn vbd_eject(&self, session: &SessionRef, vbd: &OpaqueRef) -> Result<()>;
    fn vbd_insert(&self, session: &SessionRef, vbd: &OpaqueRef, vdi: &OpaqueRef) -> Result<()>;

    // VIFs
    fn vif_create(&self, session: &SessionRef, spec: &VifSpec) -> Result<OpaqueRef>;
    fn vif_get_record(&self, session: &SessionRef, vif: &OpaqueRef) -> Result<VifRecord>;
    fn vif_plug(&self, session: &SessionRef, vif: &OpaqueRef) -> Result<()>;
    fn vif_unplug(&self, session: &SessionRef, vif: &OpaqueRef) -> Result<()>;
    fn vif_destroy(&self, session: &SessionRef, vif: &OpaqueRef) -> Result<()>;

    // networks
    fn network_get_by_name_label(&self, session: &SessionRef, name: &str) -> Result<Vec<OpaqueRef>>;
    fn network_get_record(&self, session: &SessionRef, network: &OpaqueRef) -> Result<NetworkRecord>;
    fn network_create(
        &self,
        session: &SessionRef,
        name_label: &str,
        other_config: &BTreeMap<String, String>,
    ) -> Result<OpaqueRef>;
    fn network_add_to_other_config(
        &self,
        session: &SessionRef,
        network: &OpaqueRef,
        key: &str,
        value: &str,
    ) -> Result<()>;
    fn network_destroy(&self, session: &SessionRef, network: &OpaqueRef) -> Result<()>;
    fn pif_get_record(&self, session: &SessionRef, pif: &OpaqueRef) -> Result<PifRecord>;
    /// Create a tagged interface on `pif`'s device and attach it to `network`.
    fn vlan_create(&self, session: &SessionRef, pif: &OpaqueRef, tag: u16, network: &OpaqueRef) -> Result<OpaqueRef>;
    fn vlan_destroy(&self, session: &SessionRef, vlan_pif: &OpaqueRef) -> Result<()>;

    // tasks
    fn submit_async(&self, session: &SessionRef, call: &AsyncCall) -> Result<OpaqueRef>;
    fn task_get_record(&self, session: &SessionRef, task: &OpaqueRef) -> Result<TaskRecord>;
    fn task_cancel(&self, session: &SessionRef, task: &OpaqueRef) -> Result<()>;
    fn task_destroy(&self, session: &SessionRef, task: &OpaqueRef) -> Result<()>;

    // host plugins
    fn call_plugin(
        &self,
        session: &SessionRef,
        host: &OpaqueRef,
        plugin: &str,
        function: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<String>;
}
