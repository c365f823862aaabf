//! Records and call descriptors exchanged with the management API

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::vm::MemoryLimits;

/// Key in a VDI's `sm_config` naming its parent VHD node.
pub const VHD_PARENT_KEY: &str = "vhd-parent";

/// Opaque server-side reference to a remote object.
///
/// A reference is only meaningful inside the session that produced it and is
/// never kept past the operation that resolved it; persist UUIDs instead.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpaqueRef(String);

impl OpaqueRef {
    pub const NULL: &'static str = "OpaqueRef:NULL";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn null() -> Self {
        Self(Self::NULL.to_string())
    }

    pub fn is_null(&self) -> bool {
        self.0 == Self::NULL || self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpaqueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authenticated session handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionRef(String);

impl SessionRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Power state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmPowerState {
    Halted,
    Running,
    Paused,
    Suspended,
    Unrecognized,
}

impl fmt::Display for VmPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmPowerState::Halted => write!(f, "Halted"),
            VmPowerState::Running => write!(f, "Running"),
            VmPowerState::Paused => write!(f, "Paused"),
            VmPowerState::Suspended => write!(f, "Suspended"),
            VmPowerState::Unrecognized => write!(f, "Unrecognized"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub uuid: String,
    pub name_label: String,
    pub address: String,
    pub cpu_count: u32,
    pub cpu_speed_mhz: u64,
    pub product_version: String,
    pub memory_total: u64,
    pub memory_free: u64,
    pub pifs: Vec<OpaqueRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub uuid: String,
    pub name_label: String,
    pub power_state: VmPowerState,
    pub is_a_template: bool,
    pub is_a_snapshot: bool,
    pub is_control_domain: bool,
    pub snapshot_of: OpaqueRef,
    pub resident_on: OpaqueRef,
    pub affinity: OpaqueRef,
    pub memory: MemoryLimits,
    pub vcpus_max: u32,
    pub vcpus_at_startup: u32,
    pub vbds: Vec<OpaqueRef>,
    pub vifs: Vec<OpaqueRef>,
    pub snapshots: Vec<OpaqueRef>,
    pub pv_bootloader: String,
    pub other_config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrRecord {
    pub uuid: String,
    pub name_label: String,
    pub sr_type: String,
    pub content_type: String,
    pub shared: bool,
    pub physical_size: u64,
    pub physical_utilisation: u64,
    pub pbds: Vec<OpaqueRef>,
    pub vdis: Vec<OpaqueRef>,
}

/// Physical block device: the binding of an SR to one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbdRecord {
    pub uuid: String,
    pub host: OpaqueRef,
    pub sr: OpaqueRef,
    pub device_config: BTreeMap<String, String>,
    pub currently_attached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VdiType {
    System,
    User,
    Ephemeral,
    Iso,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdiRecord {
    pub uuid: String,
    pub name_label: String,
    pub sr: OpaqueRef,
    pub virtual_size: u64,
    pub physical_utilisation: u64,
    pub vdi_type: VdiType,
    pub read_only: bool,
    pub sharable: bool,
    pub managed: bool,
    pub is_a_snapshot: bool,
    pub snapshot_of: OpaqueRef,
    pub vbds: Vec<OpaqueRef>,
    pub sm_config: BTreeMap<String, String>,
}

impl VdiRecord {
    /// UUID of the parent VHD node, if this disk is a delta.
    pub fn vhd_parent(&self) -> Option<&str> {
        self.sm_config
            .get(VHD_PARENT_KEY)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VbdMode {
    #[serde(rename = "RO")]
    ReadOnly,
    #[serde(rename = "RW")]
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VbdType {
    Disk,
    #[serde(rename = "CD")]
    Cd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VbdRecord {
    pub uuid: String,
    pub vm: OpaqueRef,
    pub vdi: OpaqueRef,
    pub userdevice: String,
    pub mode: VbdMode,
    pub vbd_type: VbdType,
    pub bootable: bool,
    pub unpluggable: bool,
    pub empty: bool,
    pub currently_attached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VifRecord {
    pub uuid: String,
    pub vm: OpaqueRef,
    pub network: OpaqueRef,
    pub device: String,
    pub mac: String,
    pub mtu: u32,
    pub currently_attached: bool,
    pub other_config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub uuid: String,
    pub name_label: String,
    pub bridge: String,
    pub mtu: u32,
    pub pifs: Vec<OpaqueRef>,
    pub vifs: Vec<OpaqueRef>,
    pub other_config: BTreeMap<String, String>,
}

/// Physical interface. `vlan` is -1 for untagged interfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PifRecord {
    pub uuid: String,
    pub device: String,
    pub host: OpaqueRef,
    pub network: OpaqueRef,
    pub vlan: i64,
    pub management: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Success,
    Failure,
    Cancelling,
    Cancelled,
}

impl TaskStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Cancelling)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub uuid: String,
    pub name_label: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub result: String,
    pub error_info: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SrCreateSpec {
    pub host: OpaqueRef,
    pub device_config: BTreeMap<String, String>,
    pub physical_size: u64,
    pub name_label: String,
    pub sr_type: String,
    pub content_type: String,
    pub shared: bool,
}

#[derive(Debug, Clone)]
pub struct VdiSpec {
    pub name_label: String,
    pub sr: OpaqueRef,
    pub virtual_size: u64,
    pub vdi_type: VdiType,
    pub read_only: bool,
    pub sharable: bool,
}

#[derive(Debug, Clone)]
pub struct VbdSpec {
    pub vm: OpaqueRef,
    pub vdi: Option<OpaqueRef>,
    pub userdevice: String,
    pub mode: VbdMode,
    pub vbd_type: VbdType,
    pub bootable: bool,
    pub unpluggable: bool,
    pub empty: bool,
}

#[derive(Debug, Clone)]
pub struct VifSpec {
    pub vm: OpaqueRef,
    pub network: OpaqueRef,
    pub device: String,
    pub mac: String,
    pub mtu: u32,
    pub other_config: BTreeMap<String, String>,
}

/// Long-running operations that are submitted as tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncCall {
    VmStart { vm: OpaqueRef, host: Option<OpaqueRef> },
    VmCleanShutdown { vm: OpaqueRef },
    VmHardShutdown { vm: OpaqueRef },
    VmCleanReboot { vm: OpaqueRef },
    VmHardReboot { vm: OpaqueRef },
    VmPoolMigrate { vm: OpaqueRef, host: OpaqueRef, live: bool },
    VmSnapshot { vm: OpaqueRef, name: String },
    VmRevert { snapshot: OpaqueRef },
    VdiCopy { vdi: OpaqueRef, sr: OpaqueRef },
    SrScan { sr: OpaqueRef },
}

impl AsyncCall {
    /// Method name on the management API, without the `Async.` prefix.
    pub fn method(&self) -> &'static str {
        match self {
            AsyncCall::VmStart { .. } => "VM.start",
            AsyncCall::VmCleanShutdown { .. } => "VM.clean_shutdown",
            AsyncCall::VmHardShutdown { .. } => "VM.hard_shutdown",
            AsyncCall::VmCleanReboot { .. } => "VM.clean_reboot",
            AsyncCall::VmHardReboot { .. } => "VM.hard_reboot",
            AsyncCall::VmPoolMigrate { .. } => "VM.pool_migrate",
            AsyncCall::VmSnapshot { .. } => "VM.snapshot",
            AsyncCall::VmRevert { .. } => "VM.revert",
            AsyncCall::VdiCopy { .. } => "VDI.copy",
            AsyncCall::SrScan { .. } => "SR.scan",
        }
    }

    /// The object the call operates on.
    pub fn target(&self) -> &OpaqueRef {
        match self {
            AsyncCall::VmStart { vm, .. }
            | AsyncCall::VmCleanShutdown { vm }
            | AsyncCall::VmHardShutdown { vm }
            | AsyncCall::VmCleanReboot { vm }
            | AsyncCall::VmHardReboot { vm }
            | AsyncCall::VmPoolMigrate { vm, .. }
            | AsyncCall::VmSnapshot { vm, .. } => vm,
            AsyncCall::VmRevert { snapshot } => snapshot,
            AsyncCall::VdiCopy { vdi, .. } => vdi,
            AsyncCall::SrScan { sr } => sr,
        }
    }
}

impl fmt::Display for AsyncCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Async.{}({})", self.method(), self.target())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_ref() {
        assert!(OpaqueRef::null().is_null());
        assert!(OpaqueRef::new("").is_null());
        assert!(!OpaqueRef::new("OpaqueRef:42").is_null());
    }

    #[test]
    fn test_async_call_display() {
        let call = AsyncCall::VmStart {
            vm: OpaqueRef::new("OpaqueRef:7"),
            host: None,
        };
        assert_eq!(call.to_string(), "Async.VM.start(OpaqueRef:7)");
    }

    #[test]
    fn test_vhd_parent_ignores_empty() {
        let mut record = VdiRecord {
            uuid: "a".into(),
            name_label: "disk".into(),
            sr: OpaqueRef::null(),
            virtual_size: 1,
            physical_utilisation: 1,
            vdi_type: VdiType::User,
            read_only: false,
            sharable: false,
            managed: true,
            is_a_snapshot: false,
            snapshot_of: OpaqueRef::null(),
            vbds: vec![],
            sm_config: BTreeMap::new(),
        };
        assert_eq!(record.vhd_parent(), None);
        record.sm_config.insert(VHD_PARENT_KEY.into(), String::new());
        assert_eq!(record.vhd_parent(), None);
        record.sm_config.insert(VHD_PARENT_KEY.into(), "b".into());
        assert_eq!(record.vhd_parent(), Some("b"));
    }
}
