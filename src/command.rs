//! Control-plane commands and their answers

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::network::{NetworkInfo, SecurityGroupRules};
use crate::stats::{HostStats, VmStats};
use crate::storage::{BackupOutcome, BackupRequest, SrInfo, StoragePoolSpec, StorageStats, VdiInfo};
use crate::vm::{MemoryLimits, NicSpec, PowerState, SnapshotInfo, VmInfo, VmSpec};

/// One request from the control plane. VMs are addressed by name, storage
/// objects by UUID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    // === VMs ===
    StartVm {
        vm: VmSpec,
    },
    StopVm {
        vm_name: String,
        #[serde(default)]
        force: bool,
    },
    RebootVm {
        vm_name: String,
    },
    MigrateVm {
        vm_name: String,
        dest_host_uuid: String,
    },
    ScaleVm {
        vm_name: String,
        memory: MemoryLimits,
        #[serde(default)]
        vcpus: Option<u32>,
    },

    // === Volumes ===
    AttachVolume {
        vm_name: String,
        vdi_uuid: String,
        #[serde(default)]
        device: Option<u32>,
    },
    DetachVolume {
        vm_name: String,
        vdi_uuid: String,
    },
    AttachIso {
        vm_name: String,
        iso_url: String,
    },
    DetachIso {
        vm_name: String,
    },
    CreateVolume {
        sr_uuid: String,
        name: String,
        size: u64,
    },
    DeleteVolume {
        vdi_uuid: String,
    },
    ResizeVolume {
        vdi_uuid: String,
        new_size: u64,
    },
    CopyVolume {
        vdi_uuid: String,
        dest_sr_uuid: String,
    },

    // === Storage pools ===
    CreateStoragePool {
        pool: StoragePoolSpec,
    },
    DeleteStoragePool {
        sr_uuid: String,
    },

    // === Snapshots ===
    CreateVolumeSnapshot {
        vdi_uuid: String,
    },
    BackupSnapshot {
        backup: BackupRequest,
    },
    CreateVmSnapshot {
        vm_name: String,
        #[serde(default)]
        snapshot_name: Option<String>,
    },
    DeleteVmSnapshot {
        snapshot_uuid: String,
    },
    RevertToVmSnapshot {
        snapshot_uuid: String,
    },

    // === Networking ===
    PlugNic {
        vm_name: String,
        nic: NicSpec,
    },
    UnplugNic {
        vm_name: String,
        mac: String,
    },
    SecurityGroupRules {
        rules: SecurityGroupRules,
    },
    SetupTunnelNetwork {
        key: u32,
    },

    // === Statistics ===
    GetHostStats,
    GetVmStats {
        vm_names: Vec<String>,
    },
    GetStorageStats {
        sr_uuid: String,
    },

    // === Host ===
    Ping,
    RotatePassword {
        username: String,
        password: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartVm { .. } => "StartVm",
            Command::StopVm { .. } => "StopVm",
            Command::RebootVm { .. } => "RebootVm",
            Command::MigrateVm { .. } => "MigrateVm",
            Command::ScaleVm { .. } => "ScaleVm",
            Command::AttachVolume { .. } => "AttachVolume",
            Command::DetachVolume { .. } => "DetachVolume",
            Command::AttachIso { .. } => "AttachIso",
            Command::DetachIso { .. } => "DetachIso",
            Command::CreateVolume { .. } => "CreateVolume",
            Command::DeleteVolume { .. } => "DeleteVolume",
            Command::ResizeVolume { .. } => "ResizeVolume",
            Command::CopyVolume { .. } => "CopyVolume",
            Command::CreateStoragePool { .. } => "CreateStoragePool",
            Command::DeleteStoragePool { .. } => "DeleteStoragePool",
            Command::CreateVolumeSnapshot { .. } => "CreateVolumeSnapshot",
            Command::BackupSnapshot { .. } => "BackupSnapshot",
            Command::CreateVmSnapshot { .. } => "CreateVmSnapshot",
            Command::DeleteVmSnapshot { .. } => "DeleteVmSnapshot",
            Command::RevertToVmSnapshot { .. } => "RevertToVmSnapshot",
            Command::PlugNic { .. } => "PlugNic",
            Command::UnplugNic { .. } => "UnplugNic",
            Command::SecurityGroupRules { .. } => "SecurityGroupRules",
            Command::SetupTunnelNetwork { .. } => "SetupTunnelNetwork",
            Command::GetHostStats => "GetHostStats",
            Command::GetVmStats { .. } => "GetVmStats",
            Command::GetStorageStats { .. } => "GetStorageStats",
            Command::Ping => "Ping",
            Command::RotatePassword { .. } => "RotatePassword",
        }
    }

    /// The object the command acts on, for logs and failure details.
    pub fn target(&self) -> String {
        match self {
            Command::StartVm { vm } => vm.name.clone(),
            Command::StopVm { vm_name, .. }
            | Command::RebootVm { vm_name }
            | Command::MigrateVm { vm_name, .. }
            | Command::ScaleVm { vm_name, .. }
            | Command::AttachVolume { vm_name, .. }
            | Command::DetachVolume { vm_name, .. }
            | Command::AttachIso { vm_name, .. }
            | Command::DetachIso { vm_name }
            | Command::CreateVmSnapshot { vm_name, .. }
            | Command::PlugNic { vm_name, .. }
            | Command::UnplugNic { vm_name, .. } => vm_name.clone(),
            Command::CreateVolume { sr_uuid, .. }
            | Command::DeleteStoragePool { sr_uuid }
            | Command::GetStorageStats { sr_uuid } => sr_uuid.clone(),
            Command::DeleteVolume { vdi_uuid }
            | Command::ResizeVolume { vdi_uuid, .. }
            | Command::CopyVolume { vdi_uuid, .. }
            | Command::CreateVolumeSnapshot { vdi_uuid } => vdi_uuid.clone(),
            Command::CreateStoragePool { pool } => pool.name_label.clone(),
            Command::BackupSnapshot { backup } => backup.snapshot_uuid.clone(),
            Command::DeleteVmSnapshot { snapshot_uuid }
            | Command::RevertToVmSnapshot { snapshot_uuid } => snapshot_uuid.clone(),
            Command::SecurityGroupRules { rules } => rules.vm_name.clone(),
            Command::SetupTunnelNetwork { key } => format!("tunnel {}", key),
            Command::GetVmStats { vm_names } => vm_names.join(","),
            Command::RotatePassword { username, .. } => username.clone(),
            Command::GetHostStats | Command::Ping => "host".to_string(),
        }
    }
}

/// Typed result data carried by a successful answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerPayload {
    Vm(VmInfo),
    PowerStates(BTreeMap<String, PowerState>),
    Volume(VdiInfo),
    Device { device: u32 },
    StoragePool(SrInfo),
    Backup(BackupOutcome),
    VmSnapshot(SnapshotInfo),
    Network(NetworkInfo),
    HostStats(HostStats),
    VmStats(BTreeMap<String, VmStats>),
    StorageStats(StorageStats),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub success: bool,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<AnswerPayload>,
}

impl Answer {
    pub fn ok(details: impl Into<String>) -> Self {
        Self {
            success: true,
            details: details.into(),
            payload: None,
        }
    }

    pub fn with_payload(details: impl Into<String>, payload: AnswerPayload) -> Self {
        Self {
            success: true,
            details: details.into(),
            payload: Some(payload),
        }
    }

    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            success: false,
            details: details.into(),
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_from_json() {
        let cmd: Command = serde_json::from_str(
            r#"{"command": "stop_vm", "vm_name": "i-2-3-test"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::StopVm {
                vm_name: "i-2-3-test".into(),
                force: false
            }
        );
        assert_eq!(cmd.name(), "StopVm");
        assert_eq!(cmd.target(), "i-2-3-test");

        let ping: Command = serde_json::from_str(r#"{"command": "ping"}"#).unwrap();
        assert_eq!(ping, Command::Ping);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let result: Result<Command, _> = serde_json::from_str(r#"{"command": "format_disk"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_answer_json_shape() {
        let answer = Answer::with_payload("attached", AnswerPayload::Device { device: 4 });
        let json = serde_json::to_value(&answer).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["payload"]["kind"], "device");
        assert_eq!(json["payload"]["device"], 4);

        let failed = serde_json::to_value(Answer::failure("boom")).unwrap();
        assert!(failed.get("payload").is_none());
    }
}
