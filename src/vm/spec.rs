//! VM definitions handed to `VmManager::start`

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::memory::MemoryLimits;
use crate::network::NetworkSpec;
use crate::{Error, Result};

/// Device slot reserved for the CD drive.
pub const CD_DEVICE: u32 = 3;
/// Highest VBD device slot a guest can use.
pub const MAX_DISK_DEVICE: u32 = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootMode {
    /// Paravirtualized guest booted through its own bootloader.
    #[default]
    PyGrub,
    Hvm,
}

impl BootMode {
    pub fn bootloader(&self) -> &'static str {
        match self {
            BootMode::PyGrub => "pygrub",
            BootMode::Hvm => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskKind {
    Root,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DiskSource {
    /// A VDI prepared beforehand (e.g. a root disk copied from a template).
    Existing { vdi_uuid: String },
    /// A blank VDI created for this VM.
    New { sr_uuid: String, size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub kind: DiskKind,
    pub device: u32,
    #[serde(flatten)]
    pub source: DiskSource,
}

impl DiskSpec {
    pub fn root(vdi_uuid: impl Into<String>) -> Self {
        Self {
            kind: DiskKind::Root,
            device: 0,
            source: DiskSource::Existing {
                vdi_uuid: vdi_uuid.into(),
            },
        }
    }

    pub fn new_root(sr_uuid: impl Into<String>, size: u64) -> Self {
        Self {
            kind: DiskKind::Root,
            device: 0,
            source: DiskSource::New {
                sr_uuid: sr_uuid.into(),
                size,
            },
        }
    }

    pub fn data(device: u32, vdi_uuid: impl Into<String>) -> Self {
        Self {
            kind: DiskKind::Data,
            device,
            source: DiskSource::Existing {
                vdi_uuid: vdi_uuid.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicSpec {
    pub device: u32,
    pub mac: String,
    pub network: NetworkSpec,
    #[serde(default)]
    pub mtu: Option<u32>,
    /// Control-plane identifiers stored on the VIF (nic id, network id).
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl NicSpec {
    pub fn new(device: u32, mac: impl Into<String>, network: NetworkSpec) -> Self {
        Self {
            device,
            mac: mac.into(),
            network,
            mtu: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub template: String,
    pub memory: MemoryLimits,
    pub vcpus: u32,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    /// ISO image URL, mounted through a per-VM ISO SR.
    #[serde(default)]
    pub iso: Option<String>,
    #[serde(default)]
    pub nics: Vec<NicSpec>,
    #[serde(default)]
    pub boot_mode: BootMode,
}

impl VmSpec {
    pub fn builder(name: impl Into<String>, template: impl Into<String>) -> VmSpecBuilder {
        VmSpecBuilder {
            spec: VmSpec {
                name: name.into(),
                template: template.into(),
                memory: MemoryLimits::fixed(512 * 1024 * 1024),
                vcpus: 1,
                disks: Vec::new(),
                iso: None,
                nics: Vec::new(),
                boot_mode: BootMode::default(),
            },
        }
    }

    /// Checks that need no remote call.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Precondition("VM name cannot be empty".into()));
        }
        if self.template.is_empty() {
            return Err(Error::Precondition("template cannot be empty".into()));
        }
        if self.vcpus == 0 {
            return Err(Error::Precondition("vcpus must be at least 1".into()));
        }
        self.memory.validate()?;

        if self.disks.iter().filter(|d| d.kind == DiskKind::Root).count() > 1 {
            return Err(Error::Precondition(format!("{} has more than one root disk", self.name)));
        }
        let mut devices = HashSet::new();
        for disk in &self.disks {
            if disk.device > MAX_DISK_DEVICE {
                return Err(Error::Precondition(format!("disk device {} out of range", disk.device)));
            }
            if self.iso.is_some() && disk.device == CD_DEVICE {
                return Err(Error::Precondition(format!(
                    "disk device {} is reserved for the CD drive",
                    CD_DEVICE
                )));
            }
            if !devices.insert(disk.device) {
                return Err(Error::Precondition(format!("disk device {} used twice", disk.device)));
            }
        }
        let mut nic_devices = HashSet::new();
        for nic in &self.nics {
            if !nic_devices.insert(nic.device) {
                return Err(Error::Precondition(format!("NIC device {} used twice", nic.device)));
            }
        }
        Ok(())
    }
}

pub struct VmSpecBuilder {
    spec: VmSpec,
}

impl VmSpecBuilder {
    pub fn memory(mut self, limits: MemoryLimits) -> Self {
        self.spec.memory = limits;
        self
    }

    pub fn vcpus(mut self, vcpus: u32) -> Self {
        self.spec.vcpus = vcpus;
        self
    }

    pub fn disk(mut self, disk: DiskSpec) -> Self {
        self.spec.disks.push(disk);
        self
    }

    pub fn iso(mut self, url: impl Into<String>) -> Self {
        self.spec.iso = Some(url.into());
        self
    }

    pub fn nic(mut self, nic: NicSpec) -> Self {
        self.spec.nics.push(nic);
        self
    }

    pub fn boot_mode(mut self, mode: BootMode) -> Self {
        self.spec.boot_mode = mode;
        self
    }

    pub fn build(self) -> VmSpec {
        self.spec
    }

    pub fn build_validated(self) -> Result<VmSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_builder_defaults() {
        let spec = VmSpec::builder("i-2-3-test", "Debian Template").build();
        assert_eq!(spec.vcpus, 1);
        assert_eq!(spec.boot_mode, BootMode::PyGrub);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_memory_invariant_checked() {
        let bad = MemoryLimits {
            static_min: GIB,
            dynamic_min: GIB / 2,
            dynamic_max: GIB,
            static_max: GIB,
        };
        let result = VmSpec::builder("vm", "tmpl").memory(bad).build_validated();
        assert!(matches!(result, Err(Error::Precondition(_))));
    }

    #[test]
    fn test_duplicate_devices_rejected() {
        let spec = VmSpec::builder("vm", "tmpl")
            .disk(DiskSpec::root("a"))
            .disk(DiskSpec::data(0, "b"))
            .build();
        assert!(spec.validate().is_err());

        let spec = VmSpec::builder("vm", "tmpl")
            .disk(DiskSpec::root("a"))
            .disk(DiskSpec::data(CD_DEVICE, "b"))
            .iso("filer:/isos/x.iso")
            .build();
        assert!(spec.validate().is_err());

        let net = NetworkSpec::named("guest0");
        let spec = VmSpec::builder("vm", "tmpl")
            .nic(NicSpec::new(0, "02:00:00:00:00:01", net.clone()))
            .nic(NicSpec::new(0, "02:00:00:00:00:02", net))
            .build();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_spec_from_json() {
        let spec: VmSpec = serde_json::from_str(
            r#"{
                "name": "i-2-3-test",
                "template": "Debian Template",
                "memory": {"static_min": 536870912, "dynamic_min": 536870912,
                           "dynamic_max": 536870912, "static_max": 536870912},
                "vcpus": 1,
                "disks": [{"kind": "root", "device": 0, "source": "new", "sr_uuid": "sr-1", "size": 8589934592}],
                "nics": [{"device": 0, "mac": "02:00:00:00:00:01",
                          "network": {"type": "named", "name": "guest0"}}]
            }"#,
        )
        .unwrap();
        assert_eq!(spec.disks[0].source, DiskSource::New { sr_uuid: "sr-1".into(), size: 8 * GIB });
        assert_eq!(spec.boot_mode, BootMode::PyGrub);
        assert!(spec.validate().is_ok());
    }
}
