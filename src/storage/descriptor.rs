//! Backing-store descriptors and their device-config fingerprints

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapCredentials {
    pub user: String,
    pub password: String,
}

/// Where an SR's data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SrDescriptor {
    Nfs {
        server: String,
        path: String,
    },
    Iscsi {
        target: String,
        iqn: String,
        lun: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chap: Option<ChapCredentials>,
    },
    LocalLvm {
        device: String,
    },
    Iso {
        location: String,
    },
    File {
        path: String,
    },
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

impl SrDescriptor {
    /// Parse `nfs://server/path` or `iscsi://target/iqn/lun`.
    pub fn parse(url: &str) -> Result<Self> {
        if let Some(rest) = url.strip_prefix("nfs://") {
            let (server, path) = rest
                .split_once('/')
                .ok_or_else(|| Error::Precondition(format!("NFS url without a path: {}", url)))?;
            let descriptor = SrDescriptor::Nfs {
                server: server.to_string(),
                path: format!("/{}", path),
            };
            descriptor.validate()?;
            return Ok(descriptor);
        }
        if let Some(rest) = url.strip_prefix("iscsi://") {
            let parts: Vec<&str> = rest.split('/').collect();
            if parts.len() != 3 {
                return Err(Error::Precondition(format!(
                    "iSCSI url must be iscsi://target/iqn/lun: {}",
                    url
                )));
            }
            let lun = parts[2]
                .parse::<u32>()
                .map_err(|_| Error::Precondition(format!("invalid LUN in {}", url)))?;
            let descriptor = SrDescriptor::Iscsi {
                target: parts[0].to_string(),
                iqn: parts[1].to_string(),
                lun,
                chap: None,
            };
            descriptor.validate()?;
            return Ok(descriptor);
        }
        Err(Error::Precondition(format!("unsupported storage url: {}", url)))
    }

    /// SR type understood by the hypervisor.
    pub fn sr_type(&self) -> &'static str {
        match self {
            SrDescriptor::Nfs { .. } => "nfs",
            SrDescriptor::Iscsi { .. } => "lvmoiscsi",
            SrDescriptor::LocalLvm { .. } => "lvm",
            SrDescriptor::Iso { .. } => "iso",
            SrDescriptor::File { .. } => "file",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            SrDescriptor::Iso { .. } => "iso",
            _ => "user",
        }
    }

    pub fn device_config(&self) -> BTreeMap<String, String> {
        let mut dc = BTreeMap::new();
        match self {
            SrDescriptor::Nfs { server, path } => {
                dc.insert("server".into(), server.clone());
                dc.insert("serverpath".into(), path.clone());
            }
            SrDescriptor::Iscsi {
                target,
                iqn,
                lun,
                chap,
            } => {
                dc.insert("target".into(), target.clone());
                dc.insert("targetIQN".into(), iqn.clone());
                dc.insert("LUNid".into(), lun.to_string());
                if let Some(chap) = chap {
                    dc.insert("chapuser".into(), chap.user.clone());
                    dc.insert("chappassword".into(), chap.password.clone());
                }
            }
            SrDescriptor::LocalLvm { device } => {
                dc.insert("device".into(), device.clone());
            }
            SrDescriptor::Iso { location } | SrDescriptor::File { path: location } => {
                dc.insert("location".into(), location.clone());
            }
        }
        dc
    }

    /// Rebuild a descriptor from an existing PBD's device config.
    pub fn from_device_config(sr_type: &str, dc: &BTreeMap<String, String>) -> Option<Self> {
        let get = |key: &str| dc.get(key).cloned();
        match sr_type {
            "nfs" => Some(SrDescriptor::Nfs {
                server: get("server")?,
                path: get("serverpath")?,
            }),
            "lvmoiscsi" => Some(SrDescriptor::Iscsi {
                target: get("target")?,
                iqn: get("targetIQN")?,
                lun: get("LUNid")?.parse().ok()?,
                chap: match (get("chapuser"), get("chappassword")) {
                    (Some(user), Some(password)) => Some(ChapCredentials { user, password }),
                    _ => None,
                },
            }),
            "lvm" => Some(SrDescriptor::LocalLvm {
                device: get("device")?,
            }),
            "iso" => Some(SrDescriptor::Iso {
                location: get("location")?,
            }),
            "file" => Some(SrDescriptor::File {
                path: get("location")?,
            }),
            _ => None,
        }
    }

    /// Normalised backing-store identity. CHAP secrets are not part of it.
    pub fn fingerprint(&self) -> String {
        match self {
            SrDescriptor::Nfs { server, path } => {
                format!("nfs://{}{}", server.to_lowercase(), normalize_path(path))
            }
            SrDescriptor::Iscsi { target, iqn, lun, .. } => {
                format!("iscsi://{}/{}/{}", target.to_lowercase(), iqn, lun)
            }
            SrDescriptor::LocalLvm { device } => format!("lvm://{}", device),
            SrDescriptor::Iso { location } => format!("iso://{}", normalize_path(location)),
            SrDescriptor::File { path } => format!("file://{}", normalize_path(path)),
        }
    }

    pub fn matches_device_config(&self, sr_type: &str, dc: &BTreeMap<String, String>) -> bool {
        Self::from_device_config(sr_type, dc)
            .map(|other| other.fingerprint() == self.fingerprint())
            .unwrap_or(false)
    }

    pub fn validate(&self) -> Result<()> {
        let empty = |what: &str| Err(Error::Precondition(format!("{} cannot be empty", what)));
        match self {
            SrDescriptor::Nfs { server, path } => {
                if server.is_empty() {
                    return empty("NFS server");
                }
                if !path.starts_with('/') {
                    return Err(Error::Precondition(format!("NFS path must be absolute: {}", path)));
                }
            }
            SrDescriptor::Iscsi { target, iqn, chap, .. } => {
                if target.is_empty() {
                    return empty("iSCSI target");
                }
                if iqn.is_empty() {
                    return empty("iSCSI IQN");
                }
                if let Some(chap) = chap {
                    if chap.user.is_empty() {
                        return empty("CHAP user");
                    }
                }
            }
            SrDescriptor::LocalLvm { device } => {
                if device.is_empty() {
                    return empty("device");
                }
            }
            SrDescriptor::Iso { location } | SrDescriptor::File { path: location } => {
                if location.is_empty() {
                    return empty("location");
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for SrDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

/// Request to attach (or create) a storage pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePoolSpec {
    pub name_label: String,
    pub descriptor: SrDescriptor,
    #[serde(default)]
    pub shared: bool,
}

/// An ISO image URL split into the directory served as an ISO SR and the file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoLocation {
    pub location: String,
    pub file_name: String,
}

impl IsoLocation {
    /// Accepts `server:/dir/file.iso` and `nfs://server/dir/file.iso`.
    pub fn parse(url: &str) -> Result<Self> {
        let normalized = match url.strip_prefix("nfs://") {
            Some(rest) => match rest.split_once('/') {
                Some((server, path)) => format!("{}:/{}", server, path),
                None => return Err(Error::Precondition(format!("ISO url without a path: {}", url))),
            },
            None => url.to_string(),
        };
        let (location, file_name) = normalized
            .rsplit_once('/')
            .ok_or_else(|| Error::Precondition(format!("ISO url without a file name: {}", url)))?;
        if file_name.is_empty() || location.is_empty() {
            return Err(Error::Precondition(format!("malformed ISO url: {}", url)));
        }
        Ok(Self {
            location: location.to_string(),
            file_name: file_name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nfs_url_parse() {
        let d = SrDescriptor::parse("nfs://filer01/export/primary/").unwrap();
        assert_eq!(d.sr_type(), "nfs");
        let dc = d.device_config();
        assert_eq!(dc["server"], "filer01");
        assert_eq!(dc["serverpath"], "/export/primary/");
    }

    #[test]
    fn test_fingerprint_normalizes() {
        let a = SrDescriptor::Nfs {
            server: "Filer01".into(),
            path: "/export/primary/".into(),
        };
        let b = SrDescriptor::Nfs {
            server: "filer01".into(),
            path: "/export/primary".into(),
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_chap_does_not_change_fingerprint() {
        let plain = SrDescriptor::parse("iscsi://10.1.1.5/iqn.2010-01.com.example:vol1/3").unwrap();
        let with_chap = SrDescriptor::Iscsi {
            target: "10.1.1.5".into(),
            iqn: "iqn.2010-01.com.example:vol1".into(),
            lun: 3,
            chap: Some(ChapCredentials {
                user: "admin".into(),
                password: "pw".into(),
            }),
        };
        assert_eq!(plain.fingerprint(), with_chap.fingerprint());
        assert!(with_chap.device_config().contains_key("chapuser"));
    }

    #[test]
    fn test_device_config_roundtrip_matches() {
        let d = SrDescriptor::Iscsi {
            target: "10.1.1.5".into(),
            iqn: "iqn.x".into(),
            lun: 0,
            chap: None,
        };
        assert!(d.matches_device_config("lvmoiscsi", &d.device_config()));
        assert!(!d.matches_device_config("nfs", &d.device_config()));
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!(SrDescriptor::parse("nfs://filer01").is_err());
        assert!(SrDescriptor::parse("iscsi://t/iqn/notanumber").is_err());
        assert!(SrDescriptor::parse("smb://share/x").is_err());
        let relative = SrDescriptor::Nfs {
            server: "f".into(),
            path: "export".into(),
        };
        assert!(relative.validate().is_err());
    }

    #[test]
    fn test_descriptor_json_tag() {
        let spec: StoragePoolSpec = serde_json::from_str(
            r#"{"name_label": "primary", "descriptor": {"type": "nfs", "server": "f", "path": "/x"}}"#,
        )
        .unwrap();
        assert_eq!(spec.descriptor.sr_type(), "nfs");
        assert!(!spec.shared);
    }

    #[test]
    fn test_iso_location_parse() {
        let iso = IsoLocation::parse("nfs://filer01/isos/centos.iso").unwrap();
        assert_eq!(iso.location, "filer01:/isos");
        assert_eq!(iso.file_name, "centos.iso");

        let iso = IsoLocation::parse("filer01:/isos/tools.iso").unwrap();
        assert_eq!(iso.location, "filer01:/isos");
        assert!(IsoLocation::parse("filer01:/isos/").is_err());
    }
}
