//! SR and VDI lifecycle

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::descriptor::{SrDescriptor, StoragePoolSpec};
use crate::config::{StorageSettings, TaskSettings};
use crate::error::SR_DEVICE_IN_USE;
use crate::locks::KeyedLocks;
use crate::mgmt::{AsyncCall, OpaqueRef, SrCreateSpec, SrRecord, VdiRecord, VdiSpec, VdiType};
use crate::session::Connection;
use crate::task::TaskExecutor;
use crate::{Error, Result};

/// Summary of an attached SR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrInfo {
    pub uuid: String,
    pub name_label: String,
    pub sr_type: String,
    pub shared: bool,
    pub physical_size: u64,
    pub physical_utilisation: u64,
    /// An existing SR was reused rather than created.
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiInfo {
    pub uuid: String,
    pub name_label: String,
    pub sr_uuid: String,
    pub virtual_size: u64,
    pub physical_utilisation: u64,
    pub is_a_snapshot: bool,
    pub parent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub sr_uuid: String,
    pub capacity: u64,
    pub used: u64,
    pub available: u64,
}

/// Discovers, creates, attaches and tears down SRs and their VDIs.
pub struct StorageManager {
    executor: TaskExecutor,
    locks: KeyedLocks,
    tasks: TaskSettings,
    settings: StorageSettings,
}

impl StorageManager {
    pub fn new(executor: TaskExecutor, tasks: TaskSettings, settings: StorageSettings) -> Self {
        Self {
            executor,
            locks: KeyedLocks::new(),
            tasks,
            settings,
        }
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn task_settings(&self) -> &TaskSettings {
        &self.tasks
    }

    /// Return an SR for `spec`, reusing any SR already bound to the same
    /// backing store, with a plugged PBD on `host` and a fresh VDI inventory.
    pub fn ensure_attached(&self, conn: &Connection, host: &OpaqueRef, spec: &StoragePoolSpec) -> Result<SrInfo> {
        spec.descriptor.validate()?;
        let fingerprint = spec.descriptor.fingerprint();
        let _guard = self.locks.lock(&fingerprint);

        let (sr, reused) = if let Some(sr) = self.find_by_name(conn, spec)? {
            (sr, true)
        } else if let Some(sr) = self.find_by_fingerprint(conn, &spec.descriptor)? {
            (sr, true)
        } else if let Some(sr) = self.probe_and_introduce(conn, host, spec)? {
            (sr, true)
        } else {
            (self.create(conn, host, spec)?, false)
        };

        self.ensure_pbd_plugged(conn, host, &sr, Some(spec.descriptor.device_config()))?;
        self.scan(conn, &sr)?;

        let record = conn.call("SR.get_record", |api, s| api.sr_get_record(s, &sr))?;
        tracing::info!(
            sr = %record.uuid,
            name = %record.name_label,
            store = %fingerprint,
            reused,
            "SR attached"
        );
        Ok(Self::sr_info(record, reused))
    }

    /// Check and repair the local PBD of an SR before using it.
    pub fn prepare_sr(&self, conn: &Connection, host: &OpaqueRef, sr_uuid: &str) -> Result<OpaqueRef> {
        let sr = self.resolve_sr(conn, sr_uuid)?;
        self.ensure_pbd_plugged(conn, host, &sr, None)?;
        Ok(sr)
    }

    pub fn sr_info_by_uuid(&self, conn: &Connection, sr_uuid: &str) -> Result<SrInfo> {
        let sr = self.resolve_sr(conn, sr_uuid)?;
        let record = conn.call("SR.get_record", |api, s| api.sr_get_record(s, &sr))?;
        Ok(Self::sr_info(record, true))
    }

    /// Detach and forget an SR. VDIs are forgotten, never destroyed.
    ///
    /// The sequence is retried for the configured number of passes; if PBDs
    /// remain afterwards the SR is left in place and an error is returned.
    pub fn remove_sr(&self, conn: &Connection, sr_uuid: &str) -> Result<()> {
        let Some(sr) = self.find_sr(conn, sr_uuid)? else {
            tracing::info!(sr = %sr_uuid, "SR already gone");
            return Ok(());
        };
        // Same key as attach, so a reuse and a teardown of one store never interleave.
        let record = conn.call("SR.get_record", |api, s| api.sr_get_record(s, &sr))?;
        let key = match self.sr_descriptor(conn, &record)? {
            Some(descriptor) => descriptor.fingerprint(),
            None => format!("sr:{}", sr_uuid),
        };
        let _guard = self.locks.lock(&key);
        let Some(sr) = self.find_sr(conn, sr_uuid)? else {
            tracing::info!(sr = %sr_uuid, "SR removed while waiting for its lock");
            return Ok(());
        };

        let passes = self.settings.teardown_passes.max(1);
        let mut last_error = String::new();
        for pass in 1..=passes {
            match self.teardown_pass(conn, &sr) {
                Ok(()) => {
                    tracing::info!(sr = %sr_uuid, pass, "SR forgotten");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(sr = %sr_uuid, pass, error = %e, "SR teardown pass failed");
                    last_error = e.to_string();
                }
            }
        }

        let remaining = match conn.call("SR.get_record", |api, s| api.sr_get_record(s, &sr)) {
            Ok(record) => Some(record.pbds.len()),
            Err(e) => {
                tracing::warn!(sr = %sr_uuid, error = %e, "Cannot read SR after failed teardown");
                None
            }
        };
        Err(Error::TeardownIncomplete {
            sr: sr_uuid.to_string(),
            remaining,
            passes,
            last_error,
        })
    }

    fn teardown_pass(&self, conn: &Connection, sr: &OpaqueRef) -> Result<()> {
        let record = conn.call("SR.get_record", |api, s| api.sr_get_record(s, sr))?;

        for vdi in &record.vdis {
            let vdi_record = conn.call("VDI.get_record", |api, s| api.vdi_get_record(s, vdi))?;
            for vbd in &vdi_record.vbds {
                let vbd_record = conn.call("VBD.get_record", |api, s| api.vbd_get_record(s, vbd))?;
                if vbd_record.currently_attached {
                    conn.call("VBD.unplug", |api, s| api.vbd_unplug(s, vbd))?;
                }
            }
            conn.call("VDI.forget", |api, s| api.vdi_forget(s, vdi))?;
        }

        for pbd in &record.pbds {
            let pbd_record = conn.call("PBD.get_record", |api, s| api.pbd_get_record(s, pbd))?;
            if pbd_record.currently_attached {
                conn.call("PBD.unplug", |api, s| api.pbd_unplug(s, pbd))?;
            }
            conn.call("PBD.destroy", |api, s| api.pbd_destroy(s, pbd))?;
        }

        let record = conn.call("SR.get_record", |api, s| api.sr_get_record(s, sr))?;
        if !record.pbds.is_empty() {
            return Err(Error::Precondition(format!(
                "SR {} still has {} PBD(s)",
                record.uuid,
                record.pbds.len()
            )));
        }
        conn.call("SR.forget", |api, s| api.sr_forget(s, sr))
    }

    fn find_sr(&self, conn: &Connection, sr_uuid: &str) -> Result<Option<OpaqueRef>> {
        match conn.call("SR.get_by_uuid", |api, s| api.sr_get_by_uuid(s, sr_uuid)) {
            Ok(sr) => Ok(Some(sr)),
            Err(e) if e.is_missing_object() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn resolve_sr(&self, conn: &Connection, sr_uuid: &str) -> Result<OpaqueRef> {
        conn.call("SR.get_by_uuid", |api, s| api.sr_get_by_uuid(s, sr_uuid))
            .map_err(|e| {
                if e.is_missing_object() {
                    Error::not_found("SR", sr_uuid)
                } else {
                    e
                }
            })
    }

    /// Fingerprint of an existing SR, read from any of its PBDs.
    fn sr_descriptor(&self, conn: &Connection, record: &SrRecord) -> Result<Option<SrDescriptor>> {
        for pbd in &record.pbds {
            let pbd_record = conn.call("PBD.get_record", |api, s| api.pbd_get_record(s, pbd))?;
            if let Some(d) = SrDescriptor::from_device_config(&record.sr_type, &pbd_record.device_config) {
                return Ok(Some(d));
            }
        }
        Ok(None)
    }

    fn find_by_name(&self, conn: &Connection, spec: &StoragePoolSpec) -> Result<Option<OpaqueRef>> {
        let candidates = conn.call("SR.get_by_name_label", |api, s| {
            api.sr_get_by_name_label(s, &spec.name_label)
        })?;
        let wanted = spec.descriptor.fingerprint();
        for sr in candidates {
            let record = conn.call("SR.get_record", |api, s| api.sr_get_record(s, &sr))?;
            if record.sr_type != spec.descriptor.sr_type() {
                return Err(Error::Conflict(format!(
                    "SR '{}' ({}) exists with type {}, requested {}",
                    spec.name_label,
                    record.uuid,
                    record.sr_type,
                    spec.descriptor.sr_type()
                )));
            }
            match self.sr_descriptor(conn, &record)? {
                Some(existing) if existing.fingerprint() != wanted => {
                    return Err(Error::Conflict(format!(
                        "SR '{}' ({}) is bound to {}, requested {}",
                        spec.name_label,
                        record.uuid,
                        existing.fingerprint(),
                        wanted
                    )));
                }
                _ => return Ok(Some(sr)),
            }
        }
        Ok(None)
    }

    fn find_by_fingerprint(&self, conn: &Connection, descriptor: &SrDescriptor) -> Result<Option<OpaqueRef>> {
        let wanted = descriptor.fingerprint();
        let all = conn.call("SR.get_all", |api, s| api.sr_get_all(s))?;
        for sr in all {
            let record = conn.call("SR.get_record", |api, s| api.sr_get_record(s, &sr))?;
            if record.sr_type != descriptor.sr_type() {
                continue;
            }
            if let Some(existing) = self.sr_descriptor(conn, &record)? {
                if existing.fingerprint() == wanted {
                    tracing::info!(sr = %record.uuid, store = %wanted, "Reusing SR with matching backing store");
                    return Ok(Some(sr));
                }
            }
        }
        Ok(None)
    }

    /// Look for an SR that exists on the backing store but is unknown to the pool.
    fn probe_and_introduce(
        &self,
        conn: &Connection,
        host: &OpaqueRef,
        spec: &StoragePoolSpec,
    ) -> Result<Option<OpaqueRef>> {
        let descriptor = &spec.descriptor;
        let found = conn.call("SR.probe", |api, s| {
            api.sr_probe(s, host, &descriptor.device_config(), descriptor.sr_type())
        })?;
        let Some(uuid) = found.into_iter().next() else {
            return Ok(None);
        };
        tracing::info!(sr = %uuid, store = %descriptor, "Introducing existing SR found by probe");
        let sr = conn.call("SR.introduce", |api, s| {
            api.sr_introduce(
                s,
                &uuid,
                &spec.name_label,
                descriptor.sr_type(),
                descriptor.content_type(),
                spec.shared,
            )
        })?;
        Ok(Some(sr))
    }

    fn create(&self, conn: &Connection, host: &OpaqueRef, spec: &StoragePoolSpec) -> Result<OpaqueRef> {
        let create = SrCreateSpec {
            host: host.clone(),
            device_config: spec.descriptor.device_config(),
            physical_size: 0,
            name_label: spec.name_label.clone(),
            sr_type: spec.descriptor.sr_type().to_string(),
            content_type: spec.descriptor.content_type().to_string(),
            shared: spec.shared,
        };
        conn.call("SR.create", |api, s| api.sr_create(s, &create))
            .map_err(|e| {
                if e.code() == Some(SR_DEVICE_IN_USE) {
                    Error::Conflict(format!(
                        "backing store {} is already claimed by another SR",
                        spec.descriptor
                    ))
                } else {
                    e
                }
            })
    }

    /// Make sure `sr` has an attached PBD on `host`, creating one if needed.
    fn ensure_pbd_plugged(
        &self,
        conn: &Connection,
        host: &OpaqueRef,
        sr: &OpaqueRef,
        device_config: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        let record = conn.call("SR.get_record", |api, s| api.sr_get_record(s, sr))?;
        let mut fallback_config = None;
        for pbd in &record.pbds {
            let pbd_record = conn.call("PBD.get_record", |api, s| api.pbd_get_record(s, pbd))?;
            if &pbd_record.host == host {
                if !pbd_record.currently_attached {
                    tracing::info!(sr = %record.uuid, pbd = %pbd_record.uuid, "Plugging detached PBD");
                    conn.call("PBD.plug", |api, s| api.pbd_plug(s, pbd))?;
                }
                return Ok(());
            }
            fallback_config.get_or_insert(pbd_record.device_config);
        }

        let config = device_config.or(fallback_config).ok_or_else(|| {
            Error::Precondition(format!(
                "SR {} has no PBD to copy a device config from",
                record.uuid
            ))
        })?;
        tracing::info!(sr = %record.uuid, "Creating PBD for local host");
        let pbd = conn.call("PBD.create", |api, s| api.pbd_create(s, host, sr, &config))?;
        conn.call("PBD.plug", |api, s| api.pbd_plug(s, &pbd))
    }

    fn scan(&self, conn: &Connection, sr: &OpaqueRef) -> Result<()> {
        self.executor
            .run(conn, &AsyncCall::SrScan { sr: sr.clone() }, self.tasks.scan_timeout())
            .map(|_| ())
    }

    fn sr_info(record: SrRecord, reused: bool) -> SrInfo {
        SrInfo {
            uuid: record.uuid,
            name_label: record.name_label,
            sr_type: record.sr_type,
            shared: record.shared,
            physical_size: record.physical_size,
            physical_utilisation: record.physical_utilisation,
            reused,
        }
    }

    fn vdi_info(&self, conn: &Connection, record: VdiRecord) -> Result<VdiInfo> {
        let sr = conn.call("SR.get_record", |api, s| api.sr_get_record(s, &record.sr))?;
        let parent = record.vhd_parent().map(str::to_string);
        Ok(VdiInfo {
            uuid: record.uuid,
            name_label: record.name_label,
            sr_uuid: sr.uuid,
            virtual_size: record.virtual_size,
            physical_utilisation: record.physical_utilisation,
            is_a_snapshot: record.is_a_snapshot,
            parent,
        })
    }

    pub fn resolve_vdi(&self, conn: &Connection, vdi_uuid: &str) -> Result<OpaqueRef> {
        conn.call("VDI.get_by_uuid", |api, s| api.vdi_get_by_uuid(s, vdi_uuid))
            .map_err(|e| {
                if e.is_missing_object() {
                    Error::not_found("VDI", vdi_uuid)
                } else {
                    e
                }
            })
    }

    pub fn create_vdi(
        &self,
        conn: &Connection,
        host: &OpaqueRef,
        sr_uuid: &str,
        name_label: &str,
        virtual_size: u64,
    ) -> Result<VdiInfo> {
        if virtual_size == 0 {
            return Err(Error::Precondition("volume size must be positive".into()));
        }
        let sr = self.prepare_sr(conn, host, sr_uuid)?;
        let spec = VdiSpec {
            name_label: name_label.to_string(),
            sr,
            virtual_size,
            vdi_type: VdiType::User,
            read_only: false,
            sharable: false,
        };
        let vdi = conn.call("VDI.create", |api, s| api.vdi_create(s, &spec))?;
        let record = conn.call("VDI.get_record", |api, s| api.vdi_get_record(s, &vdi))?;
        tracing::info!(vdi = %record.uuid, sr = %sr_uuid, size = virtual_size, "VDI created");
        self.vdi_info(conn, record)
    }

    pub fn get_vdi(&self, conn: &Connection, vdi_uuid: &str) -> Result<VdiInfo> {
        let vdi = self.resolve_vdi(conn, vdi_uuid)?;
        let record = conn.call("VDI.get_record", |api, s| api.vdi_get_record(s, &vdi))?;
        self.vdi_info(conn, record)
    }

    /// Destroy a VDI. Missing VDIs count as deleted; attached ones are refused.
    pub fn delete_vdi(&self, conn: &Connection, vdi_uuid: &str) -> Result<()> {
        let vdi = match self.resolve_vdi(conn, vdi_uuid) {
            Ok(vdi) => vdi,
            Err(Error::NotFound { .. }) => {
                tracing::info!(vdi = %vdi_uuid, "VDI already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let record = conn.call("VDI.get_record", |api, s| api.vdi_get_record(s, &vdi))?;
        for vbd in &record.vbds {
            let vbd_record = conn.call("VBD.get_record", |api, s| api.vbd_get_record(s, vbd))?;
            if vbd_record.currently_attached {
                return Err(Error::Precondition(format!(
                    "VDI {} is attached at device {}",
                    vdi_uuid, vbd_record.userdevice
                )));
            }
        }
        conn.call("VDI.destroy", |api, s| api.vdi_destroy(s, &vdi))?;
        tracing::info!(vdi = %vdi_uuid, "VDI destroyed");
        Ok(())
    }

    /// Grow a VDI. Shrinking is rejected before any remote call.
    pub fn resize_vdi(&self, conn: &Connection, vdi_uuid: &str, new_size: u64) -> Result<VdiInfo> {
        let vdi = self.resolve_vdi(conn, vdi_uuid)?;
        let record = conn.call("VDI.get_record", |api, s| api.vdi_get_record(s, &vdi))?;
        if new_size < record.virtual_size {
            return Err(Error::Precondition(format!(
                "cannot shrink VDI {} from {} to {} bytes",
                vdi_uuid, record.virtual_size, new_size
            )));
        }
        if new_size > record.virtual_size {
            conn.call("VDI.resize", |api, s| api.vdi_resize(s, &vdi, new_size))?;
        }
        self.get_vdi(conn, vdi_uuid)
    }

    /// Copy a VDI into another SR through an async task.
    pub fn copy_vdi(&self, conn: &Connection, host: &OpaqueRef, vdi_uuid: &str, dest_sr_uuid: &str) -> Result<VdiInfo> {
        let vdi = self.resolve_vdi(conn, vdi_uuid)?;
        let sr = self.prepare_sr(conn, host, dest_sr_uuid)?;
        let result = self.executor.run(
            conn,
            &AsyncCall::VdiCopy { vdi, sr },
            self.tasks.copy_timeout(),
        )?;
        let copy = OpaqueRef::new(result);
        let record = conn.call("VDI.get_record", |api, s| api.vdi_get_record(s, &copy))?;
        tracing::info!(source = %vdi_uuid, copy = %record.uuid, sr = %dest_sr_uuid, "VDI copied");
        self.vdi_info(conn, record)
    }

    pub fn snapshot_vdi(&self, conn: &Connection, vdi_uuid: &str) -> Result<VdiInfo> {
        let vdi = self.resolve_vdi(conn, vdi_uuid)?;
        let snapshot = conn.call("VDI.snapshot", |api, s| api.vdi_snapshot(s, &vdi))?;
        let record = conn.call("VDI.get_record", |api, s| api.vdi_get_record(s, &snapshot))?;
        tracing::info!(vdi = %vdi_uuid, snapshot = %record.uuid, "VDI snapshot taken");
        self.vdi_info(conn, record)
    }

    pub fn storage_stats(&self, conn: &Connection, sr_uuid: &str) -> Result<StorageStats> {
        let sr = self.resolve_sr(conn, sr_uuid)?;
        let record = conn.call("SR.get_record", |api, s| api.sr_get_record(s, &sr))?;
        Ok(StorageStats {
            sr_uuid: record.uuid,
            capacity: record.physical_size,
            used: record.physical_utilisation,
            available: record.physical_size.saturating_sub(record.physical_utilisation),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mgmt::sim::VdiSeed;
    use crate::mgmt::VmPowerState;
    use crate::testing::Fixture;
    use std::sync::Arc;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn manager(fx: &Fixture) -> StorageManager {
        StorageManager::new(fx.executor(), TaskSettings::default(), StorageSettings::default())
    }

    fn nfs_spec(name: &str) -> StoragePoolSpec {
        StoragePoolSpec {
            name_label: name.into(),
            descriptor: SrDescriptor::parse("nfs://filer01/export/primary").unwrap(),
            shared: true,
        }
    }

    #[test]
    fn test_ensure_attached_is_idempotent() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let conn = fx.conn();
        let host = fx.host_ref();

        let first = storage.ensure_attached(&conn, &host, &nfs_spec("primary")).unwrap();
        assert!(!first.reused);
        let second = storage.ensure_attached(&conn, &host, &nfs_spec("primary")).unwrap();
        assert!(second.reused);
        assert_eq!(first.uuid, second.uuid);

        // A different label on the same store resolves to the same SR.
        let third = storage.ensure_attached(&conn, &host, &nfs_spec("primary-alias")).unwrap();
        assert_eq!(third.uuid, first.uuid);
        assert_eq!(fx.sim.sr_count_by_type("nfs"), 1);
    }

    #[test]
    fn test_same_name_different_store_conflicts() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let conn = fx.conn();
        let host = fx.host_ref();
        storage.ensure_attached(&conn, &host, &nfs_spec("primary")).unwrap();

        let other = StoragePoolSpec {
            name_label: "primary".into(),
            descriptor: SrDescriptor::parse("nfs://filer02/export/other").unwrap(),
            shared: true,
        };
        let err = storage.ensure_attached(&conn, &host, &other).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(fx.sim.sr_count_by_type("nfs"), 1);
    }

    #[test]
    fn test_concurrent_attach_creates_one_sr() {
        let fx = Arc::new(Fixture::new());
        let storage = Arc::new(manager(&fx));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let fx = fx.clone();
                let storage = storage.clone();
                std::thread::spawn(move || {
                    let conn = fx.conn();
                    let host = fx.host_ref();
                    storage.ensure_attached(&conn, &host, &nfs_spec("primary")).map(|i| i.uuid)
                })
            })
            .collect();
        let uuids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();
        assert!(uuids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(fx.sim.sr_count_by_type("nfs"), 1);
    }

    #[test]
    fn test_forgotten_sr_is_reintroduced() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let conn = fx.conn();
        let host = fx.host_ref();
        let info = storage.ensure_attached(&conn, &host, &nfs_spec("primary")).unwrap();
        storage.remove_sr(&conn, &info.uuid).unwrap();
        assert_eq!(fx.sim.sr_count_by_type("nfs"), 0);

        let again = storage.ensure_attached(&conn, &host, &nfs_spec("primary")).unwrap();
        assert_eq!(again.uuid, info.uuid);
        assert!(again.reused);
        assert_eq!(fx.sim.call_count("SR.introduce"), 1);
        assert!(fx.sim.pbds_of_sr(&info.uuid).iter().any(|p| p.currently_attached));
    }

    #[test]
    fn test_prepare_sr_replugs_pbd() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        fx.sim.unplug_all_pbds(&fx.local_sr);
        storage.prepare_sr(&fx.conn(), &fx.host_ref(), &fx.local_sr).unwrap();
        assert!(fx.sim.pbds_of_sr(&fx.local_sr).iter().all(|p| p.currently_attached));
    }

    #[test]
    fn test_prepare_sr_creates_missing_local_pbd() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let conn = fx.conn();
        let other = crate::session::HostIdentity::new("host-2", "10.0.0.2")
            .resolve(&conn)
            .unwrap();
        storage.prepare_sr(&conn, &other, &fx.local_sr).unwrap();
        let pbds = fx.sim.pbds_of_sr(&fx.local_sr);
        assert_eq!(pbds.len(), 2);
        assert!(pbds.iter().all(|p| p.currently_attached));
    }

    #[test]
    fn test_vdi_roundtrip_keeps_size() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let conn = fx.conn();
        let created = storage
            .create_vdi(&conn, &fx.host_ref(), &fx.local_sr, "data", 8 * GIB)
            .unwrap();
        let fetched = storage.get_vdi(&conn, &created.uuid).unwrap();
        assert_eq!(fetched.virtual_size, 8 * GIB);
        assert_eq!(fetched.sr_uuid, fx.local_sr);
    }

    #[test]
    fn test_delete_vdi_is_idempotent() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let conn = fx.conn();
        let created = storage
            .create_vdi(&conn, &fx.host_ref(), &fx.local_sr, "data", GIB)
            .unwrap();
        storage.delete_vdi(&conn, &created.uuid).unwrap();
        storage.delete_vdi(&conn, &created.uuid).unwrap();
        assert_eq!(fx.sim.call_count("VDI.destroy"), 1);
    }

    #[test]
    fn test_delete_attached_vdi_refused() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let conn = fx.conn();
        let created = storage
            .create_vdi(&conn, &fx.host_ref(), &fx.local_sr, "data", GIB)
            .unwrap();
        let vm = fx.sim.add_vm("busy", VmPowerState::Running, Some("host-1"));
        fx.sim.attach_disk(&vm, &created.uuid, 1, true);
        let err = storage.delete_vdi(&conn, &created.uuid).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(fx.sim.call_count("VDI.destroy"), 0);
    }

    #[test]
    fn test_shrink_rejected_before_remote_call() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let conn = fx.conn();
        let created = storage
            .create_vdi(&conn, &fx.host_ref(), &fx.local_sr, "data", 4 * GIB)
            .unwrap();
        assert!(storage.resize_vdi(&conn, &created.uuid, 2 * GIB).is_err());
        assert_eq!(fx.sim.call_count("VDI.resize"), 0);
        let grown = storage.resize_vdi(&conn, &created.uuid, 6 * GIB).unwrap();
        assert_eq!(grown.virtual_size, 6 * GIB);
    }

    #[test]
    fn test_copy_vdi_runs_task() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let conn = fx.conn();
        let host = fx.host_ref();
        let source = fx.sim.add_vdi(
            &fx.local_sr,
            VdiSeed {
                name: "template-disk".into(),
                virtual_size: 4 * GIB,
                physical_utilisation: GIB,
                managed: true,
                ..Default::default()
            },
        );
        let target = storage.ensure_attached(&conn, &host, &nfs_spec("primary")).unwrap();
        let copy = storage.copy_vdi(&conn, &host, &source, &target.uuid).unwrap();
        assert_eq!(copy.sr_uuid, target.uuid);
        assert_eq!(copy.virtual_size, 4 * GIB);
        assert_eq!(fx.sim.call_count("Async.VDI.copy"), 1);
    }

    #[test]
    fn test_teardown_unplugs_attached_vbd_first() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let conn = fx.conn();
        let host = fx.host_ref();
        let info = storage.ensure_attached(&conn, &host, &nfs_spec("primary")).unwrap();
        let vdi = storage.create_vdi(&conn, &host, &info.uuid, "vol", GIB).unwrap();
        let vm = fx.sim.add_vm("user-vm", VmPowerState::Running, Some("host-1"));
        fx.sim.attach_disk(&vm, &vdi.uuid, 1, true);

        storage.remove_sr(&conn, &info.uuid).unwrap();
        let calls = fx.sim.calls();
        let unplug = calls.iter().position(|c| c == "VBD.unplug").unwrap();
        let forget = calls.iter().position(|c| c == "VDI.forget").unwrap();
        assert!(unplug < forget);
        assert_eq!(fx.sim.call_count("VDI.destroy"), 0);
        assert!(fx.sim.sr_by_uuid(&info.uuid).is_none());
    }

    #[test]
    fn test_teardown_fails_loudly_when_unplug_keeps_failing() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let conn = fx.conn();
        let host = fx.host_ref();
        let info = storage.ensure_attached(&conn, &host, &nfs_spec("primary")).unwrap();
        let vdi = storage.create_vdi(&conn, &host, &info.uuid, "vol", GIB).unwrap();
        let vm = fx.sim.add_vm("user-vm", VmPowerState::Running, Some("host-1"));
        fx.sim.attach_disk(&vm, &vdi.uuid, 1, true);
        fx.sim.inject_fault("VBD.unplug", "DEVICE_DETACH_REJECTED", 2);

        let err = storage.remove_sr(&conn, &info.uuid).unwrap_err();
        match err {
            Error::TeardownIncomplete { passes, remaining, .. } => {
                assert_eq!(passes, 2);
                assert!(remaining.unwrap_or(0) > 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(fx.sim.sr_by_uuid(&info.uuid).is_some());
        assert_eq!(fx.sim.call_count("SR.forget"), 0);
    }

    #[test]
    fn test_teardown_waits_for_attach_of_same_store() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let conn = fx.conn();
        let spec = nfs_spec("primary");
        let info = storage.ensure_attached(&conn, &fx.host_ref(), &spec).unwrap();

        let attach = storage.locks.lock(&spec.descriptor.fingerprint());
        std::thread::scope(|s| {
            let teardown = s.spawn(|| storage.remove_sr(&conn, &info.uuid));
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(fx.sim.sr_by_uuid(&info.uuid).is_some());
            assert_eq!(fx.sim.call_count("SR.forget"), 0);
            drop(attach);
            teardown.join().unwrap().unwrap();
        });
        assert!(fx.sim.sr_by_uuid(&info.uuid).is_none());
    }

    #[test]
    fn test_teardown_reports_unknown_count_when_sr_unreadable() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let conn = fx.conn();
        let host = fx.host_ref();
        let info = storage.ensure_attached(&conn, &host, &nfs_spec("primary")).unwrap();
        let vdi = storage.create_vdi(&conn, &host, &info.uuid, "vol", GIB).unwrap();
        let vm = fx.sim.add_vm("user-vm", VmPowerState::Running, Some("host-1"));
        fx.sim.attach_disk(&vm, &vdi.uuid, 1, true);
        fx.sim.inject_fault("VBD.unplug", "DEVICE_DETACH_REJECTED", 2);
        // One read to pick the lock key, one per failed pass, then the final count.
        fx.sim.inject_fault_after("SR.get_record", "HOST_OFFLINE", 3, 1);

        let err = storage.remove_sr(&conn, &info.uuid).unwrap_err();
        assert!(err.to_string().contains("an unknown number of PBD(s)"));
        match err {
            Error::TeardownIncomplete { remaining, passes, .. } => {
                assert_eq!(remaining, None);
                assert_eq!(passes, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_remove_missing_sr_is_ok() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        storage.remove_sr(&fx.conn(), "no-such-sr").unwrap();
    }

    #[test]
    fn test_storage_stats() {
        let fx = Fixture::new();
        let storage = manager(&fx);
        let stats = storage.storage_stats(&fx.conn(), &fx.local_sr).unwrap();
        assert_eq!(stats.capacity, stats.used + stats.available);
    }
}
