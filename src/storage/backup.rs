//! Snapshot backup to secondary storage
//!
//! Snapshots form a VHD parent chain through the `vhd-parent` key. A backup
//! only has to move nodes that earlier backups have not already covered, and
//! a snapshot that adds nothing over the previous one is discarded outright.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::descriptor::{SrDescriptor, StoragePoolSpec};
use super::manager::StorageManager;
use crate::mgmt::{OpaqueRef, VdiRecord};
use crate::session::Connection;
use crate::{Error, Result};

/// Longest parent chain followed before giving up.
pub const MAX_CHAIN_DEPTH: usize = 64;

/// Walk the parent chain starting at `vdi_uuid` (inclusive), child first.
pub fn parent_chain(conn: &Connection, vdi_uuid: &str) -> Result<Vec<VdiRecord>> {
    let mut chain = Vec::new();
    let mut next = Some(vdi_uuid.to_string());
    while let Some(uuid) = next {
        if chain.len() >= MAX_CHAIN_DEPTH {
            return Err(Error::Precondition(format!(
                "VHD chain of {} exceeds {} nodes",
                vdi_uuid, MAX_CHAIN_DEPTH
            )));
        }
        let vdi = match conn.call("VDI.get_by_uuid", |api, s| api.vdi_get_by_uuid(s, &uuid)) {
            Ok(vdi) => vdi,
            // Coalesced parents vanish; the chain ends there.
            Err(e) if e.is_missing_object() && !chain.is_empty() => break,
            Err(e) if e.is_missing_object() => return Err(Error::not_found("VDI", uuid)),
            Err(e) => return Err(e),
        };
        let record = conn.call("VDI.get_record", |api, s| api.vdi_get_record(s, &vdi))?;
        next = record.vhd_parent().map(str::to_string);
        chain.push(record);
    }
    Ok(chain)
}

/// Bytes that still need transferring: physical utilisation of every chain
/// node not already backed up.
pub fn incremental_size(chain: &[VdiRecord], backed_up: &HashSet<String>) -> u64 {
    chain
        .iter()
        .filter(|node| !backed_up.contains(&node.uuid))
        .map(|node| node.physical_utilisation)
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaClass {
    /// Nothing changed since the previous snapshot.
    Empty,
    Incremental,
    Full,
}

fn grandparent(chain: &[VdiRecord]) -> Option<&str> {
    chain.get(2).map(|node| node.uuid.as_str())
}

/// Classify the current snapshot against the previous one.
///
/// Two snapshots that hang off the same grandparent node carry no delta.
pub fn classify_delta(previous: Option<&[VdiRecord]>, current: &[VdiRecord]) -> DeltaClass {
    let Some(previous) = previous else {
        return DeltaClass::Full;
    };
    match (grandparent(previous), grandparent(current)) {
        (Some(a), Some(b)) if a == b => DeltaClass::Empty,
        _ => DeltaClass::Incremental,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub snapshot_uuid: String,
    #[serde(default)]
    pub prev_snapshot_uuid: Option<String>,
    #[serde(default)]
    pub prev_backup_uuid: Option<String>,
    pub secondary: SrDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOutcome {
    pub backup_uuid: String,
    /// Bytes that were not covered by earlier backups.
    pub physical_size: u64,
    pub delta: DeltaClass,
}

impl StorageManager {
    /// Back up a snapshot to secondary storage, or reuse the previous backup
    /// when the snapshot carries no delta.
    pub fn backup_snapshot(&self, conn: &Connection, host: &OpaqueRef, request: &BackupRequest) -> Result<BackupOutcome> {
        let current = parent_chain(conn, &request.snapshot_uuid)?;
        let previous = match &request.prev_snapshot_uuid {
            Some(prev) => Some(parent_chain(conn, prev)?),
            None => None,
        };

        let mut delta = classify_delta(previous.as_deref(), &current);
        if delta == DeltaClass::Empty {
            match &request.prev_backup_uuid {
                Some(prev_backup) => {
                    tracing::info!(
                        snapshot = %request.snapshot_uuid,
                        reused = %prev_backup,
                        "Empty delta, discarding snapshot"
                    );
                    self.delete_vdi(conn, &request.snapshot_uuid)?;
                    return Ok(BackupOutcome {
                        backup_uuid: prev_backup.clone(),
                        physical_size: 0,
                        delta,
                    });
                }
                None => {
                    tracing::warn!(
                        snapshot = %request.snapshot_uuid,
                        "Empty delta but no previous backup to reuse, taking a full backup"
                    );
                    delta = DeltaClass::Full;
                }
            }
        }

        // A full backup cannot lean on nodes the previous snapshot covered.
        let backed_up: HashSet<String> = match delta {
            DeltaClass::Full => HashSet::new(),
            _ => previous
                .iter()
                .flatten()
                .map(|node| node.uuid.clone())
                .collect(),
        };
        let physical_size = incremental_size(&current, &backed_up);

        let secondary = self.ensure_attached(
            conn,
            host,
            &StoragePoolSpec {
                name_label: request.secondary.fingerprint(),
                descriptor: request.secondary.clone(),
                shared: false,
            },
        )?;
        let copy = self.copy_vdi(conn, host, &request.snapshot_uuid, &secondary.uuid)?;
        tracing::info!(
            snapshot = %request.snapshot_uuid,
            backup = %copy.uuid,
            bytes = physical_size,
            ?delta,
            "Snapshot backed up"
        );
        Ok(BackupOutcome {
            backup_uuid: copy.uuid,
            physical_size,
            delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageSettings, TaskSettings};
    use crate::mgmt::sim::VdiSeed;
    use crate::testing::Fixture;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn seed(fx: &Fixture, name: &str, physical: u64, parent: Option<&str>) -> String {
        fx.sim.add_vdi(
            &fx.local_sr,
            VdiSeed {
                name: name.into(),
                virtual_size: 8 * GIB,
                physical_utilisation: physical,
                parent: parent.map(str::to_string),
                is_a_snapshot: name.starts_with("snap"),
                managed: true,
            },
        )
    }

    fn secondary() -> SrDescriptor {
        SrDescriptor::parse("nfs://secondary/export/backup").unwrap()
    }

    #[test]
    fn test_parent_chain_walks_to_base() {
        let fx = Fixture::new();
        let base = seed(&fx, "base", 4 * GIB, None);
        let mid = seed(&fx, "mid", GIB, Some(&base));
        let snap = seed(&fx, "snap", 0, Some(&mid));
        let chain = parent_chain(&fx.conn(), &snap).unwrap();
        let uuids: Vec<_> = chain.iter().map(|n| n.uuid.clone()).collect();
        assert_eq!(uuids, vec![snap, mid, base]);
    }

    #[test]
    fn test_incremental_size_skips_backed_up_nodes() {
        let fx = Fixture::new();
        let base = seed(&fx, "base", 4 * GIB, None);
        let mid = seed(&fx, "mid", GIB, Some(&base));
        let snap = seed(&fx, "snap", 0, Some(&mid));
        let chain = parent_chain(&fx.conn(), &snap).unwrap();

        let backed: HashSet<String> = [base].into_iter().collect();
        assert_eq!(incremental_size(&chain, &backed), GIB);
        assert_eq!(incremental_size(&chain, &HashSet::new()), 5 * GIB);
    }

    #[test]
    fn test_shared_grandparent_is_empty_delta() {
        let fx = Fixture::new();
        let grand = seed(&fx, "base", 4 * GIB, None);
        let p1 = seed(&fx, "p1", 0, Some(&grand));
        let p2 = seed(&fx, "p2", 0, Some(&grand));
        let prev = seed(&fx, "snap-1", 0, Some(&p1));
        let current = seed(&fx, "snap-2", 0, Some(&p2));
        let conn = fx.conn();
        let prev_chain = parent_chain(&conn, &prev).unwrap();
        let cur_chain = parent_chain(&conn, &current).unwrap();
        assert_eq!(classify_delta(Some(&prev_chain), &cur_chain), DeltaClass::Empty);
        assert_eq!(classify_delta(None, &cur_chain), DeltaClass::Full);
    }

    #[test]
    fn test_empty_delta_discards_new_snapshot() {
        let fx = Fixture::new();
        let storage = StorageManager::new(fx.executor(), TaskSettings::default(), StorageSettings::default());
        let grand = seed(&fx, "base", 4 * GIB, None);
        let p1 = seed(&fx, "p1", 0, Some(&grand));
        let p2 = seed(&fx, "p2", 0, Some(&grand));
        let prev = seed(&fx, "snap-1", 0, Some(&p1));
        let current = seed(&fx, "snap-2", 0, Some(&p2));

        let outcome = storage
            .backup_snapshot(
                &fx.conn(),
                &fx.host_ref(),
                &BackupRequest {
                    snapshot_uuid: current.clone(),
                    prev_snapshot_uuid: Some(prev),
                    prev_backup_uuid: Some("backup-1".into()),
                    secondary: secondary(),
                },
            )
            .unwrap();
        assert_eq!(outcome.backup_uuid, "backup-1");
        assert_eq!(outcome.delta, DeltaClass::Empty);
        assert!(fx.sim.vdi_by_uuid(&current).is_none());
        assert_eq!(fx.sim.call_count("Async.VDI.copy"), 0);
    }

    #[test]
    fn test_empty_delta_without_previous_backup_is_full() {
        let fx = Fixture::new();
        let storage = StorageManager::new(fx.executor(), TaskSettings::default(), StorageSettings::default());
        let grand = seed(&fx, "base", 4 * GIB, None);
        let p1 = seed(&fx, "p1", 0, Some(&grand));
        let p2 = seed(&fx, "p2", 0, Some(&grand));
        let prev = seed(&fx, "snap-1", 0, Some(&p1));
        let current = seed(&fx, "snap-2", 0, Some(&p2));

        let outcome = storage
            .backup_snapshot(
                &fx.conn(),
                &fx.host_ref(),
                &BackupRequest {
                    snapshot_uuid: current.clone(),
                    prev_snapshot_uuid: Some(prev),
                    prev_backup_uuid: None,
                    secondary: secondary(),
                },
            )
            .unwrap();
        assert_eq!(outcome.delta, DeltaClass::Full);
        assert_eq!(outcome.physical_size, 4 * GIB);
        assert!(fx.sim.vdi_by_uuid(&current).is_some());
        assert_eq!(fx.sim.call_count("Async.VDI.copy"), 1);
    }

    #[test]
    fn test_incremental_backup_copies_to_secondary() {
        let fx = Fixture::new();
        let storage = StorageManager::new(fx.executor(), TaskSettings::default(), StorageSettings::default());
        let grand = seed(&fx, "base", 4 * GIB, None);
        let p1 = seed(&fx, "p1", GIB, Some(&grand));
        let prev = seed(&fx, "snap-1", 0, Some(&p1));
        let p2 = seed(&fx, "p2", 2 * GIB, Some(&p1));
        let current = seed(&fx, "snap-2", 0, Some(&p2));

        let outcome = storage
            .backup_snapshot(
                &fx.conn(),
                &fx.host_ref(),
                &BackupRequest {
                    snapshot_uuid: current,
                    prev_snapshot_uuid: Some(prev),
                    prev_backup_uuid: Some("backup-1".into()),
                    secondary: secondary(),
                },
            )
            .unwrap();
        assert_eq!(outcome.delta, DeltaClass::Incremental);
        assert_eq!(outcome.physical_size, 2 * GIB);
        assert_ne!(outcome.backup_uuid, "backup-1");
        assert_eq!(fx.sim.sr_count_by_type("nfs"), 1);
    }
}
