//! Storage repository lifecycle
//!
//! - `descriptor`: backing-store descriptors and fingerprints
//! - `manager`: SR attach/teardown and VDI operations
//! - `backup`: snapshot chain walking and backup to secondary storage

pub mod backup;
pub mod descriptor;
pub mod manager;

pub use backup::{BackupOutcome, BackupRequest, DeltaClass};
pub use descriptor::{ChapCredentials, IsoLocation, SrDescriptor, StoragePoolSpec};
pub use manager::{SrInfo, StorageManager, StorageStats, VdiInfo};
