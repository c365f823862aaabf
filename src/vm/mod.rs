//! Guest VM lifecycle
//!
//! - `spec`: what to build when starting a VM
//! - `memory`: memory bound invariants
//! - `state`: reported power state and in-flight transitions
//! - `compensation`: rollback of partially provisioned VMs
//! - `manager`: the operations themselves

pub mod compensation;
pub mod manager;
pub mod memory;
pub mod spec;
pub mod state;

pub use compensation::{Compensation, Undo};
pub use manager::{iso_sr_name, SnapshotInfo, VmInfo, VmManager};
pub use memory::{MemoryLimits, MIN_GUEST_MEMORY};
pub use spec::{BootMode, DiskKind, DiskSource, DiskSpec, NicSpec, VmSpec, VmSpecBuilder, CD_DEVICE, MAX_DISK_DEVICE};
pub use state::{PowerState, TransitionGuard, VmPhase, VmStateTracker};
