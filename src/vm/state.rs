//! Power states and in-flight VM transitions

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::mgmt::VmPowerState;
use crate::{Error, Result};

/// Power state as reported to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    PowerOn,
    PowerOff,
    PowerUnknown,
}

impl From<VmPowerState> for PowerState {
    fn from(state: VmPowerState) -> Self {
        match state {
            VmPowerState::Running => PowerState::PowerOn,
            VmPowerState::Halted | VmPowerState::Paused | VmPowerState::Suspended => PowerState::PowerOff,
            VmPowerState::Unrecognized => PowerState::PowerUnknown,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::PowerOn => write!(f, "PowerOn"),
            PowerState::PowerOff => write!(f, "PowerOff"),
            PowerState::PowerUnknown => write!(f, "PowerUnknown"),
        }
    }
}

/// A transition currently being driven by this agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmPhase {
    Starting,
    Stopping,
    Migrating,
    Snapshotting,
    Reverting,
}

impl fmt::Display for VmPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmPhase::Starting => write!(f, "Starting"),
            VmPhase::Stopping => write!(f, "Stopping"),
            VmPhase::Migrating => write!(f, "Migrating"),
            VmPhase::Snapshotting => write!(f, "Snapshotting"),
            VmPhase::Reverting => write!(f, "Reverting"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    phase: VmPhase,
    stable: PowerState,
}

/// Per-VM record of in-flight transitions.
///
/// At most one transition runs per VM name. While one is tracked, callers see
/// the power state captured when it began.
#[derive(Debug, Default)]
pub struct VmStateTracker {
    inflight: Mutex<HashMap<String, Transition>>,
}

impl VmStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, vm: &str, phase: VmPhase, stable: PowerState) -> Result<TransitionGuard<'_>> {
        let mut inflight = self.inflight.lock();
        if let Some(current) = inflight.get(vm) {
            return Err(Error::InvalidState {
                object: vm.to_string(),
                current: current.phase.to_string(),
                expected: format!("no transition in flight before {}", phase),
            });
        }
        inflight.insert(vm.to_string(), Transition { phase, stable });
        tracing::debug!(vm = %vm, phase = %phase, "Transition started");
        Ok(TransitionGuard {
            tracker: self,
            vm: vm.to_string(),
        })
    }

    pub fn phase(&self, vm: &str) -> Option<VmPhase> {
        self.inflight.lock().get(vm).map(|t| t.phase)
    }

    /// The state to report for `vm` given its live state.
    pub fn reported(&self, vm: &str, live: PowerState) -> PowerState {
        self.inflight
            .lock()
            .get(vm)
            .map(|t| t.stable)
            .unwrap_or(live)
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }
}

/// Clears the VM's transition when dropped.
pub struct TransitionGuard<'a> {
    tracker: &'a VmStateTracker,
    vm: String,
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if let Some(t) = self.tracker.inflight.lock().remove(&self.vm) {
            tracing::debug!(vm = %self.vm, phase = %t.phase, "Transition finished");
        }
    }
}
