//! Undo log for multi-step VM provisioning

use std::fmt;

use crate::mgmt::OpaqueRef;
use crate::network::NetworkSpec;

/// One side effect that can be rolled back.
#[derive(Debug, Clone, PartialEq)]
pub enum Undo {
    HardShutdown(OpaqueRef),
    DestroyVbd(OpaqueRef),
    DestroyVif(OpaqueRef),
    /// Only recorded for disks created during this operation.
    DestroyVdi(String),
    RemoveIsoSr(String),
    ReleaseNetwork(NetworkSpec),
    DestroyVm(OpaqueRef),
}

impl fmt::Display for Undo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Undo::HardShutdown(vm) => write!(f, "hard shutdown of {}", vm),
            Undo::DestroyVbd(vbd) => write!(f, "destroy VBD {}", vbd),
            Undo::DestroyVif(vif) => write!(f, "destroy VIF {}", vif),
            Undo::DestroyVdi(uuid) => write!(f, "destroy VDI {}", uuid),
            Undo::RemoveIsoSr(uuid) => write!(f, "remove ISO SR {}", uuid),
            Undo::ReleaseNetwork(spec) => write!(f, "release network {}", spec.name_label()),
            Undo::DestroyVm(vm) => write!(f, "destroy VM {}", vm),
        }
    }
}

/// Steps recorded in the order their side effects happened.
#[derive(Debug, Default)]
pub struct Compensation {
    steps: Vec<Undo>,
}

impl Compensation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Undo) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step newest first. Each failure is logged and collected;
    /// none stops the remaining steps.
    pub fn unwind<F>(self, mut run: F) -> Vec<String>
    where
        F: FnMut(&Undo) -> crate::Result<()>,
    {
        let mut failures = Vec::new();
        for step in self.steps.into_iter().rev() {
            match run(&step) {
                Ok(()) => tracing::debug!(step = %step, "Rolled back"),
                Err(e) => {
                    tracing::warn!(step = %step, error = %e, "Rollback step failed");
                    failures.push(format!("{}: {}", step, e));
                }
            }
        }
        failures
    }
}
