//! VM memory bounds

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Smallest amount of memory a guest may be given.
pub const MIN_GUEST_MEMORY: u64 = 128 * 1024 * 1024;

/// Static and dynamic memory bounds of a VM, in bytes.
///
/// The hypervisor requires `static_min <= dynamic_min <= dynamic_max <= static_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimits {
    pub static_min: u64,
    pub dynamic_min: u64,
    pub dynamic_max: u64,
    pub static_max: u64,
}

impl MemoryLimits {
    /// All four bounds equal: no ballooning.
    pub fn fixed(bytes: u64) -> Self {
        Self {
            static_min: bytes,
            dynamic_min: bytes,
            dynamic_max: bytes,
            static_max: bytes,
        }
    }

    /// Ballooning between `min` and `max`, with the static range matching.
    pub fn dynamic(min: u64, max: u64) -> Self {
        Self {
            static_min: min,
            dynamic_min: min,
            dynamic_max: max,
            static_max: max,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.static_min < MIN_GUEST_MEMORY {
            return Err(Error::Precondition(format!(
                "static-min {} is below the {} byte minimum",
                self.static_min, MIN_GUEST_MEMORY
            )));
        }
        if self.dynamic_min < self.static_min {
            return Err(Error::Precondition(format!(
                "dynamic-min {} is below static-min {}",
                self.dynamic_min, self.static_min
            )));
        }
        if self.dynamic_max < self.dynamic_min {
            return Err(Error::Precondition(format!(
                "dynamic-max {} is below dynamic-min {}",
                self.dynamic_max, self.dynamic_min
            )));
        }
        if self.dynamic_max > self.static_max {
            return Err(Error::Precondition(format!(
                "dynamic-max {} exceeds static-max {}",
                self.dynamic_max, self.static_max
            )));
        }
        Ok(())
    }

    /// Same static range; used to reject resizing static bounds of a running VM.
    pub fn same_static_range(&self, other: &MemoryLimits) -> bool {
        self.static_min == other.static_min && self.static_max == other.static_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_fixed_limits_are_valid() {
        assert!(MemoryLimits::fixed(2 * GIB).validate().is_ok());
    }

    #[test]
    fn test_dynamic_min_below_static_min_rejected() {
        let limits = MemoryLimits {
            static_min: GIB,
            dynamic_min: GIB / 2,
            dynamic_max: 2 * GIB,
            static_max: 2 * GIB,
        };
        assert!(matches!(limits.validate(), Err(Error::Precondition(_))));
    }

    #[test]
    fn test_dynamic_max_above_static_max_rejected() {
        let limits = MemoryLimits {
            static_min: GIB,
            dynamic_min: GIB,
            dynamic_max: 4 * GIB,
            static_max: 2 * GIB,
        };
        assert!(matches!(limits.validate(), Err(Error::Precondition(_))));
    }

    #[test]
    fn test_inverted_dynamic_range_rejected() {
        let limits = MemoryLimits {
            static_min: GIB,
            dynamic_min: 2 * GIB,
            dynamic_max: GIB,
            static_max: 2 * GIB,
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_tiny_guest_rejected() {
        assert!(MemoryLimits::fixed(16 * 1024 * 1024).validate().is_err());
    }
}
