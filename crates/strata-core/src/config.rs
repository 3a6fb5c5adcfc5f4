//! Device configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Two mebibytes, the default page size of both buffer allocators.
pub const DEFAULT_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Tunables for a device and the allocators it owns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Application name reported to the driver.
    pub app_name: String,
    /// Frames the CPU may record ahead of the GPU.
    pub frames_in_flight: u32,
    /// Page size of the per-frame linear allocator.
    pub transient_page_size: u64,
    /// Page size of the persistent free-list allocator.
    pub persistent_page_size: u64,
    /// Persistent requests above this size get a dedicated region.
    pub dedicated_threshold: u64,
    /// Lower bound on the slot count of a descriptor table.
    pub min_descriptor_capacity: u32,
    /// Enable backend validation layers (default: debug builds only).
    pub validation: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "Strata".to_string(),
            frames_in_flight: 2,
            transient_page_size: DEFAULT_PAGE_SIZE,
            persistent_page_size: DEFAULT_PAGE_SIZE,
            dedicated_threshold: DEFAULT_PAGE_SIZE / 2,
            min_descriptor_capacity: 1024,
            validation: cfg!(debug_assertions),
        }
    }
}

impl DeviceConfig {
    /// Create a new config with the given application name.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Set the number of frames in flight.
    #[must_use]
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the transient page size.
    #[must_use]
    pub fn with_transient_page_size(mut self, size: u64) -> Self {
        self.transient_page_size = size;
        self
    }

    /// Set the persistent page size and reset the dedicated threshold to half of it.
    #[must_use]
    pub fn with_persistent_page_size(mut self, size: u64) -> Self {
        self.persistent_page_size = size;
        self.dedicated_threshold = size / 2;
        self
    }

    /// Set the dedicated-region threshold.
    #[must_use]
    pub fn with_dedicated_threshold(mut self, threshold: u64) -> Self {
        self.dedicated_threshold = threshold;
        self
    }

    /// Set the minimum descriptor table capacity.
    #[must_use]
    pub fn with_min_descriptor_capacity(mut self, capacity: u32) -> Self {
        self.min_descriptor_capacity = capacity;
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Reject configurations the allocators cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(Error::InvalidArgument(
                "frames_in_flight must be at least 1".into(),
            ));
        }
        for (name, size) in [
            ("transient_page_size", self.transient_page_size),
            ("persistent_page_size", self.persistent_page_size),
        ] {
            if !size.is_power_of_two() {
                return Err(Error::InvalidArgument(format!(
                    "{name} {size} is not a non-zero power of two"
                )));
            }
        }
        if self.dedicated_threshold == 0 || self.dedicated_threshold > self.persistent_page_size {
            return Err(Error::InvalidArgument(format!(
                "dedicated_threshold {} must be in 1..={}",
                self.dedicated_threshold, self.persistent_page_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dedicated_threshold, DEFAULT_PAGE_SIZE / 2);
    }

    #[test]
    fn page_sizes_must_be_powers_of_two() {
        let config = DeviceConfig::new("test").with_transient_page_size(3000);
        assert!(config.validate().is_err());
        let config = DeviceConfig::new("test").with_persistent_page_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn threshold_cannot_exceed_page() {
        let config = DeviceConfig::new("test")
            .with_persistent_page_size(4096)
            .with_dedicated_threshold(8192);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_frames_rejected() {
        assert!(DeviceConfig::new("test")
            .with_frames_in_flight(0)
            .validate()
            .is_err());
    }
}
