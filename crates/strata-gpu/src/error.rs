//! GPU error types.

#[cfg(feature = "vulkan")]
use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[cfg(feature = "vulkan")]
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The device was lost; nothing on it can be recovered.
    #[error("Device lost")]
    DeviceLost,

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// The backend rejected a resource, view or table.
    #[error("Creation failed: {0}")]
    CreationFailed(String),

    /// A descriptor table would exceed the device's descriptor limits.
    #[error("Out of descriptors: {requested} requested, {limit} supported")]
    OutOfDescriptors { requested: u32, limit: u32 },

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid description or handle.
    #[error(transparent)]
    Core(#[from] strata_core::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Returns true if the error means the device itself is gone.
    ///
    /// Every other error is recoverable by the caller.
    pub fn is_device_lost(&self) -> bool {
        match self {
            Self::DeviceLost => true,
            #[cfg(feature = "vulkan")]
            Self::Vulkan(result) => *result == vk::Result::ERROR_DEVICE_LOST,
            _ => false,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_detection() {
        assert!(GpuError::DeviceLost.is_device_lost());
        assert!(!GpuError::CreationFailed("view".into()).is_device_lost());
        #[cfg(feature = "vulkan")]
        assert!(GpuError::from(vk::Result::ERROR_DEVICE_LOST).is_device_lost());
    }
}
