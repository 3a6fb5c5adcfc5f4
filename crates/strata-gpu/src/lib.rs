//! GPU resource lifetime and sub-allocation engine for Strata.
//!
//! This crate provides:
//! - The narrow [`Backend`] interface native APIs implement
//! - Deferred retirement keyed on per-queue completion stamps
//! - Persistent free-list and per-frame transient buffer allocators
//! - Descriptor table snapshots with generation-based recycling
//! - Command allocator pooling and cross-queue submission
//! - The [`Device`] tying them together, plus headless and Vulkan backends

pub mod backend;
pub mod command;
pub mod counters;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod freelist;
pub mod headless;
pub mod persistent;
pub mod retire;
pub mod transient;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use backend::{Backend, BufferCopy};
pub use command::{CommandList, QueuePool};
pub use counters::CompletionCounters;
pub use descriptor::{
    DescriptorTable, DescriptorTableRecycler, RecyclerStats, TableState, ViewRecord,
};
pub use device::{Device, DeviceResource, DeviceStats};
pub use error::{GpuError, Result};
pub use freelist::FreeListRegion;
pub use headless::{CompletionMode, HeadlessBackend, LiveObjects};
pub use persistent::{BufferAllocation, PersistentAllocator, PersistentStats, UploadRequest};
pub use retire::{Retired, RetirementQueue};
pub use transient::{PageId, TransientAllocation, TransientAllocator};
#[cfg(feature = "vulkan")]
pub use vulkan::VulkanBackend;

#[cfg(feature = "vulkan")]
impl Device<VulkanBackend> {
    /// Create a device on the best available Vulkan GPU.
    pub fn vulkan(config: strata_core::DeviceConfig) -> Result<Self> {
        let backend = VulkanBackend::new(&config)?;
        Self::new(backend, config)
    }
}
