//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Returns true if `version` is at least `major.minor`.
pub const fn api_at_least(version: u32, major: u32, minor: u32) -> bool {
    let have_major = vk::api_version_major(version);
    have_major > major || (have_major == major && vk::api_version_minor(version) >= minor)
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Timeline semaphores (VK 1.2 core)
    pub supports_timeline_semaphores: bool,
    /// Synchronization2 (VK 1.3 core)
    pub supports_synchronization2: bool,
    /// Buffer device address
    pub supports_buffer_device_address: bool,
    /// Descriptor indexing with partially bound arrays
    pub supports_descriptor_indexing: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum memory allocation count
    pub max_memory_allocation_count: u32,

    /// Sampled images a shader stage may access
    pub max_sampled_images: u32,
    /// Storage images a shader stage may access
    pub max_storage_images: u32,
    /// Storage buffers a shader stage may access
    pub max_storage_buffers: u32,
    /// Required alignment of storage buffer descriptor offsets
    pub min_storage_buffer_offset_alignment: u64,

    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut features12)
            .push_next(&mut features13);
        instance.get_physical_device_features2(physical_device, &mut features);

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let limits = properties.limits;
        Self {
            vendor,
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            supports_timeline_semaphores: features12.timeline_semaphore == vk::TRUE,
            supports_synchronization2: features13.synchronization2 == vk::TRUE,
            supports_buffer_device_address: features12.buffer_device_address == vk::TRUE,
            supports_descriptor_indexing: features12.descriptor_indexing == vk::TRUE
                && features12.descriptor_binding_partially_bound == vk::TRUE
                && features12.runtime_descriptor_array == vk::TRUE,

            device_local_memory_mb,
            max_memory_allocation_count: limits.max_memory_allocation_count,

            max_sampled_images: limits.max_per_stage_descriptor_sampled_images,
            max_storage_images: limits.max_per_stage_descriptor_storage_images,
            max_storage_buffers: limits.max_per_stage_descriptor_storage_buffers,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,

            available_extensions,
        }
    }

    /// Check if the GPU has everything the backend relies on.
    pub const fn meets_requirements(&self) -> bool {
        api_at_least(self.api_version, 1, 3)
            && self.supports_timeline_semaphores
            && self.supports_synchronization2
            && self.supports_buffer_device_address
            && self.supports_descriptor_indexing
    }

    /// Largest shader-visible table the device can bind.
    pub fn max_descriptor_table_capacity(&self) -> u32 {
        self.max_sampled_images
            .min(self.max_storage_images)
            .min(self.max_storage_buffers)
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn api_version_comparison() {
        assert!(api_at_least(vk::API_VERSION_1_3, 1, 3));
        assert!(!api_at_least(vk::API_VERSION_1_2, 1, 3));
        assert!(api_at_least(vk::make_api_version(0, 2, 0, 0), 1, 3));
    }
}
