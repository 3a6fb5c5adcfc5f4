//! Vulkan instance, device and queue ownership.

use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use strata_core::QueueClass;

use super::capabilities::GpuCapabilities;
use super::instance::{create_instance, select_physical_device};
use crate::error::{GpuError, Result};

/// Queue family index per queue class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub copy: u32,
}

impl QueueFamilies {
    /// Family serving `class`.
    pub const fn get(&self, class: QueueClass) -> u32 {
        match class {
            QueueClass::Graphics => self.graphics,
            QueueClass::Compute => self.compute,
            QueueClass::Copy => self.copy,
        }
    }

    /// Distinct families in graphics, compute, copy order.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(QueueClass::COUNT);
        for family in [self.graphics, self.compute, self.copy] {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// One `VkQueue` plus the lock that serializes submissions to it.
struct QueueSlot {
    family: u32,
    queue: vk::Queue,
    lock: Mutex<()>,
}

/// Owner of the Vulkan instance and logical device.
///
/// Classes that fall back to the same family share one `VkQueue`, and
/// therefore one submission lock.
pub struct VulkanContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    capabilities: GpuCapabilities,
    families: QueueFamilies,
    queues: Vec<QueueSlot>,
}

impl VulkanContext {
    /// Load Vulkan, pick the best GPU and create the logical device.
    pub fn new(app_name: &str, enable_validation: bool) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, app_name, enable_validation) }?;

        let selected = unsafe { select_physical_device(&instance) }.and_then(|physical_device| {
            let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };
            if !capabilities.meets_requirements() {
                tracing::warn!("GPU lacks required features: {}", capabilities.summary());
                return Err(GpuError::NoSuitableDevice);
            }
            Ok((physical_device, capabilities))
        });
        let (physical_device, capabilities) = match selected {
            Ok(selected) => selected,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err);
            }
        };

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let created = unsafe { find_queue_families(&instance, physical_device) }
            .and_then(|families| {
                unsafe { create_device(&instance, physical_device, &families) }
                    .map(|device| (families, device))
            });
        let (families, device) = match created {
            Ok(created) => created,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err);
            }
        };

        let queues = families
            .unique()
            .into_iter()
            .map(|family| QueueSlot {
                family,
                queue: unsafe { device.get_device_queue(family, 0) },
                lock: Mutex::new(()),
            })
            .collect();

        tracing::info!(
            graphics = families.graphics,
            compute = families.compute,
            copy = families.copy,
            "Queue families selected"
        );

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            families,
            queues,
        })
    }

    /// Get the Vulkan instance handle.
    pub const fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the Vulkan device handle.
    pub const fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub const fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the queue family indices.
    pub const fn families(&self) -> &QueueFamilies {
        &self.families
    }

    /// Lock the queue serving `class` for submission.
    pub fn lock_queue(&self, class: QueueClass) -> Result<(vk::Queue, MutexGuard<'_, ()>)> {
        let family = self.families.get(class);
        self.queues
            .iter()
            .find(|slot| slot.family == family)
            .map(|slot| (slot.queue, slot.lock.lock()))
            .ok_or_else(|| GpuError::InvalidState(format!("no queue for family {family}")))
    }

    /// Wait for device to be idle.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        // Hold every queue lock; vkDeviceWaitIdle synchronizes with all queues
        let _guards: Vec<_> = self.queues.iter().map(|slot| slot.lock.lock()).collect();
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Find queue families for graphics, compute, and copy.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilies> {
    let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

    let mut graphics_family = None;
    let mut compute_family = None;
    let mut copy_family = None;

    for (i, family) in (0u32..).zip(queue_families.iter()) {
        let flags = family.queue_flags;

        // Dedicated compute queue (no graphics)
        if flags.contains(vk::QueueFlags::COMPUTE)
            && !flags.contains(vk::QueueFlags::GRAPHICS)
            && compute_family.is_none()
        {
            compute_family = Some(i);
        }

        // Dedicated transfer queue (no graphics or compute)
        if flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.contains(vk::QueueFlags::GRAPHICS)
            && !flags.contains(vk::QueueFlags::COMPUTE)
            && copy_family.is_none()
        {
            copy_family = Some(i);
        }

        if flags.contains(vk::QueueFlags::GRAPHICS)
            && flags.contains(vk::QueueFlags::COMPUTE)
            && graphics_family.is_none()
        {
            graphics_family = Some(i);
        }
    }

    let graphics = graphics_family.ok_or(GpuError::NoSuitableDevice)?;
    let compute = compute_family.unwrap_or(graphics);
    let copy = copy_family.unwrap_or(compute);

    Ok(QueueFamilies {
        graphics,
        compute,
        copy,
    })
}

/// Create the logical device with one queue per distinct family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilies,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .maintenance4(true);

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .descriptor_binding_partially_bound(true)
        .runtime_descriptor_array(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .shader_storage_image_array_non_uniform_indexing(true)
        .shader_storage_buffer_array_non_uniform_indexing(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .push_next(&mut features2);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_families_keep_class_order() {
        let shared = QueueFamilies {
            graphics: 0,
            compute: 0,
            copy: 0,
        };
        assert_eq!(shared.unique(), vec![0]);

        let split = QueueFamilies {
            graphics: 0,
            compute: 2,
            copy: 1,
        };
        assert_eq!(split.unique(), vec![0, 2, 1]);
        assert_eq!(split.get(QueueClass::Copy), 1);
    }
}
