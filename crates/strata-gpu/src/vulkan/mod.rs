//! Vulkan 1.3 backend.
//!
//! Each queue class owns a timeline semaphore whose counter is the class's
//! completion value. Memory comes from `gpu-allocator`. Shader-visible
//! descriptor tables are one partially bound descriptor set per table with
//! sampled images, storage images and storage buffers in bindings 0, 1 and 2,
//! indexed by view slot. Render-target and depth-stencil tables are plain
//! image view arrays, since Vulkan binds attachments by handle.
//!
//! Image layouts are the caller's responsibility: shader-read views are
//! written as `SHADER_READ_ONLY_OPTIMAL` and read-write views as `GENERAL`.

pub mod capabilities;
pub mod context;
pub mod convert;
pub mod instance;

use std::ptr::NonNull;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use strata_core::{
    BufferDesc, BufferViewDesc, DescriptorClass, DeviceConfig, QueueClass, TextureDesc,
    TextureDimension, TextureViewDesc, ViewAccess,
};

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use context::{QueueFamilies, VulkanContext};

use crate::backend::{Backend, BufferCopy};
use crate::error::{GpuError, Result};

/// Binding of sampled images in a shader-visible table.
pub const SAMPLED_IMAGE_BINDING: u32 = 0;
/// Binding of storage images in a shader-visible table.
pub const STORAGE_IMAGE_BINDING: u32 = 1;
/// Binding of storage buffers in a shader-visible table.
pub const STORAGE_BUFFER_BINDING: u32 = 2;

/// Buffer with its memory.
pub struct VulkanBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    address: u64,
}

impl VulkanBuffer {
    /// Raw buffer handle.
    pub const fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes.
    pub const fn size(&self) -> u64 {
        self.size
    }
}

/// Image with its memory.
pub struct VulkanTexture {
    image: vk::Image,
    allocation: Option<Allocation>,
    desc: TextureDesc,
}

impl VulkanTexture {
    /// Raw image handle.
    pub const fn raw(&self) -> vk::Image {
        self.image
    }

    /// Description the image was created from.
    pub const fn desc(&self) -> &TextureDesc {
        &self.desc
    }
}

/// A view, or the descriptor payload standing in for one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VulkanView {
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        storage: bool,
    },
    /// Buffers are bound by range, no `VkBufferView` is created.
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
}

/// Descriptor table storage.
pub enum VulkanTable {
    /// Shader-visible table backed by its own pool and set.
    Bindless {
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
        capacity: u32,
    },
    /// Attachment table indexed by view slot.
    Attachments(Vec<Option<vk::ImageView>>),
}

impl VulkanTable {
    /// Descriptor set to bind, for shader-visible tables.
    pub const fn descriptor_set(&self) -> Option<vk::DescriptorSet> {
        match self {
            Self::Bindless { set, .. } => Some(*set),
            Self::Attachments(_) => None,
        }
    }

    /// Image view stored at `index` of an attachment table.
    pub fn attachment(&self, index: u32) -> Option<vk::ImageView> {
        match self {
            Self::Bindless { .. } => None,
            Self::Attachments(views) => views.get(index as usize).copied().flatten(),
        }
    }

    /// Slot capacity.
    pub fn capacity(&self) -> u32 {
        match self {
            Self::Bindless { capacity, .. } => *capacity,
            Self::Attachments(views) => u32::try_from(views.len()).unwrap_or(u32::MAX),
        }
    }
}

/// Command pool with the single command buffer recorded from it.
pub struct VulkanCommandAllocator {
    class: QueueClass,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

impl VulkanCommandAllocator {
    /// Queue class the pool was created for.
    pub const fn class(&self) -> QueueClass {
        self.class
    }

    /// Command buffer being recorded.
    pub const fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }
}

/// Vulkan implementation of [`Backend`].
pub struct VulkanBackend {
    context: VulkanContext,
    allocator: Mutex<Option<Allocator>>,
    timelines: [vk::Semaphore; QueueClass::COUNT],
    table_layouts: Mutex<hashbrown::HashMap<u32, vk::DescriptorSetLayout>>,
    sharing_families: Vec<u32>,
}

impl VulkanBackend {
    /// Create a backend on the best available GPU.
    pub fn new(config: &DeviceConfig) -> Result<Self> {
        let context = VulkanContext::new(&config.app_name, config.validation)?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: context.instance().clone(),
            device: context.device().clone(),
            physical_device: context.physical_device(),
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        let mut timelines = [vk::Semaphore::null(); QueueClass::COUNT];
        for class in QueueClass::ALL {
            match unsafe { create_timeline(context.device()) } {
                Ok(semaphore) => timelines[class.index()] = semaphore,
                Err(err) => {
                    for semaphore in timelines.iter().filter(|s| **s != vk::Semaphore::null()) {
                        unsafe { context.device().destroy_semaphore(*semaphore, None) };
                    }
                    return Err(err);
                }
            }
        }

        let sharing_families = context.families().unique();
        Ok(Self {
            context,
            allocator: Mutex::new(Some(allocator)),
            timelines,
            table_layouts: Mutex::new(hashbrown::HashMap::new()),
            sharing_families,
        })
    }

    /// Instance, device and queues.
    pub const fn context(&self) -> &VulkanContext {
        &self.context
    }

    /// Get GPU capabilities.
    pub const fn capabilities(&self) -> &GpuCapabilities {
        self.context.capabilities()
    }

    /// Timeline semaphore counting completions of `class`.
    pub const fn timeline(&self, class: QueueClass) -> vk::Semaphore {
        self.timelines[class.index()]
    }

    /// Layout of shader-visible tables with `capacity` slots, for building
    /// pipeline layouts.
    pub fn descriptor_set_layout(&self, capacity: u32) -> Result<vk::DescriptorSetLayout> {
        let mut layouts = self.table_layouts.lock();
        if let Some(layout) = layouts.get(&capacity) {
            return Ok(*layout);
        }

        let bindings = [
            (SAMPLED_IMAGE_BINDING, vk::DescriptorType::SAMPLED_IMAGE),
            (STORAGE_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE),
            (STORAGE_BUFFER_BINDING, vk::DescriptorType::STORAGE_BUFFER),
        ]
        .map(|(binding, descriptor_type)| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(capacity)
                .stage_flags(vk::ShaderStageFlags::ALL)
        });
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND; 3];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&bindings)
            .push_next(&mut flags_info);

        let layout = unsafe {
            self.device()
                .create_descriptor_set_layout(&create_info, None)?
        };
        layouts.insert(capacity, layout);
        Ok(layout)
    }

    fn device(&self) -> &ash::Device {
        self.context.device()
    }

    fn allocate(&self, desc: &AllocationCreateDesc<'_>) -> Result<Allocation> {
        self.allocator
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .allocate(desc)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    fn free(&self, allocation: Option<Allocation>) {
        let Some(allocation) = allocation else {
            return;
        };
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(err) = allocator.free(allocation) {
                tracing::warn!(error = %err, "failed to free GPU memory");
            }
        }
    }

    fn sharing_mode(&self) -> vk::SharingMode {
        if self.sharing_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        }
    }

    fn create_bindless_table(&self, capacity: u32) -> Result<VulkanTable> {
        let limit = self.capabilities().max_descriptor_table_capacity();
        if capacity > limit {
            return Err(GpuError::OutOfDescriptors {
                requested: capacity,
                limit,
            });
        }
        let layout = self.descriptor_set_layout(capacity)?;

        let pool_sizes = [
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::STORAGE_BUFFER,
        ]
        .map(|ty| vk::DescriptorPoolSize {
            ty,
            descriptor_count: capacity,
        });
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { self.device().create_descriptor_pool(&pool_info, None)? };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let set = match unsafe { self.device().allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets.into_iter().next(),
            Err(err) => {
                unsafe { self.device().destroy_descriptor_pool(pool, None) };
                return Err(err.into());
            }
        };
        let Some(set) = set else {
            unsafe { self.device().destroy_descriptor_pool(pool, None) };
            return Err(GpuError::CreationFailed("no descriptor set allocated".into()));
        };

        Ok(VulkanTable::Bindless {
            pool,
            set,
            capacity,
        })
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let _ = self.context.wait_idle();
        unsafe {
            for semaphore in self.timelines {
                self.device().destroy_semaphore(semaphore, None);
            }
            for (_, layout) in self.table_layouts.lock().drain() {
                self.device().destroy_descriptor_set_layout(layout, None);
            }
        }
        // Free all VkDeviceMemory before the context destroys the device
        drop(self.allocator.lock().take());
    }
}

/// Create a timeline semaphore starting at zero.
///
/// # Safety
/// The device must be valid.
unsafe fn create_timeline(device: &ash::Device) -> Result<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(0);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

impl Backend for VulkanBackend {
    type Buffer = VulkanBuffer;
    type Texture = VulkanTexture;
    type View = VulkanView;
    type Table = VulkanTable;
    type CommandAllocator = VulkanCommandAllocator;

    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<VulkanBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(convert::buffer_usage(desc.usage))
            .sharing_mode(self.sharing_mode())
            .queue_family_indices(&self.sharing_families);

        let buffer = unsafe { self.device().create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device().get_buffer_memory_requirements(buffer) };

        let allocation = self.allocate(&AllocationCreateDesc {
            name: "strata buffer",
            requirements,
            location: convert::memory_location(desc.domain),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device().destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe {
            self.device()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.free(Some(allocation));
            unsafe { self.device().destroy_buffer(buffer, None) };
            return Err(err.into());
        }

        let address = unsafe {
            self.device()
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        };

        Ok(VulkanBuffer {
            buffer,
            allocation: Some(allocation),
            size: desc.size,
            address,
        })
    }

    fn destroy_buffer(&self, buffer: VulkanBuffer) {
        self.free(buffer.allocation);
        unsafe { self.device().destroy_buffer(buffer.buffer, None) };
    }

    fn buffer_mapped_ptr(&self, buffer: &VulkanBuffer) -> Option<NonNull<u8>> {
        buffer
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(NonNull::cast)
    }

    fn buffer_gpu_address(&self, buffer: &VulkanBuffer) -> u64 {
        buffer.address
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<VulkanTexture> {
        let flags = if desc.dimension == TextureDimension::Cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let create_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(convert::image_type(desc.dimension))
            .format(convert::format(desc.format))
            .extent(convert::image_extent(desc))
            .mip_levels(desc.mip_levels)
            .array_layers(desc.layer_count())
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::texture_usage(desc.usage))
            .sharing_mode(self.sharing_mode())
            .queue_family_indices(&self.sharing_families)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device().create_image(&create_info, None)? };
        let requirements = unsafe { self.device().get_image_memory_requirements(image) };

        let allocation = self.allocate(&AllocationCreateDesc {
            name: "strata texture",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device().destroy_image(image, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe {
            self.device()
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            self.free(Some(allocation));
            unsafe { self.device().destroy_image(image, None) };
            return Err(err.into());
        }

        Ok(VulkanTexture {
            image,
            allocation: Some(allocation),
            desc: *desc,
        })
    }

    fn destroy_texture(&self, texture: VulkanTexture) {
        self.free(texture.allocation);
        unsafe { self.device().destroy_image(texture.image, None) };
    }

    fn create_texture_view(
        &self,
        texture: &VulkanTexture,
        desc: &TextureViewDesc,
    ) -> Result<VulkanView> {
        let format = desc.format.unwrap_or(texture.desc.format);
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(convert::view_aspect(format, desc.access))
            .base_mip_level(desc.base_mip)
            .level_count(desc.mip_count)
            .base_array_layer(desc.base_layer)
            .layer_count(desc.layer_count);
        let create_info = vk::ImageViewCreateInfo::default()
            .image(texture.image)
            .view_type(convert::view_type(&texture.desc, desc))
            .format(convert::format(format))
            .subresource_range(range);

        let view = unsafe { self.device().create_image_view(&create_info, None)? };
        let layout = match desc.access {
            ViewAccess::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ViewAccess::ShaderReadWrite => vk::ImageLayout::GENERAL,
            ViewAccess::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ViewAccess::DepthStencil => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        Ok(VulkanView::Image {
            view,
            layout,
            storage: desc.access == ViewAccess::ShaderReadWrite,
        })
    }

    fn create_buffer_view(
        &self,
        buffer: &VulkanBuffer,
        offset: u64,
        size: u64,
        _desc: &BufferViewDesc,
    ) -> Result<VulkanView> {
        let alignment = self.capabilities().min_storage_buffer_offset_alignment.max(1);
        if offset % alignment != 0 {
            return Err(GpuError::CreationFailed(format!(
                "storage buffer offset {offset} is not a multiple of {alignment}"
            )));
        }
        Ok(VulkanView::Buffer {
            buffer: buffer.buffer,
            offset,
            range: size,
        })
    }

    fn destroy_view(&self, view: VulkanView) {
        if let VulkanView::Image { view, .. } = view {
            unsafe { self.device().destroy_image_view(view, None) };
        }
    }

    fn create_descriptor_table(&self, class: DescriptorClass, capacity: u32) -> Result<VulkanTable> {
        match class {
            DescriptorClass::ShaderVisible => self.create_bindless_table(capacity),
            DescriptorClass::RenderTarget | DescriptorClass::DepthStencil => {
                Ok(VulkanTable::Attachments(vec![None; capacity as usize]))
            }
        }
    }

    fn write_descriptor(&self, table: &mut VulkanTable, index: u32, view: Option<&VulkanView>) {
        match table {
            VulkanTable::Attachments(views) => {
                if let Some(slot) = views.get_mut(index as usize) {
                    *slot = match view {
                        Some(VulkanView::Image { view, .. }) => Some(*view),
                        _ => None,
                    };
                }
            }
            // Unwritten slots of a partially bound set are the placeholder
            VulkanTable::Bindless { set, .. } => match view {
                None => {}
                Some(VulkanView::Image {
                    view,
                    layout,
                    storage,
                }) => {
                    let (binding, descriptor_type) = if *storage {
                        (STORAGE_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE)
                    } else {
                        (SAMPLED_IMAGE_BINDING, vk::DescriptorType::SAMPLED_IMAGE)
                    };
                    let image_info = vk::DescriptorImageInfo::default()
                        .image_view(*view)
                        .image_layout(*layout);
                    let write = vk::WriteDescriptorSet::default()
                        .dst_set(*set)
                        .dst_binding(binding)
                        .dst_array_element(index)
                        .descriptor_type(descriptor_type)
                        .image_info(std::slice::from_ref(&image_info));
                    unsafe { self.device().update_descriptor_sets(&[write], &[]) };
                }
                Some(VulkanView::Buffer {
                    buffer,
                    offset,
                    range,
                }) => {
                    let buffer_info = vk::DescriptorBufferInfo::default()
                        .buffer(*buffer)
                        .offset(*offset)
                        .range(*range);
                    let write = vk::WriteDescriptorSet::default()
                        .dst_set(*set)
                        .dst_binding(STORAGE_BUFFER_BINDING)
                        .dst_array_element(index)
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(std::slice::from_ref(&buffer_info));
                    unsafe { self.device().update_descriptor_sets(&[write], &[]) };
                }
            },
        }
    }

    fn destroy_descriptor_table(&self, table: VulkanTable) {
        if let VulkanTable::Bindless { pool, .. } = table {
            unsafe { self.device().destroy_descriptor_pool(pool, None) };
        }
    }

    fn completed_value(&self, class: QueueClass) -> Result<u64> {
        let value = unsafe {
            self.device()
                .get_semaphore_counter_value(self.timeline(class))?
        };
        Ok(value)
    }

    fn signal(&self, class: QueueClass, value: u64) -> Result<()> {
        let signal = vk::SemaphoreSubmitInfo::default()
            .semaphore(self.timeline(class))
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        let submit = vk::SubmitInfo2::default().signal_semaphore_infos(std::slice::from_ref(&signal));

        let (queue, _guard) = self.context.lock_queue(class)?;
        unsafe {
            self.device()
                .queue_submit2(queue, &[submit], vk::Fence::null())?;
        }
        Ok(())
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn wait(&self, class: QueueClass, value: u64) -> Result<()> {
        let semaphores = [self.timeline(class)];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device().wait_semaphores(&wait_info, u64::MAX)? };
        Ok(())
    }

    fn create_command_allocator(&self, class: QueueClass) -> Result<VulkanCommandAllocator> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.context.families().get(class))
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { self.device().create_command_pool(&pool_info, None)? };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match unsafe { self.device().allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers.into_iter().next(),
            Err(err) => {
                unsafe { self.device().destroy_command_pool(pool, None) };
                return Err(err.into());
            }
        };
        let Some(command_buffer) = command_buffer else {
            unsafe { self.device().destroy_command_pool(pool, None) };
            return Err(GpuError::CreationFailed("no command buffer allocated".into()));
        };

        Ok(VulkanCommandAllocator {
            class,
            pool,
            command_buffer,
        })
    }

    fn begin_commands(&self, allocator: &mut VulkanCommandAllocator) -> Result<()> {
        unsafe {
            self.device()
                .reset_command_pool(allocator.pool, vk::CommandPoolResetFlags::empty())?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device()
                .begin_command_buffer(allocator.command_buffer, &begin_info)?;
        }
        Ok(())
    }

    fn record_copy(&self, allocator: &mut VulkanCommandAllocator, copy: &BufferCopy<'_, Self>) {
        let region = vk::BufferCopy {
            src_offset: copy.src_offset,
            dst_offset: copy.dst_offset,
            size: copy.size,
        };
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::COPY)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE);
        let dependency =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.device().cmd_copy_buffer(
                allocator.command_buffer,
                copy.src.buffer,
                copy.dst.buffer,
                &[region],
            );
            self.device()
                .cmd_pipeline_barrier2(allocator.command_buffer, &dependency);
        }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn submit(
        &self,
        class: QueueClass,
        allocator: &mut VulkanCommandAllocator,
        waits: &[(QueueClass, u64)],
        signal_value: u64,
    ) -> Result<()> {
        unsafe { self.device().end_command_buffer(allocator.command_buffer)? };

        let wait_infos: Vec<vk::SemaphoreSubmitInfo> = waits
            .iter()
            .filter(|(wait_class, _)| *wait_class != class)
            .map(|(wait_class, value)| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(self.timeline(*wait_class))
                    .value(*value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        let command_info =
            vk::CommandBufferSubmitInfo::default().command_buffer(allocator.command_buffer);
        let signal_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(self.timeline(class))
            .value(signal_value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(std::slice::from_ref(&command_info))
            .signal_semaphore_infos(std::slice::from_ref(&signal_info));

        let (queue, _guard) = self.context.lock_queue(class)?;
        unsafe {
            self.device()
                .queue_submit2(queue, &[submit], vk::Fence::null())?;
        }
        Ok(())
    }

    fn destroy_command_allocator(&self, allocator: VulkanCommandAllocator) {
        unsafe { self.device().destroy_command_pool(allocator.pool, None) };
    }
}
