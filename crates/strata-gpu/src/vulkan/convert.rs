//! Translation of backend-independent descriptions into Vulkan types.

use ash::vk;
use gpu_allocator::MemoryLocation;
use strata_core::{
    BufferUsage, Format, MemoryDomain, TextureDesc, TextureDimension, TextureUsage,
    TextureViewDesc, ViewAccess,
};

pub const fn format(format: Format) -> vk::Format {
    match format {
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::Rg16Float => vk::Format::R16G16_SFLOAT,
        Format::Depth32Float => vk::Format::D32_SFLOAT,
        Format::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

pub const fn memory_location(domain: MemoryDomain) -> MemoryLocation {
    match domain {
        MemoryDomain::Device => MemoryLocation::GpuOnly,
        MemoryDomain::Upload => MemoryLocation::CpuToGpu,
        MemoryDomain::Readback => MemoryLocation::GpuToCpu,
    }
}

/// Buffer usage flags. Every buffer is copyable and addressable, since
/// regions are shared between sub-allocations of differing usage.
pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.intersects(BufferUsage::STORAGE | BufferUsage::STORAGE_WRITE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    flags
}

pub fn texture_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_TARGET) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsage::DEPTH_STENCIL) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(TextureUsage::COPY_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    flags
}

pub const fn image_type(dimension: TextureDimension) -> vk::ImageType {
    match dimension {
        TextureDimension::D1 => vk::ImageType::TYPE_1D,
        TextureDimension::D2 | TextureDimension::Cube => vk::ImageType::TYPE_2D,
        TextureDimension::D3 => vk::ImageType::TYPE_3D,
    }
}

pub const fn image_extent(desc: &TextureDesc) -> vk::Extent3D {
    let (height, depth) = match desc.dimension {
        TextureDimension::D1 => (1, 1),
        TextureDimension::D2 | TextureDimension::Cube => (desc.height, 1),
        TextureDimension::D3 => (desc.height, desc.depth_or_layers),
    };
    vk::Extent3D {
        width: desc.width,
        height,
        depth,
    }
}

/// View type for a subresource range of `texture`.
pub const fn view_type(texture: &TextureDesc, view: &TextureViewDesc) -> vk::ImageViewType {
    let layered = view.layer_count > 1;
    match texture.dimension {
        TextureDimension::D1 if layered => vk::ImageViewType::TYPE_1D_ARRAY,
        TextureDimension::D1 => vk::ImageViewType::TYPE_1D,
        TextureDimension::D3 => vk::ImageViewType::TYPE_3D,
        TextureDimension::Cube if view.layer_count == 6 => vk::ImageViewType::CUBE,
        TextureDimension::Cube if view.layer_count % 6 == 0 => vk::ImageViewType::CUBE_ARRAY,
        _ if layered => vk::ImageViewType::TYPE_2D_ARRAY,
        _ => vk::ImageViewType::TYPE_2D,
    }
}

/// Aspect a view of `format` with `access` addresses.
pub const fn view_aspect(format: Format, access: ViewAccess) -> vk::ImageAspectFlags {
    if !format.is_depth() {
        vk::ImageAspectFlags::COLOR
    } else if format.has_stencil() && matches!(access, ViewAccess::DepthStencil) {
        vk::ImageAspectFlags::from_raw(
            vk::ImageAspectFlags::DEPTH.as_raw() | vk::ImageAspectFlags::STENCIL.as_raw(),
        )
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_buffer_is_copyable_and_addressable() {
        let flags = buffer_usage(BufferUsage::VERTEX);
        assert!(flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        assert!(!flags.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(buffer_usage(BufferUsage::STORAGE_WRITE)
            .contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }

    #[test]
    fn cube_views_pick_cube_types() {
        let texture = TextureDesc {
            depth_or_layers: 12,
            dimension: TextureDimension::Cube,
            ..TextureDesc::d2(64, 64, Format::Rgba8Unorm, TextureUsage::SAMPLED)
        };
        let handle = strata_core::TextureHandle::from_raw(1);
        let cube = TextureViewDesc::new(handle, ViewAccess::ShaderRead).with_layers(0, 6);
        let array = cube.with_layers(0, 12);
        let face = cube.with_layers(2, 1);
        assert_eq!(view_type(&texture, &cube), vk::ImageViewType::CUBE);
        assert_eq!(view_type(&texture, &array), vk::ImageViewType::CUBE_ARRAY);
        assert_eq!(view_type(&texture, &face), vk::ImageViewType::TYPE_2D);
    }

    #[test]
    fn depth_stencil_aspects() {
        assert_eq!(
            view_aspect(Format::Depth24Stencil8, ViewAccess::ShaderRead),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            view_aspect(Format::Depth24Stencil8, ViewAccess::DepthStencil),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            view_aspect(Format::Rgba8Unorm, ViewAccess::RenderTarget),
            vk::ImageAspectFlags::COLOR
        );
    }
}
