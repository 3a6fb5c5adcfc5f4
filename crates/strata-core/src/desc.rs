//! Resource and view descriptions.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::handle::{BufferHandle, TextureHandle};

/// Which memory a backing region lives in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryDomain {
    /// Device-local, written through staging copies.
    #[default]
    Device,
    /// Host-visible, written directly by the CPU.
    Upload,
    /// Host-visible, read back by the CPU.
    Readback,
}

impl MemoryDomain {
    /// Returns true if the CPU can map this memory.
    #[must_use]
    pub const fn is_host_visible(self) -> bool {
        !matches!(self, Self::Device)
    }
}

bitflags! {
    /// How a buffer may be used by the GPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BufferUsage: u32 {
        /// Vertex stream.
        const VERTEX        = 0b0000_0001;
        /// Index stream.
        const INDEX         = 0b0000_0010;
        /// Constant / uniform data.
        const UNIFORM       = 0b0000_0100;
        /// Read-only shader storage.
        const STORAGE       = 0b0000_1000;
        /// Read-write shader storage. Never shares a region with other buffers.
        const STORAGE_WRITE = 0b0001_0000;
        /// Indirect draw / dispatch arguments.
        const INDIRECT      = 0b0010_0000;
        /// Source of copy commands.
        const COPY_SRC      = 0b0100_0000;
        /// Destination of copy commands.
        const COPY_DST      = 0b1000_0000;
    }
}

bitflags! {
    /// How a texture may be used by the GPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct TextureUsage: u32 {
        /// Sampled in shaders.
        const SAMPLED       = 0b0000_0001;
        /// Read-write storage image.
        const STORAGE       = 0b0000_0010;
        /// Color attachment.
        const RENDER_TARGET = 0b0000_0100;
        /// Depth-stencil attachment.
        const DEPTH_STENCIL = 0b0000_1000;
        /// Source of copy commands.
        const COPY_SRC      = 0b0001_0000;
        /// Destination of copy commands.
        const COPY_DST      = 0b0010_0000;
    }
}

/// Texel formats understood by every backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    R32Uint,
    Rg16Float,
    Depth32Float,
    Depth24Stencil8,
}

impl Format {
    /// Returns true for depth or depth-stencil formats.
    #[must_use]
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float | Self::Depth24Stencil8)
    }

    /// Returns true if the format carries a stencil aspect.
    #[must_use]
    pub const fn has_stencil(self) -> bool {
        matches!(self, Self::Depth24Stencil8)
    }

    /// Size of one texel in bytes.
    #[must_use]
    pub const fn texel_size(self) -> u32 {
        match self {
            Self::Rgba8Unorm
            | Self::Rgba8Srgb
            | Self::Bgra8Unorm
            | Self::Bgra8Srgb
            | Self::R32Float
            | Self::R32Uint
            | Self::Rg16Float
            | Self::Depth32Float
            | Self::Depth24Stencil8 => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

/// Texture dimensionality.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureDimension {
    D1,
    #[default]
    D2,
    D3,
    Cube,
}

/// Description of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferDesc {
    /// Size in bytes.
    pub size: u64,
    /// Allowed usages.
    pub usage: BufferUsage,
    /// Memory domain.
    pub domain: MemoryDomain,
    /// Minimum alignment of the sub-allocation offset (power of two).
    pub alignment: u64,
}

impl BufferDesc {
    /// Default offset alignment, large enough for uniform and storage bindings.
    pub const DEFAULT_ALIGNMENT: u64 = 256;

    /// Device-local buffer of `size` bytes.
    #[must_use]
    pub const fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            size,
            usage,
            domain: MemoryDomain::Device,
            alignment: Self::DEFAULT_ALIGNMENT,
        }
    }

    /// Set the memory domain.
    #[must_use]
    pub const fn with_domain(mut self, domain: MemoryDomain) -> Self {
        self.domain = domain;
        self
    }

    /// Set the offset alignment.
    #[must_use]
    pub const fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Returns true if shaders may write this buffer.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.usage.contains(BufferUsage::STORAGE_WRITE)
    }

    /// Check the description for values no backend accepts.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::InvalidArgument("buffer size must be non-zero".into()));
        }
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "buffer alignment {} is not a power of two",
                self.alignment
            )));
        }
        Ok(())
    }
}

/// Description of a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    /// Depth for 3D textures, array layers otherwise (6 per cube).
    pub depth_or_layers: u32,
    pub mip_levels: u32,
    pub format: Format,
    pub dimension: TextureDimension,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// Single-mip 2D texture.
    #[must_use]
    pub const fn d2(width: u32, height: u32, format: Format, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            depth_or_layers: 1,
            mip_levels: 1,
            format,
            dimension: TextureDimension::D2,
            usage,
        }
    }

    /// Set the mip count.
    #[must_use]
    pub const fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Array layers visible to views (1 for 3D textures).
    #[must_use]
    pub const fn layer_count(&self) -> u32 {
        match self.dimension {
            TextureDimension::D3 => 1,
            _ => self.depth_or_layers,
        }
    }

    /// Check the description for values no backend accepts.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.depth_or_layers == 0 {
            return Err(Error::InvalidArgument(format!(
                "texture extent {}x{}x{} has a zero dimension",
                self.width, self.height, self.depth_or_layers
            )));
        }
        if self.mip_levels == 0 {
            return Err(Error::InvalidArgument("texture needs at least one mip".into()));
        }
        if self.dimension == TextureDimension::Cube && self.depth_or_layers % 6 != 0 {
            return Err(Error::InvalidArgument(
                "cube textures need a multiple of six layers".into(),
            ));
        }
        Ok(())
    }
}

/// Descriptor table family a view is written into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorClass {
    /// Shader-visible table (sampled, storage and buffer views).
    ShaderVisible,
    /// Render-target views.
    RenderTarget,
    /// Depth-stencil views.
    DepthStencil,
}

impl DescriptorClass {
    /// Every class in index order.
    pub const ALL: [Self; 3] = [Self::ShaderVisible, Self::RenderTarget, Self::DepthStencil];

    /// Number of classes.
    pub const COUNT: usize = Self::ALL.len();

    /// Position of this class in per-class arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::ShaderVisible => 0,
            Self::RenderTarget => 1,
            Self::DepthStencil => 2,
        }
    }
}

/// Access pattern a view exposes its resource with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewAccess {
    #[default]
    ShaderRead,
    ShaderReadWrite,
    RenderTarget,
    DepthStencil,
}

impl ViewAccess {
    /// Table family views with this access are written into.
    #[must_use]
    pub const fn descriptor_class(self) -> DescriptorClass {
        match self {
            Self::ShaderRead | Self::ShaderReadWrite => DescriptorClass::ShaderVisible,
            Self::RenderTarget => DescriptorClass::RenderTarget,
            Self::DepthStencil => DescriptorClass::DepthStencil,
        }
    }
}

/// View of a texture subresource range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureViewDesc {
    pub texture: TextureHandle,
    /// Reinterpreting format, `None` to use the texture's own.
    pub format: Option<Format>,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    pub access: ViewAccess,
}

impl TextureViewDesc {
    /// View of the first mip and layer of `texture`.
    #[must_use]
    pub const fn new(texture: TextureHandle, access: ViewAccess) -> Self {
        Self {
            texture,
            format: None,
            base_mip: 0,
            mip_count: 1,
            base_layer: 0,
            layer_count: 1,
            access,
        }
    }

    /// Select a mip range.
    #[must_use]
    pub const fn with_mips(mut self, base_mip: u32, mip_count: u32) -> Self {
        self.base_mip = base_mip;
        self.mip_count = mip_count;
        self
    }

    /// Select a layer range.
    #[must_use]
    pub const fn with_layers(mut self, base_layer: u32, layer_count: u32) -> Self {
        self.base_layer = base_layer;
        self.layer_count = layer_count;
        self
    }

    /// Check the view against the texture it will be created on.
    pub fn validate(&self, texture: &TextureDesc) -> Result<()> {
        if self.mip_count == 0 || self.base_mip + self.mip_count > texture.mip_levels {
            return Err(Error::OutOfBounds(format!(
                "mips {}..{} of a {}-mip texture",
                self.base_mip,
                self.base_mip + self.mip_count,
                texture.mip_levels
            )));
        }
        if self.layer_count == 0 || self.base_layer + self.layer_count > texture.layer_count() {
            return Err(Error::OutOfBounds(format!(
                "layers {}..{} of a {}-layer texture",
                self.base_layer,
                self.base_layer + self.layer_count,
                texture.layer_count()
            )));
        }
        let format = self.format.unwrap_or(texture.format);
        let required = match self.access {
            ViewAccess::ShaderRead => TextureUsage::SAMPLED,
            ViewAccess::ShaderReadWrite => TextureUsage::STORAGE,
            ViewAccess::RenderTarget => TextureUsage::RENDER_TARGET,
            ViewAccess::DepthStencil => TextureUsage::DEPTH_STENCIL,
        };
        if !texture.usage.contains(required) {
            return Err(Error::InvalidArgument(format!(
                "{:?} view on a texture without {required:?} usage",
                self.access
            )));
        }
        if (self.access == ViewAccess::DepthStencil) != format.is_depth() {
            return Err(Error::InvalidArgument(format!(
                "{:?} view cannot use format {format:?}",
                self.access
            )));
        }
        Ok(())
    }
}

/// View of a byte range of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferViewDesc {
    pub buffer: BufferHandle,
    /// Offset from the start of the buffer.
    pub offset: u64,
    /// Length in bytes, 0 for "to the end of the buffer".
    pub size: u64,
    /// Element stride for structured access, 0 for raw.
    pub stride: u32,
    pub access: ViewAccess,
}

impl BufferViewDesc {
    /// Whole-buffer raw view.
    #[must_use]
    pub const fn new(buffer: BufferHandle, access: ViewAccess) -> Self {
        Self {
            buffer,
            offset: 0,
            size: 0,
            stride: 0,
            access,
        }
    }

    /// Select a byte range.
    #[must_use]
    pub const fn with_range(mut self, offset: u64, size: u64) -> Self {
        self.offset = offset;
        self.size = size;
        self
    }

    /// Set the structured element stride.
    #[must_use]
    pub const fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    /// Effective length once "to the end" has been resolved.
    #[must_use]
    pub const fn resolved_size(&self, buffer_size: u64) -> u64 {
        if self.size == 0 {
            buffer_size.saturating_sub(self.offset)
        } else {
            self.size
        }
    }

    /// Check the view against the buffer it will be created on.
    pub fn validate(&self, buffer: &BufferDesc) -> Result<()> {
        if !matches!(self.access, ViewAccess::ShaderRead | ViewAccess::ShaderReadWrite) {
            return Err(Error::InvalidArgument(format!(
                "buffers cannot be viewed as {:?}",
                self.access
            )));
        }
        if self.access == ViewAccess::ShaderReadWrite && !buffer.is_writable() {
            return Err(Error::InvalidArgument(
                "read-write view on a buffer without STORAGE_WRITE usage".into(),
            ));
        }
        let size = self.resolved_size(buffer.size);
        if size == 0 || self.offset + size > buffer.size {
            return Err(Error::OutOfBounds(format!(
                "range {}..{} of a {}-byte buffer",
                self.offset,
                self.offset + size,
                buffer.size
            )));
        }
        if self.stride != 0 && size % u64::from(self.stride) != 0 {
            return Err(Error::InvalidArgument(format!(
                "range of {size} bytes is not a multiple of stride {}",
                self.stride
            )));
        }
        Ok(())
    }
}

/// A descriptor: one of a texture view or a buffer view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ViewDesc {
    Texture(TextureViewDesc),
    Buffer(BufferViewDesc),
}

impl ViewDesc {
    /// Access pattern of the view.
    #[must_use]
    pub const fn access(&self) -> ViewAccess {
        match self {
            Self::Texture(desc) => desc.access,
            Self::Buffer(desc) => desc.access,
        }
    }

    /// Table family this view is written into.
    #[must_use]
    pub const fn descriptor_class(&self) -> DescriptorClass {
        self.access().descriptor_class()
    }
}

impl From<TextureViewDesc> for ViewDesc {
    fn from(desc: TextureViewDesc) -> Self {
        Self::Texture(desc)
    }
}

impl From<BufferViewDesc> for ViewDesc {
    fn from(desc: BufferViewDesc) -> Self {
        Self::Buffer(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;

    fn sampled_texture() -> TextureDesc {
        TextureDesc::d2(64, 64, Format::Rgba8Unorm, TextureUsage::SAMPLED).with_mips(4)
    }

    #[test]
    fn access_maps_to_class() {
        assert_eq!(
            ViewAccess::ShaderReadWrite.descriptor_class(),
            DescriptorClass::ShaderVisible
        );
        assert_eq!(
            ViewAccess::DepthStencil.descriptor_class(),
            DescriptorClass::DepthStencil
        );
    }

    #[test]
    fn texture_view_range_checked() {
        let texture = sampled_texture();
        let view = TextureViewDesc::new(Handle::INVALID, ViewAccess::ShaderRead);
        assert!(view.with_mips(0, 4).validate(&texture).is_ok());
        assert!(matches!(
            view.with_mips(2, 3).validate(&texture),
            Err(Error::OutOfBounds(_))
        ));
        assert!(view.with_layers(0, 2).validate(&texture).is_err());
    }

    #[test]
    fn texture_view_needs_matching_usage() {
        let texture = sampled_texture();
        let view = TextureViewDesc::new(Handle::INVALID, ViewAccess::RenderTarget);
        assert!(matches!(
            view.validate(&texture),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn depth_view_needs_depth_format() {
        let texture = TextureDesc::d2(
            8,
            8,
            Format::Rgba8Unorm,
            TextureUsage::DEPTH_STENCIL,
        );
        let view = TextureViewDesc::new(Handle::INVALID, ViewAccess::DepthStencil);
        assert!(view.validate(&texture).is_err());
    }

    #[test]
    fn buffer_view_resolves_whole_range() {
        let buffer = BufferDesc::new(1024, BufferUsage::STORAGE);
        let view = BufferViewDesc::new(Handle::INVALID, ViewAccess::ShaderRead);
        assert_eq!(view.resolved_size(buffer.size), 1024);
        assert!(view.validate(&buffer).is_ok());
        assert!(view.with_range(512, 1024).validate(&buffer).is_err());
        assert!(view.with_stride(12).validate(&buffer).is_err());
        assert!(view.with_stride(16).validate(&buffer).is_ok());
    }

    #[test]
    fn buffer_cannot_be_render_target() {
        let buffer = BufferDesc::new(64, BufferUsage::STORAGE);
        let view = BufferViewDesc::new(Handle::INVALID, ViewAccess::RenderTarget);
        assert!(view.validate(&buffer).is_err());
        let rw = BufferViewDesc::new(Handle::INVALID, ViewAccess::ShaderReadWrite);
        assert!(rw.validate(&buffer).is_err());
    }

    #[test]
    fn buffer_desc_validation() {
        assert!(BufferDesc::new(0, BufferUsage::VERTEX).validate().is_err());
        assert!(BufferDesc::new(16, BufferUsage::VERTEX)
            .with_alignment(3)
            .validate()
            .is_err());
        assert!(BufferDesc::new(16, BufferUsage::VERTEX).validate().is_ok());
    }
}
