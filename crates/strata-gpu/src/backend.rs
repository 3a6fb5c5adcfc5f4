//! The narrow interface native backends implement.
//!
//! Everything in here is an opaque, possibly-failing primitive. The lifetime
//! engine decides *when* to call them; backends only know *how*.

use std::ptr::NonNull;

use strata_core::{
    BufferDesc, BufferViewDesc, DescriptorClass, QueueClass, TextureDesc, TextureViewDesc,
};

use crate::error::Result;

/// One buffer-to-buffer copy recorded into a command allocator.
pub struct BufferCopy<'a, B: Backend + ?Sized> {
    pub src: &'a B::Buffer,
    pub src_offset: u64,
    pub dst: &'a B::Buffer,
    pub dst_offset: u64,
    pub size: u64,
}

/// Native GPU backend.
///
/// Queue completion counters are monotonic: `completed_value(class)` never
/// decreases, and `submit`/`signal` are called with strictly increasing
/// values per class.
pub trait Backend: Send + Sync + Sized + 'static {
    /// Native buffer with its memory.
    type Buffer: Send + 'static;
    /// Native texture with its memory.
    type Texture: Send + 'static;
    /// Native view (or the descriptor payload standing in for one).
    type View: Send + 'static;
    /// Native descriptor table storage.
    type Table: Send + 'static;
    /// Native command allocator plus the command buffer recorded from it.
    type CommandAllocator: Send + 'static;

    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Create backing storage for a buffer.
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer>;

    /// Destroy backing storage. The GPU must no longer reference it.
    fn destroy_buffer(&self, buffer: Self::Buffer);

    /// CPU pointer to the start of a host-visible buffer.
    fn buffer_mapped_ptr(&self, buffer: &Self::Buffer) -> Option<NonNull<u8>>;

    /// GPU virtual address of the start of a buffer.
    fn buffer_gpu_address(&self, buffer: &Self::Buffer) -> u64;

    /// Create backing storage for a texture.
    fn create_texture(&self, desc: &TextureDesc) -> Result<Self::Texture>;

    /// Destroy a texture. The GPU must no longer reference it.
    fn destroy_texture(&self, texture: Self::Texture);

    /// Create a view of a texture subresource range.
    fn create_texture_view(
        &self,
        texture: &Self::Texture,
        desc: &TextureViewDesc,
    ) -> Result<Self::View>;

    /// Create a view of `size` bytes of `buffer` starting at `offset`.
    ///
    /// `offset` already includes the sub-allocation offset of the buffer.
    fn create_buffer_view(
        &self,
        buffer: &Self::Buffer,
        offset: u64,
        size: u64,
        desc: &BufferViewDesc,
    ) -> Result<Self::View>;

    /// Destroy a view.
    fn destroy_view(&self, view: Self::View);

    /// Create an empty descriptor table with `capacity` slots.
    fn create_descriptor_table(
        &self,
        class: DescriptorClass,
        capacity: u32,
    ) -> Result<Self::Table>;

    /// Write one slot of a table. `None` writes the null placeholder.
    fn write_descriptor(&self, table: &mut Self::Table, index: u32, view: Option<&Self::View>);

    /// Destroy a table. The GPU must no longer reference it.
    fn destroy_descriptor_table(&self, table: Self::Table);

    /// Last value the queue has finished executing up to.
    fn completed_value(&self, class: QueueClass) -> Result<u64>;

    /// Make the queue signal `value` once all prior work completes.
    fn signal(&self, class: QueueClass, value: u64) -> Result<()>;

    /// Block the calling thread until the queue reaches `value`.
    fn wait(&self, class: QueueClass, value: u64) -> Result<()>;

    /// Create a command allocator for a queue class.
    fn create_command_allocator(&self, class: QueueClass) -> Result<Self::CommandAllocator>;

    /// Reset the allocator and begin recording. Its previous work must be complete.
    fn begin_commands(&self, allocator: &mut Self::CommandAllocator) -> Result<()>;

    /// Record a buffer copy followed by whatever transition makes the
    /// destination readable by every queue.
    fn record_copy(&self, allocator: &mut Self::CommandAllocator, copy: &BufferCopy<'_, Self>);

    /// Finish recording and submit, waiting on `waits` first and signalling
    /// `signal_value` on `class` when done.
    fn submit(
        &self,
        class: QueueClass,
        allocator: &mut Self::CommandAllocator,
        waits: &[(QueueClass, u64)],
        signal_value: u64,
    ) -> Result<()>;

    /// Destroy a command allocator. Its work must be complete.
    fn destroy_command_allocator(&self, allocator: Self::CommandAllocator);
}
